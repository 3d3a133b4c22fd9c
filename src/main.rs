use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dext::config::{BrokerConfig, Cli};
use dext::server::{self, AppContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = BrokerConfig::from_cli(cli);
    info!(
        "Starting dext broker (db: {}, embedding model: {})",
        config.db_path.display(),
        config.embedding.model_name
    );
    if !config.embedding.is_configured() {
        warn!("EMBEDDING_API_KEY is not set; catalog indexing and retrieval are unavailable");
    }

    let ctx = AppContext::build(config)?;
    ctx.registry.bootstrap().await?;
    server::serve(ctx).await
}
