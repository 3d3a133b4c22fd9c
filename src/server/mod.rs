//! Broker façade: axum router exposing the REST admin surface, the health
//! probe, and the MCP streamable HTTP endpoint.

pub mod error;
pub mod handlers;
pub mod mcp_service;

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    config::BrokerConfig,
    embedding::{ArkEmbeddingClient, Embedder},
    error::BrokerResult,
    executor::Executor,
    index::CatalogIndexer,
    registry::{LiveCatalog, UpstreamRegistry},
    retrieval::RetrievalEngine,
    store::Store,
};
use mcp_service::BrokerMcpService;

/// Composition root. Constructed once at startup and shared by reference
/// with every handler.
pub struct AppContext {
    pub config: BrokerConfig,
    pub store: Arc<Store>,
    pub registry: Arc<UpstreamRegistry>,
    pub retrieval: Arc<RetrievalEngine>,
    pub executor: Arc<Executor>,
}

impl AppContext {
    /// Wire all services together. Does not touch the network; call
    /// [`UpstreamRegistry::bootstrap`] afterwards to connect upstreams.
    pub fn build(config: BrokerConfig) -> BrokerResult<Arc<Self>> {
        let store = Arc::new(Store::open(&config.db_path, config.embedding.dimension)?);
        let embedder: Arc<dyn Embedder> =
            Arc::new(ArkEmbeddingClient::new(config.embedding.clone()));
        Self::assemble(config, store, embedder)
    }

    fn assemble(
        config: BrokerConfig,
        store: Arc<Store>,
        embedder: Arc<dyn Embedder>,
    ) -> BrokerResult<Arc<Self>> {
        let indexer = Arc::new(CatalogIndexer::new(Arc::clone(&store), Arc::clone(&embedder)));
        let registry = Arc::new(UpstreamRegistry::new(
            Arc::clone(&store),
            indexer,
            config.embedding.is_configured(),
        ));
        let catalog: Arc<dyn LiveCatalog> = Arc::clone(&registry) as Arc<dyn LiveCatalog>;
        let retrieval = Arc::new(RetrievalEngine::new(
            Arc::clone(&store),
            embedder,
            Arc::clone(&catalog),
            config.top_k,
            config.threshold,
        ));
        let executor = Arc::new(Executor::new(catalog, config.executor_timeout));

        Ok(Arc::new(Self {
            config,
            store,
            registry,
            retrieval,
            executor,
        }))
    }
}

/// Shared bearer check for `/api` and `/mcp`; `/health` stays open.
async fn require_bearer(
    State(ctx): State<Arc<AppContext>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(token) = &ctx.config.auth_token {
        let expected = format!("Bearer {}", token);
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == expected)
            .unwrap_or(false);
        if !authorized {
            return (StatusCode::UNAUTHORIZED, "missing or invalid bearer token")
                .into_response();
        }
    }
    next.run(request).await
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    let api = Router::new()
        .route(
            "/mcp-servers",
            get(handlers::list_servers).post(handlers::create_server),
        )
        .route(
            "/mcp-servers/{id}",
            get(handlers::get_server)
                .put(handlers::update_server)
                .delete(handlers::delete_server),
        );

    let mcp =
        BrokerMcpService::new(Arc::clone(&ctx.retrieval), Arc::clone(&ctx.executor));

    let guarded = Router::new()
        .nest("/api", api)
        .nest_service("/mcp", mcp.streamable_http_service())
        .layer(middleware::from_fn_with_state(
            Arc::clone(&ctx),
            require_bearer,
        ));

    Router::new()
        .merge(guarded)
        .route("/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

pub async fn serve(ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let app = build_router(Arc::clone(&ctx));
    let listener = tokio::net::TcpListener::bind(ctx.config.bind_addr()).await?;
    info!("Broker listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down, disconnecting upstream clients");
    ctx.registry.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
