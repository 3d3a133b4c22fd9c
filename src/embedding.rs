//! Embedding client for an OpenAI-compatible `/embeddings` endpoint.
//!
//! Converts text to fixed-dimension float vectors. The broker talks to the
//! vendor through the [`Embedder`] trait so the indexer and retrieval engine
//! can be exercised with a stub. No retry happens here; callers decide.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::{BrokerError, BrokerResult};

pub const DEFAULT_BASE_URL: &str = "https://ark.cn-beijing.volces.com/api/v3";
pub const DEFAULT_MODEL_NAME: &str = "doubao-embedding-text-240715";
pub const DEFAULT_DIMENSION: usize = 1024;

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Bearer credential. Embedding fails with `ConfigMissing` without it.
    pub api_key: Option<String>,
    pub base_url: String,
    /// Identifier recorded alongside each vector.
    pub model_name: String,
    /// Declared output dimension; must equal the vector-index column width.
    pub dimension: usize,
}

impl EmbeddingConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("EMBEDDING_API_KEY").ok().filter(|k| !k.is_empty()),
            base_url: std::env::var("EMBEDDING_BASE_URL")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model_name: std::env::var("EMBEDDING_MODEL_NAME")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string()),
            dimension: std::env::var("EMBEDDING_VECTOR_DIMENSION")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_DIMENSION),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model_name: DEFAULT_MODEL_NAME.to_string(),
            dimension: DEFAULT_DIMENSION,
        }
    }
}

#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;

    fn dimension(&self) -> usize;

    /// Embed an ordered batch; the result has the same length and order.
    async fn embed(&self, texts: &[String]) -> BrokerResult<Vec<Vec<f32>>>;

    async fn embed_one(&self, text: &str) -> BrokerResult<Vec<f32>> {
        let vectors = self.embed(&[text.to_string()]).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| BrokerError::Upstream("embedding endpoint returned no vectors".into()))
    }
}

pub struct ArkEmbeddingClient {
    http: reqwest::Client,
    config: EmbeddingConfig,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

impl ArkEmbeddingClient {
    pub fn new(config: EmbeddingConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl Embedder for ArkEmbeddingClient {
    fn model_name(&self) -> &str {
        &self.config.model_name
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    async fn embed(&self, texts: &[String]) -> BrokerResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let api_key = self.config.api_key.as_deref().ok_or_else(|| {
            BrokerError::ConfigMissing("EMBEDDING_API_KEY is not set".to_string())
        })?;

        let url = format!("{}/embeddings", self.config.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.config.model_name,
            "input": texts,
            "encoding_format": "float",
        });

        let resp = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .timeout(std::time::Duration::from_secs(60))
            .send()
            .await
            .map_err(|e| BrokerError::Upstream(format!("embedding endpoint unreachable: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(BrokerError::Upstream(format!(
                "embedding endpoint returned {}: {}",
                status, text
            )));
        }

        let parsed: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| BrokerError::Upstream(format!("embedding response malformed: {}", e)))?;

        if parsed.data.len() != texts.len() {
            return Err(BrokerError::Upstream(format!(
                "embedding endpoint returned {} vectors for {} inputs",
                parsed.data.len(),
                texts.len()
            )));
        }

        let mut data = parsed.data;
        data.sort_by_key(|d| d.index);

        let mut vectors = Vec::with_capacity(data.len());
        for datum in data {
            if datum.embedding.len() != self.config.dimension {
                return Err(BrokerError::Shape {
                    expected: self.config.dimension,
                    got: datum.embedding.len(),
                });
            }
            vectors.push(datum.embedding);
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{extract::State, routing::post, Json, Router};
    use serial_test::serial;

    use super::*;

    #[derive(Clone)]
    struct MockEndpoint {
        dimension: usize,
        fail_status: Option<u16>,
    }

    async fn mock_embeddings(
        State(state): State<Arc<MockEndpoint>>,
        Json(body): Json<serde_json::Value>,
    ) -> axum::response::Response {
        use axum::response::IntoResponse;

        if let Some(status) = state.fail_status {
            return (
                axum::http::StatusCode::from_u16(status).unwrap(),
                "mock failure",
            )
                .into_response();
        }

        let inputs = body["input"].as_array().cloned().unwrap_or_default();
        let data: Vec<serde_json::Value> = inputs
            .iter()
            .enumerate()
            .map(|(i, text)| {
                // Deterministic vector derived from the text length.
                let seed = text.as_str().unwrap_or_default().len() as f32;
                let embedding: Vec<f32> =
                    (0..state.dimension).map(|j| seed + j as f32).collect();
                json!({"index": i, "embedding": embedding, "object": "embedding"})
            })
            .collect();
        Json(json!({"object": "list", "data": data})).into_response()
    }

    async fn spawn_mock(dimension: usize, fail_status: Option<u16>) -> String {
        let state = Arc::new(MockEndpoint {
            dimension,
            fail_status,
        });
        let app = Router::new()
            .route("/embeddings", post(mock_embeddings))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client(base_url: String, dimension: usize) -> ArkEmbeddingClient {
        ArkEmbeddingClient::new(EmbeddingConfig {
            api_key: Some("test-key".to_string()),
            base_url,
            model_name: "mock-model".to_string(),
            dimension,
        })
    }

    #[tokio::test]
    async fn test_embed_batch_preserves_order() {
        let base = spawn_mock(8, None).await;
        let client = client(base, 8);

        let texts = vec!["a".to_string(), "longer text".to_string()];
        let vectors = client.embed(&texts).await.unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].len(), 8);
        // first input has length 1, second length 11
        assert_eq!(vectors[0][0], 1.0);
        assert_eq!(vectors[1][0], 11.0);
    }

    #[tokio::test]
    async fn test_embed_one() {
        let base = spawn_mock(8, None).await;
        let client = client(base, 8);
        let vector = client.embed_one("hello").await.unwrap();
        assert_eq!(vector.len(), 8);
    }

    #[tokio::test]
    async fn test_missing_api_key_is_config_missing() {
        let base = spawn_mock(8, None).await;
        let client = ArkEmbeddingClient::new(EmbeddingConfig {
            api_key: None,
            base_url: base,
            model_name: "mock-model".to_string(),
            dimension: 8,
        });
        let err = client.embed(&["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, BrokerError::ConfigMissing(_)));
    }

    #[tokio::test]
    async fn test_upstream_failure_surfaces() {
        let base = spawn_mock(8, Some(500)).await;
        let client = client(base, 8);
        let err = client.embed(&["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, BrokerError::Upstream(_)));
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_shape_error() {
        let base = spawn_mock(8, None).await;
        // Client declares 16 but the endpoint produces 8.
        let client = client(base, 16);
        let err = client.embed(&["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, BrokerError::Shape { expected: 16, got: 8 }));
    }

    #[tokio::test]
    async fn test_empty_batch_short_circuits() {
        let client = client("http://127.0.0.1:1".to_string(), 8);
        assert!(client.embed(&[]).await.unwrap().is_empty());
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        std::env::set_var("EMBEDDING_API_KEY", "k");
        std::env::set_var("EMBEDDING_BASE_URL", "https://example.com/v1");
        std::env::set_var("EMBEDDING_MODEL_NAME", "custom");
        std::env::set_var("EMBEDDING_VECTOR_DIMENSION", "256");

        let config = EmbeddingConfig::from_env();
        assert!(config.is_configured());
        assert_eq!(config.base_url, "https://example.com/v1");
        assert_eq!(config.model_name, "custom");
        assert_eq!(config.dimension, 256);

        for var in [
            "EMBEDDING_API_KEY",
            "EMBEDDING_BASE_URL",
            "EMBEDDING_MODEL_NAME",
            "EMBEDDING_VECTOR_DIMENSION",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_config_defaults() {
        for var in [
            "EMBEDDING_API_KEY",
            "EMBEDDING_BASE_URL",
            "EMBEDDING_MODEL_NAME",
            "EMBEDDING_VECTOR_DIMENSION",
        ] {
            std::env::remove_var(var);
        }
        let config = EmbeddingConfig::from_env();
        assert!(!config.is_configured());
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.model_name, DEFAULT_MODEL_NAME);
        assert_eq!(config.dimension, DEFAULT_DIMENSION);
    }
}
