use async_trait::async_trait;
use core_config::{ConfigError, FromEnv, env_or_default, env_parse_optional, env_required};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::EmbeddingProvider;
use crate::error::{RetrievalError, RetrievalResult};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "text-embedding-3-small";

/// OpenAI embedding provider configuration
#[derive(Debug, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    /// Requested output length; only the text-embedding-3 family honours it
    pub dimensions: Option<usize>,
}

impl OpenAIConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            dimensions: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    /// Output length for the configured model, if known
    pub fn output_dimension(&self) -> Option<usize> {
        self.dimensions.or(match self.model.as_str() {
            "text-embedding-3-small" | "text-embedding-ada-002" => Some(1536),
            "text-embedding-3-large" => Some(3072),
            _ => None,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/embeddings", self.base_url.trim_end_matches('/'))
    }
}

impl FromEnv for OpenAIConfig {
    /// - `OPENAI_API_KEY`: required
    /// - `OPENAI_BASE_URL`: defaults to the public API
    /// - `OPENAI_EMBEDDING_MODEL`: defaults to `text-embedding-3-small`
    /// - `OPENAI_EMBEDDING_DIMENSIONS`: optional
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            api_key: env_required("OPENAI_API_KEY")?,
            base_url: env_or_default("OPENAI_BASE_URL", DEFAULT_BASE_URL),
            model: env_or_default("OPENAI_EMBEDDING_MODEL", DEFAULT_MODEL),
            dimensions: env_parse_optional("OPENAI_EMBEDDING_DIMENSIONS")?,
        })
    }
}

/// OpenAI embeddings provider
pub struct OpenAIProvider {
    client: Client,
    config: OpenAIConfig,
}

impl OpenAIProvider {
    pub fn new(config: OpenAIConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    pub fn from_env() -> RetrievalResult<Self> {
        Ok(Self::new(OpenAIConfig::from_env()?))
    }

    fn request<'a>(&'a self, texts: &'a [String]) -> EmbeddingRequest<'a> {
        EmbeddingRequest {
            model: &self.config.model,
            input: texts,
            dimensions: self.config.dimensions,
        }
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

impl EmbeddingResponse {
    /// Embeddings in request order; the API does not promise ordering
    fn into_ordered(self, expected: usize) -> RetrievalResult<Vec<Vec<f32>>> {
        if self.data.len() != expected {
            return Err(RetrievalError::Provider(format!(
                "OpenAI returned {} embeddings for {} inputs",
                self.data.len(),
                expected
            )));
        }
        let mut data = self.data;
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn dimension(&self) -> Option<usize> {
        self.config.output_dimension()
    }

    async fn embed(&self, text: &str) -> RetrievalResult<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RetrievalError::Provider("No embedding returned".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> RetrievalResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let response = self
            .client
            .post(self.config.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&self.request(texts))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(RetrievalError::Provider(format!(
                "OpenAI API error ({}): {}",
                status, error_text
            )));
        }

        let body: EmbeddingResponse = response.json().await?;
        tracing::debug!(
            model = %self.config.model,
            inputs = texts.len(),
            "Received embeddings"
        );
        body.into_ordered(texts.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_known_model_dimensions() {
        let config = OpenAIConfig::new("key");
        assert_eq!(config.output_dimension(), Some(1536));
        assert_eq!(
            config.clone().with_model("text-embedding-3-large").output_dimension(),
            Some(3072)
        );
        assert_eq!(
            config.clone().with_model("text-embedding-3-large").with_dimensions(256).output_dimension(),
            Some(256)
        );
        assert_eq!(config.with_model("in-house").output_dimension(), None);
    }

    #[test]
    fn test_endpoint_tolerates_trailing_slash() {
        let config = OpenAIConfig::new("key").with_base_url("http://localhost:8080/v1/");
        assert_eq!(config.endpoint(), "http://localhost:8080/v1/embeddings");
    }

    #[test]
    fn test_request_omits_unset_dimensions() {
        let provider = OpenAIProvider::new(OpenAIConfig::new("key"));
        let texts = vec!["hello".to_string()];
        let body = serde_json::to_value(provider.request(&texts)).unwrap();
        assert_eq!(body, json!({"model": "text-embedding-3-small", "input": ["hello"]}));
    }

    #[test]
    fn test_response_is_reordered_by_index() {
        let response: EmbeddingResponse = serde_json::from_value(json!({
            "data": [
                {"embedding": [0.0, 1.0], "index": 1},
                {"embedding": [1.0, 0.0], "index": 0}
            ],
            "usage": {"prompt_tokens": 4, "total_tokens": 4}
        }))
        .unwrap();

        let ordered = response.into_ordered(2).unwrap();
        assert_eq!(ordered, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_response_count_mismatch_is_provider_error() {
        let response: EmbeddingResponse =
            serde_json::from_value(json!({"data": [{"embedding": [1.0], "index": 0}]})).unwrap();
        assert!(matches!(
            response.into_ordered(2),
            Err(RetrievalError::Provider(_))
        ));
    }

    #[test]
    fn test_config_from_env() {
        temp_env::with_vars(
            [
                ("OPENAI_API_KEY", Some("sk-test")),
                ("OPENAI_BASE_URL", None),
                ("OPENAI_EMBEDDING_MODEL", Some("text-embedding-3-large")),
                ("OPENAI_EMBEDDING_DIMENSIONS", Some("1024")),
            ],
            || {
                let config = OpenAIConfig::from_env().unwrap();
                assert_eq!(config.api_key, "sk-test");
                assert_eq!(config.base_url, DEFAULT_BASE_URL);
                assert_eq!(config.model, "text-embedding-3-large");
                assert_eq!(config.dimensions, Some(1024));
            },
        );
    }

    #[test]
    fn test_config_requires_api_key() {
        temp_env::with_var_unset("OPENAI_API_KEY", || {
            assert!(matches!(
                OpenAIConfig::from_env(),
                Err(ConfigError::MissingEnvVar(_))
            ));
            assert!(matches!(
                OpenAIProvider::from_env(),
                Err(RetrievalError::Config(_))
            ));
        });
    }

    #[tokio::test]
    async fn test_empty_batch_skips_request() {
        let provider = OpenAIProvider::new(OpenAIConfig::new("key").with_base_url("http://127.0.0.1:9"));
        assert!(provider.embed_batch(&[]).await.unwrap().is_empty());
    }
}
