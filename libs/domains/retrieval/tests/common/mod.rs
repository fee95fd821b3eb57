//! Shared fixtures for retrieval integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use domain_retrieval::*;

/// Embedder returning fixed vectors for known texts
pub struct StaticEmbedder {
    dimension: usize,
    vectors: HashMap<String, Vec<f32>>,
}

impl StaticEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: HashMap::new(),
        }
    }

    pub fn with(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.to_string(), vector);
        self
    }
}

#[async_trait]
impl EmbeddingProvider for StaticEmbedder {
    fn name(&self) -> &'static str {
        "static"
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dimension)
    }

    async fn embed(&self, text: &str) -> RetrievalResult<Vec<f32>> {
        self.vectors
            .get(text)
            .cloned()
            .ok_or_else(|| RetrievalError::InvalidArgument(format!("no vector for {:?}", text)))
    }
}

/// Defaults tuned for fast tests: no retry back-off, small default list count
pub fn test_config() -> RetrievalConfig {
    let mut config = RetrievalConfig::default();
    config.index.list_count = 4;
    config.pipeline.retry = RetryConfig::default()
        .with_max_retries(0)
        .with_initial_delay(1);
    config
}

pub async fn open_pipeline(
    embedder: StaticEmbedder,
) -> RetrievalPipeline<InMemoryVectorRepository> {
    test_utils::init_test_tracing();
    RetrievalPipeline::open(
        InMemoryVectorRepository::new(),
        Arc::new(embedder),
        test_config(),
    )
    .await
    .unwrap()
}
