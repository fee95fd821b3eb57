use async_trait::async_trait;

use crate::error::RetrievalResult;

/// Trait for embedding generation providers
///
/// A provider turns text into a fixed-length vector. Transport and API
/// failures are reported as `RetrievalError::Provider` so the pipeline can
/// retry them; providers never retry on their own.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Output length, when the provider knows it up front
    fn dimension(&self) -> Option<usize>;

    /// Generate the embedding for a single text
    async fn embed(&self, text: &str) -> RetrievalResult<Vec<f32>>;

    /// Generate embeddings for several texts, in input order
    async fn embed_batch(&self, texts: &[String]) -> RetrievalResult<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            embeddings.push(self.embed(text).await?);
        }
        Ok(embeddings)
    }
}
