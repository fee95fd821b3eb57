//! Retrieval Domain Library
//!
//! Vector-embedding retrieval for retrieval-augmented answering: named,
//! dimension-fixed collections of document chunks, an IVF similarity index
//! derived from them, and an ingest/query pipeline that calls an external
//! embedding provider.
//!
//! # Architecture
//!
//! ```text
//!                ┌─────────────────────┐
//!                │  RetrievalPipeline  │  ← ingest, query, refresh, build_index
//!                └──┬───────┬───────┬──┘
//!                   │       │       │
//!    ┌──────────────▼──┐ ┌──▼─────┐ ┌▼──────────────────┐
//!    │VectorRepository │ │ Index  │ │ EmbeddingProvider │
//!    │    (trait)      │ │ Queue  │ │     (trait)       │
//!    └──────┬──────────┘ └──┬─────┘ └────────┬──────────┘
//!           │               │                │
//!    ┌──────▼──────────┐ ┌──▼──────────────┐ ┌▼──────────────────┐
//!    │ InMemoryVector  │ │ SimilarityIndex │ │  OpenAIProvider   │
//!    │  Repository     │ │ (IVF per coll.) │ │                   │
//!    └─────────────────┘ └─────────────────┘ └───────────────────┘
//! ```
//!
//! The repository is the system of record. Index updates are applied by a
//! background worker shortly after each write; `refresh` waits for them and
//! strict-freshness queries report an `IndexStale` warning while any are
//! pending.
//!
//! # Usage
//!
//! ```rust,no_run
//! use domain_retrieval::{
//!     CreateCollection, InMemoryVectorRepository, MetadataFilter, OpenAIProvider,
//!     QueryRequest, RetrievalConfig, RetrievalPipeline,
//! };
//! use core_config::FromEnv;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = Arc::new(OpenAIProvider::from_env()?);
//! let pipeline = RetrievalPipeline::open(
//!     InMemoryVectorRepository::new(),
//!     provider,
//!     RetrievalConfig::from_env()?,
//! )
//! .await?;
//!
//! pipeline
//!     .create_collection(CreateCollection::new("document_store", 1536))
//!     .await?;
//! pipeline
//!     .ingest_document("document_store", "Permit fees are due in May.", Default::default())
//!     .await?;
//! pipeline.refresh("document_store").await?;
//!
//! let filter = MetadataFilter::new().contains("department", "permits");
//! let response = pipeline
//!     .query(QueryRequest::new("document_store", "when are fees due?", 4).with_filter(filter))
//!     .await?;
//! for hit in response.hits {
//!     println!("{:.3} {}", hit.distance, hit.record.document);
//! }
//!
//! pipeline.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod chunking;
pub mod config;
pub mod embedding;
pub mod error;
pub mod filter;
pub mod index;
pub mod indexer;
pub mod models;
pub mod pipeline;
pub mod repository;
pub mod retry;

// Re-export commonly used types
pub use chunking::TextSplitter;
pub use config::{IndexConfig, PipelineConfig, RetrievalConfig};
pub use embedding::{EmbeddingProvider, OpenAIConfig, OpenAIProvider};
pub use error::{RetrievalError, RetrievalResult};
pub use filter::MetadataFilter;
pub use index::{BuildReport, IndexSnapshot, SimilarityIndex, TrainParams};
pub use models::{
    Collection, CollectionStats, CreateCollection, DistanceMetric, Freshness, Metadata, NewRecord,
    QueryRequest, QueryResponse, QueryState, ScoredRecord, SearchHit, VectorRecord,
};
pub use pipeline::RetrievalPipeline;
pub use repository::{InMemoryVectorRepository, VectorRepository};
pub use retry::RetryConfig;
