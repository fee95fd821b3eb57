use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RetrievalError;
use crate::filter::MetadataFilter;

/// Key-value metadata attached to collections and records
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Distance metric for similarity calculations
///
/// Every metric is expressed as a distance: numerically smaller means closer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    L2,
    DotProduct,
}

impl DistanceMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::L2 => "l2",
            DistanceMetric::DotProduct => "dot_product",
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistanceMetric {
    type Err = RetrievalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "l2" | "euclidean" => Ok(DistanceMetric::L2),
            "dot" | "dot_product" | "ip" | "inner_product" => Ok(DistanceMetric::DotProduct),
            other => Err(RetrievalError::InvalidArgument(format!(
                "Unsupported distance metric: {}",
                other
            ))),
        }
    }
}

/// Input for creating a collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCollection {
    pub name: String,
    pub dimension: usize,
    #[serde(default)]
    pub distance: DistanceMetric,
    #[serde(default)]
    pub metadata: Metadata,
}

impl CreateCollection {
    pub fn new(name: impl Into<String>, dimension: usize) -> Self {
        Self {
            name: name.into(),
            dimension,
            distance: DistanceMetric::default(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_distance(mut self, distance: DistanceMetric) -> Self {
        self.distance = distance;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A named, dimension-fixed namespace of vector records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    /// Incarnation id; a collection re-created under the same name gets a new one
    pub uid: Uuid,
    pub dimension: usize,
    pub distance: DistanceMetric,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl Collection {
    pub fn new(input: CreateCollection) -> Self {
        Self {
            name: input.name,
            uid: Uuid::now_v7(),
            dimension: input.dimension,
            distance: input.distance,
            metadata: input.metadata,
            created_at: Utc::now(),
        }
    }
}

/// Input for inserting a single record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRecord {
    pub id: Option<Uuid>,
    pub document: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub embedding: Vec<f32>,
}

impl NewRecord {
    pub fn new(document: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            id: None,
            document: document.into(),
            metadata: Metadata::new(),
            embedding,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A stored document chunk with its embedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: Uuid,
    pub collection: String,
    /// Incarnation of `collection` the record was written to
    pub collection_uid: Uuid,
    pub document: String,
    pub metadata: Metadata,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VectorRecord {
    pub fn new(collection: &Collection, input: NewRecord) -> Self {
        let now = Utc::now();
        Self {
            id: input.id.unwrap_or_else(Uuid::now_v7),
            collection: collection.name.clone(),
            collection_uid: collection.uid,
            document: input.document,
            metadata: input.metadata,
            embedding: input.embedding,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Collection-level counters exposed for operators and tests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub name: String,
    pub records: usize,
    pub indexed: usize,
    pub lists: usize,
    pub pending_updates: u64,
    pub last_built_at: Option<DateTime<Utc>>,
}

/// A raw index hit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: Uuid,
    pub distance: f32,
}

/// A hydrated, ranked query result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub record: VectorRecord,
    pub distance: f32,
}

/// How strictly a caller cares about read-after-write visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// Accept the eventual-consistency window silently
    #[default]
    BestEffort,
    /// Report an `IndexStale` warning when updates are still pending
    Strict,
}

/// Query parameters
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub collection: String,
    pub text: String,
    pub k: usize,
    pub filter: Option<MetadataFilter>,
    pub probe_count: Option<usize>,
    pub freshness: Freshness,
}

impl QueryRequest {
    pub fn new(collection: impl Into<String>, text: impl Into<String>, k: usize) -> Self {
        Self {
            collection: collection.into(),
            text: text.into(),
            k,
            filter: None,
            probe_count: None,
            freshness: Freshness::default(),
        }
    }

    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_probe_count(mut self, probe_count: usize) -> Self {
        self.probe_count = Some(probe_count);
        self
    }

    pub fn strict(mut self) -> Self {
        self.freshness = Freshness::Strict;
        self
    }
}

/// Per-query pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    Embedding,
    Searching,
    Hydrating,
    Filtering,
    Done,
    Failed,
}

impl QueryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryState::Done | QueryState::Failed)
    }
}

/// Query results plus the advisory staleness warning, if any
#[derive(Debug)]
pub struct QueryResponse {
    pub hits: Vec<ScoredRecord>,
    /// Only ever `RetrievalError::IndexStale`
    pub warning: Option<crate::error::RetrievalError>,
    pub state: QueryState,
}

impl QueryResponse {
    pub fn ids(&self) -> Vec<Uuid> {
        self.hits.iter().map(|h| h.record.id).collect()
    }
}
