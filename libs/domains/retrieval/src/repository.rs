use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{RetrievalError, RetrievalResult};
use crate::models::{Collection, Metadata, NewRecord, VectorRecord};

/// Repository trait for the collection registry and the record store
///
/// Both tables are the system of record; every implementation must make
/// existence, id and dimension checks atomic with the write they guard.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VectorRepository: Send + Sync {
    // ===== Collection Registry =====

    /// Publish a collection whose incarnation `uid` the caller assigned;
    /// fails if the name is taken
    async fn create_collection(&self, collection: Collection) -> RetrievalResult<Collection>;

    /// Get a collection by name
    async fn get_collection(&self, name: &str) -> RetrievalResult<Option<Collection>>;

    /// List all collections, sorted by name
    async fn list_collections(&self) -> RetrievalResult<Vec<Collection>>;

    /// Delete a collection, removing its records when `cascade` is set.
    /// Returns the deleted collection and the ids of the removed records.
    async fn delete_collection(
        &self,
        name: &str,
        cascade: bool,
    ) -> RetrievalResult<(Collection, Vec<Uuid>)>;

    /// Number of records in a collection
    async fn count_records(&self, name: &str) -> RetrievalResult<usize>;

    // ===== Record Store =====

    /// Insert one record
    async fn insert(&self, collection: &str, input: NewRecord) -> RetrievalResult<VectorRecord>;

    /// Insert several records; either all are stored or none
    async fn insert_batch(
        &self,
        collection: &str,
        inputs: Vec<NewRecord>,
    ) -> RetrievalResult<Vec<VectorRecord>>;

    /// Get a record by id
    async fn get(&self, id: Uuid) -> RetrievalResult<Option<VectorRecord>>;

    /// Get the records that still exist among `ids`, in the given order
    async fn get_many(&self, ids: Vec<Uuid>) -> RetrievalResult<Vec<VectorRecord>>;

    /// Replace the metadata mapping of a record
    async fn update_metadata(&self, id: Uuid, metadata: Metadata) -> RetrievalResult<VectorRecord>;

    /// Replace the embedding of a record
    async fn replace_embedding(
        &self,
        id: Uuid,
        embedding: Vec<f32>,
    ) -> RetrievalResult<VectorRecord>;

    /// Delete a record, returning it
    async fn delete(&self, id: Uuid) -> RetrievalResult<VectorRecord>;

    /// Page through a collection's records ordered by id
    async fn list_by_collection(
        &self,
        collection: &str,
        limit: usize,
        offset: usize,
    ) -> RetrievalResult<Vec<VectorRecord>>;
}

/// Check an embedding against its collection's dimension
pub fn validate_embedding(collection: &Collection, embedding: &[f32]) -> RetrievalResult<()> {
    if embedding.len() != collection.dimension {
        return Err(RetrievalError::dimension(
            collection.dimension,
            embedding.len(),
        ));
    }
    if embedding.iter().any(|x| !x.is_finite()) {
        return Err(RetrievalError::InvalidArgument(
            "Embedding contains non-finite values".to_string(),
        ));
    }
    Ok(())
}

fn validate_collection(input: &Collection) -> RetrievalResult<()> {
    if input.name.trim().is_empty() {
        return Err(RetrievalError::InvalidArgument(
            "Collection name must not be empty".to_string(),
        ));
    }
    if input.dimension == 0 {
        return Err(RetrievalError::InvalidArgument(
            "Collection dimension must be positive".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Tables {
    collections: BTreeMap<String, Collection>,
    records: HashMap<Uuid, VectorRecord>,
    by_collection: HashMap<String, BTreeSet<Uuid>>,
}

impl Tables {
    fn collection(&self, name: &str) -> RetrievalResult<&Collection> {
        self.collections
            .get(name)
            .ok_or_else(|| RetrievalError::CollectionNotFound(name.to_string()))
    }

    fn record_mut(&mut self, id: Uuid) -> RetrievalResult<&mut VectorRecord> {
        self.records
            .get_mut(&id)
            .ok_or(RetrievalError::RecordNotFound(id))
    }

    /// Validate a record against the tables without writing it
    fn check_new(&self, collection: &Collection, record: &VectorRecord) -> RetrievalResult<()> {
        validate_embedding(collection, &record.embedding)?;
        if self.records.contains_key(&record.id) {
            return Err(RetrievalError::AlreadyExists(format!("record {}", record.id)));
        }
        Ok(())
    }

    fn put(&mut self, record: VectorRecord) {
        self.by_collection
            .entry(record.collection.clone())
            .or_default()
            .insert(record.id);
        self.records.insert(record.id, record);
    }
}

/// In-memory implementation of VectorRepository
///
/// A single lock guards both tables, so every operation is serialisable.
#[derive(Debug, Default, Clone)]
pub struct InMemoryVectorRepository {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryVectorRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorRepository for InMemoryVectorRepository {
    async fn create_collection(&self, collection: Collection) -> RetrievalResult<Collection> {
        validate_collection(&collection)?;
        let mut tables = self.tables.write().await;

        if tables.collections.contains_key(&collection.name) {
            return Err(RetrievalError::AlreadyExists(format!(
                "collection {}",
                collection.name
            )));
        }

        tables
            .collections
            .insert(collection.name.clone(), collection.clone());
        tables
            .by_collection
            .insert(collection.name.clone(), BTreeSet::new());

        tracing::info!(
            collection = %collection.name,
            dimension = collection.dimension,
            distance = %collection.distance,
            "Created collection"
        );
        Ok(collection)
    }

    async fn get_collection(&self, name: &str) -> RetrievalResult<Option<Collection>> {
        let tables = self.tables.read().await;
        Ok(tables.collections.get(name).cloned())
    }

    async fn list_collections(&self) -> RetrievalResult<Vec<Collection>> {
        let tables = self.tables.read().await;
        Ok(tables.collections.values().cloned().collect())
    }

    async fn delete_collection(
        &self,
        name: &str,
        cascade: bool,
    ) -> RetrievalResult<(Collection, Vec<Uuid>)> {
        let mut tables = self.tables.write().await;
        tables.collection(name)?;

        let records = tables.by_collection.get(name).map_or(0, BTreeSet::len);
        if records > 0 && !cascade {
            return Err(RetrievalError::NotEmpty {
                name: name.to_string(),
                records,
            });
        }

        let ids: Vec<Uuid> = tables
            .by_collection
            .remove(name)
            .map(|ids| ids.into_iter().collect())
            .unwrap_or_default();
        for id in &ids {
            tables.records.remove(id);
        }
        let collection = tables
            .collections
            .remove(name)
            .ok_or_else(|| RetrievalError::CollectionNotFound(name.to_string()))?;

        tracing::info!(collection = %name, removed = ids.len(), "Deleted collection");
        Ok((collection, ids))
    }

    async fn count_records(&self, name: &str) -> RetrievalResult<usize> {
        let tables = self.tables.read().await;
        tables.collection(name)?;
        Ok(tables.by_collection.get(name).map_or(0, BTreeSet::len))
    }

    async fn insert(&self, collection: &str, input: NewRecord) -> RetrievalResult<VectorRecord> {
        let mut tables = self.tables.write().await;
        let target = tables.collection(collection)?;

        let record = VectorRecord::new(target, input);
        tables.check_new(target, &record)?;
        tables.put(record.clone());

        tracing::debug!(record_id = %record.id, collection = %collection, "Inserted record");
        Ok(record)
    }

    async fn insert_batch(
        &self,
        collection: &str,
        inputs: Vec<NewRecord>,
    ) -> RetrievalResult<Vec<VectorRecord>> {
        let mut tables = self.tables.write().await;
        let target = tables.collection(collection)?;

        let records: Vec<VectorRecord> = inputs
            .into_iter()
            .map(|input| VectorRecord::new(target, input))
            .collect();

        let mut seen = BTreeSet::new();
        for record in &records {
            tables.check_new(target, record)?;
            if !seen.insert(record.id) {
                return Err(RetrievalError::AlreadyExists(format!("record {}", record.id)));
            }
        }

        for record in &records {
            tables.put(record.clone());
        }

        tracing::debug!(collection = %collection, count = records.len(), "Inserted record batch");
        Ok(records)
    }

    async fn get(&self, id: Uuid) -> RetrievalResult<Option<VectorRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.records.get(&id).cloned())
    }

    async fn get_many(&self, ids: Vec<Uuid>) -> RetrievalResult<Vec<VectorRecord>> {
        let tables = self.tables.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| tables.records.get(id).cloned())
            .collect())
    }

    async fn update_metadata(&self, id: Uuid, metadata: Metadata) -> RetrievalResult<VectorRecord> {
        let mut tables = self.tables.write().await;
        let record = tables.record_mut(id)?;
        record.metadata = metadata;
        record.updated_at = Utc::now();

        tracing::debug!(record_id = %id, "Updated record metadata");
        Ok(record.clone())
    }

    async fn replace_embedding(
        &self,
        id: Uuid,
        embedding: Vec<f32>,
    ) -> RetrievalResult<VectorRecord> {
        let mut tables = self.tables.write().await;
        let collection_name = tables
            .records
            .get(&id)
            .ok_or(RetrievalError::RecordNotFound(id))?
            .collection
            .clone();
        validate_embedding(tables.collection(&collection_name)?, &embedding)?;

        let record = tables.record_mut(id)?;
        record.embedding = embedding;
        record.updated_at = Utc::now();

        tracing::debug!(record_id = %id, "Replaced record embedding");
        Ok(record.clone())
    }

    async fn delete(&self, id: Uuid) -> RetrievalResult<VectorRecord> {
        let mut tables = self.tables.write().await;
        let record = tables
            .records
            .remove(&id)
            .ok_or(RetrievalError::RecordNotFound(id))?;
        if let Some(ids) = tables.by_collection.get_mut(&record.collection) {
            ids.remove(&id);
        }

        tracing::debug!(record_id = %id, collection = %record.collection, "Deleted record");
        Ok(record)
    }

    async fn list_by_collection(
        &self,
        collection: &str,
        limit: usize,
        offset: usize,
    ) -> RetrievalResult<Vec<VectorRecord>> {
        let tables = self.tables.read().await;
        tables.collection(collection)?;

        let Some(ids) = tables.by_collection.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .skip(offset)
            .take(limit)
            .filter_map(|id| tables.records.get(id).cloned())
            .collect())
    }
}
