use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::{StreamExt, TryStreamExt, stream};
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chunking::TextSplitter;
use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{RetrievalError, RetrievalResult};
use crate::filter::MetadataFilter;
use crate::index::{BuildReport, IndexOp, SimilarityIndex};
use crate::indexer::IndexQueue;
use crate::models::{
    Collection, CollectionStats, CreateCollection, Freshness, Metadata, NewRecord, QueryRequest,
    QueryResponse, QueryState, ScoredRecord, SearchHit, VectorRecord,
};
use crate::repository::{VectorRepository, validate_embedding};
use crate::retry::retry_with_backoff;

/// Records read per page while loading the index at startup
const LOAD_PAGE_SIZE: usize = 1000;

/// Chunk embeddings in flight per `ingest_document` call
const EMBED_CONCURRENCY: usize = 4;

/// Retrieval pipeline: the single handle for registry, store, index and
/// query operations.
///
/// The repository is the system of record. The similarity index is derived
/// from it and kept up to date by a background worker, so a record becomes
/// searchable shortly after its write returns; `refresh` waits for that.
pub struct RetrievalPipeline<R: VectorRepository> {
    repository: R,
    provider: Arc<dyn EmbeddingProvider>,
    index: Arc<SimilarityIndex>,
    queue: IndexQueue,
    /// Held across a record write and its index event so events are queued
    /// in commit order
    writes: Mutex<()>,
    splitter: TextSplitter,
    config: RetrievalConfig,
}

impl<R: VectorRepository> RetrievalPipeline<R> {
    /// Load every collection from the repository, build the derived index
    /// and start the index worker
    pub async fn open(
        repository: R,
        provider: Arc<dyn EmbeddingProvider>,
        config: RetrievalConfig,
    ) -> RetrievalResult<Self> {
        config.validate()?;
        let splitter = TextSplitter::new(config.pipeline.chunk_size, config.pipeline.chunk_overlap)?;
        let index = Arc::new(SimilarityIndex::new(config.index.train_params()));

        let collections = repository.list_collections().await?;
        let mut loaded = 0;
        for collection in &collections {
            let mut entries = Vec::new();
            loop {
                let page = repository
                    .list_by_collection(&collection.name, LOAD_PAGE_SIZE, entries.len())
                    .await?;
                let done = page.len() < LOAD_PAGE_SIZE;
                entries.extend(page.into_iter().map(|r| (r.id, r.embedding)));
                if done {
                    break;
                }
            }
            loaded += entries.len();
            index.load(collection, entries).await?;
        }

        let queue = IndexQueue::start(
            index.clone(),
            config.pipeline.queue_capacity,
            config.index.auto_rebuild_growth,
        );

        info!(
            provider = provider.name(),
            collections = collections.len(),
            records = loaded,
            "Opened retrieval pipeline"
        );
        Ok(Self {
            repository,
            provider,
            index,
            queue,
            writes: Mutex::new(()),
            splitter,
            config,
        })
    }

    /// Apply pending index events and stop the worker. Record writes made
    /// after this fail without touching the store.
    pub async fn shutdown(&self) -> RetrievalResult<()> {
        let _writes = self.writes.lock().await;
        self.queue.shutdown().await?;
        info!("Retrieval pipeline shut down");
        Ok(())
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    // ===== Collection Registry =====

    /// Register the index first, so records written as soon as the
    /// collection is visible already have an index to land in
    pub async fn create_collection(&self, input: CreateCollection) -> RetrievalResult<Collection> {
        let pending = Collection::new(input);
        let uid = pending.uid;
        self.index.register(&pending).await;
        let collection = match self.repository.create_collection(pending).await {
            Ok(collection) => collection,
            Err(e) => {
                self.index.drop_collection(uid).await;
                return Err(e);
            }
        };
        if let Some(output) = self.provider.dimension() {
            if output != collection.dimension {
                warn!(
                    collection = %collection.name,
                    dimension = collection.dimension,
                    provider = self.provider.name(),
                    provider_dimension = output,
                    "Collection dimension differs from provider output, ingest will fail"
                );
            }
        }
        Ok(collection)
    }

    pub async fn get_collection(&self, name: &str) -> RetrievalResult<Collection> {
        self.repository
            .get_collection(name)
            .await?
            .ok_or_else(|| RetrievalError::CollectionNotFound(name.to_string()))
    }

    pub async fn list_collections(&self) -> RetrievalResult<Vec<Collection>> {
        self.repository.list_collections().await
    }

    /// Delete a collection and its index. Returns the number of records
    /// removed by the cascade.
    pub async fn delete_collection(&self, name: &str, cascade: bool) -> RetrievalResult<usize> {
        let (collection, removed) = self.repository.delete_collection(name, cascade).await?;
        self.index.drop_collection(collection.uid).await;
        Ok(removed.len())
    }

    // ===== Record Store =====

    /// Store a record with a caller-supplied embedding
    pub async fn insert(&self, collection: &str, input: NewRecord) -> RetrievalResult<Uuid> {
        let _writes = self.writes.lock().await;
        self.ensure_queue_open()?;
        let record = self.repository.insert(collection, input).await?;
        let op = IndexOp::Upsert {
            id: record.id,
            embedding: record.embedding.clone(),
        };
        if let Err(e) = self.enqueue(&record, op).await {
            self.roll_back(&[record.id]).await;
            return Err(e);
        }
        Ok(record.id)
    }

    /// Store several records atomically
    pub async fn insert_batch(
        &self,
        collection: &str,
        inputs: Vec<NewRecord>,
    ) -> RetrievalResult<Vec<Uuid>> {
        let _writes = self.writes.lock().await;
        self.ensure_queue_open()?;
        let records = self.repository.insert_batch(collection, inputs).await?;
        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        for record in &records {
            let op = IndexOp::Upsert {
                id: record.id,
                embedding: record.embedding.clone(),
            };
            if let Err(e) = self.enqueue(record, op).await {
                self.roll_back(&ids).await;
                return Err(e);
            }
        }
        Ok(ids)
    }

    pub async fn get(&self, id: Uuid) -> RetrievalResult<VectorRecord> {
        self.repository
            .get(id)
            .await?
            .ok_or(RetrievalError::RecordNotFound(id))
    }

    /// Replace a record's metadata; the index is unaffected
    pub async fn update_metadata(&self, id: Uuid, metadata: Metadata) -> RetrievalResult<VectorRecord> {
        self.repository.update_metadata(id, metadata).await
    }

    pub async fn replace_embedding(
        &self,
        id: Uuid,
        embedding: Vec<f32>,
    ) -> RetrievalResult<VectorRecord> {
        let _writes = self.writes.lock().await;
        self.ensure_queue_open()?;
        let previous = self.get(id).await?;
        let record = self.repository.replace_embedding(id, embedding).await?;
        let op = IndexOp::Upsert {
            id,
            embedding: record.embedding.clone(),
        };
        if let Err(e) = self.enqueue(&record, op).await {
            if let Err(restore) = self
                .repository
                .replace_embedding(id, previous.embedding)
                .await
            {
                warn!(record_id = %id, error = %restore, "Failed to restore record embedding");
            }
            return Err(e);
        }
        Ok(record)
    }

    pub async fn delete(&self, id: Uuid) -> RetrievalResult<()> {
        let _writes = self.writes.lock().await;
        self.ensure_queue_open()?;
        let record = self.repository.delete(id).await?;
        if let Err(e) = self.enqueue(&record, IndexOp::Remove { id }).await {
            let restored = NewRecord::new(record.document, record.embedding)
                .with_id(id)
                .with_metadata(record.metadata);
            if let Err(restore) = self.repository.insert(&record.collection, restored).await {
                warn!(record_id = %id, error = %restore, "Failed to restore deleted record");
            }
            return Err(e);
        }
        Ok(())
    }

    pub async fn list_by_collection(
        &self,
        collection: &str,
        limit: usize,
        offset: usize,
    ) -> RetrievalResult<Vec<VectorRecord>> {
        self.repository
            .list_by_collection(collection, limit, offset)
            .await
    }

    // ===== Similarity Index =====

    /// Retrain a collection's index into `list_count` lists
    pub async fn build_index(&self, collection: &str, list_count: usize) -> RetrievalResult<BuildReport> {
        let target = self.get_collection(collection).await?;
        self.index.build(target.uid, list_count, None).await
    }

    /// Retrain with the configured list count
    pub async fn build_index_default(&self, collection: &str) -> RetrievalResult<BuildReport> {
        self.build_index(collection, self.config.index.list_count)
            .await
    }

    /// Retrain, giving up between assignment batches once `cancel` reads true
    pub async fn build_index_with_cancel(
        &self,
        collection: &str,
        list_count: usize,
        cancel: watch::Receiver<bool>,
    ) -> RetrievalResult<BuildReport> {
        let target = self.get_collection(collection).await?;
        self.index.build(target.uid, list_count, Some(cancel)).await
    }

    /// Raw index search with a caller-supplied embedding
    pub async fn search(
        &self,
        collection: &str,
        query: &[f32],
        k: usize,
        probe_count: usize,
    ) -> RetrievalResult<Vec<SearchHit>> {
        let target = self.get_collection(collection).await?;
        self.index.search(target.uid, query, k, probe_count).await
    }

    /// Linear scan reference for `search`
    pub async fn exact_search(
        &self,
        collection: &str,
        query: &[f32],
        k: usize,
    ) -> RetrievalResult<Vec<SearchHit>> {
        let target = self.get_collection(collection).await?;
        self.index.exact_search(target.uid, query, k).await
    }

    /// Wait until every index event enqueued before this call is applied
    pub async fn refresh(&self, collection: &str) -> RetrievalResult<()> {
        self.get_collection(collection).await?;
        self.queue.flush().await?;
        debug!(collection = %collection, "Refreshed index");
        Ok(())
    }

    pub async fn stats(&self, collection: &str) -> RetrievalResult<CollectionStats> {
        let target = self.get_collection(collection).await?;
        let records = self.repository.count_records(collection).await?;
        let snapshot = self.index.get(target.uid).await?.snapshot().await;
        Ok(CollectionStats {
            name: collection.to_string(),
            records,
            indexed: snapshot.entries,
            lists: snapshot.lists,
            pending_updates: self.queue.pending(collection).await,
            last_built_at: snapshot.built_at,
        })
    }

    // ===== Ingestion =====

    /// Embed `document` and store it as one record
    pub async fn ingest(
        &self,
        collection: &str,
        document: &str,
        metadata: Metadata,
    ) -> RetrievalResult<Uuid> {
        let target = self.get_collection(collection).await?;
        let embedding = self.embed_text(document).await?;
        validate_embedding(&target, &embedding)?;

        let id = self
            .insert(
                collection,
                NewRecord::new(document, embedding).with_metadata(metadata),
            )
            .await?;
        debug!(collection = %collection, record_id = %id, "Ingested document");
        Ok(id)
    }

    /// Split `text` into overlapping chunks and store them as one batch.
    ///
    /// Each chunk's metadata is `metadata` plus `chunk_index`, `total_chunks`
    /// and an RFC 3339 `timestamp`. Nothing is stored unless every chunk
    /// embeds successfully.
    pub async fn ingest_document(
        &self,
        collection: &str,
        text: &str,
        metadata: Metadata,
    ) -> RetrievalResult<Vec<Uuid>> {
        let target = self.get_collection(collection).await?;
        let chunks = self.splitter.split(text);
        if chunks.is_empty() {
            return Err(RetrievalError::InvalidArgument(
                "Document has no content to ingest".to_string(),
            ));
        }

        let embeddings: Vec<Vec<f32>> = stream::iter(chunks.iter())
            .map(|chunk| self.embed_text(chunk))
            .buffered(EMBED_CONCURRENCY)
            .try_collect()
            .await?;

        let total = chunks.len();
        let timestamp = Utc::now().to_rfc3339();
        let mut records = Vec::with_capacity(total);
        for (chunk_index, (chunk, embedding)) in chunks.into_iter().zip(embeddings).enumerate() {
            validate_embedding(&target, &embedding)?;
            let mut chunk_metadata = metadata.clone();
            chunk_metadata.insert("chunk_index".to_string(), Value::from(chunk_index));
            chunk_metadata.insert("total_chunks".to_string(), Value::from(total));
            chunk_metadata.insert("timestamp".to_string(), Value::from(timestamp.clone()));
            records.push(NewRecord::new(chunk, embedding).with_metadata(chunk_metadata));
        }

        let ids = self.insert_batch(collection, records).await?;
        info!(collection = %collection, chunks = ids.len(), "Ingested document");
        Ok(ids)
    }

    // ===== Query =====

    /// Embed the query text and return up to `k` matching records
    #[tracing::instrument(skip(self, request), fields(collection = %request.collection, k = request.k))]
    pub async fn query(&self, request: QueryRequest) -> RetrievalResult<QueryResponse> {
        let mut run = QueryRun::new(QueryState::Embedding);
        let result = self.run_query(&mut run, request).await;
        if let Err(e) = &result {
            run.fail(e);
        }
        result
    }

    /// Query with a caller-supplied embedding, skipping the provider
    pub async fn search_by_vector(
        &self,
        collection: &str,
        embedding: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
        probe_count: Option<usize>,
    ) -> RetrievalResult<Vec<ScoredRecord>> {
        let mut run = QueryRun::new(QueryState::Searching);
        let target = self.get_collection(collection).await?;
        validate_embedding(&target, embedding)?;
        let result = self
            .search_and_hydrate(&mut run, &target, embedding, k, filter, probe_count)
            .await;
        match result {
            Ok(hits) => {
                run.advance(QueryState::Done);
                Ok(hits)
            }
            Err(e) => {
                run.fail(&e);
                Err(e)
            }
        }
    }

    async fn run_query(
        &self,
        run: &mut QueryRun,
        request: QueryRequest,
    ) -> RetrievalResult<QueryResponse> {
        let target = self.get_collection(&request.collection).await?;
        let embedding = self.embed_text(&request.text).await?;
        validate_embedding(&target, &embedding)?;

        let warning = match request.freshness {
            Freshness::Strict => match self.queue.pending(&target.name).await {
                0 => None,
                pending => Some(RetrievalError::IndexStale {
                    collection: target.name.clone(),
                    pending,
                }),
            },
            Freshness::BestEffort => None,
        };

        run.advance(QueryState::Searching);
        let hits = self
            .search_and_hydrate(
                run,
                &target,
                &embedding,
                request.k,
                request.filter.as_ref(),
                request.probe_count,
            )
            .await?;
        run.advance(QueryState::Done);

        if let Some(warning) = &warning {
            debug!(warning = %warning, "Query served from a stale index");
        }
        Ok(QueryResponse {
            hits,
            warning,
            state: run.state,
        })
    }

    async fn search_and_hydrate(
        &self,
        run: &mut QueryRun,
        target: &Collection,
        embedding: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
        probe_count: Option<usize>,
    ) -> RetrievalResult<Vec<ScoredRecord>> {
        if k == 0 {
            return Err(RetrievalError::InvalidArgument(
                "k must be positive".to_string(),
            ));
        }
        let probe_count = probe_count.unwrap_or(self.config.index.probe_count);
        let candidates = k.saturating_mul(self.config.pipeline.overfetch_factor);
        let hits = self
            .index
            .search(target.uid, embedding, candidates, probe_count)
            .await?;

        run.advance(QueryState::Hydrating);
        let distances: HashMap<Uuid, f32> = hits.iter().map(|h| (h.id, h.distance)).collect();
        let records = self
            .repository
            .get_many(hits.iter().map(|h| h.id).collect())
            .await?;
        let hydrated = records.len();

        run.advance(QueryState::Filtering);
        let scored: Vec<ScoredRecord> = records
            .into_iter()
            // an id removed from this collection may already live elsewhere
            .filter(|record| record.collection_uid == target.uid)
            .filter(|record| filter.is_none_or(|f| f.matches(&record.metadata)))
            .filter_map(|record| {
                distances.get(&record.id).map(|&distance| ScoredRecord { record, distance })
            })
            .take(k)
            .collect();

        debug!(
            candidates = hits.len(),
            hydrated,
            returned = scored.len(),
            "Query results filtered"
        );
        Ok(scored)
    }

    // ===== Internals =====

    /// Embed with bounded retries, the whole attempt sequence under one timeout
    async fn embed_text(&self, text: &str) -> RetrievalResult<Vec<f32>> {
        let pipeline = &self.config.pipeline;
        let attempt = retry_with_backoff(
            || self.provider.embed(text),
            &pipeline.retry,
            RetrievalError::is_retryable,
        );

        match tokio::time::timeout(Duration::from_millis(pipeline.embed_timeout_ms), attempt).await {
            Ok(Ok(embedding)) => Ok(embedding),
            Ok(Err(failure)) => {
                warn!(
                    provider = self.provider.name(),
                    attempts = failure.attempts,
                    error = %failure.error,
                    "Embedding failed"
                );
                Err(RetrievalError::EmbeddingFailed {
                    attempts: failure.attempts,
                    reason: failure.error.to_string(),
                })
            }
            Err(_) => {
                warn!(
                    provider = self.provider.name(),
                    timeout_ms = pipeline.embed_timeout_ms,
                    "Embedding timed out"
                );
                Err(RetrievalError::EmbeddingTimeout(pipeline.embed_timeout_ms))
            }
        }
    }

    /// Queue an index event for the incarnation the record was written to
    async fn enqueue(&self, record: &VectorRecord, op: IndexOp) -> RetrievalResult<()> {
        self.queue
            .enqueue(&record.collection, record.collection_uid, op)
            .await
    }

    fn ensure_queue_open(&self) -> RetrievalResult<()> {
        if self.queue.is_closed() {
            return Err(RetrievalError::Internal("Index queue is closed".to_string()));
        }
        Ok(())
    }

    async fn roll_back(&self, ids: &[Uuid]) {
        for id in ids {
            if let Err(e) = self.repository.delete(*id).await {
                warn!(record_id = %id, error = %e, "Failed to roll back record write");
            }
        }
        warn!(records = ids.len(), "Rolled back record write after index queue failure");
    }
}

/// Tracks one query through its states
struct QueryRun {
    state: QueryState,
    started: Instant,
}

impl QueryRun {
    fn new(state: QueryState) -> Self {
        debug!(state = ?state, "Query started");
        Self {
            state,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: QueryState) {
        debug!(
            from = ?self.state,
            to = ?next,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Query state transition"
        );
        self.state = next;
    }

    fn fail(&mut self, error: &RetrievalError) {
        if self.state.is_terminal() {
            return;
        }
        debug!(from = ?self.state, error = %error, "Query failed");
        self.state = QueryState::Failed;
    }
}
