//! Similarity index: one IVF structure per collection.
//!
//! The index is a derived projection of the record store and can always be
//! rebuilt from it. Rebuilds are copy-on-write: the new structure is trained
//! off to the side while searches keep reading the old one, `add`/`remove`
//! calls made meanwhile are applied to the live structure and recorded, then
//! replayed onto the new structure right before it is swapped in.

pub mod distance;
pub mod ivf;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RetrievalError, RetrievalResult};
use crate::models::{Collection, SearchHit};
pub use ivf::{IvfIndex, TrainParams};

/// A single index mutation
#[derive(Debug, Clone, PartialEq)]
pub enum IndexOp {
    Upsert { id: Uuid, embedding: Vec<f32> },
    Remove { id: Uuid },
}

impl IndexOp {
    pub fn id(&self) -> Uuid {
        match self {
            IndexOp::Upsert { id, .. } | IndexOp::Remove { id } => *id,
        }
    }

    fn apply(self, ivf: &mut IvfIndex) -> RetrievalResult<()> {
        match self {
            IndexOp::Upsert { id, embedding } => ivf.upsert(id, embedding),
            IndexOp::Remove { id } => {
                ivf.remove(&id);
                Ok(())
            }
        }
    }
}

/// Outcome of a successful rebuild
#[derive(Debug, Clone, PartialEq)]
pub struct BuildReport {
    pub collection: String,
    pub lists: usize,
    pub entries: usize,
    /// Operations that arrived during training and were replayed
    pub replayed: usize,
}

/// Point-in-time view of a collection index
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSnapshot {
    pub entries: usize,
    pub lists: usize,
    pub trained: bool,
    pub built_at: Option<DateTime<Utc>>,
    pub entries_at_build: usize,
}

struct IndexState {
    ivf: IvfIndex,
    replay: Option<Vec<IndexOp>>,
}

pub struct CollectionIndex {
    uid: Uuid,
    name: String,
    state: RwLock<IndexState>,
    build_lock: Mutex<()>,
    entries_at_build: AtomicUsize,
}

impl CollectionIndex {
    fn new(collection: &Collection) -> Self {
        Self {
            uid: collection.uid,
            name: collection.name.clone(),
            state: RwLock::new(IndexState {
                ivf: IvfIndex::flat(collection.distance, collection.dimension),
                replay: None,
            }),
            build_lock: Mutex::new(()),
            entries_at_build: AtomicUsize::new(0),
        }
    }

    pub fn uid(&self) -> Uuid {
        self.uid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a rebuild currently holds this collection
    pub fn is_building(&self) -> bool {
        self.build_lock.try_lock().is_err()
    }

    pub async fn snapshot(&self) -> IndexSnapshot {
        let state = self.state.read().await;
        IndexSnapshot {
            entries: state.ivf.len(),
            lists: state.ivf.list_count(),
            trained: state.ivf.is_trained(),
            built_at: state.ivf.built_at(),
            entries_at_build: self.entries_at_build.load(Ordering::Acquire),
        }
    }

    async fn apply(&self, op: IndexOp) -> RetrievalResult<()> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if let Some(log) = state.replay.as_mut() {
            log.push(op.clone());
        }
        op.apply(&mut state.ivf)
    }
}

/// Registry of per-collection indexes, keyed by collection incarnation.
///
/// Keying by `uid` lets a new incarnation be registered before it is
/// published while an older incarnation of the same name is still live.
pub struct SimilarityIndex {
    collections: RwLock<HashMap<Uuid, Arc<CollectionIndex>>>,
    train_defaults: TrainParams,
}

impl SimilarityIndex {
    pub fn new(train_defaults: TrainParams) -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            train_defaults,
        }
    }

    /// Create an empty (flat) index for a collection incarnation, or return
    /// the one already registered
    pub async fn register(&self, collection: &Collection) -> Arc<CollectionIndex> {
        let mut collections = self.collections.write().await;
        collections
            .entry(collection.uid)
            .or_insert_with(|| {
                debug!(collection = %collection.name, uid = %collection.uid, "Registered similarity index");
                Arc::new(CollectionIndex::new(collection))
            })
            .clone()
    }

    /// Register and bulk-load a collection's entries
    pub async fn load(
        &self,
        collection: &Collection,
        entries: Vec<(Uuid, Vec<f32>)>,
    ) -> RetrievalResult<()> {
        let index = self.register(collection).await;
        let mut state = index.state.write().await;
        for (id, embedding) in entries {
            state.ivf.upsert(id, embedding)?;
        }
        debug!(collection = %collection.name, entries = state.ivf.len(), "Loaded similarity index");
        Ok(())
    }

    /// Drop one incarnation's index
    pub async fn drop_collection(&self, uid: Uuid) -> bool {
        let Some(index) = self.collections.write().await.remove(&uid) else {
            return false;
        };
        debug!(collection = %index.name, uid = %uid, "Dropped similarity index");
        true
    }

    pub async fn get(&self, uid: Uuid) -> RetrievalResult<Arc<CollectionIndex>> {
        self.collections
            .read()
            .await
            .get(&uid)
            .cloned()
            .ok_or_else(|| RetrievalError::CollectionNotFound(uid.to_string()))
    }

    pub async fn add(&self, uid: Uuid, id: Uuid, embedding: Vec<f32>) -> RetrievalResult<()> {
        self.get(uid)
            .await?
            .apply(IndexOp::Upsert { id, embedding })
            .await
    }

    pub async fn remove(&self, uid: Uuid, id: Uuid) -> RetrievalResult<()> {
        self.get(uid).await?.apply(IndexOp::Remove { id }).await
    }

    /// Apply an event if its incarnation still has an index.
    ///
    /// Returns `false` when the event was discarded.
    pub async fn apply_for(&self, uid: Uuid, op: IndexOp) -> RetrievalResult<bool> {
        let Ok(index) = self.get(uid).await else {
            return Ok(false);
        };
        index.apply(op).await?;
        Ok(true)
    }

    pub async fn search(
        &self,
        uid: Uuid,
        query: &[f32],
        k: usize,
        probe_count: usize,
    ) -> RetrievalResult<Vec<SearchHit>> {
        let index = self.get(uid).await?;
        let state = index.state.read().await;
        state.ivf.search(query, k, probe_count)
    }

    /// Linear scan over every entry of the collection
    pub async fn exact_search(
        &self,
        uid: Uuid,
        query: &[f32],
        k: usize,
    ) -> RetrievalResult<Vec<SearchHit>> {
        let index = self.get(uid).await?;
        let state = index.state.read().await;
        state.ivf.exact_search(query, k)
    }

    /// Retrain the collection into `list_count` lists and swap the result in.
    ///
    /// At most one build per collection runs at a time; concurrent callers
    /// queue on the build lock. Searches are never blocked by training.
    pub async fn build(
        &self,
        uid: Uuid,
        list_count: usize,
        cancel: Option<watch::Receiver<bool>>,
    ) -> RetrievalResult<BuildReport> {
        if list_count == 0 {
            return Err(RetrievalError::InvalidArgument(
                "list_count must be positive".to_string(),
            ));
        }
        let index = self.get(uid).await?;
        let name = index.name.as_str();
        let _build = index.build_lock.lock().await;

        let (metric, dimension, entries) = {
            let mut state = index.state.write().await;
            state.replay = Some(Vec::new());
            (state.ivf.metric(), state.ivf.dimension(), state.ivf.snapshot())
        };

        let params = TrainParams {
            list_count,
            ..self.train_defaults
        };
        let started = std::time::Instant::now();
        let trained = tokio::task::spawn_blocking(move || {
            IvfIndex::train(metric, dimension, entries, params, || {
                cancel.as_ref().is_some_and(|rx| *rx.borrow())
            })
        })
        .await;

        let mut guard = index.state.write().await;
        let state = &mut *guard;
        let replay = state.replay.take().unwrap_or_default();

        let mut rebuilt = match trained {
            Ok(Ok(ivf)) => ivf,
            Ok(Err(err)) => {
                warn!(collection = %name, error = %err, "Index build failed, keeping previous structure");
                return Err(err);
            }
            Err(join) => return Err(join.into()),
        };

        let replayed = replay.len();
        for op in replay {
            op.apply(&mut rebuilt)?;
        }

        let report = BuildReport {
            collection: name.to_string(),
            lists: rebuilt.list_count(),
            entries: rebuilt.len(),
            replayed,
        };
        index
            .entries_at_build
            .store(rebuilt.len(), Ordering::Release);
        state.ivf = rebuilt;

        info!(
            collection = %name,
            lists = report.lists,
            entries = report.entries,
            replayed = report.replayed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Rebuilt similarity index"
        );
        Ok(report)
    }

    /// List count used for the last build, or `None` if never built
    pub async fn trained_list_count(&self, uid: Uuid) -> RetrievalResult<Option<usize>> {
        let snapshot = self.get(uid).await?.snapshot().await;
        Ok(snapshot.trained.then_some(snapshot.lists))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CreateCollection, DistanceMetric};

    fn collection(name: &str, dimension: usize) -> Collection {
        Collection::new(CreateCollection::new(name, dimension).with_distance(DistanceMetric::L2))
    }

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    async fn seeded(name: &str) -> (SimilarityIndex, Collection) {
        let index = SimilarityIndex::new(TrainParams::new(1));
        let c = collection(name, 2);
        index
            .load(
                &c,
                vec![
                    (id(1), vec![1.0, 0.0]),
                    (id(2), vec![1.2, 0.1]),
                    (id(3), vec![-1.0, 0.0]),
                    (id(4), vec![-1.2, -0.1]),
                ],
            )
            .await
            .unwrap();
        (index, c)
    }

    #[tokio::test]
    async fn test_unbuilt_index_searches_linearly() {
        let (index, docs) = seeded("docs").await;
        let hits = index.search(docs.uid, &[1.0, 0.0], 2, 1).await.unwrap();
        assert_eq!(hits.iter().map(|h| h.id).collect::<Vec<_>>(), vec![id(1), id(2)]);
        assert_eq!(index.trained_list_count(docs.uid).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_build_swaps_in_trained_structure() {
        let (index, docs) = seeded("docs").await;
        let report = index.build(docs.uid, 2, None).await.unwrap();
        assert_eq!(report.lists, 2);
        assert_eq!(report.entries, 4);
        assert_eq!(report.replayed, 0);
        assert_eq!(index.trained_list_count(docs.uid).await.unwrap(), Some(2));

        let exact = index.exact_search(docs.uid, &[0.5, 0.5], 4).await.unwrap();
        let probed = index.search(docs.uid, &[0.5, 0.5], 4, 2).await.unwrap();
        assert_eq!(exact, probed);
    }

    #[tokio::test]
    async fn test_build_rejects_zero_lists_and_unknown_collection() {
        let (index, docs) = seeded("docs").await;
        assert!(matches!(
            index.build(docs.uid, 0, None).await,
            Err(RetrievalError::InvalidArgument(_))
        ));
        assert!(matches!(
            index.build(Uuid::now_v7(), 2, None).await,
            Err(RetrievalError::CollectionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_build_keeps_previous_structure() {
        let (index, docs) = seeded("docs").await;
        let (tx, rx) = watch::channel(true);
        let result = index.build(docs.uid, 2, Some(rx)).await;
        drop(tx);

        assert!(matches!(result, Err(RetrievalError::Cancelled(_))));
        assert_eq!(index.trained_list_count(docs.uid).await.unwrap(), None);
        assert_eq!(index.get(docs.uid).await.unwrap().snapshot().await.entries, 4);

        // replay log was discarded, later writes still land
        index.add(docs.uid, id(5), vec![0.0, 1.0]).await.unwrap();
        assert_eq!(index.get(docs.uid).await.unwrap().snapshot().await.entries, 5);
    }

    #[tokio::test]
    async fn test_ops_recorded_during_build_are_replayed() {
        let (index, docs) = seeded("docs").await;
        let handle = index.get(docs.uid).await.unwrap();

        // simulate an in-flight rebuild: open the replay log, apply ops
        handle.state.write().await.replay = Some(Vec::new());
        handle
            .apply(IndexOp::Upsert {
                id: id(9),
                embedding: vec![5.0, 5.0],
            })
            .await
            .unwrap();
        handle.apply(IndexOp::Remove { id: id(1) }).await.unwrap();

        let replay = handle.state.write().await.replay.take().unwrap();
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].id(), id(9));
        assert_eq!(replay[1].id(), id(1));

        // live structure already reflects both ops
        let hits = index.exact_search(docs.uid, &[5.0, 5.0], 1).await.unwrap();
        assert_eq!(hits[0].id, id(9));
        let all = index.exact_search(docs.uid, &[0.0, 0.0], 10).await.unwrap();
        assert!(all.iter().all(|h| h.id != id(1)));
    }

    #[tokio::test]
    async fn test_concurrent_builds_are_serialised() {
        let (index, docs) = seeded("docs").await;
        let index = Arc::new(index);

        let uid = docs.uid;
        let a = tokio::spawn({
            let index = index.clone();
            async move { index.build(uid, 2, None).await }
        });
        let b = tokio::spawn({
            let index = index.clone();
            async move { index.build(uid, 1, None).await }
        });

        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(a.entries, 4);
        assert_eq!(b.entries, 4);
        assert!(!index.get(docs.uid).await.unwrap().is_building());
    }

    #[tokio::test]
    async fn test_incarnations_are_isolated() {
        let (index, old) = seeded("docs").await;
        let fresh = collection("docs", 2);
        index.register(&fresh).await;

        // a new incarnation does not replace the live one until it is dropped
        assert_eq!(index.get(old.uid).await.unwrap().snapshot().await.entries, 4);
        assert_eq!(index.get(fresh.uid).await.unwrap().snapshot().await.entries, 0);
        assert_eq!(index.register(&old).await.snapshot().await.entries, 4);

        assert!(index.drop_collection(old.uid).await);
        let applied = index
            .apply_for(old.uid, IndexOp::Upsert { id: id(7), embedding: vec![0.0, 0.0] })
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(index.get(fresh.uid).await.unwrap().snapshot().await.entries, 0);

        let applied = index
            .apply_for(fresh.uid, IndexOp::Upsert { id: id(7), embedding: vec![0.0, 0.0] })
            .await
            .unwrap();
        assert!(applied);
        assert_eq!(index.get(fresh.uid).await.unwrap().name(), "docs");
    }

    #[tokio::test]
    async fn test_drop_collection() {
        let (index, c) = seeded("docs").await;
        assert!(!index.drop_collection(Uuid::now_v7()).await);
        assert!(index.drop_collection(c.uid).await);
        assert!(!index.drop_collection(c.uid).await);
        assert!(matches!(
            index.search(c.uid, &[0.0, 0.0], 1, 1).await,
            Err(RetrievalError::CollectionNotFound(_))
        ));
    }
}
