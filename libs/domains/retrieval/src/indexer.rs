//! Asynchronous index maintenance.
//!
//! Store writes enqueue `IndexEvent`s on a bounded channel; a single worker
//! task applies them to the similarity index in FIFO order. Per-collection
//! pending counters expose the consistency window, and a flush barrier lets
//! callers wait until everything enqueued before it has been applied.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RetrievalError, RetrievalResult};
use crate::index::{BuildReport, IndexOp, SimilarityIndex};

#[derive(Debug)]
enum IndexEvent {
    Apply {
        collection: String,
        uid: Uuid,
        op: IndexOp,
    },
    Flush {
        ack: oneshot::Sender<()>,
    },
}

/// Outstanding index events per collection
#[derive(Debug, Default)]
struct PendingCounts {
    counts: Mutex<HashMap<String, u64>>,
}

impl PendingCounts {
    async fn increment(&self, collection: &str) {
        *self
            .counts
            .lock()
            .await
            .entry(collection.to_string())
            .or_default() += 1;
    }

    async fn decrement(&self, collection: &str) {
        let mut counts = self.counts.lock().await;
        if let Some(count) = counts.get_mut(collection) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(collection);
            }
        }
    }

    async fn get(&self, collection: &str) -> u64 {
        self.counts
            .lock()
            .await
            .get(collection)
            .copied()
            .unwrap_or(0)
    }
}

/// Handle to the index worker
pub struct IndexQueue {
    sender: mpsc::Sender<IndexEvent>,
    pending: Arc<PendingCounts>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IndexQueue {
    /// Spawn the worker on the current runtime
    pub fn start(
        index: Arc<SimilarityIndex>,
        capacity: usize,
        auto_rebuild_growth: Option<f64>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let pending = Arc::new(PendingCounts::default());

        let worker = IndexWorker {
            index,
            pending: pending.clone(),
            auto_rebuild_growth,
            rebuilds: HashMap::new(),
        };
        let handle = tokio::spawn(worker.run(receiver, shutdown_rx));

        info!(capacity, auto_rebuild_growth = ?auto_rebuild_growth, "Started index worker");
        Self {
            sender,
            pending,
            shutdown,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Queue an index mutation, waiting for room when the queue is full
    pub async fn enqueue(&self, collection: &str, uid: Uuid, op: IndexOp) -> RetrievalResult<()> {
        self.pending.increment(collection).await;
        let event = IndexEvent::Apply {
            collection: collection.to_string(),
            uid,
            op,
        };
        if self.sender.send(event).await.is_err() {
            self.pending.decrement(collection).await;
            return Err(RetrievalError::Internal(
                "Index queue is closed".to_string(),
            ));
        }
        Ok(())
    }

    /// Wait until every event enqueued before this call has been applied
    pub async fn flush(&self) -> RetrievalResult<()> {
        let (ack, done) = oneshot::channel();
        self.sender
            .send(IndexEvent::Flush { ack })
            .await
            .map_err(|_| RetrievalError::Internal("Index queue is closed".to_string()))?;
        done.await
            .map_err(|_| RetrievalError::Internal("Index worker stopped before flush".to_string()))
    }

    /// Whether the worker has stopped taking events
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Events enqueued for `collection` but not yet applied
    pub async fn pending(&self, collection: &str) -> u64 {
        self.pending.get(collection).await
    }

    /// Stop accepting events, apply what is queued and join the worker
    pub async fn shutdown(&self) -> RetrievalResult<()> {
        let Some(handle) = self.worker.lock().await.take() else {
            return Ok(());
        };
        let _ = self.shutdown.send(true);
        handle.await?;
        Ok(())
    }
}

struct IndexWorker {
    index: Arc<SimilarityIndex>,
    pending: Arc<PendingCounts>,
    auto_rebuild_growth: Option<f64>,
    rebuilds: HashMap<Uuid, JoinHandle<RetrievalResult<BuildReport>>>,
}

impl IndexWorker {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<IndexEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        events.close();
                        while let Some(event) = events.recv().await {
                            self.handle(event).await;
                        }
                        break;
                    }
                }
            }
        }

        for (uid, handle) in self.rebuilds.drain() {
            if let Err(e) = handle.await {
                warn!(uid = %uid, error = %e, "Background rebuild task failed");
            }
        }
        info!("Index worker stopped");
    }

    async fn handle(&mut self, event: IndexEvent) {
        match event {
            IndexEvent::Apply {
                collection,
                uid,
                op,
            } => {
                let id = op.id();
                match self.index.apply_for(uid, op).await {
                    Ok(true) => debug!(collection = %collection, record_id = %id, "Applied index event"),
                    Ok(false) => debug!(
                        collection = %collection,
                        record_id = %id,
                        "Discarded index event for dropped collection"
                    ),
                    Err(e) => warn!(
                        collection = %collection,
                        record_id = %id,
                        error = %e,
                        "Failed to apply index event"
                    ),
                }
                self.pending.decrement(&collection).await;
                self.maybe_rebuild(uid).await;
            }
            IndexEvent::Flush { ack } => {
                let _ = ack.send(());
            }
        }
    }

    /// Start a background rebuild once the collection has outgrown its last
    /// build by the configured factor
    async fn maybe_rebuild(&mut self, uid: Uuid) {
        let Some(growth) = self.auto_rebuild_growth else {
            return;
        };
        if self
            .rebuilds
            .get(&uid)
            .is_some_and(|handle| !handle.is_finished())
        {
            return;
        }
        let Ok(handle) = self.index.get(uid).await else {
            return;
        };
        let snapshot = handle.snapshot().await;
        if !snapshot.trained || handle.is_building() {
            return;
        }
        if (snapshot.entries as f64) < growth * snapshot.entries_at_build as f64 {
            return;
        }

        info!(
            collection = %handle.name(),
            entries = snapshot.entries,
            entries_at_build = snapshot.entries_at_build,
            "Collection outgrew its index, rebuilding"
        );
        let index = self.index.clone();
        let name = handle.name().to_string();
        let lists = snapshot.lists;
        let task = tokio::spawn(async move {
            let result = index.build(uid, lists, None).await;
            if let Err(e) = &result {
                warn!(collection = %name, error = %e, "Background rebuild failed");
            }
            result
        });
        if let Some(previous) = self.rebuilds.insert(uid, task) {
            let _ = previous.await;
        }
    }
}
