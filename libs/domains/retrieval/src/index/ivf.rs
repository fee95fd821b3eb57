//! Inverted-file (IVF-flat) index.
//!
//! Vectors are partitioned into lists around k-means centroids. A query scans
//! only the `probe_count` lists whose centroids are nearest to it, so recall
//! depends on `probe_count / list_count`; probing every list is an exact scan.
//! An untrained index is a single flat list.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng, rngs::StdRng};
use uuid::Uuid;

use super::distance::{distance, squared_l2};
use crate::error::{RetrievalError, RetrievalResult};
use crate::models::{DistanceMetric, SearchHit};

/// Parameters for a k-means training pass
#[derive(Debug, Clone, Copy)]
pub struct TrainParams {
    pub list_count: usize,
    pub max_iterations: usize,
    /// Vectors assigned between two cancellation checks
    pub batch_size: usize,
    pub seed: u64,
}

impl TrainParams {
    pub fn new(list_count: usize) -> Self {
        Self {
            list_count,
            max_iterations: 25,
            batch_size: 1024,
            seed: 0x5EED_1DF5,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    id: Uuid,
    embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct IvfIndex {
    metric: DistanceMetric,
    dimension: usize,
    centroids: Vec<Vec<f32>>,
    lists: Vec<Vec<Entry>>,
    positions: HashMap<Uuid, usize>,
    built_at: Option<DateTime<Utc>>,
}

impl IvfIndex {
    /// Untrained index: one flat list, exact search
    pub fn flat(metric: DistanceMetric, dimension: usize) -> Self {
        Self {
            metric,
            dimension,
            centroids: Vec::new(),
            lists: vec![Vec::new()],
            positions: HashMap::new(),
            built_at: None,
        }
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn list_count(&self) -> usize {
        self.lists.len()
    }

    pub fn is_trained(&self) -> bool {
        !self.centroids.is_empty()
    }

    pub fn built_at(&self) -> Option<DateTime<Utc>> {
        self.built_at
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.positions.contains_key(id)
    }

    /// Which list currently holds `id`
    pub fn list_of(&self, id: &Uuid) -> Option<usize> {
        self.positions.get(id).copied()
    }

    /// Insert or move a vector to its nearest list; never touches centroids
    pub fn upsert(&mut self, id: Uuid, embedding: Vec<f32>) -> RetrievalResult<()> {
        self.check_dimension(&embedding)?;
        self.remove(&id);

        let list = self.nearest_list(&embedding);
        self.lists[list].push(Entry { id, embedding });
        self.positions.insert(id, list);
        Ok(())
    }

    pub fn remove(&mut self, id: &Uuid) -> bool {
        let Some(list) = self.positions.remove(id) else {
            return false;
        };
        let entries = &mut self.lists[list];
        if let Some(pos) = entries.iter().position(|e| e.id == *id) {
            entries.swap_remove(pos);
        }
        true
    }

    /// Copy of every `(id, embedding)` pair, the input of a rebuild
    pub fn snapshot(&self) -> Vec<(Uuid, Vec<f32>)> {
        self.lists
            .iter()
            .flatten()
            .map(|e| (e.id, e.embedding.clone()))
            .collect()
    }

    /// Top-k over the `probe_count` lists nearest to `query`
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        probe_count: usize,
    ) -> RetrievalResult<Vec<SearchHit>> {
        self.check_dimension(query)?;
        if probe_count == 0 {
            return Err(RetrievalError::InvalidArgument(
                "probe_count must be positive".to_string(),
            ));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut top = TopK::new(k);
        for list in self.select_probes(query, probe_count) {
            for entry in &self.lists[list] {
                top.push(entry.id, distance(self.metric, query, &entry.embedding));
            }
        }
        Ok(top.into_sorted())
    }

    /// Reference linear scan over every vector
    pub fn exact_search(&self, query: &[f32], k: usize) -> RetrievalResult<Vec<SearchHit>> {
        self.search(query, k, self.lists.len())
    }

    /// Train a new index over `entries`.
    ///
    /// `is_cancelled` is polled between assignment batches; a cancelled build
    /// returns `Cancelled` and produces nothing.
    pub fn train(
        metric: DistanceMetric,
        dimension: usize,
        entries: Vec<(Uuid, Vec<f32>)>,
        params: TrainParams,
        is_cancelled: impl Fn() -> bool,
    ) -> RetrievalResult<Self> {
        if params.list_count == 0 {
            return Err(RetrievalError::InvalidArgument(
                "list_count must be positive".to_string(),
            ));
        }
        if let Some((_, bad)) = entries.iter().find(|(_, e)| e.len() != dimension) {
            return Err(RetrievalError::dimension(dimension, bad.len()));
        }

        let mut index = Self::flat(metric, dimension);
        index.built_at = Some(Utc::now());
        if entries.is_empty() {
            return Ok(index);
        }

        let vectors: Vec<&[f32]> = entries.iter().map(|(_, e)| e.as_slice()).collect();
        let k = params.list_count.min(vectors.len());
        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut centroids = seed_centroids(&vectors, k, &mut rng);
        let mut assignment = vec![usize::MAX; vectors.len()];
        let batch = params.batch_size.max(1);

        for iteration in 0..params.max_iterations.max(1) {
            let mut changed = 0usize;
            for (start, chunk) in vectors.chunks(batch).enumerate() {
                if is_cancelled() {
                    return Err(RetrievalError::Cancelled("index build".to_string()));
                }
                for (offset, v) in chunk.iter().enumerate() {
                    let slot = start * batch + offset;
                    let cluster = nearest(metric, &centroids, v);
                    if assignment[slot] != cluster {
                        assignment[slot] = cluster;
                        changed += 1;
                    }
                }
            }

            recompute_centroids(&mut centroids, &vectors, &assignment);

            tracing::trace!(iteration, changed, "k-means iteration");
            if changed == 0 {
                break;
            }
        }

        if centroids.iter().flatten().any(|x| !x.is_finite()) {
            return Err(RetrievalError::IndexBuild(
                "k-means produced non-finite centroids".to_string(),
            ));
        }

        index.centroids = centroids;
        index.lists = vec![Vec::new(); index.centroids.len()];
        // centroids moved after the last assignment pass, so assign afresh
        for (id, embedding) in entries {
            let list = nearest(metric, &index.centroids, &embedding);
            index.lists[list].push(Entry { id, embedding });
            index.positions.insert(id, list);
        }
        Ok(index)
    }

    fn nearest_list(&self, v: &[f32]) -> usize {
        if self.centroids.is_empty() {
            0
        } else {
            nearest(self.metric, &self.centroids, v)
        }
    }

    fn select_probes(&self, query: &[f32], probe_count: usize) -> Vec<usize> {
        if self.centroids.is_empty() || probe_count >= self.lists.len() {
            return (0..self.lists.len()).collect();
        }
        let mut scored: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(idx, c)| (idx, distance(self.metric, query, c)))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        scored
            .into_iter()
            .take(probe_count)
            .map(|(idx, _)| idx)
            .collect()
    }

    fn check_dimension(&self, v: &[f32]) -> RetrievalResult<()> {
        if v.len() != self.dimension {
            return Err(RetrievalError::dimension(self.dimension, v.len()));
        }
        Ok(())
    }
}

fn nearest(metric: DistanceMetric, centroids: &[Vec<f32>], v: &[f32]) -> usize {
    let mut best = 0usize;
    let mut best_distance = f32::INFINITY;
    for (idx, c) in centroids.iter().enumerate() {
        let d = distance(metric, v, c);
        if d < best_distance {
            best_distance = d;
            best = idx;
        }
    }
    best
}

/// k-means++ seeding, weighted by squared euclidean distance
fn seed_centroids(vectors: &[&[f32]], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);
    centroids.push(vectors[rng.gen_range(0..vectors.len())].to_vec());

    let mut weights: Vec<f32> = vectors
        .iter()
        .map(|v| squared_l2(v, &centroids[0]))
        .collect();

    while centroids.len() < k {
        let total: f32 = weights.iter().sum();
        if total <= f32::EPSILON {
            // fewer distinct points than lists
            break;
        }
        let mut target = rng.gen_range(0.0..total);
        let mut chosen = weights.len() - 1;
        for (idx, w) in weights.iter().enumerate() {
            target -= w;
            if target <= 0.0 && *w > 0.0 {
                chosen = idx;
                break;
            }
        }
        let centroid = vectors[chosen].to_vec();
        for (w, v) in weights.iter_mut().zip(vectors) {
            *w = w.min(squared_l2(v, &centroid));
        }
        centroids.push(centroid);
    }
    centroids
}

/// Mean of each cluster; an empty cluster keeps its previous centroid
fn recompute_centroids(centroids: &mut [Vec<f32>], vectors: &[&[f32]], assignment: &[usize]) {
    let dimension = centroids.first().map_or(0, Vec::len);
    let mut sums = vec![vec![0.0f32; dimension]; centroids.len()];
    let mut counts = vec![0usize; centroids.len()];

    for (v, &cluster) in vectors.iter().zip(assignment) {
        counts[cluster] += 1;
        for (dst, src) in sums[cluster].iter_mut().zip(v.iter()) {
            *dst += src;
        }
    }

    for ((centroid, sum), count) in centroids.iter_mut().zip(sums).zip(counts) {
        if count == 0 {
            continue;
        }
        let inv = 1.0 / count as f32;
        *centroid = sum.into_iter().map(|x| x * inv).collect();
    }
}

#[derive(Debug)]
struct Candidate {
    distance: f32,
    id: Uuid,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Bounded max-heap keeping the k closest candidates
struct TopK {
    k: usize,
    heap: BinaryHeap<Candidate>,
}

impl TopK {
    fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    fn push(&mut self, id: Uuid, distance: f32) {
        self.heap.push(Candidate { distance, id });
        if self.heap.len() > self.k {
            self.heap.pop();
        }
    }

    fn into_sorted(self) -> Vec<SearchHit> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|c| SearchHit {
                id: c.id,
                distance: c.distance,
            })
            .collect()
    }
}
