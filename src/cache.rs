//! Lazy, exactly-once cache of per-cluster embedding indices.
//!
//! The map from cluster id to its (index, pending-query buffer) pair is the
//! only structure shared by every producer thread and the search worker.
//! The map-level RwLock guards structural changes only; each cluster slot
//! is guarded independently so a cold-cluster load never blocks lookups of
//! unrelated clusters.
//!
//! Population is exactly-once per cluster: racing first-touches collapse to
//! a single external fetch, and a failed load leaves nothing cached so a
//! later request retries.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::index::{
    ClusterId, EmbeddingIndex, IndexError, SearchBackend, VectorDimension, build_index,
};
use crate::pending::PendingQueryBuffer;

/// External capability that produces a cluster's raw embeddings.
///
/// Called at most once per cold cluster per population attempt; the
/// returned set is flattened row-major and immutable once indexed.
pub trait EmbeddingFetcher: Send + Sync {
    /// Fetches the flattened embedding set for one cluster.
    fn fetch_embeddings(&self, cluster: ClusterId) -> Result<Vec<f32>, FetchError>;
}

/// Errors reported by an [`EmbeddingFetcher`].
#[derive(Error, Debug)]
pub enum FetchError {
    #[error(
        "no embedding objects found for cluster {0}\nSuggestion: Verify the cluster's embeddings were published before routing queries to it"
    )]
    NoData(ClusterId),

    #[error("embedding store failure for cluster {cluster}: {reason}")]
    Backend { cluster: ClusterId, reason: String },
}

/// Errors from cache lookup and population.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("failed to load embeddings for cluster {cluster}: {source}")]
    Load {
        cluster: ClusterId,
        #[source]
        source: FetchError,
    },

    #[error("failed to build the search index for cluster {cluster}: {source}")]
    Index {
        cluster: ClusterId,
        #[source]
        source: IndexError,
    },

    #[error(
        "population of cluster {0} failed in a concurrent request\nSuggestion: Resubmit the request to retry the load"
    )]
    PopulationFailed(ClusterId),
}

/// One populated cluster: an immutable index plus its pending queries.
pub struct ClusterEntry {
    index: Box<dyn EmbeddingIndex>,
    pending: PendingQueryBuffer,
}

impl ClusterEntry {
    /// The cluster's nearest-neighbor index.
    #[must_use]
    pub fn index(&self) -> &dyn EmbeddingIndex {
        self.index.as_ref()
    }

    /// The cluster's pending-query buffer.
    #[must_use]
    pub fn pending(&self) -> &PendingQueryBuffer {
        &self.pending
    }
}

impl std::fmt::Debug for ClusterEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterEntry")
            .field("vectors", &self.index.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Population state of one cluster slot.
#[derive(Debug, Default)]
enum SlotState {
    #[default]
    Empty,
    Ready(Arc<ClusterEntry>),
    Failed,
}

/// Independently guarded lazily-initialized cell for one cluster.
///
/// The long external fetch runs under this slot's write lock only, never
/// under the map lock.
#[derive(Debug, Default)]
struct ClusterSlot {
    state: RwLock<SlotState>,
}

/// Mapping from cluster id to its (index, buffer) pair, created on first
/// reference and never evicted except after a failed load.
pub struct ClusterIndexCache {
    clusters: RwLock<HashMap<ClusterId, Arc<ClusterSlot>>>,
    fetcher: Arc<dyn EmbeddingFetcher>,
    dimension: VectorDimension,
    backend: SearchBackend,
    nprobe: usize,
}

impl ClusterIndexCache {
    /// Creates an empty cache over the given fetch capability.
    ///
    /// `backend` and `nprobe` are fixed for the process lifetime; every
    /// populated cluster uses the same index variant.
    pub fn new(
        dimension: VectorDimension,
        backend: SearchBackend,
        nprobe: usize,
        fetcher: Arc<dyn EmbeddingFetcher>,
    ) -> Self {
        Self {
            clusters: RwLock::new(HashMap::new()),
            fetcher,
            dimension,
            backend,
            nprobe,
        }
    }

    /// Returns the cluster's entry, populating it on first reference.
    ///
    /// Fast path: a shared map lock and a shared slot lock. Slow path
    /// (cold cluster): an empty slot is inserted under the map write lock
    /// with a mandatory existence re-check, then the external fetch runs
    /// under the slot's own write lock. Concurrent first-touches collapse
    /// to one fetch; the losers receive the winner's entry.
    ///
    /// On fetch or build failure the slot is evicted, the error returned,
    /// and the cluster stays eligible for retry on a later request.
    pub fn lookup_or_create(&self, cluster: ClusterId) -> Result<Arc<ClusterEntry>, CacheError> {
        let existing = self.clusters.read().get(&cluster).cloned();
        if let Some(slot) = existing {
            return self.enter_slot(cluster, &slot);
        }

        let slot = {
            let mut clusters = self.clusters.write();
            Arc::clone(clusters.entry(cluster).or_default())
        };
        self.enter_slot(cluster, &slot)
    }

    fn enter_slot(
        &self,
        cluster: ClusterId,
        slot: &Arc<ClusterSlot>,
    ) -> Result<Arc<ClusterEntry>, CacheError> {
        {
            let state = slot.state.read();
            match &*state {
                SlotState::Ready(entry) => return Ok(Arc::clone(entry)),
                SlotState::Failed => return Err(CacheError::PopulationFailed(cluster)),
                SlotState::Empty => {}
            }
        }

        let mut state = slot.state.write();
        // Re-check: another thread may have finished populating while this
        // one waited for the write lock.
        match &*state {
            SlotState::Ready(entry) => return Ok(Arc::clone(entry)),
            SlotState::Failed => return Err(CacheError::PopulationFailed(cluster)),
            SlotState::Empty => {}
        }

        match self.populate(cluster) {
            Ok(entry) => {
                *state = SlotState::Ready(Arc::clone(&entry));
                Ok(entry)
            }
            Err(e) => {
                *state = SlotState::Failed;
                warn!("dropping cache slot for cluster {cluster} after failed load: {e}");
                self.evict(cluster, slot);
                Err(e)
            }
        }
    }

    /// Fetches and indexes one cluster's embeddings.
    ///
    /// This is the deliberate synchronous cold-start cost: the triggering
    /// request pays it so every later request hits a warm index.
    fn populate(&self, cluster: ClusterId) -> Result<Arc<ClusterEntry>, CacheError> {
        debug!("loading embeddings for cold cluster {cluster}");

        let vectors = self
            .fetcher
            .fetch_embeddings(cluster)
            .map_err(|source| CacheError::Load { cluster, source })?;

        let index = build_index(self.backend, self.dimension, vectors, self.nprobe)
            .map_err(|source| CacheError::Index { cluster, source })?;

        debug!(
            "cluster {cluster} populated: {} vectors, {} backend",
            index.len(),
            self.backend
        );

        Ok(Arc::new(ClusterEntry {
            index,
            pending: PendingQueryBuffer::new(),
        }))
    }

    fn evict(&self, cluster: ClusterId, slot: &Arc<ClusterSlot>) {
        let mut clusters = self.clusters.write();
        if let Some(current) = clusters.get(&cluster)
            && Arc::ptr_eq(current, slot)
        {
            clusters.remove(&cluster);
        }
    }

    /// Snapshot of every populated cluster, in ascending cluster order.
    ///
    /// Never blocks on an in-flight population: a slot whose load is still
    /// running is simply not populated yet and is skipped.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(ClusterId, Arc<ClusterEntry>)> {
        let clusters = self.clusters.read();
        let mut entries: Vec<(ClusterId, Arc<ClusterEntry>)> = clusters
            .iter()
            .filter_map(|(id, slot)| {
                let state = slot.state.try_read()?;
                match &*state {
                    SlotState::Ready(entry) => Some((*id, Arc::clone(entry))),
                    _ => None,
                }
            })
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    /// True when the cluster has a fully populated entry.
    ///
    /// An in-flight population counts as not populated. The map guard is
    /// released before the slot is inspected; holding both in that order
    /// could deadlock against a failed population evicting its slot.
    #[must_use]
    pub fn is_populated(&self, cluster: ClusterId) -> bool {
        let slot = self.clusters.read().get(&cluster).cloned();
        slot.is_some_and(|slot| {
            slot.state
                .try_read()
                .map(|state| matches!(&*state, SlotState::Ready(_)))
                .unwrap_or(false)
        })
    }

    /// Number of populated clusters.
    #[must_use]
    pub fn populated_count(&self) -> usize {
        self.snapshot().len()
    }
}

impl std::fmt::Debug for ClusterIndexCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterIndexCache")
            .field("dimension", &self.dimension.get())
            .field("backend", &self.backend)
            .field("populated", &self.populated_count())
            .finish()
    }
}
