//! Background search worker and its lifecycle.
//!
//! Exactly one worker thread exists per process. It suspends on the
//! [`WorkSignal`](crate::pending::WorkSignal) while idle, and on every wake
//! sweeps the populated clusters: drain a cluster's pending queries, run one
//! batched search over them, and emit each query's ranked neighbors
//! downstream. A failure to deliver one result never aborts the rest of the
//! batch, other clusters, or the loop.
//!
//! Shutdown is cooperative: the worker observes a flag raised through the
//! same signal, finishes the cluster batch it is on, and exits. Items
//! appended after the shutdown signal are not guaranteed to be delivered.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{ClusterEntry, ClusterIndexCache};
use crate::error::TeardownError;
use crate::index::{ClusterId, Neighbor};
use crate::pending::{QueryItem, RequestOrigin, WorkSignal};

/// External capability that delivers one query's ranked neighbors
/// downstream, tagged with the query's correlation metadata.
pub trait ResultSink: Send + Sync {
    /// Emits one ranked result. Called once per searched query.
    fn emit(
        &self,
        origin: &RequestOrigin,
        text: &str,
        neighbors: &[Neighbor],
    ) -> Result<(), EmitError>;
}

/// Errors reported by a [`ResultSink`].
#[derive(Error, Debug)]
pub enum EmitError {
    #[error("result delivery failed: {0}")]
    Delivery(String),
}

/// Observable lifecycle state of the process-wide search worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No request has arrived yet; the worker thread does not exist.
    NotStarted,
    /// The worker is waiting for or processing queries.
    Running,
    /// Shutdown was requested but the thread has not been joined yet.
    ShuttingDown,
    /// The thread has exited and been joined.
    Stopped,
}

/// Handle to the single background worker thread.
///
/// Dropping the handle without calling [`WorkerHandle::join`] detaches the
/// thread; the owning service always joins on teardown.
pub struct WorkerHandle {
    thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    signal: Arc<WorkSignal>,
}

impl WorkerHandle {
    /// Spawns the worker thread over a shared cache reference.
    ///
    /// `top_k` and `max_queries_per_batch` are process-wide configuration,
    /// fixed for the worker's lifetime.
    pub fn spawn(
        cache: Arc<ClusterIndexCache>,
        sink: Arc<dyn ResultSink>,
        signal: Arc<WorkSignal>,
        top_k: usize,
        max_queries_per_batch: usize,
    ) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread = {
            let signal = Arc::clone(&signal);
            let shutdown = Arc::clone(&shutdown);
            std::thread::Builder::new()
                .name("cluster-search-worker".to_string())
                .spawn(move || {
                    run_worker(&cache, &*sink, &signal, &shutdown, top_k, max_queries_per_batch);
                })?
        };

        Ok(Self {
            thread: Some(thread),
            shutdown,
            signal,
        })
    }

    /// Requests cooperative shutdown without waiting for the thread.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.signal.raise();
    }

    /// True once shutdown has been requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Requests shutdown and waits for the worker thread to exit.
    ///
    /// A join failure means the worker panicked; that is the only error
    /// teardown reports.
    pub fn join(mut self) -> Result<(), TeardownError> {
        self.request_shutdown();
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| TeardownError::JoinFailed),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

/// The worker loop: wait for work, sweep clusters, search, emit.
fn run_worker(
    cache: &ClusterIndexCache,
    sink: &dyn ResultSink,
    signal: &WorkSignal,
    shutdown: &AtomicBool,
    top_k: usize,
    max_queries_per_batch: usize,
) {
    debug!("search worker started");

    loop {
        signal.wait(|| shutdown.load(Ordering::Acquire));
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        for (cluster, entry) in cache.snapshot() {
            // Re-check between clusters so shutdown only waits for the
            // in-flight batch, not the whole sweep.
            if shutdown.load(Ordering::Acquire) {
                break;
            }

            let items = entry.pending().drain_all();
            if items.is_empty() {
                continue;
            }
            search_and_emit(cluster, &entry, &items, sink, top_k, max_queries_per_batch);
        }
    }

    debug!("search worker stopped");
}

/// Runs one cluster's drained queries through its index and emits each
/// query's ranked neighbors.
fn search_and_emit(
    cluster: ClusterId,
    entry: &ClusterEntry,
    items: &[QueryItem],
    sink: &dyn ResultSink,
    top_k: usize,
    max_queries_per_batch: usize,
) {
    let dim = entry.index().dimension().get();

    for chunk in items.chunks(max_queries_per_batch) {
        let mut flat = Vec::with_capacity(chunk.len() * dim);
        for item in chunk {
            flat.extend_from_slice(&item.embedding);
        }

        match entry.index().search_batch(&flat, top_k) {
            Ok(ranked) => {
                for (item, neighbors) in chunk.iter().zip(ranked) {
                    if let Err(e) = sink.emit(&item.origin, &item.text, &neighbors) {
                        warn!(
                            "dropping result for cluster {cluster}, key {}: {e}",
                            item.origin.key
                        );
                    }
                }
            }
            Err(e) => {
                warn!(
                    "search failed for cluster {cluster}, dropping {} queries: {e}",
                    chunk.len()
                );
            }
        }
    }
}
