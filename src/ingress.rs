//! Request ingress and service lifecycle.
//!
//! [`ClusterSearchService`] is the surface the host drives: a handler entry
//! point invoked once per inbound request, a one-time configuration apply at
//! construction, and a stop hook that tears the worker down.
//!
//! The handler path per request: ensure the worker is started (lazy,
//! exactly-once), parse the cluster id from the key, resolve the cluster's
//! cache entry (synchronously loading it when cold), decode the payload into
//! queries, and append them to the cluster's pending buffer before raising
//! the wake signal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::cache::{ClusterIndexCache, EmbeddingFetcher};
use crate::config::{ConfigError, Settings};
use crate::error::{IngressError, IngressResult, TeardownError};
use crate::index::{ClusterId, VectorDimension};
use crate::pending::{QueryItem, RequestOrigin, WorkSignal};
use crate::worker::{ResultSink, WorkerHandle, WorkerState};

/// Delimiter introducing the cluster ordinal inside request keys.
const CLUSTER_KEY_DELIMITER: &str = "cluster";

/// Delimiter introducing the client ordinal inside request keys.
const CLIENT_KEY_DELIMITER: &str = "client";

/// Delimiter introducing the query-batch ordinal inside request keys.
const BATCH_KEY_DELIMITER: &str = "qb";

/// One inbound request as delivered by the host.
#[derive(Debug, Clone, Copy)]
pub struct IngressRequest<'a> {
    /// Node id of the sender.
    pub sender: u64,

    /// Logical pathname the request was routed under.
    pub path: &'a str,

    /// Key string encoding the target cluster and correlation ordinals.
    pub key: &'a str,

    /// Opaque payload holding the encoded query batch.
    pub payload: &'a [u8],
}

/// One decoded query: an embedding and its free-text payload.
#[derive(Debug, Clone)]
pub struct DecodedQuery {
    /// Query vector; must match the configured dimension.
    pub embedding: Vec<f32>,

    /// Free-text payload carried alongside the vector.
    pub text: String,
}

/// External capability that decodes a request payload into a query batch.
pub trait QueryBatchDecoder: Send + Sync {
    /// Decodes the payload. Order of the returned queries is the order
    /// they will be searched and emitted in.
    fn decode(&self, payload: &[u8]) -> Result<Vec<DecodedQuery>, DecodeError>;
}

/// Errors reported by a [`QueryBatchDecoder`].
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed query batch: {0}")]
    Malformed(String),
}

/// The cluster search service: a self-populating cache of per-cluster
/// embedding indices plus one background search worker.
///
/// Construction applies the configuration once; afterwards the host calls
/// [`handle`](Self::handle) from any number of request threads and
/// [`shutdown`](Self::shutdown) exactly once at teardown.
pub struct ClusterSearchService {
    cache: Arc<ClusterIndexCache>,
    decoder: Arc<dyn QueryBatchDecoder>,
    sink: Arc<dyn ResultSink>,
    signal: Arc<WorkSignal>,
    dimension: VectorDimension,
    top_k: usize,
    max_queries_per_batch: usize,

    /// Fast-path flag for the double-checked lazy worker start.
    worker_started: AtomicBool,

    /// Guards worker spawning on the slow path.
    worker_init: Mutex<()>,

    worker: Mutex<Option<WorkerHandle>>,
}

impl ClusterSearchService {
    /// Builds the service from validated settings and its three external
    /// capabilities. This is the one-time configuration-apply entry point.
    pub fn new(
        settings: &Settings,
        fetcher: Arc<dyn EmbeddingFetcher>,
        decoder: Arc<dyn QueryBatchDecoder>,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;
        let dimension = settings.search_dimension()?;

        let cache = Arc::new(ClusterIndexCache::new(
            dimension,
            settings.search.backend,
            settings.search.nprobe,
            fetcher,
        ));

        debug!(
            "cluster search service configured: dimension={}, top_k={}, backend={}",
            dimension.get(),
            settings.search.top_k,
            settings.search.backend
        );

        Ok(Self {
            cache,
            decoder,
            sink,
            signal: Arc::new(WorkSignal::new()),
            dimension,
            top_k: settings.search.top_k,
            max_queries_per_batch: settings.worker.max_queries_per_batch,
            worker_started: AtomicBool::new(false),
            worker_init: Mutex::new(()),
            worker: Mutex::new(None),
        })
    }

    /// Handler entry point, invoked once per inbound request.
    ///
    /// A failed request is dropped without affecting other requests: the
    /// error says why, and nothing is retried here. Retry, if desired, is
    /// the caller resubmitting the request.
    pub fn handle(&self, request: IngressRequest<'_>) -> IngressResult<()> {
        // The first request anywhere starts the worker
        self.ensure_worker_started()?;

        trace!(
            "request from sender {} on path {} with key {}",
            request.sender, request.path, request.key
        );

        let Some(cluster) = parse_cluster_id(request.key) else {
            warn!("dropping request with malformed key '{}'", request.key);
            return Err(IngressError::MalformedKey {
                key: request.key.to_string(),
            });
        };

        // May synchronously fetch on a cold cluster; only this request's
        // thread pays that cost.
        let entry = self.cache.lookup_or_create(cluster)?;

        let queries = self.decoder.decode(request.payload)?;
        let items = self.admit_queries(cluster, &request, queries);
        if items.is_empty() {
            return Ok(());
        }

        entry.pending().append(items);
        self.signal.raise();
        Ok(())
    }

    /// Filters decoded queries down to those matching the configured
    /// dimension. A mismatched query is dropped and logged; the rest of the
    /// batch continues.
    fn admit_queries(
        &self,
        cluster: ClusterId,
        request: &IngressRequest<'_>,
        queries: Vec<DecodedQuery>,
    ) -> Vec<QueryItem> {
        let (client_id, batch_id) = parse_batch_ref(request.key);
        let origin = RequestOrigin {
            sender: request.sender,
            key: Arc::from(request.key),
            client_id,
            batch_id,
        };

        queries
            .into_iter()
            .filter_map(|query| {
                if let Err(e) = self.dimension.validate_vector(&query.embedding) {
                    warn!("dropping query for cluster {cluster}: {e}");
                    return None;
                }
                Some(QueryItem {
                    embedding: query.embedding,
                    text: query.text,
                    origin: origin.clone(),
                })
            })
            .collect()
    }

    /// Starts the worker exactly once under concurrent first invocations:
    /// an atomic fast path, then a mutex-guarded re-check before spawning.
    fn ensure_worker_started(&self) -> IngressResult<()> {
        if self.worker_started.load(Ordering::Acquire) {
            return Ok(());
        }

        let _guard = self.worker_init.lock();
        if self.worker_started.load(Ordering::Relaxed) {
            return Ok(());
        }

        let handle = WorkerHandle::spawn(
            Arc::clone(&self.cache),
            Arc::clone(&self.sink),
            Arc::clone(&self.signal),
            self.top_k,
            self.max_queries_per_batch,
        )?;
        *self.worker.lock() = Some(handle);
        self.worker_started.store(true, Ordering::Release);
        Ok(())
    }

    /// Lifecycle stop hook: signals the worker and joins it.
    ///
    /// Idempotent: a second call (or a call before any request arrived) is
    /// a no-op. Requests handled after shutdown still buffer queries but
    /// nothing will search them.
    pub fn shutdown(&self) -> Result<(), TeardownError> {
        match self.worker.lock().take() {
            Some(handle) => {
                debug!("shutting down search worker");
                handle.join()
            }
            None => Ok(()),
        }
    }

    /// Observable worker lifecycle state.
    #[must_use]
    pub fn worker_state(&self) -> WorkerState {
        if !self.worker_started.load(Ordering::Acquire) {
            return WorkerState::NotStarted;
        }
        match &*self.worker.lock() {
            Some(handle) if handle.is_shutting_down() => WorkerState::ShuttingDown,
            Some(_) => WorkerState::Running,
            None => WorkerState::Stopped,
        }
    }

    /// Shared reference to the cluster cache, mainly for host introspection.
    #[must_use]
    pub fn cache(&self) -> Arc<ClusterIndexCache> {
        Arc::clone(&self.cache)
    }
}

impl Drop for ClusterSearchService {
    fn drop(&mut self) {
        // Joins on teardown even when the host forgot to call shutdown();
        // a panicked worker is only reported through shutdown()
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for ClusterSearchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterSearchService")
            .field("dimension", &self.dimension.get())
            .field("top_k", &self.top_k)
            .field("worker_state", &self.worker_state())
            .finish()
    }
}

/// Extracts the cluster ordinal from a request key.
///
/// Keys carry a `cluster<digits>` segment, e.g.
/// `/rag/emb/cluster7/client0_qb3`. The first `cluster` occurrence followed
/// by at least one digit wins; a key without one is malformed.
#[must_use]
pub fn parse_cluster_id(key: &str) -> Option<ClusterId> {
    parse_number_after(key, CLUSTER_KEY_DELIMITER).map(ClusterId::new)
}

/// Extracts the (client, query-batch) correlation ordinals from a key.
///
/// Both are optional: a key without them still identifies a cluster, it
/// just correlates less precisely in logs and emissions.
#[must_use]
pub fn parse_batch_ref(key: &str) -> (Option<u32>, Option<u32>) {
    (
        parse_number_after(key, CLIENT_KEY_DELIMITER),
        parse_number_after(key, BATCH_KEY_DELIMITER),
    )
}

/// Parses the digits following the first occurrence of `delimiter` that has
/// any. Skips occurrences embedded in longer words ("clusters_search").
fn parse_number_after(key: &str, delimiter: &str) -> Option<u32> {
    let mut search_from = 0;
    while let Some(pos) = key[search_from..].find(delimiter) {
        let start = search_from + pos + delimiter.len();
        let rest = &key[start..];
        let end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if end > 0 {
            return rest[..end].parse().ok();
        }
        search_from = start;
    }
    None
}
