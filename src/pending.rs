//! Per-cluster pending-query buffering and the producer/worker wake signal.
//!
//! Producers (request handler threads) append decoded queries to their
//! cluster's buffer and raise the process-wide [`WorkSignal`]; the single
//! search worker drains whole buffers at a time so an arrival burst becomes
//! one batched search call.
//!
//! Each buffer is an independently lockable unit: draining one cluster
//! never blocks appends to another.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Correlation metadata carried from request ingress to result emission.
///
/// `client_id` and `batch_id` are parsed from the request key when present
/// and exist purely to correlate emitted results and log lines with the
/// upstream request; their absence is not an error.
#[derive(Debug, Clone)]
pub struct RequestOrigin {
    /// Node id of the sender that triggered the request.
    pub sender: u64,

    /// Full request key the query arrived under.
    pub key: Arc<str>,

    /// Client ordinal parsed from the key, when present.
    pub client_id: Option<u32>,

    /// Query-batch ordinal parsed from the key, when present.
    pub batch_id: Option<u32>,
}

/// One query awaiting search: embedding, free-text payload, and the
/// correlation metadata its result will be tagged with.
#[derive(Debug, Clone)]
pub struct QueryItem {
    /// Query vector, exactly the configured dimension long.
    pub embedding: Vec<f32>,

    /// Free-text payload associated with the query.
    pub text: String,

    /// Where the query came from.
    pub origin: RequestOrigin,
}

/// Per-cluster accumulator of not-yet-searched queries.
///
/// Appends preserve arrival order within the cluster; order across clusters
/// is unconstrained.
#[derive(Debug, Default)]
pub struct PendingQueryBuffer {
    items: Mutex<Vec<QueryItem>>,
}

impl PendingQueryBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a decoded batch at the tail, preserving its internal order.
    pub fn append(&self, batch: Vec<QueryItem>) {
        let mut items = self.items.lock();
        items.extend(batch);
    }

    /// Atomically removes and returns every buffered item.
    ///
    /// An immediate second call on an unmodified buffer returns an empty
    /// vector: items are delivered to exactly one drain.
    #[must_use]
    pub fn drain_all(&self) -> Vec<QueryItem> {
        let mut items = self.items.lock();
        std::mem::take(&mut *items)
    }

    /// True when nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Number of buffered items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }
}

/// Wake signal between many producers and the single search worker.
///
/// A raised-flag-plus-condvar pair: producers set the flag under the mutex
/// and notify; the worker re-checks the flag (and its stop predicate) on
/// every wakeup, so neither lost nor spurious wakeups are possible.
#[derive(Debug, Default)]
pub struct WorkSignal {
    raised: Mutex<bool>,
    condvar: Condvar,
}

impl WorkSignal {
    /// Creates an unraised signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that work may be available and wakes the worker.
    pub fn raise(&self) {
        let mut raised = self.raised.lock();
        *raised = true;
        self.condvar.notify_one();
    }

    /// Blocks until the signal is raised or `stop` returns true, consuming
    /// the raised flag on return.
    ///
    /// `stop` is re-evaluated on every wakeup; callers pass their shutdown
    /// check so teardown can interrupt an idle wait.
    pub fn wait(&self, stop: impl Fn() -> bool) {
        let mut raised = self.raised.lock();
        loop {
            if stop() || *raised {
                *raised = false;
                return;
            }
            self.condvar.wait(&mut raised);
        }
    }
}
