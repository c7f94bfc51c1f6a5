//! Batched nearest-neighbor search over per-cluster embedding indices.
//!
//! The crate sits on the hot path of a distributed retrieval pipeline:
//! inbound requests name a cluster of embeddings and carry query vectors
//! plus query text. A self-populating cache loads each cluster's index
//! exactly once on first touch; a single background worker batches the
//! pending queries per cluster, runs the nearest-neighbor search, and emits
//! one ranked result per query.
//!
//! The host supplies three capabilities as trait objects: fetching a
//! cluster's raw embeddings ([`EmbeddingFetcher`]), decoding a request
//! payload into queries ([`QueryBatchDecoder`]), and delivering ranked
//! results downstream ([`ResultSink`]). The cache, buffering, worker
//! lifecycle, and search backends all live here.

pub mod cache;
pub mod config;
pub mod error;
pub mod index;
pub mod ingress;
pub mod pending;
pub mod worker;

// Explicit exports for better API clarity
pub use cache::{CacheError, ClusterEntry, ClusterIndexCache, EmbeddingFetcher, FetchError};
pub use config::{ConfigError, SearchConfig, Settings, WorkerConfig};
pub use error::{IngressError, IngressResult, TeardownError};
pub use index::{
    ClusterId, EmbeddingIndex, IndexError, Neighbor, NeighborId, SearchBackend, VectorDimension,
    build_index,
};
pub use ingress::{
    ClusterSearchService, DecodeError, DecodedQuery, IngressRequest, QueryBatchDecoder,
    parse_batch_ref, parse_cluster_id,
};
pub use pending::{PendingQueryBuffer, QueryItem, RequestOrigin, WorkSignal};
pub use worker::{EmitError, ResultSink, WorkerHandle, WorkerState};
