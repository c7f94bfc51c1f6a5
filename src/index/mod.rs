//! Nearest-neighbor index backends for per-cluster embedding sets.
//!
//! One cluster's vectors are immutable once loaded, so an index is built
//! exactly once at cache-population time and then answers batched top-K
//! queries for the lifetime of the cache entry.
//!
//! # Architecture
//! The backend is a process-wide configuration choice behind the
//! [`EmbeddingIndex`] trait: an exact serial scan, a rayon-parallel exact
//! scan, or an approximate IVF-flat index with a k-means coarse quantizer.
//! Call sites never branch on the backend; [`build_index`] selects the
//! implementation once.

mod flat;
mod ivf;
mod kmeans;
mod types;

// Re-export core types for public API
pub use flat::{FlatScanIndex, ParallelFlatIndex};
pub use ivf::IvfFlatIndex;
pub use kmeans::{ClusteringError, KMeansResult, kmeans as kmeans_clustering, squared_l2};
pub use types::{ClusterId, IndexError, Neighbor, NeighborId, VectorDimension};

use serde::{Deserialize, Serialize};

/// Process-wide search backend selector.
///
/// Chosen once from configuration; opaque to everything past
/// [`build_index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchBackend {
    /// Serial exact scan.
    #[default]
    Flat,

    /// Rayon-parallel exact scan for large clusters.
    ParallelFlat,

    /// Approximate inverted-file search with exact scan inside probed lists.
    IvfFlat,
}

impl std::fmt::Display for SearchBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flat => write!(f, "flat"),
            Self::ParallelFlat => write!(f, "parallel-flat"),
            Self::IvfFlat => write!(f, "ivf-flat"),
        }
    }
}

/// Contract for one cluster's in-memory nearest-neighbor index.
///
/// Implementations must return, for each query, neighbors ordered by
/// ascending distance with ties broken by ascending neighbor id, and must
/// treat batching as a performance transform only: a batch of Q queries
/// yields the same per-query results as Q single-query calls.
pub trait EmbeddingIndex: Send + Sync {
    /// Dimensionality every stored vector and query must match.
    fn dimension(&self) -> VectorDimension;

    /// Number of vectors in the index.
    fn len(&self) -> usize;

    /// True when the index holds no vectors. Never observed in practice:
    /// construction rejects empty vector sets.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Searches a flattened row-major batch of queries.
    ///
    /// Returns one ranked neighbor list per query, each of length
    /// `min(top_k, len())`. A batch whose length is not a whole multiple of
    /// the dimension is rejected for the whole call.
    fn search_batch(&self, queries: &[f32], top_k: usize) -> Result<Vec<Vec<Neighbor>>, IndexError>;
}

/// Builds the configured index variant over one cluster's vectors.
///
/// `nprobe` applies to the IVF backend only and is ignored by the exact
/// scans.
pub fn build_index(
    backend: SearchBackend,
    dimension: VectorDimension,
    vectors: Vec<f32>,
    nprobe: usize,
) -> Result<Box<dyn EmbeddingIndex>, IndexError> {
    match backend {
        SearchBackend::Flat => Ok(Box::new(FlatScanIndex::new(dimension, vectors)?)),
        SearchBackend::ParallelFlat => Ok(Box::new(ParallelFlatIndex::new(dimension, vectors)?)),
        SearchBackend::IvfFlat => Ok(Box::new(IvfFlatIndex::build(dimension, vectors, nprobe)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_display_matches_config_names() {
        assert_eq!(SearchBackend::Flat.to_string(), "flat");
        assert_eq!(SearchBackend::ParallelFlat.to_string(), "parallel-flat");
        assert_eq!(SearchBackend::IvfFlat.to_string(), "ivf-flat");
    }

    #[test]
    fn test_build_index_selects_backend() {
        let dimension = VectorDimension::new(2).unwrap();
        let vectors = vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0];

        for backend in [
            SearchBackend::Flat,
            SearchBackend::ParallelFlat,
            SearchBackend::IvfFlat,
        ] {
            let index = build_index(backend, dimension, vectors.clone(), 1).unwrap();
            assert_eq!(index.len(), 3);
            assert!(!index.is_empty());

            let results = index.search_batch(&[1.1, 1.1], 1).unwrap();
            assert_eq!(results[0][0].id.get(), 1, "backend {backend}");
        }
    }

    #[test]
    fn test_backends_agree_on_exact_settings() {
        let dimension = VectorDimension::new(3).unwrap();
        let vectors: Vec<f32> = (0..60).map(|i| (i as f32 * 0.77).cos()).collect();
        let queries: Vec<f32> = (0..6).map(|i| (i as f32 * 1.3).sin()).collect();

        let flat = build_index(SearchBackend::Flat, dimension, vectors.clone(), 1).unwrap();
        let parallel =
            build_index(SearchBackend::ParallelFlat, dimension, vectors.clone(), 1).unwrap();
        // nprobe large enough to cover every list makes IVF exact
        let ivf = build_index(SearchBackend::IvfFlat, dimension, vectors, usize::MAX).unwrap();

        let a = flat.search_batch(&queries, 4).unwrap();
        let b = parallel.search_batch(&queries, 4).unwrap();
        let c = ivf.search_batch(&queries, 4).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
    }
}
