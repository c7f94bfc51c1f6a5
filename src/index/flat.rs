//! Exact-scan search backends over a cluster's embedding slab.
//!
//! Two variants share one storage layout:
//! - [`FlatScanIndex`] ranks every stored vector serially.
//! - [`ParallelFlatIndex`] ranks rows with rayon, the throughput-oriented
//!   variant for large clusters where a serial scan leaves cores idle.
//!
//! Both are exact: results are identical (and identical to each other) for
//! any batch size, ordered by ascending distance with ties broken by
//! ascending neighbor id.

use rayon::prelude::*;

use crate::index::EmbeddingIndex;
use crate::index::kmeans::squared_l2;
use crate::index::types::{IndexError, Neighbor, NeighborId, VectorDimension};

/// Contiguous row-major storage for one cluster's vectors.
///
/// Rows are addressed by their insertion ordinal, which doubles as the
/// neighbor id reported in search results.
#[derive(Debug)]
pub(crate) struct VectorSlab {
    dimension: VectorDimension,
    data: Vec<f32>,
    count: usize,
}

impl VectorSlab {
    /// Validates and wraps a flattened vector set.
    ///
    /// An empty set is rejected: a cluster with no embeddings is a load
    /// failure upstream, never an index.
    pub(crate) fn new(dimension: VectorDimension, data: Vec<f32>) -> Result<Self, IndexError> {
        let count = dimension.validate_batch(&data)?;
        if count == 0 {
            return Err(IndexError::EmptyIndex);
        }
        Ok(Self {
            dimension,
            data,
            count,
        })
    }

    pub(crate) fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    pub(crate) fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub(crate) fn row(&self, ordinal: usize) -> &[f32] {
        let dim = self.dimension.get();
        let start = ordinal * dim;
        &self.data[start..start + dim]
    }
}

/// Sorts candidates into the contract order and keeps the best `top_k`.
///
/// Ascending distance, ties broken by ascending id. `total_cmp` keeps the
/// sort total even if a degenerate input produced a NaN distance.
pub(crate) fn rank_candidates(mut candidates: Vec<Neighbor>, top_k: usize) -> Vec<Neighbor> {
    candidates.sort_unstable_by(|a, b| a.distance.total_cmp(&b.distance).then(a.id.cmp(&b.id)));
    candidates.truncate(top_k);
    candidates
}

/// Serial exact scan over every stored vector.
#[derive(Debug)]
pub struct FlatScanIndex {
    slab: VectorSlab,
}

impl FlatScanIndex {
    /// Builds the index from a flattened row-major vector set.
    pub fn new(dimension: VectorDimension, vectors: Vec<f32>) -> Result<Self, IndexError> {
        Ok(Self {
            slab: VectorSlab::new(dimension, vectors)?,
        })
    }

    fn rank_query(&self, query: &[f32], top_k: usize) -> Vec<Neighbor> {
        let candidates = (0..self.slab.len())
            .map(|i| Neighbor {
                id: NeighborId::new(i as u32),
                distance: squared_l2(query, self.slab.row(i)),
            })
            .collect();
        rank_candidates(candidates, top_k)
    }
}

impl EmbeddingIndex for FlatScanIndex {
    fn dimension(&self) -> VectorDimension {
        self.slab.dimension()
    }

    fn len(&self) -> usize {
        self.slab.len()
    }

    fn search_batch(
        &self,
        queries: &[f32],
        top_k: usize,
    ) -> Result<Vec<Vec<Neighbor>>, IndexError> {
        let nq = self.slab.dimension().validate_batch(queries)?;
        let dim = self.slab.dimension().get();

        Ok((0..nq)
            .map(|q| self.rank_query(&queries[q * dim..(q + 1) * dim], top_k))
            .collect())
    }
}

/// Rayon-parallel exact scan.
///
/// Distances for all rows are computed data-parallel, then ranked exactly
/// like the serial scan, so results are bit-identical to [`FlatScanIndex`].
#[derive(Debug)]
pub struct ParallelFlatIndex {
    slab: VectorSlab,
}

impl ParallelFlatIndex {
    /// Builds the index from a flattened row-major vector set.
    pub fn new(dimension: VectorDimension, vectors: Vec<f32>) -> Result<Self, IndexError> {
        Ok(Self {
            slab: VectorSlab::new(dimension, vectors)?,
        })
    }

    fn rank_query(&self, query: &[f32], top_k: usize) -> Vec<Neighbor> {
        let candidates = (0..self.slab.len())
            .into_par_iter()
            .map(|i| Neighbor {
                id: NeighborId::new(i as u32),
                distance: squared_l2(query, self.slab.row(i)),
            })
            .collect();
        rank_candidates(candidates, top_k)
    }
}

impl EmbeddingIndex for ParallelFlatIndex {
    fn dimension(&self) -> VectorDimension {
        self.slab.dimension()
    }

    fn len(&self) -> usize {
        self.slab.len()
    }

    fn search_batch(
        &self,
        queries: &[f32],
        top_k: usize,
    ) -> Result<Vec<Vec<Neighbor>>, IndexError> {
        let nq = self.slab.dimension().validate_batch(queries)?;
        let dim = self.slab.dimension().get();

        Ok((0..nq)
            .map(|q| self.rank_query(&queries[q * dim..(q + 1) * dim], top_k))
            .collect())
    }
}
