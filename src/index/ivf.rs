//! Approximate IVF-flat search backend.
//!
//! The cluster's vectors are partitioned into inverted lists by a k-means
//! coarse quantizer; a query scans only the `nprobe` lists whose centroids
//! are nearest, trading a little recall for sub-linear scan cost. Within the
//! probed lists the scan is exact, so with `nprobe` covering every list the
//! results match the flat backends.

use crate::index::EmbeddingIndex;
use crate::index::flat::{VectorSlab, rank_candidates};
use crate::index::kmeans::{kmeans, squared_l2};
use crate::index::types::{IndexError, Neighbor, NeighborId, VectorDimension};

/// Minimum number of inverted lists.
const MIN_LISTS: usize = 1;

/// Maximum number of inverted lists.
const MAX_LISTS: usize = 100;

/// IVF-flat index: k-means centroids plus per-centroid member lists.
#[derive(Debug)]
pub struct IvfFlatIndex {
    slab: VectorSlab,
    centroids: Vec<Vec<f32>>,

    /// Member ordinals per centroid, each list in ascending ordinal order.
    lists: Vec<Vec<u32>>,

    nprobe: usize,
}

impl IvfFlatIndex {
    /// Builds the index from a flattened row-major vector set.
    ///
    /// The list count follows the sqrt heuristic: k = ceil(sqrt(N)) clamped
    /// to [1, 100]. `nprobe` is clamped to the resulting list count.
    pub fn build(
        dimension: VectorDimension,
        vectors: Vec<f32>,
        nprobe: usize,
    ) -> Result<Self, IndexError> {
        let slab = VectorSlab::new(dimension, vectors)?;

        let k = (slab.len() as f32).sqrt().ceil() as usize;
        let k = k.clamp(MIN_LISTS, MAX_LISTS.min(slab.len()));

        let rows: Vec<&[f32]> = (0..slab.len()).map(|i| slab.row(i)).collect();
        let clustering = kmeans(&rows, k).map_err(|e| IndexError::BuildFailed(e.to_string()))?;

        let mut lists = vec![Vec::new(); k];
        for (ordinal, &list) in clustering.assignments.iter().enumerate() {
            lists[list].push(ordinal as u32);
        }

        Ok(Self {
            slab,
            centroids: clustering.centroids,
            lists,
            nprobe: nprobe.clamp(1, k),
        })
    }

    /// Number of inverted lists in the coarse quantizer.
    #[must_use]
    pub fn list_count(&self) -> usize {
        self.lists.len()
    }

    /// Centroid indices ordered by ascending distance to the query.
    fn probe_order(&self, query: &[f32]) -> Vec<usize> {
        let mut order: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, squared_l2(query, c)))
            .collect();
        order.sort_unstable_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        order.into_iter().map(|(i, _)| i).collect()
    }

    fn rank_query(&self, query: &[f32], top_k: usize) -> Vec<Neighbor> {
        let mut candidates = Vec::new();

        for &list in self.probe_order(query).iter().take(self.nprobe) {
            for &ordinal in &self.lists[list] {
                candidates.push(Neighbor {
                    id: NeighborId::new(ordinal),
                    distance: squared_l2(query, self.slab.row(ordinal as usize)),
                });
            }
        }

        rank_candidates(candidates, top_k)
    }
}

impl EmbeddingIndex for IvfFlatIndex {
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
