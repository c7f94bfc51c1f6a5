//! Type-safe wrappers and core types for cluster-local nearest-neighbor search.
//!
//! This module provides newtypes and error types following the project's
//! strict type safety guidelines. All types implement necessary traits
//! for ergonomic usage while preventing primitive obsession.

use thiserror::Error;

/// Type-safe wrapper for cluster identifiers.
///
/// A cluster is one shard of the embedding space, assigned upstream by the
/// partitioning stage. Numbering starts at zero, so this wraps a plain u32
/// rather than a NonZero type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterId(u32);

impl ClusterId {
    /// Creates a new `ClusterId`.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the underlying u32 value.
    #[must_use]
    pub const fn get(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type-safe wrapper for the ordinal of one embedding inside a cluster's index.
///
/// Neighbor ids are dense insertion ordinals (0-based), stable for the
/// lifetime of the cache entry because indices are immutable once populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NeighborId(u32);

impl NeighborId {
    /// Creates a new `NeighborId`.
    #[must_use]
    pub const fn new(ordinal: u32) -> Self {
        Self(ordinal)
    }

    /// Returns the underlying u32 value.
    #[must_use]
    pub const fn get(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for NeighborId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One ranked search result entry.
///
/// Result lists are ordered by ascending distance, ties broken by ascending
/// neighbor id so that results are deterministic across backends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Ordinal of the matched embedding inside its cluster.
    pub id: NeighborId,

    /// Squared L2 distance between the query and the matched embedding.
    pub distance: f32,
}

/// Type-safe wrapper for embedding dimensionality.
///
/// Dimensionality is process-wide configuration: every cluster's vectors and
/// every query must agree with it. Validation happens at the boundaries so
/// the search kernels can assume well-shaped input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorDimension(usize);

impl VectorDimension {
    /// Creates a new `VectorDimension` with validation.
    ///
    /// Returns an error if the dimension is zero.
    pub fn new(dim: usize) -> Result<Self, IndexError> {
        if dim == 0 {
            return Err(IndexError::InvalidDimension {
                dimension: 0,
                reason: "Embedding dimension cannot be zero",
            });
        }
        Ok(Self(dim))
    }

    /// Returns the underlying dimension value.
    #[must_use]
    pub const fn get(&self) -> usize {
        self.0
    }

    /// Validates that a single vector has the expected dimension.
    pub fn validate_vector(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.0 {
            return Err(IndexError::DimensionMismatch {
                expected: self.0,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Validates a flattened row-major batch and returns the row count.
    ///
    /// A batch whose length is not a whole multiple of the dimension is
    /// rejected, never truncated or padded.
    pub fn validate_batch(&self, flat: &[f32]) -> Result<usize, IndexError> {
        if flat.len() % self.0 != 0 {
            return Err(IndexError::RaggedBatch {
                len: flat.len(),
                dimension: self.0,
            });
        }
        Ok(flat.len() / self.0)
    }
}

/// Errors that can occur during index construction and search.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error(
        "Vector dimension mismatch: expected {expected}, got {actual}\nSuggestion: Ensure queries and cluster embeddings come from the same embedding model"
    )]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid vector dimension: {dimension}\nReason: {reason}")]
    InvalidDimension {
        dimension: usize,
        reason: &'static str,
    },

    #[error(
        "Flattened batch of {len} floats is not a whole number of {dimension}-dimensional vectors\nSuggestion: Check the decoder emitted row-major vectors of the configured dimension"
    )]
    RaggedBatch { len: usize, dimension: usize },

    #[error(
        "Cannot build an index over an empty vector set\nSuggestion: Verify the cluster has embeddings before populating the cache"
    )]
    EmptyIndex,

    #[error("Index construction failed: {0}")]
    BuildFailed(String),
}
