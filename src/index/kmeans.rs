//! K-means clustering for the IVF-flat coarse quantizer.
//!
//! Pure Rust k-means over squared L2 distance with k-means++ initialization.
//! The IVF backend uses this to partition a cluster's embeddings into
//! inverted lists; search then probes only the lists nearest the query.
//!
//! # Algorithm Details
//! - Distance metric: squared L2 (matches the search metric)
//! - Initialization: K-means++ for better convergence
//! - Max iterations: 50
//! - Convergence tolerance: 1e-4

use rand::Rng;
use thiserror::Error;

/// Maximum number of iterations for K-means clustering.
const MAX_ITERATIONS: usize = 50;

/// Convergence tolerance for centroid movement between iterations.
const CONVERGENCE_TOLERANCE: f32 = 1e-4;

/// Epsilon for floating-point comparisons.
const EPSILON: f32 = 1e-10;

/// Result of a K-means clustering run.
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansResult {
    /// Centroids, each with the same dimension as the input vectors.
    pub centroids: Vec<Vec<f32>>,

    /// Centroid index assigned to each input vector.
    pub assignments: Vec<usize>,

    /// Number of iterations until convergence.
    pub iterations: usize,
}

/// Errors that can occur during clustering operations.
#[derive(Error, Debug)]
pub enum ClusteringError {
    #[error(
        "Empty vector set provided for clustering\nSuggestion: Populate the cluster's embeddings before building an IVF index"
    )]
    EmptyVectorSet,

    #[error("Invalid centroid count: {0}\nSuggestion: Use k between 1 and the number of vectors")]
    InvalidClusterCount(usize),

    #[error(
        "Dimension mismatch in vectors\nSuggestion: Ensure all vectors come from the same embedding model"
    )]
    DimensionMismatch,
}

/// Computes the squared L2 distance between two vectors.
///
/// Squared distance preserves ranking and skips the square root, which is
/// what the exact and IVF scan kernels both rank by.
#[must_use]
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have same dimension");

    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Returns the index of the centroid nearest to `vector` by squared L2.
#[must_use]
pub fn nearest_centroid(vector: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best_distance = f32::INFINITY;
    let mut best = 0;

    for (i, centroid) in centroids.iter().enumerate() {
        let distance = squared_l2(vector, centroid);
        if distance < best_distance {
            best_distance = distance;
            best = i;
        }
    }

    best
}

/// Runs K-means over a set of vectors.
///
/// # Arguments
/// * `vectors` - Input vectors (non-empty, uniform dimension)
/// * `k` - Number of centroids (1 <= k <= vectors.len())
///
/// # Algorithm
/// 1. Initialize centroids with K-means++
/// 2. Iterate until assignments stabilize, centroid movement drops below
///    tolerance, or the iteration cap is hit:
///    - Assign each vector to its nearest centroid
///    - Recompute centroids as the mean of their members
#[must_use = "clustering results should be used or the computation is wasted"]
pub fn kmeans(vectors: &[&[f32]], k: usize) -> Result<KMeansResult, ClusteringError> {
    if vectors.is_empty() {
        return Err(ClusteringError::EmptyVectorSet);
    }

    if k == 0 || k > vectors.len() {
        return Err(ClusteringError::InvalidClusterCount(k));
    }

    let dimension = vectors[0].len();
    if vectors.iter().any(|v| v.len() != dimension) {
        return Err(ClusteringError::DimensionMismatch);
    }

    let mut centroids = initialize_centroids_kmeans_plus_plus(vectors, k);
    let mut assignments = vec![0usize; vectors.len()];
    let mut iterations = 0;

    loop {
        iterations += 1;

        let new_assignments: Vec<usize> = vectors
            .iter()
            .map(|vector| nearest_centroid(vector, &centroids))
            .collect();

        let converged = new_assignments == assignments;
        assignments = new_assignments;

        if converged || iterations >= MAX_ITERATIONS {
            break;
        }

        let new_centroids = update_centroids(vectors, &assignments, k, dimension);

        let movement = centroid_movement(&centroids, &new_centroids);
        centroids = new_centroids;

        if movement < CONVERGENCE_TOLERANCE {
            break;
        }
    }

    Ok(KMeansResult {
        centroids,
        assignments,
        iterations,
    })
}

/// Recomputes centroids as the mean of their assigned vectors.
///
/// An empty centroid keeps a randomly re-seeded member so every inverted
/// list stays non-degenerate.
fn update_centroids(
    vectors: &[&[f32]],
    assignments: &[usize],
    k: usize,
    dimension: usize,
) -> Vec<Vec<f32>> {
    let mut new_centroids = vec![vec![0.0; dimension]; k];
    let mut member_counts = vec![0usize; k];

    for (vector, &centroid_idx) in vectors.iter().zip(assignments.iter()) {
        for (i, &value) in vector.iter().enumerate() {
            new_centroids[centroid_idx][i] += value;
        }
        member_counts[centroid_idx] += 1;
    }

    for (centroid, &count) in new_centroids.iter_mut().zip(member_counts.iter()) {
        if count == 0 {
            let random_idx = rand::rng().random_range(0..vectors.len());
            centroid.copy_from_slice(vectors[random_idx]);
        } else {
            for value in centroid.iter_mut() {
                *value /= count as f32;
            }
        }
    }

    new_centroids
}

/// Initializes centroids using the K-means++ algorithm.
///
/// K-means++ selects initial centroids that are far apart, leading to
/// better convergence properties than random initialization. Always returns
/// exactly `k` centroids: when all remaining points coincide with existing
/// centroids, the selection degenerates to repeating members, which k-means
/// then collapses back onto the data.
fn initialize_centroids_kmeans_plus_plus(vectors: &[&[f32]], k: usize) -> Vec<Vec<f32>> {
    let mut rng = rand::rng();
    let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);

    // Choose first centroid randomly
    let first_idx = rng.random_range(0..vectors.len());
    centroids.push(vectors[first_idx].to_vec());

    for _ in 1..k {
        // Distance from each vector to its nearest existing centroid
        let mut distances = vec![0.0f32; vectors.len()];
        let mut total_distance = 0.0f32;

        for (i, vector) in vectors.iter().enumerate() {
            let mut min_distance = f32::MAX;
            for centroid in &centroids {
                min_distance = min_distance.min(squared_l2(vector, centroid));
            }
            distances[i] = min_distance;
            total_distance += min_distance;
        }

        if total_distance < EPSILON {
            // Remaining points coincide with existing centroids
            centroids.push(vectors[first_idx].to_vec());
            continue;
        }

        // Choose next centroid with probability proportional to distance
        let target = rng.random::<f32>() * total_distance;
        let mut cumulative = 0.0;
        let mut chosen = vectors.len() - 1;

        for (i, &distance) in distances.iter().enumerate() {
            cumulative += distance;
            if cumulative >= target {
                chosen = i;
                break;
            }
        }

        centroids.push(vectors[chosen].to_vec());
    }

    centroids
}

/// Mean squared movement of centroids between two iterations.
fn centroid_movement(old: &[Vec<f32>], new: &[Vec<f32>]) -> f32 {
    old.iter()
        .zip(new.iter())
        .map(|(old_c, new_c)| squared_l2(old_c, new_c))
        .sum::<f32>()
        / old.len() as f32
}
