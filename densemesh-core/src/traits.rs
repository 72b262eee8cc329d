//! Core traits for densemesh

use crate::point::*;

/// Trait for nearest neighbor search functionality.
///
/// Results are `(index, distance)` pairs sorted by increasing distance, with
/// ties ordered by index.
pub trait NearestNeighborSearch {
    /// Find the k nearest neighbors to a query point
    fn find_k_nearest(&self, query: &Point3d, k: usize) -> Vec<(usize, f64)>;
}
