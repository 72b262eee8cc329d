//! Nearest neighbor search implementations

use densemesh_core::{Error, NearestNeighborSearch, Point3d, Result};
use kdtree::distance::squared_euclidean;

/// KD-Tree over a fixed point set, backed by the `kdtree` crate.
///
/// The tree splits on the axis of largest spread at the bucket midpoint, so
/// repeated and coplanar points are handled without special casing.
pub struct KdTree {
    tree: kdtree::KdTree<f64, usize, [f64; 3]>,
    len: usize,
}

/// Points per leaf bucket
const BUCKET_SIZE: usize = 32;

impl KdTree {
    pub fn new(points: &[Point3d]) -> Result<Self> {
        let mut tree = kdtree::KdTree::with_capacity(3, BUCKET_SIZE);
        for (idx, point) in points.iter().enumerate() {
            tree.add([point.x, point.y, point.z], idx).map_err(|e| {
                Error::InvalidData(format!("cannot index point {}: {:?}", idx, e))
            })?;
        }
        Ok(Self {
            tree,
            len: points.len(),
        })
    }

    /// Number of indexed points
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl NearestNeighborSearch for KdTree {
    fn find_k_nearest(&self, query: &Point3d, k: usize) -> Vec<(usize, f64)> {
        if k == 0 || self.len == 0 {
            return Vec::new();
        }
        let found = self
            .tree
            .nearest(&[query.x, query.y, query.z], k, &squared_euclidean)
            .unwrap_or_default();
        to_sorted_distances(found)
    }
}

fn to_sorted_distances(found: Vec<(f64, &usize)>) -> Vec<(usize, f64)> {
    let mut result: Vec<(usize, f64)> = found
        .into_iter()
        .map(|(sq, &idx)| (idx, sq.sqrt()))
        .collect();
    result.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};

    /// Simple brute force nearest neighbor search for small datasets
    struct BruteForceSearch<'a> {
        points: &'a [Point3d],
    }

    impl<'a> BruteForceSearch<'a> {
        fn new(points: &'a [Point3d]) -> Self {
            Self { points }
        }
    }

    impl NearestNeighborSearch for BruteForceSearch<'_> {
        fn find_k_nearest(&self, query: &Point3d, k: usize) -> Vec<(usize, f64)> {
            let mut distances: Vec<(usize, f64)> = self
                .points
                .iter()
                .enumerate()
                .map(|(idx, point)| (idx, (point - query).norm()))
                .collect();

            distances.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
            distances.truncate(k);
            distances
        }
    }

    fn random_points(n: usize, seed: u64) -> Vec<Point3d> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| Point3d::new(rng.gen(), rng.gen(), rng.gen()))
            .collect()
    }

    #[test]
    fn test_kdtree_matches_brute_force() {
        let points = random_points(500, 7);
        let tree = KdTree::new(&points).unwrap();
        let brute = BruteForceSearch::new(&points);

        for query in random_points(20, 11) {
            let a = tree.find_k_nearest(&query, 8);
            let b = brute.find_k_nearest(&query, 8);
            assert_eq!(a.len(), 8);
            for (x, y) in a.iter().zip(&b) {
                assert_relative_eq!(x.1, y.1, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_kdtree_coplanar_and_duplicate_points() {
        // A planar grid with every point repeated exceeds any bucket size on one axis
        let mut points = Vec::new();
        for i in 0..20 {
            for j in 0..20 {
                let p = Point3d::new(i as f64, j as f64, 0.0);
                points.push(p);
                points.push(p);
            }
        }
        let tree = KdTree::new(&points).unwrap();
        let found = tree.find_k_nearest(&Point3d::new(5.0, 5.0, 0.0), 2);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].1, 0.0);
        assert_eq!(found[1].1, 0.0);
    }

    #[test]
    fn test_kdtree_k_larger_than_cloud() {
        let points = random_points(5, 3);
        let tree = KdTree::new(&points).unwrap();
        assert_eq!(tree.find_k_nearest(&points[0], 10).len(), 5);
        assert!(tree.find_k_nearest(&points[0], 0).is_empty());
    }

    #[test]
    fn test_kdtree_rejects_non_finite() {
        let points = vec![Point3d::new(0.0, f64::NAN, 0.0)];
        assert!(KdTree::new(&points).is_err());
    }
}
