//! Normal estimation algorithms

use crate::nearest_neighbor::KdTree;
use densemesh_core::{Error, Matrix3, NearestNeighborSearch, Point3d, PointCloud, Result, Vector3d};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

/// How estimated normals are oriented
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub enum NormalOrientation {
    /// Point away from the centroid of the whole cloud
    #[default]
    AwayFromCentroid,
    /// Point toward a fixed viewpoint, e.g. a camera center
    TowardViewpoint(Point3d),
}

/// Unit normal of the plane best fitting `neighbors`, or `None` when the
/// neighborhood does not span a plane.
pub fn fit_plane_normal(neighbors: &[Point3d]) -> Option<Vector3d> {
    if neighbors.len() < 3 {
        return None;
    }
    let n = neighbors.len() as f64;
    let centroid = neighbors.iter().fold(Vector3d::zeros(), |acc, p| acc + p.coords) / n;

    let mut cov = Matrix3::zeros();
    for p in neighbors {
        let d = p.coords - centroid;
        cov += d * d.transpose();
    }
    cov /= n;

    let eigen = cov.symmetric_eigen();
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));
    // Two vanishing eigenvalues mean the neighborhood is a line or a point
    if eigen.eigenvalues[order[1]] <= f64::EPSILON * eigen.eigenvalues[order[2]].max(f64::MIN_POSITIVE) {
        return None;
    }
    eigen.eigenvectors.column(order[0]).into_owned().try_normalize(f64::MIN_POSITIVE)
}

/// Estimate normals for a point cloud using k-nearest neighbors
///
/// Each normal is the direction of least variance of the `k` nearest points
/// (the point included), flipped according to `orientation`. Neighborhoods
/// that do not span a plane get a zero normal.
///
/// # Arguments
/// * `cloud` - Point cloud to annotate; existing normals are replaced
/// * `k` - Neighborhood size, at least 3
/// * `orientation` - Orientation rule for the sign of each normal
pub fn estimate_normals(
    cloud: &mut PointCloud,
    k: usize,
    orientation: NormalOrientation,
) -> Result<()> {
    if k < 3 {
        return Err(Error::invalid_parameter("k", format!("must be at least 3, got {}", k)));
    }
    if cloud.len() < 3 {
        return Err(Error::InsufficientPoints {
            required: 3,
            available: cloud.len(),
        });
    }
    cloud.validate()?;

    let tree = KdTree::new(&cloud.points)?;
    let centroid = cloud
        .points
        .iter()
        .fold(Vector3d::zeros(), |acc, p| acc + p.coords)
        / cloud.len() as f64;

    let points = &cloud.points;
    let normals: Vec<Vector3d> = points
        .par_iter()
        .map(|p| {
            let neighbors: Vec<Point3d> = tree
                .find_k_nearest(p, k)
                .into_iter()
                .map(|(idx, _)| points[idx])
                .collect();
            let Some(normal) = fit_plane_normal(&neighbors) else {
                return Vector3d::zeros();
            };
            let reference = match orientation {
                NormalOrientation::AwayFromCentroid => p.coords - centroid,
                NormalOrientation::TowardViewpoint(view) => view - p,
            };
            if normal.dot(&reference) < 0.0 {
                -normal
            } else {
                normal
            }
        })
        .collect();

    let missing = normals.iter().filter(|n| n.norm_squared() == 0.0).count();
    info!(
        "Estimated normals for {} points (k={}, {} without a stable plane)",
        normals.len(),
        k,
        missing
    );
    cloud.set_normals(normals)
}
