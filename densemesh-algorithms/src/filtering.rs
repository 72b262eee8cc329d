//! Filtering algorithms
//!
//! Voxel downsampling and statistical outlier removal, the two stages that
//! thin and clean a raw photogrammetry cloud before surface fitting.

use crate::nearest_neighbor::KdTree;
use densemesh_core::{Color, Error, NearestNeighborSearch, Point3d, PointCloud, Result, Vector3d};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Integer voxel coordinate
pub type VoxelKey = (i64, i64, i64);

/// Voxel containing `point` on a grid of cell size `voxel_size` anchored at
/// the world origin
pub fn voxel_key(point: &Point3d, voxel_size: f64) -> VoxelKey {
    (
        (point.x / voxel_size).floor() as i64,
        (point.y / voxel_size).floor() as i64,
        (point.z / voxel_size).floor() as i64,
    )
}

/// Running sums for one occupied voxel
#[derive(Debug, Clone)]
struct VoxelAccumulator {
    position: Vector3d,
    normal: Vector3d,
    color: Color,
    count: usize,
}

impl VoxelAccumulator {
    fn new() -> Self {
        Self {
            position: Vector3d::zeros(),
            normal: Vector3d::zeros(),
            color: Color::zeros(),
            count: 0,
        }
    }
}

/// Voxel grid downsampling
///
/// Partitions space into cubes of side `voxel_size` anchored at the origin and
/// replaces the points of every occupied cube by their mean. Colors are
/// averaged; normals are averaged and renormalized. Output points appear in
/// the order their voxel is first hit in the input.
///
/// # Arguments
/// * `cloud` - Input point cloud
/// * `voxel_size` - Edge length of each voxel cube
///
/// # Returns
/// * `Result<PointCloud>` - Downsampled point cloud
///
/// # Example
/// ```rust
/// use densemesh_core::{PointCloud, Point3d};
/// use densemesh_algorithms::voxel_down_sample;
///
/// fn main() -> densemesh_core::Result<()> {
///     let cloud = PointCloud::from_points(vec![
///         Point3d::new(0.01, 0.01, 0.01),
///         Point3d::new(0.03, 0.01, 0.01),
///         Point3d::new(0.5, 0.5, 0.5),
///     ]);
///
///     let downsampled = voxel_down_sample(&cloud, 0.1)?;
///     assert_eq!(downsampled.len(), 2);
///     Ok(())
/// }
/// ```
pub fn voxel_down_sample(cloud: &PointCloud, voxel_size: f64) -> Result<PointCloud> {
    if !(voxel_size.is_finite() && voxel_size > 0.0) {
        return Err(Error::invalid_parameter(
            "voxel_size",
            format!("must be positive and finite, got {}", voxel_size),
        ));
    }
    if cloud.is_empty() {
        return Err(Error::InsufficientPoints {
            required: 1,
            available: 0,
        });
    }
    cloud.validate()?;

    let keys: Vec<VoxelKey> = cloud
        .points
        .par_iter()
        .map(|p| voxel_key(p, voxel_size))
        .collect();

    // Slots are allocated in first-appearance order and summed in input order
    let mut slot_of: HashMap<VoxelKey, usize> = HashMap::new();
    let mut voxels: Vec<VoxelAccumulator> = Vec::new();
    for (i, key) in keys.iter().enumerate() {
        let slot = *slot_of.entry(*key).or_insert_with(|| {
            voxels.push(VoxelAccumulator::new());
            voxels.len() - 1
        });
        let acc = &mut voxels[slot];
        acc.position += cloud.points[i].coords;
        if let Some(normals) = &cloud.normals {
            acc.normal += normals[i];
        }
        if let Some(colors) = &cloud.colors {
            acc.color += colors[i];
        }
        acc.count += 1;
    }

    let points: Vec<Point3d> = voxels
        .iter()
        .map(|v| Point3d::from(v.position / v.count as f64))
        .collect();
    let mut result = PointCloud::from_points(points);
    if cloud.has_normals() {
        result.normals = Some(
            voxels
                .iter()
                .map(|v| {
                    v.normal
                        .try_normalize(f64::MIN_POSITIVE)
                        .unwrap_or_else(Vector3d::zeros)
                })
                .collect(),
        );
    }
    if cloud.has_colors() {
        result.colors = Some(voxels.iter().map(|v| v.color / v.count as f64).collect());
    }

    info!(
        "Voxel downsampling ({}): {} -> {} points",
        voxel_size,
        cloud.len(),
        result.len()
    );
    Ok(result)
}

/// Spatial downsampler holding its voxel size
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpatialDownsampler {
    /// Voxel edge length (default: 0.002)
    pub voxel_size: f64,
}

impl Default for SpatialDownsampler {
    fn default() -> Self {
        Self { voxel_size: 0.002 }
    }
}

impl SpatialDownsampler {
    pub fn new(voxel_size: f64) -> Self {
        Self { voxel_size }
    }

    pub fn apply(&self, cloud: &PointCloud) -> Result<PointCloud> {
        voxel_down_sample(cloud, self.voxel_size)
    }
}

/// Indices of the points kept and removed by an outlier filter.
///
/// Both lists are ascending and together cover `0..n` exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlierPartition {
    pub inliers: Vec<usize>,
    pub outliers: Vec<usize>,
}

impl OutlierPartition {
    /// Total number of classified points
    pub fn len(&self) -> usize {
        self.inliers.len() + self.outliers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Configuration for statistical outlier removal
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutlierConfig {
    /// Number of neighbors used for the mean distance (default: 200)
    pub nb_neighbors: usize,
    /// Standard deviation multiplier of the rejection threshold (default: 2.0)
    pub std_ratio: f64,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            nb_neighbors: 200,
            std_ratio: 2.0,
        }
    }
}

impl OutlierConfig {
    pub fn validate(&self) -> Result<()> {
        if self.nb_neighbors == 0 {
            return Err(Error::invalid_parameter(
                "nb_neighbors",
                "must be greater than 0",
            ));
        }
        if !(self.std_ratio.is_finite() && self.std_ratio > 0.0) {
            return Err(Error::invalid_parameter(
                "std_ratio",
                format!("must be positive and finite, got {}", self.std_ratio),
            ));
        }
        Ok(())
    }
}

/// Values per partial sum when reducing neighbor statistics
const STATS_CHUNK: usize = 4096;

/// Sum of fixed-size chunk sums merged in chunk order, so the result does not
/// depend on the number of worker threads
fn chunked_sum(values: &[f64]) -> f64 {
    values
        .par_chunks(STATS_CHUNK)
        .map(|chunk| chunk.iter().sum::<f64>())
        .collect::<Vec<f64>>()
        .iter()
        .sum()
}

/// Mean distance from every point to its `k` nearest other points.
///
/// The zero-distance self match is dropped from each neighborhood.
pub fn mean_neighbor_distances(points: &[Point3d], k: usize) -> Result<Vec<f64>> {
    let tree = KdTree::new(points)?;
    Ok(points
        .par_iter()
        .map(|p| {
            let neighbors = tree.find_k_nearest(p, k + 1);
            let others = &neighbors[1.min(neighbors.len())..];
            if others.is_empty() {
                0.0
            } else {
                others.iter().map(|(_, d)| d).sum::<f64>() / others.len() as f64
            }
        })
        .collect())
}

/// Statistical outlier removal filter
///
/// For each point computes the mean distance to its `k_neighbors` nearest
/// neighbors, then removes every point whose mean exceeds
/// `mean + std_ratio * std_dev` of those means (sample standard deviation).
/// When the cloud has `k_neighbors` points or fewer, `k` is clamped to
/// `n - 1`.
///
/// # Arguments
/// * `cloud` - Input point cloud
/// * `k_neighbors` - Number of nearest neighbors to consider for each point
/// * `std_ratio` - Standard deviation multiplier for outlier detection
///
/// # Returns
/// * `Result<(PointCloud, OutlierPartition)>` - Filtered cloud and the
///   retained/removed index partition of the input
///
/// # Example
/// ```rust
/// use densemesh_core::{PointCloud, Point3d};
/// use densemesh_algorithms::statistical_outlier_removal;
///
/// fn main() -> densemesh_core::Result<()> {
///     let mut points: Vec<Point3d> = (0..100)
///         .map(|i| Point3d::new((i % 10) as f64 * 0.1, (i / 10) as f64 * 0.1, 0.0))
///         .collect();
///     points.push(Point3d::new(10.0, 10.0, 10.0));
///     let cloud = PointCloud::from_points(points);
///
///     let (filtered, partition) = statistical_outlier_removal(&cloud, 8, 2.0)?;
///     assert_eq!(partition.outliers, vec![100]);
///     assert_eq!(filtered.len(), 100);
///     Ok(())
/// }
/// ```
pub fn statistical_outlier_removal(
    cloud: &PointCloud,
    k_neighbors: usize,
    std_ratio: f64,
) -> Result<(PointCloud, OutlierPartition)> {
    OutlierConfig {
        nb_neighbors: k_neighbors,
        std_ratio,
    }
    .validate()?;
    if cloud.len() < 2 {
        return Err(Error::InsufficientPoints {
            required: 2,
            available: cloud.len(),
        });
    }
    cloud.validate()?;

    let k = if k_neighbors >= cloud.len() {
        warn!(
            "nb_neighbors {} exceeds cloud size {}, clamping to {}",
            k_neighbors,
            cloud.len(),
            cloud.len() - 1
        );
        cloud.len() - 1
    } else {
        k_neighbors
    };

    let mean_distances = mean_neighbor_distances(&cloud.points, k)?;

    let n = mean_distances.len() as f64;
    let mean = chunked_sum(&mean_distances) / n;
    let squared_deviations: Vec<f64> = mean_distances.par_iter().map(|d| (d - mean).powi(2)).collect();
    let variance = chunked_sum(&squared_deviations) / (n - 1.0);
    let threshold = mean + std_ratio * variance.sqrt();
    debug!(
        "Neighbor distance mean {:.6}, std {:.6}, threshold {:.6}",
        mean,
        variance.sqrt(),
        threshold
    );

    let mut partition = OutlierPartition::default();
    for (i, d) in mean_distances.iter().enumerate() {
        if *d <= threshold {
            partition.inliers.push(i);
        } else {
            partition.outliers.push(i);
        }
    }
    let filtered = cloud.select_by_index(&partition.inliers)?;

    info!(
        "Statistical outlier removal (k={}, ratio={}): kept {} of {} points",
        k,
        std_ratio,
        filtered.len(),
        cloud.len()
    );
    Ok((filtered, partition))
}

/// Statistical outlier filter holding its configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutlierFilter {
    config: OutlierConfig,
}

impl OutlierFilter {
    pub fn new(config: OutlierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OutlierConfig {
        &self.config
    }

    pub fn apply(&self, cloud: &PointCloud) -> Result<(PointCloud, OutlierPartition)> {
        statistical_outlier_removal(cloud, self.config.nb_neighbors, self.config.std_ratio)
    }
}
