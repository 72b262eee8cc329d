//! Integration tests for densemesh-reconstruction
//!
//! These tests run the surface fitter and the full pipeline on synthetic
//! clouds with known geometry and check the resulting meshes.

use densemesh_algorithms::{OutlierConfig, OutlierFilter, SpatialDownsampler};
use densemesh_core::{Error, Point3d, PointCloud, Vector3d};
use densemesh_reconstruction::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Fibonacci sphere with outward normals
fn create_sphere_with_normals(radius: f64, num_points: usize) -> PointCloud {
    let golden_angle = std::f64::consts::PI * (3.0 - 5.0_f64.sqrt());
    let mut points = Vec::with_capacity(num_points);
    let mut normals = Vec::with_capacity(num_points);

    for i in 0..num_points {
        let y = 1.0 - 2.0 * (i as f64 + 0.5) / num_points as f64;
        let r = (1.0 - y * y).sqrt();
        let theta = golden_angle * i as f64;
        let normal = Vector3d::new(r * theta.cos(), y, r * theta.sin());
        points.push(Point3d::from(normal * radius));
        normals.push(normal);
    }

    PointCloud::from_points(points).with_normals(normals).unwrap()
}

/// Uniform random samples on the surface of the unit cube `[0, 1]^3`
fn create_cube_surface(num_points: usize, seed: u64) -> PointCloud {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut points = Vec::with_capacity(num_points);
    let mut normals = Vec::with_capacity(num_points);

    for _ in 0..num_points {
        let face = rng.gen_range(0..6);
        let axis = face / 2;
        let side = (face % 2) as f64;
        let mut p = [rng.gen::<f64>(), rng.gen::<f64>(), rng.gen::<f64>()];
        p[axis] = side;
        let mut n = [0.0; 3];
        n[axis] = if side > 0.5 { 1.0 } else { -1.0 };
        points.push(Point3d::new(p[0], p[1], p[2]));
        normals.push(Vector3d::new(n[0], n[1], n[2]));
    }

    PointCloud::from_points(points).with_normals(normals).unwrap()
}

/// Distance from `p` to the surface of the unit cube
fn distance_to_unit_cube(p: &Point3d) -> f64 {
    let outside = Vector3d::new(
        (-p.x).max(p.x - 1.0).max(0.0),
        (-p.y).max(p.y - 1.0).max(0.0),
        (-p.z).max(p.z - 1.0).max(0.0),
    );
    if outside.norm() > 0.0 {
        return outside.norm();
    }
    [p.x, 1.0 - p.x, p.y, 1.0 - p.y, p.z, 1.0 - p.z]
        .iter()
        .cloned()
        .fold(f64::INFINITY, f64::min)
}

fn cube_pipeline_config() -> PipelineConfig {
    PipelineConfig::default()
        .with_voxel_size(0.01)
        .with_outlier(OutlierConfig {
            nb_neighbors: 20,
            std_ratio: 2.0,
        })
        .with_poisson(PoissonConfig::default().with_depth(8).with_scale(1.0))
        .with_density_quantile(0.01)
}

#[test]
fn test_sphere_radius_within_one_percent() {
    let cloud = create_sphere_with_normals(1.0, 4000);
    let config = PoissonConfig::default().with_depth(6);
    let result = poisson_reconstruction(&cloud, &config).unwrap();

    assert!(result.mesh.face_count() > 1000);
    assert_eq!(result.densities.len(), result.mesh.vertex_count());
    for v in &result.mesh.vertices {
        let r = v.coords.norm();
        assert!((r - 1.0).abs() < 0.01, "vertex at radius {}", r);
    }
    assert!(result.mesh.statistics(0.0).is_watertight());
}

#[test]
fn test_cube_end_to_end() {
    let cloud = create_cube_surface(10_000, 7);
    let pipeline = ReconstructionPipeline::new(cube_pipeline_config()).unwrap();
    let output = pipeline.run(cloud).unwrap();
    let mesh = &output.mesh;

    let stats = output.diagnostics.statistics;
    assert!(stats.is_edge_manifold());
    assert_eq!(stats.unreferenced_vertices, 0);
    assert_eq!(stats.degenerate_faces, 0);
    assert!(
        (10_000..2_000_000).contains(&mesh.face_count()),
        "{} faces",
        mesh.face_count()
    );
    // Only the lowest-density percent of vertices was pruned
    assert!(stats.boundary_edges < mesh.face_count() / 10);

    let max_distance = mesh
        .vertices
        .iter()
        .map(distance_to_unit_cube)
        .fold(0.0, f64::max);
    assert!(max_distance < 0.05, "vertex {} away from the cube", max_distance);

    assert!(mesh.validate().is_ok());
    assert_eq!(mesh.normals.as_ref().map(Vec::len), Some(mesh.vertex_count()));
    assert_eq!(mesh.face_normals.as_ref().map(Vec::len), Some(mesh.face_count()));
}

#[test]
fn test_cube_surface_fit_is_closed_before_pruning() {
    let config = cube_pipeline_config();
    let cloud = create_cube_surface(10_000, 7);
    let downsampled = SpatialDownsampler::new(config.voxel_size).apply(&cloud).unwrap();
    let (filtered, _) = OutlierFilter::new(config.outlier).apply(&downsampled).unwrap();
    let surface = SurfaceFitter::new(config.poisson.clone()).apply(&filtered).unwrap();

    let stats = surface.mesh.statistics(0.0);
    assert_eq!(stats.boundary_edges, 0);
    assert_eq!(stats.non_manifold_edges, 0);
    assert!(stats.is_watertight());
    assert_eq!(surface.densities.len(), surface.mesh.vertex_count());
}

#[test]
fn test_pruner_extremes_on_reconstruction() {
    let cloud = create_sphere_with_normals(1.0, 2000);
    let surface = poisson_reconstruction(&cloud, &PoissonConfig::default().with_depth(5)).unwrap();

    let untouched = DensityPruner::new(0.0).apply(surface.clone()).unwrap();
    assert_eq!(untouched, surface.mesh);

    let vertex_count = surface.mesh.vertex_count();
    match DensityPruner::new(0.999).apply(surface) {
        Ok(mesh) => assert!(mesh.vertex_count() * 50 < vertex_count),
        Err(e) => assert!(matches!(e, Error::EmptyMesh(_))),
    }
}

#[test]
fn test_cleaner_is_idempotent_on_reconstruction() {
    let cloud = create_sphere_with_normals(1.0, 2000);
    let surface = poisson_reconstruction(&cloud, &PoissonConfig::default().with_depth(5)).unwrap();
    let pruned = DensityPruner::new(0.05).apply(surface).unwrap();

    let cleaner = TopologyCleaner::default();
    let (once, _) = cleaner.apply(pruned).unwrap();
    let (twice, report) = cleaner.apply(once.clone()).unwrap();
    assert_eq!(once, twice);
    assert!(report.is_clean());

    let stats = twice.statistics(0.0);
    assert!(stats.is_edge_manifold());
    assert_eq!(stats.unreferenced_vertices, 0);
    assert_eq!(stats.degenerate_faces, 0);
}

#[test]
fn test_outlier_partition_in_pipeline() {
    let mut cloud = create_sphere_with_normals(1.0, 3000);
    let mut normals = cloud.normals.take().unwrap();
    for i in 0..5 {
        let far = Point3d::new(5.0 + i as f64, -4.0, 3.0);
        cloud.points.push(far);
        normals.push(Vector3d::x());
    }
    cloud.set_normals(normals).unwrap();

    let config = PipelineConfig::default()
        .with_voxel_size(0.01)
        .with_outlier(OutlierConfig {
            nb_neighbors: 10,
            std_ratio: 2.0,
        })
        .with_poisson(PoissonConfig::default().with_depth(5));
    let output = ReconstructionPipeline::new(config).unwrap().run(cloud).unwrap();
    let partition = &output.diagnostics.partition;

    let mut all: Vec<usize> = partition
        .inliers
        .iter()
        .chain(&partition.outliers)
        .cloned()
        .collect();
    all.sort_unstable();
    assert_eq!(all, (0..3005).collect::<Vec<_>>());
    for i in 3000..3005 {
        assert!(partition.outliers.contains(&i));
    }
    for v in &output.mesh.vertices {
        assert!(v.coords.norm() < 1.1);
    }
}

#[test]
fn test_too_few_points() {
    let cloud = create_sphere_with_normals(1.0, 5);
    let result = poisson_reconstruction(&cloud, &PoissonConfig::default());
    assert!(matches!(result, Err(Error::InsufficientPoints { .. })));
}
