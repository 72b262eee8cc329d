//! End-to-end reconstruction pipeline
//!
//! Downsampling, outlier removal, optional normal estimation, surface fitting,
//! density pruning and topology cleanup, run in that order on a thread pool
//! owned by the pipeline.
//!
//! A [`PipelineConfig`] can be loaded from TOML or JSON:
//!
//! ```toml
//! voxel_size = 0.01
//! density_quantile = 0.01
//!
//! [outlier]
//! nb_neighbors = 20
//! std_ratio = 2.0
//!
//! [poisson]
//! depth = 8
//! scale = 1.1
//! ```

use crate::cleanup::{CleanupConfig, CleanupReport, TopologyCleaner};
use crate::parallel::ThreadPoolConfig;
use crate::poisson::{PoissonConfig, SurfaceFitter};
use crate::pruning::DensityPruner;
use densemesh_algorithms::{
    estimate_normals, NormalOrientation, OutlierConfig, OutlierFilter, OutlierPartition,
    SpatialDownsampler,
};
use densemesh_core::{Error, MeshStatistics, PointCloud, Result, TriangleMesh};
use itertools::Itertools;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span};

/// Where the normals used by the surface fitter come from
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub enum NormalSource {
    /// The input cloud must carry normals
    #[default]
    Require,
    /// Estimate normals from `k` nearest neighbors after filtering when the
    /// input cloud has none; input normals are kept as they are
    Estimate {
        k: usize,
        orientation: NormalOrientation,
    },
}

/// Configuration of every pipeline stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Voxel edge length for downsampling (default: 0.002)
    pub voxel_size: f64,
    pub outlier: OutlierConfig,
    pub normals: NormalSource,
    pub poisson: PoissonConfig,
    /// Density quantile below which vertices are pruned (default: 0.01)
    pub density_quantile: f64,
    pub cleanup: CleanupConfig,
    pub threads: ThreadPoolConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            voxel_size: 0.002,
            outlier: OutlierConfig::default(),
            normals: NormalSource::default(),
            poisson: PoissonConfig::default(),
            density_quantile: 0.01,
            cleanup: CleanupConfig::default(),
            threads: ThreadPoolConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn with_voxel_size(mut self, voxel_size: f64) -> Self {
        self.voxel_size = voxel_size;
        self
    }

    pub fn with_outlier(mut self, outlier: OutlierConfig) -> Self {
        self.outlier = outlier;
        self
    }

    pub fn with_normals(mut self, normals: NormalSource) -> Self {
        self.normals = normals;
        self
    }

    pub fn with_poisson(mut self, poisson: PoissonConfig) -> Self {
        self.poisson = poisson;
        self
    }

    pub fn with_density_quantile(mut self, quantile: f64) -> Self {
        self.density_quantile = quantile;
        self
    }

    pub fn with_cleanup(mut self, cleanup: CleanupConfig) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn with_threads(mut self, threads: ThreadPoolConfig) -> Self {
        self.threads = threads;
        self
    }

    /// Check every stage's parameters
    pub fn validate(&self) -> Result<()> {
        if !(self.voxel_size.is_finite() && self.voxel_size > 0.0) {
            return Err(Error::invalid_parameter(
                "voxel_size",
                format!("must be positive and finite, got {}", self.voxel_size),
            ));
        }
        self.outlier.validate()?;
        if let NormalSource::Estimate { k, .. } = self.normals {
            if k < 3 {
                return Err(Error::invalid_parameter(
                    "normals.k",
                    format!("must be at least 3, got {}", k),
                ));
            }
        }
        self.poisson.validate()?;
        if !(0.0..=1.0).contains(&self.density_quantile) {
            return Err(Error::invalid_parameter(
                "density_quantile",
                format!("must be in [0, 1], got {}", self.density_quantile),
            ));
        }
        self.cleanup.validate()?;
        self.threads.validate()
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load a `.toml` or `.json` configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("toml") => Self::from_toml(&std::fs::read_to_string(path)?),
            Some("json") => Self::from_json(&std::fs::read_to_string(path)?),
            _ => Err(Error::UnsupportedFormat(format!(
                "configuration file {} must end in .toml or .json",
                path.display()
            ))),
        }
    }
}

/// Timing and size of one pipeline stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    /// Points or vertices entering the stage
    pub input_count: usize,
    /// Points or vertices leaving the stage
    pub output_count: usize,
    pub elapsed: Duration,
}

/// Read-only byproducts of a pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Inliers and outliers, as indices into the downsampled cloud
    pub partition: OutlierPartition,
    /// Density per vertex of the surface before pruning
    pub densities: Vec<f64>,
    pub stages: Vec<StageReport>,
    pub cleanup: CleanupReport,
    /// Topology of the final mesh
    pub statistics: MeshStatistics,
}

/// Final mesh and diagnostics
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    pub mesh: TriangleMesh,
    pub diagnostics: Diagnostics,
}

/// Run `f` as a named stage, recording its report
fn run_stage<T>(
    stages: &mut Vec<StageReport>,
    name: &str,
    input_count: usize,
    f: impl FnOnce() -> Result<T>,
    output_count: impl Fn(&T) -> usize,
) -> Result<T> {
    let _span = info_span!("stage", name).entered();
    let start = Instant::now();
    let output = f()?;
    stages.push(StageReport {
        name: name.to_string(),
        input_count,
        output_count: output_count(&output),
        elapsed: start.elapsed(),
    });
    Ok(output)
}

/// The photogrammetry reconstruction pipeline
pub struct ReconstructionPipeline {
    config: PipelineConfig,
    pool: ThreadPool,
}

impl ReconstructionPipeline {
    /// Validate `config` and build the thread pool it describes
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let pool = config.threads.build_pool()?;
        Ok(Self { config, pool })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run every stage on `cloud`
    pub fn run(&self, cloud: PointCloud) -> Result<PipelineOutput> {
        self.pool.install(|| self.run_stages(cloud))
    }

    fn run_stages(&self, cloud: PointCloud) -> Result<PipelineOutput> {
        let start = Instant::now();
        let config = &self.config;
        let mut stages = Vec::new();

        if config.normals == NormalSource::Require && !cloud.has_normals() {
            return Err(Error::InvalidData(
                "input cloud has no normals; provide them or enable normal estimation".to_string(),
            ));
        }

        let downsampled = run_stage(
            &mut stages,
            "downsample",
            cloud.len(),
            || SpatialDownsampler::new(config.voxel_size).apply(&cloud),
            PointCloud::len,
        )?;
        drop(cloud);

        let (mut filtered, partition) = run_stage(
            &mut stages,
            "outlier_filter",
            downsampled.len(),
            || OutlierFilter::new(config.outlier).apply(&downsampled),
            |(filtered, _)| filtered.len(),
        )?;
        drop(downsampled);

        if let NormalSource::Estimate { k, orientation } = config.normals {
            if filtered.has_normals() {
                debug!("Input cloud carries normals, skipping normal estimation");
            } else {
                filtered = run_stage(
                    &mut stages,
                    "normal_estimation",
                    filtered.len(),
                    || {
                        estimate_normals(&mut filtered, k, orientation)?;
                        Ok(filtered)
                    },
                    PointCloud::len,
                )?;
            }
        }

        let surface = run_stage(
            &mut stages,
            "surface_fit",
            filtered.len(),
            || SurfaceFitter::new(config.poisson.clone()).apply(&filtered),
            |surface| surface.mesh.vertex_count(),
        )?;
        drop(filtered);

        let densities = surface.densities.clone();
        let pruned = run_stage(
            &mut stages,
            "density_prune",
            surface.mesh.vertex_count(),
            || DensityPruner::new(config.density_quantile).apply(surface),
            TriangleMesh::vertex_count,
        )?;

        let (mesh, cleanup) = run_stage(
            &mut stages,
            "topology_cleanup",
            pruned.vertex_count(),
            || TopologyCleaner::new(config.cleanup.clone()).apply(pruned),
            |(mesh, _)| mesh.vertex_count(),
        )?;

        let statistics = mesh.statistics(config.cleanup.degenerate_area_tolerance);
        info!(
            "Pipeline finished in {:.2?}: {} vertices, {} faces, watertight: {} [{}]",
            start.elapsed(),
            statistics.vertex_count,
            statistics.face_count,
            statistics.is_watertight(),
            stages
                .iter()
                .map(|s| format!("{} {:.2?}", s.name, s.elapsed))
                .join(", ")
        );

        Ok(PipelineOutput {
            mesh,
            diagnostics: Diagnostics {
                partition,
                densities,
                stages,
                cleanup,
                statistics,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use densemesh_core::{Point3d, Vector3d};
    use std::io::Write;

    fn sphere_cloud(n: usize, with_normals: bool) -> PointCloud {
        let golden = std::f64::consts::PI * (3.0 - 5.0_f64.sqrt());
        let normals: Vec<Vector3d> = (0..n)
            .map(|i| {
                let y = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
                let r = (1.0 - y * y).sqrt();
                let theta = golden * i as f64;
                Vector3d::new(r * theta.cos(), y, r * theta.sin())
            })
            .collect();
        let cloud = PointCloud::from_points(normals.iter().map(|n| Point3d::from(*n)).collect());
        if with_normals {
            cloud.with_normals(normals).unwrap()
        } else {
            cloud
        }
    }

    fn small_config() -> PipelineConfig {
        PipelineConfig::default()
            .with_voxel_size(0.01)
            .with_outlier(OutlierConfig {
                nb_neighbors: 10,
                std_ratio: 3.0,
            })
            .with_poisson(PoissonConfig::default().with_depth(5))
    }

    #[test]
    fn test_pipeline_config_default() {
        let config = PipelineConfig::default();
        assert_eq!(config.voxel_size, 0.002);
        assert_eq!(config.outlier.nb_neighbors, 200);
        assert_eq!(config.outlier.std_ratio, 2.0);
        assert_eq!(config.poisson.depth, 8);
        assert_eq!(config.density_quantile, 0.01);
        assert_eq!(config.normals, NormalSource::Require);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pipeline_config_validation() {
        assert!(PipelineConfig::default().with_voxel_size(0.0).validate().is_err());
        assert!(PipelineConfig::default().with_density_quantile(1.5).validate().is_err());
        let estimate = NormalSource::Estimate {
            k: 2,
            orientation: NormalOrientation::AwayFromCentroid,
        };
        assert!(PipelineConfig::default().with_normals(estimate).validate().is_err());
        let threads = ThreadPoolConfig::default().with_threads(0);
        assert!(ReconstructionPipeline::new(PipelineConfig::default().with_threads(threads)).is_err());
    }

    #[test]
    fn test_pipeline_config_toml_roundtrip() {
        let config = small_config().with_normals(NormalSource::Estimate {
            k: 12,
            orientation: NormalOrientation::TowardViewpoint(Point3d::new(0.0, 0.0, 5.0)),
        });
        let toml_str = config.to_toml().unwrap();
        assert_eq!(PipelineConfig::from_toml(&toml_str).unwrap(), config);
    }

    #[test]
    fn test_pipeline_config_json_roundtrip() {
        let config = small_config().with_density_quantile(0.05);
        let json_str = config.to_json().unwrap();
        assert_eq!(PipelineConfig::from_json(&json_str).unwrap(), config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = PipelineConfig::from_toml(
            "voxel_size = 0.01\n\n[outlier]\nnb_neighbors = 20\n\n[poisson]\ndepth = 7\n",
        )
        .unwrap();
        assert_eq!(config.voxel_size, 0.01);
        assert_eq!(config.outlier.nb_neighbors, 20);
        assert_eq!(config.outlier.std_ratio, 2.0);
        assert_eq!(config.poisson.depth, 7);
        assert_eq!(config.poisson.scale, 1.1);

        assert!(matches!(
            PipelineConfig::from_toml("voxel_size = \"big\""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(small_config().to_json().unwrap().as_bytes()).unwrap();
        assert_eq!(PipelineConfig::from_file(&path).unwrap(), small_config());

        let yaml = dir.path().join("pipeline.yaml");
        std::fs::write(&yaml, "voxel_size: 1").unwrap();
        assert!(matches!(
            PipelineConfig::from_file(&yaml),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_pipeline_requires_normals() {
        let pipeline = ReconstructionPipeline::new(small_config()).unwrap();
        assert!(matches!(
            pipeline.run(sphere_cloud(500, false)),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn test_pipeline_sphere() {
        let pipeline = ReconstructionPipeline::new(small_config()).unwrap();
        let output = pipeline.run(sphere_cloud(3000, true)).unwrap();

        let names: Vec<&str> = output.diagnostics.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["downsample", "outlier_filter", "surface_fit", "density_prune", "topology_cleanup"]
        );
        let stats = output.diagnostics.statistics;
        assert!(stats.is_edge_manifold());
        assert_eq!(stats.unreferenced_vertices, 0);
        assert_eq!(output.diagnostics.partition.len(), output.diagnostics.stages[1].input_count);
        assert!(output.diagnostics.densities.len() >= output.mesh.vertex_count());
        for v in &output.mesh.vertices {
            assert!((v.coords.norm() - 1.0).abs() < 0.05);
        }
    }

    #[test]
    fn test_pipeline_estimates_normals() {
        let config = small_config().with_normals(NormalSource::Estimate {
            k: 12,
            orientation: NormalOrientation::AwayFromCentroid,
        });
        let pipeline = ReconstructionPipeline::new(config).unwrap();
        let output = pipeline.run(sphere_cloud(3000, false)).unwrap();
        assert!(output
            .diagnostics
            .stages
            .iter()
            .any(|s| s.name == "normal_estimation"));
        assert!(output.diagnostics.statistics.is_edge_manifold());
        let normals = output.mesh.normals.as_ref().unwrap();
        let outward = output
            .mesh
            .vertices
            .iter()
            .zip(normals)
            .filter(|(v, n)| n.dot(&v.coords) > 0.0)
            .count();
        assert!(outward as f64 > 0.99 * output.mesh.vertex_count() as f64);
    }

    #[test]
    fn test_estimation_keeps_input_normals() {
        let estimate = small_config().with_normals(NormalSource::Estimate {
            k: 12,
            orientation: NormalOrientation::AwayFromCentroid,
        });
        let cloud = sphere_cloud(2000, true);
        let required = ReconstructionPipeline::new(small_config())
            .unwrap()
            .run(cloud.clone())
            .unwrap();
        let estimated = ReconstructionPipeline::new(estimate).unwrap().run(cloud).unwrap();

        assert!(estimated
            .diagnostics
            .stages
            .iter()
            .all(|s| s.name != "normal_estimation"));
        assert_eq!(estimated.mesh, required.mesh);
        assert_eq!(estimated.diagnostics.densities, required.diagnostics.densities);
    }

    #[test]
    fn test_pipeline_is_deterministic_across_thread_counts() {
        let run = |threads: usize| {
            let config = small_config().with_threads(ThreadPoolConfig::default().with_threads(threads));
            ReconstructionPipeline::new(config)
                .unwrap()
                .run(sphere_cloud(2000, true))
                .unwrap()
        };
        let a = run(1);
        let b = run(4);
        assert_eq!(a.mesh, b.mesh);
        assert_eq!(a.diagnostics.densities, b.diagnostics.densities);
        assert_eq!(a.diagnostics.partition, b.diagnostics.partition);
    }
}
