//! densemesh: turn a photogrammetry point cloud into a watertight mesh.
//!
//! # Logging
//!
//! Set the `RUST_LOG` environment variable to control log output, or pass
//! `-v` (stage summaries) / `-vv` (solver progress) / `-vvv` (everything):
//!
//! ```bash
//! RUST_LOG=densemesh_reconstruction=debug densemesh scan.ply -o mesh.ply
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use densemesh_algorithms::NormalOrientation;
use densemesh_core::Point3d;
use densemesh_reconstruction::{NormalSource, PipelineConfig, PipelineOutput, ReconstructionPipeline};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// densemesh - Watertight mesh reconstruction from dense point clouds.
///
/// Downsamples, filters outliers, fits a Poisson surface, prunes poorly
/// supported regions and repairs the topology of the result.
#[derive(Parser, Debug)]
#[command(name = "densemesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input point cloud (.ply)
    input: PathBuf,

    /// Output mesh (.ply or .stl)
    #[arg(short, long)]
    output: PathBuf,

    /// Additionally write the mesh as binary STL
    #[arg(long)]
    stl: Option<PathBuf>,

    /// Pipeline configuration file (.toml or .json); flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Voxel edge length for downsampling
    #[arg(long)]
    voxel_size: Option<f64>,

    /// Neighbors used by the statistical outlier filter
    #[arg(long)]
    nb_neighbors: Option<usize>,

    /// Standard deviation multiplier of the outlier filter
    #[arg(long)]
    std_ratio: Option<f64>,

    /// Maximum octree depth of the surface fit
    #[arg(long)]
    depth: Option<u32>,

    /// Expansion of the bounding cube around the samples (>= 1.0)
    #[arg(long)]
    scale: Option<f64>,

    /// Density quantile below which vertices are pruned
    #[arg(long)]
    density_quantile: Option<f64>,

    /// Estimate normals from this many neighbors instead of reading them
    #[arg(long, value_name = "K")]
    estimate_normals: Option<usize>,

    /// Orient estimated normals toward this point instead of away from the centroid
    #[arg(long, num_args = 3, value_names = ["X", "Y", "Z"], allow_negative_numbers = true, requires = "estimate_normals")]
    viewpoint: Option<Vec<f64>>,

    /// Worker threads (defaults to one per core)
    #[arg(long)]
    threads: Option<usize>,

    /// Suppress all non-error output
    #[arg(long, short)]
    quiet: bool,

    /// Increase output verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Initialize the tracing subscriber based on verbosity level.
fn init_tracing(verbose: u8, quiet: bool) {
    if quiet {
        return;
    }

    // RUST_LOG wins over -v
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match verbose {
            0 => "warn",
            1 => "densemesh=info,densemesh_algorithms=info,densemesh_io=info,densemesh_reconstruction=info",
            2 => "densemesh=debug,densemesh_algorithms=debug,densemesh_io=debug,densemesh_reconstruction=debug",
            _ => "trace",
        };
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(filter)
        .init();
}

/// Load the configuration file, if any, and apply flag overrides
fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    if let Some(voxel_size) = cli.voxel_size {
        config.voxel_size = voxel_size;
    }
    if let Some(k) = cli.nb_neighbors {
        config.outlier.nb_neighbors = k;
    }
    if let Some(ratio) = cli.std_ratio {
        config.outlier.std_ratio = ratio;
    }
    if let Some(depth) = cli.depth {
        config.poisson.depth = depth;
    }
    if let Some(scale) = cli.scale {
        config.poisson.scale = scale;
    }
    if let Some(q) = cli.density_quantile {
        config.density_quantile = q;
    }
    if let Some(k) = cli.estimate_normals {
        let orientation = match cli.viewpoint.as_deref() {
            Some([x, y, z]) => NormalOrientation::TowardViewpoint(Point3d::new(*x, *y, *z)),
            _ => NormalOrientation::AwayFromCentroid,
        };
        config.normals = NormalSource::Estimate { k, orientation };
    }
    if let Some(threads) = cli.threads {
        config.threads = config.threads.with_threads(threads);
    }

    config.validate().context("invalid pipeline configuration")?;
    Ok(config)
}

fn print_summary(output: &PipelineOutput) {
    let diagnostics = &output.diagnostics;
    for stage in &diagnostics.stages {
        println!(
            "{:<18} {:>10} -> {:>10}  {:>10.2?}",
            stage.name, stage.input_count, stage.output_count, stage.elapsed
        );
    }
    let stats = &diagnostics.statistics;
    println!(
        "outliers removed: {}, cleanup: {} merged vertices, {} degenerate, {} duplicate, {} non-manifold faces",
        diagnostics.partition.outliers.len(),
        diagnostics.cleanup.merged_vertices,
        diagnostics.cleanup.degenerate_faces,
        diagnostics.cleanup.duplicate_faces,
        diagnostics.cleanup.non_manifold_faces
    );
    println!(
        "mesh: {} vertices, {} faces, {} boundary edges, watertight: {}",
        stats.vertex_count,
        stats.face_count,
        stats.boundary_edges,
        stats.is_watertight()
    );
}

fn run(cli: &Cli) -> Result<PipelineOutput> {
    let config = build_config(cli)?;
    let pipeline = ReconstructionPipeline::new(config).context("failed to set up the pipeline")?;

    let cloud = densemesh_io::read_point_cloud(&cli.input)
        .with_context(|| format!("failed to read point cloud {}", cli.input.display()))?;
    info!("Loaded {} points from {}", cloud.len(), cli.input.display());

    let output = pipeline.run(cloud).context("reconstruction failed")?;

    densemesh_io::write_mesh(&output.mesh, &cli.output)
        .with_context(|| format!("failed to write mesh {}", cli.output.display()))?;
    if let Some(stl) = &cli.stl {
        densemesh_io::write_mesh(&output.mesh, stl)
            .with_context(|| format!("failed to write mesh {}", stl.display()))?;
    }
    Ok(output)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let output = run(&cli)?;
    if !cli.quiet {
        print_summary(&output);
    }
    Ok(())
}
