//! Poisson surface reconstruction
//!
//! Solves for an indicator function whose gradient matches the splatted
//! normal field, level by level from a dense coarse grid to sparse bands
//! around the surface, then polygonizes its isosurface.
//!
//! Each level uses trilinear finite elements on the lattice of its active
//! cells. The coarser solution is prolonged to warm-start the next level and
//! to prescribe values on the band boundary. Densities are the splatted sample
//! weights summed over levels, so vertices far from any sample get low values.

use crate::grid::{trilinear_weights, LevelGrid, NodeState, CELL_CORNERS, STENCIL};
use crate::marching_cubes::{LatticeField, MarchingCubes, MarchingCubesConfig};
use crate::octree::{Domain, Octree, MAX_DEPTH};
use crate::parallel::{deterministic_sum, parallel_map};
use crate::solver::{conjugate_gradient, LinearOperator, SolverSettings};
use densemesh_core::{
    DensityMesh, Error, Matrix3, Point3d, PointCloud, Result, Vector3d,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Fewest samples accepted by the reconstruction
pub const MIN_SAMPLES: usize = 10;

/// Deepest dense base level; finer levels are sparse bands
pub const MAX_BASE_DEPTH: u32 = 8;

/// Widest normal kernel, as a power of two of the level's cell width
const MAX_KERNEL_SPREAD: u32 = 3;

/// 1D element integrals of linear hats at offsets -1, 0, 1 (unit spacing)
const MASS_1D: [f64; 3] = [1.0 / 6.0, 2.0 / 3.0, 1.0 / 6.0];
const STIFFNESS_1D: [f64; 3] = [-1.0, 2.0, -1.0];
const GRADIENT_1D: [f64; 3] = [0.5, 0.0, -0.5];

/// Configuration parameters for Poisson reconstruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoissonConfig {
    /// Maximum octree depth (default: 8)
    pub depth: u32,
    /// Ratio between the reconstruction cube and the sample bounding cube
    /// (default: 1.1)
    pub scale: f64,
    /// Depth of the dense coarsest level (default: 5)
    pub base_depth: u32,
    /// Minimum samples in a node for the normal field to be resolved at that
    /// node's depth (default: 1.5)
    pub samples_per_node: f64,
    /// Conjugate gradient termination per level
    pub solver: SolverSettings,
}

impl Default for PoissonConfig {
    fn default() -> Self {
        Self {
            depth: 8,
            scale: 1.1,
            base_depth: 5,
            samples_per_node: 1.5,
            solver: SolverSettings::default(),
        }
    }
}

impl PoissonConfig {
    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_solver(mut self, solver: SolverSettings) -> Self {
        self.solver = solver;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(2..=MAX_DEPTH).contains(&self.depth) {
            return Err(Error::invalid_parameter(
                "depth",
                format!("must be in 2..={}, got {}", MAX_DEPTH, self.depth),
            ));
        }
        if !(self.scale.is_finite() && self.scale >= 1.0) {
            return Err(Error::invalid_parameter(
                "scale",
                format!("must be finite and at least 1.0, got {}", self.scale),
            ));
        }
        if !(2..=MAX_BASE_DEPTH).contains(&self.base_depth) {
            return Err(Error::invalid_parameter(
                "base_depth",
                format!("must be in 2..={}, got {}", MAX_BASE_DEPTH, self.base_depth),
            ));
        }
        if !(self.samples_per_node.is_finite() && self.samples_per_node > 0.0) {
            return Err(Error::invalid_parameter(
                "samples_per_node",
                format!("must be positive, got {}", self.samples_per_node),
            ));
        }
        if self.solver.max_iterations == 0 {
            return Err(Error::invalid_parameter(
                "solver.max_iterations",
                "must be at least 1",
            ));
        }
        if !(self.solver.tolerance.is_finite() && self.solver.tolerance > 0.0) {
            return Err(Error::invalid_parameter(
                "solver.tolerance",
                format!("must be positive, got {}", self.solver.tolerance),
            ));
        }
        Ok(())
    }
}

/// Unit-spacing stiffness and divergence stencils of the trilinear basis
struct Stencils {
    stiffness: [f64; 27],
    divergence: [Vector3d; 27],
}

impl Stencils {
    fn trilinear() -> Self {
        let idx = |o: &[i32; 3]| o.map(|v| (v + 1) as usize);
        Self {
            stiffness: STENCIL.map(|o| {
                let [x, y, z] = idx(&o);
                STIFFNESS_1D[x] * MASS_1D[y] * MASS_1D[z]
                    + MASS_1D[x] * STIFFNESS_1D[y] * MASS_1D[z]
                    + MASS_1D[x] * MASS_1D[y] * STIFFNESS_1D[z]
            }),
            divergence: STENCIL.map(|o| {
                let [x, y, z] = idx(&o);
                Vector3d::new(
                    GRADIENT_1D[x] * MASS_1D[y] * MASS_1D[z],
                    MASS_1D[x] * GRADIENT_1D[y] * MASS_1D[z],
                    MASS_1D[x] * MASS_1D[y] * GRADIENT_1D[z],
                )
            }),
        }
    }
}

/// Stiffness matrix restricted to the free nodes of a level
struct StiffnessOperator<'a> {
    grid: &'a LevelGrid,
    stencil: [f64; 27],
}

impl LinearOperator for StiffnessOperator<'_> {
    fn dim(&self) -> usize {
        self.grid.free_slots().len()
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        let free = self.grid.free_slots();
        y.par_iter_mut().enumerate().for_each(|(i, yi)| {
            let slot = free[i] as usize;
            let mut acc = 0.0;
            for (o, k) in self.stencil.iter().enumerate() {
                if let Some(j) = self
                    .grid
                    .neighbor(slot, o)
                    .and_then(|n| self.grid.free_index(n))
                {
                    acc += k * x[j];
                }
            }
            *yi = acc;
        });
    }
}

/// Solved indicator function on one octree level
struct Level {
    grid: LevelGrid,
    /// Indicator value per node slot; released once the next level is built
    chi: Vec<f64>,
    /// Splatted sample weight per node slot
    weights: Vec<f64>,
    iso: f64,
}

impl Level {
    fn depth(&self) -> u32 {
        self.grid.depth()
    }

    fn straddles(&self, cell: &[u32; 3]) -> bool {
        let mut below = 0;
        for o in &CELL_CORNERS {
            if let Some(slot) = self.grid.slot([cell[0] + o[0], cell[1] + o[1], cell[2] + o[2]]) {
                if self.chi[slot] < self.iso {
                    below += 1;
                }
            }
        }
        below > 0 && below < 8
    }

    /// Trilinear prolongation of this level's indicator onto a node of the
    /// next finer level
    fn prolong(&self, node: [u32; 3]) -> f64 {
        let taps = node.map(|v| {
            if v % 2 == 0 {
                [(v / 2, 1.0), (v / 2, 0.0)]
            } else {
                [((v - 1) / 2, 0.5), ((v + 1) / 2, 0.5)]
            }
        });
        let mut acc = 0.0;
        for (k, wk) in taps[2] {
            for (j, wj) in taps[1] {
                for (i, wi) in taps[0] {
                    let w = wi * wj * wk;
                    if w != 0.0 {
                        if let Some(slot) = self.grid.slot([i, j, k]) {
                            acc += w * self.chi[slot];
                        }
                    }
                }
            }
        }
        acc
    }
}

/// The finest level seen through the marching cubes interface
struct LevelField<'a> {
    level: &'a Level,
    domain: &'a Domain,
}

impl LatticeField for LevelField<'_> {
    fn cells(&self) -> &[[u32; 3]] {
        self.level.grid.cells()
    }

    fn value(&self, node: [u32; 3]) -> Option<f64> {
        self.level.grid.slot(node).map(|slot| self.level.chi[slot])
    }

    fn position(&self, node: [u32; 3]) -> Point3d {
        let lattice = Vector3d::new(node[0] as f64, node[1] as f64, node[2] as f64);
        self.domain.to_world(&lattice, self.level.depth())
    }
}

/// Nodes within `radius` lattice units of `u` on one axis, with hat weights
/// normalized to unit mass
fn hat_weights(u: f64, radius: f64, max_node: u32) -> Vec<(u32, f64)> {
    let lo = ((u - radius).floor() + 1.0).max(0.0) as u32;
    let hi = ((u + radius).ceil() - 1.0).min(max_node as f64).max(0.0) as u32;
    (lo..=hi)
        .filter_map(|j| {
            let w = 1.0 - (j as f64 - u).abs() / radius;
            (w > 0.0).then_some((j, w / radius))
        })
        .collect()
}

/// Whether the samples span a volume rather than a plane, line or point
fn spans_volume(points: &[Point3d]) -> bool {
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector3d::zeros(), |acc, p| acc + p.coords) / n;
    let mut cov = Matrix3::zeros();
    for p in points {
        let d = p.coords - centroid;
        cov += d * d.transpose();
    }
    let eigenvalues = (cov / n).symmetric_eigenvalues();
    let max = eigenvalues.max();
    max > 0.0 && eigenvalues.min() > 1e-12 * max
}

/// Poisson-style surface fitter producing a mesh with per-vertex densities
#[derive(Debug, Clone, Default)]
pub struct SurfaceFitter {
    config: PoissonConfig,
}

impl SurfaceFitter {
    pub fn new(config: PoissonConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PoissonConfig {
        &self.config
    }

    /// Reconstruct a closed surface from an oriented point cloud.
    ///
    /// The cloud must carry normals. Vertex normals of the result point out
    /// of the reconstructed solid.
    pub fn apply(&self, cloud: &PointCloud) -> Result<DensityMesh> {
        self.config.validate()?;
        if cloud.len() < MIN_SAMPLES {
            return Err(Error::InsufficientPoints {
                required: MIN_SAMPLES,
                available: cloud.len(),
            });
        }
        cloud.validate()?;
        let normals = cloud.normals.as_ref().ok_or_else(|| {
            Error::InvalidData("Poisson reconstruction requires normals".to_string())
        })?;
        if !spans_volume(&cloud.points) {
            return Err(Error::Reconstruction(
                "samples are coplanar, collinear or coincident".to_string(),
            ));
        }

        let depth = self.config.depth;
        let base_depth = self.config.base_depth.min(depth);
        let mut tree = Octree::build(&cloud.points, normals, depth, self.config.scale)?;
        if tree.samples().iter().all(|s| s.normal == Vector3d::zeros()) {
            return Err(Error::Reconstruction(
                "all normals are zero or non-finite".to_string(),
            ));
        }
        tree.assign_support_depths(base_depth, self.config.samples_per_node);
        let domain = *tree.domain();
        let stencils = Stencils::trilinear();

        let mut levels: Vec<Level> = Vec::with_capacity((depth - base_depth + 1) as usize);
        for d in base_depth..=depth {
            let (grid, mut chi) = match levels.last() {
                None => {
                    let grid = LevelGrid::full(d);
                    let chi = vec![0.0; grid.slot_count()];
                    (grid, chi)
                }
                Some(coarse) => {
                    let grid = LevelGrid::from_cells(d, refine_cells(coarse, &tree));
                    let chi = (0..grid.slot_count())
                        .into_par_iter()
                        .map(|slot| match grid.state(slot) {
                            NodeState::Absent => 0.0,
                            _ => coarse.prolong(grid.node(slot)),
                        })
                        .collect();
                    (grid, chi)
                }
            };
            if let Some(coarse) = levels.last_mut() {
                coarse.chi = Vec::new();
            }

            let (field, weights) = splat_samples(&tree, &domain, &grid);
            let h = domain.cell_width(d);
            let rhs = assemble_rhs(&grid, &stencils, &field, &chi, h);
            drop(field);
            if d == base_depth && rhs.iter().all(|v| *v == 0.0) {
                return Err(Error::Reconstruction(
                    "normal field has no divergence; the system is trivial".to_string(),
                ));
            }

            let operator = StiffnessOperator {
                grid: &grid,
                stencil: stencils.stiffness.map(|k| k * h),
            };
            let free = grid.free_slots();
            let mut x: Vec<f64> = free.iter().map(|&s| chi[s as usize]).collect();
            let report = conjugate_gradient(&operator, &rhs, &mut x, &self.config.solver)?;
            for (slot, value) in free.iter().zip(&x) {
                chi[*slot as usize] = *value;
            }
            if chi.iter().any(|v| !v.is_finite()) {
                return Err(Error::Reconstruction(format!(
                    "indicator function is not finite at depth {}",
                    d
                )));
            }

            let at_samples = parallel_map(tree.samples(), |s| {
                grid.interpolate(&chi, &domain.to_lattice(&s.position, d))
            });
            let iso = deterministic_sum(&at_samples) / at_samples.len() as f64;

            debug!(
                "Level {}: {} cells, {} free nodes, {} CG iterations, residual {:.2e}, iso {:.6}",
                d,
                grid.cells().len(),
                free.len(),
                report.iterations,
                report.relative_residual,
                iso
            );
            if !report.converged {
                warn!(
                    "Conjugate gradient stopped at depth {} after {} iterations with residual {:.2e}",
                    d, report.iterations, report.relative_residual
                );
            }

            levels.push(Level {
                grid,
                chi,
                weights,
                iso,
            });
        }

        let finest = levels.last().ok_or_else(|| {
            Error::Reconstruction("no octree level was solved".to_string())
        })?;
        let extractor = MarchingCubes::new(MarchingCubesConfig {
            iso_level: finest.iso,
            compute_normals: true,
        });
        let mesh = extractor.extract_isosurface(&LevelField {
            level: finest,
            domain: &domain,
        })?;

        let densities: Vec<f64> = mesh
            .vertices
            .par_iter()
            .map(|v| {
                levels
                    .iter()
                    .map(|level| {
                        let d = level.depth();
                        let lattice = domain.to_lattice(v, d);
                        level.grid.interpolate(&level.weights, &lattice)
                            * 4f64.powi(d as i32 - depth as i32)
                    })
                    .sum()
            })
            .collect();

        info!(
            "Poisson reconstruction: {} samples, depth {}, {} vertices, {} faces",
            tree.len(),
            depth,
            mesh.vertex_count(),
            mesh.face_count()
        );
        DensityMesh::new(mesh, densities)
    }
}

/// Active cells of the level below `coarse`: children of coarse cells that
/// hold samples or lie within one cell of the coarse isosurface
fn refine_cells(coarse: &Level, tree: &Octree) -> Vec<[u32; 3]> {
    let active: HashSet<[u32; 3]> = coarse.grid.cells().iter().copied().collect();
    let straddling: Vec<[u32; 3]> = coarse
        .grid
        .cells()
        .par_iter()
        .filter(|c| coarse.straddles(c))
        .copied()
        .collect();

    let mut parents: HashSet<[u32; 3]> = tree
        .nodes_at(coarse.depth())
        .into_iter()
        .map(|node| node.cell)
        .collect();
    for cell in &straddling {
        for o in &STENCIL {
            let mut neighbor = [0u32; 3];
            let mut inside = true;
            for a in 0..3 {
                match cell[a].checked_add_signed(o[a]) {
                    Some(v) => neighbor[a] = v,
                    None => inside = false,
                }
            }
            if inside && active.contains(&neighbor) {
                parents.insert(neighbor);
            }
        }
    }

    parents
        .into_iter()
        .flat_map(|p| {
            CELL_CORNERS
                .iter()
                .map(move |o| [2 * p[0] + o[0], 2 * p[1] + o[1], 2 * p[2] + o[2]])
        })
        .collect()
}

/// Splat sample normals and weights onto the nodes of `grid`.
///
/// Returns the normal field and the trilinear sample weight per slot. A
/// sample supported at a coarser depth than the grid is spread with a wider
/// hat, up to `2^MAX_KERNEL_SPREAD` cells. Samples are processed in Morton
/// order.
fn splat_samples(tree: &Octree, domain: &Domain, grid: &LevelGrid) -> (Vec<Vector3d>, Vec<f64>) {
    let depth = grid.depth();
    let h = domain.cell_width(depth);
    let max_node = 1u32 << depth;
    let mass = domain.width * domain.width / tree.len() as f64 / (h * h * h);

    let mut field = vec![Vector3d::zeros(); grid.slot_count()];
    let mut weights = vec![0.0; grid.slot_count()];
    for sample in tree.samples() {
        let u = domain.to_lattice(&sample.position, depth);
        let (base, corner_weights) = trilinear_weights(&u, depth);
        for (o, w) in CELL_CORNERS.iter().zip(corner_weights) {
            if let Some(slot) = grid.slot([base[0] + o[0], base[1] + o[1], base[2] + o[2]]) {
                weights[slot] += w;
            }
        }
        if sample.normal == Vector3d::zeros() {
            continue;
        }

        let spread = depth.saturating_sub(sample.support_depth).min(MAX_KERNEL_SPREAD);
        let radius = (1u32 << spread) as f64;
        let [wx, wy, wz] = [0, 1, 2].map(|a| hat_weights(u[a], radius, max_node));
        for &(k, fz) in &wz {
            for &(j, fy) in &wy {
                for &(i, fx) in &wx {
                    if let Some(slot) = grid.slot([i, j, k]) {
                        field[slot] += sample.normal * (mass * fx * fy * fz);
                    }
                }
            }
        }
    }
    (field, weights)
}

/// Right-hand side over the free nodes: minus the divergence of the normal
/// field, minus the coupling to fixed nodes
fn assemble_rhs(
    grid: &LevelGrid,
    stencils: &Stencils,
    field: &[Vector3d],
    chi: &[f64],
    h: f64,
) -> Vec<f64> {
    let h2 = h * h;
    grid.free_slots()
        .par_iter()
        .map(|&slot| {
            let slot = slot as usize;
            let mut acc = 0.0;
            for o in 0..STENCIL.len() {
                if let Some(n) = grid.neighbor(slot, o) {
                    acc -= h2 * stencils.divergence[o].dot(&field[n]);
                    if grid.state(n) == NodeState::Fixed {
                        acc -= h * stencils.stiffness[o] * chi[n];
                    }
                }
            }
            acc
        })
        .collect()
}

/// Poisson surface reconstruction
///
/// # Arguments
/// * `cloud` - Point cloud with normal information
/// * `config` - Configuration parameters for the reconstruction
pub fn poisson_reconstruction(cloud: &PointCloud, config: &PoissonConfig) -> Result<DensityMesh> {
    SurfaceFitter::new(config.clone()).apply(cloud)
}
