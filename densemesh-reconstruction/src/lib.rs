//! # densemesh Reconstruction
//!
//! Watertight surface reconstruction from oriented point clouds.
//!
//! The surface fitter solves a Poisson problem for an indicator function on
//! an adaptive octree and extracts its iso-surface with marching cubes. Each
//! vertex carries a sampling density that [`DensityPruner`] uses to trim
//! poorly supported regions, and [`TopologyCleaner`] repairs what is left.
//! [`ReconstructionPipeline`] chains these with the preprocessing stages from
//! `densemesh-algorithms`.

pub mod octree;
pub mod grid;
pub mod solver;
pub mod parallel;
pub mod marching_cubes;
pub mod poisson;
pub mod pruning;
pub mod cleanup;
pub mod pipeline;

// Re-export commonly used items
pub use octree::{Domain, Octree};
pub use solver::{conjugate_gradient, LinearOperator, SolveReport, SolverSettings};
pub use parallel::ThreadPoolConfig;
pub use marching_cubes::*;
pub use poisson::*;
pub use pruning::*;
pub use cleanup::*;
pub use pipeline::*;
