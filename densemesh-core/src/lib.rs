//! Core data structures and traits for densemesh
//!
//! This crate provides the types shared by every reconstruction stage: point
//! clouds with optional normals and colors, triangle meshes, meshes carrying
//! per-vertex densities, and the common error type.

pub mod point;
pub mod point_cloud;
pub mod mesh;
pub mod traits;
pub mod error;

pub use point::*;
pub use point_cloud::*;
pub use mesh::*;
pub use traits::*;
pub use error::*;

/// Re-export commonly used types from nalgebra
pub use nalgebra::{Matrix3, Point3, Vector3};
