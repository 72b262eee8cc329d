//! # densemesh Algorithms
//!
//! Point cloud preprocessing for surface reconstruction: voxel downsampling,
//! statistical outlier removal, normal estimation and k-d tree neighbor
//! search.

pub mod filtering;
pub mod normals;
pub mod nearest_neighbor;

// Re-export commonly used items
pub use filtering::*;
pub use normals::*;
pub use nearest_neighbor::*;
