//! I/O operations for point clouds and meshes
//!
//! Point clouds are read from and written to PLY (ascii or binary), meshes
//! to PLY or binary STL. The format is chosen from the file extension.

pub mod ply;
pub mod stl;

pub use ply::{PlyReader, PlyWriter};
pub use stl::{StlReader, StlWriter};

use densemesh_core::{Error, PointCloud, Result, TriangleMesh};
use std::path::Path;

/// Trait for reading point clouds from files
pub trait PointCloudReader {
    fn read_point_cloud<P: AsRef<Path>>(path: P) -> Result<PointCloud>;
}

/// Trait for writing point clouds to files
pub trait PointCloudWriter {
    fn write_point_cloud<P: AsRef<Path>>(cloud: &PointCloud, path: P) -> Result<()>;
}

/// Trait for reading meshes from files
pub trait MeshReader {
    fn read_mesh<P: AsRef<Path>>(path: P) -> Result<TriangleMesh>;
}

/// Trait for writing meshes to files
pub trait MeshWriter {
    fn write_mesh<P: AsRef<Path>>(mesh: &TriangleMesh, path: P) -> Result<()>;
}

/// File formats understood by this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshFormat {
    Ply,
    Stl,
}

impl MeshFormat {
    /// Format for the extension of `path`, case-insensitive
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "ply" => Some(MeshFormat::Ply),
            "stl" => Some(MeshFormat::Stl),
            _ => None,
        }
    }

    fn require(path: &Path) -> Result<Self> {
        Self::from_path(path).ok_or_else(|| {
            Error::UnsupportedFormat(format!(
                "unsupported file extension {:?} for {}",
                path.extension(),
                path.display()
            ))
        })
    }
}

/// Auto-detect format and read point cloud
pub fn read_point_cloud<P: AsRef<Path>>(path: P) -> Result<PointCloud> {
    let path = path.as_ref();
    match MeshFormat::require(path)? {
        MeshFormat::Ply => PlyReader::read_point_cloud(path),
        MeshFormat::Stl => Err(Error::UnsupportedFormat(format!(
            "STL holds no point clouds: {}",
            path.display()
        ))),
    }
}

/// Auto-detect format and write point cloud
pub fn write_point_cloud<P: AsRef<Path>>(cloud: &PointCloud, path: P) -> Result<()> {
    let path = path.as_ref();
    match MeshFormat::require(path)? {
        MeshFormat::Ply => PlyWriter::write_point_cloud(cloud, path),
        MeshFormat::Stl => Err(Error::UnsupportedFormat(format!(
            "STL holds no point clouds: {}",
            path.display()
        ))),
    }
}

/// Auto-detect format and read mesh
pub fn read_mesh<P: AsRef<Path>>(path: P) -> Result<TriangleMesh> {
    let path = path.as_ref();
    match MeshFormat::require(path)? {
        MeshFormat::Ply => PlyReader::read_mesh(path),
        MeshFormat::Stl => StlReader::read_mesh(path),
    }
}

/// Auto-detect format and write mesh
pub fn write_mesh<P: AsRef<Path>>(mesh: &TriangleMesh, path: P) -> Result<()> {
    let path = path.as_ref();
    match MeshFormat::require(path)? {
        MeshFormat::Ply => PlyWriter::write_mesh(mesh, path),
        MeshFormat::Stl => StlWriter::write_mesh(mesh, path),
    }
}
