//! Binary STL support
//!
//! STL stores single precision triangle soups; reading relies on `stl_io`
//! to weld identical vertices back into an indexed mesh.

use crate::{MeshReader, MeshWriter};
use densemesh_core::{Point3d, Result, TriangleMesh, Vector3d};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{debug, info};

pub struct StlReader;
pub struct StlWriter;

fn to_stl_vector(v: &Vector3d) -> [f32; 3] {
    [v.x as f32, v.y as f32, v.z as f32]
}

impl MeshReader for StlReader {
    fn read_mesh<P: AsRef<Path>>(path: P) -> Result<TriangleMesh> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let stl = stl_io::read_stl(&mut reader)?;
        debug!(
            "STL contains {} vertices, {} triangles",
            stl.vertices.len(),
            stl.faces.len()
        );

        let vertices = stl
            .vertices
            .iter()
            .map(|v| Point3d::new(v.0[0] as f64, v.0[1] as f64, v.0[2] as f64))
            .collect();
        let faces = stl.faces.iter().map(|f| f.vertices).collect();

        let mut mesh = TriangleMesh::from_vertices_and_faces(vertices, faces);
        mesh.validate()?;
        mesh.compute_normals();
        info!(
            "Read mesh with {} vertices and {} faces from {}",
            mesh.vertex_count(),
            mesh.face_count(),
            path.display()
        );
        Ok(mesh)
    }
}

impl MeshWriter for StlWriter {
    fn write_mesh<P: AsRef<Path>>(mesh: &TriangleMesh, path: P) -> Result<()> {
        let path = path.as_ref();
        mesh.validate()?;

        let face_normals = match &mesh.face_normals {
            Some(normals) => normals.clone(),
            None => mesh.calculate_face_normals(),
        };
        let triangles: Vec<stl_io::Triangle> = mesh
            .faces
            .iter()
            .zip(&face_normals)
            .map(|(face, normal)| stl_io::Triangle {
                normal: stl_io::Normal::new(to_stl_vector(normal)),
                vertices: face.map(|i| stl_io::Vertex::new(to_stl_vector(&mesh.vertices[i].coords))),
            })
            .collect();

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        stl_io::write_stl(&mut writer, triangles.iter())?;
        writer.flush()?;

        info!("Wrote {} triangles to {}", mesh.face_count(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn octahedron() -> TriangleMesh {
        let vertices = vec![
            Point3d::new(1.0, 0.0, 0.0),
            Point3d::new(-1.0, 0.0, 0.0),
            Point3d::new(0.0, 1.0, 0.0),
            Point3d::new(0.0, -1.0, 0.0),
            Point3d::new(0.0, 0.0, 1.0),
            Point3d::new(0.0, 0.0, -1.0),
        ];
        let faces = vec![
            [0, 2, 4],
            [2, 1, 4],
            [1, 3, 4],
            [3, 0, 4],
            [2, 0, 5],
            [1, 2, 5],
            [3, 1, 5],
            [0, 3, 5],
        ];
        let mut mesh = TriangleMesh::from_vertices_and_faces(vertices, faces);
        mesh.compute_normals();
        mesh
    }

    #[test]
    fn test_stl_roundtrip_welds_vertices() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("octahedron.stl");
        let mesh = octahedron();

        StlWriter::write_mesh(&mesh, &path).unwrap();
        // 80 byte header, triangle count, 50 bytes per triangle
        let size = std::fs::metadata(&path).unwrap().len();
        assert_eq!(size, 84 + 50 * 8);

        let loaded = StlReader::read_mesh(&path).unwrap();
        assert_eq!(loaded.vertex_count(), 6);
        assert_eq!(loaded.face_count(), 8);
        assert!(loaded.statistics(0.0).is_watertight());
        assert_relative_eq!(loaded.surface_area(), mesh.surface_area(), epsilon = 1e-5);
    }

    #[test]
    fn test_stl_preserves_winding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("octahedron.stl");
        StlWriter::write_mesh(&octahedron(), &path).unwrap();

        let loaded = StlReader::read_mesh(&path).unwrap();
        for face in &loaded.faces {
            let centroid = (loaded.vertices[face[0]].coords
                + loaded.vertices[face[1]].coords
                + loaded.vertices[face[2]].coords)
                / 3.0;
            assert!(loaded.face_cross(face).dot(&centroid) > 0.0);
        }
    }

    #[test]
    fn test_stl_rejects_invalid_mesh() {
        let dir = tempfile::tempdir().unwrap();
        let mesh = TriangleMesh::from_vertices_and_faces(vec![Point3d::origin()], vec![[0, 1, 2]]);
        assert!(StlWriter::write_mesh(&mesh, dir.path().join("bad.stl")).is_err());
    }
}
