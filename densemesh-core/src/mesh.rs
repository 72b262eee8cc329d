//! Mesh data structures and functionality

use crate::error::{Error, Result};
use crate::point::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A triangle mesh with vertices and faces
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriangleMesh {
    pub vertices: Vec<Point3d>,
    pub faces: Vec<[usize; 3]>,
    /// Per-vertex normals
    pub normals: Option<Vec<Vector3d>>,
    /// Per-face normals
    pub face_normals: Option<Vec<Vector3d>>,
}

impl TriangleMesh {
    /// Create a new empty mesh
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mesh from vertices and faces
    pub fn from_vertices_and_faces(vertices: Vec<Point3d>, faces: Vec<[usize; 3]>) -> Self {
        Self {
            vertices,
            faces,
            normals: None,
            face_normals: None,
        }
    }

    /// Get the number of vertices
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Get the number of faces
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// Check if the mesh is empty
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.faces.is_empty()
    }

    /// Check that every face refers to an existing vertex and that the
    /// normal arrays, when present, have the right length.
    pub fn validate(&self) -> Result<()> {
        let n = self.vertices.len();
        if let Some((f, face)) = self
            .faces
            .iter()
            .enumerate()
            .find(|(_, face)| face.iter().any(|&v| v >= n))
        {
            return Err(Error::InvalidData(format!(
                "face {} {:?} references a vertex outside 0..{}",
                f, face, n
            )));
        }
        if self.normals.as_ref().is_some_and(|normals| normals.len() != n) {
            return Err(Error::InvalidData(
                "vertex normal count does not match vertex count".to_string(),
            ));
        }
        if self
            .face_normals
            .as_ref()
            .is_some_and(|normals| normals.len() != self.faces.len())
        {
            return Err(Error::InvalidData(
                "face normal count does not match face count".to_string(),
            ));
        }
        Ok(())
    }

    /// Unnormalized face normal `(v1 - v0) x (v2 - v0)`, twice the area
    pub fn face_cross(&self, face: &[usize; 3]) -> Vector3d {
        let v0 = self.vertices[face[0]];
        let v1 = self.vertices[face[1]];
        let v2 = self.vertices[face[2]];
        (v1 - v0).cross(&(v2 - v0))
    }

    /// Area of a face
    pub fn face_area(&self, face: &[usize; 3]) -> f64 {
        0.5 * self.face_cross(face).norm()
    }

    /// Total surface area
    pub fn surface_area(&self) -> f64 {
        self.faces.iter().map(|f| self.face_area(f)).sum()
    }

    /// Calculate unit face normals; degenerate faces get a zero normal
    pub fn calculate_face_normals(&self) -> Vec<Vector3d> {
        self.faces
            .iter()
            .map(|face| {
                self.face_cross(face)
                    .try_normalize(f64::MIN_POSITIVE)
                    .unwrap_or_else(Vector3d::zeros)
            })
            .collect()
    }

    /// Calculate unit vertex normals as the normalized average of the unit
    /// normals of incident faces. Isolated vertices get a zero normal.
    pub fn calculate_vertex_normals(&self, face_normals: &[Vector3d]) -> Vec<Vector3d> {
        let mut accum = vec![Vector3d::zeros(); self.vertices.len()];
        for (face, normal) in self.faces.iter().zip(face_normals) {
            for &v in face {
                accum[v] += normal;
            }
        }
        accum
            .into_iter()
            .map(|n| n.try_normalize(f64::MIN_POSITIVE).unwrap_or_else(Vector3d::zeros))
            .collect()
    }

    /// Recompute both face and vertex normals
    pub fn compute_normals(&mut self) {
        let face_normals = self.calculate_face_normals();
        self.normals = Some(self.calculate_vertex_normals(&face_normals));
        self.face_normals = Some(face_normals);
    }

    /// Map from undirected edge `(min, max)` to the faces using it, in
    /// ascending face order. Faces with repeated indices contribute only
    /// their distinct edges.
    pub fn edge_faces(&self) -> BTreeMap<(usize, usize), Vec<usize>> {
        let mut edges: BTreeMap<(usize, usize), Vec<usize>> = BTreeMap::new();
        for (f, face) in self.faces.iter().enumerate() {
            for k in 0..3 {
                let (a, b) = (face[k], face[(k + 1) % 3]);
                if a != b {
                    edges.entry((a.min(b), a.max(b))).or_default().push(f);
                }
            }
        }
        edges
    }

    /// Topological summary of the mesh
    pub fn statistics(&self, degenerate_area_tolerance: f64) -> MeshStatistics {
        let edges = self.edge_faces();
        let mut referenced = vec![false; self.vertices.len()];
        for face in &self.faces {
            for &v in face {
                if v < referenced.len() {
                    referenced[v] = true;
                }
            }
        }
        MeshStatistics {
            vertex_count: self.vertices.len(),
            face_count: self.faces.len(),
            edge_count: edges.len(),
            boundary_edges: edges.values().filter(|f| f.len() == 1).count(),
            non_manifold_edges: edges.values().filter(|f| f.len() > 2).count(),
            unreferenced_vertices: referenced.iter().filter(|r| !**r).count(),
            degenerate_faces: self
                .faces
                .iter()
                .filter(|f| is_degenerate(self, f, degenerate_area_tolerance))
                .count(),
        }
    }
}

fn is_degenerate(mesh: &TriangleMesh, face: &[usize; 3], tolerance: f64) -> bool {
    face[0] == face[1]
        || face[1] == face[2]
        || face[0] == face[2]
        || mesh.face_area(face) <= tolerance
}

/// Counts describing the topology of a [`TriangleMesh`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshStatistics {
    pub vertex_count: usize,
    pub face_count: usize,
    pub edge_count: usize,
    /// Edges used by exactly one face
    pub boundary_edges: usize,
    /// Edges used by more than two faces
    pub non_manifold_edges: usize,
    pub unreferenced_vertices: usize,
    /// Faces with repeated indices or area at or below the tolerance
    pub degenerate_faces: usize,
}

impl MeshStatistics {
    /// Every edge is shared by exactly two faces
    pub fn is_watertight(&self) -> bool {
        self.face_count > 0 && self.boundary_edges == 0 && self.non_manifold_edges == 0
    }

    /// Every edge is shared by at most two faces
    pub fn is_edge_manifold(&self) -> bool {
        self.non_manifold_edges == 0
    }

    /// Euler characteristic `V - E + F`
    pub fn euler_characteristic(&self) -> i64 {
        self.vertex_count as i64 - self.edge_count as i64 + self.face_count as i64
    }
}

/// A surface mesh together with one sample-support density per vertex
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DensityMesh {
    pub mesh: TriangleMesh,
    pub densities: Vec<f64>,
}

impl DensityMesh {
    /// Pair a mesh with its vertex densities, checking one density per vertex
    pub fn new(mesh: TriangleMesh, densities: Vec<f64>) -> Result<Self> {
        if densities.len() != mesh.vertices.len() {
            return Err(Error::InvalidData(format!(
                "{} densities for {} vertices",
                densities.len(),
                mesh.vertices.len()
            )));
        }
        Ok(Self { mesh, densities })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Unit tetrahedron with outward winding
    fn tetrahedron() -> TriangleMesh {
        TriangleMesh::from_vertices_and_faces(
            vec![
                Point3d::new(0.0, 0.0, 0.0),
                Point3d::new(1.0, 0.0, 0.0),
                Point3d::new(0.0, 1.0, 0.0),
                Point3d::new(0.0, 0.0, 1.0),
            ],
            vec![[0, 2, 1], [0, 1, 3], [0, 3, 2], [1, 2, 3]],
        )
    }

    #[test]
    fn test_face_normals_point_outward() {
        let mesh = tetrahedron();
        let normals = mesh.calculate_face_normals();
        assert_relative_eq!(normals[0], -Vector3d::z(), epsilon = 1e-12);
        assert_relative_eq!(normals[1], -Vector3d::y(), epsilon = 1e-12);
        assert_relative_eq!(normals[2], -Vector3d::x(), epsilon = 1e-12);
        let slanted = Vector3d::new(1.0, 1.0, 1.0).normalize();
        assert_relative_eq!(normals[3], slanted, epsilon = 1e-12);
    }

    #[test]
    fn test_compute_normals() {
        let mut mesh = tetrahedron();
        mesh.compute_normals();
        let normals = mesh.normals.as_ref().unwrap();
        assert_eq!(normals.len(), 4);
        for n in normals {
            assert_relative_eq!(n.norm(), 1.0, epsilon = 1e-12);
        }
        // The corner at the origin averages three axis-aligned normals
        let expected = -Vector3d::new(1.0, 1.0, 1.0).normalize();
        assert_relative_eq!(normals[0], expected, epsilon = 1e-12);
        assert!(mesh.validate().is_ok());
    }

    #[test]
    fn test_statistics_closed_tetrahedron() {
        let stats = tetrahedron().statistics(0.0);
        assert_eq!(stats.edge_count, 6);
        assert_eq!(stats.boundary_edges, 0);
        assert_eq!(stats.non_manifold_edges, 0);
        assert!(stats.is_watertight());
        assert_eq!(stats.euler_characteristic(), 2);
    }

    #[test]
    fn test_statistics_open_and_non_manifold() {
        let mut mesh = tetrahedron();
        mesh.faces.pop();
        mesh.vertices.push(Point3d::new(5.0, 5.0, 5.0));
        let stats = mesh.statistics(0.0);
        assert_eq!(stats.boundary_edges, 3);
        assert_eq!(stats.unreferenced_vertices, 1);
        assert!(!stats.is_watertight());

        mesh.faces.push([0, 1, 4]);
        let stats = mesh.statistics(0.0);
        assert_eq!(stats.non_manifold_edges, 1);
    }

    #[test]
    fn test_validate_rejects_bad_index() {
        let mut mesh = tetrahedron();
        mesh.faces.push([0, 1, 9]);
        assert!(mesh.validate().is_err());
    }

    #[test]
    fn test_density_mesh_length_checked() {
        assert!(DensityMesh::new(tetrahedron(), vec![1.0; 3]).is_err());
        assert!(DensityMesh::new(tetrahedron(), vec![1.0; 4]).is_ok());
    }

    #[test]
    fn test_surface_area() {
        let mesh = tetrahedron();
        let expected = 1.5 + 3.0_f64.sqrt() / 2.0;
        assert_relative_eq!(mesh.surface_area(), expected, epsilon = 1e-12);
    }
}
