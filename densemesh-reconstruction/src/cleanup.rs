//! Mesh topology cleanup
//!
//! Passes run in the order: merge duplicate vertices, drop degenerate faces,
//! drop duplicate faces, resolve non-manifold edges, drop unreferenced
//! vertices. No pass can re-create a defect removed by an earlier one, so a
//! cleaned mesh is a fixed point of the cleaner.

use densemesh_core::{Error, Point3d, Result, TriangleMesh};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Cleanup tolerances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Vertices closer than this are merged; 0 merges exact duplicates only
    pub merge_tolerance: f64,
    /// Faces with area at or below this are removed
    pub degenerate_area_tolerance: f64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            merge_tolerance: 0.0,
            degenerate_area_tolerance: 0.0,
        }
    }
}

impl CleanupConfig {
    pub fn with_merge_tolerance(mut self, tolerance: f64) -> Self {
        self.merge_tolerance = tolerance;
        self
    }

    pub fn with_degenerate_area_tolerance(mut self, tolerance: f64) -> Self {
        self.degenerate_area_tolerance = tolerance;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.merge_tolerance.is_finite() && self.merge_tolerance >= 0.0) {
            return Err(Error::invalid_parameter(
                "merge_tolerance",
                format!("must be finite and non-negative, got {}", self.merge_tolerance),
            ));
        }
        if !(self.degenerate_area_tolerance.is_finite() && self.degenerate_area_tolerance >= 0.0) {
            return Err(Error::invalid_parameter(
                "degenerate_area_tolerance",
                format!(
                    "must be finite and non-negative, got {}",
                    self.degenerate_area_tolerance
                ),
            ));
        }
        Ok(())
    }
}

/// Number of elements removed by each pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub merged_vertices: usize,
    pub degenerate_faces: usize,
    pub duplicate_faces: usize,
    pub non_manifold_faces: usize,
    pub unreferenced_vertices: usize,
}

impl CleanupReport {
    /// True when no pass changed the mesh
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

/// Keep the vertices flagged in `keep`, drop faces that reference any other
/// vertex and renumber the rest. Per-vertex normals follow their vertices;
/// face normals follow their faces.
pub(crate) fn compact_vertices(mesh: &TriangleMesh, keep: &[bool]) -> TriangleMesh {
    let mut remap = vec![usize::MAX; mesh.vertices.len()];
    let mut vertices = Vec::new();
    for (i, v) in mesh.vertices.iter().enumerate() {
        if keep[i] {
            remap[i] = vertices.len();
            vertices.push(*v);
        }
    }

    let kept_faces: Vec<usize> = (0..mesh.faces.len())
        .filter(|&f| mesh.faces[f].iter().all(|&v| keep[v]))
        .collect();
    let faces = kept_faces
        .iter()
        .map(|&f| mesh.faces[f].map(|v| remap[v]))
        .collect();

    TriangleMesh {
        vertices,
        faces,
        normals: mesh.normals.as_ref().map(|normals| {
            normals
                .iter()
                .zip(keep)
                .filter(|(_, k)| **k)
                .map(|(n, _)| *n)
                .collect()
        }),
        face_normals: mesh
            .face_normals
            .as_ref()
            .map(|normals| kept_faces.iter().map(|&f| normals[f]).collect()),
    }
}

/// Bit pattern of a coordinate with signed zeros unified
fn coordinate_bits(p: &Point3d) -> [u64; 3] {
    [p.x, p.y, p.z].map(|c| if c == 0.0 { 0 } else { c.to_bits() })
}

/// Representative of every vertex: the lowest-index earlier vertex within
/// `tolerance`, or itself
fn merge_map(vertices: &[Point3d], tolerance: f64) -> Vec<usize> {
    let mut representative = Vec::with_capacity(vertices.len());
    if tolerance == 0.0 {
        let mut first: HashMap<[u64; 3], usize> = HashMap::new();
        for (i, v) in vertices.iter().enumerate() {
            representative.push(*first.entry(coordinate_bits(v)).or_insert(i));
        }
        return representative;
    }

    let cell = |p: &Point3d| [p.x, p.y, p.z].map(|c| (c / tolerance).floor() as i64);
    let mut buckets: HashMap<[i64; 3], Vec<usize>> = HashMap::new();
    for (i, v) in vertices.iter().enumerate() {
        let key = cell(v);
        let mut best: Option<usize> = None;
        for dz in -1..=1 {
            for dy in -1..=1 {
                for dx in -1..=1 {
                    let Some(bucket) = buckets.get(&[key[0] + dx, key[1] + dy, key[2] + dz]) else {
                        continue;
                    };
                    for &r in bucket {
                        if (vertices[r] - v).norm() <= tolerance && best.map_or(true, |b| r < b) {
                            best = Some(r);
                        }
                    }
                }
            }
        }
        match best {
            Some(r) => representative.push(r),
            None => {
                buckets.entry(key).or_default().push(i);
                representative.push(i);
            }
        }
    }
    representative
}

/// Mesh cleanup passes followed by normal recomputation
#[derive(Debug, Clone, Default)]
pub struct TopologyCleaner {
    config: CleanupConfig,
}

impl TopologyCleaner {
    pub fn new(config: CleanupConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    /// Clean `mesh` and recompute its face and vertex normals.
    ///
    /// Fails with [`Error::EmptyMesh`] when no face survives.
    pub fn apply(&self, mut mesh: TriangleMesh) -> Result<(TriangleMesh, CleanupReport)> {
        self.config.validate()?;
        mesh.validate()?;
        let mut report = CleanupReport::default();

        // Merge duplicate vertices
        let representative = merge_map(&mesh.vertices, self.config.merge_tolerance);
        report.merged_vertices = representative
            .iter()
            .enumerate()
            .filter(|(i, r)| i != *r)
            .count();
        for face in &mut mesh.faces {
            *face = face.map(|v| representative[v]);
        }

        // Degenerate faces
        let tolerance = self.config.degenerate_area_tolerance;
        let before = mesh.faces.len();
        let keep: Vec<bool> = mesh
            .faces
            .par_iter()
            .map(|f| f[0] != f[1] && f[1] != f[2] && f[0] != f[2] && mesh.face_area(f) > tolerance)
            .collect();
        retain_faces(&mut mesh, &keep);
        report.degenerate_faces = before - mesh.faces.len();

        // Duplicate faces, regardless of winding
        let mut seen: HashSet<[usize; 3]> = HashSet::with_capacity(mesh.faces.len());
        let keep: Vec<bool> = mesh
            .faces
            .iter()
            .map(|f| {
                let mut key = *f;
                key.sort_unstable();
                seen.insert(key)
            })
            .collect();
        let before = mesh.faces.len();
        retain_faces(&mut mesh, &keep);
        report.duplicate_faces = before - mesh.faces.len();

        // Non-manifold edges keep the two faces closest to the mean area
        let mut keep = vec![true; mesh.faces.len()];
        for faces in mesh.edge_faces().values().filter(|f| f.len() > 2) {
            let areas: Vec<f64> = faces.iter().map(|&f| mesh.face_area(&mesh.faces[f])).collect();
            let mean = areas.iter().sum::<f64>() / areas.len() as f64;
            let mut ranked: Vec<(f64, usize)> = areas
                .iter()
                .zip(faces)
                .map(|(a, &f)| ((a - mean).abs(), f))
                .collect();
            ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            for &(_, f) in &ranked[2..] {
                keep[f] = false;
            }
        }
        let before = mesh.faces.len();
        retain_faces(&mut mesh, &keep);
        report.non_manifold_faces = before - mesh.faces.len();

        // Unreferenced vertices
        let mut referenced = vec![false; mesh.vertices.len()];
        for face in &mesh.faces {
            for &v in face {
                referenced[v] = true;
            }
        }
        report.unreferenced_vertices = referenced.iter().filter(|r| !**r).count();
        let mut mesh = compact_vertices(&mesh, &referenced);

        if mesh.faces.is_empty() {
            return Err(Error::EmptyMesh(
                "topology cleanup removed every face".to_string(),
            ));
        }
        mesh.compute_normals();

        debug!("Cleanup report: {:?}", report);
        info!(
            "Cleaned mesh: {} vertices, {} faces",
            mesh.vertex_count(),
            mesh.face_count()
        );
        Ok((mesh, report))
    }
}

fn retain_faces(mesh: &mut TriangleMesh, keep: &[bool]) {
    let mut flags = keep.iter();
    mesh.faces.retain(|_| *flags.next().unwrap_or(&true));
    mesh.face_normals = None;
}

/// Clean a mesh with the given configuration
pub fn clean_mesh(mesh: TriangleMesh, config: &CleanupConfig) -> Result<(TriangleMesh, CleanupReport)> {
    TopologyCleaner::new(config.clone()).apply(mesh)
}
