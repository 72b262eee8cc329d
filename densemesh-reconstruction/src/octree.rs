//! Linear octree over oriented samples
//!
//! Samples are keyed by the Morton code of their finest-level cell and kept
//! sorted, so every octree node is a contiguous run of samples sharing a code
//! prefix. Nodes are never materialized as a pointer tree; levels are
//! enumerated on demand with [`Octree::nodes_at`].

use densemesh_core::{BoundingBox, Error, Point3d, Result, Vector3d};
use rayon::prelude::*;
use std::ops::Range;

/// Deepest supported octree level
pub const MAX_DEPTH: u32 = 16;

/// Domain enlargement so that a margin of 1/16 of the width surrounds the
/// scaled bounding cube on every side
const MARGIN_FACTOR: f64 = 8.0 / 7.0;

/// Spread two zero bits between each of the low 21 bits of `v`
fn part1by2(v: u32) -> u64 {
    let mut x = (v as u64) & 0x1f_ffff;
    x = (x | (x << 32)) & 0x1f00000000ffff;
    x = (x | (x << 16)) & 0x1f0000ff0000ff;
    x = (x | (x << 8)) & 0x100f00f00f00f00f;
    x = (x | (x << 4)) & 0x10c30c30c30c30c3;
    x = (x | (x << 2)) & 0x1249249249249249;
    x
}

fn compact1by2(v: u64) -> u32 {
    let mut x = v & 0x1249249249249249;
    x = (x | (x >> 2)) & 0x10c30c30c30c30c3;
    x = (x | (x >> 4)) & 0x100f00f00f00f00f;
    x = (x | (x >> 8)) & 0x1f0000ff0000ff;
    x = (x | (x >> 16)) & 0x1f00000000ffff;
    x = (x | (x >> 32)) & 0x1f_ffff;
    x as u32
}

/// Interleave cell coordinates into a Morton code (x in the lowest bit)
pub fn morton_encode(cell: [u32; 3]) -> u64 {
    part1by2(cell[0]) | (part1by2(cell[1]) << 1) | (part1by2(cell[2]) << 2)
}

/// Inverse of [`morton_encode`]
pub fn morton_decode(code: u64) -> [u32; 3] {
    [
        compact1by2(code),
        compact1by2(code >> 1),
        compact1by2(code >> 2),
    ]
}

/// Axis-aligned cube holding the reconstruction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Domain {
    pub origin: Point3d,
    pub width: f64,
}

impl Domain {
    /// Cube centered on `bbox` with width `max_extent * scale`, enlarged by a
    /// margin so the domain boundary stays clear of the samples
    pub fn enclosing(bbox: &BoundingBox, scale: f64) -> Result<Self> {
        let extent = bbox.max_extent();
        if !(extent.is_finite() && extent > 0.0) {
            return Err(Error::Reconstruction(
                "samples span no volume: all points coincide".to_string(),
            ));
        }
        let width = extent * scale * MARGIN_FACTOR;
        let center = bbox.center();
        Ok(Self {
            origin: center - Vector3d::repeat(width / 2.0),
            width,
        })
    }

    /// Edge length of a cell at `depth`
    pub fn cell_width(&self, depth: u32) -> f64 {
        self.width / (1u64 << depth) as f64
    }

    /// Continuous lattice coordinates of `p` at `depth`
    pub fn to_lattice(&self, p: &Point3d, depth: u32) -> Vector3d {
        (p - self.origin) / self.cell_width(depth)
    }

    /// World position of continuous lattice coordinates at `depth`
    pub fn to_world(&self, lattice: &Vector3d, depth: u32) -> Point3d {
        self.origin + lattice * self.cell_width(depth)
    }

    /// Cell of `depth` containing `p`, clamped into the domain
    pub fn cell_of(&self, p: &Point3d, depth: u32) -> [u32; 3] {
        let u = self.to_lattice(p, depth);
        let max = ((1u64 << depth) - 1) as f64;
        [0, 1, 2].map(|a| u[a].floor().clamp(0.0, max) as u32)
    }
}

/// An oriented sample stored in the octree
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub position: Point3d,
    /// Unit normal, or zero when the input normal was degenerate
    pub normal: Vector3d,
    /// Index in the input cloud
    pub index: usize,
    /// Depth of the deepest node around this sample holding enough samples;
    /// the normal is smoothed at this resolution on finer levels
    pub support_depth: u32,
}

/// A node of the octree: a cell and the samples inside it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OctreeNode {
    pub depth: u32,
    pub cell: [u32; 3],
    /// Range into [`Octree::samples`]
    pub samples: Range<usize>,
}

impl OctreeNode {
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

/// Octree over oriented samples, refined to a fixed maximum depth
#[derive(Debug, Clone)]
pub struct Octree {
    domain: Domain,
    depth: u32,
    samples: Vec<Sample>,
    codes: Vec<u64>,
}

impl Octree {
    /// Build the octree over `points` with matching `normals`.
    ///
    /// Normals are normalized; zero or non-finite normals are stored as zero.
    pub fn build(
        points: &[Point3d],
        normals: &[Vector3d],
        depth: u32,
        scale: f64,
    ) -> Result<Self> {
        if points.len() != normals.len() {
            return Err(Error::InvalidData(format!(
                "{} normals for {} points",
                normals.len(),
                points.len()
            )));
        }
        if !(1..=MAX_DEPTH).contains(&depth) {
            return Err(Error::invalid_parameter(
                "depth",
                format!("must be in 1..={}, got {}", MAX_DEPTH, depth),
            ));
        }
        let bbox = BoundingBox::from_points(points).ok_or(Error::InsufficientPoints {
            required: 1,
            available: 0,
        })?;
        let domain = Domain::enclosing(&bbox, scale)?;

        let mut keyed: Vec<(u64, Sample)> = points
            .par_iter()
            .zip(normals.par_iter())
            .enumerate()
            .map(|(index, (p, n))| {
                let normal = if n.iter().all(|c| c.is_finite()) {
                    n.try_normalize(f64::MIN_POSITIVE).unwrap_or_else(Vector3d::zeros)
                } else {
                    Vector3d::zeros()
                };
                let sample = Sample {
                    position: *p,
                    normal,
                    index,
                    support_depth: depth,
                };
                (morton_encode(domain.cell_of(p, depth)), sample)
            })
            .collect();
        keyed.par_sort_unstable_by_key(|(code, sample)| (*code, sample.index));

        let (codes, samples) = keyed.into_iter().unzip();
        Ok(Self {
            domain,
            depth,
            samples,
            codes,
        })
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    /// Maximum depth
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Samples in Morton order
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Occupied nodes at `depth`, in Morton order
    pub fn nodes_at(&self, depth: u32) -> Vec<OctreeNode> {
        let depth = depth.min(self.depth);
        let shift = 3 * (self.depth - depth);
        let mut nodes: Vec<OctreeNode> = Vec::new();
        let mut start = 0;
        while start < self.codes.len() {
            let prefix = self.codes[start] >> shift;
            let mut end = start + 1;
            while end < self.codes.len() && self.codes[end] >> shift == prefix {
                end += 1;
            }
            nodes.push(OctreeNode {
                depth,
                cell: morton_decode(prefix),
                samples: start..end,
            });
            start = end;
        }
        nodes
    }

    /// Assign every sample the deepest level in `min_depth..=depth` whose node
    /// containing it holds at least `samples_per_node` samples.
    pub fn assign_support_depths(&mut self, min_depth: u32, samples_per_node: f64) {
        for sample in &mut self.samples {
            sample.support_depth = min_depth;
        }
        for d in min_depth + 1..=self.depth {
            for node in self.nodes_at(d) {
                if node.sample_count() as f64 >= samples_per_node {
                    for sample in &mut self.samples[node.samples] {
                        sample.support_depth = d;
                    }
                }
            }
        }
    }
}
