//! Sparse node lattice of a single octree level
//!
//! Nodes are stored in bricks of 4x4x4 so that the 27-point stencil of a node
//! can be resolved through a per-brick neighbor table instead of a hash
//! lookup. A node slot is `brick * 64 + (a + 4b + 16c)` for local coordinates
//! `(a, b, c)`.

use crate::octree::morton_encode;
use densemesh_core::Vector3d;
use rayon::prelude::*;
use std::collections::HashMap;

/// Nodes per brick along one axis
pub const BRICK_EDGE: u32 = 4;
/// Nodes per brick
pub const BRICK_NODES: usize = 64;
const NONE: u32 = u32::MAX;

/// Corner offsets of a cell, in marching cubes corner order
pub const CELL_CORNERS: [[u32; 3]; 8] = [
    [0, 0, 0],
    [1, 0, 0],
    [1, 1, 0],
    [0, 1, 0],
    [0, 0, 1],
    [1, 0, 1],
    [1, 1, 1],
    [0, 1, 1],
];

/// The 27 stencil offsets; offset `o` has index `(x+1) + 3(y+1) + 9(z+1)`
pub const STENCIL: [[i32; 3]; 27] = stencil_offsets();

const fn stencil_offsets() -> [[i32; 3]; 27] {
    let mut out = [[0; 3]; 27];
    let mut i = 0;
    while i < 27 {
        out[i] = [(i % 3) as i32 - 1, ((i / 3) % 3) as i32 - 1, (i / 9) as i32 - 1];
        i += 1;
    }
    out
}

/// Role of a node slot in the linear system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Slot inside an allocated brick but not a corner of any active cell
    Absent,
    /// Corner of some but not all eight surrounding cells; value is prescribed
    Fixed,
    /// Interior node; value is solved for
    Free,
}

/// Active cells of one level and the lattice nodes at their corners
#[derive(Debug, Clone)]
pub struct LevelGrid {
    depth: u32,
    cells: Vec<[u32; 3]>,
    bricks: Vec<[u32; 3]>,
    lookup: HashMap<[u32; 3], u32>,
    neighbors: Vec<[u32; 27]>,
    states: Vec<NodeState>,
    free: Vec<u32>,
    free_index: Vec<u32>,
}

impl LevelGrid {
    /// Build the lattice of `cells` at `depth`.
    ///
    /// Cells are deduplicated and kept in Morton order. A node is free when
    /// all eight cells around it are active.
    pub fn from_cells(depth: u32, mut cells: Vec<[u32; 3]>) -> Self {
        cells.par_sort_unstable_by_key(|c| morton_encode(*c));
        cells.dedup();

        let mut bricks: Vec<[u32; 3]> = cells
            .iter()
            .flat_map(|c| {
                CELL_CORNERS
                    .iter()
                    .map(move |o| [0, 1, 2].map(|a| (c[a] + o[a]) / BRICK_EDGE))
            })
            .collect();
        bricks.par_sort_unstable_by_key(|b| morton_encode(*b));
        bricks.dedup();

        let lookup: HashMap<[u32; 3], u32> = bricks
            .iter()
            .enumerate()
            .map(|(i, b)| (*b, i as u32))
            .collect();

        let neighbors: Vec<[u32; 27]> = bricks
            .par_iter()
            .map(|b| {
                STENCIL.map(|o| {
                    let mut key = [0u32; 3];
                    for a in 0..3 {
                        match b[a].checked_add_signed(o[a]) {
                            Some(v) => key[a] = v,
                            None => return NONE,
                        }
                    }
                    lookup.get(&key).copied().unwrap_or(NONE)
                })
            })
            .collect();

        let mut grid = Self {
            depth,
            cells: Vec::new(),
            bricks,
            lookup,
            neighbors,
            states: Vec::new(),
            free: Vec::new(),
            free_index: Vec::new(),
        };

        let mut incidence = vec![0u8; grid.slot_count()];
        for c in &cells {
            for o in &CELL_CORNERS {
                if let Some(slot) = grid.slot([c[0] + o[0], c[1] + o[1], c[2] + o[2]]) {
                    incidence[slot] += 1;
                }
            }
        }
        grid.states = incidence
            .par_iter()
            .map(|&n| match n {
                0 => NodeState::Absent,
                8 => NodeState::Free,
                _ => NodeState::Fixed,
            })
            .collect();

        let mut free_index = vec![NONE; grid.slot_count()];
        let mut free = Vec::new();
        for (slot, state) in grid.states.iter().enumerate() {
            if *state == NodeState::Free {
                free_index[slot] = free.len() as u32;
                free.push(slot as u32);
            }
        }
        grid.free = free;
        grid.free_index = free_index;
        grid.cells = cells;
        grid
    }

    /// Lattice with every cell of `depth` active
    pub fn full(depth: u32) -> Self {
        let n = 1u32 << depth;
        let cells = (0..n)
            .flat_map(|z| (0..n).flat_map(move |y| (0..n).map(move |x| [x, y, z])))
            .collect();
        Self::from_cells(depth, cells)
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Active cells in Morton order
    pub fn cells(&self) -> &[[u32; 3]] {
        &self.cells
    }

    /// Number of node slots, including absent ones
    pub fn slot_count(&self) -> usize {
        self.bricks.len() * BRICK_NODES
    }

    /// Number of nodes that are corners of active cells
    pub fn node_count(&self) -> usize {
        self.states.iter().filter(|s| **s != NodeState::Absent).count()
    }

    pub fn state(&self, slot: usize) -> NodeState {
        self.states[slot]
    }

    /// Slots of free nodes in ascending order
    pub fn free_slots(&self) -> &[u32] {
        &self.free
    }

    /// Position of `slot` among the free nodes
    pub fn free_index(&self, slot: usize) -> Option<usize> {
        match self.free_index[slot] {
            NONE => None,
            i => Some(i as usize),
        }
    }

    /// Slot of the node at lattice coordinates `node`, if it exists
    pub fn slot(&self, node: [u32; 3]) -> Option<usize> {
        let brick = node.map(|v| v / BRICK_EDGE);
        let b = *self.lookup.get(&brick)?;
        let local = node.map(|v| v % BRICK_EDGE);
        let slot = b as usize * BRICK_NODES + (local[0] + 4 * local[1] + 16 * local[2]) as usize;
        (self.states.is_empty() || self.states[slot] != NodeState::Absent).then_some(slot)
    }

    /// Lattice coordinates of `slot`
    pub fn node(&self, slot: usize) -> [u32; 3] {
        let brick = self.bricks[slot / BRICK_NODES];
        let local = (slot % BRICK_NODES) as u32;
        let l = [local & 3, (local >> 2) & 3, local >> 4];
        [0, 1, 2].map(|a| brick[a] * BRICK_EDGE + l[a])
    }

    /// Slot of the neighbor of `slot` at stencil offset index `offset`
    #[inline]
    pub fn neighbor(&self, slot: usize, offset: usize) -> Option<usize> {
        let b = slot / BRICK_NODES;
        let local = (slot % BRICK_NODES) as i32;
        let o = STENCIL[offset];
        let mut l = [local & 3, (local >> 2) & 3, local >> 4];
        let mut shift = [0i32; 3];
        for a in 0..3 {
            l[a] += o[a];
            if l[a] < 0 {
                l[a] += BRICK_EDGE as i32;
                shift[a] = -1;
            } else if l[a] >= BRICK_EDGE as i32 {
                l[a] -= BRICK_EDGE as i32;
                shift[a] = 1;
            }
        }
        let nb = self.neighbors[b][((shift[0] + 1) + 3 * (shift[1] + 1) + 9 * (shift[2] + 1)) as usize];
        if nb == NONE {
            return None;
        }
        let slot = nb as usize * BRICK_NODES + (l[0] + 4 * l[1] + 16 * l[2]) as usize;
        (self.states[slot] != NodeState::Absent).then_some(slot)
    }

    /// Trilinear interpolation of node `values` at continuous lattice
    /// coordinates. Missing nodes contribute zero.
    pub fn interpolate(&self, values: &[f64], lattice: &Vector3d) -> f64 {
        let (base, weights) = trilinear_weights(lattice, self.depth);
        let mut acc = 0.0;
        for (o, w) in CELL_CORNERS.iter().zip(weights) {
            if let Some(slot) = self.slot([base[0] + o[0], base[1] + o[1], base[2] + o[2]]) {
                acc += w * values[slot];
            }
        }
        acc
    }
}

/// Lower cell corner and the eight corner weights of continuous lattice
/// coordinates at `depth`, in [`CELL_CORNERS`] order.
pub fn trilinear_weights(lattice: &Vector3d, depth: u32) -> ([u32; 3], [f64; 8]) {
    let max = ((1u64 << depth) - 1) as f64;
    let base = [0, 1, 2].map(|a| lattice[a].floor().clamp(0.0, max));
    let f = [0, 1, 2].map(|a| lattice[a] - base[a]);
    let weights = CELL_CORNERS.map(|o| {
        (0..3)
            .map(|a| if o[a] == 1 { f[a] } else { 1.0 - f[a] })
            .product::<f64>()
    });
    (base.map(|v| v as u32), weights)
}
