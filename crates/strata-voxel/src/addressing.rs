//! Absolute voxel coordinates → (region, chunk-in-region, voxel-in-chunk).
//!
//! A region is 16 chunks per axis. At block resolution a chunk spans 16
//! voxels per axis; at mini resolution it spans 32. Division uses floor
//! semantics so negative coordinates land in the regions below zero.

use std::fmt;

use crate::region::{CHUNK_EDGE, MINI_CHUNK_EDGE, REGION_CHUNKS};

/// Integer coordinates of a region in the world grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionCoord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl RegionCoord {
    pub const ORIGIN: Self = Self::new(0, 0, 0);

    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}

impl fmt::Display for RegionCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.x, self.y, self.z)
    }
}

/// A position inside a fixed-size cube: a chunk inside its region, or a
/// voxel inside its chunk. Each axis is below the cube's edge length.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellPos {
    pub x: u8,
    pub y: u8,
    pub z: u8,
}

impl CellPos {
    pub const fn new(x: u8, y: u8, z: u8) -> Self {
        Self { x, y, z }
    }

    /// Row-major index with `z` varying fastest, matching the codec's
    /// axis nesting.
    pub fn linear(self, edge: usize) -> usize {
        (self.x as usize * edge + self.y as usize) * edge + self.z as usize
    }

    /// Inverse of [`CellPos::linear`].
    pub fn from_linear(index: usize, edge: usize) -> Self {
        Self {
            x: (index / (edge * edge)) as u8,
            y: ((index / edge) % edge) as u8,
            z: (index % edge) as u8,
        }
    }
}

/// Which of a region's two grids an address refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// 16 voxels per chunk axis.
    Block,
    /// 32 sub-voxels per chunk axis.
    Mini,
}

impl Resolution {
    /// Voxels per chunk axis at this resolution.
    pub const fn chunk_edge(self) -> usize {
        match self {
            Self::Block => CHUNK_EDGE,
            Self::Mini => MINI_CHUNK_EDGE,
        }
    }
}

/// Fully resolved storage address of one voxel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockAddress {
    pub resolution: Resolution,
    pub region: RegionCoord,
    pub chunk: CellPos,
    pub voxel: CellPos,
}

impl BlockAddress {
    /// Resolves absolute coordinates at the given resolution.
    pub fn resolve(x: i32, y: i32, z: i32, resolution: Resolution) -> Self {
        let edge = resolution.chunk_edge() as i64;
        let region_chunks = REGION_CHUNKS as i64;

        let axis = |coord: i32| {
            let coord = i64::from(coord);
            let chunk = coord.div_euclid(edge);
            let region = chunk.div_euclid(region_chunks);
            (
                region as i32,
                chunk.rem_euclid(region_chunks) as u8,
                coord.rem_euclid(edge) as u8,
            )
        };

        let (rx, cx, vx) = axis(x);
        let (ry, cy, vy) = axis(y);
        let (rz, cz, vz) = axis(z);

        Self {
            resolution,
            region: RegionCoord::new(rx, ry, rz),
            chunk: CellPos::new(cx, cy, cz),
            voxel: CellPos::new(vx, vy, vz),
        }
    }

    /// Shorthand for [`Resolution::Block`].
    pub fn block(x: i32, y: i32, z: i32) -> Self {
        Self::resolve(x, y, z, Resolution::Block)
    }

    /// Shorthand for [`Resolution::Mini`].
    pub fn mini(x: i32, y: i32, z: i32) -> Self {
        Self::resolve(x, y, z, Resolution::Mini)
    }
}
