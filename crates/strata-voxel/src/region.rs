//! Two-resolution voxel regions with a per-region block palette.
//!
//! A [`Region`] is a cube of 16×16×16 chunks. It holds two independent grids
//! of palette indices: `data` at block resolution (16³ voxels per chunk) and
//! `mini_data` at sub-block resolution (32³ per chunk). Both index into the
//! same header, an ordered list of [`BlockId`]s where index 0 is
//! conventionally the empty id.
//!
//! Chunks are allocated lazily. A chunk that was never written to holds no
//! memory and reads as index 0, which keeps a mostly-empty region (the
//! common case) small even though the mini grid alone addresses 134M cells.

use crate::addressing::{CellPos, Resolution};
use crate::block_id::BlockId;

/// Chunks per region axis.
pub const REGION_CHUNKS: usize = 16;

/// Chunks per region.
pub const REGION_CHUNK_COUNT: usize = REGION_CHUNKS * REGION_CHUNKS * REGION_CHUNKS;

/// Voxels per chunk axis at block resolution.
pub const CHUNK_EDGE: usize = 16;

/// Voxels per chunk axis at mini resolution.
pub const MINI_CHUNK_EDGE: usize = 32;

/// Index into a region header.
pub type PaletteIndex = u32;

/// A 16×16×16 grid of chunks, each an `edge³` array of palette indices.
#[derive(Clone, Debug)]
pub struct ChunkGrid {
    edge: usize,
    chunks: Vec<Option<Box<[PaletteIndex]>>>,
}

impl ChunkGrid {
    /// Creates an all-zero grid whose chunks are `edge` voxels per axis.
    pub fn new(edge: usize) -> Self {
        Self {
            edge,
            chunks: vec![None; REGION_CHUNK_COUNT],
        }
    }

    /// Voxels per chunk axis.
    pub fn edge(&self) -> usize {
        self.edge
    }

    /// Cells per chunk.
    pub fn chunk_volume(&self) -> usize {
        self.edge * self.edge * self.edge
    }

    /// Reads the palette index at a chunk/voxel position.
    pub fn get(&self, chunk: CellPos, voxel: CellPos) -> PaletteIndex {
        match &self.chunks[chunk.linear(REGION_CHUNKS)] {
            Some(cells) => cells[voxel.linear(self.edge)],
            None => 0,
        }
    }

    /// Writes the palette index at a chunk/voxel position, allocating the
    /// chunk on its first non-zero write.
    pub fn set(&mut self, chunk: CellPos, voxel: CellPos, value: PaletteIndex) {
        let volume = self.chunk_volume();
        let slot = &mut self.chunks[chunk.linear(REGION_CHUNKS)];
        if slot.is_none() && value == 0 {
            return;
        }
        let cells = slot.get_or_insert_with(|| vec![0; volume].into_boxed_slice());
        cells[voxel.linear(self.edge)] = value;
    }

    /// Raw cells of the chunk at `chunk_index` (see [`CellPos::linear`]), or
    /// `None` if the chunk was never allocated.
    pub fn chunk_cells(&self, chunk_index: usize) -> Option<&[PaletteIndex]> {
        self.chunks[chunk_index].as_deref()
    }

    /// Replaces a whole chunk. Used by the codec while decoding.
    pub(crate) fn put_chunk(&mut self, chunk_index: usize, cells: Option<Box<[PaletteIndex]>>) {
        debug_assert!(cells.as_ref().is_none_or(|c| c.len() == self.chunk_volume()));
        self.chunks[chunk_index] = cells;
    }

    /// Returns `true` if every cell of the chunk is index 0.
    pub fn is_chunk_empty(&self, chunk: CellPos) -> bool {
        self.chunks[chunk.linear(REGION_CHUNKS)]
            .as_ref()
            .is_none_or(|cells| cells.iter().all(|&v| v == 0))
    }

    /// Positions of all chunks holding at least one non-zero cell, in
    /// storage order.
    pub fn non_empty_chunks(&self) -> Vec<CellPos> {
        (0..REGION_CHUNK_COUNT)
            .map(|i| CellPos::from_linear(i, REGION_CHUNKS))
            .filter(|&pos| !self.is_chunk_empty(pos))
            .collect()
    }

    /// Largest palette index stored anywhere in the grid.
    pub fn max_index(&self) -> PaletteIndex {
        self.chunks
            .iter()
            .flatten()
            .flat_map(|cells| cells.iter().copied())
            .max()
            .unwrap_or(0)
    }
}

impl PartialEq for ChunkGrid {
    /// Grids compare by content; an unallocated chunk equals an all-zero one.
    fn eq(&self, other: &Self) -> bool {
        if self.edge != other.edge {
            return false;
        }
        self.chunks
            .iter()
            .zip(&other.chunks)
            .all(|(a, b)| match (a, b) {
                (Some(a), Some(b)) => a == b,
                (Some(cells), None) | (None, Some(cells)) => cells.iter().all(|&v| v == 0),
                (None, None) => true,
            })
    }
}

impl Eq for ChunkGrid {}

/// A region: palette header plus block- and mini-resolution grids.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Region {
    header: Vec<BlockId>,
    data: ChunkGrid,
    mini_data: ChunkGrid,
}

impl Region {
    /// Creates an empty region whose header holds only the empty id.
    pub fn new() -> Self {
        Self::with_header(vec![BlockId::EMPTY])
    }

    /// Creates an all-zero region with the given header.
    pub fn with_header(header: Vec<BlockId>) -> Self {
        Self {
            header,
            data: ChunkGrid::new(CHUNK_EDGE),
            mini_data: ChunkGrid::new(MINI_CHUNK_EDGE),
        }
    }

    pub(crate) fn from_parts(header: Vec<BlockId>, data: ChunkGrid, mini_data: ChunkGrid) -> Self {
        Self {
            header,
            data,
            mini_data,
        }
    }

    /// The palette, in index order.
    pub fn header(&self) -> &[BlockId] {
        &self.header
    }

    /// Block-resolution grid.
    pub fn data(&self) -> &ChunkGrid {
        &self.data
    }

    /// Mini-resolution grid.
    pub fn mini_data(&self) -> &ChunkGrid {
        &self.mini_data
    }

    /// The grid for a resolution.
    pub fn grid(&self, resolution: Resolution) -> &ChunkGrid {
        match resolution {
            Resolution::Block => &self.data,
            Resolution::Mini => &self.mini_data,
        }
    }

    /// Header index of `id`, if present.
    pub fn palette_index(&self, id: BlockId) -> Option<PaletteIndex> {
        self.header
            .iter()
            .position(|&entry| entry == id)
            .map(|i| i as PaletteIndex)
    }

    /// Header index of `id`, appending it to the header if absent.
    pub fn palette_index_or_insert(&mut self, id: BlockId) -> PaletteIndex {
        if let Some(index) = self.palette_index(id) {
            return index;
        }
        self.header.push(id);
        (self.header.len() - 1) as PaletteIndex
    }

    /// Stores `id` at a chunk/voxel position and returns the header index used.
    pub fn set(
        &mut self,
        resolution: Resolution,
        chunk: CellPos,
        voxel: CellPos,
        id: BlockId,
    ) -> PaletteIndex {
        let index = self.palette_index_or_insert(id);
        match resolution {
            Resolution::Block => self.data.set(chunk, voxel, index),
            Resolution::Mini => self.mini_data.set(chunk, voxel, index),
        }
        index
    }

    /// Block id at a chunk/voxel position. `None` if the stored index has no
    /// header entry.
    pub fn get(&self, resolution: Resolution, chunk: CellPos, voxel: CellPos) -> Option<BlockId> {
        let index = self.grid(resolution).get(chunk, voxel);
        self.header.get(index as usize).copied()
    }
}

impl Default for Region {
    fn default() -> Self {
        Self::new()
    }
}
