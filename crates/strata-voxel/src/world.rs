//! The world store: all loaded regions keyed by [`RegionCoord`].
//!
//! [`World`] is the single owner of region data. Edits go through
//! [`World::set_block`] and [`World::set_mini_block`], which resolve the
//! catalog index, grow the region palette as needed, and mark the region
//! dirty for saving and for network transfer.
//!
//! Every change to a region bumps its generation. Encoding and saving work
//! on a [`RegionSnapshot`] taken at a known generation, so the slow codec
//! can run away from the owner and its result is only accepted if the
//! region has not changed since.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::addressing::{BlockAddress, CellPos, RegionCoord, Resolution};
use crate::block_id::BlockId;
use crate::catalog::BlockCatalog;
use crate::region::{PaletteIndex, REGION_CHUNKS, Region};
use crate::region_codec::{RegionCodecError, encode_region};

/// Dirty-flag bit: region has edits not yet written to disk.
pub const SAVE_DIRTY: u8 = 0b0000_0001;
/// Dirty-flag bit: the cached encoding of the region is stale.
pub const NETWORK_DIRTY: u8 = 0b0000_0010;

/// Errors produced by a block edit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EditError {
    /// No region is loaded at the coordinates' region.
    #[error("no region loaded for block ({x}, {y}, {z})")]
    OutOfBounds { x: i32, y: i32, z: i32 },
    /// The catalog has no entry for this wire index.
    #[error("unknown block catalog index {0}")]
    UnknownBlock(u32),
}

/// Header and occupancy of one region, for inspection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionSummary {
    pub coord: RegionCoord,
    pub header: Vec<BlockId>,
    /// Chunks of the block grid holding at least one non-zero index.
    pub non_empty_chunks: Vec<CellPos>,
    /// Chunks of the mini grid holding at least one non-zero index.
    pub non_empty_mini_chunks: Vec<CellPos>,
}

/// One non-empty cell of a region grid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlacedBlock {
    pub resolution: Resolution,
    /// Absolute coordinates at `resolution`.
    pub position: [i64; 3],
    pub index: PaletteIndex,
    /// `None` when the index points past the region header.
    pub id: Option<BlockId>,
}

/// A copy of one region taken at a known generation.
#[derive(Clone, Debug)]
pub struct RegionSnapshot {
    pub coord: RegionCoord,
    pub generation: u64,
    region: Region,
}

impl RegionSnapshot {
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Runs the region codec over the copy.
    pub fn encode(&self) -> Result<Vec<u8>, RegionCodecError> {
        encode_region(&self.region)
    }
}

#[derive(Debug)]
struct RegionSlot {
    region: Region,
    dirty: u8,
    generation: u64,
    encoded: Option<Arc<Vec<u8>>>,
}

/// Owns every loaded region.
#[derive(Debug, Default)]
pub struct World {
    regions: FxHashMap<RegionCoord, RegionSlot>,
    next_generation: u64,
}

impl World {
    /// Creates a world with no regions.
    pub fn new() -> Self {
        Self {
            regions: FxHashMap::default(),
            next_generation: 0,
        }
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Inserts a region, replacing any region already at `coord`. The
    /// inserted region starts clean.
    pub fn insert(&mut self, coord: RegionCoord, region: Region) {
        self.put(coord, region, 0);
    }

    /// Creates an empty region at `coord` unless one is already loaded.
    /// The new region is dirty, so the next save writes it out.
    pub fn create_region(&mut self, coord: RegionCoord) -> bool {
        if self.contains(coord) {
            return false;
        }
        self.put(coord, Region::new(), SAVE_DIRTY | NETWORK_DIRTY);
        tracing::info!("Created empty region {}", coord);
        true
    }

    fn put(&mut self, coord: RegionCoord, region: Region, dirty: u8) {
        let generation = self.bump_generation();
        self.regions.insert(
            coord,
            RegionSlot {
                region,
                dirty,
                generation,
                encoded: None,
            },
        );
    }

    pub fn get(&self, coord: RegionCoord) -> Option<&Region> {
        self.regions.get(&coord).map(|slot| &slot.region)
    }

    pub fn contains(&self, coord: RegionCoord) -> bool {
        self.regions.contains_key(&coord)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Coordinates of all loaded regions, sorted.
    pub fn coords(&self) -> Vec<RegionCoord> {
        let mut coords: Vec<_> = self.regions.keys().copied().collect();
        coords.sort_unstable();
        coords
    }

    /// The region served to clients that ask for "the world" without naming
    /// a coordinate: the origin if loaded, otherwise the lowest coordinate.
    pub fn primary_coord(&self) -> Option<RegionCoord> {
        if self.contains(RegionCoord::ORIGIN) {
            return Some(RegionCoord::ORIGIN);
        }
        self.regions.keys().min().copied()
    }

    /// Dirty flags for the region at `coord` (0 if absent or clean).
    pub fn dirty_flags(&self, coord: RegionCoord) -> u8 {
        self.regions.get(&coord).map_or(0, |slot| slot.dirty)
    }

    /// Current generation of the region at `coord`.
    pub fn generation(&self, coord: RegionCoord) -> Option<u64> {
        self.regions.get(&coord).map(|slot| slot.generation)
    }

    /// Places catalog block `catalog_index` at block-resolution coordinates.
    pub fn set_block(
        &mut self,
        x: i32,
        y: i32,
        z: i32,
        catalog_index: u32,
        catalog: &BlockCatalog,
    ) -> Result<PaletteIndex, EditError> {
        self.edit(BlockAddress::block(x, y, z), (x, y, z), catalog_index, catalog)
    }

    /// Places catalog block `catalog_index` at mini-resolution coordinates.
    pub fn set_mini_block(
        &mut self,
        x: i32,
        y: i32,
        z: i32,
        catalog_index: u32,
        catalog: &BlockCatalog,
    ) -> Result<PaletteIndex, EditError> {
        self.edit(BlockAddress::mini(x, y, z), (x, y, z), catalog_index, catalog)
    }

    fn edit(
        &mut self,
        addr: BlockAddress,
        (x, y, z): (i32, i32, i32),
        catalog_index: u32,
        catalog: &BlockCatalog,
    ) -> Result<PaletteIndex, EditError> {
        if !self.contains(addr.region) {
            return Err(EditError::OutOfBounds { x, y, z });
        }
        let id = catalog
            .get(catalog_index)
            .ok_or(EditError::UnknownBlock(catalog_index))?;

        let generation = self.bump_generation();
        let slot = self
            .regions
            .get_mut(&addr.region)
            .ok_or(EditError::OutOfBounds { x, y, z })?;
        let index = slot.region.set(addr.resolution, addr.chunk, addr.voxel, id);
        slot.dirty |= SAVE_DIRTY | NETWORK_DIRTY;
        slot.generation = generation;
        slot.encoded = None;
        Ok(index)
    }

    /// Block id at block-resolution coordinates, if its region is loaded.
    pub fn get_block(&self, x: i32, y: i32, z: i32) -> Option<BlockId> {
        self.lookup(BlockAddress::block(x, y, z))
    }

    /// Block id at mini-resolution coordinates, if its region is loaded.
    pub fn get_mini_block(&self, x: i32, y: i32, z: i32) -> Option<BlockId> {
        self.lookup(BlockAddress::mini(x, y, z))
    }

    fn lookup(&self, addr: BlockAddress) -> Option<BlockId> {
        self.get(addr.region)?
            .get(addr.resolution, addr.chunk, addr.voxel)
    }

    /// The cached encoding of the region at `coord`, if it is current.
    pub fn cached_encoding(&self, coord: RegionCoord) -> Option<Arc<Vec<u8>>> {
        let slot = self.regions.get(&coord)?;
        if slot.dirty & NETWORK_DIRTY != 0 {
            return None;
        }
        slot.encoded.clone()
    }

    /// Copies the region at `coord` for encoding elsewhere.
    pub fn snapshot(&self, coord: RegionCoord) -> Option<RegionSnapshot> {
        let slot = self.regions.get(&coord)?;
        Some(RegionSnapshot {
            coord,
            generation: slot.generation,
            region: slot.region.clone(),
        })
    }

    /// Caches `bytes` as the encoding of the region at `coord`. Ignored,
    /// returning `false`, if the region changed after `generation`.
    pub fn store_encoded(
        &mut self,
        coord: RegionCoord,
        generation: u64,
        bytes: Arc<Vec<u8>>,
    ) -> bool {
        let Some(slot) = self.regions.get_mut(&coord) else {
            return false;
        };
        if slot.generation != generation {
            tracing::debug!(
                "Discarding stale encoding of region {} (generation {} < {})",
                coord,
                generation,
                slot.generation
            );
            return false;
        }
        slot.encoded = Some(bytes);
        slot.dirty &= !NETWORK_DIRTY;
        true
    }

    /// Clears the save-dirty flag of the region at `coord` if it has not
    /// changed since `generation` was written.
    pub fn mark_saved(&mut self, coord: RegionCoord, generation: u64) -> bool {
        match self.regions.get_mut(&coord) {
            Some(slot) if slot.generation == generation => {
                slot.dirty &= !SAVE_DIRTY;
                true
            }
            _ => false,
        }
    }

    /// Encodes the region at `coord` on the calling thread, reusing the
    /// cached encoding when it is current. `Ok(None)` if no region is
    /// loaded there.
    pub fn encode_now(
        &mut self,
        coord: RegionCoord,
    ) -> Result<Option<Arc<Vec<u8>>>, RegionCodecError> {
        if let Some(bytes) = self.cached_encoding(coord) {
            return Ok(Some(bytes));
        }
        let Some(snapshot) = self.snapshot(coord) else {
            return Ok(None);
        };
        let bytes = Arc::new(snapshot.encode()?);
        tracing::debug!("Encoded region {} ({} bytes)", coord, bytes.len());
        self.store_encoded(coord, snapshot.generation, Arc::clone(&bytes));
        Ok(Some(bytes))
    }

    /// Header and occupancy of the region at `coord`.
    pub fn summary(&self, coord: RegionCoord) -> Option<RegionSummary> {
        let region = self.get(coord)?;
        Some(RegionSummary {
            coord,
            header: region.header().to_vec(),
            non_empty_chunks: region.grid(Resolution::Block).non_empty_chunks(),
            non_empty_mini_chunks: region.grid(Resolution::Mini).non_empty_chunks(),
        })
    }

    /// Every non-empty cell of the region at `coord`, block grid first,
    /// each in storage order.
    pub fn non_empty_blocks(&self, coord: RegionCoord) -> Option<Vec<PlacedBlock>> {
        let region = self.get(coord)?;
        let mut blocks = Vec::new();
        for resolution in [Resolution::Block, Resolution::Mini] {
            let grid = region.grid(resolution);
            let edge = grid.edge();
            let region_span = (REGION_CHUNKS * edge) as i64;
            let origin = [
                i64::from(coord.x) * region_span,
                i64::from(coord.y) * region_span,
                i64::from(coord.z) * region_span,
            ];

            for chunk in grid.non_empty_chunks() {
                let Some(cells) = grid.chunk_cells(chunk.linear(REGION_CHUNKS)) else {
                    continue;
                };
                for (i, &index) in cells.iter().enumerate() {
                    if index == 0 {
                        continue;
                    }
                    let voxel = CellPos::from_linear(i, edge);
                    let axis = |base: i64, c: u8, v: u8| base + (c as i64) * edge as i64 + v as i64;
                    blocks.push(PlacedBlock {
                        resolution,
                        position: [
                            axis(origin[0], chunk.x, voxel.x),
                            axis(origin[1], chunk.y, voxel.y),
                            axis(origin[2], chunk.z, voxel.z),
                        ],
                        index,
                        id: region.header().get(index as usize).copied(),
                    });
                }
            }
        }
        Some(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> BlockCatalog {
        BlockCatalog::from_json(r#"{"blocks": ["000000000000", "5655135ebc9c", "2f9e4658c3f0"]}"#)
            .unwrap()
    }

    fn world_with_origin() -> World {
        let mut world = World::new();
        world.insert(RegionCoord::ORIGIN, Region::new());
        world
    }

    #[test]
    fn test_set_block_at_100() {
        let mut world = world_with_origin();
        let catalog = catalog();

        let index = world.set_block(100, 100, 100, 1, &catalog).unwrap();
        assert_eq!(index, 1);

        let region = world.get(RegionCoord::ORIGIN).unwrap();
        assert_eq!(region.header(), &[BlockId::EMPTY, catalog.get(1).unwrap()]);
        assert_eq!(region.data().get(CellPos::new(6, 6, 6), CellPos::new(4, 4, 4)), 1);
        assert_eq!(world.get_block(100, 100, 100), catalog.get(1));
    }

    #[test]
    fn test_repeated_block_reuses_palette_entry() {
        let mut world = world_with_origin();
        let catalog = catalog();
        world.set_block(0, 0, 0, 2, &catalog).unwrap();
        world.set_block(1, 0, 0, 2, &catalog).unwrap();
        world.set_mini_block(5, 5, 5, 2, &catalog).unwrap();
        assert_eq!(world.get(RegionCoord::ORIGIN).unwrap().header().len(), 2);
        assert_eq!(world.get_mini_block(5, 5, 5), catalog.get(2));
        assert_eq!(world.get_block(5, 5, 5), Some(BlockId::EMPTY));
    }

    #[test]
    fn test_edit_outside_loaded_regions() {
        let mut world = world_with_origin();
        let result = world.set_block(-1, 0, 0, 1, &catalog());
        assert_eq!(result, Err(EditError::OutOfBounds { x: -1, y: 0, z: 0 }));
        assert_eq!(world.dirty_flags(RegionCoord::ORIGIN), 0);
    }

    #[test]
    fn test_unknown_catalog_index() {
        let mut world = world_with_origin();
        let result = world.set_block(1, 1, 1, 3, &catalog());
        assert_eq!(result, Err(EditError::UnknownBlock(3)));
        assert_eq!(world.get(RegionCoord::ORIGIN).unwrap().header().len(), 1);
    }

    #[test]
    fn test_edit_marks_dirty_and_invalidates_encoding() {
        let mut world = world_with_origin();
        let catalog = catalog();

        let first = world.encode_now(RegionCoord::ORIGIN).unwrap().unwrap();
        let cached = world.encode_now(RegionCoord::ORIGIN).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &cached));

        world.set_block(3, 3, 3, 1, &catalog).unwrap();
        let flags = world.dirty_flags(RegionCoord::ORIGIN);
        assert_eq!(flags & SAVE_DIRTY, SAVE_DIRTY);
        assert_eq!(flags & NETWORK_DIRTY, NETWORK_DIRTY);

        let fresh = world.encode_now(RegionCoord::ORIGIN).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&first, &fresh));
        assert_eq!(world.dirty_flags(RegionCoord::ORIGIN), SAVE_DIRTY);
    }

    #[test]
    fn test_encoded_missing_region() {
        let mut world = World::new();
        assert!(world.encode_now(RegionCoord::ORIGIN).unwrap().is_none());
        assert!(world.snapshot(RegionCoord::ORIGIN).is_none());
    }

    #[test]
    fn test_stale_encoding_is_discarded() {
        let mut world = world_with_origin();
        let catalog = catalog();
        let snapshot = world.snapshot(RegionCoord::ORIGIN).unwrap();

        // An edit lands while the copy is being encoded elsewhere.
        world.set_block(3, 3, 3, 1, &catalog).unwrap();
        let bytes = Arc::new(snapshot.encode().unwrap());
        assert!(!world.store_encoded(RegionCoord::ORIGIN, snapshot.generation, bytes));
        assert!(world.cached_encoding(RegionCoord::ORIGIN).is_none());
        assert!(!world.mark_saved(RegionCoord::ORIGIN, snapshot.generation));
        assert_eq!(world.dirty_flags(RegionCoord::ORIGIN), SAVE_DIRTY | NETWORK_DIRTY);

        let current = world.snapshot(RegionCoord::ORIGIN).unwrap();
        assert!(current.generation > snapshot.generation);
        let bytes = Arc::new(current.encode().unwrap());
        assert!(world.store_encoded(RegionCoord::ORIGIN, current.generation, Arc::clone(&bytes)));
        let cached = world.cached_encoding(RegionCoord::ORIGIN).unwrap();
        assert!(Arc::ptr_eq(&cached, &bytes));
        assert!(world.mark_saved(RegionCoord::ORIGIN, current.generation));
        assert_eq!(world.dirty_flags(RegionCoord::ORIGIN), 0);
    }

    #[test]
    fn test_create_region_makes_world_editable() {
        let mut world = World::new();
        let catalog = catalog();
        assert_eq!(
            world.set_block(1, 2, 3, 1, &catalog),
            Err(EditError::OutOfBounds { x: 1, y: 2, z: 3 })
        );

        assert!(world.create_region(RegionCoord::ORIGIN));
        assert!(!world.create_region(RegionCoord::ORIGIN));
        assert_eq!(world.dirty_flags(RegionCoord::ORIGIN), SAVE_DIRTY | NETWORK_DIRTY);
        assert_eq!(world.get(RegionCoord::ORIGIN).unwrap().header(), &[BlockId::EMPTY]);

        world.set_block(1, 2, 3, 1, &catalog).unwrap();
        assert_eq!(world.get_block(1, 2, 3), catalog.get(1));
    }

    #[test]
    fn test_non_empty_blocks_lists_absolute_positions() {
        let mut world = world_with_origin();
        world.insert(RegionCoord::new(-1, 0, 0), Region::new());
        let catalog = catalog();
        world.set_block(100, 100, 100, 1, &catalog).unwrap();
        world.set_block(5, 0, 17, 2, &catalog).unwrap();
        world.set_mini_block(40, 0, 0, 2, &catalog).unwrap();
        world.set_block(-1, 0, 0, 2, &catalog).unwrap();

        let blocks = world.non_empty_blocks(RegionCoord::ORIGIN).unwrap();
        let listed: Vec<_> = blocks
            .iter()
            .map(|b| (b.resolution, b.position, b.index, b.id))
            .collect();
        assert_eq!(
            listed,
            vec![
                (Resolution::Block, [5, 0, 17], 2, catalog.get(2)),
                (Resolution::Block, [100, 100, 100], 1, catalog.get(1)),
                (Resolution::Mini, [40, 0, 0], 2, catalog.get(2)),
            ]
        );

        let west = world.non_empty_blocks(RegionCoord::new(-1, 0, 0)).unwrap();
        assert_eq!(west.len(), 1);
        assert_eq!(west[0].position, [-1, 0, 0]);
        assert_eq!(west[0].id, catalog.get(2));

        assert!(world.non_empty_blocks(RegionCoord::new(0, 1, 0)).is_none());
        assert!(World::new().non_empty_blocks(RegionCoord::ORIGIN).is_none());
    }

    #[test]
    fn test_primary_coord_prefers_origin() {
        let mut world = World::new();
        assert_eq!(world.primary_coord(), None);
        world.insert(RegionCoord::new(2, 0, 0), Region::new());
        world.insert(RegionCoord::new(-1, 5, 0), Region::new());
        assert_eq!(world.primary_coord(), Some(RegionCoord::new(-1, 5, 0)));
        world.insert(RegionCoord::ORIGIN, Region::new());
        assert_eq!(world.primary_coord(), Some(RegionCoord::ORIGIN));
        assert_eq!(world.coords().len(), 3);
    }

    #[test]
    fn test_summary_lists_occupied_chunks() {
        let mut world = world_with_origin();
        let catalog = catalog();
        world.set_block(100, 100, 100, 1, &catalog).unwrap();
        world.set_mini_block(40, 0, 0, 2, &catalog).unwrap();

        let summary = world.summary(RegionCoord::ORIGIN).unwrap();
        assert_eq!(summary.header.len(), 3);
        assert_eq!(summary.non_empty_chunks, vec![CellPos::new(6, 6, 6)]);
        assert_eq!(summary.non_empty_mini_chunks, vec![CellPos::new(1, 0, 0)]);
        assert!(world.summary(RegionCoord::new(1, 0, 0)).is_none());
    }
}
