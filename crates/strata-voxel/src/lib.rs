//! Voxel world storage: block identifiers, the block catalog, two-resolution
//! regions, the compressed region codec, and the world store that ties them
//! together with absolute-coordinate block edits.

pub mod addressing;
pub mod block_id;
pub mod catalog;
pub mod region;
pub mod region_codec;
pub mod storage;
pub mod world;

pub use addressing::{BlockAddress, CellPos, RegionCoord, Resolution};
pub use block_id::{BlockId, BlockIdError};
pub use catalog::{BlockCatalog, CatalogError};
pub use region::{CHUNK_EDGE, ChunkGrid, MINI_CHUNK_EDGE, PaletteIndex, REGION_CHUNKS, Region};
pub use region_codec::{RegionCodecError, byte_width, decode_region, encode_region};
pub use storage::{
    SaveBatch, SavedRegion, WorldLoadError, WorldSaveError, parse_region_file_name,
    region_file_name,
};
pub use world::{
    EditError, NETWORK_DIRTY, PlacedBlock, RegionSnapshot, RegionSummary, SAVE_DIRTY, World,
};
