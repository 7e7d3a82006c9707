//! Compressed binary encoding for [`Region`]s.
//!
//! ## Layout (before compression)
//!
//! | Size | Field |
//! |------|-------|
//! | 4 | Header length `N` (`i32`, little-endian) |
//! | N×6 | Header entries (raw 6-byte block ids, in order) |
//! | 16⁶ × W | Block grid, region-x/y/z then chunk-x/y/z, z fastest |
//! | 16³ × 32³ × W | Mini grid, same nesting |
//!
//! `W` is the byte width of each palette index. It is not stored; both sides
//! derive it from `N` with [`byte_width`]. The whole body is zlib-compressed.
//!
//! Decoding drops every all-zero header entry except the one at index 0, so a
//! decoded header can be shorter than the encoded one. Grid indices are read
//! back unchanged.

use std::io::{self, Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::block_id::BlockId;
use crate::region::{CHUNK_EDGE, ChunkGrid, MINI_CHUNK_EDGE, PaletteIndex, REGION_CHUNK_COUNT, Region};

/// Errors that can occur while encoding or decoding a region.
#[derive(Debug, thiserror::Error)]
pub enum RegionCodecError {
    /// The header has more entries than the 4-byte length field can carry.
    #[error("header length {0} does not fit the length field")]
    HeaderTooLarge(usize),

    /// A grid holds an index that does not fit the derived byte width.
    #[error("palette index {index} does not fit in {width} byte(s)")]
    IndexTooWide {
        /// The offending index.
        index: PaletteIndex,
        /// The byte width derived from the header length.
        width: usize,
    },

    /// The decoded length field is negative.
    #[error("negative header length: {0}")]
    NegativeHeaderLength(i32),

    /// The decompressed body ended early.
    #[error("region data truncated while reading {0}")]
    Truncated(&'static str),

    /// The compressed stream is corrupt, or writing it failed.
    #[error("region compression error: {0}")]
    Compression(#[source] io::Error),
}

/// Bytes per palette index for a header of `header_len` entries.
pub fn byte_width(header_len: usize) -> usize {
    if header_len <= 0xFF {
        1
    } else if header_len <= 0xFFFF {
        2
    } else {
        4
    }
}

/// Encodes a region into its compressed form.
pub fn encode_region(region: &Region) -> Result<Vec<u8>, RegionCodecError> {
    let header = region.header();
    let header_len =
        i32::try_from(header.len()).map_err(|_| RegionCodecError::HeaderTooLarge(header.len()))?;
    let width = byte_width(header.len());

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&header_len.to_le_bytes())
        .map_err(RegionCodecError::Compression)?;
    for id in header {
        encoder
            .write_all(id.as_bytes())
            .map_err(RegionCodecError::Compression)?;
    }

    write_grid(&mut encoder, region.data(), width)?;
    write_grid(&mut encoder, region.mini_data(), width)?;

    encoder.finish().map_err(RegionCodecError::Compression)
}

fn write_grid<W: Write>(
    writer: &mut W,
    grid: &ChunkGrid,
    width: usize,
) -> Result<(), RegionCodecError> {
    let chunk_bytes = grid.chunk_volume() * width;
    let zeros = vec![0u8; chunk_bytes];
    let mut scratch = vec![0u8; chunk_bytes];

    for chunk_index in 0..REGION_CHUNK_COUNT {
        let bytes = match grid.chunk_cells(chunk_index) {
            None => &zeros,
            Some(cells) => {
                for (slot, &value) in scratch.chunks_exact_mut(width).zip(cells) {
                    if width < 4 && value >> (8 * width) != 0 {
                        return Err(RegionCodecError::IndexTooWide { index: value, width });
                    }
                    slot.copy_from_slice(&value.to_le_bytes()[..width]);
                }
                &scratch
            }
        };
        writer
            .write_all(bytes)
            .map_err(RegionCodecError::Compression)?;
    }
    Ok(())
}

/// Decodes a compressed region.
pub fn decode_region(bytes: &[u8]) -> Result<Region, RegionCodecError> {
    let mut decoder = ZlibDecoder::new(bytes);

    let mut len_buf = [0u8; 4];
    read_section(&mut decoder, &mut len_buf, "header length")?;
    let header_len = i32::from_le_bytes(len_buf);
    if header_len < 0 {
        return Err(RegionCodecError::NegativeHeaderLength(header_len));
    }
    let header_len = header_len as usize;
    let width = byte_width(header_len);

    let mut header = Vec::new();
    let mut entry = [0u8; BlockId::LEN];
    for i in 0..header_len {
        read_section(&mut decoder, &mut entry, "header")?;
        let id = BlockId(entry);
        if id.is_empty() && i != 0 {
            continue;
        }
        header.push(id);
    }

    let data = read_grid(&mut decoder, CHUNK_EDGE, width, "block grid")?;
    let mini_data = read_grid(&mut decoder, MINI_CHUNK_EDGE, width, "mini grid")?;

    let max_index = data.max_index().max(mini_data.max_index());
    if max_index as usize >= header.len() {
        tracing::warn!(
            "Decoded region references palette index {} but its header has {} entries",
            max_index,
            header.len()
        );
    }

    Ok(Region::from_parts(header, data, mini_data))
}

fn read_grid<R: Read>(
    reader: &mut R,
    edge: usize,
    width: usize,
    section: &'static str,
) -> Result<ChunkGrid, RegionCodecError> {
    let mut grid = ChunkGrid::new(edge);
    let mut scratch = vec![0u8; grid.chunk_volume() * width];

    for chunk_index in 0..REGION_CHUNK_COUNT {
        read_section(reader, &mut scratch, section)?;
        if scratch.iter().all(|&b| b == 0) {
            continue;
        }
        let cells: Box<[PaletteIndex]> = scratch
            .chunks_exact(width)
            .map(|slot| {
                let mut le = [0u8; 4];
                le[..width].copy_from_slice(slot);
                PaletteIndex::from_le_bytes(le)
            })
            .collect();
        grid.put_chunk(chunk_index, Some(cells));
    }
    Ok(grid)
}

fn read_section<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    section: &'static str,
) -> Result<(), RegionCodecError> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            RegionCodecError::Truncated(section)
        } else {
            RegionCodecError::Compression(e)
        }
    })
}
