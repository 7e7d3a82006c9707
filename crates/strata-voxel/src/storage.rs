//! Region files on disk.
//!
//! Each region lives in its own file named `{x}.{y}.{z}.dat` inside the world
//! directory, holding exactly the bytes produced by
//! [`encode_region`](crate::encode_region).
//!
//! Saving is split in two so the file writes need not hold the world:
//! [`World::save_batch`] captures what to write, [`SaveBatch::write`] does
//! the encoding and I/O, and [`World::finish_save`] records the outcome.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::addressing::RegionCoord;
use crate::region_codec::{RegionCodecError, decode_region};
use crate::world::{RegionSnapshot, World};

/// Errors from loading a world directory.
#[derive(Debug, Error)]
pub enum WorldLoadError {
    #[error("failed to read world directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read region file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to decode region file {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: RegionCodecError,
    },
}

/// Errors from writing regions to disk.
#[derive(Debug, Error)]
pub enum WorldSaveError {
    #[error("failed to create world directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode region {coord}: {source}")]
    Encode {
        coord: RegionCoord,
        #[source]
        source: RegionCodecError,
    },
    #[error("failed to write region file {path}: {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// File name for the region at `coord`.
pub fn region_file_name(coord: RegionCoord) -> String {
    format!("{}.{}.{}.dat", coord.x, coord.y, coord.z)
}

/// Parses a region file name back into its coordinate. Returns `None` for
/// any name that is not exactly `{int}.{int}.{int}.dat`.
pub fn parse_region_file_name(name: &str) -> Option<RegionCoord> {
    let stem = name.strip_suffix(".dat")?;
    let mut parts = stem.split('.');
    let x = parts.next()?.parse().ok()?;
    let y = parts.next()?.parse().ok()?;
    let z = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(RegionCoord::new(x, y, z))
}

impl World {
    /// Loads every region file in `dir`. A missing directory yields an
    /// empty world; files whose names do not match the region pattern are
    /// ignored.
    pub fn load_dir(dir: &Path) -> Result<Self, WorldLoadError> {
        let mut world = World::new();

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!("World directory {} does not exist, starting empty", dir.display());
                return Ok(world);
            }
            Err(source) => {
                return Err(WorldLoadError::ReadDir {
                    path: dir.to_path_buf(),
                    source,
                });
            }
        };

        for entry in entries {
            let entry = entry.map_err(|source| WorldLoadError::ReadDir {
                path: dir.to_path_buf(),
                source,
            })?;
            let name = entry.file_name();
            let Some(coord) = name.to_str().and_then(parse_region_file_name) else {
                continue;
            };

            let path = entry.path();
            let bytes = fs::read(&path).map_err(|source| WorldLoadError::ReadFile {
                path: path.clone(),
                source,
            })?;
            let region = decode_region(&bytes).map_err(|source| WorldLoadError::Decode {
                path: path.clone(),
                source,
            })?;
            tracing::debug!(
                "Loaded region {} ({} palette entries) from {}",
                coord,
                region.header().len(),
                path.display()
            );
            world.insert(coord, region);
        }

        tracing::info!("Loaded {} region(s) from {}", world.len(), dir.display());
        Ok(world)
    }

    /// Captures every loaded region for writing to `dir`. Regions with a
    /// current cached encoding are not copied.
    pub fn save_batch(&self, dir: &Path) -> SaveBatch {
        let items = self
            .coords()
            .into_iter()
            .filter_map(|coord| {
                let generation = self.generation(coord)?;
                let source = match self.cached_encoding(coord) {
                    Some(bytes) => SaveSource::Encoded { coord, generation, bytes },
                    None => SaveSource::Snapshot(self.snapshot(coord)?),
                };
                Some(source)
            })
            .collect();
        SaveBatch {
            dir: dir.to_path_buf(),
            items,
        }
    }

    /// Records a finished batch: caches fresh encodings and clears the
    /// save-dirty flag of every region not edited while it was written.
    pub fn finish_save(&mut self, saved: &[SavedRegion]) {
        for region in saved {
            self.store_encoded(region.coord, region.generation, Arc::clone(&region.bytes));
            self.mark_saved(region.coord, region.generation);
        }
    }

    /// Writes every loaded region to `dir` on the calling thread. Returns
    /// the number of files written.
    pub fn save_all(&mut self, dir: &Path) -> Result<usize, WorldSaveError> {
        let saved = self.save_batch(dir).write()?;
        self.finish_save(&saved);
        Ok(saved.len())
    }
}

#[derive(Debug)]
enum SaveSource {
    Encoded {
        coord: RegionCoord,
        generation: u64,
        bytes: Arc<Vec<u8>>,
    },
    Snapshot(RegionSnapshot),
}

/// Regions captured by [`World::save_batch`], detached from the world.
#[derive(Debug)]
pub struct SaveBatch {
    dir: PathBuf,
    items: Vec<SaveSource>,
}

/// One region file written by [`SaveBatch::write`].
#[derive(Clone, Debug)]
pub struct SavedRegion {
    pub coord: RegionCoord,
    pub generation: u64,
    pub bytes: Arc<Vec<u8>>,
}

impl SaveBatch {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Encodes what needs encoding and writes one file per region,
    /// creating the directory if needed. Stops at the first failure.
    pub fn write(self) -> Result<Vec<SavedRegion>, WorldSaveError> {
        fs::create_dir_all(&self.dir).map_err(|source| WorldSaveError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;

        let mut saved = Vec::with_capacity(self.items.len());
        for item in self.items {
            let region = match item {
                SaveSource::Encoded { coord, generation, bytes } => SavedRegion {
                    coord,
                    generation,
                    bytes,
                },
                SaveSource::Snapshot(snapshot) => {
                    let bytes = snapshot.encode().map_err(|source| WorldSaveError::Encode {
                        coord: snapshot.coord,
                        source,
                    })?;
                    SavedRegion {
                        coord: snapshot.coord,
                        generation: snapshot.generation,
                        bytes: Arc::new(bytes),
                    }
                }
            };

            let path = self.dir.join(region_file_name(region.coord));
            fs::write(&path, region.bytes.as_slice())
                .map_err(|source| WorldSaveError::WriteFile { path, source })?;
            saved.push(region);
        }

        tracing::info!("Saved {} region(s) to {}", saved.len(), self.dir.display());
        Ok(saved)
    }
}
