//! Block catalog: maps the small wire-level block indices clients use to the
//! six-byte identifiers stored in region headers.
//!
//! The catalog is loaded once at startup from a JSON file of the form
//! `{"blocks": ["000000000000", "5655135ebc9c", ...]}` and is read-only
//! afterwards. Position in the list is the wire index.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::block_id::BlockId;

/// Errors that can occur while loading a catalog file.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The catalog file could not be read.
    #[error("failed to read block catalog: {0}")]
    Read(#[source] std::io::Error),
    /// The catalog file is not valid catalog JSON.
    #[error("failed to parse block catalog: {0}")]
    Parse(#[source] serde_json::Error),
}

/// Ordered list of block identifiers addressable by wire index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCatalog {
    blocks: Vec<BlockId>,
}

impl BlockCatalog {
    /// Creates a catalog from an ordered list of identifiers.
    pub fn new(blocks: Vec<BlockId>) -> Self {
        Self { blocks }
    }

    /// Loads a catalog from a JSON file.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let contents = std::fs::read_to_string(path).map_err(CatalogError::Read)?;
        let catalog = Self::from_json(&contents)?;
        tracing::info!(
            "Loaded block catalog with {} entries from {}",
            catalog.len(),
            path.display()
        );
        Ok(catalog)
    }

    /// Parses a catalog from its JSON text.
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        serde_json::from_str(json).map_err(CatalogError::Parse)
    }

    /// Returns the identifier for a wire index, or `None` if out of range.
    pub fn get(&self, index: u32) -> Option<BlockId> {
        self.blocks.get(index as usize).copied()
    }

    /// All identifiers in wire-index order.
    pub fn ids(&self) -> &[BlockId] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{"blocks": ["000000000000", "5655135ebc9c", "2f9e4658c3f0"]}"#;

    #[test]
    fn test_parse_sample_catalog() {
        let catalog = BlockCatalog::from_json(SAMPLE).unwrap();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.get(0), Some(BlockId::EMPTY));
        assert_eq!(catalog.get(1).unwrap().to_string(), "5655135ebc9c");
        assert_eq!(catalog.get(2).unwrap().to_string(), "2f9e4658c3f0");
    }

    #[test]
    fn test_out_of_range_index_is_none() {
        let catalog = BlockCatalog::from_json(SAMPLE).unwrap();
        assert_eq!(catalog.get(3), None);
        assert_eq!(catalog.get(u32::MAX), None);
    }

    #[test]
    fn test_invalid_id_rejected() {
        let result = BlockCatalog::from_json(r#"{"blocks": ["nothex"]}"#);
        assert!(matches!(result, Err(CatalogError::Parse(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let catalog = BlockCatalog::load(&path).unwrap();
        assert_eq!(catalog.ids().len(), 3);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = BlockCatalog::load(&dir.path().join("missing.json"));
        assert!(matches!(result, Err(CatalogError::Read(_))));
    }
}
