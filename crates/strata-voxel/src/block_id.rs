//! Six-byte block-type identifiers.
//!
//! Region headers store raw identifiers; the text form (12 lowercase hex
//! digits) is what the block catalog file and the TCP catalog listing use.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A 48-bit block-type identifier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlockId(pub [u8; 6]);

impl BlockId {
    /// Size of an identifier on disk and on the wire.
    pub const LEN: usize = 6;

    /// The all-zero identifier, conventionally "empty" / air.
    pub const EMPTY: Self = Self([0; 6]);

    /// Returns `true` for the all-zero identifier.
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    /// Raw bytes in header order.
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Errors produced when parsing the hex form of a [`BlockId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockIdError {
    /// The string was not exactly 12 characters long.
    #[error("block id must be 12 hex digits, got {0} characters")]
    InvalidLength(usize),
    /// The string contained a non-hex character.
    #[error("block id contains non-hex digits: {0:?}")]
    InvalidHex(String),
}

impl FromStr for BlockId {
    type Err = BlockIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != Self::LEN * 2 {
            return Err(BlockIdError::InvalidLength(s.len()));
        }
        // from_str_radix tolerates a leading '+', so check the digits up front
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(BlockIdError::InvalidHex(s.to_string()));
        }

        let mut bytes = [0u8; 6];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = &s[i * 2..i * 2 + 2];
            *byte = u8::from_str_radix(pair, 16)
                .map_err(|_| BlockIdError::InvalidHex(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for BlockId {
    type Error = BlockIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BlockId> for String {
    fn from(id: BlockId) -> Self {
        id.to_string()
    }
}
