//! Save-state container
//!
//! ```text
//! ┌──────────┬─────────────┬──────────────────┬────────────────┐
//! │ "PNSS"   │ version u32 │ xxh3 checksum u64│ bincode body   │
//! └──────────┴─────────────┴──────────────────┴────────────────┘
//!   4 bytes    little-endian  over the body      variable
//! ```
//!
//! The checksum only guards against truncated or corrupted blobs; it is not
//! an integrity mechanism against tampering.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use xxhash_rust::xxh3::xxh3_64;

pub const MAGIC: [u8; 4] = *b"PNSS";

/// Bumped whenever a persisted structure changes shape
pub const VERSION: u32 = 1;

pub const HEADER_SIZE: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum SaveStateError {
    #[error("save state is truncated ({0} bytes)")]
    Truncated(usize),
    #[error("not a network save state")]
    BadMagic,
    #[error("unsupported save state version {found} (expected {VERSION})")]
    UnsupportedVersion { found: u32 },
    #[error("save state checksum mismatch: stored {stored:#018x}, computed {computed:#018x}")]
    ChecksumMismatch { stored: u64, computed: u64 },
    #[error("save state serialization failed: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Serialize `value` into a checksummed blob
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, SaveStateError> {
    let body = bincode::serialize(value)?;
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(&MAGIC);
    // Writes into a Vec cannot fail
    let _ = out.write_u32::<LittleEndian>(VERSION);
    let _ = out.write_u64::<LittleEndian>(xxh3_64(&body));
    out.extend_from_slice(&body);
    Ok(out)
}

/// Validate the header and checksum, then deserialize the body
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, SaveStateError> {
    if data.len() < HEADER_SIZE {
        return Err(SaveStateError::Truncated(data.len()));
    }
    let mut cursor = Cursor::new(data);
    let mut magic = [0u8; 4];
    cursor
        .read_exact(&mut magic)
        .map_err(|_| SaveStateError::Truncated(data.len()))?;
    if magic != MAGIC {
        return Err(SaveStateError::BadMagic);
    }
    let version = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| SaveStateError::Truncated(data.len()))?;
    if version != VERSION {
        return Err(SaveStateError::UnsupportedVersion { found: version });
    }
    let stored = cursor
        .read_u64::<LittleEndian>()
        .map_err(|_| SaveStateError::Truncated(data.len()))?;

    let body = &data[HEADER_SIZE..];
    let computed = xxh3_64(body);
    if stored != computed {
        return Err(SaveStateError::ChecksumMismatch { stored, computed });
    }
    Ok(bincode::deserialize(body)?)
}
