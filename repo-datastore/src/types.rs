use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

/// Content-defined identifier for a plaintext chunk: the hash of the
/// unencrypted chunk under the chunking layer's fixed hash function.
///
/// Printable form is lowercase hex; this is also how it is used as a
/// map key when snapshots are deserialized from JSON.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId(#[serde(with = "hex::serde")] [u8; 32]);

impl ChunkId {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ChunkId({})", self.to_hex())
    }
}

impl FromStr for ChunkId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let raw = hex::decode(s)?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|v: Vec<u8>| anyhow::format_err!("chunk id has {} bytes, expected 32", v.len()))?;
        Ok(Self(bytes))
    }
}

/// A record stored inside a snapshot's `blobsMap`, describing how a
/// chunk is represented on the backend.
///
/// `length` and `uncompressed_length` are 64-bit: the original format
/// this crate replaces used a 32-bit on-backend length, which cannot
/// represent blobs at or above 2 GiB. We widen rather than silently
/// truncate (see DESIGN.md).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobDescriptor {
    #[serde(with = "hex::serde")]
    pub id: [u8; 32],
    pub length: u64,
    pub uncompressed_length: u64,
}

impl BlobDescriptor {
    pub fn new(id: [u8; 32], length: u64, uncompressed_length: u64) -> Self {
        Self {
            id,
            length,
            uncompressed_length,
        }
    }

    pub fn id_hex(&self) -> String {
        hex::encode(self.id)
    }
}

/// A single entry from the backend's directory listing: an opaque
/// blob id and its on-backend byte length.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobInfo {
    pub id: [u8; 32],
    pub size: u64,
}

impl BlobInfo {
    pub fn new(id: [u8; 32], size: u64) -> Self {
        Self { id, size }
    }

    pub fn id_hex(&self) -> String {
        hex::encode(self.id)
    }
}

/// Parse a 32-byte blob or chunk id out of a hex string, failing fast
/// the way the source rejects malformed ids (`InvalidArgument`).
pub fn parse_id(hex_str: &str) -> Result<[u8; 32], Error> {
    let raw = hex::decode(hex_str)?;
    if raw.len() != 32 {
        bail!("expected a 32 byte id, got {} bytes", raw.len());
    }
    let mut id = [0u8; 32];
    id.copy_from_slice(&raw);
    Ok(id)
}
