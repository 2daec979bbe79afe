//! The persistent cache log: an append-only record of
//! `(ChunkId, BlobDescriptor)` pairs written during a backup so the
//! next run (or the same run, after a restart) never re-uploads data
//! the backend already has.
//!
//! Record framing: 32 raw bytes of chunk id, an unsigned LEB128
//! varint byte count, then that many bytes of the descriptor's
//! canonical (JSON) encoding. Corruption is handled the way the
//! source treats its chunk cache: a truncated trailing record is a
//! normal end-of-file, not an error, and any other parse failure on a
//! record is logged and treated as the end of readable data (I2).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::Error;
use repo_datastore::{BlobDescriptor, ChunkId};

pub struct CacheLog {
    path: PathBuf,
}

impl CacheLog {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Append one `(chunk_id, blob)` record. Duplicate records across
    /// calls (or across process restarts) are tolerated; `load`
    /// simply re-inserts them, and the index de-duplicates by chunk
    /// id on the way in.
    pub fn save_new_blob(&self, chunk_id: &ChunkId, blob: &BlobDescriptor) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        file.write_all(chunk_id.as_bytes())?;

        let payload = serde_json::to_vec(blob)?;
        write_varint(&mut file, payload.len() as u64)?;
        file.write_all(&payload)?;

        file.flush()?;
        Ok(())
    }

    /// Delete the cache log file. A missing file is not an error.
    pub fn clear(&self) -> Result<(), Error> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Stream every readable `(chunk_id, blob)` record, keeping only
    /// those whose blob id/length match `allowed`. Never fails: a
    /// missing file, a truncated final record, or an unparseable
    /// record are all best-effort conditions, logged and otherwise
    /// ignored, matching the source's treatment of the cache as a
    /// pure accelerator whose loss is never fatal.
    pub fn load(&self, allowed: &HashMap<[u8; 32], u64>) -> Vec<(ChunkId, BlobDescriptor)> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                log::warn!("could not open cache log {:?}: {}", self.path, err);
                return Vec::new();
            }
        };

        let mut kept = Vec::new();

        loop {
            let mut id_buf = [0u8; 32];
            match read_fully_or_eof(&mut file, &mut id_buf) {
                ReadOutcome::Eof => break,
                ReadOutcome::Truncated(_) => break,
                ReadOutcome::Full => {}
            }

            let len = match read_varint(&mut file) {
                Ok(Some(len)) => len,
                Ok(None) => break, // truncated varint: trailing partial record
                Err(err) => {
                    log::warn!("cache log {:?} is corrupt: {}", self.path, err);
                    break;
                }
            };

            let mut payload = vec![0u8; len as usize];
            if let Err(err) = file.read_exact(&mut payload) {
                if err.kind() == std::io::ErrorKind::UnexpectedEof {
                    break; // truncated trailing record
                }
                log::warn!("cache log {:?} is corrupt: {}", self.path, err);
                break;
            }

            let blob: BlobDescriptor = match serde_json::from_slice(&payload) {
                Ok(blob) => blob,
                Err(err) => {
                    log::warn!(
                        "cache log {:?} contains an unparseable record, stopping: {}",
                        self.path,
                        err
                    );
                    break;
                }
            };

            let chunk_id = ChunkId::new(id_buf);

            match allowed.get(&blob.id) {
                Some(&size) if size == blob.length => kept.push((chunk_id, blob)),
                Some(&size) => log::warn!(
                    "dropping cached blob {}: backend size {} != cached length {}",
                    blob.id_hex(),
                    size,
                    blob.length
                ),
                None => log::warn!(
                    "dropping cached blob {}: not present on the backend",
                    blob.id_hex()
                ),
            }
        }

        kept
    }
}

enum ReadOutcome {
    Full,
    Truncated(usize),
    Eof,
}

/// Read exactly `buf.len()` bytes, or report how far we got before
/// hitting EOF. Zero bytes read before EOF is a clean end of stream;
/// any positive-but-short read is a truncated trailing record (I2).
fn read_fully_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> ReadOutcome {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return if filled == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Truncated(filled)
                };
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => return ReadOutcome::Truncated(filled),
        }
    }
    ReadOutcome::Full
}

fn write_varint(writer: &mut impl Write, mut value: u64) -> Result<(), Error> {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        writer.write_all(&[byte])?;
        if value == 0 {
            break;
        }
    }
    Ok(())
}

/// Returns `Ok(None)` when EOF is hit before a complete varint is
/// read (the trailing-partial-record case); `Err` for a malformed
/// (over-long) varint.
fn read_varint(reader: &mut impl Read) -> Result<Option<u64>, Error> {
    let mut value: u64 = 0;
    let mut shift = 0;
    loop {
        let mut byte = [0u8; 1];
        match reader.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
        value |= ((byte[0] & 0x7f) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(Some(value));
        }
        shift += 7;
        if shift >= 64 {
            anyhow::bail!("varint too long");
        }
    }
}
