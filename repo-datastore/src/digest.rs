use std::io::Read;

use anyhow::Error;

/// Compute the SHA-256 digest of everything a reader produces,
/// returning the digest and the total byte count read.
///
/// Mirrors the source's whole-buffer `sha256sum`, but streams through
/// a fixed-size buffer instead of requiring the caller to have
/// already materialized the data in memory.
pub fn sha256(reader: &mut dyn Read) -> Result<([u8; 32], u64), Error> {
    let mut hasher = openssl::sha::Sha256::new();
    let mut buffer = [0u8; 256 * 1024];
    let mut size: u64 = 0;

    loop {
        let count = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(count) => count,
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        size += count as u64;
        hasher.update(&buffer[..count]);
    }

    Ok((hasher.finish(), size))
}

/// Convenience wrapper for the common case of hashing an in-memory
/// byte slice (test fixtures, small blobs already read to completion).
pub fn sha256_bytes(data: &[u8]) -> [u8; 32] {
    openssl::sha::sha256(data)
}
