//! Streaming content hash over an async byte stream, so a sampled
//! blob's full body is never buffered in memory (the async analogue
//! of `repo_datastore::digest::sha256` for a synchronous `Read`).

use openssl::sha::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt};

const BUFFER_SIZE: usize = 256 * 1024;

pub async fn hash_async_stream(
    reader: &mut (dyn AsyncRead + Send + Unpin),
) -> std::io::Result<([u8; 32], u64)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        total += read as u64;
    }

    Ok((hasher.finish(), total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn matches_openssl_oneshot() {
        let data = b"integrity core sample content".to_vec();
        let mut cursor = Cursor::new(data.clone());
        let (digest, len) = hash_async_stream(&mut cursor).await.unwrap();

        assert_eq!(digest, openssl::sha::sha256(&data));
        assert_eq!(len, data.len() as u64);
    }

    #[tokio::test]
    async fn empty_stream_hashes_to_empty_digest() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let (digest, len) = hash_async_stream(&mut cursor).await.unwrap();

        assert_eq!(digest, openssl::sha::sha256(&[]));
        assert_eq!(len, 0);
    }
}
