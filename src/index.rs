//! The in-memory blob index: the runtime `ChunkId -> BlobDescriptor`
//! mapping a backup run consults before uploading a chunk, rebuilt at
//! the start of every population cycle from the persistent cache, the
//! current snapshot set and a fresh backend listing.

use std::collections::HashMap;

use repo_datastore::{BlobDescriptor, BlobInfo, ChunkId, Snapshot};

use crate::cache::BlobCache;

/// Write-once-per-chunk mapping populated by [`BlobIndex::populate`].
#[derive(Default)]
pub struct BlobIndex {
    entries: HashMap<ChunkId, BlobDescriptor>,
}

impl BlobIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the index from scratch: backend listing, minus
    /// quarantined ids, plus the persistent cache, plus every
    /// snapshot's own `blobsMap`.
    pub fn populate(&mut self, cache: &BlobCache, backend_blobs: &[BlobInfo], snapshots: &[Snapshot]) {
        self.entries.clear();

        let mut allowed: HashMap<[u8; 32], u64> =
            backend_blobs.iter().map(|info| (info.id, info.size)).collect();

        for quarantined in cache.get_quarantine() {
            if let Ok(raw) = hex::decode(&quarantined) {
                if let Ok(id) = <[u8; 32]>::try_from(raw.as_slice()) {
                    allowed.remove(&id);
                }
            }
        }

        for (chunk_id, blob) in cache.load(&allowed) {
            self.entries.insert(chunk_id, blob);
        }

        for snapshot in snapshots {
            for (chunk_id, blob) in &snapshot.blobs_map {
                match allowed.get(&blob.id) {
                    Some(&size) if size == blob.length => {
                        self.put_if_absent(*chunk_id, blob.clone());
                    }
                    Some(&size) => log::warn!(
                        "snapshot {} references blob {} with length {} but backend reports {}",
                        snapshot.token,
                        blob.id_hex(),
                        blob.length,
                        size
                    ),
                    None => log::warn!(
                        "snapshot {} references blob {} which is not on the backend",
                        snapshot.token,
                        blob.id_hex()
                    ),
                }
            }
        }
    }

    fn put_if_absent(&mut self, chunk_id: ChunkId, blob: BlobDescriptor) {
        match self.entries.get(&chunk_id) {
            Some(existing) if existing.id != blob.id => {
                log::warn!(
                    "chunk {} already mapped to blob {}, ignoring conflicting blob {}",
                    chunk_id,
                    existing.id_hex(),
                    blob.id_hex()
                );
            }
            Some(_) => {}
            None => {
                self.entries.insert(chunk_id, blob);
            }
        }
    }

    pub fn get(&self, chunk_id: &ChunkId) -> Option<&BlobDescriptor> {
        self.entries.get(chunk_id)
    }

    pub fn contains_all(&self, chunk_ids: &[ChunkId]) -> bool {
        chunk_ids.iter().all(|id| self.entries.contains_key(id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert `(chunk_id, blob)` only if `chunk_id` is absent, and in
    /// that case also persist it to the cache. A no-op (on both the
    /// index and the cache) if `chunk_id` is already mapped.
    pub fn save_new_blob(
        &mut self,
        cache: &BlobCache,
        chunk_id: ChunkId,
        blob: BlobDescriptor,
    ) -> anyhow::Result<()> {
        if self.entries.contains_key(&chunk_id) {
            return Ok(());
        }
        cache.save_new_blob(&chunk_id, &blob)?;
        self.entries.insert(chunk_id, blob);
        Ok(())
    }
}
