//! The persistent blob cache: the on-disk half of the blob index,
//! plus the quarantine of known-bad blob ids. Both files live under
//! one process-private directory and are best-effort accelerators:
//! losing either is never fatal to a backup or a check run.

mod log;
mod quarantine;

use std::collections::{HashMap, HashSet};

use anyhow::Error;
use repo_datastore::{BlobDescriptor, ChunkId};

use crate::config::RepositoryConfig;

pub use log::CacheLog;
pub use quarantine::Quarantine;

pub struct BlobCache {
    log: CacheLog,
    quarantine: Quarantine,
}

impl BlobCache {
    pub fn new(config: &RepositoryConfig) -> Self {
        Self {
            log: CacheLog::new(config.cache_log_path()),
            quarantine: Quarantine::new(config.quarantine_path()),
        }
    }

    pub fn save_new_blob(&self, chunk_id: &ChunkId, blob: &BlobDescriptor) -> Result<(), Error> {
        self.log.save_new_blob(chunk_id, blob)
    }

    pub fn clear_local_cache(&self) -> Result<(), Error> {
        self.log.clear()
    }

    pub fn load(&self, allowed: &HashMap<[u8; 32], u64>) -> Vec<(ChunkId, BlobDescriptor)> {
        self.log.load(allowed)
    }

    pub fn do_not_use_blob(&self, id: &[u8; 32]) -> Result<(), Error> {
        self.quarantine.do_not_use_blob(id)
    }

    pub fn get_quarantine(&self) -> HashSet<String> {
        self.quarantine.get_quarantine()
    }

    pub fn on_blobs_removed(&self, removed: &HashSet<String>) -> Result<(), Error> {
        self.quarantine.on_blobs_removed(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repo_datastore::BlobDescriptor;

    fn config(dir: &tempfile::TempDir) -> RepositoryConfig {
        RepositoryConfig::new(dir.path())
    }

    #[test]
    fn p1_round_trip_through_fresh_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);

        let cache = BlobCache::new(&cfg);
        let chunk_a = ChunkId::new([1u8; 32]);
        let blob_a = BlobDescriptor::new([0xaa; 32], 10, 10);
        let chunk_b = ChunkId::new([2u8; 32]);
        let blob_b = BlobDescriptor::new([0xbb; 32], 20, 20);

        cache.save_new_blob(&chunk_a, &blob_a).unwrap();
        cache.save_new_blob(&chunk_b, &blob_b).unwrap();

        let fresh = BlobCache::new(&cfg);
        let allowed: HashMap<[u8; 32], u64> =
            [(blob_a.id, blob_a.length), (blob_b.id, blob_b.length)]
                .into_iter()
                .collect();

        let mut loaded = fresh.load(&allowed);
        loaded.sort_by_key(|(id, _)| id.to_hex());

        assert_eq!(loaded, vec![(chunk_a, blob_a), (chunk_b, blob_b)]);
    }

    #[test]
    fn p2_populate_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let cache = BlobCache::new(&cfg);

        let chunk = ChunkId::new([9u8; 32]);
        let blob = BlobDescriptor::new([0x11; 32], 5, 5);
        cache.save_new_blob(&chunk, &blob).unwrap();

        let allowed: HashMap<[u8; 32], u64> = [(blob.id, blob.length)].into_iter().collect();
        let first = cache.load(&allowed);
        let second = cache.load(&allowed);
        assert_eq!(first, second);
    }

    #[test]
    fn p5_blob_absent_from_backend_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let cache = BlobCache::new(&cfg);

        let chunk = ChunkId::new([3u8; 32]);
        let blob = BlobDescriptor::new([0xcc; 32], 100, 100);
        cache.save_new_blob(&chunk, &blob).unwrap();

        let allowed: HashMap<[u8; 32], u64> = HashMap::new();
        assert!(cache.load(&allowed).is_empty());
    }

    #[test]
    fn p6_size_mismatch_filters_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let cache = BlobCache::new(&cfg);

        let chunk = ChunkId::new([4u8; 32]);
        let blob = BlobDescriptor::new([0xdd; 32], 100, 100);
        cache.save_new_blob(&chunk, &blob).unwrap();

        // backend reports a different size for the same blob id
        let allowed: HashMap<[u8; 32], u64> = [(blob.id, 99)].into_iter().collect();
        assert!(cache.load(&allowed).is_empty());
    }

    #[test]
    fn truncated_trailing_record_does_not_lose_prior_records() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let cache = BlobCache::new(&cfg);

        let chunk = ChunkId::new([5u8; 32]);
        let blob = BlobDescriptor::new([0xee; 32], 7, 7);
        cache.save_new_blob(&chunk, &blob).unwrap();

        // Append a truncated trailing record: a full chunk id with no
        // length/payload behind it.
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(cfg.cache_log_path())
            .unwrap();
        file.write_all(&[0xff; 32]).unwrap();

        let allowed: HashMap<[u8; 32], u64> = [(blob.id, blob.length)].into_iter().collect();
        let loaded = cache.load(&allowed);
        assert_eq!(loaded, vec![(chunk, blob)]);
    }

    #[test]
    fn p3_and_scenario6_quarantine_persists_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let cache = BlobCache::new(&cfg);

        let b1 = [0x01u8; 32];
        let b2 = [0x02u8; 32];
        cache.do_not_use_blob(&b1).unwrap();
        cache.do_not_use_blob(&b2).unwrap();

        // restart: fresh instance, same config
        let restarted = BlobCache::new(&cfg);
        let quarantine = restarted.get_quarantine();
        assert_eq!(
            quarantine,
            [hex::encode(b1), hex::encode(b2)].into_iter().collect()
        );

        let removed: HashSet<String> = [hex::encode(b1), "foo".to_string()].into_iter().collect();
        restarted.on_blobs_removed(&removed).unwrap();

        let remaining = restarted.get_quarantine();
        assert_eq!(remaining, [hex::encode(b2)].into_iter().collect());
    }

    #[test]
    fn i3_corrupt_quarantine_trailing_bytes_are_discarded_but_prior_ids_kept() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let cache = BlobCache::new(&cfg);

        let good = [0x03u8; 32];
        cache.do_not_use_blob(&good).unwrap();

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(cfg.quarantine_path())
            .unwrap();
        file.write_all(&[0u8; 5]).unwrap(); // not a multiple of 32 anymore

        // The id read before the corrupt trailing bytes is still returned.
        assert_eq!(cache.get_quarantine(), [hex::encode(good)].into_iter().collect());
        assert!(!cfg.quarantine_path().exists());
    }

    #[test]
    fn on_blobs_removed_with_missing_file_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let cache = BlobCache::new(&cfg);

        let removed: HashSet<String> = HashSet::new();
        assert!(cache.on_blobs_removed(&removed).is_ok());
    }
}
