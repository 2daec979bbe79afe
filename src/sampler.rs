//! The sampler: picks a size-weighted random subset of blobs to
//! verify on a check run, biased toward application data over
//! installable-package artifacts, since package artifacts can be
//! recovered by reinstall and application data cannot.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use repo_datastore::{BlobDescriptor, ChunkId, Snapshot};

/// One entry chosen for verification: the chunk id as referenced by
/// some snapshot, and the descriptor that chunk resolved to there.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SampleEntry {
    pub chunk_id: ChunkId,
    pub blob: BlobDescriptor,
}

/// Build the verification sample for `snapshots` at `percent` (already
/// validated to be in `[0, 100]` by the caller).
pub fn sample(snapshots: &[Snapshot], percent: u8) -> Vec<SampleEntry> {
    let (mut app_entries, app_size) = collect_unique(snapshots, Snapshot::app_data_chunk_ids);
    let (mut apk_entries, apk_size) = collect_unique(snapshots, Snapshot::package_chunk_ids);

    let total_size = app_size + apk_size;
    let target_size = (total_size as f64 * percent as f64 / 100.0).round() as u64;
    let app_target_size = ((target_size as f64 * 0.75).round() as u64).min(app_size);

    let mut rng = rand::thread_rng();
    app_entries.shuffle(&mut rng);
    apk_entries.shuffle(&mut rng);

    let mut result = Vec::new();
    let mut accumulated = 0u64;
    for entry in app_entries {
        if accumulated >= app_target_size {
            break;
        }
        accumulated += entry.blob.length;
        result.push(entry);
    }

    for entry in apk_entries {
        if accumulated >= target_size {
            break;
        }
        accumulated += entry.blob.length;
        result.push(entry);
    }

    result
}

/// Walk `snapshots` in order, collecting `(chunk_id, blob)` pairs
/// reachable through `chunk_ids_of`, deduplicated by `blob.id` (not by
/// chunk id: a chunk id with differing descriptors across snapshots
/// legitimately yields more than one entry).
fn collect_unique<'a, F, I>(snapshots: &'a [Snapshot], chunk_ids_of: F) -> (Vec<SampleEntry>, u64)
where
    F: Fn(&'a Snapshot) -> I,
    I: Iterator<Item = &'a ChunkId>,
{
    let mut seen_blob_ids = HashMap::new();
    let mut entries = Vec::new();
    let mut total = 0u64;

    for snapshot in snapshots {
        for chunk_id in chunk_ids_of(snapshot) {
            let Some(blob) = snapshot.blob_for(chunk_id) else {
                continue;
            };
            if seen_blob_ids.insert(blob.id, ()).is_some() {
                continue;
            }
            total += blob.length;
            entries.push(SampleEntry {
                chunk_id: *chunk_id,
                blob: blob.clone(),
            });
        }
    }

    (entries, total)
}
