use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use repo_datastore::{BlobDescriptor, ChunkId, Snapshot};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, CheckNotifier, ListKind, SnapshotLoader};
use crate::cache::BlobCache;
use crate::config::validate_percent;
use crate::error::{CoreError, Result};
use crate::index::BlobIndex;
use crate::sampler::{self, SampleEntry};

use super::hashing::hash_async_stream;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Where a check run currently is. `Idle` and the two terminal states
/// are the only ones in which `Checker::result` is meaningful.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckState {
    Idle,
    Loading,
    Sampling,
    Verifying,
    Done,
}

/// The outcome of a completed check run. `Error`'s good/bad snapshot
/// partition is derived on demand, never stored.
#[derive(Clone, Debug)]
pub enum CheckResult {
    Success {
        snapshots: Vec<Snapshot>,
        percent: u8,
        bytes_checked: u64,
    },
    Error {
        existing_snapshots: usize,
        snapshots: Vec<Snapshot>,
        bad_pairs: HashSet<(ChunkId, BlobDescriptor)>,
    },
    GeneralError {
        cause: String,
    },
}

impl CheckResult {
    /// Snapshots with no chunk whose `(chunkId, blob)` pair is bad.
    /// Only meaningful on `Error`; empty for `Success`/`GeneralError`.
    pub fn good_snapshots(&self) -> Vec<&Snapshot> {
        match self {
            CheckResult::Error {
                snapshots,
                bad_pairs,
                ..
            } => snapshots.iter().filter(|s| !snapshot_is_bad(s, bad_pairs)).collect(),
            _ => Vec::new(),
        }
    }

    /// Snapshots that reference at least one bad `(chunkId, blob)`
    /// pair. Sharing a chunk id with a bad pair is not sufficient:
    /// the blob id referenced by *this* snapshot must match too (P8).
    pub fn bad_snapshots(&self) -> Vec<&Snapshot> {
        match self {
            CheckResult::Error {
                snapshots,
                bad_pairs,
                ..
            } => snapshots.iter().filter(|s| snapshot_is_bad(s, bad_pairs)).collect(),
            _ => Vec::new(),
        }
    }
}

fn snapshot_is_bad(snapshot: &Snapshot, bad_pairs: &HashSet<(ChunkId, BlobDescriptor)>) -> bool {
    snapshot
        .blobs_map
        .iter()
        .any(|(chunk_id, blob)| bad_pairs.contains(&(*chunk_id, blob.clone())))
}

/// Owns one repository's check-run state. Not shared across
/// repositories; the caller is expected to hold one `Checker` per
/// `BlobCache`.
pub struct Checker {
    backend: Arc<dyn Backend>,
    snapshot_loader: Arc<dyn SnapshotLoader>,
    notifier: Arc<dyn CheckNotifier>,
    cache: Arc<BlobCache>,
    state: StdMutex<CheckState>,
    result: StdMutex<Option<CheckResult>>,
}

impl Checker {
    pub fn new(
        backend: Arc<dyn Backend>,
        snapshot_loader: Arc<dyn SnapshotLoader>,
        notifier: Arc<dyn CheckNotifier>,
        cache: Arc<BlobCache>,
    ) -> Self {
        Self {
            backend,
            snapshot_loader,
            notifier,
            cache,
            state: StdMutex::new(CheckState::Idle),
            result: StdMutex::new(None),
        }
    }

    pub fn state(&self) -> CheckState {
        *self.state.lock().unwrap()
    }

    pub fn result(&self) -> Option<CheckResult> {
        self.result.lock().unwrap().clone()
    }

    /// Return to `Idle` and drop the previous result.
    pub fn clear(&self) {
        *self.state.lock().unwrap() = CheckState::Idle;
        *self.result.lock().unwrap() = None;
    }

    /// Run one check at `percent`. Cancelling `cancel` mid-flight
    /// aborts in-flight reads and leaves the previous `result`/`state`
    /// untouched, as if `check` had never been called.
    pub async fn check(&self, percent: u8, cancel: CancellationToken) -> Result<()> {
        validate_percent(percent)?;

        *self.state.lock().unwrap() = CheckState::Loading;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            outcome = self.run(percent, &cancel) => outcome,
        };

        let result = match outcome {
            Ok(Some(result)) => result,
            Ok(None) => return Ok(()), // cancelled mid-verify
            Err(err) => CheckResult::GeneralError {
                cause: format!("{err:#}"),
            },
        };

        *self.state.lock().unwrap() = CheckState::Done;
        *self.result.lock().unwrap() = Some(result);
        Ok(())
    }

    async fn run(&self, percent: u8, cancel: &CancellationToken) -> anyhow::Result<Option<CheckResult>> {
        let handle_infos = self
            .backend
            .list(ListKind::Snapshot)
            .await
            .map_err(|err| CoreError::BackendIoInitial(err))?;
        let handles: Vec<String> = handle_infos.iter().map(|info| hex::encode(info.id)).collect();
        let handle_count = handles.len();

        let snapshots = self
            .snapshot_loader
            .on_snapshots_loaded(&handles)
            .await
            .map_err(|err| CoreError::BackendIoInitial(err))?;
        let snapshot_count = snapshots.len();

        let backend_blobs = self
            .backend
            .list(ListKind::Blob)
            .await
            .map_err(|err| CoreError::BackendIoInitial(err))?;

        let mut index = BlobIndex::new();
        index.populate(&self.cache, &backend_blobs, &snapshots);

        *self.state.lock().unwrap() = CheckState::Sampling;
        let sample = sampler::sample(&snapshots, percent);

        if cancel.is_cancelled() {
            return Ok(None);
        }

        *self.state.lock().unwrap() = CheckState::Verifying;
        let Some(verify_outcome) = self.verify(&sample, cancel).await? else {
            return Ok(None);
        };

        let (bad_pairs, bytes_checked) = verify_outcome;

        if bad_pairs.is_empty() && handle_count == snapshot_count && handle_count > 0 {
            Ok(Some(CheckResult::Success {
                snapshots,
                percent,
                bytes_checked,
            }))
        } else {
            Ok(Some(CheckResult::Error {
                existing_snapshots: handle_count,
                snapshots,
                bad_pairs,
            }))
        }
    }

    async fn verify(
        &self,
        sample: &[SampleEntry],
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<(HashSet<(ChunkId, BlobDescriptor)>, u64)>> {
        let cpu_count = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let network_cap = if self.backend.requires_network() { 3 } else { 42 };
        let permits = cpu_count.min(network_cap);
        let semaphore = Arc::new(Semaphore::new(permits));

        let bad_pairs: Arc<Mutex<HashSet<(ChunkId, BlobDescriptor)>>> = Arc::new(Mutex::new(HashSet::new()));
        let bytes_checked = Arc::new(AtomicU64::new(0));
        let run_start = Instant::now();
        let last_report = Arc::new(StdMutex::new((run_start, 0u64)));
        let sample_total: u64 = sample.iter().map(|e| e.blob.length).sum();

        let mut tasks = Vec::with_capacity(sample.len());
        for entry in sample {
            let semaphore = semaphore.clone();
            let backend = self.backend.clone();
            let cache = self.cache.clone();
            let bad_pairs = bad_pairs.clone();
            let bytes_checked = bytes_checked.clone();
            let last_report = last_report.clone();
            let notifier = self.notifier.clone();
            let cancel = cancel.clone();
            let entry = entry.clone();

            tasks.push(tokio::spawn(async move {
                let permit = tokio::select! {
                    _ = cancel.cancelled() => return,
                    permit = semaphore.acquire_owned() => permit.expect("semaphore never closed"),
                };

                let verified = tokio::select! {
                    _ = cancel.cancelled() => return,
                    verified = verify_one(backend.as_ref(), &entry) => verified,
                };
                drop(permit);

                match verified {
                    Ok(true) => {
                        bytes_checked.fetch_add(entry.blob.length, Ordering::Relaxed);
                    }
                    Ok(false) => {
                        if let Err(err) = cache.do_not_use_blob(&entry.blob.id) {
                            log::warn!("failed to quarantine blob {}: {}", entry.blob.id_hex(), err);
                        }
                        bad_pairs
                            .lock()
                            .await
                            .insert((entry.chunk_id, entry.blob.clone()));
                    }
                    Err(err) => {
                        log::warn!("verification of blob {} failed: {}", entry.blob.id_hex(), err);
                        bad_pairs
                            .lock()
                            .await
                            .insert((entry.chunk_id, entry.blob.clone()));
                    }
                }

                let checked = bytes_checked.load(Ordering::Relaxed);
                let mut last = last_report.lock().unwrap();
                let (last_at, last_checked) = *last;
                let elapsed = last_at.elapsed();
                if elapsed >= PROGRESS_INTERVAL {
                    *last = (Instant::now(), checked);
                    drop(last);
                    let bandwidth = (checked - last_checked) as f64 / elapsed.as_secs_f64();
                    let permille = if sample_total == 0 {
                        1000
                    } else {
                        ((checked as u128 * 1000) / sample_total as u128) as u32
                    };
                    notifier.show_check_notification(bandwidth, permille).await;
                }
            }));
        }

        for task in tasks {
            task.await?;
        }

        if cancel.is_cancelled() {
            return Ok(None);
        }

        let bad_pairs = Arc::try_unwrap(bad_pairs)
            .unwrap_or_else(|_| unreachable!("every spawned task was awaited above"))
            .into_inner();
        let total = bytes_checked.load(Ordering::Relaxed);

        if bad_pairs.is_empty() {
            self.notifier.on_check_complete(total, 0.0).await;
        } else {
            self.notifier.on_check_finished_with_error(total, 0.0).await;
        }

        Ok(Some((bad_pairs, total)))
    }
}

/// Fetch and hash one sample entry. `Ok(true)` means the content hash
/// matched; `Ok(false)` means a hash mismatch; `Err` means any other
/// failure (I/O, decryption, authentication) that must not trigger
/// quarantine.
async fn verify_one(backend: &dyn Backend, entry: &SampleEntry) -> anyhow::Result<bool> {
    let mut reader = backend.load(&entry.blob.id).await?;
    let (digest, _len) = hash_async_stream(reader.as_mut()).await?;
    Ok(digest == *entry.chunk_id.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryBackend, InMemorySnapshotLoader, RecordingNotifier};
    use crate::config::RepositoryConfig;
    use repo_datastore::sha256_bytes;
    use std::collections::HashMap;

    fn checker(dir: &tempfile::TempDir) -> (Checker, Arc<InMemoryBackend>, Arc<InMemorySnapshotLoader>) {
        let backend = Arc::new(InMemoryBackend::new(false));
        let loader = Arc::new(InMemorySnapshotLoader::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let cache = Arc::new(BlobCache::new(&RepositoryConfig::new(dir.path())));
        (
            Checker::new(backend.clone(), loader.clone(), notifier, cache),
            backend,
            loader,
        )
    }

    #[tokio::test]
    async fn scenario1_empty_repository_yields_error_not_success() {
        let dir = tempfile::tempdir().unwrap();
        let (checker, _backend, _loader) = checker(&dir);

        checker.check(100, CancellationToken::new()).await.unwrap();

        match checker.result().unwrap() {
            CheckResult::Error {
                existing_snapshots,
                snapshots,
                bad_pairs,
            } => {
                assert_eq!(existing_snapshots, 0);
                assert!(snapshots.is_empty());
                assert!(bad_pairs.is_empty());
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn scenario2_two_snapshots_all_correct_yields_success() {
        let dir = tempfile::tempdir().unwrap();
        let (checker, backend, loader) = checker(&dir);

        let content_a = b"blob a content".to_vec();
        let content_b = b"blob b content, a bit longer".to_vec();
        let blob_a = BlobDescriptor::new(sha256_bytes(&content_a), content_a.len() as u64, content_a.len() as u64);
        let blob_b = BlobDescriptor::new(sha256_bytes(&content_b), content_b.len() as u64, content_b.len() as u64);
        let chunk_a = ChunkId::new([1u8; 32]);
        let chunk_b = ChunkId::new([2u8; 32]);

        backend.put_blob(blob_a.id, content_a);
        backend.put_blob(blob_b.id, content_b);
        let manifest_1 = [0x10u8; 32];
        let manifest_2 = [0x20u8; 32];
        backend.add_snapshot_handle(manifest_1);
        backend.add_snapshot_handle(manifest_2);

        let mut blobs_map_1 = HashMap::new();
        blobs_map_1.insert(chunk_a, blob_a.clone());
        blobs_map_1.insert(chunk_b, blob_b.clone());
        let mut apps_map_1 = HashMap::new();
        apps_map_1.insert(
            "com.example.app".to_string(),
            repo_datastore::AppArchive {
                data_chunk_ids: vec![chunk_a, chunk_b],
                package: None,
            },
        );
        let s1 = Snapshot {
            token: 1,
            blobs_map: blobs_map_1.clone(),
            apps_map: apps_map_1.clone(),
        };
        let s2 = Snapshot {
            token: 2,
            blobs_map: blobs_map_1,
            apps_map: apps_map_1,
        };

        loader.add(hex::encode(manifest_1), s1);
        loader.add(hex::encode(manifest_2), s2);

        checker.check(100, CancellationToken::new()).await.unwrap();

        match checker.result().unwrap() {
            CheckResult::Success {
                snapshots,
                percent,
                bytes_checked,
            } => {
                assert_eq!(snapshots.len(), 2);
                assert_eq!(percent, 100);
                assert_eq!(bytes_checked, blob_a.length + blob_b.length);
            }
            other => panic!("expected Success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn scenario3_corrupt_blob_marks_only_referencing_snapshot_bad() {
        let dir = tempfile::tempdir().unwrap();
        let (checker, backend, loader) = checker(&dir);

        let content_a = b"good content".to_vec();
        let blob_a = BlobDescriptor::new(sha256_bytes(&content_a), content_a.len() as u64, content_a.len() as u64);
        let chunk_a = ChunkId::new([1u8; 32]);

        // blob_b's id does not match the hash of the content backend
        // actually returns for it, simulating on-backend corruption.
        let blob_b = BlobDescriptor::new([0xee; 32], 4, 4);
        let chunk_b = ChunkId::new([2u8; 32]);
        backend.put_blob(blob_a.id, content_a);
        backend.put_blob(blob_b.id, b"nope".to_vec());

        let manifest_1 = [0x11u8; 32];
        let manifest_2 = [0x22u8; 32];
        backend.add_snapshot_handle(manifest_1);
        backend.add_snapshot_handle(manifest_2);

        let mut blobs_map_1 = HashMap::new();
        blobs_map_1.insert(chunk_a, blob_a.clone());
        let s1 = Snapshot {
            token: 1,
            blobs_map: blobs_map_1,
            apps_map: HashMap::new(),
        };

        let mut blobs_map_2 = HashMap::new();
        blobs_map_2.insert(chunk_b, blob_b.clone());
        let s2 = Snapshot {
            token: 2,
            blobs_map: blobs_map_2,
            apps_map: HashMap::new(),
        };

        loader.add(hex::encode(manifest_1), s1);
        loader.add(hex::encode(manifest_2), s2);

        checker.check(100, CancellationToken::new()).await.unwrap();

        match checker.result().unwrap() {
            CheckResult::Error {
                existing_snapshots,
                bad_pairs,
                ..
            } => {
                assert_eq!(existing_snapshots, 2);
                assert!(bad_pairs.contains(&(chunk_b, blob_b.clone())));
            }
            other => panic!("expected Error, got {other:?}"),
        }

        assert_eq!(checker.state(), CheckState::Done);
        let observer_cache = BlobCache::new(&RepositoryConfig::new(dir.path()));
        assert!(observer_cache.get_quarantine().contains(&hex::encode(blob_b.id)));
    }

    #[tokio::test]
    async fn scenario4_backend_io_failure_skips_quarantine() {
        let dir = tempfile::tempdir().unwrap();
        let (checker, backend, loader) = checker(&dir);

        // blob_a is referenced by the snapshot but never registered with
        // the backend, so `load` fails before any hash is computed.
        let blob_a = BlobDescriptor::new([0x33u8; 32], 4, 4);
        let chunk_a = ChunkId::new([1u8; 32]);

        let manifest_1 = [0x44u8; 32];
        backend.add_snapshot_handle(manifest_1);

        let mut blobs_map = HashMap::new();
        blobs_map.insert(chunk_a, blob_a.clone());
        let s1 = Snapshot {
            token: 1,
            blobs_map,
            apps_map: HashMap::new(),
        };
        loader.add(hex::encode(manifest_1), s1);

        checker.check(100, CancellationToken::new()).await.unwrap();

        match checker.result().unwrap() {
            CheckResult::Error { bad_pairs, .. } => {
                assert!(bad_pairs.contains(&(chunk_a, blob_a.clone())));
            }
            other => panic!("expected Error, got {other:?}"),
        }

        let observer_cache = BlobCache::new(&RepositoryConfig::new(dir.path()));
        assert!(!observer_cache.get_quarantine().contains(&hex::encode(blob_a.id)));
    }

    #[tokio::test]
    async fn invalid_percent_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (checker, _backend, _loader) = checker(&dir);

        let err = checker.check(101, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
        assert_eq!(checker.state(), CheckState::Idle);
    }
}
