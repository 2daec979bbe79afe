//! The narrow external interfaces this crate consumes and produces.
//! Production implementations (the real HTTP(S) backend, the real
//! snapshot decryptor) are out of scope; this module ships the trait
//! shapes plus an in-memory test double of each, the way the teacher
//! crate ships a thin `async_trait` abstraction in front of its
//! remote chunk reader and implements it once for production and once
//! for tests.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Mutex;

use async_trait::async_trait;
use repo_datastore::{BlobInfo, Snapshot};
use tokio::io::AsyncRead;

/// What kind of handle a `Backend::list` call enumerates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListKind {
    Blob,
    Snapshot,
}

/// An opaque handle a backend listing hands back; passed unchanged to
/// `SnapshotLoader::on_snapshots_loaded`.
pub type SnapshotHandle = String;

/// The remote object store this core verifies against.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Enumerate blob or snapshot handles with their on-backend size.
    async fn list(&self, kind: ListKind) -> anyhow::Result<Vec<BlobInfo>>;

    /// Open a decrypted byte stream for the stored object identified
    /// by `id`.
    async fn load(&self, id: &[u8; 32]) -> anyhow::Result<Box<dyn AsyncRead + Send + Unpin>>;

    /// Delete the object identified by `id`. Consumed by the pruner;
    /// this core only ever observes the aftermath via
    /// `BlobCache::on_blobs_removed`.
    async fn remove(&self, id: &[u8; 32]) -> anyhow::Result<()>;

    /// Whether reaching this backend crosses a network boundary,
    /// feeding the verifier's concurrency bound (§5).
    fn requires_network(&self) -> bool;
}

/// Decodes the raw handles a `Backend` listing returns into
/// [`Snapshot`] values, tolerating partial failure: the returned
/// vector may be shorter than `handles`.
#[async_trait]
pub trait SnapshotLoader: Send + Sync {
    async fn on_snapshots_loaded(&self, handles: &[SnapshotHandle]) -> anyhow::Result<Vec<Snapshot>>;
}

/// Fire-and-forget progress/result notifications a check run emits.
#[async_trait]
pub trait CheckNotifier: Send + Sync {
    async fn show_check_notification(&self, bandwidth_bytes_per_sec: f64, permille: u32);
    async fn on_check_complete(&self, bytes_checked: u64, bandwidth_bytes_per_sec: f64);
    async fn on_check_finished_with_error(&self, bytes_checked: u64, bandwidth_bytes_per_sec: f64);
}

/// An in-memory `Backend` double for tests: blobs and snapshot handles
/// live in plain maps, content is served back out of a byte buffer.
#[derive(Default)]
pub struct InMemoryBackend {
    blobs: Mutex<HashMap<[u8; 32], Vec<u8>>>,
    snapshot_handles: Mutex<Vec<[u8; 32]>>,
    requires_network: bool,
}

impl InMemoryBackend {
    pub fn new(requires_network: bool) -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
            snapshot_handles: Mutex::new(Vec::new()),
            requires_network,
        }
    }

    pub fn put_blob(&self, id: [u8; 32], content: Vec<u8>) {
        self.blobs.lock().unwrap().insert(id, content);
    }

    /// Register a manifest id the snapshot listing should enumerate;
    /// the corresponding `SnapshotHandle` the loader sees is its hex
    /// encoding.
    pub fn add_snapshot_handle(&self, manifest_id: [u8; 32]) {
        self.snapshot_handles.lock().unwrap().push(manifest_id);
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn list(&self, kind: ListKind) -> anyhow::Result<Vec<BlobInfo>> {
        match kind {
            ListKind::Blob => Ok(self
                .blobs
                .lock()
                .unwrap()
                .iter()
                .map(|(id, content)| BlobInfo::new(*id, content.len() as u64))
                .collect()),
            ListKind::Snapshot => Ok(self
                .snapshot_handles
                .lock()
                .unwrap()
                .iter()
                .map(|id| BlobInfo::new(*id, 0))
                .collect()),
        }
    }

    async fn load(&self, id: &[u8; 32]) -> anyhow::Result<Box<dyn AsyncRead + Send + Unpin>> {
        let content = self
            .blobs
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("blob {} not found", hex::encode(id)))?;
        Ok(Box::new(Cursor::new(content)))
    }

    async fn remove(&self, id: &[u8; 32]) -> anyhow::Result<()> {
        self.blobs.lock().unwrap().remove(id);
        Ok(())
    }

    fn requires_network(&self) -> bool {
        self.requires_network
    }
}

/// An in-memory `SnapshotLoader` double: returns whichever snapshots
/// were registered, by handle, ignoring ones not found (simulating
/// the "some manifests fail to decode" gap the real error path
/// surfaces via `existingSnapshots`).
#[derive(Default)]
pub struct InMemorySnapshotLoader {
    snapshots: Mutex<HashMap<SnapshotHandle, Snapshot>>,
}

impl InMemorySnapshotLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, handle: SnapshotHandle, snapshot: Snapshot) {
        self.snapshots.lock().unwrap().insert(handle, snapshot);
    }
}

#[async_trait]
impl SnapshotLoader for InMemorySnapshotLoader {
    async fn on_snapshots_loaded(&self, handles: &[SnapshotHandle]) -> anyhow::Result<Vec<Snapshot>> {
        let snapshots = self.snapshots.lock().unwrap();
        Ok(handles
            .iter()
            .filter_map(|handle| snapshots.get(handle).cloned())
            .collect())
    }
}

/// A `CheckNotifier` double that records every call for assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    pub progress: Mutex<Vec<(f64, u32)>>,
    pub completed: Mutex<Option<(u64, f64)>>,
    pub errored: Mutex<Option<(u64, f64)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckNotifier for RecordingNotifier {
    async fn show_check_notification(&self, bandwidth_bytes_per_sec: f64, permille: u32) {
        self.progress
            .lock()
            .unwrap()
            .push((bandwidth_bytes_per_sec, permille));
    }

    async fn on_check_complete(&self, bytes_checked: u64, bandwidth_bytes_per_sec: f64) {
        *self.completed.lock().unwrap() = Some((bytes_checked, bandwidth_bytes_per_sec));
    }

    async fn on_check_finished_with_error(&self, bytes_checked: u64, bandwidth_bytes_per_sec: f64) {
        *self.errored.lock().unwrap() = Some((bytes_checked, bandwidth_bytes_per_sec));
    }
}
