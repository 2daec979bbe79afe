use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{BlobDescriptor, ChunkId};

/// One split of an installable-package artifact (e.g. a base APK plus
/// its configuration splits), carrying its own ordered chunk list.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageSplit {
    pub name: String,
    pub chunk_ids: Vec<ChunkId>,
}

/// The installable-package artifact nested under an application entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageArtifact {
    pub splits: Vec<PackageSplit>,
}

/// One application's entry in a snapshot: its data stream (an ordered
/// chunk list) plus the package artifact it was installed from.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppArchive {
    pub data_chunk_ids: Vec<ChunkId>,
    #[serde(default)]
    pub package: Option<PackageArtifact>,
}

/// A logical backup manifest: a monotonic token, the set of chunks it
/// references (`blobs_map`), and the per-application data/package
/// structure the sampler partitions by origin.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub token: i64,
    pub blobs_map: HashMap<ChunkId, BlobDescriptor>,
    #[serde(default)]
    pub apps_map: HashMap<String, AppArchive>,
}

impl Snapshot {
    pub fn new(token: i64) -> Self {
        Self {
            token,
            blobs_map: HashMap::new(),
            apps_map: HashMap::new(),
        }
    }

    /// Look up the descriptor a chunk id resolves to within this
    /// snapshot. Per (I4), this is the sole authoritative descriptor
    /// to use when verifying the chunk within this snapshot.
    pub fn blob_for(&self, chunk_id: &ChunkId) -> Option<&BlobDescriptor> {
        self.blobs_map.get(chunk_id)
    }

    /// Iterate every chunk id referenced by this snapshot's
    /// application data streams (not package artifacts).
    pub fn app_data_chunk_ids(&self) -> impl Iterator<Item = &ChunkId> {
        self.apps_map
            .values()
            .flat_map(|app| app.data_chunk_ids.iter())
    }

    /// Iterate every chunk id referenced by this snapshot's
    /// package-artifact splits.
    pub fn package_chunk_ids(&self) -> impl Iterator<Item = &ChunkId> {
        self.apps_map.values().flat_map(|app| {
            app.package
                .iter()
                .flat_map(|pkg| pkg.splits.iter())
                .flat_map(|split| split.chunk_ids.iter())
        })
    }
}
