//! Data types shared across the repository integrity core: content
//! identifiers, blob descriptors, and the decoded snapshot shape the
//! snapshot layer hands back to the checker.

mod digest;
mod snapshot;
mod types;

pub use digest::{sha256, sha256_bytes};
pub use snapshot::{AppArchive, PackageArtifact, PackageSplit, Snapshot};
pub use types::{BlobDescriptor, BlobInfo, ChunkId};
