use thiserror::Error;

/// Caller-visible error taxonomy for the repository integrity core.
///
/// `CacheCorrupt` and `QuarantineCorrupt` from the design table never
/// reach this type: both are handled internally (the readable prefix
/// or an empty set is returned, with a `log::warn!`) the moment they
/// are detected, matching the source's "best-effort accelerator"
/// treatment of the cache and quarantine files.
#[derive(Debug, Error)]
pub enum CoreError {
    /// `percent` outside `[0, 100]`, or a blob/chunk id that did not
    /// decode to exactly 32 bytes.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Listing snapshot handles, or decoding every listed manifest,
    /// failed outright before sampling could begin. Carries the full
    /// `anyhow::Error` chain rather than `#[source]`, since
    /// `anyhow::Error` does not itself implement `std::error::Error`,
    /// so its chain is rendered through `{0:#}` instead of
    /// `Error::source`.
    #[error("could not load snapshots: {0:#}")]
    BackendIoInitial(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
