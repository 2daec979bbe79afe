//! The verifier: concurrently fetches sampled blobs, recomputes their
//! content hash, and classifies every known snapshot as good or bad.

mod checker;
mod hashing;

pub use checker::{CheckResult, CheckState, Checker};
