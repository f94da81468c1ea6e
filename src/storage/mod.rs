//! Persistence for the last known-good upstream content.
//!
//! The only backend is the filesystem: one JSON file per key, replaced
//! atomically on every successful upstream read.

pub mod snapshot;

pub use snapshot::{Freshness, SnapshotStore, Snapshotted};
