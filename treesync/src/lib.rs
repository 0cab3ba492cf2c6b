//! Sync Engine Library
//!
//! Mirrors a local directory tree against a key prefix in an object storage
//! bucket, in either direction:
//! - Lazy, ordered enumeration of local trees and remote prefixes
//! - Streaming merge-join diffing by size and modification time
//! - Owner, group, permission and mtime preservation through object metadata
//! - Atomic or in-place local writes
//! - Staged, bounded-concurrency execution with cancellation
//! - Dry-run capabilities

pub mod config;
pub mod diff;
pub mod entry;
pub mod error;
pub mod metadata;
pub mod scanner;
pub mod store;
pub mod summary;
pub mod sync_engine;
pub mod transfer;
pub mod writer;

use std::sync::Arc;

// Re-export main types and functions
pub use config::{Direction, EmptyDirPolicy, Location, SyncOptions};
pub use diff::{Action, DiffEngine, DiffOptions, PlanSummary, SkipReason, SyncPlan, Verb};
pub use entry::{Entry, EntryKind, FileAttributes, RelPath};
pub use error::{Result, SyncError};
pub use metadata::{MetadataMap, MetadataWarning};
pub use scanner::{LocalTree, RemoteListing, RemoteTree};
pub use store::{MemoryStore, ObjectClient, StoreError};
#[cfg(feature = "s3")]
pub use store::{S3Config, S3Store};
pub use summary::{Outcome, RunStats, RunSummary, TransferResult};
pub use sync_engine::SyncEngine;
pub use writer::{AtomicWriter, WriteMode};

/// Synchronize `destination` with `source` in a single call
///
/// One location must be local and the other remote; `client` must be bound
/// to the remote location's bucket.
pub async fn sync_tree(
    client: Arc<dyn ObjectClient>,
    source: &Location,
    destination: &Location,
    options: SyncOptions,
) -> Result<RunSummary> {
    let engine = SyncEngine::new(client, options);
    engine.sync(source, destination).await
}

#[cfg(test)]
mod engine_tests;
