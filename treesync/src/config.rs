//! Run configuration: options, locations and direction

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// What to do about directories on the remote side
///
/// Object storage has no directories, only key prefixes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyDirPolicy {
    /// Never write anything for a directory; empty directories are not uploaded
    #[default]
    Ignore,
    /// Represent each directory by a zero-byte marker object
    Marker,
}

/// Options for sync operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    /// Delete destination entries that don't exist in the source
    pub delete: bool,
    /// Transfer every file regardless of size/mtime and write downloads in place
    pub overwrite: bool,
    /// Plan only, touch nothing
    pub dry_run: bool,
    /// Source mtimes are truncated to this before comparing
    #[serde(with = "humantime_serde")]
    pub mtime_granularity: Duration,
    /// Maximum number of concurrent transfers
    pub max_concurrency: usize,
    /// Maximum number of concurrent metadata lookups during remote enumeration
    pub metadata_concurrency: usize,
    /// Remote directory representation
    pub empty_directories: EmptyDirPolicy,
    /// Apply stored owner/group on download
    pub preserve_ownership: bool,
    /// Follow symbolic links in the local tree
    pub follow_links: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            delete: false,
            overwrite: false,
            dry_run: false,
            mtime_granularity: Duration::from_secs(1),
            max_concurrency: 4,
            metadata_concurrency: 16,
            empty_directories: EmptyDirPolicy::default(),
            preserve_ownership: true,
            follow_links: false,
        }
    }
}

impl SyncOptions {
    /// Reject option combinations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(SyncError::config_error("max_concurrency must be at least 1"));
        }
        if self.metadata_concurrency == 0 {
            return Err(SyncError::config_error("metadata_concurrency must be at least 1"));
        }
        Ok(())
    }
}

/// One side of a synchronization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    /// Local directory or file
    Local(PathBuf),
    /// Key prefix in a bucket; an empty prefix is the whole bucket
    Remote { bucket: String, prefix: String },
}

impl Location {
    /// Parse `s3://bucket/prefix` or a local path
    pub fn parse(value: &str) -> Result<Self> {
        let Some(rest) = value.strip_prefix("s3://") else {
            if value.is_empty() {
                return Err(SyncError::config_error("empty path"));
            }
            return Ok(Self::Local(PathBuf::from(value)));
        };

        let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(SyncError::config_error(format!("missing bucket name in '{}'", value)));
        }

        // Empty segments would address keys no listing can reach
        let prefix = prefix.split('/').filter(|segment| !segment.is_empty()).collect::<Vec<_>>().join("/");

        Ok(Self::Remote {
            bucket: bucket.to_string(),
            prefix,
        })
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Remote { bucket, prefix } if prefix.is_empty() => write!(f, "s3://{}", bucket),
            Self::Remote { bucket, prefix } => write!(f, "s3://{}/{}", bucket, prefix),
        }
    }
}

/// Transfer direction of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Local source, remote destination
    Upload,
    /// Remote source, local destination
    Download,
}

impl Direction {
    /// Direction implied by a source/destination pair
    pub fn between(source: &Location, destination: &Location) -> Result<Self> {
        match (source.is_remote(), destination.is_remote()) {
            (false, true) => Ok(Self::Upload),
            (true, false) => Ok(Self::Download),
            (false, false) => Err(SyncError::config_error(
                "both locations are local; one side must be s3://bucket/prefix",
            )),
            (true, true) => Err(SyncError::config_error(
                "both locations are remote; one side must be a local path",
            )),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => f.write_str("upload"),
            Self::Download => f.write_str("download"),
        }
    }
}
