//! Entry model shared by both sides of a synchronization

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// A `/`-separated path relative to a sync root
///
/// The empty path denotes the root itself, which is how a root that is a
/// single file (or a single object) is represented. Paths order
/// segment-by-segment, so a directory sorts right before its descendants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelPath(String);

impl RelPath {
    /// The sync root
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Parse and validate a relative path
    ///
    /// A single trailing `/` is accepted and dropped. Leading `/`, empty
    /// segments, `.` and `..` are rejected.
    pub fn new(path: impl AsRef<str>) -> Result<Self> {
        let raw = path.as_ref();
        let trimmed = raw.strip_suffix('/').unwrap_or(raw);

        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        if trimmed.starts_with('/') {
            return Err(SyncError::planning_error(raw, "path must be relative"));
        }
        for segment in trimmed.split('/') {
            match segment {
                "" => return Err(SyncError::planning_error(raw, "path contains an empty segment")),
                "." | ".." => {
                    return Err(SyncError::planning_error(raw, "path contains a '.' or '..' segment"))
                }
                _ => {}
            }
        }

        Ok(Self(trimmed.to_string()))
    }

    /// Build a relative path from the components of a local path below its root
    pub fn from_local(relative: &Path) -> Result<Self> {
        let mut segments = Vec::new();
        for component in relative.components() {
            let segment = component.as_os_str().to_str().ok_or_else(|| {
                SyncError::planning_error(relative.display(), "file name is not valid UTF-8")
            })?;
            segments.push(segment);
        }
        Self::new(segments.join("/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the path segments
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Number of segments; the root has depth 0
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// Last segment, if any
    pub fn file_name(&self) -> Option<&str> {
        self.segments().last()
    }

    /// Parent path; `None` for the root
    pub fn parent(&self) -> Option<RelPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => Some(Self::root()),
        }
    }

    /// Proper ancestors, nearest first, excluding the root
    pub fn ancestors(&self) -> impl Iterator<Item = RelPath> {
        let mut current = self.parent();
        std::iter::from_fn(move || {
            let next = current.take().filter(|p| !p.is_root())?;
            current = next.parent();
            Some(next)
        })
    }

    /// Append a single segment
    pub fn join(&self, segment: &str) -> Result<RelPath> {
        if self.is_root() {
            Self::new(segment)
        } else {
            Self::new(format!("{}/{}", self.0, segment))
        }
    }

    /// Whether `self` lies strictly below `ancestor`
    pub fn is_descendant_of(&self, ancestor: &RelPath) -> bool {
        if ancestor.is_root() {
            return !self.is_root();
        }
        self.0.len() > ancestor.0.len()
            && self.0.starts_with(&ancestor.0)
            && self.0.as_bytes()[ancestor.0.len()] == b'/'
    }

    /// Resolve against a local root directory
    pub fn to_local_path(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for segment in self.segments() {
            path.push(segment);
        }
        path
    }

    /// Resolve against a remote prefix
    pub fn to_key(&self, prefix: &str) -> String {
        match (prefix.is_empty(), self.is_root()) {
            (true, _) => self.0.clone(),
            (false, true) => prefix.to_string(),
            (false, false) => format!("{}/{}", prefix, self.0),
        }
    }
}

impl Ord for RelPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segments().cmp(other.segments())
    }
}

impl PartialOrd for RelPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str(".")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl TryFrom<String> for RelPath {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<RelPath> for String {
    fn from(path: RelPath) -> Self {
        path.0
    }
}

/// Kind of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
}

/// Ownership and permission bits of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    /// File owner user ID
    pub owner_id: u32,
    /// File owner group ID
    pub group_id: u32,
    /// Permission bits (`mode & 0o7777`)
    pub mode_bits: u16,
}

impl FileAttributes {
    /// Default mode for files without stored metadata
    pub const DEFAULT_FILE_MODE: u16 = 0o644;
    /// Default mode for directories without stored metadata
    pub const DEFAULT_DIR_MODE: u16 = 0o755;

    /// Attributes owned by the running process with the given mode
    pub fn process_default(mode_bits: u16) -> Self {
        let (owner_id, group_id) = process_ids();
        Self {
            owner_id,
            group_id,
            mode_bits,
        }
    }

    /// Read attributes from local filesystem metadata
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        let (owner_id, group_id) = get_ownership(metadata);
        Self {
            owner_id,
            group_id,
            mode_bits: get_permissions(metadata),
        }
    }
}

/// A single path's metadata snapshot on one side of a synchronization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Path relative to the sync root
    pub relative_path: RelPath,
    /// File or directory
    pub kind: EntryKind,
    /// Size in bytes (0 for directories)
    pub size: u64,
    /// Last modified time
    pub mtime: SystemTime,
    /// Owner user ID
    pub owner_id: u32,
    /// Owner group ID
    pub group_id: u32,
    /// Permission bits
    pub mode_bits: u16,
    /// Last access time, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atime: Option<SystemTime>,
}

impl Entry {
    /// Create a file entry
    pub fn file(relative_path: RelPath, size: u64, mtime: SystemTime, attributes: FileAttributes) -> Self {
        Self::new(relative_path, EntryKind::File, size, mtime, attributes)
    }

    /// Create a directory entry
    pub fn directory(relative_path: RelPath, mtime: SystemTime, attributes: FileAttributes) -> Self {
        Self::new(relative_path, EntryKind::Directory, 0, mtime, attributes)
    }

    fn new(
        relative_path: RelPath,
        kind: EntryKind,
        size: u64,
        mtime: SystemTime,
        attributes: FileAttributes,
    ) -> Self {
        Self {
            relative_path,
            kind,
            size,
            mtime,
            owner_id: attributes.owner_id,
            group_id: attributes.group_id,
            mode_bits: attributes.mode_bits,
            atime: None,
        }
    }

    /// Attach a last access time
    pub fn with_atime(mut self, atime: Option<SystemTime>) -> Self {
        self.atime = atime;
        self
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn attributes(&self) -> FileAttributes {
        FileAttributes {
            owner_id: self.owner_id,
            group_id: self.group_id,
            mode_bits: self.mode_bits,
        }
    }
}

/// Effective user and group of the running process
#[cfg(unix)]
fn process_ids() -> (u32, u32) {
    // SAFETY: geteuid/getegid have no preconditions and cannot fail
    unsafe { (libc::geteuid(), libc::getegid()) }
}

#[cfg(not(unix))]
fn process_ids() -> (u32, u32) {
    (0, 0)
}

/// Get file permissions in a cross-platform way
#[cfg(unix)]
fn get_permissions(metadata: &std::fs::Metadata) -> u16 {
    use std::os::unix::fs::PermissionsExt;
    (metadata.permissions().mode() & 0o7777) as u16
}

#[cfg(not(unix))]
fn get_permissions(metadata: &std::fs::Metadata) -> u16 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
fn get_ownership(metadata: &std::fs::Metadata) -> (u32, u32) {
    use std::os::unix::fs::MetadataExt;
    (metadata.uid(), metadata.gid())
}

#[cfg(not(unix))]
fn get_ownership(_metadata: &std::fs::Metadata) -> (u32, u32) {
    process_ids()
}
