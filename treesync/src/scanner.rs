//! Tree enumeration for both sides of a synchronization
//!
//! [`LocalTree`] walks a directory with walkdir, depth-first with siblings
//! sorted by name, which yields entries already in [`RelPath`] order. The
//! walk is lazy and can be restarted by calling [`LocalTree::scan`] again.
//!
//! [`RemoteTree`] lists a key prefix, resolves each object's stored metadata
//! and synthesizes directory entries for the implied path segments. Object
//! listings come back in no particular order, so the remote side is
//! materialized and sorted.

use std::collections::BTreeMap;
use std::fs::FileType;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::debug;
use walkdir::WalkDir;

use crate::entry::{Entry, EntryKind, FileAttributes, RelPath};
use crate::error::{Result, SyncError};
use crate::metadata::{self, MetadataWarning};
use crate::store::{ObjectClient, ObjectInfo, ObjectSummary, StoreError, DIRECTORY_MARKER};

/// A local directory tree (or single file) to enumerate
#[derive(Debug, Clone)]
pub struct LocalTree {
    root: PathBuf,
    follow_links: bool,
    excluded_name: Option<String>,
}

impl LocalTree {
    pub fn new(root: impl Into<PathBuf>, follow_links: bool) -> Self {
        Self {
            root: root.into(),
            follow_links,
            excluded_name: None,
        }
    }

    /// Skip regular files with this name
    pub fn exclude_files_named(mut self, name: impl Into<String>) -> Self {
        self.excluded_name = Some(name.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start a walk
    ///
    /// A missing root yields nothing when `missing_ok` is set and is an
    /// access error otherwise. A root that is a regular file yields a single
    /// entry with the empty relative path.
    pub fn scan(&self, missing_ok: bool) -> Result<LocalEntries> {
        let metadata = match std::fs::metadata(&self.root) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && missing_ok => {
                return Ok(LocalEntries::empty(self));
            }
            Err(e) => return Err(SyncError::local_access_error(&self.root, e.to_string())),
        };

        if metadata.is_file() {
            let entry = entry_from_metadata(RelPath::root(), &self.root, &metadata)?;
            return Ok(LocalEntries {
                root: self.root.clone(),
                root_kind: Some(EntryKind::File),
                pending: Some(entry),
                walker: None,
                excluded_name: None,
            });
        }
        if !metadata.is_dir() {
            return Err(SyncError::planning_error(
                self.root.display(),
                format!("unsupported file type: {}", describe(&metadata.file_type())),
            ));
        }

        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .follow_links(self.follow_links)
            .sort_by_file_name()
            .into_iter();

        Ok(LocalEntries {
            root: self.root.clone(),
            root_kind: Some(EntryKind::Directory),
            pending: None,
            walker: Some(walker),
            excluded_name: self.excluded_name.clone(),
        })
    }
}

/// Lazy sequence of local entries in path order
///
/// The sequence ends after the first error.
pub struct LocalEntries {
    root: PathBuf,
    root_kind: Option<EntryKind>,
    pending: Option<Entry>,
    walker: Option<walkdir::IntoIter>,
    excluded_name: Option<String>,
}

impl LocalEntries {
    fn empty(tree: &LocalTree) -> Self {
        Self {
            root: tree.root.clone(),
            root_kind: None,
            pending: None,
            walker: None,
            excluded_name: None,
        }
    }

    /// Kind of the root; `None` when it does not exist
    pub fn root_kind(&self) -> Option<EntryKind> {
        self.root_kind
    }

    fn is_excluded(&self, entry: &walkdir::DirEntry) -> bool {
        match &self.excluded_name {
            Some(name) => entry.file_type().is_file() && entry.file_name().to_str() == Some(name.as_str()),
            None => false,
        }
    }

    fn convert(&self, entry: &walkdir::DirEntry) -> Result<Entry> {
        let path = entry.path();
        let relative = path
            .strip_prefix(&self.root)
            .map_err(|e| SyncError::planning_error(path.display(), e.to_string()))?;
        let relative = RelPath::from_local(relative)?;
        let metadata = entry
            .metadata()
            .map_err(|e| SyncError::local_access_error(path, e.to_string()))?;
        entry_from_metadata(relative, path, &metadata)
    }
}

impl Iterator for LocalEntries {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(entry) = self.pending.take() {
            return Some(Ok(entry));
        }

        loop {
            let next = self.walker.as_mut()?.next()?;
            let result = match next {
                Ok(entry) if self.is_excluded(&entry) => continue,
                Ok(entry) => self.convert(&entry),
                Err(e) => {
                    let location = e.path().unwrap_or(self.root.as_path()).to_path_buf();
                    Err(SyncError::local_access_error(location, e.to_string()))
                }
            };

            if result.is_err() {
                self.walker = None;
            }
            return Some(result);
        }
    }
}

fn entry_from_metadata(relative_path: RelPath, path: &Path, metadata: &std::fs::Metadata) -> Result<Entry> {
    let file_type = metadata.file_type();
    if !file_type.is_file() && !file_type.is_dir() {
        return Err(SyncError::planning_error(
            path.display(),
            format!("unsupported file type: {}", describe(&file_type)),
        ));
    }

    let mtime = metadata
        .modified()
        .map_err(|e| SyncError::local_access_error(path, e.to_string()))?;
    let attributes = FileAttributes::from_metadata(metadata);

    let entry = if file_type.is_dir() {
        Entry::directory(relative_path, mtime, attributes)
    } else {
        Entry::file(relative_path, metadata.len(), mtime, attributes)
    };
    Ok(entry.with_atime(metadata.accessed().ok()))
}

#[cfg(unix)]
fn describe(file_type: &FileType) -> &'static str {
    use std::os::unix::fs::FileTypeExt;
    if file_type.is_symlink() {
        "symbolic link"
    } else if file_type.is_socket() {
        "socket"
    } else if file_type.is_fifo() {
        "fifo"
    } else if file_type.is_block_device() || file_type.is_char_device() {
        "device"
    } else {
        "unknown"
    }
}

#[cfg(not(unix))]
fn describe(file_type: &FileType) -> &'static str {
    if file_type.is_symlink() {
        "symbolic link"
    } else {
        "unknown"
    }
}

/// Sorted entries of a remote prefix plus the anomalies found in their metadata
#[derive(Debug, Clone, Default)]
pub struct RemoteListing {
    pub entries: Vec<Entry>,
    pub warnings: Vec<MetadataWarning>,
    /// A prefix with objects below it is a directory, an object at exactly
    /// the prefix is a file; `None` when neither exists
    pub root_kind: Option<EntryKind>,
}

/// A key prefix in a bucket to enumerate
pub struct RemoteTree {
    client: Arc<dyn ObjectClient>,
    prefix: String,
    label: String,
    metadata_concurrency: usize,
}

impl RemoteTree {
    pub fn new(client: Arc<dyn ObjectClient>, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            client,
            label: prefix.clone(),
            prefix,
            metadata_concurrency: 16,
        }
    }

    /// Name used for this tree in error messages
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Bound on concurrent HEAD requests
    pub fn with_metadata_concurrency(mut self, limit: usize) -> Self {
        self.metadata_concurrency = limit.max(1);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Enumerate the prefix
    ///
    /// When nothing lies below the prefix but an object exists at exactly
    /// the prefix, that object is the root and is returned with the empty
    /// relative path. When neither exists the result is empty if
    /// `missing_ok` is set and an access error otherwise.
    pub async fn scan(&self, missing_ok: bool) -> Result<RemoteListing> {
        let summaries: Vec<ObjectSummary> = self
            .client
            .list(&self.prefix)
            .try_collect()
            .await
            .map_err(|e| self.access_error(e))?;

        debug!(prefix = %self.prefix, objects = summaries.len(), "listed remote prefix");

        if summaries.is_empty() {
            return self.scan_single_object(missing_ok).await;
        }

        let objects = self.resolve_metadata(summaries).await?;
        let mut builder = ListingBuilder::default();
        for object in objects {
            let relative = self.relative_key(&object.key)?.to_string();
            builder.add(&relative, object)?;
        }
        let mut listing = builder.finish()?;
        listing.root_kind = Some(EntryKind::Directory);
        Ok(listing)
    }

    async fn scan_single_object(&self, missing_ok: bool) -> Result<RemoteListing> {
        // An empty bucket is an empty tree
        if self.prefix.is_empty() {
            return Ok(RemoteListing {
                root_kind: Some(EntryKind::Directory),
                ..Default::default()
            });
        }

        match self.client.head(&self.prefix).await.map_err(|e| self.access_error(e))? {
            Some(info) => {
                let mut builder = ListingBuilder::default();
                builder.add_file(RelPath::root(), info);
                let mut listing = builder.finish()?;
                listing.root_kind = Some(EntryKind::File);
                Ok(listing)
            }
            None if missing_ok => Ok(RemoteListing::default()),
            None => Err(SyncError::access_error(&self.label, "remote path does not exist")),
        }
    }

    /// Attach stored metadata to every listed object
    async fn resolve_metadata(&self, summaries: Vec<ObjectSummary>) -> Result<Vec<ObjectInfo>> {
        stream::iter(summaries)
            .map(|summary| async move {
                if let Some(metadata) = summary.metadata {
                    return Ok(ObjectInfo {
                        key: summary.key,
                        size: summary.size,
                        last_modified: summary.last_modified,
                        metadata,
                    });
                }
                match self.client.head(&summary.key).await.map_err(|e| self.access_error(e))? {
                    Some(info) => Ok(info),
                    None => Err(SyncError::access_error(
                        &summary.key,
                        "object disappeared while listing",
                    )),
                }
            })
            .buffer_unordered(self.metadata_concurrency)
            .try_collect()
            .await
    }

    fn relative_key<'k>(&self, key: &'k str) -> Result<&'k str> {
        if self.prefix.is_empty() {
            return Ok(key);
        }
        key.strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| SyncError::planning_error(key, format!("key is not below '{}'", self.prefix)))
    }

    fn access_error(&self, error: StoreError) -> SyncError {
        SyncError::access_error(&self.label, error.to_string())
    }
}

/// Collects remote objects into files and directories, then merges them
#[derive(Default)]
struct ListingBuilder {
    files: BTreeMap<RelPath, Entry>,
    directories: BTreeMap<RelPath, Entry>,
    warnings: Vec<MetadataWarning>,
}

impl ListingBuilder {
    fn add(&mut self, relative_key: &str, info: ObjectInfo) -> Result<()> {
        // Zero-byte "dir/" objects are folders made by other S3 tools
        if relative_key.is_empty() || relative_key.ends_with('/') {
            let path = RelPath::new(relative_key)?;
            self.add_directory(path, info);
            return Ok(());
        }

        let path = RelPath::new(relative_key)?;
        if path.file_name() == Some(DIRECTORY_MARKER) {
            if let Some(parent) = path.parent() {
                self.add_directory(parent, info);
            }
            return Ok(());
        }

        self.add_file(path, info);
        Ok(())
    }

    fn add_file(&mut self, path: RelPath, info: ObjectInfo) {
        let fallback = FileAttributes::process_default(FileAttributes::DEFAULT_FILE_MODE);
        let decoded = metadata::decode(&info.key, &info.metadata, &fallback);
        self.warnings.extend(decoded.warnings);
        let mtime = decoded.mtime.unwrap_or(info.last_modified);
        let entry = Entry::file(path.clone(), info.size, mtime, decoded.attributes).with_atime(decoded.atime);
        self.files.insert(path, entry);
    }

    fn add_directory(&mut self, path: RelPath, info: ObjectInfo) {
        if path.is_root() {
            return;
        }
        let fallback = FileAttributes::process_default(FileAttributes::DEFAULT_DIR_MODE);
        let decoded = metadata::decode(&info.key, &info.metadata, &fallback);
        self.warnings.extend(decoded.warnings);
        let mtime = decoded.mtime.unwrap_or(info.last_modified);
        self.directories
            .entry(path.clone())
            .or_insert_with(|| Entry::directory(path, mtime, decoded.attributes).with_atime(decoded.atime));
    }

    fn finish(mut self) -> Result<RemoteListing> {
        let implied: Vec<(RelPath, SystemTime)> = self
            .files
            .values()
            .chain(self.directories.values())
            .flat_map(|entry| entry.relative_path.ancestors().map(move |a| (a, entry.mtime)))
            .collect();

        let fallback = FileAttributes::process_default(FileAttributes::DEFAULT_DIR_MODE);
        for (path, mtime) in implied {
            self.directories
                .entry(path.clone())
                .and_modify(|dir| {
                    if dir.mtime < mtime {
                        dir.mtime = mtime;
                    }
                })
                .or_insert_with(|| Entry::directory(path, mtime, fallback));
        }

        if let Some(path) = self.files.keys().find(|p| self.directories.contains_key(*p)) {
            return Err(SyncError::planning_error(
                path,
                "key is both an object and a prefix of other objects",
            ));
        }

        let mut merged = self.files;
        merged.append(&mut self.directories);
        Ok(RemoteListing {
            entries: merged.into_values().collect(),
            warnings: self.warnings,
            root_kind: None,
        })
    }
}
