//! Transfer engine: carries out the I/O of a single planned action

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use filetime::FileTime;
use futures::{StreamExt, TryStreamExt};
use tokio::fs;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::config::{Direction, EmptyDirPolicy, SyncOptions};
use crate::diff::{Action, Verb};
use crate::entry::{Entry, EntryKind, FileAttributes, RelPath};
use crate::error::{Result, SyncError};
use crate::metadata::{self, MetadataWarning};
use crate::store::{ObjectClient, StoreError, DIRECTORY_MARKER};
use crate::writer::{AtomicWriter, WriteMode};

/// Files up to this size are uploaded with a single PUT
pub const SINGLE_PUT_LIMIT: u64 = 8 * 1024 * 1024;

/// Read size for streamed uploads
const UPLOAD_CHUNK_SIZE: usize = 1024 * 1024;

/// What came of an action
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    /// The destination was changed
    Done {
        bytes: u64,
        warnings: Vec<MetadataWarning>,
    },
    /// Nothing to do for this action on this destination
    NotApplicable,
}

impl TransferOutcome {
    fn done(bytes: u64) -> Self {
        Self::Done {
            bytes,
            warnings: Vec::new(),
        }
    }
}

/// Options for the transfer engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    /// Write downloads in place instead of atomically
    pub overwrite: bool,
    /// Apply stored owner/group on download
    pub preserve_ownership: bool,
    pub empty_directories: EmptyDirPolicy,
}

impl From<&SyncOptions> for TransferOptions {
    fn from(options: &SyncOptions) -> Self {
        Self {
            overwrite: options.overwrite,
            preserve_ownership: options.preserve_ownership,
            empty_directories: options.empty_directories,
        }
    }
}

/// Performs actions between a local root and a remote prefix
pub struct Transferer {
    client: Arc<dyn ObjectClient>,
    local_root: PathBuf,
    prefix: String,
    options: TransferOptions,
    writer: AtomicWriter,
    single_put_limit: u64,
}

impl Transferer {
    pub fn new(
        client: Arc<dyn ObjectClient>,
        local_root: impl Into<PathBuf>,
        prefix: impl Into<String>,
        options: TransferOptions,
    ) -> Self {
        Self {
            client,
            local_root: local_root.into(),
            prefix: prefix.into(),
            options,
            writer: AtomicWriter::new(),
            single_put_limit: SINGLE_PUT_LIMIT,
        }
    }

    /// Stream uploads of files larger than `limit` bytes
    pub fn with_single_put_limit(mut self, limit: u64) -> Self {
        self.single_put_limit = limit;
        self
    }

    /// Carry out one action
    ///
    /// Every error is a transfer error scoped to the action's path.
    pub async fn execute(&self, action: &Action) -> Result<TransferOutcome> {
        debug!(path = %action.relative_path, verb = ?action.verb, kind = ?action.kind, "executing action");

        match (action.direction, action.verb, action.kind) {
            (_, Verb::Skip, _) => Ok(TransferOutcome::NotApplicable),
            (Direction::Upload, Verb::Create | Verb::Update, EntryKind::File) => {
                self.upload_file(&action.relative_path).await
            }
            (Direction::Upload, Verb::Create | Verb::Update, EntryKind::Directory) => {
                self.create_remote_directory(&action.entry).await
            }
            (Direction::Upload, Verb::Delete, EntryKind::File) => self.delete_object(&action.relative_path).await,
            (Direction::Upload, Verb::Delete, EntryKind::Directory) => {
                self.delete_remote_directory(&action.relative_path).await
            }
            (Direction::Download, Verb::Create | Verb::Update, EntryKind::File) => {
                self.download_file(&action.relative_path).await
            }
            (Direction::Download, Verb::Create | Verb::Update, EntryKind::Directory) => {
                self.create_local_directory(&action.entry).await
            }
            (Direction::Download, Verb::Delete, kind) => self.delete_local(&action.relative_path, kind).await,
        }
    }

    async fn upload_file(&self, relative_path: &RelPath) -> Result<TransferOutcome> {
        let path = relative_path.to_local_path(&self.local_root);
        let stat = fs::metadata(&path).await.map_err(|e| io_error(relative_path, "stat", e))?;
        if !stat.is_file() {
            return Err(SyncError::transfer_error(relative_path, "no longer a regular file"));
        }
        let mtime = stat.modified().map_err(|e| io_error(relative_path, "stat", e))?;

        // Metadata comes from the fresh stat, taken before reading moves atime
        let entry = Entry::file(relative_path.clone(), stat.len(), mtime, FileAttributes::from_metadata(&stat))
            .with_atime(stat.accessed().ok());
        let key = relative_path.to_key(&self.prefix);
        let metadata = metadata::encode(&entry);

        if stat.len() <= self.single_put_limit {
            let data = fs::read(&path).await.map_err(|e| io_error(relative_path, "read", e))?;
            let size = data.len() as u64;
            self.client
                .put(&key, Bytes::from(data), metadata)
                .await
                .map_err(|e| store_error(relative_path, e))?;
            return Ok(TransferOutcome::done(size));
        }

        let file = fs::File::open(&path).await.map_err(|e| io_error(relative_path, "open", e))?;
        let sent = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&sent);
        let body = ReaderStream::with_capacity(file, UPLOAD_CHUNK_SIZE)
            .inspect_ok(move |chunk| {
                counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            })
            .map_err(StoreError::from)
            .boxed();

        self.client
            .put_stream(&key, body, metadata)
            .await
            .map_err(|e| store_error(relative_path, e))?;
        Ok(TransferOutcome::done(sent.load(Ordering::Relaxed)))
    }

    async fn download_file(&self, relative_path: &RelPath) -> Result<TransferOutcome> {
        let key = relative_path.to_key(&self.prefix);
        let object = self.client.get(&key).await.map_err(|e| store_error(relative_path, e))?;

        let fallback = FileAttributes::process_default(FileAttributes::DEFAULT_FILE_MODE);
        let decoded = metadata::decode(&key, &object.info.metadata, &fallback);
        let mtime = decoded.mtime.unwrap_or(object.info.last_modified);

        let destination = relative_path.to_local_path(&self.local_root);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(relative_path, "create parent directories", e))?;
        }

        let mode = if self.options.overwrite {
            WriteMode::InPlace
        } else {
            WriteMode::Atomic
        };
        let bytes = self
            .writer
            .write(&destination, object.body, mode)
            .await
            .map_err(|e| SyncError::transfer_error(relative_path, e.reason()))?;

        self.apply_attributes(relative_path, &destination, &decoded.attributes, Some(mtime), decoded.atime)
            .await?;

        Ok(TransferOutcome::Done {
            bytes,
            warnings: decoded.warnings,
        })
    }

    async fn create_local_directory(&self, entry: &Entry) -> Result<TransferOutcome> {
        let relative_path = &entry.relative_path;
        let path = relative_path.to_local_path(&self.local_root);
        // Attributes wait for finish_directory; a read-only mode set now
        // would keep the children from being written
        fs::create_dir_all(&path)
            .await
            .map_err(|e| io_error(relative_path, "create directory", e))?;
        Ok(TransferOutcome::done(0))
    }

    /// Apply a downloaded directory's stored attributes
    ///
    /// Runs after everything below the directory has been written, so the
    /// permission bits and times are final.
    pub async fn finish_directory(&self, action: &Action) -> Result<()> {
        let created = matches!(action.verb, Verb::Create | Verb::Update);
        if action.direction != Direction::Download || action.kind != EntryKind::Directory || !created {
            return Ok(());
        }

        let entry = &action.entry;
        let path = entry.relative_path.to_local_path(&self.local_root);
        self.apply_attributes(&entry.relative_path, &path, &entry.attributes(), Some(entry.mtime), entry.atime)
            .await
    }

    async fn delete_local(&self, relative_path: &RelPath, kind: EntryKind) -> Result<TransferOutcome> {
        let path = relative_path.to_local_path(&self.local_root);
        let result = match kind {
            EntryKind::File => fs::remove_file(&path).await,
            // Only empty directories go; anything left inside was not ours to delete
            EntryKind::Directory => fs::remove_dir(&path).await,
        };

        match result {
            Ok(()) => Ok(TransferOutcome::done(0)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TransferOutcome::done(0)),
            Err(e) => Err(io_error(relative_path, "delete", e)),
        }
    }

    async fn delete_object(&self, relative_path: &RelPath) -> Result<TransferOutcome> {
        let key = relative_path.to_key(&self.prefix);
        match self.client.delete(&key).await {
            Ok(()) => Ok(TransferOutcome::done(0)),
            Err(e) if e.is_not_found() => Ok(TransferOutcome::done(0)),
            Err(e) => Err(store_error(relative_path, e)),
        }
    }

    async fn create_remote_directory(&self, entry: &Entry) -> Result<TransferOutcome> {
        if self.options.empty_directories == EmptyDirPolicy::Ignore {
            return Ok(TransferOutcome::NotApplicable);
        }

        let key = self.marker_key(&entry.relative_path)?;
        self.client
            .put(&key, Bytes::new(), metadata::encode(entry))
            .await
            .map_err(|e| store_error(&entry.relative_path, e))?;
        Ok(TransferOutcome::done(0))
    }

    async fn delete_remote_directory(&self, relative_path: &RelPath) -> Result<TransferOutcome> {
        if self.options.empty_directories == EmptyDirPolicy::Ignore {
            return Ok(TransferOutcome::NotApplicable);
        }

        let key = self.marker_key(relative_path)?;
        match self.client.delete(&key).await {
            Ok(()) => Ok(TransferOutcome::done(0)),
            // Directory implied by its contents only
            Err(e) if e.is_not_found() => Ok(TransferOutcome::NotApplicable),
            Err(e) => Err(store_error(relative_path, e)),
        }
    }

    fn marker_key(&self, relative_path: &RelPath) -> Result<String> {
        let marker = relative_path
            .join(DIRECTORY_MARKER)
            .map_err(|e| SyncError::transfer_error(relative_path, e.to_string()))?;
        Ok(marker.to_key(&self.prefix))
    }

    /// Apply permission bits, then times, then ownership
    async fn apply_attributes(
        &self,
        relative_path: &RelPath,
        path: &Path,
        attributes: &FileAttributes,
        mtime: Option<SystemTime>,
        atime: Option<SystemTime>,
    ) -> Result<()> {
        set_permissions(path, attributes.mode_bits)
            .await
            .map_err(|e| io_error(relative_path, "set permissions", e))?;

        let times = match (atime, mtime) {
            (Some(atime), Some(mtime)) => {
                filetime::set_file_times(path, FileTime::from_system_time(atime), FileTime::from_system_time(mtime))
            }
            (None, Some(mtime)) => filetime::set_file_mtime(path, FileTime::from_system_time(mtime)),
            (Some(atime), None) => filetime::set_file_atime(path, FileTime::from_system_time(atime)),
            (None, None) => Ok(()),
        };
        times.map_err(|e| io_error(relative_path, "set file times", e))?;

        if self.options.preserve_ownership {
            set_ownership(path, attributes.owner_id, attributes.group_id)
                .map_err(|e| io_error(relative_path, "set ownership", e))?;
        }
        Ok(())
    }
}

#[cfg(unix)]
async fn set_permissions(path: &Path, mode_bits: u16) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(u32::from(mode_bits))).await
}

#[cfg(not(unix))]
async fn set_permissions(path: &Path, mode_bits: u16) -> std::io::Result<()> {
    // Only the read-only flag exists here
    let mut permissions = fs::metadata(path).await?.permissions();
    permissions.set_readonly(mode_bits & 0o200 == 0);
    fs::set_permissions(path, permissions).await
}

#[cfg(unix)]
fn set_ownership(path: &Path, owner_id: u32, group_id: u32) -> std::io::Result<()> {
    use std::os::unix::fs::MetadataExt;
    let current = std::fs::metadata(path)?;
    if current.uid() == owner_id && current.gid() == group_id {
        return Ok(());
    }
    std::os::unix::fs::chown(path, Some(owner_id), Some(group_id))
}

#[cfg(not(unix))]
fn set_ownership(_path: &Path, _owner_id: u32, _group_id: u32) -> std::io::Result<()> {
    Ok(())
}

fn io_error(path: &RelPath, operation: &str, error: std::io::Error) -> SyncError {
    SyncError::transfer_error(path, format!("{} failed: {}", operation, error))
}

fn store_error(path: &RelPath, error: StoreError) -> SyncError {
    SyncError::transfer_error(path, error.to_string())
}
