//! Crash-safe file writes
//!
//! [`WriteMode::Atomic`] writes into a temporary file next to the
//! destination and renames it into place, so readers see either the old
//! or the new content. The temporary file is removed when dropped, which
//! covers errors and cancelled futures alike.

use std::path::Path;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::{Result, SyncError};
use crate::store::StoreError;

/// How a destination file is replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Temp file + fsync + rename; the destination gets a new identity
    Atomic,
    /// Truncate and rewrite the existing file; identity is preserved but a
    /// failure may leave partial content
    InPlace,
}

/// Writes streamed content to local files
#[derive(Debug, Default, Clone, Copy)]
pub struct AtomicWriter;

impl AtomicWriter {
    pub fn new() -> Self {
        Self
    }

    /// Write `content` to `destination`, returning the number of bytes written
    ///
    /// The parent directory must exist.
    pub async fn write<S>(&self, destination: &Path, content: S, mode: WriteMode) -> Result<u64>
    where
        S: Stream<Item = std::result::Result<Bytes, StoreError>> + Unpin,
    {
        match mode {
            WriteMode::Atomic => self.write_atomic(destination, content).await,
            WriteMode::InPlace => self.write_in_place(destination, content).await,
        }
    }

    async fn write_atomic<S>(&self, destination: &Path, content: S) -> Result<u64>
    where
        S: Stream<Item = std::result::Result<Bytes, StoreError>> + Unpin,
    {
        let parent = destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let temp = tempfile::Builder::new()
            .prefix(&format!(".{}.", name))
            .suffix(".tmp")
            .tempfile_in(parent)
            .map_err(|e| transfer_error(destination, "create temporary file", e))?;

        // The TempPath guard deletes the file unless it is persisted
        let (file, temp_path) = temp.into_parts();
        let mut file = File::from_std(file);
        let written = copy_stream(&mut file, content, destination).await?;
        file.sync_all()
            .await
            .map_err(|e| transfer_error(destination, "sync", e))?;
        drop(file);

        temp_path
            .persist(destination)
            .map_err(|e| transfer_error(destination, "rename into place", e.error))?;
        Ok(written)
    }

    async fn write_in_place<S>(&self, destination: &Path, content: S) -> Result<u64>
    where
        S: Stream<Item = std::result::Result<Bytes, StoreError>> + Unpin,
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(destination)
            .await
            .map_err(|e| transfer_error(destination, "open", e))?;

        let written = copy_stream(&mut file, content, destination).await?;
        file.sync_all()
            .await
            .map_err(|e| transfer_error(destination, "sync", e))?;
        Ok(written)
    }
}

async fn copy_stream<S>(file: &mut File, mut content: S, destination: &Path) -> Result<u64>
where
    S: Stream<Item = std::result::Result<Bytes, StoreError>> + Unpin,
{
    let mut written = 0u64;
    while let Some(chunk) = content.next().await {
        let chunk = chunk.map_err(|e| SyncError::transfer_error(destination.display(), e.to_string()))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| transfer_error(destination, "write", e))?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(|e| transfer_error(destination, "write", e))?;
    Ok(written)
}

fn transfer_error(path: &Path, operation: &str, error: std::io::Error) -> SyncError {
    SyncError::transfer_error(path.display(), format!("{} failed: {}", operation, error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tempfile::TempDir;

    fn chunks(parts: &[&'static [u8]]) -> impl Stream<Item = std::result::Result<Bytes, StoreError>> + Unpin {
        stream::iter(parts.iter().map(|p| Ok(Bytes::from_static(p))).collect::<Vec<_>>())
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".tmp"))
            .collect()
    }

    #[cfg(unix)]
    fn inode(path: &Path) -> u64 {
        use std::os::unix::fs::MetadataExt;
        std::fs::metadata(path).unwrap().ino()
    }

    #[tokio::test]
    async fn test_atomic_write_creates_and_replaces() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("file.txt");
        std::fs::write(&dest, b"old content").unwrap();

        let written = AtomicWriter::new()
            .write(&dest, chunks(&[b"new ", b"content"]), WriteMode::Atomic)
            .await
            .unwrap();

        assert_eq!(written, 11);
        assert_eq!(std::fs::read(&dest).unwrap(), b"new content");
        assert!(leftovers(temp.path()).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_identity_changes_atomically_and_is_kept_in_place() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("file.bin");
        std::fs::write(&dest, b"0").unwrap();
        // Hold a handle so the old inode cannot be recycled
        let _original = std::fs::File::open(&dest).unwrap();
        let before = inode(&dest);

        let writer = AtomicWriter::new();
        writer.write(&dest, chunks(&[b"1"]), WriteMode::InPlace).await.unwrap();
        assert_eq!(inode(&dest), before);
        assert_eq!(std::fs::read(&dest).unwrap(), b"1");

        writer.write(&dest, chunks(&[b"2"]), WriteMode::Atomic).await.unwrap();
        assert_ne!(inode(&dest), before);
        assert_eq!(std::fs::read(&dest).unwrap(), b"2");
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_destination_untouched() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("keep.txt");
        std::fs::write(&dest, b"original").unwrap();

        let failing = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(StoreError::Backend("connection reset".to_string())),
        ]);
        let err = AtomicWriter::new()
            .write(&dest, failing, WriteMode::Atomic)
            .await
            .unwrap_err();

        assert!(!err.is_fatal());
        assert_eq!(std::fs::read(&dest).unwrap(), b"original");
        assert!(leftovers(temp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_empty_content() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("empty");
        let written = AtomicWriter::new()
            .write(&dest, chunks(&[]), WriteMode::Atomic)
            .await
            .unwrap();
        assert_eq!(written, 0);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 0);
    }
}
