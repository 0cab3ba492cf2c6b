//! End-to-end tests for sync runs against an in-memory bucket

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use filetime::FileTime;
use futures::stream::BoxStream;
use tempfile::TempDir;

use crate::config::{EmptyDirPolicy, Location, SyncOptions};
use crate::diff::Verb;
use crate::error::SyncError;
use crate::metadata::MetadataMap;
use crate::store::{GetObject, MemoryStore, ObjectClient, ObjectInfo, ObjectSummary, StoreError, DIRECTORY_MARKER};
use crate::summary::{Outcome, RunSummary};
use crate::sync_engine::SyncEngine;

const BASE_SECS: u64 = 1_650_000_000;

fn remote(prefix: &str) -> Location {
    Location::parse(&format!("s3://bucket/{}", prefix)).unwrap()
}

fn local(path: &Path) -> Location {
    Location::Local(path.to_path_buf())
}

fn time(secs: u64, nanos: u32) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::new(secs, nanos)
}

/// Write a file with an explicit mtime, creating parents
fn write_file(root: &Path, relative: &str, content: &[u8], mtime: SystemTime) -> PathBuf {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, content).unwrap();
    filetime::set_file_mtime(&path, FileTime::from_system_time(mtime)).unwrap();
    path
}

fn mtime_of(path: &Path) -> SystemTime {
    std::fs::metadata(path).unwrap().modified().unwrap()
}

#[cfg(unix)]
fn mode_of(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).unwrap().permissions().mode() & 0o7777
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
}

async fn run(store: &Arc<MemoryStore>, source: &Location, destination: &Location, options: SyncOptions) -> RunSummary {
    SyncEngine::new(store.clone(), options)
        .sync(source, destination)
        .await
        .unwrap()
}

fn with_delete() -> SyncOptions {
    SyncOptions {
        delete: true,
        ..Default::default()
    }
}

fn multi_block() -> Vec<u8> {
    (0..3 * 1024 * 1024 + 17).map(|i| (i % 251) as u8).collect()
}

/// Populates a source tree with a zero-byte, a small and a multi-block file
fn populate(root: &Path) {
    write_file(root, "empty.bin", b"", time(BASE_SECS, 0));
    write_file(root, "docs/readme.txt", b"hello world", time(BASE_SECS, 123_456_789));
    write_file(root, "docs/deep/nested/large.bin", &multi_block(), time(BASE_SECS + 5, 0));
}

fn assert_trees_equal(left: &Path, right: &Path, relative: &[&str]) {
    for path in relative {
        let (a, b) = (left.join(path), right.join(path));
        assert_eq!(std::fs::read(&a).unwrap(), std::fs::read(&b).unwrap(), "content of {}", path);
        assert_eq!(mtime_of(&a), mtime_of(&b), "mtime of {}", path);
        #[cfg(unix)]
        assert_eq!(mode_of(&a), mode_of(&b), "mode of {}", path);
    }
}

const FILES: [&str; 3] = ["empty.bin", "docs/readme.txt", "docs/deep/nested/large.bin"];

mod round_trip_tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_then_download_reproduces_tree() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        populate(source.path());
        #[cfg(unix)]
        set_mode(&source.path().join("docs/readme.txt"), 0o640);

        let upload = run(&store, &local(source.path()), &remote("backup"), SyncOptions::default()).await;
        assert!(upload.is_successful());
        assert_eq!(upload.stats().bytes_transferred, 11 + multi_block().len() as u64);
        assert_eq!(
            store.keys(),
            vec!["backup/docs/deep/nested/large.bin", "backup/docs/readme.txt", "backup/empty.bin"]
        );

        let download = run(&store, &remote("backup"), &local(target.path()), SyncOptions::default()).await;
        assert!(download.is_successful());
        assert_trees_equal(source.path(), target.path(), &FILES);
    }

    #[tokio::test]
    async fn test_runs_are_idempotent() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        populate(source.path());

        run(&store, &local(source.path()), &remote("p"), with_delete()).await;
        let again = run(&store, &local(source.path()), &remote("p"), with_delete()).await;
        assert_eq!(again.stats().created + again.stats().updated + again.stats().deleted, 0);
        assert!(again.results.iter().all(|r| r.outcome == Outcome::Skipped));

        run(&store, &remote("p"), &local(target.path()), with_delete()).await;
        let again = run(&store, &remote("p"), &local(target.path()), with_delete()).await;
        assert_eq!(again.stats().bytes_transferred, 0);
        assert!(again.results.iter().all(|r| r.outcome == Outcome::Skipped));
    }

    #[tokio::test]
    async fn test_nested_directories_are_created_on_download() {
        let target = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert("p/a/b/c/d/leaf.txt", "leaf", MetadataMap::new(), time(BASE_SECS, 0));

        let summary = run(&store, &remote("p"), &local(&target.path().join("fresh")), SyncOptions::default()).await;

        assert!(summary.is_successful());
        assert_eq!(summary.stats().created, 5);
        let leaf = target.path().join("fresh/a/b/c/d/leaf.txt");
        assert_eq!(std::fs::read(&leaf).unwrap(), b"leaf");
        // No stored mtime: the object's last-modified time is used
        assert_eq!(mtime_of(&leaf), time(BASE_SECS, 0));
    }

    #[tokio::test]
    async fn test_single_object_download() {
        let target = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert("p/one/file.bin", "payload", MetadataMap::new(), time(BASE_SECS, 0));

        let destination = target.path().join("copy.bin");
        let summary = run(&store, &remote("p/one/file.bin"), &local(&destination), SyncOptions::default()).await;

        assert!(summary.is_successful());
        assert_eq!(summary.results.len(), 1);
        assert_eq!(std::fs::read(&destination).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_marker_policy_keeps_empty_directories() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        std::fs::create_dir_all(source.path().join("empty/inner")).unwrap();
        let options = SyncOptions {
            empty_directories: EmptyDirPolicy::Marker,
            ..Default::default()
        };

        run(&store, &local(source.path()), &remote("p"), options.clone()).await;
        assert_eq!(
            store.keys(),
            vec![format!("p/empty/{}", DIRECTORY_MARKER), format!("p/empty/inner/{}", DIRECTORY_MARKER)]
        );

        run(&store, &remote("p"), &local(target.path()), options.clone()).await;
        assert!(target.path().join("empty/inner").is_dir());
        assert!(!target.path().join("empty").join(DIRECTORY_MARKER).exists());

        // Markers do not come back as files on the next upload
        let again = run(&store, &local(target.path()), &remote("p"), options).await;
        assert!(again.results.iter().all(|r| r.verb == Verb::Skip));
    }
}

mod change_detection_tests {
    use super::*;

    #[tokio::test]
    async fn test_size_change_is_uploaded() {
        let source = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mtime = time(BASE_SECS, 0);
        write_file(source.path(), "f.txt", b"short", mtime);
        run(&store, &local(source.path()), &remote("p"), SyncOptions::default()).await;

        // Same mtime, different size
        write_file(source.path(), "f.txt", b"much longer", mtime);
        let summary = run(&store, &local(source.path()), &remote("p"), SyncOptions::default()).await;

        assert_eq!(summary.stats().updated, 1);
        assert_eq!(store.data("p/f.txt").unwrap(), Bytes::from_static(b"much longer"));
    }

    #[tokio::test]
    async fn test_mtime_change_is_uploaded_and_content_is_never_compared() {
        let source = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        write_file(source.path(), "f.txt", b"aaaa", time(BASE_SECS, 0));
        run(&store, &local(source.path()), &remote("p"), SyncOptions::default()).await;

        // Same size and mtime: not detected
        write_file(source.path(), "f.txt", b"bbbb", time(BASE_SECS, 0));
        let unchanged = run(&store, &local(source.path()), &remote("p"), SyncOptions::default()).await;
        assert_eq!(unchanged.stats().updated, 0);
        assert_eq!(store.data("p/f.txt").unwrap(), Bytes::from_static(b"aaaa"));

        // Newer mtime: detected
        write_file(source.path(), "f.txt", b"cccc", time(BASE_SECS + 10, 0));
        let changed = run(&store, &local(source.path()), &remote("p"), SyncOptions::default()).await;
        assert_eq!(changed.stats().updated, 1);
        assert_eq!(store.data("p/f.txt").unwrap(), Bytes::from_static(b"cccc"));
    }

    #[tokio::test]
    async fn test_newer_remote_object_is_downloaded() {
        let target = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let path = write_file(target.path(), "f.txt", b"old!", time(BASE_SECS, 0));
        store.insert("p/f.txt", "new!", MetadataMap::new(), time(BASE_SECS + 60, 0));

        let summary = run(&store, &remote("p"), &local(target.path()), SyncOptions::default()).await;

        assert_eq!(summary.stats().updated, 1);
        assert_eq!(std::fs::read(&path).unwrap(), b"new!");
        assert_eq!(mtime_of(&path), time(BASE_SECS + 60, 0));
    }

    #[tokio::test]
    async fn test_older_remote_object_is_left_alone() {
        let target = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let path = write_file(target.path(), "f.txt", b"mine", time(BASE_SECS + 60, 0));
        store.insert("p/f.txt", "old!", MetadataMap::new(), time(BASE_SECS, 0));

        let summary = run(&store, &remote("p"), &local(target.path()), SyncOptions::default()).await;

        assert_eq!(summary.stats().updated, 0);
        assert_eq!(std::fs::read(&path).unwrap(), b"mine");
    }
}

mod deletion_tests {
    use super::*;

    fn seed_remote(store: &MemoryStore) {
        for key in ["p/keep.txt", "p/stale.txt", "p/stale/dir/f", "other/x", "p-sibling/y", "prefix/z"] {
            store.insert(key, "x", MetadataMap::new(), time(BASE_SECS, 0));
        }
    }

    #[tokio::test]
    async fn test_without_delete_extra_objects_remain() {
        let source = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        seed_remote(&store);
        write_file(source.path(), "keep.txt", b"x", time(BASE_SECS, 0));

        let summary = run(&store, &local(source.path()), &remote("p"), SyncOptions::default()).await;

        assert_eq!(summary.stats().deleted, 0);
        assert_eq!(store.len(), 6);
    }

    #[tokio::test]
    async fn test_delete_is_scoped_to_prefix() {
        let source = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        seed_remote(&store);
        write_file(source.path(), "keep.txt", b"x", time(BASE_SECS, 0));

        let summary = run(&store, &local(source.path()), &remote("p"), with_delete()).await;

        assert!(summary.is_successful());
        assert_eq!(store.keys(), vec!["other/x", "p-sibling/y", "p/keep.txt", "prefix/z"]);
    }

    #[tokio::test]
    async fn test_local_delete_removes_files_then_directories() {
        let target = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert("p/keep.txt", "x", MetadataMap::new(), time(BASE_SECS, 0));
        write_file(target.path(), "keep.txt", b"x", time(BASE_SECS, 0));
        write_file(target.path(), "gone/deeper/f1", b"1", time(BASE_SECS, 0));
        write_file(target.path(), "gone/f2", b"2", time(BASE_SECS, 0));

        let summary = run(&store, &remote("p"), &local(target.path()), with_delete()).await;

        assert!(summary.is_successful());
        assert_eq!(summary.stats().deleted, 4);
        assert!(!target.path().join("gone").exists());
        assert!(target.path().join("keep.txt").exists());
    }

    #[tokio::test]
    async fn test_missing_remote_source_is_fatal() {
        let target = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert("p/real.txt", "x", MetadataMap::new(), time(BASE_SECS, 0));
        let precious = write_file(target.path(), "precious.txt", b"do not delete", time(BASE_SECS, 0));

        let err = SyncEngine::new(store.clone(), with_delete())
            .sync(&remote("typo"), &local(target.path()))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Access { .. }));
        assert!(err.is_fatal());
        assert!(precious.exists());
    }

    #[tokio::test]
    async fn test_single_object_onto_directory_is_refused() {
        let target = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert("p/file.bin", "payload", MetadataMap::new(), time(BASE_SECS, 0));
        let keep = write_file(target.path(), "keep.txt", b"keep", time(BASE_SECS, 0));
        let other = write_file(target.path(), "sub/other.txt", b"other", time(BASE_SECS, 0));

        let err = SyncEngine::new(store.clone(), with_delete())
            .sync(&remote("p/file.bin"), &local(target.path()))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Planning { .. }));
        assert!(keep.exists());
        assert!(other.exists());

        // An empty directory is still a directory
        let empty = TempDir::new().unwrap();
        let err = SyncEngine::new(store.clone(), with_delete())
            .sync(&remote("p/file.bin"), &local(empty.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Planning { .. }));
    }

    #[tokio::test]
    async fn test_single_file_onto_prefix_is_refused() {
        let source = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert("p/child", "x", MetadataMap::new(), time(BASE_SECS, 0));
        let file = write_file(source.path(), "one.txt", b"one", time(BASE_SECS, 0));

        let err = SyncEngine::new(store.clone(), with_delete())
            .sync(&local(&file), &remote("p"))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Planning { .. }));
        assert_eq!(store.keys(), vec!["p/child"]);
    }

    #[tokio::test]
    async fn test_directory_onto_single_object_is_refused() {
        let source = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert("p", "x", MetadataMap::new(), time(BASE_SECS, 0));
        write_file(source.path(), "a.txt", b"a", time(BASE_SECS, 0));

        let err = SyncEngine::new(store.clone(), with_delete())
            .sync(&local(source.path()), &remote("p"))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Planning { .. }));
        assert_eq!(store.keys(), vec!["p"]);
    }

    #[tokio::test]
    async fn test_single_file_upload_is_idempotent() {
        let source = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let file = write_file(source.path(), "one.txt", b"one", time(BASE_SECS, 0));

        let first = run(&store, &local(&file), &remote("backup/one.txt"), SyncOptions::default()).await;
        assert_eq!(first.stats().created, 1);
        let again = run(&store, &local(&file), &remote("backup/one.txt"), SyncOptions::default()).await;
        assert!(again.results.iter().all(|r| r.outcome == Outcome::Skipped));
        assert_eq!(store.keys(), vec!["backup/one.txt"]);
    }

    #[tokio::test]
    async fn test_kind_mismatch_replaced_only_with_delete() {
        let target = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert("p/x/inner.txt", "inner", MetadataMap::new(), time(BASE_SECS, 0));
        write_file(target.path(), "x", b"a file", time(BASE_SECS, 0));

        let kept = run(&store, &remote("p"), &local(target.path()), SyncOptions::default()).await;
        assert!(kept.is_successful());
        assert!(target.path().join("x").is_file());

        let replaced = run(&store, &remote("p"), &local(target.path()), with_delete()).await;
        assert!(replaced.is_successful());
        assert_eq!(std::fs::read(target.path().join("x/inner.txt")).unwrap(), b"inner");
    }
}

mod write_mode_tests {
    use super::*;

    #[cfg(unix)]
    fn inode(path: &Path) -> u64 {
        use std::os::unix::fs::MetadataExt;
        std::fs::metadata(path).unwrap().ino()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_atomic_download_replaces_identity() {
        let target = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let path = write_file(target.path(), "f", b"old", time(BASE_SECS, 0));
        let _held = std::fs::File::open(&path).unwrap();
        let before = inode(&path);
        store.insert("p/f", "newer", MetadataMap::new(), time(BASE_SECS + 1, 0));

        run(&store, &remote("p"), &local(target.path()), SyncOptions::default()).await;

        assert_ne!(inode(&path), before);
        assert_eq!(std::fs::read(&path).unwrap(), b"newer");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_overwrite_download_preserves_identity() {
        let target = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let path = write_file(target.path(), "f", b"old", time(BASE_SECS, 0));
        let before = inode(&path);
        store.insert("p/f", "old", MetadataMap::new(), time(BASE_SECS, 0));

        let options = SyncOptions {
            overwrite: true,
            ..Default::default()
        };
        let summary = run(&store, &remote("p"), &local(target.path()), options).await;

        // Overwrite transfers even unchanged files
        assert_eq!(summary.stats().updated, 1);
        assert_eq!(inode(&path), before);
    }
}

mod metadata_tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_attributes_survive_the_round_trip() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let path = write_file(source.path(), "script.sh", b"#!/bin/sh\n", time(BASE_SECS, 987_654_321));
        set_mode(&path, 0o750);
        let atime = time(BASE_SECS + 3_600, 5);
        filetime::set_file_times(
            &path,
            FileTime::from_system_time(atime),
            FileTime::from_system_time(time(BASE_SECS, 987_654_321)),
        )
        .unwrap();

        run(&store, &local(source.path()), &remote("p"), SyncOptions::default()).await;
        let stored = store.info("p/script.sh").unwrap().metadata;
        assert_eq!(stored["mode"], "0750");
        assert_eq!(stored["mtime"], format!("{}.987654321", BASE_SECS));
        assert_eq!(stored["atime"], format!("{}.000000005", BASE_SECS + 3_600));

        run(&store, &remote("p"), &local(target.path()), SyncOptions::default()).await;
        let copy = target.path().join("script.sh");
        assert_eq!(mode_of(&copy), 0o750);
        assert_eq!(mtime_of(&copy), time(BASE_SECS, 987_654_321));
        assert_eq!(std::fs::metadata(&copy).unwrap().accessed().unwrap(), atime);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_read_only_directory_is_locked_after_its_children() {
        let target = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut metadata = MetadataMap::new();
        metadata.insert("mode".to_string(), "0555".to_string());
        store.insert(format!("p/ro/{}", DIRECTORY_MARKER), "", metadata, time(BASE_SECS, 0));
        store.insert("p/ro/inner/f", "content", MetadataMap::new(), time(BASE_SECS, 0));
        let options = SyncOptions {
            empty_directories: EmptyDirPolicy::Marker,
            ..Default::default()
        };

        let summary = run(&store, &remote("p"), &local(target.path()), options).await;

        assert!(summary.is_successful());
        let dir = target.path().join("ro");
        assert_eq!(std::fs::read(dir.join("inner/f")).unwrap(), b"content");
        assert_eq!(mode_of(&dir), 0o555);
        set_mode(&dir, 0o755);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stored_ownership_is_applied_when_privileged() {
        use std::os::unix::fs::MetadataExt;

        // SAFETY: geteuid has no preconditions
        if unsafe { libc::geteuid() } != 0 {
            return;
        }

        let target = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut metadata = MetadataMap::new();
        metadata.insert("owner".to_string(), "1234".to_string());
        metadata.insert("group".to_string(), "5678".to_string());
        store.insert("p/owned", "x", metadata, time(BASE_SECS, 0));

        run(&store, &remote("p"), &local(target.path()), SyncOptions::default()).await;
        let stat = std::fs::metadata(target.path().join("owned")).unwrap();
        assert_eq!((stat.uid(), stat.gid()), (1234, 5678));
    }

    #[tokio::test]
    async fn test_malformed_metadata_is_a_warning_not_a_failure() {
        let target = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut metadata = MetadataMap::new();
        metadata.insert("mode".to_string(), "rwxr-xr-x".to_string());
        store.insert("p/f", "x", metadata, time(BASE_SECS, 0));

        let summary = run(&store, &remote("p"), &local(target.path()), SyncOptions::default()).await;

        assert!(summary.is_successful());
        assert_eq!(summary.exit_code(), 0);
        assert!(!summary.warnings.is_empty());
        assert!(summary.warnings.iter().all(|w| w.key == "mode"));
        #[cfg(unix)]
        assert_eq!(mode_of(&target.path().join("f")), 0o644);
    }
}

mod run_control_tests {
    use super::*;

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let source = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        populate(source.path());
        store.insert("p/extra", "x", MetadataMap::new(), time(BASE_SECS, 0));

        let options = SyncOptions {
            dry_run: true,
            delete: true,
            ..Default::default()
        };
        let summary = run(&store, &local(source.path()), &remote("p"), options).await;

        assert!(summary.dry_run);
        assert!(summary.results.iter().all(|r| r.outcome == Outcome::Skipped));
        assert!(summary.results.iter().any(|r| r.verb == Verb::Delete));
        assert_eq!(store.keys(), vec!["p/extra"]);
    }

    #[tokio::test]
    async fn test_preview_returns_plan_without_changes() {
        let source = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        populate(source.path());

        let plan = SyncEngine::new(store.clone(), SyncOptions::default())
            .preview(&local(source.path()), &remote("p"))
            .await
            .unwrap();

        assert_eq!(plan.summary.bytes_to_transfer, 11 + multi_block().len() as u64);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_dispatches_nothing() {
        let source = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        populate(source.path());

        let engine = SyncEngine::new(store.clone(), SyncOptions::default());
        engine.cancellation_token().cancel();
        let summary = engine.sync(&local(source.path()), &remote("p")).await.unwrap();

        assert!(summary.cancelled);
        assert!(!summary.results.is_empty());
        assert!(summary.results.iter().all(|r| r.outcome == Outcome::Skipped));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_failed_parent_directory_fails_only_its_subtree() {
        let target = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert("p/x/blocked/f", "1", MetadataMap::new(), time(BASE_SECS, 0));
        store.insert("p/y/g", "2", MetadataMap::new(), time(BASE_SECS, 0));
        // A plain file where a directory must go; marker-named files are
        // invisible to the local scan under the marker policy
        let remote_key = format!("p/x/{}/f", DIRECTORY_MARKER);
        store.insert(remote_key, "3", MetadataMap::new(), time(BASE_SECS, 0));
        write_file(target.path(), &format!("x/{}", DIRECTORY_MARKER), b"", time(BASE_SECS, 0));

        let options = SyncOptions {
            empty_directories: EmptyDirPolicy::Marker,
            ..Default::default()
        };
        let summary = run(&store, &remote("p"), &local(target.path()), options).await;

        let failed: Vec<String> = summary.failures().map(|r| r.relative_path.to_string()).collect();
        assert_eq!(
            failed,
            vec![format!("x/{}", DIRECTORY_MARKER), format!("x/{}/f", DIRECTORY_MARKER)]
        );
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(std::fs::read(target.path().join("x/blocked/f")).unwrap(), b"1");
        assert_eq!(std::fs::read(target.path().join("y/g")).unwrap(), b"2");
    }

    /// Bucket whose writes fail for keys containing a marker string
    struct FailingStore {
        inner: MemoryStore,
        fail_on: &'static str,
    }

    #[async_trait]
    impl ObjectClient for FailingStore {
        fn list(&self, prefix: &str) -> BoxStream<'_, Result<ObjectSummary, StoreError>> {
            self.inner.list(prefix)
        }

        async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, StoreError> {
            self.inner.head(key).await
        }

        async fn get(&self, key: &str) -> Result<GetObject, StoreError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, body: Bytes, metadata: MetadataMap) -> Result<(), StoreError> {
            if key.contains(self.fail_on) {
                return Err(StoreError::Backend("injected failure".to_string()));
            }
            self.inner.put(key, body, metadata).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn test_failed_upload_is_recorded_and_the_run_continues() {
        let source = TempDir::new().unwrap();
        populate(source.path());
        let store = Arc::new(FailingStore {
            inner: MemoryStore::new(),
            fail_on: "readme",
        });

        let summary = SyncEngine::new(store.clone(), SyncOptions::default())
            .sync(&local(source.path()), &remote("p"))
            .await
            .unwrap();

        let failed: Vec<_> = summary.failures().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].relative_path.as_str(), "docs/readme.txt");
        assert_eq!(failed[0].outcome, Outcome::Failed("injected failure".to_string()));
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(store.inner.len(), 2);
    }
}
