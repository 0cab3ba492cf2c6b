//! Basic sync example: upload a tree into an in-memory bucket and bring it back

use std::error::Error;
use std::sync::Arc;
use treesync::{Location, MemoryStore, SyncEngine, SyncOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    println!("Basic Sync Example");
    println!("==================");

    let temp_dir = tempfile::TempDir::new()?;
    let source_dir = temp_dir.path().join("source");
    let restore_dir = temp_dir.path().join("restore");

    tokio::fs::create_dir_all(source_dir.join("subdir")).await?;
    tokio::fs::write(source_dir.join("file1.txt"), b"This is file 1 content").await?;
    tokio::fs::write(source_dir.join("file2.txt"), b"This is file 2 content").await?;
    tokio::fs::write(source_dir.join("subdir").join("file3.txt"), b"This is file 3 content").await?;

    let store = Arc::new(MemoryStore::new());
    let local = Location::Local(source_dir.clone());
    let remote = Location::parse("s3://demo/backups/source")?;
    let restore = Location::Local(restore_dir.clone());

    // Example 1: Upload
    println!("Example 1: Upload");
    println!("-----------------");

    let engine = SyncEngine::new(store.clone(), SyncOptions::default());
    let summary = engine.sync(&local, &remote).await?;
    println!("{}", summary.summary());
    for key in store.keys() {
        println!("  {}", key);
    }
    println!();

    // Example 2: Preview a download
    println!("Example 2: Download Preview");
    println!("---------------------------");

    let plan = engine.preview(&remote, &restore).await?;
    println!("  Creates: {}", plan.summary.creates);
    println!("  Bytes to transfer: {}", plan.summary.bytes_to_transfer);
    for action in plan.actions.iter().take(5) {
        println!("  {:?} {}", action.verb, action.relative_path);
    }
    println!();

    // Example 3: Download, then run again to show nothing is left to do
    println!("Example 3: Download");
    println!("-------------------");

    let summary = engine.sync(&remote, &restore).await?;
    println!("{}", summary.summary());
    assert!(restore_dir.join("subdir").join("file3.txt").exists());

    let again = engine.sync(&remote, &restore).await?;
    println!("Second run: {} skipped, {} bytes", again.stats().skipped, again.stats().bytes_transferred);
    println!();

    // Example 4: Mirror a deletion with dry run first
    println!("Example 4: Delete Extraneous Objects");
    println!("------------------------------------");

    tokio::fs::remove_file(source_dir.join("file2.txt")).await?;
    let options = SyncOptions {
        delete: true,
        dry_run: true,
        ..Default::default()
    };
    let dry = SyncEngine::new(store.clone(), options.clone()).sync(&local, &remote).await?;
    println!("Dry run: {}", dry.summary());

    let options = SyncOptions { dry_run: false, ..options };
    let summary = SyncEngine::new(store.clone(), options).sync(&local, &remote).await?;
    println!("{}", summary.summary());
    assert!(store.data("backups/source/file2.txt").is_none());

    println!();
    println!("All examples completed successfully!");

    Ok(())
}
