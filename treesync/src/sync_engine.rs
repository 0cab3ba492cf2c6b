//! Main sync engine that orchestrates the synchronization process
//!
//! A run enumerates both sides, plans with the [`DiffEngine`] and executes
//! the plan in stages:
//!
//! 1. file deletes
//! 2. directory deletes, deepest first
//! 3. directory creates, shallowest first
//! 4. file creates and updates
//! 5. attributes of downloaded directories, deepest first
//!
//! Actions within a stage are independent and run concurrently up to
//! `max_concurrency`; each stage waits for the previous one.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Direction, EmptyDirPolicy, Location, SyncOptions};
use crate::diff::{Action, DiffEngine, DiffOptions, SyncPlan, Verb};
use crate::entry::{EntryKind, RelPath};
use crate::error::{Result, SyncError};
use crate::metadata::MetadataWarning;
use crate::scanner::{LocalTree, RemoteTree};
use crate::store::{ObjectClient, DIRECTORY_MARKER};
use crate::summary::{Outcome, RunSummary, TransferResult};
use crate::transfer::{TransferOptions, TransferOutcome, Transferer};

/// Main sync engine
///
/// The engine is bound to one bucket through its client. A cancelled engine
/// stays cancelled; create a new one for the next run.
pub struct SyncEngine {
    client: Arc<dyn ObjectClient>,
    options: SyncOptions,
    cancel: CancellationToken,
}

impl SyncEngine {
    /// Create a new sync engine with options
    pub fn new(client: Arc<dyn ObjectClient>, options: SyncOptions) -> Self {
        Self {
            client,
            options,
            cancel: CancellationToken::new(),
        }
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Token that stops dispatching new actions when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Plan a run without executing it
    pub async fn preview(&self, source: &Location, destination: &Location) -> Result<SyncPlan> {
        self.options.validate()?;
        let endpoints = Endpoints::resolve(source, destination)?;
        let (plan, _) = self.plan(&endpoints).await?;
        Ok(plan)
    }

    /// Synchronize `destination` with `source`
    ///
    /// Enumeration and planning errors abort the run before anything is
    /// changed. Failed actions are recorded in the summary and do not stop
    /// the run.
    pub async fn sync(&self, source: &Location, destination: &Location) -> Result<RunSummary> {
        self.options.validate()?;
        let endpoints = Endpoints::resolve(source, destination)?;

        info!(
            source = %source,
            destination = %destination,
            direction = %endpoints.direction,
            delete = self.options.delete,
            overwrite = self.options.overwrite,
            dry_run = self.options.dry_run,
            "Starting sync"
        );

        let mut summary = RunSummary::new(endpoints.direction, self.options.dry_run);
        let (plan, warnings) = self.plan(&endpoints).await?;
        summary.warnings = warnings;

        if self.options.dry_run {
            for action in &plan.actions {
                debug!(path = %action.relative_path, verb = ?action.verb, kind = ?action.kind, "dry run");
            }
            summary.results = plan
                .actions
                .iter()
                .map(|a| TransferResult::skipped(a.relative_path.clone(), a.verb))
                .collect();
            summary.complete();
            return Ok(summary);
        }

        let transferer = Transferer::new(
            self.client.clone(),
            endpoints.local_root.clone(),
            endpoints.prefix.clone(),
            TransferOptions::from(&self.options),
        );
        let (results, warnings) = self.execute(&plan, &transferer).await;
        summary.results = results;
        summary.warnings.extend(warnings);
        summary.cancelled = self.cancel.is_cancelled();
        summary.complete();
        Ok(summary)
    }

    async fn plan(&self, endpoints: &Endpoints) -> Result<(SyncPlan, Vec<MetadataWarning>)> {
        let direction = endpoints.direction;

        let mut local = LocalTree::new(&endpoints.local_root, self.options.follow_links);
        if self.options.empty_directories == EmptyDirPolicy::Marker {
            local = local.exclude_files_named(DIRECTORY_MARKER);
        }
        let remote = RemoteTree::new(self.client.clone(), endpoints.prefix.clone())
            .with_label(endpoints.remote_label.clone())
            .with_metadata_concurrency(self.options.metadata_concurrency);

        // A missing destination is simply empty; a missing source is an error
        let local_missing_ok = direction == Direction::Download;
        let remote_missing_ok = direction == Direction::Upload;

        let (local_entries, listing) = tokio::join!(
            tokio::task::spawn_blocking(move || local.scan(local_missing_ok)),
            remote.scan(remote_missing_ok),
        );
        let local_entries = local_entries.map_err(join_error)??;
        let listing = listing?;
        check_root_kinds(direction, local_entries.root_kind(), listing.root_kind)?;

        let engine = DiffEngine::new(DiffOptions::from(&self.options), direction);
        let remote_entries = listing.entries;
        // The local walk streams into the merge, which blocks on the filesystem
        let plan = tokio::task::spawn_blocking(move || match direction {
            Direction::Upload => engine.plan(local_entries, remote_entries.into_iter().map(Ok)),
            Direction::Download => engine.plan(remote_entries.into_iter().map(Ok), local_entries),
        })
        .await
        .map_err(join_error)??;

        info!(
            direction = %direction,
            creates = plan.summary.creates,
            updates = plan.summary.updates,
            deletes = plan.summary.deletes,
            skips = plan.summary.skips,
            bytes_to_transfer = plan.summary.bytes_to_transfer,
            warnings = listing.warnings.len(),
            "Sync plan ready"
        );

        Ok((plan, listing.warnings))
    }

    /// Run every pending action stage by stage
    ///
    /// Returns one result per action in plan order.
    async fn execute(&self, plan: &SyncPlan, transferer: &Transferer) -> (Vec<TransferResult>, Vec<MetadataWarning>) {
        let actions = &plan.actions;
        let mut results: Vec<Option<TransferResult>> = vec![None; actions.len()];
        let mut warnings = Vec::new();
        let mut blocked = Blocked::default();
        let cancel = &self.cancel;

        for (number, stage) in stages(actions).into_iter().enumerate() {
            let mut runnable = Vec::with_capacity(stage.len());
            for index in stage {
                let action = &actions[index];
                match blocked.reason(action) {
                    Some(reason) => {
                        debug!(path = %action.relative_path, reason, "action not attempted");
                        blocked.record_failure(action);
                        results[index] = Some(TransferResult::failed(action.relative_path.clone(), action.verb, reason));
                    }
                    None => runnable.push(index),
                }
            }

            debug!(stage = number, actions = runnable.len(), "executing stage");

            let finished: Vec<(usize, TransferResult, Vec<MetadataWarning>)> = stream::iter(runnable)
                .map(|index| async move {
                    let action = &actions[index];
                    if cancel.is_cancelled() {
                        return (index, TransferResult::skipped(action.relative_path.clone(), action.verb), Vec::new());
                    }
                    let (result, warnings) = run_action(transferer, action).await;
                    (index, result, warnings)
                })
                .buffer_unordered(self.options.max_concurrency.max(1))
                .collect()
                .await;

            for (index, result, action_warnings) in finished {
                if result.is_failed() {
                    blocked.record_failure(&actions[index]);
                }
                warnings.extend(action_warnings);
                results[index] = Some(result);
            }
        }

        self.finish_directories(actions, &mut results, transferer).await;

        if cancel.is_cancelled() {
            info!("Sync cancelled; remaining actions were not dispatched");
        }

        let results = results
            .into_iter()
            .zip(actions)
            .map(|(result, action)| {
                result.unwrap_or_else(|| TransferResult::skipped(action.relative_path.clone(), action.verb))
            })
            .collect();
        (results, warnings)
    }

    /// Apply the stored attributes of every directory created locally
    ///
    /// Deepest first, so a read-only parent is locked only after its
    /// children are done.
    async fn finish_directories(
        &self,
        actions: &[Action],
        results: &mut [Option<TransferResult>],
        transferer: &Transferer,
    ) {
        let mut levels: BTreeMap<Reverse<usize>, Vec<usize>> = BTreeMap::new();
        for (index, action) in actions.iter().enumerate() {
            let created = matches!(&results[index], Some(result) if result.outcome == Outcome::Success);
            if created && action.direction == Direction::Download && action.is_dir() {
                levels.entry(Reverse(action.relative_path.depth())).or_default().push(index);
            }
        }

        for level in levels.into_values() {
            let finished: Vec<(usize, Result<()>)> = stream::iter(level)
                .map(|index| async move { (index, transferer.finish_directory(&actions[index]).await) })
                .buffer_unordered(self.options.max_concurrency.max(1))
                .collect()
                .await;

            for (index, result) in finished {
                if let Err(e) = result {
                    let action = &actions[index];
                    warn!(path = %action.relative_path, error = %e, "failed to apply directory attributes");
                    results[index] = Some(TransferResult::failed(action.relative_path.clone(), action.verb, e.reason()));
                }
            }
        }
    }
}

/// A file cannot be mirrored onto a directory or the other way around
fn check_root_kinds(direction: Direction, local: Option<EntryKind>, remote: Option<EntryKind>) -> Result<()> {
    let (Some(local), Some(remote)) = (local, remote) else {
        return Ok(());
    };
    if local == remote {
        return Ok(());
    }

    let (source, destination) = match direction {
        Direction::Upload => (local, remote),
        Direction::Download => (remote, local),
    };
    Err(SyncError::planning_error(
        RelPath::root(),
        format!(
            "source is a {} but destination is a {}",
            kind_name(source),
            kind_name(destination)
        ),
    ))
}

fn kind_name(kind: EntryKind) -> &'static str {
    match kind {
        EntryKind::File => "file",
        EntryKind::Directory => "directory",
    }
}

async fn run_action(transferer: &Transferer, action: &Action) -> (TransferResult, Vec<MetadataWarning>) {
    let path = action.relative_path.clone();
    match transferer.execute(action).await {
        Ok(TransferOutcome::Done { bytes, warnings }) => {
            debug!(path = %path, verb = ?action.verb, bytes, "action completed");
            (TransferResult::success(path, action.verb, bytes), warnings)
        }
        Ok(TransferOutcome::NotApplicable) => (TransferResult::skipped(path, action.verb), Vec::new()),
        Err(e) => {
            warn!(path = %path, verb = ?action.verb, error = %e, "action failed");
            (TransferResult::failed(path, action.verb, e.reason()), Vec::new())
        }
    }
}

/// Group pending actions into ordered stages of mutually independent actions
fn stages(actions: &[Action]) -> Vec<Vec<usize>> {
    let mut file_deletes = Vec::new();
    let mut directory_deletes: BTreeMap<Reverse<usize>, Vec<usize>> = BTreeMap::new();
    let mut directory_creates: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    let mut file_writes = Vec::new();

    for (index, action) in actions.iter().enumerate() {
        let depth = action.relative_path.depth();
        match (action.verb, action.kind) {
            (Verb::Skip, _) => {}
            (Verb::Delete, EntryKind::File) => file_deletes.push(index),
            (Verb::Delete, EntryKind::Directory) => directory_deletes.entry(Reverse(depth)).or_default().push(index),
            (Verb::Create | Verb::Update, EntryKind::Directory) => {
                directory_creates.entry(depth).or_default().push(index)
            }
            (Verb::Create | Verb::Update, EntryKind::File) => file_writes.push(index),
        }
    }

    std::iter::once(file_deletes)
        .chain(directory_deletes.into_values())
        .chain(directory_creates.into_values())
        .chain(std::iter::once(file_writes))
        .filter(|stage| !stage.is_empty())
        .collect()
}

/// Failures that rule out later actions
#[derive(Default)]
struct Blocked {
    directory_creates: Vec<RelPath>,
    deletes: Vec<RelPath>,
}

impl Blocked {
    fn record_failure(&mut self, action: &Action) {
        match (action.verb, action.kind) {
            (Verb::Delete, _) => self.deletes.push(action.relative_path.clone()),
            (Verb::Create | Verb::Update, EntryKind::Directory) => {
                self.directory_creates.push(action.relative_path.clone())
            }
            _ => {}
        }
    }

    fn reason(&self, action: &Action) -> Option<&'static str> {
        let path = &action.relative_path;
        match action.verb {
            Verb::Create | Verb::Update => {
                if self.directory_creates.iter().any(|dir| path.is_descendant_of(dir)) {
                    Some("parent directory could not be created")
                } else if self.deletes.iter().any(|deleted| deleted == path) {
                    Some("existing entry could not be removed")
                } else {
                    None
                }
            }
            Verb::Delete if action.kind == EntryKind::Directory => self
                .deletes
                .iter()
                .any(|deleted| deleted.is_descendant_of(path))
                .then_some("entries below could not be deleted"),
            _ => None,
        }
    }
}

/// The local and remote side of a run
struct Endpoints {
    direction: Direction,
    local_root: PathBuf,
    prefix: String,
    remote_label: String,
}

impl Endpoints {
    fn resolve(source: &Location, destination: &Location) -> Result<Self> {
        let direction = Direction::between(source, destination)?;
        let (local, remote) = match direction {
            Direction::Upload => (source, destination),
            Direction::Download => (destination, source),
        };

        match (local, remote) {
            (Location::Local(path), Location::Remote { prefix, .. }) => Ok(Self {
                direction,
                local_root: path.clone(),
                prefix: prefix.clone(),
                remote_label: remote.to_string(),
            }),
            _ => Err(SyncError::config_error("one location must be local and the other remote")),
        }
    }
}

fn join_error(error: tokio::task::JoinError) -> SyncError {
    SyncError::Io(std::io::Error::new(std::io::ErrorKind::Other, error))
}
