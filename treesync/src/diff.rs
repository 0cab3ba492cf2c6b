//! Diff algorithm for generating sync plans and actions
//!
//! Both sides arrive as sequences of entries sorted by [`RelPath`]. The
//! engine merge-joins them in a single pass, holding at most one pending
//! entry per side, and decides an action for every path seen on either side.

use std::cmp::Ordering;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::config::{Direction, SyncOptions};
use crate::entry::{Entry, EntryKind, RelPath};
use crate::error::{Result, SyncError};

/// What happens to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    Create,
    Update,
    Delete,
    Skip,
}

/// Why a path is left alone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Same size and the source is not newer
    Unchanged,
    /// Directory present on both sides
    DirectoryExists,
    /// Destination-only entry while deletion is disabled
    DeletionDisabled,
    /// File on one side, directory on the other (or below such a path),
    /// while deletion is disabled
    KindMismatch,
}

/// A single planned operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub relative_path: RelPath,
    pub verb: Verb,
    pub direction: Direction,
    pub kind: EntryKind,
    /// Source entry for creates and updates, destination entry otherwise
    pub entry: Entry,
    pub skip_reason: Option<SkipReason>,
}

impl Action {
    fn new(verb: Verb, direction: Direction, entry: Entry, skip_reason: Option<SkipReason>) -> Self {
        Self {
            relative_path: entry.relative_path.clone(),
            verb,
            direction,
            kind: entry.kind,
            entry,
            skip_reason,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Whether carrying out this action moves file content
    pub fn transfers_content(&self) -> bool {
        matches!(self.verb, Verb::Create | Verb::Update) && self.kind == EntryKind::File
    }
}

/// A complete sync plan with all actions to be performed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPlan {
    pub direction: Direction,
    /// Actions in path order
    pub actions: Vec<Action>,
    pub summary: PlanSummary,
}

impl SyncPlan {
    /// Actions that change the destination
    pub fn pending(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter().filter(|a| a.verb != Verb::Skip)
    }
}

/// Summary of a sync plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    pub skips: usize,
    pub bytes_to_transfer: u64,
}

impl PlanSummary {
    pub fn total_actions(&self) -> usize {
        self.creates + self.updates + self.deletes + self.skips
    }

    fn record(&mut self, action: &Action) {
        match action.verb {
            Verb::Create => self.creates += 1,
            Verb::Update => self.updates += 1,
            Verb::Delete => self.deletes += 1,
            Verb::Skip => self.skips += 1,
        }
        if action.transfers_content() {
            self.bytes_to_transfer += action.entry.size;
        }
    }
}

/// The subset of [`SyncOptions`] that drives planning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffOptions {
    pub delete: bool,
    pub overwrite: bool,
    pub mtime_granularity: Duration,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self::from(&SyncOptions::default())
    }
}

impl From<&SyncOptions> for DiffOptions {
    fn from(options: &SyncOptions) -> Self {
        Self {
            delete: options.delete,
            overwrite: options.overwrite,
            mtime_granularity: options.mtime_granularity,
        }
    }
}

/// Whether a file present on both sides must be transferred again
///
/// Only sizes and modification times are compared. The source mtime is
/// truncated to `granularity` first, so a destination that stores coarser
/// timestamps does not look stale.
pub fn needs_update(source: &Entry, destination: &Entry, overwrite: bool, granularity: Duration) -> bool {
    overwrite || source.size != destination.size || truncate(source.mtime, granularity) > destination.mtime
}

fn truncate(time: SystemTime, granularity: Duration) -> SystemTime {
    let step = granularity.as_nanos();
    if step == 0 {
        return time;
    }
    let Ok(since_epoch) = time.duration_since(SystemTime::UNIX_EPOCH) else {
        return time;
    };
    let nanos = since_epoch.as_nanos();
    match u64::try_from(nanos - nanos % step) {
        Ok(truncated) => SystemTime::UNIX_EPOCH + Duration::from_nanos(truncated),
        Err(_) => time,
    }
}

/// Diff engine for comparing source and destination trees
#[derive(Debug, Clone)]
pub struct DiffEngine {
    options: DiffOptions,
    direction: Direction,
}

impl DiffEngine {
    pub fn new(options: DiffOptions, direction: Direction) -> Self {
        Self { options, direction }
    }

    /// Merge-join two sorted entry sequences into a plan
    ///
    /// Fails on the first enumeration error from either side and on input
    /// that is out of order or repeats a path.
    pub fn plan<S, D>(&self, source: S, destination: D) -> Result<SyncPlan>
    where
        S: IntoIterator<Item = Result<Entry>>,
        D: IntoIterator<Item = Result<Entry>>,
    {
        let mut source = Ordered::new(source.into_iter(), "source");
        let mut destination = Ordered::new(destination.into_iter(), "destination");
        let mut planner = Planner {
            options: self.options,
            direction: self.direction,
            actions: Vec::new(),
            blocked: None,
        };

        loop {
            let ordering = match (source.peek()?, destination.peek()?) {
                (None, None) => break,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(s), Some(d)) => s.relative_path.cmp(&d.relative_path),
            };

            match ordering {
                Ordering::Less => planner.source_only(source.take()),
                Ordering::Greater => planner.destination_only(destination.take()),
                Ordering::Equal => planner.both(source.take(), destination.take()),
            }
        }

        let mut summary = PlanSummary::default();
        for action in &planner.actions {
            summary.record(action);
        }

        Ok(SyncPlan {
            direction: self.direction,
            actions: planner.actions,
            summary,
        })
    }
}

struct Planner {
    options: DiffOptions,
    direction: Direction,
    actions: Vec<Action>,
    /// Source directory that could not replace a destination file
    blocked: Option<RelPath>,
}

impl Planner {
    fn push(&mut self, verb: Verb, entry: Entry, skip_reason: Option<SkipReason>) {
        self.actions.push(Action::new(verb, self.direction, entry, skip_reason));
    }

    fn is_blocked(&self, path: &RelPath) -> bool {
        self.blocked.as_ref().is_some_and(|b| path.is_descendant_of(b))
    }

    fn source_only(&mut self, entry: Option<Entry>) {
        let Some(entry) = entry else { return };
        if self.is_blocked(&entry.relative_path) {
            self.push(Verb::Skip, entry, Some(SkipReason::KindMismatch));
        } else {
            self.push(Verb::Create, entry, None);
        }
    }

    fn destination_only(&mut self, entry: Option<Entry>) {
        let Some(entry) = entry else { return };
        if self.options.delete {
            self.push(Verb::Delete, entry, None);
        } else {
            self.push(Verb::Skip, entry, Some(SkipReason::DeletionDisabled));
        }
    }

    fn both(&mut self, source: Option<Entry>, destination: Option<Entry>) {
        let (Some(source), Some(destination)) = (source, destination) else {
            return;
        };

        if self.is_blocked(&source.relative_path) {
            self.push(Verb::Skip, destination, Some(SkipReason::KindMismatch));
            return;
        }

        match (source.kind, destination.kind) {
            (EntryKind::Directory, EntryKind::Directory) => {
                self.push(Verb::Skip, destination, Some(SkipReason::DirectoryExists));
            }
            (EntryKind::File, EntryKind::File) => {
                let DiffOptions {
                    overwrite,
                    mtime_granularity,
                    ..
                } = self.options;
                if needs_update(&source, &destination, overwrite, mtime_granularity) {
                    self.push(Verb::Update, source, None);
                } else {
                    self.push(Verb::Skip, destination, Some(SkipReason::Unchanged));
                }
            }
            _ if self.options.delete => {
                self.push(Verb::Delete, destination, None);
                self.push(Verb::Create, source, None);
            }
            _ => {
                if source.is_dir() {
                    self.blocked = Some(source.relative_path.clone());
                }
                self.push(Verb::Skip, destination, Some(SkipReason::KindMismatch));
            }
        }
    }
}

/// One input side, checked for strictly increasing paths
struct Ordered<I> {
    inner: I,
    side: &'static str,
    last: Option<RelPath>,
    peeked: Option<Entry>,
}

impl<I: Iterator<Item = Result<Entry>>> Ordered<I> {
    fn new(inner: I, side: &'static str) -> Self {
        Self {
            inner,
            side,
            last: None,
            peeked: None,
        }
    }

    fn peek(&mut self) -> Result<Option<&Entry>> {
        if self.peeked.is_none() {
            if let Some(next) = self.inner.next() {
                let entry = next?;
                if let Some(last) = &self.last {
                    if entry.relative_path <= *last {
                        return Err(SyncError::planning_error(
                            &entry.relative_path,
                            format!("{} entries are out of order or repeat a path", self.side),
                        ));
                    }
                }
                self.last = Some(entry.relative_path.clone());
                self.peeked = Some(entry);
            }
        }
        Ok(self.peeked.as_ref())
    }

    fn take(&mut self) -> Option<Entry> {
        self.peeked.take()
    }
}
