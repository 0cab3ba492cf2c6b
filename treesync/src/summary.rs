//! Run results and statistics

use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::config::Direction;
use crate::diff::Verb;
use crate::entry::RelPath;
use crate::metadata::MetadataWarning;

/// How a single action ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum Outcome {
    Success,
    Failed(String),
    Skipped,
}

/// Result of one planned action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub relative_path: RelPath,
    pub verb: Verb,
    pub outcome: Outcome,
    /// Content bytes moved
    pub bytes: u64,
}

impl TransferResult {
    pub fn success(relative_path: RelPath, verb: Verb, bytes: u64) -> Self {
        Self {
            relative_path,
            verb,
            outcome: Outcome::Success,
            bytes,
        }
    }

    pub fn failed(relative_path: RelPath, verb: Verb, reason: impl Into<String>) -> Self {
        Self {
            relative_path,
            verb,
            outcome: Outcome::Failed(reason.into()),
            bytes: 0,
        }
    }

    pub fn skipped(relative_path: RelPath, verb: Verb) -> Self {
        Self {
            relative_path,
            verb,
            outcome: Outcome::Skipped,
            bytes: 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, Outcome::Failed(_))
    }
}

/// Counters derived from a run's results
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub bytes_transferred: u64,
}

/// Everything that happened during one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Unique session identifier
    pub session_id: Uuid,
    pub direction: Direction,
    pub started_at: SystemTime,
    pub duration: Duration,
    /// One result per planned action, in plan order
    pub results: Vec<TransferResult>,
    pub warnings: Vec<MetadataWarning>,
    /// Dispatch stopped early on request
    pub cancelled: bool,
    pub dry_run: bool,
    #[serde(skip)]
    clock: Option<Instant>,
}

impl RunSummary {
    pub fn new(direction: Direction, dry_run: bool) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            direction,
            started_at: SystemTime::now(),
            duration: Duration::default(),
            results: Vec::new(),
            warnings: Vec::new(),
            cancelled: false,
            dry_run,
            clock: Some(Instant::now()),
        }
    }

    /// Mark the run as completed and log its statistics
    pub fn complete(&mut self) {
        self.duration = self.clock.map(|c| c.elapsed()).unwrap_or_default();

        let stats = self.stats();
        info!(
            session_id = %self.session_id,
            direction = %self.direction,
            duration_secs = self.duration.as_secs_f64(),
            created = stats.created,
            updated = stats.updated,
            deleted = stats.deleted,
            skipped = stats.skipped,
            failed = stats.failed,
            bytes_transferred = stats.bytes_transferred,
            warnings = self.warnings.len(),
            cancelled = self.cancelled,
            dry_run = self.dry_run,
            "Sync run completed"
        );
    }

    pub fn stats(&self) -> RunStats {
        let mut stats = RunStats::default();
        for result in &self.results {
            match (&result.outcome, result.verb) {
                (Outcome::Failed(_), _) => stats.failed += 1,
                (Outcome::Skipped, _) | (_, Verb::Skip) => stats.skipped += 1,
                (Outcome::Success, Verb::Create) => stats.created += 1,
                (Outcome::Success, Verb::Update) => stats.updated += 1,
                (Outcome::Success, Verb::Delete) => stats.deleted += 1,
            }
            stats.bytes_transferred += result.bytes;
        }
        stats
    }

    pub fn failures(&self) -> impl Iterator<Item = &TransferResult> {
        self.results.iter().filter(|r| r.is_failed())
    }

    /// True iff no action failed; warnings and cancellation do not count
    pub fn is_successful(&self) -> bool {
        self.failures().next().is_none()
    }

    /// Process exit status for this run
    pub fn exit_code(&self) -> i32 {
        if self.is_successful() {
            0
        } else {
            1
        }
    }

    /// One-line human readable summary
    pub fn summary(&self) -> String {
        let stats = self.stats();
        let mut line = format!(
            "{}: {} created, {} updated, {} deleted, {} skipped, {} failed, {} bytes in {:.2}s",
            self.direction,
            stats.created,
            stats.updated,
            stats.deleted,
            stats.skipped,
            stats.failed,
            stats.bytes_transferred,
            self.duration.as_secs_f64()
        );
        if self.dry_run {
            line.push_str(" (dry run)");
        }
        if self.cancelled {
            line.push_str(" (cancelled)");
        }
        line
    }
}
