use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Logical remote operation a queued payload belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Feed,
    Health,
    Weight,
    Egg,
    Mortality,
}

impl RecordKind {
    pub const ALL: [RecordKind; 5] = [
        RecordKind::Feed,
        RecordKind::Health,
        RecordKind::Weight,
        RecordKind::Egg,
        RecordKind::Mortality,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Feed => "feed",
            RecordKind::Health => "health",
            RecordKind::Weight => "weight",
            RecordKind::Egg => "egg",
            RecordKind::Mortality => "mortality",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "feed" => Some(RecordKind::Feed),
            "health" => Some(RecordKind::Health),
            "weight" => Some(RecordKind::Weight),
            "egg" | "eggs" => Some(RecordKind::Egg),
            "mortality" => Some(RecordKind::Mortality),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordKind::parse_kind(s).ok_or_else(|| format!("unknown record kind '{s}'"))
    }
}

/// A submission deferred to the durable queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    /// Device-local unique id; also sent as the idempotency key.
    pub id: Uuid,
    /// Insertion order.
    pub seq: i64,
    pub endpoint: RecordKind,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    pub synced: bool,
    pub synced_at: Option<DateTime<Utc>>,
    pub attempts: i64,
    pub last_error: Option<String>,
}

/// Result of handing a record to the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The remote API confirmed the record.
    Submitted { id: Uuid },
    /// The record was persisted locally for a later sync pass.
    Queued(QueueEntry),
}

impl SubmitOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, SubmitOutcome::Queued(_))
    }

    pub fn id(&self) -> Uuid {
        match self {
            SubmitOutcome::Submitted { id } => *id,
            SubmitOutcome::Queued(entry) => entry.id,
        }
    }
}

/// Counts gathered over one or more reconcile passes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ReconcileSummary {
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            attempted: 0,
            succeeded: 0,
            failed: 0,
            started_at: at,
            finished_at: at,
        }
    }

    /// Fold a later pass into this one.
    pub fn absorb(&mut self, later: &ReconcileSummary) {
        self.attempted += later.attempted;
        self.succeeded += later.succeeded;
        self.failed += later.failed;
        self.finished_at = later.finished_at;
    }
}

impl fmt::Display for ReconcileSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "synced {} of {} items", self.succeeded, self.attempted)
    }
}

/// Snapshot consumed by the presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncStatus {
    pub is_online: bool,
    pub pending_count: u64,
    pub is_syncing: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_pass: Option<ReconcileSummary>,
}
