//! Durable local queue of deferred submissions.
//!
//! `QueueStore` is the seam producers and the reconciler share. Writes that
//! capture a field observation (`append`) fail loudly; everything else
//! degrades to an empty or no-op result so that a damaged store never blocks
//! the rest of the application.

use crate::db::{self, Pool};
use crate::model::{QueueEntry, RecordKind};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Persist a new unsynced entry under a caller-chosen id.
    async fn append_with_id(
        &self,
        id: Uuid,
        endpoint: RecordKind,
        payload: &Value,
    ) -> Result<QueueEntry>;

    /// Persist a new unsynced entry; returns only once it is durable.
    async fn append(&self, endpoint: RecordKind, payload: &Value) -> Result<QueueEntry> {
        self.append_with_id(Uuid::new_v4(), endpoint, payload).await
    }

    /// Unsynced entries, oldest first.
    async fn list_pending(&self) -> Vec<QueueEntry>;

    /// Every stored entry, synced or not, oldest first.
    async fn list_all(&self) -> Vec<QueueEntry>;

    /// Idempotent: unknown or already-synced ids are ignored.
    async fn mark_synced(&self, id: Uuid);

    async fn record_failure(&self, id: Uuid, error: &str);

    /// Pending entry count, for display only.
    async fn count(&self) -> u64;

    /// Remove entries synced at or before `cutoff`. Returns how many went.
    async fn purge_synced(&self, cutoff: DateTime<Utc>) -> u64;

    async fn last_synced_at(&self) -> Option<DateTime<Utc>>;

    async fn set_last_synced_at(&self, at: DateTime<Utc>);
}

/// Queue persisted in the SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteQueue {
    pool: Pool,
}

impl SqliteQueue {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) and migrate the database at `database_url`.
    pub async fn open(database_url: &str) -> Result<Self> {
        let pool = db::init_pool(database_url).await?;
        db::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl QueueStore for SqliteQueue {
    #[instrument(skip_all, fields(%id, kind = %endpoint))]
    async fn append_with_id(
        &self,
        id: Uuid,
        endpoint: RecordKind,
        payload: &Value,
    ) -> Result<QueueEntry> {
        let entry = db::insert_entry(&self.pool, id, endpoint, payload, Utc::now()).await?;
        info!(seq = entry.seq, "queued entry");
        Ok(entry)
    }

    async fn list_pending(&self) -> Vec<QueueEntry> {
        match db::fetch_pending(&self.pool).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(?err, "failed to read pending entries; treating queue as empty");
                Vec::new()
            }
        }
    }

    async fn list_all(&self) -> Vec<QueueEntry> {
        match db::fetch_all(&self.pool).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(?err, "failed to read queue entries");
                Vec::new()
            }
        }
    }

    async fn mark_synced(&self, id: Uuid) {
        match db::mark_entry_synced(&self.pool, id, Utc::now()).await {
            Ok(true) => debug!(%id, "entry marked synced"),
            Ok(false) => debug!(%id, "entry already synced or unknown"),
            Err(err) => warn!(?err, %id, "failed to mark entry synced"),
        }
    }

    async fn record_failure(&self, id: Uuid, error: &str) {
        if let Err(err) = db::record_entry_failure(&self.pool, id, error).await {
            warn!(?err, %id, "failed to record entry failure");
        }
    }

    /// Counts what `list_pending` would replay, so damaged rows are left out.
    async fn count(&self) -> u64 {
        let readable = match db::fetch_pending(&self.pool).await {
            Ok(entries) => entries.len() as u64,
            Err(err) => {
                warn!(?err, "failed to count pending entries");
                return 0;
            }
        };
        if let Ok(stored) = db::count_pending(&self.pool).await {
            let stored = stored.max(0) as u64;
            if stored > readable {
                warn!(stored, readable, "unreadable pending entries excluded from count");
            }
        }
        readable
    }

    async fn purge_synced(&self, cutoff: DateTime<Utc>) -> u64 {
        match db::purge_synced_before(&self.pool, cutoff).await {
            Ok(n) => n,
            Err(err) => {
                warn!(?err, "failed to purge synced entries");
                0
            }
        }
    }

    async fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        db::get_last_synced_at(&self.pool)
            .await
            .unwrap_or_else(|err| {
                warn!(?err, "failed to read last sync time");
                None
            })
    }

    async fn set_last_synced_at(&self, at: DateTime<Utc>) {
        if let Err(err) = db::set_last_synced_at(&self.pool, at).await {
            warn!(?err, "failed to persist last sync time");
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: Vec<QueueEntry>,
    next_seq: i64,
    last_synced_at: Option<DateTime<Utc>>,
}

/// Process-local queue for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryQueue {
    async fn append_with_id(
        &self,
        id: Uuid,
        endpoint: RecordKind,
        payload: &Value,
    ) -> Result<QueueEntry> {
        let mut state = self.state.lock().await;
        if state.entries.iter().any(|e| e.id == id) {
            anyhow::bail!("entry {id} already exists");
        }
        state.next_seq += 1;
        let entry = QueueEntry {
            id,
            seq: state.next_seq,
            endpoint,
            payload: payload.clone(),
            enqueued_at: Utc::now(),
            synced: false,
            synced_at: None,
            attempts: 0,
            last_error: None,
        };
        state.entries.push(entry.clone());
        Ok(entry)
    }

    async fn list_pending(&self) -> Vec<QueueEntry> {
        let state = self.state.lock().await;
        state.entries.iter().filter(|e| !e.synced).cloned().collect()
    }

    async fn list_all(&self) -> Vec<QueueEntry> {
        self.state.lock().await.entries.clone()
    }

    async fn mark_synced(&self, id: Uuid) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.iter_mut().find(|e| e.id == id && !e.synced) {
            entry.synced = true;
            entry.synced_at = Some(Utc::now());
            entry.last_error = None;
        }
    }

    async fn record_failure(&self, id: Uuid, error: &str) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.iter_mut().find(|e| e.id == id && !e.synced) {
            entry.attempts += 1;
            entry.last_error = Some(error.to_string());
        }
    }

    async fn count(&self) -> u64 {
        let state = self.state.lock().await;
        state.entries.iter().filter(|e| !e.synced).count() as u64
    }

    async fn purge_synced(&self, cutoff: DateTime<Utc>) -> u64 {
        let mut state = self.state.lock().await;
        let before = state.entries.len();
        state
            .entries
            .retain(|e| !(e.synced && e.synced_at.is_some_and(|at| at <= cutoff)));
        (before - state.entries.len()) as u64
    }

    async fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.last_synced_at
    }

    async fn set_last_synced_at(&self, at: DateTime<Utc>) {
        self.state.lock().await.last_synced_at = Some(at);
    }
}
