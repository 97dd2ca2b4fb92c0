//! Raw queue rows as read from SQLite.
//!
//! Every column is kept in its stored text form so that one damaged row can
//! be rejected on its own instead of failing the whole query.

use crate::model::{QueueEntry, RecordKind};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct QueueRow {
    pub seq: i64,
    pub id: String,
    pub endpoint: String,
    pub payload: String,
    pub enqueued_at: String,
    pub synced: bool,
    pub synced_at: Option<String>,
    pub attempts: i64,
    pub last_error: Option<String>,
}

impl QueueRow {
    pub fn into_entry(self) -> Result<QueueEntry> {
        let id = Uuid::parse_str(&self.id).with_context(|| format!("bad id '{}'", self.id))?;
        let endpoint = RecordKind::parse_kind(&self.endpoint)
            .ok_or_else(|| anyhow!("unknown endpoint '{}'", self.endpoint))?;
        let payload =
            serde_json::from_str(&self.payload).context("payload is not valid JSON")?;
        let enqueued_at = parse_ts(&self.enqueued_at)?;
        let synced_at = self.synced_at.as_deref().map(parse_ts).transpose()?;
        Ok(QueueEntry {
            id,
            seq: self.seq,
            endpoint,
            payload,
            enqueued_at,
            synced: self.synced,
            synced_at,
            attempts: self.attempts,
            last_error: self.last_error,
        })
    }
}

/// Fixed-width UTC text so stored timestamps compare lexicographically.
pub fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("bad timestamp '{s}'"))
}
