use super::model::{format_ts, parse_ts, QueueRow};
use crate::model::{QueueEntry, RecordKind};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{instrument, warn};
use uuid::Uuid;

pub type Pool = SqlitePool;

const ENTRY_COLUMNS: &str =
    "seq, id, endpoint, payload, enqueued_at, synced, synced_at, attempts, last_error";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let in_memory = normalized.starts_with("sqlite::memory");
    // WAL plus synchronous=FULL: a committed append survives power loss.
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url '{normalized}'"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);

    let mut pool_options = SqlitePoolOptions::new();
    if in_memory {
        // Each in-memory connection is its own database.
        pool_options = pool_options
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    } else {
        pool_options = pool_options.max_connections(4);
    }
    let pool = pool_options.connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn insert_entry(
    pool: &Pool,
    id: Uuid,
    endpoint: RecordKind,
    payload: &Value,
    enqueued_at: DateTime<Utc>,
) -> Result<QueueEntry> {
    let payload_text = serde_json::to_string(payload).context("payload is not serializable")?;
    let rec = sqlx::query(
        "INSERT INTO queue_entries (id, endpoint, payload, enqueued_at, synced, attempts) VALUES (?, ?, ?, ?, 0, 0) RETURNING seq",
    )
    .bind(id.to_string())
    .bind(endpoint.as_str())
    .bind(&payload_text)
    .bind(format_ts(enqueued_at))
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to persist {endpoint} entry {id}"))?;

    // Round-trip through the stored text so the caller sees what a reader will.
    Ok(QueueEntry {
        id,
        seq: rec.get("seq"),
        endpoint,
        payload: payload.clone(),
        enqueued_at: parse_ts(&format_ts(enqueued_at))?,
        synced: false,
        synced_at: None,
        attempts: 0,
        last_error: None,
    })
}

#[instrument(skip_all)]
pub async fn fetch_pending(pool: &Pool) -> Result<Vec<QueueEntry>> {
    let rows = sqlx::query(&format!(
        "SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE synced = 0 ORDER BY seq ASC"
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows_to_entries(rows))
}

#[instrument(skip_all)]
pub async fn fetch_all(pool: &Pool) -> Result<Vec<QueueEntry>> {
    let rows = sqlx::query(&format!(
        "SELECT {ENTRY_COLUMNS} FROM queue_entries ORDER BY seq ASC"
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows_to_entries(rows))
}

/// Returns true only when this call flipped the entry to synced.
#[instrument(skip_all)]
pub async fn mark_entry_synced(pool: &Pool, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE queue_entries SET synced = 1, synced_at = ?, last_error = NULL WHERE id = ? AND synced = 0",
    )
    .bind(format_ts(at))
    .bind(id.to_string())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn record_entry_failure(pool: &Pool, id: Uuid, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE queue_entries SET attempts = attempts + 1, last_error = ? WHERE id = ? AND synced = 0",
    )
    .bind(error)
    .bind(id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_pending(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_entries WHERE synced = 0")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Delete synced entries whose `synced_at` is at or before `cutoff`.
#[instrument(skip_all)]
pub async fn purge_synced_before(pool: &Pool, cutoff: DateTime<Utc>) -> Result<u64> {
    let res = sqlx::query(
        "DELETE FROM queue_entries WHERE synced = 1 AND synced_at IS NOT NULL AND synced_at <= ?",
    )
    .bind(format_ts(cutoff))
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn get_last_synced_at(pool: &Pool) -> Result<Option<DateTime<Utc>>> {
    let raw = sqlx::query_scalar::<_, Option<String>>(
        "SELECT last_synced_at FROM sync_state WHERE id = 1",
    )
    .fetch_optional(pool)
    .await?
    .flatten();
    raw.as_deref().map(parse_ts).transpose()
}

#[instrument(skip_all)]
pub async fn set_last_synced_at(pool: &Pool, at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        "INSERT INTO sync_state (id, last_synced_at) VALUES (1, ?) ON CONFLICT(id) DO UPDATE SET last_synced_at = excluded.last_synced_at",
    )
    .bind(format_ts(at))
    .execute(pool)
    .await?;
    Ok(())
}

fn read_row(row: &SqliteRow) -> Result<QueueRow> {
    Ok(QueueRow {
        seq: row.try_get("seq")?,
        id: row.try_get("id")?,
        endpoint: row.try_get("endpoint")?,
        payload: row.try_get("payload")?,
        enqueued_at: row.try_get("enqueued_at")?,
        synced: row.try_get::<i64, _>("synced")? != 0,
        synced_at: row.try_get("synced_at")?,
        attempts: row.try_get("attempts")?,
        last_error: row.try_get("last_error")?,
    })
}

/// Damaged rows are logged and skipped; the rest of the queue stays usable.
fn rows_to_entries(rows: Vec<SqliteRow>) -> Vec<QueueEntry> {
    rows.iter()
        .filter_map(|row| match read_row(row).and_then(QueueRow::into_entry) {
            Ok(entry) => Some(entry),
            Err(err) => {
                let seq = row.try_get::<i64, _>("seq").unwrap_or_default();
                warn!(?err, seq, "skipping unreadable queue entry");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup_pool() -> Pool {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    #[test]
    fn prepare_url_leaves_memory_alone() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://localhost/db"),
            "postgres://localhost/db"
        );
    }

    #[test]
    fn prepare_url_normalizes_and_creates_parent() {
        let td = tempfile::tempdir().unwrap();
        let file = td.path().join("nested").join("queue.db");
        let url = format!("sqlite:{}?mode=rwc", file.display());
        let normalized = prepare_sqlite_url(&url);
        assert_eq!(normalized, format!("sqlite://{}?mode=rwc", file.display()));
        assert!(td.path().join("nested").exists());
    }

    #[tokio::test]
    async fn insert_mark_count_purge() {
        let pool = setup_pool().await;
        let t0 = Utc::now();
        let a = insert_entry(&pool, Uuid::new_v4(), RecordKind::Feed, &json!({"kg": 25}), t0)
            .await
            .unwrap();
        let b = insert_entry(&pool, Uuid::new_v4(), RecordKind::Egg, &json!({"count": 12}), t0)
            .await
            .unwrap();
        assert!(a.seq < b.seq);
        assert_eq!(count_pending(&pool).await.unwrap(), 2);

        assert!(mark_entry_synced(&pool, a.id, t0).await.unwrap());
        assert!(!mark_entry_synced(&pool, a.id, t0).await.unwrap());
        assert!(!mark_entry_synced(&pool, Uuid::new_v4(), t0).await.unwrap());
        assert_eq!(count_pending(&pool).await.unwrap(), 1);

        let pending = fetch_pending(&pool).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b.id);

        // Cutoff before the sync time keeps the row.
        let purged = purge_synced_before(&pool, t0 - chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 0);
        let purged = purge_synced_before(&pool, t0).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(fetch_all(&pool).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failures_are_counted_until_synced() {
        let pool = setup_pool().await;
        let payload = json!({"temp": 38.5});
        let e = insert_entry(&pool, Uuid::new_v4(), RecordKind::Health, &payload, Utc::now())
            .await
            .unwrap();
        record_entry_failure(&pool, e.id, "timeout").await.unwrap();
        record_entry_failure(&pool, e.id, "503").await.unwrap();
        let pending = fetch_pending(&pool).await.unwrap();
        assert_eq!(pending[0].attempts, 2);
        assert_eq!(pending[0].last_error.as_deref(), Some("503"));

        mark_entry_synced(&pool, e.id, Utc::now()).await.unwrap();
        record_entry_failure(&pool, e.id, "late").await.unwrap();
        let all = fetch_all(&pool).await.unwrap();
        assert!(all[0].synced);
        assert_eq!(all[0].attempts, 2);
        assert!(all[0].last_error.is_none());
    }

    #[tokio::test]
    async fn damaged_rows_are_skipped() {
        let pool = setup_pool().await;
        let payload = json!({"kg": 410});
        let good = insert_entry(&pool, Uuid::new_v4(), RecordKind::Weight, &payload, Utc::now())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO queue_entries (id, endpoint, payload, enqueued_at) VALUES ('x', 'feed', '{oops', 'never')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let pending = fetch_pending(&pool).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, good.id);
    }

    #[tokio::test]
    async fn last_synced_at_roundtrips() {
        let pool = setup_pool().await;
        assert!(get_last_synced_at(&pool).await.unwrap().is_none());
        let at = parse_ts("2026-10-16T08:30:00.250Z").unwrap();
        set_last_synced_at(&pool, at).await.unwrap();
        assert_eq!(get_last_synced_at(&pool).await.unwrap(), Some(at));
    }
}
