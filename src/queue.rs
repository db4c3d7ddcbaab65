//! Generic operation queue.
//!
//! Reserved for offline operations that are neither sales nor invoices
//! (settings pushes, acknowledgements and similar). Same lifecycle shape as
//! the invoice queue (`pending` → `syncing` → gone, or `failed` after the
//! retry cap) but this queue is an outbox: a synced row is deleted rather
//! than kept. Not drained by the orchestrator; callers drive it directly.

use rusqlite::params;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::db::Store;
use crate::error::{SyncError, SyncResult};
use crate::invoices::MAX_RETRIES;

#[derive(Debug, Clone, Serialize)]
pub struct SyncQueueItem {
    pub id: i64,
    pub action: String,
    pub payload: Value,
    pub status: String,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Durably record an operation for later replay. Pure local write.
pub fn enqueue_operation(store: &Store, action: &str, payload: &Value) -> SyncResult<i64> {
    if action.trim().is_empty() {
        return Err(SyncError::InvalidInput("Action is required".into()));
    }
    let now = chrono::Utc::now().to_rfc3339();
    let conn = store.conn()?;
    conn.execute(
        "INSERT INTO sync_queue (action, payload, status, retry_count, created_at, updated_at)
         VALUES (?1, ?2, 'pending', 0, ?3, ?3)",
        params![action, payload.to_string(), now],
    )?;
    let id = conn.last_insert_rowid();
    info!(id, action, "operation queued");
    Ok(id)
}

/// Replay candidates: pending items under the retry cap, oldest first.
pub fn pending_operations(store: &Store) -> SyncResult<Vec<SyncQueueItem>> {
    let raw = {
        let conn = store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, action, payload, status, retry_count, last_error, created_at, updated_at
             FROM sync_queue
             WHERE status = 'pending' AND retry_count < ?1
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map([MAX_RETRIES], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    raw.into_iter()
        .map(
            |(id, action, payload, status, retry_count, last_error, created_at, updated_at)| {
                Ok(SyncQueueItem {
                    id,
                    action,
                    payload: serde_json::from_str(&payload)?,
                    status,
                    retry_count,
                    last_error,
                    created_at,
                    updated_at,
                })
            },
        )
        .collect()
}

/// Move a pending item to `syncing` before attempting it.
pub fn mark_syncing(store: &Store, id: i64) -> SyncResult<()> {
    let conn = store.conn()?;
    let changed = conn.execute(
        "UPDATE sync_queue
         SET status = 'syncing', updated_at = ?1
         WHERE id = ?2 AND status = 'pending'",
        params![chrono::Utc::now().to_rfc3339(), id],
    )?;
    if changed == 0 {
        return Err(SyncError::InvalidInput(format!(
            "Queue item {id} is not pending"
        )));
    }
    Ok(())
}

/// The operation was accepted remotely; the outbox row is removed.
pub fn mark_synced(store: &Store, id: i64) -> SyncResult<()> {
    let conn = store.conn()?;
    conn.execute("DELETE FROM sync_queue WHERE id = ?1", [id])?;
    Ok(())
}

/// Record a failed attempt: back to `pending` under the cap, `failed` at it.
pub fn mark_failed(store: &Store, id: i64, error: &str) -> SyncResult<()> {
    let now = chrono::Utc::now().to_rfc3339();
    let conn = store.conn()?;
    conn.execute(
        "UPDATE sync_queue
         SET retry_count = retry_count + 1,
             status = CASE WHEN retry_count + 1 >= ?1 THEN 'failed' ELSE 'pending' END,
             last_error = ?2,
             updated_at = ?3
         WHERE id = ?4",
        params![MAX_RETRIES, error, now, id],
    )?;
    warn!(id, error, "queued operation attempt failed");
    Ok(())
}

/// Operator retry of a terminally failed operation.
pub fn retry_operation(store: &Store, id: i64) -> SyncResult<()> {
    let conn = store.conn()?;
    let changed = conn.execute(
        "UPDATE sync_queue
         SET status = 'pending', retry_count = 0, last_error = NULL, updated_at = ?1
         WHERE id = ?2 AND status = 'failed'",
        params![chrono::Utc::now().to_rfc3339(), id],
    )?;
    if changed == 0 {
        return Err(SyncError::InvalidInput(format!(
            "Queue item {id} is not in failed state"
        )));
    }
    info!(id, "failed operation reset for retry");
    Ok(())
}

/// (pending, failed) counts for sync-status surfaces.
pub fn operation_counts(store: &Store) -> SyncResult<(i64, i64)> {
    let conn = store.conn()?;
    let pending: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sync_queue WHERE status IN ('pending', 'syncing')",
        [],
        |row| row.get(0),
    )?;
    let failed: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sync_queue WHERE status = 'failed'",
        [],
        |row| row.get(0),
    )?;
    Ok((pending, failed))
}

// ===========================================================================
// Tests
// ===========================================================================
