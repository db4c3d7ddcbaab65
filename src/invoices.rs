//! E-invoice sync queue.
//!
//! Invoice creation and cancellation intents are queued locally and replayed
//! against the admin dashboard with bounded retries. Unlike pending sales,
//! an item that fails [`MAX_RETRIES`] times goes terminal (`failed`) and
//! stays out of every drain until an operator retries it explicitly.
//!
//! Each `create` intent also writes an [`InvoiceDraft`]; the draft's status
//! is a projection of its queue item's outcome and the two rows are always
//! updated in the same transaction.

use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::RemoteBackend;
use crate::db::Store;
use crate::error::{SyncError, SyncResult};
use crate::storage::SessionProvider;

/// Retry cap; reaching it moves an item (and its draft) to `failed`.
pub const MAX_RETRIES: i64 = 3;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Buyer details snapshotted onto the invoice intent at queue time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuyerInfo {
    pub name: String,
    #[serde(default)]
    pub tax_id: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

/// What the queue item asks the remote system to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceAction {
    Create,
    Cancel,
}

impl InvoiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceAction::Create => "create",
            InvoiceAction::Cancel => "cancel",
        }
    }

    fn parse(s: &str) -> SyncResult<InvoiceAction> {
        match s {
            "create" => Ok(InvoiceAction::Create),
            "cancel" => Ok(InvoiceAction::Cancel),
            other => Err(SyncError::InvalidInput(format!(
                "Unknown invoice action '{other}'"
            ))),
        }
    }
}

/// Queue item lifecycle. Moves only forward, except the explicit
/// operator-triggered `failed` → `pending` reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> SyncResult<QueueStatus> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "completed" => Ok(QueueStatus::Completed),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(SyncError::InvalidInput(format!(
                "Unknown queue status '{other}'"
            ))),
        }
    }
}

/// Draft status: `pending` | `synced` | `failed`, projected from the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DraftStatus {
    Pending,
    Synced,
    Failed,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DraftStatus::Pending => "pending",
            DraftStatus::Synced => "synced",
            DraftStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> SyncResult<DraftStatus> {
        match s {
            "pending" => Ok(DraftStatus::Pending),
            "synced" => Ok(DraftStatus::Synced),
            "failed" => Ok(DraftStatus::Failed),
            other => Err(SyncError::InvalidInput(format!(
                "Unknown draft status '{other}'"
            ))),
        }
    }
}

/// One invoice intent per sale, visible to invoice UIs.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceDraft {
    pub id: String,
    pub sale_id: String,
    pub buyer: BuyerInfo,
    pub status: DraftStatus,
    pub invoice_number: Option<String>,
    pub created_at: String,
}

/// A queued create/cancel intent.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceQueueItem {
    pub id: String,
    pub sale_id: String,
    pub draft_id: Option<String>,
    pub action: InvoiceAction,
    pub payload: serde_json::Value,
    pub status: QueueStatus,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub created_at: String,
    pub processed_at: Option<String>,
}

/// Aggregate result of one drain, for UI notifications.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InvoiceDrainSummary {
    pub synced: usize,
    pub failed: usize,
    pub remaining: usize,
    pub errors: Vec<String>,
}

// ---------------------------------------------------------------------------
// Enqueue
// ---------------------------------------------------------------------------

/// Queue an invoice-creation intent for a sale.
///
/// Inserts the draft and its queue item in one transaction so the two can
/// never disagree about whether the intent exists.
pub fn queue_invoice_create(
    store: &Store,
    sale_id: &str,
    buyer: BuyerInfo,
) -> SyncResult<InvoiceDraft> {
    if buyer.name.trim().is_empty() {
        return Err(SyncError::InvalidInput("Buyer name is required".into()));
    }

    let draft_id = Uuid::new_v4().to_string();
    let item_id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    let buyer_json = serde_json::to_string(&buyer)?;

    {
        let mut conn = store.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO invoice_drafts (id, sale_id, buyer, status, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            params![draft_id, sale_id, buyer_json, now],
        )?;
        tx.execute(
            "INSERT INTO invoice_sync_queue
                 (id, sale_id, draft_id, action, payload, status, retry_count, created_at)
             VALUES (?1, ?2, ?3, 'create', ?4, 'pending', 0, ?5)",
            params![item_id, sale_id, draft_id, buyer_json, now],
        )?;
        tx.commit()?;
    }

    info!(sale_id, draft_id = %draft_id, "invoice creation queued");

    Ok(InvoiceDraft {
        id: draft_id,
        sale_id: sale_id.to_string(),
        buyer,
        status: DraftStatus::Pending,
        invoice_number: None,
        created_at: now,
    })
}

/// Queue a cancellation intent for an already-issued invoice.
pub fn queue_invoice_cancel(
    store: &Store,
    sale_id: &str,
    invoice_id: &str,
    reason: &str,
) -> SyncResult<String> {
    if invoice_id.trim().is_empty() {
        return Err(SyncError::InvalidInput("Invoice id is required".into()));
    }

    let item_id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    let payload = serde_json::json!({ "invoice_id": invoice_id, "reason": reason }).to_string();

    {
        let conn = store.conn()?;
        conn.execute(
            "INSERT INTO invoice_sync_queue
                 (id, sale_id, action, payload, status, retry_count, created_at)
             VALUES (?1, ?2, 'cancel', ?3, 'pending', 0, ?4)",
            params![item_id, sale_id, payload, now],
        )?;
    }

    info!(sale_id, invoice_id, "invoice cancellation queued");
    Ok(item_id)
}

// ---------------------------------------------------------------------------
// Drain
// ---------------------------------------------------------------------------

/// Replay eligible invoice intents, strictly one at a time.
///
/// Sequential processing avoids two in-flight creations racing against the
/// same sale. The session gate runs first: without an authenticated session
/// the whole drain aborts, every candidate is reported as remaining, and no
/// retry counter moves.
pub async fn drain_invoice_queue(
    store: &Store,
    remote: &dyn RemoteBackend,
    session: &dyn SessionProvider,
) -> SyncResult<InvoiceDrainSummary> {
    let candidates = eligible_items(store)?;
    if candidates.is_empty() {
        return Ok(InvoiceDrainSummary::default());
    }

    if session.session().is_none() {
        warn!(
            candidates = candidates.len(),
            "invoice drain skipped: no authenticated session"
        );
        return Ok(InvoiceDrainSummary {
            remaining: candidates.len(),
            errors: vec!["No authenticated session; invoice sync deferred".into()],
            ..Default::default()
        });
    }

    info!(count = candidates.len(), "draining invoice queue");
    let mut summary = InvoiceDrainSummary::default();

    for item in candidates {
        mark_processing(store, &item.id)?;

        // Payload problems go through the same per-item failure path as
        // remote errors, so one bad row cannot stall the queue.
        let outcome: SyncResult<Option<String>> = match item.action {
            InvoiceAction::Create => {
                match serde_json::from_value::<BuyerInfo>(item.payload.clone()) {
                    Ok(buyer) => remote
                        .create_invoice(&item.sale_id, &buyer)
                        .await
                        .map(|issued| Some(issued.invoice_number)),
                    Err(e) => Err(SyncError::Serialization(e)),
                }
            }
            InvoiceAction::Cancel => {
                let invoice_id = item
                    .payload
                    .get("invoice_id")
                    .and_then(serde_json::Value::as_str);
                match invoice_id {
                    Some(invoice_id) => {
                        let reason = item
                            .payload
                            .get("reason")
                            .and_then(serde_json::Value::as_str)
                            .unwrap_or("");
                        remote.cancel_invoice(invoice_id, reason).await.map(|()| None)
                    }
                    None => Err(SyncError::InvalidInput(
                        "Cancel payload missing invoice_id".into(),
                    )),
                }
            }
        };

        match outcome {
            Ok(invoice_number) => {
                complete_item(store, &item, invoice_number.as_deref())?;
                summary.synced += 1;
            }
            Err(e) => {
                let went_terminal = record_failure(store, &item, &e.to_string())?;
                if went_terminal {
                    summary.failed += 1;
                } else {
                    summary.remaining += 1;
                }
                summary.errors.push(format!(
                    "{} {} for sale {}: {e}",
                    item.action.as_str(),
                    item.id,
                    item.sale_id
                ));
            }
        }
    }

    info!(
        synced = summary.synced,
        failed = summary.failed,
        remaining = summary.remaining,
        "invoice drain complete"
    );
    Ok(summary)
}

/// Drain candidate set: `pending` or `failed` items still under the retry cap,
/// oldest first.
fn eligible_items(store: &Store) -> SyncResult<Vec<InvoiceQueueItem>> {
    let raw = {
        let conn = store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, sale_id, draft_id, action, payload, status,
                    retry_count, last_error, created_at, processed_at
             FROM invoice_sync_queue
             WHERE status IN ('pending', 'failed') AND retry_count < ?1
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt
            .query_map([MAX_RETRIES], raw_item_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    raw.into_iter().map(RawItem::into_item).collect()
}

fn mark_processing(store: &Store, item_id: &str) -> SyncResult<()> {
    let conn = store.conn()?;
    conn.execute(
        "UPDATE invoice_sync_queue SET status = 'processing' WHERE id = ?1",
        [item_id],
    )?;
    Ok(())
}

/// Success path: queue item completes and the draft (if any) flips to
/// `synced` with its issued number, atomically.
fn complete_item(
    store: &Store,
    item: &InvoiceQueueItem,
    invoice_number: Option<&str>,
) -> SyncResult<()> {
    let now = chrono::Utc::now().to_rfc3339();
    let mut conn = store.conn()?;
    let tx = conn.transaction()?;
    tx.execute(
        "UPDATE invoice_sync_queue
         SET status = 'completed', last_error = NULL, processed_at = ?1
         WHERE id = ?2",
        params![now, item.id],
    )?;
    if let Some(draft_id) = item.draft_id.as_deref() {
        tx.execute(
            "UPDATE invoice_drafts SET status = 'synced', invoice_number = ?1 WHERE id = ?2",
            params![invoice_number, draft_id],
        )?;
    }
    tx.commit()?;
    Ok(())
}

/// Failure path: bump the retry counter and either requeue or go terminal.
/// Returns `true` when the item hit the cap and moved to `failed`.
fn record_failure(store: &Store, item: &InvoiceQueueItem, error: &str) -> SyncResult<bool> {
    let retries = item.retry_count + 1;
    let terminal = retries >= MAX_RETRIES;
    let now = chrono::Utc::now().to_rfc3339();

    let mut conn = store.conn()?;
    let tx = conn.transaction()?;
    if terminal {
        tx.execute(
            "UPDATE invoice_sync_queue
             SET status = 'failed', retry_count = ?1, last_error = ?2, processed_at = ?3
             WHERE id = ?4",
            params![retries, error, now, item.id],
        )?;
        if let Some(draft_id) = item.draft_id.as_deref() {
            tx.execute(
                "UPDATE invoice_drafts SET status = 'failed' WHERE id = ?1",
                [draft_id],
            )?;
        }
    } else {
        tx.execute(
            "UPDATE invoice_sync_queue
             SET status = 'pending', retry_count = ?1, last_error = ?2
             WHERE id = ?3",
            params![retries, error, item.id],
        )?;
    }
    tx.commit()?;

    if terminal {
        warn!(item_id = %item.id, retries, error, "invoice intent failed terminally");
    } else {
        warn!(item_id = %item.id, retries, error, "invoice intent requeued");
    }
    Ok(terminal)
}

// ---------------------------------------------------------------------------
// Manual retry
// ---------------------------------------------------------------------------

/// Operator-triggered retry of a terminally failed item: back to `pending`
/// with the retry counter reset and the last error cleared. The associated
/// draft returns to `pending` in the same transaction.
pub fn retry_failed_invoice(store: &Store, item_id: &str) -> SyncResult<()> {
    let mut conn = store.conn()?;
    let tx = conn.transaction()?;

    let changed = tx.execute(
        "UPDATE invoice_sync_queue
         SET status = 'pending', retry_count = 0, last_error = NULL, processed_at = NULL
         WHERE id = ?1 AND status = 'failed'",
        [item_id],
    )?;
    if changed == 0 {
        return Err(SyncError::InvalidInput(format!(
            "Invoice queue item {item_id} is not in failed state"
        )));
    }
    tx.execute(
        "UPDATE invoice_drafts SET status = 'pending'
         WHERE id = (SELECT draft_id FROM invoice_sync_queue WHERE id = ?1)",
        [item_id],
    )?;
    tx.commit()?;

    info!(item_id, "failed invoice intent reset for retry");
    Ok(())
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Every queue item, oldest first (inspection and retry UIs; `last_error`
/// is retained on requeued and failed items).
pub fn list_invoice_queue(store: &Store) -> SyncResult<Vec<InvoiceQueueItem>> {
    let raw = {
        let conn = store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, sale_id, draft_id, action, payload, status,
                    retry_count, last_error, created_at, processed_at
             FROM invoice_sync_queue
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt
            .query_map([], raw_item_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    raw.into_iter().map(RawItem::into_item).collect()
}

pub fn get_invoice_draft(store: &Store, draft_id: &str) -> SyncResult<Option<InvoiceDraft>> {
    use rusqlite::OptionalExtension;
    let raw = {
        let conn = store.conn()?;
        conn.query_row(
            "SELECT id, sale_id, buyer, status, invoice_number, created_at
             FROM invoice_drafts WHERE id = ?1",
            [draft_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?
    };
    raw.map(|(id, sale_id, buyer, status, invoice_number, created_at)| {
        Ok(InvoiceDraft {
            id,
            sale_id,
            buyer: serde_json::from_str(&buyer)?,
            status: DraftStatus::parse(&status)?,
            invoice_number,
            created_at,
        })
    })
    .transpose()
}

/// Drafts for a sale, newest first.
pub fn drafts_for_sale(store: &Store, sale_id: &str) -> SyncResult<Vec<InvoiceDraft>> {
    let raw = {
        let conn = store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, sale_id, buyer, status, invoice_number, created_at
             FROM invoice_drafts WHERE sale_id = ?1
             ORDER BY created_at DESC, rowid DESC",
        )?;
        let rows = stmt
            .query_map([sale_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    raw.into_iter()
        .map(|(id, sale_id, buyer, status, invoice_number, created_at)| {
            Ok(InvoiceDraft {
                id,
                sale_id,
                buyer: serde_json::from_str(&buyer)?,
                status: DraftStatus::parse(&status)?,
                invoice_number,
                created_at,
            })
        })
        .collect()
}

/// Per-status item counts for sync-status surfaces.
pub fn invoice_queue_counts(store: &Store) -> SyncResult<InvoiceQueueCounts> {
    let conn = store.conn()?;
    let count = |status: &str| -> SyncResult<i64> {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM invoice_sync_queue WHERE status = ?1",
            [status],
            |row| row.get(0),
        )?)
    };
    Ok(InvoiceQueueCounts {
        pending: count("pending")?,
        processing: count("processing")?,
        completed: count("completed")?,
        failed: count("failed")?,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct InvoiceQueueCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

struct RawItem {
    id: String,
    sale_id: String,
    draft_id: Option<String>,
    action: String,
    payload: String,
    status: String,
    retry_count: i64,
    last_error: Option<String>,
    created_at: String,
    processed_at: Option<String>,
}

impl RawItem {
    fn into_item(self) -> SyncResult<InvoiceQueueItem> {
        Ok(InvoiceQueueItem {
            action: InvoiceAction::parse(&self.action)?,
            status: QueueStatus::parse(&self.status)?,
            payload: serde_json::from_str(&self.payload)?,
            id: self.id,
            sale_id: self.sale_id,
            draft_id: self.draft_id,
            retry_count: self.retry_count,
            last_error: self.last_error,
            created_at: self.created_at,
            processed_at: self.processed_at,
        })
    }
}

fn raw_item_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawItem> {
    Ok(RawItem {
        id: row.get(0)?,
        sale_id: row.get(1)?,
        draft_id: row.get(2)?,
        action: row.get(3)?,
        payload: row.get(4)?,
        status: row.get(5)?,
        retry_count: row.get(6)?,
        last_error: row.get(7)?,
        created_at: row.get(8)?,
        processed_at: row.get(9)?,
    })
}

// ===========================================================================
// Tests
// ===========================================================================
