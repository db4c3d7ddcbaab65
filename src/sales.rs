//! Pending sale queue.
//!
//! A sale completed while offline is recorded here first and replayed to the
//! admin dashboard by the next drain. Recording is a pure local write, so
//! checkout keeps working with zero connectivity. Sales have no retry cap:
//! a completed sale is never dropped, it stays eligible for every future
//! drain until one succeeds.

use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::RemoteBackend;
use crate::db::Store;
use crate::error::{SyncError, SyncResult};

/// Prefix of locally issued sale references, so the UI can tell an
/// offline-recorded sale from one confirmed by the admin dashboard.
pub const LOCAL_REFERENCE_PREFIX: &str = "OFF-";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One line of a sale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaleLine {
    pub product_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub quantity: f64,
    pub unit_price: f64,
    #[serde(default)]
    pub vat_rate: f64,
    /// Amount discounted from this line.
    #[serde(default)]
    pub discount: f64,
}

/// Customer details captured at checkout, kept as a snapshot on the sale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerSnapshot {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub tax_id: Option<String>,
}

/// One payment against the sale (cash, card, voucher and so on).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentLine {
    pub method: String,
    pub amount: f64,
}

/// Input to [`create_pending_sale`], straight from the checkout flow.
#[derive(Debug, Clone, Deserialize)]
pub struct NewSale {
    pub items: Vec<SaleLine>,
    #[serde(default)]
    pub customer: Option<CustomerSnapshot>,
    #[serde(default)]
    pub payments: Vec<PaymentLine>,
    /// Order-level discount on top of any per-line discounts.
    #[serde(default)]
    pub discount: f64,
    #[serde(default)]
    pub note: Option<String>,
}

/// A durably recorded sale awaiting (or having completed) replay.
#[derive(Debug, Clone, Serialize)]
pub struct PendingSale {
    pub id: String,
    pub local_reference: String,
    pub items: Vec<SaleLine>,
    pub customer: Option<CustomerSnapshot>,
    pub payments: Vec<PaymentLine>,
    pub subtotal: f64,
    pub vat_total: f64,
    pub discount_total: f64,
    pub total: f64,
    pub note: Option<String>,
    pub synced: bool,
    pub remote_id: Option<String>,
    pub remote_reference: Option<String>,
    pub created_at: String,
    pub synced_at: Option<String>,
}

impl PendingSale {
    /// Reference to show on receipts and sale lists: the remote-issued number
    /// once synced, the `OFF-` local reference before that.
    pub fn display_reference(&self) -> &str {
        self.remote_reference
            .as_deref()
            .unwrap_or(&self.local_reference)
    }
}

/// Aggregate result of one drain, for UI notifications.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SaleDrainSummary {
    pub synced: usize,
    pub failed: usize,
    pub remaining: usize,
    pub errors: Vec<String>,
}

// ---------------------------------------------------------------------------
// Enqueue
// ---------------------------------------------------------------------------

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Derive the `OFF-XXXXXXXX` display reference from a local uuid.
fn local_reference_for(id: &Uuid) -> String {
    let short: String = id
        .simple()
        .to_string()
        .chars()
        .take(8)
        .collect::<String>()
        .to_uppercase();
    format!("{LOCAL_REFERENCE_PREFIX}{short}")
}

/// Record a completed sale locally. Pure local write; never touches the
/// network, so it must succeed while fully offline.
pub fn create_pending_sale(store: &Store, sale: NewSale) -> SyncResult<PendingSale> {
    if sale.items.is_empty() {
        return Err(SyncError::InvalidInput("A sale needs at least one item".into()));
    }

    let id = Uuid::new_v4();
    let local_reference = local_reference_for(&id);
    let now = chrono::Utc::now().to_rfc3339();

    let mut subtotal = 0.0;
    let mut vat_total = 0.0;
    let mut line_discounts = 0.0;
    for line in &sale.items {
        let gross = line.quantity * line.unit_price;
        subtotal += gross;
        line_discounts += line.discount;
        vat_total += (gross - line.discount) * line.vat_rate;
    }
    let subtotal = round2(subtotal);
    let vat_total = round2(vat_total);
    let discount_total = round2(line_discounts + sale.discount);
    let total = round2(subtotal - discount_total + vat_total);

    let items_json = serde_json::to_string(&sale.items)?;
    let customer_json = sale
        .customer
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let payments_json = serde_json::to_string(&sale.payments)?;

    {
        let conn = store.conn()?;
        conn.execute(
            "INSERT INTO pending_sales (
                 id, local_reference, items, customer, payments,
                 subtotal, vat_total, discount_total, total, note,
                 synced, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11)",
            params![
                id.to_string(),
                local_reference,
                items_json,
                customer_json,
                payments_json,
                subtotal,
                vat_total,
                discount_total,
                total,
                sale.note,
                now,
            ],
        )?;
    }

    info!(sale_id = %id, reference = %local_reference, total, "pending sale recorded");

    Ok(PendingSale {
        id: id.to_string(),
        local_reference,
        items: sale.items,
        customer: sale.customer,
        payments: sale.payments,
        subtotal,
        vat_total,
        discount_total,
        total,
        note: sale.note,
        synced: false,
        remote_id: None,
        remote_reference: None,
        created_at: now,
        synced_at: None,
    })
}

// ---------------------------------------------------------------------------
// Drain
// ---------------------------------------------------------------------------

/// Replay all unsynced sales, oldest first.
///
/// Each sale is submitted sequentially; a success flips `synced` 0→1 in place
/// and records the remote id and reference. A failure leaves the row exactly
/// as it was for the next drain; there is no retry counter on sales.
pub async fn drain_pending_sales(
    store: &Store,
    remote: &dyn RemoteBackend,
) -> SyncResult<SaleDrainSummary> {
    let candidates = unsynced_sales(store)?;
    if candidates.is_empty() {
        return Ok(SaleDrainSummary::default());
    }

    info!(count = candidates.len(), "draining pending sales");

    let mut summary = SaleDrainSummary::default();

    for sale in candidates {
        match remote.submit_sale(&sale).await {
            Ok(receipt) => {
                let now = chrono::Utc::now().to_rfc3339();
                let conn = store.conn()?;
                conn.execute(
                    "UPDATE pending_sales
                     SET synced = 1, remote_id = ?1, remote_reference = ?2, synced_at = ?3
                     WHERE id = ?4 AND synced = 0",
                    params![receipt.remote_id, receipt.reference, now, sale.id],
                )?;
                summary.synced += 1;
            }
            Err(e) => {
                warn!(sale_id = %sale.id, error = %e, "sale submission failed; will retry on next drain");
                summary.failed += 1;
                summary.errors.push(format!("{}: {e}", sale.local_reference));
            }
        }
    }

    summary.remaining = summary.failed;
    if summary.synced > 0 {
        info!(synced = summary.synced, remaining = summary.remaining, "sale drain complete");
    }
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// All sales still awaiting replay, oldest first (drain candidate set).
pub fn unsynced_sales(store: &Store) -> SyncResult<Vec<PendingSale>> {
    let raw = {
        let conn = store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, local_reference, items, customer, payments,
                    subtotal, vat_total, discount_total, total, note,
                    synced, remote_id, remote_reference, created_at, synced_at
             FROM pending_sales
             WHERE synced = 0
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt
            .query_map([], raw_sale_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    raw.into_iter().map(RawSale::into_sale).collect()
}

/// All recorded sales, most recent first (sale history views).
pub fn list_pending_sales(store: &Store, limit: Option<u32>) -> SyncResult<Vec<PendingSale>> {
    let raw = {
        let conn = store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, local_reference, items, customer, payments,
                    subtotal, vat_total, discount_total, total, note,
                    synced, remote_id, remote_reference, created_at, synced_at
             FROM pending_sales
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit.map(i64::from).unwrap_or(-1)], raw_sale_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    raw.into_iter().map(RawSale::into_sale).collect()
}

pub fn get_pending_sale(store: &Store, id: &str) -> SyncResult<Option<PendingSale>> {
    use rusqlite::OptionalExtension;
    let raw = {
        let conn = store.conn()?;
        conn.query_row(
            "SELECT id, local_reference, items, customer, payments,
                    subtotal, vat_total, discount_total, total, note,
                    synced, remote_id, remote_reference, created_at, synced_at
             FROM pending_sales WHERE id = ?1",
            [id],
            raw_sale_from_row,
        )
        .optional()?
    };
    raw.map(RawSale::into_sale).transpose()
}

/// Delete synced sales older than `keep_days`. Unsynced rows are never pruned.
pub fn prune_synced_sales(store: &Store, keep_days: u32) -> SyncResult<usize> {
    let horizon = (chrono::Utc::now() - chrono::Duration::days(i64::from(keep_days))).to_rfc3339();
    let conn = store.conn()?;
    let removed = conn.execute(
        "DELETE FROM pending_sales WHERE synced = 1 AND created_at < ?1",
        [&horizon],
    )?;
    if removed > 0 {
        info!(removed, keep_days, "pruned synced sales");
    }
    Ok(removed)
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// Row image with JSON columns still as text; parsed outside the rusqlite
/// closure so serde errors surface as [`SyncError::Serialization`].
struct RawSale {
    id: String,
    local_reference: String,
    items: String,
    customer: Option<String>,
    payments: String,
    subtotal: f64,
    vat_total: f64,
    discount_total: f64,
    total: f64,
    note: Option<String>,
    synced: i64,
    remote_id: Option<String>,
    remote_reference: Option<String>,
    created_at: String,
    synced_at: Option<String>,
}

impl RawSale {
    fn into_sale(self) -> SyncResult<PendingSale> {
        let items: Vec<SaleLine> = serde_json::from_str(&self.items)?;
        let customer: Option<CustomerSnapshot> = self
            .customer
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let payments: Vec<PaymentLine> = serde_json::from_str(&self.payments)?;
        Ok(PendingSale {
            id: self.id,
            local_reference: self.local_reference,
            items,
            customer,
            payments,
            subtotal: self.subtotal,
            vat_total: self.vat_total,
            discount_total: self.discount_total,
            total: self.total,
            note: self.note,
            synced: self.synced != 0,
            remote_id: self.remote_id,
            remote_reference: self.remote_reference,
            created_at: self.created_at,
            synced_at: self.synced_at,
        })
    }
}

fn raw_sale_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSale> {
    Ok(RawSale {
        id: row.get(0)?,
        local_reference: row.get(1)?,
        items: row.get(2)?,
        customer: row.get(3)?,
        payments: row.get(4)?,
        subtotal: row.get(5)?,
        vat_total: row.get(6)?,
        discount_total: row.get(7)?,
        total: row.get(8)?,
        note: row.get(9)?,
        synced: row.get(10)?,
        remote_id: row.get(11)?,
        remote_reference: row.get(12)?,
        created_at: row.get(13)?,
        synced_at: row.get(14)?,
    })
}

/// (unsynced, synced) row counts for sync-status surfaces.
pub fn pending_sale_counts(store: &Store) -> SyncResult<(i64, i64)> {
    let conn = store.conn()?;
    let unsynced: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pending_sales WHERE synced = 0",
        [],
        |row| row.get(0),
    )?;
    let synced: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pending_sales WHERE synced = 1",
        [],
        |row| row.get(0),
    )?;
    Ok((unsynced, synced))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ConnectivityResult, InvoiceIssued, RemoteSaleReceipt};
    use crate::cache::{CachedCategory, CachedProduct};
    use crate::invoices::BuyerInfo;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted backend: pops one result per `submit_sale` call and logs the
    /// submission order by local reference.
    struct ScriptedRemote {
        sale_results: Mutex<VecDeque<SyncResult<RemoteSaleReceipt>>>,
        submitted: Mutex<Vec<String>>,
    }

    impl ScriptedRemote {
        fn new(results: Vec<SyncResult<RemoteSaleReceipt>>) -> ScriptedRemote {
            ScriptedRemote {
                sale_results: Mutex::new(results.into()),
                submitted: Mutex::new(Vec::new()),
            }
        }

        fn ok(n: usize) -> ScriptedRemote {
            ScriptedRemote::new(
                (0..n)
                    .map(|i| {
                        Ok(RemoteSaleReceipt {
                            remote_id: format!("r-{i}"),
                            reference: Some(format!("INV-{:04}", i + 1)),
                        })
                    })
                    .collect(),
            )
        }
    }

    #[async_trait]
    impl RemoteBackend for ScriptedRemote {
        async fn submit_sale(&self, sale: &PendingSale) -> SyncResult<RemoteSaleReceipt> {
            self.submitted
                .lock()
                .unwrap()
                .push(sale.local_reference.clone());
            self.sale_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(SyncError::Remote("script exhausted".into())))
        }
        async fn create_invoice(
            &self,
            _sale_id: &str,
            _buyer: &BuyerInfo,
        ) -> SyncResult<InvoiceIssued> {
            Err(SyncError::Remote("not under test".into()))
        }
        async fn cancel_invoice(&self, _invoice_id: &str, _reason: &str) -> SyncResult<()> {
            Err(SyncError::Remote("not under test".into()))
        }
        async fn fetch_products(&self) -> SyncResult<Vec<CachedProduct>> {
            Ok(Vec::new())
        }
        async fn fetch_categories(&self) -> SyncResult<Vec<CachedCategory>> {
            Ok(Vec::new())
        }
        async fn health_check(&self) -> ConnectivityResult {
            ConnectivityResult {
                success: true,
                latency_ms: Some(1),
                error: None,
            }
        }
    }

    fn two_line_sale() -> NewSale {
        NewSale {
            items: vec![
                SaleLine {
                    product_id: "p1".into(),
                    name: Some("Espresso".into()),
                    quantity: 2.0,
                    unit_price: 1.8,
                    vat_rate: 0.24,
                    discount: 0.0,
                },
                SaleLine {
                    product_id: "p2".into(),
                    name: Some("Latte".into()),
                    quantity: 1.0,
                    unit_price: 3.2,
                    vat_rate: 0.24,
                    discount: 0.2,
                },
            ],
            customer: Some(CustomerSnapshot {
                name: Some("Maria K".into()),
                phone: None,
                tax_id: Some("EL123456789".into()),
            }),
            payments: vec![PaymentLine {
                method: "cash".into(),
                amount: 8.0,
            }],
            discount: 0.0,
            note: Some("table 4".into()),
        }
    }

    #[test]
    fn test_create_computes_totals_and_local_reference() {
        let store = Store::open_in_memory().unwrap();
        let sale = create_pending_sale(&store, two_line_sale()).unwrap();

        assert!(!sale.synced);
        assert!(sale.local_reference.starts_with(LOCAL_REFERENCE_PREFIX));
        assert_eq!(sale.local_reference.len(), 12);
        assert_eq!(sale.display_reference(), sale.local_reference);

        // 2 x 1.80 + 1 x 3.20 = 6.80; discounts 0.20; vat on net = 1.58
        assert_eq!(sale.subtotal, 6.8);
        assert_eq!(sale.discount_total, 0.2);
        assert_eq!(sale.vat_total, 1.58);
        assert_eq!(sale.total, 8.18);
    }

    #[test]
    fn test_create_rejects_empty_sale() {
        let store = Store::open_in_memory().unwrap();
        let err = create_pending_sale(
            &store,
            NewSale {
                items: Vec::new(),
                customer: None,
                payments: Vec::new(),
                discount: 0.0,
                note: None,
            },
        )
        .expect_err("empty sale must be rejected");
        assert!(matches!(err, SyncError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_drain_marks_synced_and_excludes_from_next_candidate_set() {
        let store = Store::open_in_memory().unwrap();
        let created = create_pending_sale(&store, two_line_sale()).unwrap();

        let remote = ScriptedRemote::ok(1);
        let summary = drain_pending_sales(&store, &remote).await.unwrap();
        assert_eq!(summary.synced, 1);
        assert_eq!(summary.remaining, 0);

        let sale = get_pending_sale(&store, &created.id).unwrap().unwrap();
        assert!(sale.synced);
        assert_eq!(sale.remote_id.as_deref(), Some("r-0"));
        assert_eq!(sale.display_reference(), "INV-0001");
        assert!(sale.synced_at.is_some());

        // Next drain sees no candidates and calls the remote zero times.
        let remote2 = ScriptedRemote::ok(0);
        let summary2 = drain_pending_sales(&store, &remote2).await.unwrap();
        assert_eq!(summary2.synced, 0);
        assert!(remote2.submitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drain_processes_oldest_first() {
        let store = Store::open_in_memory().unwrap();
        let s1 = create_pending_sale(&store, two_line_sale()).unwrap();
        let s2 = create_pending_sale(&store, two_line_sale()).unwrap();

        // Force distinct creation order even within the same millisecond.
        {
            let conn = store.conn().unwrap();
            conn.execute(
                "UPDATE pending_sales SET created_at = '2026-03-01T10:00:00+00:00' WHERE id = ?1",
                [&s1.id],
            )
            .unwrap();
            conn.execute(
                "UPDATE pending_sales SET created_at = '2026-03-01T10:05:00+00:00' WHERE id = ?1",
                [&s2.id],
            )
            .unwrap();
        }

        let remote = ScriptedRemote::ok(2);
        drain_pending_sales(&store, &remote).await.unwrap();

        let order = remote.submitted.lock().unwrap().clone();
        assert_eq!(order, vec![s1.local_reference, s2.local_reference]);
    }

    #[tokio::test]
    async fn test_failed_submission_leaves_row_untouched() {
        let store = Store::open_in_memory().unwrap();
        let created = create_pending_sale(&store, two_line_sale()).unwrap();

        let remote = ScriptedRemote::new(vec![Err(SyncError::Network(
            "Cannot reach admin dashboard".into(),
        ))]);
        let summary = drain_pending_sales(&store, &remote).await.unwrap();
        assert_eq!(summary.synced, 0);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.remaining, 1);
        assert_eq!(summary.errors.len(), 1);

        // Row unchanged and still a candidate: sales retry indefinitely.
        let sale = get_pending_sale(&store, &created.id).unwrap().unwrap();
        assert!(!sale.synced);
        assert!(sale.remote_id.is_none());
        assert_eq!(unsynced_sales(&store).unwrap().len(), 1);

        // A later drain with a healthy remote succeeds.
        let remote2 = ScriptedRemote::ok(1);
        let summary2 = drain_pending_sales(&store, &remote2).await.unwrap();
        assert_eq!(summary2.synced, 1);
    }

    #[test]
    fn test_prune_only_removes_synced_rows() {
        let store = Store::open_in_memory().unwrap();
        let old_synced = create_pending_sale(&store, two_line_sale()).unwrap();
        let old_unsynced = create_pending_sale(&store, two_line_sale()).unwrap();

        {
            let conn = store.conn().unwrap();
            conn.execute(
                "UPDATE pending_sales SET synced = 1, created_at = '2020-01-01T00:00:00+00:00'
                 WHERE id = ?1",
                [&old_synced.id],
            )
            .unwrap();
            conn.execute(
                "UPDATE pending_sales SET created_at = '2020-01-01T00:00:00+00:00' WHERE id = ?1",
                [&old_unsynced.id],
            )
            .unwrap();
        }

        let removed = prune_synced_sales(&store, 30).unwrap();
        assert_eq!(removed, 1);
        assert!(get_pending_sale(&store, &old_synced.id).unwrap().is_none());
        assert!(get_pending_sale(&store, &old_unsynced.id).unwrap().is_some());
    }
}
