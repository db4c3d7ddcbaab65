//! Sync orchestrator.
//!
//! One [`SyncEngine::run_sync_cycle`] reconciles everything that accumulated
//! offline: pending sales first (an invoice references a sale id that must
//! already exist remotely), then the invoice queue, then the catalog refresh
//! so the UI reflects post-sync stock levels. Cycles are serialized by an
//! in-flight guard; a trigger arriving mid-cycle is dropped with
//! [`SyncError::SyncInProgress`] rather than queued.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::RemoteBackend;
use crate::cache;
use crate::connectivity::{ConnectivityMonitor, SubscriptionId};
use crate::db::Store;
use crate::error::{SyncError, SyncResult};
use crate::invoices::{self, InvoiceDrainSummary};
use crate::queue;
use crate::sales::{self, SaleDrainSummary};
use crate::storage::SessionProvider;

/// Sync-meta key stamped after every completed cycle.
pub const META_LAST_FULL_SYNC: &str = "last_full_sync";

/// Aggregate result of one sync cycle.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub sales: SaleDrainSummary,
    pub invoices: InvoiceDrainSummary,
    pub catalog_synced: bool,
    pub catalog_error: Option<String>,
    pub completed_at: String,
}

/// Point-in-time queue counts for UI status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub is_online: bool,
    pub pending_sales: i64,
    pub synced_sales: i64,
    pub invoice_queue: invoices::InvoiceQueueCounts,
    pub pending_operations: i64,
    pub failed_operations: i64,
    pub last_full_sync: Option<String>,
    pub last_catalog_sync: Option<String>,
}

/// Owns the drains and the in-flight guard.
///
/// Everything is injected: the store, the remote backend, the session source
/// and the connectivity monitor, so tests assemble an engine from stubs.
pub struct SyncEngine {
    store: Arc<Store>,
    remote: Arc<dyn RemoteBackend>,
    session: Arc<dyn SessionProvider>,
    monitor: Arc<ConnectivityMonitor>,
    in_flight: tokio::sync::Mutex<()>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<Store>,
        remote: Arc<dyn RemoteBackend>,
        session: Arc<dyn SessionProvider>,
        monitor: Arc<ConnectivityMonitor>,
    ) -> SyncEngine {
        SyncEngine {
            store,
            remote,
            session,
            monitor,
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    /// Run one full cycle: sale drain, invoice drain, catalog refresh.
    ///
    /// Environmental gates run first and mutate nothing: a concurrent cycle,
    /// a missing session, or being offline abort before any drain touches a
    /// retry counter. A catalog failure is reported in the summary but does
    /// not roll back queue progress; the drains already committed.
    pub async fn run_sync_cycle(&self) -> SyncResult<SyncSummary> {
        let _guard = self
            .in_flight
            .try_lock()
            .map_err(|_| SyncError::SyncInProgress)?;

        if self.session.session().is_none() {
            return Err(SyncError::NotConfigured);
        }
        if !self.monitor.is_online() {
            return Err(SyncError::Offline);
        }

        info!("sync cycle started");

        let sales = sales::drain_pending_sales(&self.store, self.remote.as_ref()).await?;
        let invoices = invoices::drain_invoice_queue(
            &self.store,
            self.remote.as_ref(),
            self.session.as_ref(),
        )
        .await?;

        let (catalog_synced, catalog_error) =
            match cache::sync_catalog(&self.store, self.remote.as_ref()).await {
                Ok(_) => (true, None),
                Err(e) => {
                    warn!(error = %e, "catalog refresh failed; queue progress is kept");
                    (false, Some(e.to_string()))
                }
            };

        let completed_at = chrono::Utc::now().to_rfc3339();
        self.store.sync_meta_set(META_LAST_FULL_SYNC, &completed_at)?;

        let summary = SyncSummary {
            sales,
            invoices,
            catalog_synced,
            catalog_error,
            completed_at,
        };
        info!(
            sales_synced = summary.sales.synced,
            invoices_synced = summary.invoices.synced,
            invoices_failed = summary.invoices.failed,
            catalog_synced,
            "sync cycle complete"
        );
        Ok(summary)
    }

    /// Aggregate queue counts for the UI.
    pub fn status(&self) -> SyncResult<SyncStatus> {
        let (pending_sales, synced_sales) = sales::pending_sale_counts(&self.store)?;
        let (pending_operations, failed_operations) = queue::operation_counts(&self.store)?;
        Ok(SyncStatus {
            is_online: self.monitor.is_online(),
            pending_sales,
            synced_sales,
            invoice_queue: invoices::invoice_queue_counts(&self.store)?,
            pending_operations,
            failed_operations,
            last_full_sync: self.store.sync_meta_get(META_LAST_FULL_SYNC)?,
            last_catalog_sync: cache::last_catalog_sync(&self.store)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Background loop
// ---------------------------------------------------------------------------

/// Stops the autosync loop and detaches its connectivity subscription.
pub struct AutosyncHandle {
    stopped: Arc<AtomicBool>,
    subscription: SubscriptionId,
    monitor: Arc<ConnectivityMonitor>,
    task: tokio::task::JoinHandle<()>,
}

impl AutosyncHandle {
    pub fn stop(self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.monitor.unsubscribe(self.subscription);
        self.task.abort();
        info!("autosync stopped");
    }
}

/// Spawn the background autosync task.
///
/// Two triggers feed one cycle runner: the offline→online transition and a
/// periodic tick. The trigger channel holds a single slot, so a burst of
/// reconnects collapses into one queued cycle; a trigger landing while a
/// cycle runs is dropped by the in-flight guard.
pub fn spawn_autosync(engine: Arc<SyncEngine>, interval: Duration) -> AutosyncHandle {
    let stopped = Arc::new(AtomicBool::new(false));
    let (tx, mut rx) = mpsc::channel::<()>(1);

    let monitor = engine.monitor.clone();
    let subscription = monitor.subscribe({
        let tx = tx.clone();
        move |online| {
            if online {
                let _ = tx.try_send(());
            }
        }
    });

    let task = {
        let stopped = stopped.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "autosync started");
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // consume the immediate first tick

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    received = rx.recv() => {
                        if received.is_none() {
                            break;
                        }
                    }
                }

                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                if !engine.monitor.is_online() {
                    debug!("autosync tick skipped: offline");
                    continue;
                }

                match engine.run_sync_cycle().await {
                    Ok(summary) => {
                        if summary.sales.synced > 0 || summary.invoices.synced > 0 {
                            info!(
                                sales = summary.sales.synced,
                                invoices = summary.invoices.synced,
                                "autosync cycle synced items"
                            );
                        }
                    }
                    Err(SyncError::SyncInProgress) => {
                        debug!("autosync trigger dropped: cycle already running");
                    }
                    Err(e) => warn!(error = %e, "autosync cycle failed"),
                }
            }
        })
    };

    AutosyncHandle {
        stopped,
        subscription,
        monitor,
        task,
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ConnectivityResult, InvoiceIssued, RemoteBackend, RemoteSaleReceipt};
    use crate::cache::{CachedCategory, CachedProduct};
    use crate::invoices::BuyerInfo;
    use crate::sales::{NewSale, PendingSale, SaleLine};
    use crate::storage::Session;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    /// Full stub backend. Sales and invoices always succeed; the catalog is
    /// a fixed two-product set. `calls` records invocation order; `gate`
    /// (when armed) parks the first `submit_sale` until released, to hold a
    /// cycle open across another trigger.
    struct StubRemote {
        calls: Mutex<Vec<String>>,
        gate: Mutex<Option<oneshot::Receiver<()>>>,
        fail_catalog: bool,
    }

    impl StubRemote {
        fn new() -> StubRemote {
            StubRemote {
                calls: Mutex::new(Vec::new()),
                gate: Mutex::new(None),
                fail_catalog: false,
            }
        }
    }

    #[async_trait]
    impl RemoteBackend for StubRemote {
        async fn submit_sale(&self, sale: &PendingSale) -> SyncResult<RemoteSaleReceipt> {
            self.calls.lock().unwrap().push("sale".into());
            let gate = self.gate.lock().unwrap().take();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            Ok(RemoteSaleReceipt {
                remote_id: format!("r-{}", sale.local_reference),
                reference: Some("INV-0001".into()),
            })
        }
        async fn create_invoice(
            &self,
            _sale_id: &str,
            _buyer: &BuyerInfo,
        ) -> SyncResult<InvoiceIssued> {
            self.calls.lock().unwrap().push("invoice".into());
            Ok(InvoiceIssued {
                invoice_number: "INV-E-0001".into(),
            })
        }
        async fn cancel_invoice(&self, _invoice_id: &str, _reason: &str) -> SyncResult<()> {
            self.calls.lock().unwrap().push("cancel".into());
            Ok(())
        }
        async fn fetch_products(&self) -> SyncResult<Vec<CachedProduct>> {
            self.calls.lock().unwrap().push("products".into());
            if self.fail_catalog {
                return Err(SyncError::Network("Cannot reach admin dashboard".into()));
            }
            Ok(vec![CachedProduct {
                id: "p1".into(),
                name: "Espresso".into(),
                barcode: None,
                category_id: None,
                price: 1.8,
                vat_rate: 0.24,
                quantity: 5.0,
                image_url: None,
                updated_at: None,
            }])
        }
        async fn fetch_categories(&self) -> SyncResult<Vec<CachedCategory>> {
            self.calls.lock().unwrap().push("categories".into());
            if self.fail_catalog {
                return Err(SyncError::Network("Cannot reach admin dashboard".into()));
            }
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

    fn test_session() -> Session {
        Session {
            admin_url: "https://admin.example.com".into(),
            api_key: "key-123".into(),
            terminal_id: "t-1".into(),
            branch_id: None,
        }
    }

    struct NoSession;
    impl SessionProvider for NoSession {
        fn session(&self) -> Option<Session> {
            None
        }
    }

    fn one_line_sale() -> NewSale {
        NewSale {
            items: vec![SaleLine {
                product_id: "p1".into(),
                name: None,
                quantity: 1.0,
                unit_price: 1.8,
                vat_rate: 0.24,
                discount: 0.0,
            }],
            customer: None,
            payments: Vec::new(),
            discount: 0.0,
            note: None,
        }
    }

    fn engine_with(remote: Arc<StubRemote>, session: Arc<dyn SessionProvider>) -> Arc<SyncEngine> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let monitor = Arc::new(ConnectivityMonitor::new());
        monitor.set_online(true);
        Arc::new(SyncEngine::new(store, remote, session, monitor))
    }

    #[tokio::test]
    async fn test_cycle_drains_in_order_sales_invoices_catalog() {
        let remote = Arc::new(StubRemote::new());
        let engine = engine_with(remote.clone(), Arc::new(test_session()));

        sales::create_pending_sale(engine.store(), one_line_sale()).unwrap();
        invoices::queue_invoice_create(
            engine.store(),
            "sale-1",
            BuyerInfo {
                name: "Acme Ltd".into(),
                tax_id: None,
                address: None,
                email: None,
                phone: None,
            },
        )
        .unwrap();

        let summary = engine.run_sync_cycle().await.unwrap();
        assert_eq!(summary.sales.synced, 1);
        assert_eq!(summary.invoices.synced, 1);
        assert!(summary.catalog_synced);

        let calls = remote.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["sale", "invoice", "products", "categories"]);

        assert!(engine
            .store()
            .sync_meta_get(META_LAST_FULL_SYNC)
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_cycle_rejects_when_offline_or_unconfigured() {
        let remote = Arc::new(StubRemote::new());

        let engine = engine_with(remote.clone(), Arc::new(NoSession));
        assert!(matches!(
            engine.run_sync_cycle().await,
            Err(SyncError::NotConfigured)
        ));

        let engine = engine_with(remote.clone(), Arc::new(test_session()));
        engine.monitor().set_online(false);
        assert!(matches!(
            engine.run_sync_cycle().await,
            Err(SyncError::Offline)
        ));

        // Neither gate reached the remote.
        assert!(remote.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_concurrent_cycle_is_dropped() {
        let remote = Arc::new(StubRemote::new());
        let engine = engine_with(remote.clone(), Arc::new(test_session()));
        sales::create_pending_sale(engine.store(), one_line_sale()).unwrap();

        // Park the first cycle inside submit_sale.
        let (release, gate) = oneshot::channel();
        *remote.gate.lock().unwrap() = Some(gate);

        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run_sync_cycle().await }
        });

        // Wait until the first cycle holds the guard.
        while remote.calls.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            engine.run_sync_cycle().await,
            Err(SyncError::SyncInProgress)
        ));

        release.send(()).unwrap();
        let summary = first.await.unwrap().unwrap();
        assert_eq!(summary.sales.synced, 1);
    }

    #[tokio::test]
    async fn test_repeat_cycle_does_not_double_process() {
        let remote = Arc::new(StubRemote::new());
        let engine = engine_with(remote.clone(), Arc::new(test_session()));
        sales::create_pending_sale(engine.store(), one_line_sale()).unwrap();

        let first = engine.run_sync_cycle().await.unwrap();
        assert_eq!(first.sales.synced, 1);

        // Re-running on every reconnect is safe: nothing eligible remains.
        let second = engine.run_sync_cycle().await.unwrap();
        assert_eq!(second.sales.synced, 0);
        assert_eq!(second.invoices.synced, 0);

        let sale_calls = remote
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| *c == "sale")
            .count();
        assert_eq!(sale_calls, 1);
    }

    #[tokio::test]
    async fn test_catalog_failure_keeps_queue_progress() {
        let remote = Arc::new(StubRemote {
            calls: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
            fail_catalog: true,
        });
        let engine = engine_with(remote.clone(), Arc::new(test_session()));
        let created = sales::create_pending_sale(engine.store(), one_line_sale()).unwrap();

        let summary = engine.run_sync_cycle().await.unwrap();
        assert_eq!(summary.sales.synced, 1);
        assert!(!summary.catalog_synced);
        assert!(summary.catalog_error.is_some());

        // Sale progress committed despite the catalog failure.
        let sale = sales::get_pending_sale(engine.store(), &created.id)
            .unwrap()
            .unwrap();
        assert!(sale.synced);
    }

    #[tokio::test]
    async fn test_autosync_runs_on_reconnect() {
        let remote = Arc::new(StubRemote::new());
        let engine = engine_with(remote.clone(), Arc::new(test_session()));
        engine.monitor().set_online(false);
        sales::create_pending_sale(engine.store(), one_line_sale()).unwrap();

        let handle = spawn_autosync(engine.clone(), Duration::from_secs(3600));

        // Reconnect triggers a cycle without waiting for the interval.
        engine.monitor().set_online(true);
        for _ in 0..200 {
            tokio::task::yield_now().await;
            if engine.status().unwrap().pending_sales == 0 {
                break;
            }
        }
        assert_eq!(engine.status().unwrap().pending_sales, 0);

        handle.stop();
    }

    #[tokio::test]
    async fn test_status_counts() {
        let remote = Arc::new(StubRemote::new());
        let engine = engine_with(remote.clone(), Arc::new(test_session()));

        sales::create_pending_sale(engine.store(), one_line_sale()).unwrap();
        queue::enqueue_operation(engine.store(), "ack_terminal", &serde_json::json!({})).unwrap();

        let status = engine.status().unwrap();
        assert!(status.is_online);
        assert_eq!(status.pending_sales, 1);
        assert_eq!(status.synced_sales, 0);
        assert_eq!(status.pending_operations, 1);
        assert!(status.last_full_sync.is_none());
    }
}
