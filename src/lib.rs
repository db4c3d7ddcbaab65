//! Tillsync - offline-first sync engine for the Till retail POS.
//!
//! The terminal keeps selling when the admin dashboard is unreachable:
//! reference data (products, categories) is served from a local SQLite
//! cache, completed sales and e-invoice intents are queued durably, and a
//! [`sync::SyncEngine`] reconciles everything once connectivity returns.
//!
//! Reconciliation order is fixed: pending sales are pushed first (invoices
//! reference sale ids that must exist remotely), then the invoice queue
//! drains with bounded retries, then the catalog cache refreshes. Sales
//! retry indefinitely (a completed sale is never dropped) while invoice
//! intents go terminal after three failed attempts and wait for an operator
//! retry.
//!
//! Assembly is explicit dependency injection:
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use tillsync::{
//!     api::AdminApi, connectivity::ConnectivityMonitor, db::Store,
//!     storage::KeyringSessionProvider, sync::SyncEngine,
//! };
//!
//! # fn main() -> tillsync::error::SyncResult<()> {
//! let store = Arc::new(Store::open(Path::new("/var/lib/till"))?);
//! let session = Arc::new(KeyringSessionProvider);
//! let remote = Arc::new(AdminApi::new(session.clone())?);
//! let monitor = Arc::new(ConnectivityMonitor::new());
//! let engine = Arc::new(SyncEngine::new(store, remote, session, monitor));
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod cache;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod invoices;
pub mod logging;
pub mod queue;
pub mod sales;
pub mod storage;
pub mod sync;

pub use api::{AdminApi, RemoteBackend};
pub use connectivity::ConnectivityMonitor;
pub use db::Store;
pub use error::{SyncError, SyncResult};
pub use storage::{Session, SessionProvider};
pub use sync::{spawn_autosync, SyncEngine, SyncSummary};
