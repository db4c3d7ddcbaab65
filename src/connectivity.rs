//! Connectivity monitor.
//!
//! A single online/offline boolean plus change notifications. The runtime's
//! own network events (or a periodic [`ConnectivityMonitor::probe`]) feed
//! [`ConnectivityMonitor::set_online`]; the autosync loop subscribes to the
//! offline→online transition to trigger a sync cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::api::{ConnectivityResult, RemoteBackend};

type Handler = Arc<dyn Fn(bool) + Send + Sync>;

/// Handle returned by [`ConnectivityMonitor::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct ConnectivityMonitor {
    online: AtomicBool,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Handler>>,
}

impl Default for ConnectivityMonitor {
    fn default() -> ConnectivityMonitor {
        ConnectivityMonitor::new()
    }
}

impl ConnectivityMonitor {
    /// Starts offline; the first successful probe (or an explicit
    /// `set_online(true)`) flips it.
    pub fn new() -> ConnectivityMonitor {
        ConnectivityMonitor {
            online: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Record the current connectivity state. Subscribers are notified only
    /// on an actual transition, outside the registry lock.
    pub fn set_online(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous == online {
            return;
        }

        info!(online, "connectivity changed");

        let handlers: Vec<Handler> = match self.subscribers.lock() {
            Ok(subs) => subs.values().cloned().collect(),
            Err(_) => return,
        };
        for handler in handlers {
            handler(online);
        }
    }

    /// Register a change handler; it receives the new state on every
    /// transition until unsubscribed.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.insert(id, Arc::new(handler));
        }
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.remove(&id.0);
        }
    }

    /// Run the remote health probe and feed its outcome into the monitor.
    pub async fn probe(&self, remote: &dyn RemoteBackend) -> ConnectivityResult {
        let result = remote.health_check().await;
        self.set_online(result.success);
        result
    }
}

// ===========================================================================
// Tests
// ===========================================================================
