//! Per-router advisory locks.
//!
//! Deploy, undeploy and delete of one router hold that router's lock for
//! their whole duration, so two operations on the same router never
//! interleave. Operations on different routers run independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;
use turing_state::RouterId;

#[derive(Debug, Clone, Default)]
pub struct RouterLocks {
    inner: Arc<Mutex<HashMap<RouterId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl RouterLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a router.
    pub async fn lock(&self, router_id: RouterId) -> OwnedMutexGuard<()> {
        self.slot(router_id).lock_owned().await
    }

    /// Exclusive access to a router, or `None` if another operation holds it.
    pub fn try_lock(&self, router_id: RouterId) -> Option<OwnedMutexGuard<()>> {
        self.slot(router_id).try_lock_owned().ok()
    }

    /// Drop the lock of a deleted router. Holders keep their guard.
    pub fn forget(&self, router_id: RouterId) {
        self.map().remove(&router_id);
    }

    fn slot(&self, router_id: RouterId) -> Arc<tokio::sync::Mutex<()>> {
        self.map().entry(router_id).or_default().clone()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<RouterId, Arc<tokio::sync::Mutex<()>>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
