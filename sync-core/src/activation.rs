//! "Is this still current" gate for async results.
//!
//! Every store keeps an epoch bumped whenever the active tenant changes. A load
//! captures the epoch when it starts and only applies its result if the epoch
//! is unchanged at application time.

use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::model::TenantId;

#[derive(Debug, Default)]
pub struct Activation {
    epoch: AtomicU64,
    tenant: Mutex<Option<TenantId>>,
}

impl Activation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `tenant` the active one. Results of loads started before this call
    /// are discarded.
    pub fn activate(&self, tenant: &TenantId) -> u64 {
        *self.tenant.lock().unwrap_or_else(PoisonError::into_inner) = Some(tenant.clone());
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn deactivate(&self) {
        *self.tenant.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch() == epoch
    }

    pub fn active_tenant(&self) -> Option<TenantId> {
        self.tenant
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
