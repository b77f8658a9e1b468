//! Per-key single-flight guard.
//!
//! `run(key, op)` starts `op` when nothing is in flight for `key`. A caller
//! that arrives while a flight is active only records that a re-run is wanted
//! and returns [`Flight::Coalesced`] immediately. When the active flight
//! finishes it runs `op` once more if any re-run was requested, so a burst of
//! N triggers costs two invocations, never N + 1.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

/// Outcome of [`SingleFlight::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flight {
    /// This caller drove the flight; `runs` counts the original invocation
    /// plus every trailing re-run it executed.
    Completed { runs: u32 },
    /// Another caller owns the flight for this key; a re-run was queued.
    Coalesced,
}

#[derive(Debug, Default)]
struct Slot {
    rerun_requested: bool,
}

/// At most one in-flight operation per key, plus at most one queued re-run.
///
/// Cloning shares the underlying slots.
pub struct SingleFlight<K> {
    slots: Arc<Mutex<HashMap<K, Slot>>>,
}

impl<K> Clone for SingleFlight<K> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<K> Default for SingleFlight<K> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K> SingleFlight<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<K, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a flight is currently active for `key`.
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.slots().contains_key(key)
    }

    /// Run `operation` under the guard for `key`.
    ///
    /// The lock is never held across an await point. If the driving future is
    /// dropped mid-flight the slot is released, so a cancelled caller cannot
    /// wedge the key.
    pub async fn run<F, Fut>(&self, key: K, mut operation: F) -> Flight
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        {
            let mut slots = self.slots();
            if let Some(slot) = slots.get_mut(&key) {
                slot.rerun_requested = true;
                tracing::trace!("single-flight: coalesced into active flight");
                return Flight::Coalesced;
            }
            slots.insert(key.clone(), Slot::default());
        }

        let mut release = ReleaseOnDrop {
            flight: self,
            key: Some(key),
        };

        let mut runs = 0;
        loop {
            operation().await;
            runs += 1;
            if !release.take_rerun() {
                break;
            }
        }
        drop(release);
        Flight::Completed { runs }
    }
}

struct ReleaseOnDrop<'a, K: Eq + Hash + Clone> {
    flight: &'a SingleFlight<K>,
    key: Option<K>,
}

impl<K: Eq + Hash + Clone> ReleaseOnDrop<'_, K> {
    /// Consume a pending re-run request. When nobody asked for one the slot
    /// is released here, under the same lock that observed it idle.
    fn take_rerun(&mut self) -> bool {
        let flight = self.flight;
        let Some(key) = self.key.clone() else {
            return false;
        };
        let mut slots = flight.slots();
        if let Some(slot) = slots.get_mut(&key)
            && slot.rerun_requested
        {
            slot.rerun_requested = false;
            return true;
        }
        slots.remove(&key);
        self.key = None;
        false
    }
}

impl<K: Eq + Hash + Clone> Drop for ReleaseOnDrop<'_, K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.flight.slots().remove(&key);
        }
    }
}
