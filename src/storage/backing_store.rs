//! Backing-store handles and the per-factory registry that shares them.
//!
//! Opening a backing store is expensive, so the registry keeps exactly one
//! shared handle per storage identifier and evicts it lazily: when the
//! registry becomes the sole holder, the handle is kept around for a short
//! grace period so that a near-immediate reopen is cheap. A forced release
//! skips the grace period entirely.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::callbacks::DataLoss;
use crate::storage::backend::{BackendOpenError, BackingStore, StorageBackend};

/// Suffix appended to origin identifiers to form the storage identifier.
/// Bumped when the backing-store layout changes incompatibly.
const STORAGE_FORMAT_VERSION: &str = "@1";

pub(crate) fn compute_storage_identifier(origin_identifier: &str) -> String {
    format!("{origin_identifier}{STORAGE_FORMAT_VERSION}")
}

/// State of a handle's delayed-close timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Idle,
    Armed,
    Fired,
}

/// One-shot delayed-close timer attached to a [`BackingStoreHandle`].
///
/// The timer itself does not know what "close" means; it only tracks
/// whether a close is scheduled and which scheduling generation is
/// current. Stopping bumps the generation, so an already-spawned task
/// whose generation no longer matches can never act - aborting the task
/// alone is not enough once it is past its sleep.
pub struct CloseTimer {
    inner: Mutex<TimerInner>,
}

struct TimerInner {
    state: TimerState,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl CloseTimer {
    fn new() -> Self {
        Self {
            inner: Mutex::new(TimerInner {
                state: TimerState::Idle,
                generation: 0,
                task: None,
            }),
        }
    }

    /// Arm the timer and return the generation token the eventual expiry
    /// must present. The timer must be idle.
    pub(crate) fn arm(&self) -> u64 {
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.state, TimerState::Idle, "close timer armed twice");
        inner.state = TimerState::Armed;
        inner.generation += 1;
        inner.generation
    }

    /// Hand the spawned sleeper task to the timer so a later stop can
    /// abort it. If the timer was stopped between arm and spawn the task
    /// is aborted on the spot.
    pub(crate) fn attach(&self, generation: u64, task: JoinHandle<()>) {
        let mut inner = self.inner.lock();
        if inner.state == TimerState::Armed && inner.generation == generation {
            inner.task = Some(task);
        } else {
            task.abort();
        }
    }

    /// Stop the timer. Idempotent; stopping an idle timer is a no-op.
    pub(crate) fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.state = TimerState::Idle;
        // Invalidate any expiry already in flight.
        inner.generation += 1;
        if let Some(task) = inner.task.take() {
            task.abort();
        }
    }

    /// Transition to fired if `generation` is still the live armed
    /// generation. Returns false for stale expiries, which must do nothing.
    pub(crate) fn try_fire(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != TimerState::Armed || inner.generation != generation {
            return false;
        }
        inner.state = TimerState::Fired;
        inner.task = None;
        true
    }

    pub fn is_armed(&self) -> bool {
        self.inner.lock().state == TimerState::Armed
    }
}

impl Drop for CloseTimer {
    fn drop(&mut self) {
        if let Some(task) = self.inner.get_mut().task.take() {
            task.abort();
        }
    }
}

/// Shared, reference-counted handle to one origin's open backing store.
///
/// Jointly owned (via `Arc`) by the registry and by every live database
/// that uses the origin's storage. The strong count doubles as the
/// handle's reference count: the registry is the sole holder exactly when
/// the count is one.
pub struct BackingStoreHandle {
    storage_identifier: String,
    in_memory: bool,
    store: Box<dyn BackingStore>,
    close_timer: CloseTimer,
}

impl BackingStoreHandle {
    fn new(storage_identifier: String, in_memory: bool, store: Box<dyn BackingStore>) -> Self {
        Self {
            storage_identifier,
            in_memory,
            store,
            close_timer: CloseTimer::new(),
        }
    }

    pub fn storage_identifier(&self) -> &str {
        &self.storage_identifier
    }

    pub fn is_in_memory(&self) -> bool {
        self.in_memory
    }

    pub fn store(&self) -> &dyn BackingStore {
        self.store.as_ref()
    }

    pub(crate) fn close_timer(&self) -> &CloseTimer {
        &self.close_timer
    }
}

impl Drop for BackingStoreHandle {
    // The store is closed when the last holder lets go, not merely when
    // the registry entry is erased.
    fn drop(&mut self) {
        self.store.close();
    }
}

/// A grace close the registry wants scheduled: after the grace period,
/// call [`BackingStoreRegistry::on_grace_period_expired`] with this token.
#[must_use]
pub(crate) struct PendingClose {
    pub storage_identifier: String,
    pub generation: u64,
}

/// Per-factory map of storage identifier to open backing-store handle.
///
/// Single-writer: only the owning factory mutates this, from one logical
/// execution context.
#[derive(Default)]
pub struct BackingStoreRegistry {
    stores: HashMap<String, Arc<BackingStoreHandle>>,
    /// Storage identifiers of in-memory stores, whose lifetime is bound to
    /// the factory rather than to disk. Mutually exclusive with the
    /// disk-backed population for any one factory.
    session_only: HashSet<String>,
}

impl BackingStoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or reuse) the backing store for an origin. No directory means
    /// an in-memory store.
    pub(crate) fn open(
        &mut self,
        backend: &dyn StorageBackend,
        origin_identifier: &str,
        directory: Option<&Path>,
    ) -> Result<(Arc<BackingStoreHandle>, DataLoss), BackendOpenError> {
        let storage_identifier = compute_storage_identifier(origin_identifier);

        if let Some(handle) = self.stores.get(&storage_identifier) {
            // A pending grace close must not take the handle out from
            // under the new user.
            handle.close_timer().stop();
            return Ok((Arc::clone(handle), DataLoss::None));
        }

        let open_in_memory = directory.is_none();
        let (store, data_loss) = match directory {
            None => (backend.open_in_memory(&storage_identifier)?, DataLoss::None),
            Some(directory) => {
                let outcome = backend.open(origin_identifier, directory, &storage_identifier)?;
                (outcome.store, outcome.data_loss)
            }
        };

        let handle = Arc::new(BackingStoreHandle::new(
            storage_identifier.clone(),
            open_in_memory,
            store,
        ));
        self.stores
            .insert(storage_identifier.clone(), Arc::clone(&handle));
        if open_in_memory {
            self.session_only.insert(storage_identifier.clone());
        }
        // All stores associated with one factory must be of the same kind.
        debug_assert!(self.session_only.is_empty() || open_in_memory);

        debug!(
            storage = %storage_identifier,
            in_memory = open_in_memory,
            data_loss = ?data_loss,
            "opened backing store"
        );
        Ok((handle, data_loss))
    }

    /// Release the registry's interest in a handle. Does nothing unless the
    /// registry is the sole remaining holder. `immediate` closes on the
    /// spot; otherwise the caller must schedule the returned grace close.
    pub(crate) fn release(
        &mut self,
        storage_identifier: &str,
        immediate: bool,
    ) -> Option<PendingClose> {
        // Only close if this is the last reference.
        if !self.has_sole_reference(storage_identifier) {
            return None;
        }

        if immediate {
            self.close_backing_store(storage_identifier);
            return None;
        }

        // Keep the store around for a short period so a re-open is fast,
        // unless something else acquires it in the meantime.
        let handle = self.stores.get(storage_identifier)?;
        let generation = handle.close_timer().arm();
        Some(PendingClose {
            storage_identifier: storage_identifier.to_string(),
            generation,
        })
    }

    /// A grace period elapsed. Another reference may have appeared since
    /// the close was scheduled, so sole ownership is checked again before
    /// anything is torn down.
    pub(crate) fn on_grace_period_expired(&mut self, storage_identifier: &str, generation: u64) {
        {
            let Some(handle) = self.stores.get(storage_identifier) else {
                return;
            };
            if !handle.close_timer().try_fire(generation) {
                return;
            }
        }
        if self.has_sole_reference(storage_identifier) {
            self.close_backing_store(storage_identifier);
        } else if let Some(handle) = self.stores.get(storage_identifier) {
            handle.close_timer().stop();
        }
    }

    /// Whether the registry's map entry is the only strong reference to the
    /// handle. The count is read through the borrowed map entry so the
    /// check itself never counts as a holder.
    pub(crate) fn has_sole_reference(&self, storage_identifier: &str) -> bool {
        match self.stores.get(storage_identifier) {
            Some(handle) => Arc::strong_count(handle) == 1,
            None => {
                debug_assert!(false, "sole-reference check for unknown store");
                false
            }
        }
    }

    fn close_backing_store(&mut self, storage_identifier: &str) {
        let Some(handle) = self.stores.remove(storage_identifier) else {
            debug_assert!(false, "closing unknown backing store");
            return;
        };
        // A forced close can arrive while the grace timer is still running.
        handle.close_timer().stop();
        self.session_only.remove(storage_identifier);
        debug!(storage = %storage_identifier, "closed backing store");
    }

    /// Stop every pending timer and drop all entries, grace periods
    /// notwithstanding. A timer must never run once its owner is gone.
    pub(crate) fn teardown(&mut self) {
        for handle in self.stores.values() {
            handle.close_timer().stop();
        }
        self.stores.clear();
        self.session_only.clear();
    }

    pub(crate) fn handle(&self, storage_identifier: &str) -> Option<&Arc<BackingStoreHandle>> {
        self.stores.get(storage_identifier)
    }

    pub fn is_open(&self, origin_identifier: &str) -> bool {
        self.stores
            .contains_key(&compute_storage_identifier(origin_identifier))
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}
