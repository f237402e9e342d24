//! Factory: the public entry point of the broker.
//!
//! Composes the backing-store and database registries. Callers ask the
//! factory to open, delete or enumerate databases for an origin; the
//! factory decides which backing store and which database object serve
//! the request and when a backing store is actually closed.
//!
//! All entry points must run on one logical execution context (the
//! registries are guarded by a single mutex but assume single-writer use),
//! inside a tokio runtime so grace-period timers can be spawned.

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::callbacks::{ConnectionCallbacks, RequestCallbacks, SuccessValue};
use crate::database::{Database, DatabaseHost, DatabaseIdentifier, DatabaseRegistry, EntryKind};
use crate::error::Error;
use crate::storage::backend::{BackendOpenError, StorageBackend};
use crate::storage::backing_store::{
    compute_storage_identifier, BackingStoreRegistry, PendingClose,
};

/// How long a sole-owned backing store stays open after its last user
/// goes away, so a near-immediate reopen does not pay the open cost.
pub const BACKING_STORE_GRACE_PERIOD: Duration = Duration::from_millis(2000);

/// Factory tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactoryConfig {
    pub grace_period: Duration,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            grace_period: BACKING_STORE_GRACE_PERIOD,
        }
    }
}

struct State {
    backing_stores: BackingStoreRegistry,
    databases: DatabaseRegistry,
}

struct Inner {
    backend: Arc<dyn StorageBackend>,
    config: FactoryConfig,
    /// Back-reference handed to timers and databases; `Weak` so a stale
    /// timer can never revive or invoke a destroyed factory.
    self_ref: Weak<Inner>,
    state: Mutex<State>,
}

/// Brokers per-origin backing stores and the databases on top of them.
pub struct Factory {
    inner: Arc<Inner>,
}

impl Factory {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self::with_config(backend, FactoryConfig::default())
    }

    pub fn with_config(backend: Arc<dyn StorageBackend>, config: FactoryConfig) -> Self {
        let inner = Arc::new_cyclic(|self_ref| Inner {
            backend,
            config,
            self_ref: self_ref.clone(),
            state: Mutex::new(State {
                backing_stores: BackingStoreRegistry::new(),
                databases: DatabaseRegistry::new(),
            }),
        });
        Self { inner }
    }

    /// Open a connection to `(origin, name)`, opening the origin's backing
    /// store first if it is not already cached.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        &self,
        name: &str,
        version: u64,
        transaction_id: u64,
        callbacks: &dyn RequestCallbacks,
        connection_callbacks: Arc<dyn ConnectionCallbacks>,
        origin_identifier: &str,
        directory: Option<&Path>,
    ) {
        let identifier = DatabaseIdentifier::new(origin_identifier, name);
        debug!(database = %identifier, version, "open");

        let mut data_loss = crate::callbacks::DataLoss::None;
        let database = {
            let mut state = self.inner.state.lock();
            match state.databases.get(&identifier) {
                Some(database) => database,
                None => {
                    let (handle, loss) = match state.backing_stores.open(
                        &*self.inner.backend,
                        origin_identifier,
                        directory,
                    ) {
                        Ok(opened) => opened,
                        Err(err) => {
                            drop(state);
                            callbacks.on_error(open_error("open", err));
                            return;
                        }
                    };
                    data_loss = loss;
                    let database = match Database::create(
                        identifier.clone(),
                        handle,
                        self.host(),
                        EntryKind::Persistent,
                    ) {
                        Ok(database) => database,
                        Err(err) => {
                            drop(state);
                            callbacks.on_error(err);
                            return;
                        }
                    };
                    state
                        .databases
                        .insert(identifier.clone(), Arc::clone(&database));
                    database
                }
            }
        };

        database.open_connection(
            callbacks,
            connection_callbacks,
            transaction_id,
            version,
            data_loss,
        );
    }

    /// Delete `(origin, name)`. Routes to the live database when one
    /// exists; otherwise runs the delete on a scratch entry that is
    /// reclaimed unconditionally once the delete call returns.
    pub fn delete_database(
        &self,
        name: &str,
        callbacks: &dyn RequestCallbacks,
        origin_identifier: &str,
        directory: Option<&Path>,
    ) {
        let identifier = DatabaseIdentifier::new(origin_identifier, name);
        debug!(database = %identifier, "delete_database");

        // Live connections may exist: never open a duplicate.
        let existing = self.inner.state.lock().databases.get(&identifier);
        if let Some(database) = existing {
            database.delete_database(callbacks);
            return;
        }

        let database = {
            let mut state = self.inner.state.lock();
            let (handle, _data_loss) = match state.backing_stores.open(
                &*self.inner.backend,
                origin_identifier,
                directory,
            ) {
                Ok(opened) => opened,
                Err(err) => {
                    drop(state);
                    callbacks.on_error(open_error("delete_database", err));
                    return;
                }
            };
            let database = match Database::create(
                identifier.clone(),
                handle,
                self.host(),
                EntryKind::Transient,
            ) {
                Ok(database) => database,
                Err(err) => {
                    drop(state);
                    callbacks.on_error(err);
                    return;
                }
            };
            state
                .databases
                .insert(identifier.clone(), Arc::clone(&database));
            database
        };

        database.delete_database(callbacks);

        // Delete-created entries are scratch: reclaim even if the delete
        // protocol retained interest in the handle.
        self.inner.state.lock().databases.remove_transient(&identifier);
    }

    /// Report the database names present in the origin's backing store.
    pub fn database_names(
        &self,
        callbacks: &dyn RequestCallbacks,
        origin_identifier: &str,
        directory: Option<&Path>,
    ) {
        debug!(origin = %origin_identifier, "database_names");
        let names = {
            let mut state = self.inner.state.lock();
            match state
                .backing_stores
                .open(&*self.inner.backend, origin_identifier, directory)
            {
                Ok((handle, _)) => handle.store().database_names(),
                Err(err) => {
                    drop(state);
                    callbacks.on_error(open_error("database_names", err));
                    return;
                }
            }
        };
        match names {
            Ok(names) => callbacks.on_success(SuccessValue::DatabaseNames(names)),
            Err(err) => callbacks.on_error(err),
        }
    }

    /// Live databases of an origin, lexicographic by name. Pure read.
    pub fn open_databases_for_origin(&self, origin_identifier: &str) -> Vec<Arc<Database>> {
        self.inner.state.lock().databases.for_origin(origin_identifier)
    }

    /// Stop every pending close timer and drop all registry state,
    /// without waiting out grace periods. Expiry logic can never run
    /// after this returns.
    pub fn teardown(&self) {
        info!("factory teardown");
        let mut state = self.inner.state.lock();
        state.backing_stores.teardown();
        state.databases.clear();
    }

    pub fn is_backing_store_open_for_testing(&self, origin_identifier: &str) -> bool {
        self.inner.state.lock().backing_stores.is_open(origin_identifier)
    }

    pub fn is_grace_timer_armed_for_testing(&self, origin_identifier: &str) -> bool {
        let state = self.inner.state.lock();
        state
            .backing_stores
            .handle(&compute_storage_identifier(origin_identifier))
            .map(|handle| handle.close_timer().is_armed())
            .unwrap_or(false)
    }

    fn host(&self) -> Weak<dyn DatabaseHost> {
        let host: Weak<dyn DatabaseHost> = self.inner.self_ref.clone();
        host
    }
}

impl Inner {
    fn schedule_grace_close(&self, pending: PendingClose) {
        let weak = self.self_ref.clone();
        let grace = self.config.grace_period;
        let PendingClose {
            storage_identifier,
            generation,
        } = pending;

        let task_identifier = storage_identifier.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_grace_period_expired(&task_identifier, generation);
            }
        });

        // Hand the sleeper to the timer so stop() can abort it. The store
        // may already be gone if a forced close won the race.
        let state = self.state.lock();
        match state.backing_stores.handle(&storage_identifier) {
            Some(handle) => handle.close_timer().attach(generation, task),
            None => task.abort(),
        }
    }

    fn on_grace_period_expired(&self, storage_identifier: &str, generation: u64) {
        debug!(storage = %storage_identifier, "grace period expired");
        self.state
            .lock()
            .backing_stores
            .on_grace_period_expired(storage_identifier, generation);
    }
}

impl DatabaseHost for Inner {
    fn release_database(
        &self,
        identifier: &DatabaseIdentifier,
        storage_identifier: &str,
        forced_close: bool,
    ) {
        let pending = {
            let mut state = self.state.lock();
            let removed = state.databases.remove(identifier);
            debug_assert!(removed.is_some(), "released database not registered");
            if let Some(database) = &removed {
                debug_assert!(
                    !database.has_backing_store(),
                    "database released with live backing-store reference"
                );
            }
            // No grace period on a forced close: the initiator assumes the
            // backing store is fully released once connections are gone.
            state.backing_stores.release(storage_identifier, forced_close)
        };
        if let Some(pending) = pending {
            self.schedule_grace_close(pending);
        }
    }
}

fn open_error(operation: &str, err: BackendOpenError) -> Error {
    match err {
        BackendOpenError::DiskFull => Error::Quota(format!(
            "encountered full disk while opening backing store for {operation}"
        )),
        BackendOpenError::Failed(message) => Error::BackingStoreOpen(format!(
            "internal error opening backing store for {operation}: {message}"
        )),
    }
}
