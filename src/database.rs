//! Logical databases and their per-factory registry.
//!
//! A [`Database`] represents one named database of one origin. It holds a
//! reference to the origin's shared backing store for as long as it has
//! live connections, and hands that reference back to the factory when the
//! last connection goes away. The connection protocol itself (versioning,
//! transactions) lives behind the backing store and is not modeled here
//! beyond the bookkeeping the release path needs.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::callbacks::{ConnectionCallbacks, DataLoss, RequestCallbacks, SuccessValue};
use crate::error::{Error, Result};
use crate::storage::backing_store::BackingStoreHandle;

/// Unique key of a logical database: origin identifier plus name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatabaseIdentifier {
    origin: String,
    name: String,
}

impl DatabaseIdentifier {
    pub fn new(origin: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            name: name.into(),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for DatabaseIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.origin, self.name)
    }
}

/// Why a registry entry exists.
///
/// Open-created entries persist for connection routing; entries created
/// only to run a delete are scratch and reclaimed as soon as the delete
/// call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Persistent,
    Transient,
}

/// The factory surface a database calls back into when it releases its
/// backing store.
pub(crate) trait DatabaseHost: Send + Sync {
    fn release_database(
        &self,
        identifier: &DatabaseIdentifier,
        storage_identifier: &str,
        forced_close: bool,
    );
}

struct DatabaseInner {
    backing_store: Option<Arc<BackingStoreHandle>>,
    connections: Vec<Arc<dyn ConnectionCallbacks>>,
    version: u64,
}

/// One logical database of one origin.
pub struct Database {
    identifier: DatabaseIdentifier,
    kind: EntryKind,
    host: Weak<dyn DatabaseHost>,
    inner: Mutex<DatabaseInner>,
}

impl Database {
    /// Construct a database on top of an open backing store, creating its
    /// metadata in the store if it does not exist yet.
    pub(crate) fn create(
        identifier: DatabaseIdentifier,
        backing_store: Arc<BackingStoreHandle>,
        host: Weak<dyn DatabaseHost>,
        kind: EntryKind,
    ) -> Result<Arc<Self>> {
        backing_store
            .store()
            .create_database(identifier.name())
            .map_err(|err| {
                Error::DatabaseCreate(format!("creating database backend for {identifier}: {err}"))
            })?;
        Ok(Arc::new(Self {
            identifier,
            kind,
            host,
            inner: Mutex::new(DatabaseInner {
                backing_store: Some(backing_store),
                connections: Vec::new(),
                version: 0,
            }),
        }))
    }

    pub fn identifier(&self) -> &DatabaseIdentifier {
        &self.identifier
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn has_backing_store(&self) -> bool {
        self.inner.lock().backing_store.is_some()
    }

    /// Establish a connection. The full upgrade/transaction protocol is
    /// delegated to the storage layer; here a connection only pins the
    /// backing store and records where forced-close notifications go.
    pub fn open_connection(
        &self,
        callbacks: &dyn RequestCallbacks,
        connection_callbacks: Arc<dyn ConnectionCallbacks>,
        transaction_id: u64,
        version: u64,
        data_loss: DataLoss,
    ) {
        let granted = {
            let mut inner = self.inner.lock();
            inner.connections.push(connection_callbacks);
            if version > inner.version {
                inner.version = version;
            }
            inner.version
        };
        debug!(
            database = %self.identifier,
            transaction = transaction_id,
            version = granted,
            "opened connection"
        );
        callbacks.on_success(SuccessValue::Opened {
            name: self.identifier.name().to_string(),
            version: granted,
            data_loss,
        });
    }

    /// Close one connection. When the last one goes, the backing-store
    /// reference is dropped first and the factory is then told to release
    /// it; `forced` skips the grace period.
    pub fn close_connection(&self, forced: bool) {
        let released = {
            let mut inner = self.inner.lock();
            debug_assert!(!inner.connections.is_empty(), "no connection to close");
            inner.connections.pop();
            self.release_if_unused(&mut inner)
        };
        self.notify_released(released, forced);
    }

    /// Delete this database's data. With live connections the entry stays
    /// routable afterward; without any, the backing store is released.
    pub fn delete_database(&self, callbacks: &dyn RequestCallbacks) {
        let result = {
            let inner = self.inner.lock();
            match &inner.backing_store {
                Some(handle) => handle.store().delete_database(self.identifier.name()),
                None => Err(Error::Storage(format!(
                    "backing store already released for {}",
                    self.identifier
                ))),
            }
        };
        match result {
            Ok(()) => {
                debug!(database = %self.identifier, "deleted database");
                callbacks.on_success(SuccessValue::Deleted);
            }
            Err(err) => {
                callbacks.on_error(err);
                return;
            }
        }

        let released = {
            let mut inner = self.inner.lock();
            if inner.connections.is_empty() {
                self.release_if_unused(&mut inner)
            } else {
                None
            }
        };
        self.notify_released(released, false);
    }

    /// Sever every connection immediately and release the backing store
    /// with no grace period. Used on explicit origin teardown.
    pub fn forced_close(&self) {
        let (connections, released) = {
            let mut inner = self.inner.lock();
            let connections = std::mem::take(&mut inner.connections);
            let released = self.release_if_unused(&mut inner);
            (connections, released)
        };
        for connection in connections {
            connection.on_forced_close();
        }
        self.notify_released(released, true);
    }

    /// Drop the backing-store reference while `inner` is still locked, so
    /// the reference is provably gone before the factory counts holders.
    fn release_if_unused(&self, inner: &mut DatabaseInner) -> Option<String> {
        if !inner.connections.is_empty() {
            return None;
        }
        let handle = inner.backing_store.take()?;
        let storage_identifier = handle.storage_identifier().to_string();
        drop(handle);
        Some(storage_identifier)
    }

    fn notify_released(&self, storage_identifier: Option<String>, forced: bool) {
        let Some(storage_identifier) = storage_identifier else {
            return;
        };
        if let Some(host) = self.host.upgrade() {
            host.release_database(&self.identifier, &storage_identifier, forced);
        }
    }
}

/// Per-factory map of (origin, name) to live database. Ordered, so
/// per-origin listings come out lexicographic by name.
#[derive(Default)]
pub struct DatabaseRegistry {
    databases: BTreeMap<DatabaseIdentifier, Arc<Database>>,
}

impl DatabaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identifier: &DatabaseIdentifier) -> Option<Arc<Database>> {
        self.databases.get(identifier).cloned()
    }

    pub fn insert(&mut self, identifier: DatabaseIdentifier, database: Arc<Database>) {
        let previous = self.databases.insert(identifier, database);
        debug_assert!(previous.is_none(), "database registered twice");
    }

    pub fn remove(&mut self, identifier: &DatabaseIdentifier) -> Option<Arc<Database>> {
        self.databases.remove(identifier)
    }

    /// Reclaim a delete-created entry. Leaves persistent entries alone.
    pub fn remove_transient(&mut self, identifier: &DatabaseIdentifier) {
        if let Some(database) = self.databases.get(identifier) {
            if database.kind() == EntryKind::Transient {
                self.databases.remove(identifier);
            }
        }
    }

    pub fn for_origin(&self, origin: &str) -> Vec<Arc<Database>> {
        self.databases
            .iter()
            .filter(|(identifier, _)| identifier.origin() == origin)
            .map(|(_, database)| Arc::clone(database))
            .collect()
    }

    pub fn contains(&self, identifier: &DatabaseIdentifier) -> bool {
        self.databases.contains_key(identifier)
    }

    pub fn clear(&mut self) {
        self.databases.clear();
    }

    pub fn len(&self) -> usize {
        self.databases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.databases.is_empty()
    }
}
