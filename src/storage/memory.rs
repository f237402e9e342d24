//! In-memory storage backend
//!
//! Backs directory-less (session-only) opens, and doubles as a throwaway
//! stand-in for a durable backend in tests: stores opened with a directory
//! keep their database names across close/reopen, stores opened in memory
//! discard them on close.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::callbacks::DataLoss;
use crate::error::Result;
use crate::storage::backend::{BackendOpenError, BackingStore, OpenOutcome, StorageBackend};

type NameMap = Arc<Mutex<HashMap<String, BTreeSet<String>>>>;

/// In-memory [`StorageBackend`].
#[derive(Clone, Default)]
pub struct MemoryBackend {
    names: NameMap,
}

impl MemoryBackend {
    /// Create a new backend with no stored state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of storage units with recorded state.
    pub fn len(&self) -> usize {
        self.names.lock().len()
    }

    /// Check if no storage unit has recorded state.
    pub fn is_empty(&self) -> bool {
        self.names.lock().is_empty()
    }

    /// Drop all recorded state.
    pub fn clear(&self) {
        self.names.lock().clear();
    }
}

impl StorageBackend for MemoryBackend {
    fn open(
        &self,
        _origin_identifier: &str,
        _directory: &Path,
        storage_identifier: &str,
    ) -> std::result::Result<OpenOutcome, BackendOpenError> {
        Ok(OpenOutcome {
            store: Box::new(MemoryStore {
                key: storage_identifier.to_string(),
                durable: true,
                names: Arc::clone(&self.names),
            }),
            data_loss: DataLoss::None,
        })
    }

    fn open_in_memory(
        &self,
        storage_identifier: &str,
    ) -> std::result::Result<Box<dyn BackingStore>, BackendOpenError> {
        Ok(Box::new(MemoryStore {
            key: storage_identifier.to_string(),
            durable: false,
            names: Arc::clone(&self.names),
        }))
    }
}

struct MemoryStore {
    key: String,
    durable: bool,
    names: NameMap,
}

impl BackingStore for MemoryStore {
    fn database_names(&self) -> Result<Vec<String>> {
        Ok(self
            .names
            .lock()
            .get(&self.key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn create_database(&self, name: &str) -> Result<()> {
        self.names
            .lock()
            .entry(self.key.clone())
            .or_default()
            .insert(name.to_string());
        Ok(())
    }

    fn delete_database(&self, name: &str) -> Result<()> {
        if let Some(set) = self.names.lock().get_mut(&self.key) {
            set.remove(name);
        }
        Ok(())
    }

    fn close(&self) {
        if !self.durable {
            self.names.lock().remove(&self.key);
        }
    }
}
