//! Storage backend traits
//!
//! The broker never touches disk itself. It talks to a [`StorageBackend`]
//! that knows how to open one storage unit per origin, and to the
//! [`BackingStore`] objects that backend hands out. Record encoding,
//! transactions and versioning all live behind these seams.

use std::path::Path;
use thiserror::Error;

use crate::callbacks::DataLoss;
use crate::error::Result;

/// Why a backend-level open failed.
///
/// A full disk is distinguished from every other failure so the caller can
/// be given a quota error instead of a generic one.
#[derive(Error, Debug)]
pub enum BackendOpenError {
    #[error("disk full")]
    DiskFull,
    #[error("{0}")]
    Failed(String),
}

/// Result of a successful persistent open.
pub struct OpenOutcome {
    pub store: Box<dyn BackingStore>,
    /// Whether data from a prior session had to be discarded to open.
    pub data_loss: DataLoss,
}

/// An open storage unit for one origin.
///
/// One instance backs every database of its origin. All calls are
/// synchronous; any suspension lives inside the implementation.
pub trait BackingStore: Send + Sync {
    /// List the database names present in this store.
    fn database_names(&self) -> Result<Vec<String>>;

    /// Create the named database's metadata if it does not exist yet.
    /// Idempotent.
    fn create_database(&self, name: &str) -> Result<()>;

    /// Drop the named database and its data.
    fn delete_database(&self, name: &str) -> Result<()>;

    /// The store is being evicted; flush and release resources.
    fn close(&self);
}

/// Opens backing stores on behalf of the broker.
pub trait StorageBackend: Send + Sync {
    /// Open the persistent store for `origin_identifier` under `directory`.
    ///
    /// `storage_identifier` is the broker's stable cache key for the store;
    /// implementations use it to address on-disk state.
    fn open(
        &self,
        origin_identifier: &str,
        directory: &Path,
        storage_identifier: &str,
    ) -> std::result::Result<OpenOutcome, BackendOpenError>;

    /// Open a store with no on-disk presence. Its contents live and die
    /// with the handle.
    fn open_in_memory(
        &self,
        storage_identifier: &str,
    ) -> std::result::Result<Box<dyn BackingStore>, BackendOpenError>;
}
