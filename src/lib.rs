// OriginStore - per-origin database storage broker
//
// Brokers access to per-origin backing stores and the logical databases
// built on top of them. Backing stores are expensive to open, so the
// broker shares one handle per origin and keeps it alive for a short
// grace period after its last user goes away.

#![warn(rust_2018_idioms)]

pub mod callbacks;
pub mod database;
pub mod factory;
pub mod storage;

// Re-exports for convenience
pub use callbacks::{ConnectionCallbacks, DataLoss, RequestCallbacks, SuccessValue};
pub use database::{Database, DatabaseIdentifier};
pub use factory::{Factory, FactoryConfig};
pub use storage::{BackingStore, MemoryBackend, StorageBackend};

/// Broker error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        /// The backing store could not be opened for a reason other than
        /// a full disk.
        #[error("error opening backing store: {0}")]
        BackingStoreOpen(String),

        /// The backing store could not be opened because the disk is full.
        /// Reported separately so callers can surface a quota-specific
        /// error instead of a generic failure.
        #[error("disk full while opening backing store: {0}")]
        Quota(String),

        /// The backing store opened but the logical database object could
        /// not be constructed on top of it.
        #[error("error creating database backend: {0}")]
        DatabaseCreate(String),

        /// A collaborator (backing store or database protocol) failed
        /// after open.
        #[error("storage error: {0}")]
        Storage(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
