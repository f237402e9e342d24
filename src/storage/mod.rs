//! Storage layer
//!
//! # Architecture
//!
//! Per-origin storage is brokered in two layers:
//!
//! ```text
//! Factory
//!   └─→ BackingStoreRegistry (storage identifier → shared handle)
//!        └─→ StorageBackend / BackingStore (external, on-disk format out of scope)
//! ```
//!
//! ## Handle sharing
//!
//! Every database of an origin shares one [`BackingStoreHandle`]. The
//! registry evicts a handle only once it is the sole holder, and even then
//! keeps it open for a grace period so an immediate reopen does not pay
//! the full open cost again.
//!
//! ## Implementations
//!
//! - [`MemoryBackend`] - in-memory backend for session-only stores
//! - [`MockBackend`] - fault-injecting backend for tests

pub mod backend;
pub(crate) mod backing_store;
pub mod memory;
pub mod mock;

pub use backend::{BackendOpenError, BackingStore, OpenOutcome, StorageBackend};
pub use backing_store::BackingStoreHandle;
pub use memory::MemoryBackend;
pub use mock::MockBackend;
