//! Mock storage backend for testing
//!
//! Wraps [`MemoryBackend`] with failure injection (generic open failure,
//! disk full, data loss) and open counters so tests can observe how often
//! the broker really reaches the backend.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::callbacks::DataLoss;
use crate::error::Error;
use crate::storage::backend::{BackendOpenError, BackingStore, OpenOutcome, StorageBackend};
use crate::storage::memory::MemoryBackend;

/// Fault-injecting [`StorageBackend`] for tests.
#[derive(Clone, Default)]
pub struct MockBackend {
    inner: MemoryBackend,
    fail_opens: Arc<AtomicBool>,
    fail_creates: Arc<AtomicBool>,
    disk_full: Arc<AtomicBool>,
    lose_data: Arc<AtomicBool>,
    open_count: Arc<AtomicU32>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent open fail with a generic error.
    pub fn fail_opens(&self, fail: bool) {
        self.fail_opens.store(fail, Ordering::SeqCst);
    }

    /// Make `create_database` fail on every store this backend hands out,
    /// while the opens themselves still succeed.
    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent persistent open fail with disk-full.
    pub fn set_disk_full(&self, full: bool) {
        self.disk_full.store(full, Ordering::SeqCst);
    }

    /// Report total data loss on the next successful persistent open.
    pub fn set_data_loss(&self, lose: bool) {
        self.lose_data.store(lose, Ordering::SeqCst);
    }

    /// How many opens actually reached the backend (cache hits in the
    /// broker never do).
    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::SeqCst)
    }
}

impl StorageBackend for MockBackend {
    fn open(
        &self,
        origin_identifier: &str,
        directory: &Path,
        storage_identifier: &str,
    ) -> Result<OpenOutcome, BackendOpenError> {
        if self.disk_full.load(Ordering::SeqCst) {
            return Err(BackendOpenError::DiskFull);
        }
        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(BackendOpenError::Failed("injected open failure".into()));
        }
        self.open_count.fetch_add(1, Ordering::SeqCst);
        let mut outcome = self.inner.open(origin_identifier, directory, storage_identifier)?;
        if self.lose_data.swap(false, Ordering::SeqCst) {
            outcome.data_loss = DataLoss::Total;
        }
        outcome.store = Box::new(FaultStore {
            inner: outcome.store,
            fail_creates: Arc::clone(&self.fail_creates),
        });
        Ok(outcome)
    }

    fn open_in_memory(
        &self,
        storage_identifier: &str,
    ) -> Result<Box<dyn BackingStore>, BackendOpenError> {
        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(BackendOpenError::Failed("injected open failure".into()));
        }
        self.open_count.fetch_add(1, Ordering::SeqCst);
        let store = self.inner.open_in_memory(storage_identifier)?;
        Ok(Box::new(FaultStore {
            inner: store,
            fail_creates: Arc::clone(&self.fail_creates),
        }))
    }
}

/// Store wrapper that injects per-call failures; everything else passes
/// through to the wrapped [`MemoryBackend`] store.
struct FaultStore {
    inner: Box<dyn BackingStore>,
    fail_creates: Arc<AtomicBool>,
}

impl BackingStore for FaultStore {
    fn database_names(&self) -> crate::error::Result<Vec<String>> {
        self.inner.database_names()
    }

    fn create_database(&self, name: &str) -> crate::error::Result<()> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(Error::Storage("injected create failure".into()));
        }
        self.inner.create_database(name)
    }

    fn delete_database(&self, name: &str) -> crate::error::Result<()> {
        self.inner.delete_database(name)
    }

    fn close(&self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_full_injection() {
        let backend = MockBackend::new();
        backend.set_disk_full(true);
        let err = backend
            .open("http://a.example", Path::new("/tmp/data"), "http://a.example@1")
            .err()
            .expect("open should fail");
        assert!(matches!(err, BackendOpenError::DiskFull));
        assert_eq!(backend.open_count(), 0);
    }

    #[test]
    fn test_create_failure_injection_leaves_open_working() {
        let backend = MockBackend::new();
        backend.fail_creates(true);
        let outcome = backend
            .open("http://a.example", Path::new("/tmp/data"), "http://a.example@1")
            .expect("open failed");
        assert_eq!(backend.open_count(), 1, "open itself must still succeed");
        assert!(outcome.store.create_database("db1").is_err());

        backend.fail_creates(false);
        outcome.store.create_database("db1").expect("create failed");
        assert_eq!(
            outcome.store.database_names().expect("names failed"),
            vec!["db1".to_string()]
        );
    }

    #[test]
    fn test_data_loss_reported_once() {
        let backend = MockBackend::new();
        backend.set_data_loss(true);
        let outcome = backend
            .open("http://a.example", Path::new("/tmp/data"), "http://a.example@1")
            .expect("open failed");
        assert_eq!(outcome.data_loss, DataLoss::Total);

        let outcome = backend
            .open("http://a.example", Path::new("/tmp/data"), "http://a.example@1")
            .expect("open failed");
        assert_eq!(outcome.data_loss, DataLoss::None);
        assert_eq!(backend.open_count(), 2);
    }
}
