//! Completion callbacks for broker requests.
//!
//! Every factory entry point takes a callback object instead of returning a
//! result directly: the surrounding system routes responses back to the
//! requesting execution context asynchronously. A callback object is
//! single-use - exactly one of [`RequestCallbacks::on_success`] or
//! [`RequestCallbacks::on_error`] fires per request, at most once.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Error;

/// How much previously persisted data survived a backing-store open.
///
/// A persistent open may find the prior session's data unreadable and
/// recover by starting fresh; callers are told so they can surface it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataLoss {
    #[default]
    None,
    Total,
}

/// Successful terminal value of a factory request.
#[derive(Debug, Clone, PartialEq)]
pub enum SuccessValue {
    /// A connection to the named database was established.
    Opened {
        name: String,
        version: u64,
        data_loss: DataLoss,
    },
    /// The database names present in an origin's backing store.
    DatabaseNames(Vec<String>),
    /// A database was deleted.
    Deleted,
}

/// Single-use completion object for one factory request.
pub trait RequestCallbacks: Send + Sync {
    fn on_success(&self, value: SuccessValue);
    fn on_error(&self, error: Error);
}

/// Callbacks attached to one live database connection.
pub trait ConnectionCallbacks: Send + Sync {
    /// The connection is being closed from the broker side (explicit
    /// teardown of the origin's storage), not by the caller.
    fn on_forced_close(&self);
}

/// Recording callback object for tests and diagnostics.
///
/// Collects every delivered outcome so a test can assert on exactly what
/// fired and in what order.
#[derive(Clone, Default)]
pub struct CollectedCallbacks {
    outcomes: Arc<Mutex<Vec<Outcome>>>,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Success(SuccessValue),
    Error(String),
}

impl CollectedCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcomes(&self) -> Vec<Outcome> {
        self.outcomes.lock().clone()
    }

    /// The single success value, if the request succeeded.
    pub fn success(&self) -> Option<SuccessValue> {
        self.outcomes.lock().iter().find_map(|o| match o {
            Outcome::Success(v) => Some(v.clone()),
            Outcome::Error(_) => None,
        })
    }

    /// The single error message, if the request failed.
    pub fn error(&self) -> Option<String> {
        self.outcomes.lock().iter().find_map(|o| match o {
            Outcome::Error(msg) => Some(msg.clone()),
            Outcome::Success(_) => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.lock().is_empty()
    }
}

impl RequestCallbacks for CollectedCallbacks {
    fn on_success(&self, value: SuccessValue) {
        let mut outcomes = self.outcomes.lock();
        debug_assert!(outcomes.is_empty(), "completion object fired twice");
        outcomes.push(Outcome::Success(value));
    }

    fn on_error(&self, error: Error) {
        let mut outcomes = self.outcomes.lock();
        debug_assert!(outcomes.is_empty(), "completion object fired twice");
        outcomes.push(Outcome::Error(error.to_string()));
    }
}

/// Recording connection callbacks for tests.
#[derive(Clone, Default)]
pub struct CollectedConnection {
    forced_closes: Arc<Mutex<u32>>,
}

impl CollectedConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forced_close_count(&self) -> u32 {
        *self.forced_closes.lock()
    }
}

impl ConnectionCallbacks for CollectedConnection {
    fn on_forced_close(&self) {
        *self.forced_closes.lock() += 1;
    }
}
