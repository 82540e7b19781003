//! Consumer-Facing Sink Handle
//!
//! [`Sink`] is held by the component that owns the downstream transport,
//! typically on a single thread. It toggles writability to apply or release
//! back-pressure and signals termination of the consumer side.

use std::fmt;
use std::sync::Arc;

use super::delegate::WriterDelegate;
use super::state::WriterStats;
use super::storage::Storage;
use crate::errors::BridgeError;

// ----------------------------------------------------------------------------
// Sink Handle
// ----------------------------------------------------------------------------

/// Consumer-facing handle of a writer bridge
///
/// Dropping the last `Sink` clone behaves like [`finish`](Sink::finish):
/// suspended producers fail with [`BridgeError::AlreadyFinished`] and the
/// delegate terminates.
pub struct Sink<D: WriterDelegate> {
    shared: Arc<SinkShared<D>>,
}

struct SinkShared<D: WriterDelegate> {
    storage: Arc<Storage<D>>,
}

impl<D: WriterDelegate> Sink<D> {
    pub(crate) fn new(storage: Arc<Storage<D>>) -> Self {
        Self {
            shared: Arc::new(SinkShared { storage }),
        }
    }

    /// Toggle the writability flag.
    ///
    /// Turning writability on drains buffered elements to the delegate and
    /// resumes every suspended producer. Turning it off is recorded and
    /// returns immediately; producers suspend on their next write. Setting
    /// the current value again is a no-op. Safe to call from inside a
    /// `did_yield` callout.
    pub fn set_writability(&self, writable: bool) {
        self.shared.storage.set_writability(writable);
    }

    /// Finish the sink side.
    ///
    /// Idempotent. Suspended producers fail with
    /// [`BridgeError::AlreadyFinished`], their queued elements are discarded,
    /// and the delegate's `did_terminate` fires exactly once.
    pub fn finish(&self) {
        self.shared.storage.sink_finish(None);
    }

    /// Finish the sink side with an error.
    ///
    /// Suspended producers fail with the supplied error, which is also
    /// forwarded to the delegate's `did_terminate`.
    pub fn finish_with_error<E>(&self, error: E)
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.shared
            .storage
            .sink_finish(Some(BridgeError::terminated(error)));
    }

    /// Snapshot the writer's internal state for diagnostics.
    pub fn stats(&self) -> WriterStats {
        self.shared.storage.stats()
    }
}

impl<D: WriterDelegate> Clone for Sink<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D: WriterDelegate> fmt::Debug for Sink<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink").finish_non_exhaustive()
    }
}

impl<D: WriterDelegate> Drop for SinkShared<D> {
    fn drop(&mut self) {
        self.storage.sink_finish(None);
    }
}
