//! Producer-Facing Writer Handle
//!
//! [`Writer`] accepts elements from any number of concurrent producers,
//! suspending them while the sink applies back-pressure. Handles are cheap to
//! clone; the last clone to drop finishes the writer side.

use std::fmt;
use std::sync::Arc;

use super::delegate::WriterDelegate;
use super::state::YieldId;
use super::storage::{Storage, WriteOutcome};
use crate::errors::{BridgeError, BridgeResult};

// ----------------------------------------------------------------------------
// Writer Handle
// ----------------------------------------------------------------------------

/// Producer-facing handle of a writer bridge
///
/// Writes from concurrent producers are accepted in any order; the elements
/// of a single call are always delivered contiguously and in call order.
/// Dropping the last `Writer` clone behaves like [`finish`](Writer::finish).
pub struct Writer<D: WriterDelegate> {
    shared: Arc<WriterShared<D>>,
}

struct WriterShared<D: WriterDelegate> {
    storage: Arc<Storage<D>>,
}

impl<D: WriterDelegate> Writer<D> {
    pub(crate) fn new(storage: Arc<Storage<D>>) -> Self {
        Self {
            shared: Arc::new(WriterShared { storage }),
        }
    }

    /// Write a single element.
    ///
    /// Suspends while the sink is unwritable. Dropping the returned future
    /// after it suspended cancels the write; elements the sink already
    /// accepted are not retracted.
    pub async fn write(&self, element: D::Element) -> BridgeResult<()> {
        self.write_all(std::iter::once(element)).await
    }

    /// Write a batch of elements.
    ///
    /// If the sink is writable and no delegate callout is in flight, the
    /// batch is delivered synchronously before this returns. If the sink is
    /// unwritable, the batch is enqueued and the caller suspends until the
    /// sink becomes writable again, either side finishes, or the future is
    /// dropped. Fails with [`BridgeError::AlreadyFinished`] once the writer
    /// or sink has finished.
    pub async fn write_all<I>(&self, elements: I) -> BridgeResult<()>
    where
        I: IntoIterator<Item = D::Element>,
    {
        let elements: Vec<D::Element> = elements.into_iter().collect();
        let yield_id = self.shared.storage.make_yield_id();
        match self.shared.storage.write_elements(yield_id, elements) {
            WriteOutcome::Completed(result) => result,
            WriteOutcome::Suspended(resumption) => {
                let mut cancel_guard = CancelOnDrop {
                    storage: self.shared.storage.as_ref(),
                    yield_id,
                    armed: true,
                };
                let resumed = resumption.await;
                cancel_guard.armed = false;
                match resumed {
                    Ok(result) => result,
                    // The resumer was dropped with the terminal state.
                    Err(_) => Err(BridgeError::AlreadyFinished),
                }
            }
        }
    }

    /// Finish the writer side.
    ///
    /// Idempotent. Suspended producers resume normally and their buffered
    /// elements stay queued; the delegate's `did_terminate` fires once every
    /// buffered element has been delivered. Subsequent writes fail with
    /// [`BridgeError::AlreadyFinished`].
    pub fn finish(&self) {
        self.shared.storage.writer_finish(None);
    }

    /// Finish the writer side with an error.
    ///
    /// The error is forwarded to the delegate's `did_terminate` after the
    /// remaining buffered elements have been delivered.
    pub fn finish_with_error<E>(&self, error: E)
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.shared
            .storage
            .writer_finish(Some(BridgeError::terminated(error)));
    }
}

impl<D: WriterDelegate> Clone for Writer<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D: WriterDelegate> fmt::Debug for Writer<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer").finish_non_exhaustive()
    }
}

impl<D: WriterDelegate> Drop for WriterShared<D> {
    fn drop(&mut self) {
        self.storage.writer_deinitialized();
    }
}

// ----------------------------------------------------------------------------
// Cancellation Guard
// ----------------------------------------------------------------------------

/// Fires a cancellation if a suspended write future is dropped before its
/// resumption arrives.
struct CancelOnDrop<'a, D: WriterDelegate> {
    storage: &'a Storage<D>,
    yield_id: YieldId,
    armed: bool,
}

impl<D: WriterDelegate> Drop for CancelOnDrop<'_, D> {
    fn drop(&mut self) {
        if self.armed {
            self.storage.cancel_write(self.yield_id);
        }
    }
}
