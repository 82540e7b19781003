//! Shared Writer Storage
//!
//! One mutex-guarded state machine per writer, shared by every producer and
//! sink handle. Each event entry point takes the lock, computes the next
//! state plus an action, releases the lock, and only then performs delegate
//! callouts and producer resumptions. After every delegate callout the
//! storage loops on `unbuffer_queued_events` to drain work that accumulated
//! reentrantly while the callout ran.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::delegate::WriterDelegate;
use super::state::{
    SetWritabilityAction, SinkFinishAction, StateMachine, UnbufferAction, WriterFinishAction,
    WriterStats, YieldAction, YieldId, YieldResumer,
};
use crate::errors::{BridgeError, BridgeResult};

// ----------------------------------------------------------------------------
// Write Outcomes
// ----------------------------------------------------------------------------

/// Result of submitting a write to the storage
pub(crate) enum WriteOutcome {
    /// The write completed (delivered, buffered, or rejected) without parking
    Completed(BridgeResult<()>),
    /// The producer must await this resumption
    Suspended(oneshot::Receiver<BridgeResult<()>>),
}

// ----------------------------------------------------------------------------
// Storage
// ----------------------------------------------------------------------------

pub(crate) struct Storage<D: WriterDelegate> {
    state_machine: Mutex<StateMachine<D>>,
    yield_id_counter: AtomicU64,
}

impl<D: WriterDelegate> Storage<D> {
    pub(crate) fn new(initially_writable: bool, delegate: D) -> Self {
        Self {
            state_machine: Mutex::new(StateMachine::new(initially_writable, Arc::new(delegate))),
            yield_id_counter: AtomicU64::new(0),
        }
    }

    fn machine(&self) -> MutexGuard<'_, StateMachine<D>> {
        self.state_machine
            .lock()
            .expect("writer state machine lock poisoned")
    }

    /// Allocate the token correlating this write with a later cancellation.
    pub(crate) fn make_yield_id(&self) -> YieldId {
        YieldId(self.yield_id_counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Submit a write.
    ///
    /// Suspension is two-phase: the classification and the resumer
    /// registration happen under a single lock acquisition, so a cancellation
    /// can never slip between them.
    pub(crate) fn write_elements(
        &self,
        yield_id: YieldId,
        elements: Vec<D::Element>,
    ) -> WriteOutcome {
        let mut machine = self.machine();
        match machine.yield_elements(yield_id, elements) {
            YieldAction::CallDidYield { delegate, elements } => {
                drop(machine);
                deliver(&*delegate, elements);
                self.unbuffer_queued_events();
                WriteOutcome::Completed(Ok(()))
            }
            YieldAction::Buffered => WriteOutcome::Completed(Ok(())),
            YieldAction::Fail { error } => WriteOutcome::Completed(Err(error)),
            YieldAction::Suspend { elements } => {
                let (resumer, resumption) = oneshot::channel();
                machine.register_suspended(yield_id, resumer, elements);
                trace!("Write {:?} suspended awaiting writability", yield_id);
                WriteOutcome::Suspended(resumption)
            }
        }
    }

    /// Cancel a write by its token.
    ///
    /// A parked producer resumes normally; its accepted elements stay queued.
    pub(crate) fn cancel_write(&self, yield_id: YieldId) {
        let resumer = self.machine().cancel(yield_id);
        if let Some(resumer) = resumer {
            trace!("Write {:?} cancelled while suspended", yield_id);
            let _ = resumer.send(Ok(()));
        }
    }

    /// Toggle the sink's writability flag.
    pub(crate) fn set_writability(&self, writable: bool) {
        let action = self.machine().set_writability(writable);
        match action {
            None => {}
            Some(SetWritabilityAction::ResumeWriters { resumers }) => {
                debug!("Writability on: resuming {} writers", resumers.len());
                resume_normally(resumers);
            }
            Some(SetWritabilityAction::DeliverAndResume {
                delegate,
                elements,
                resumers,
            }) => {
                debug!(
                    "Writability on: delivering {} buffered elements, resuming {} writers",
                    elements.len(),
                    resumers.len()
                );
                deliver(&*delegate, elements);
                resume_normally(resumers);
                self.unbuffer_queued_events();
            }
        }
    }

    /// Finish from the producer side.
    pub(crate) fn writer_finish(&self, error: Option<BridgeError>) {
        let action = self.machine().writer_finish(error);
        self.run_writer_finish_action(action);
    }

    /// Last producer handle dropped.
    pub(crate) fn writer_deinitialized(&self) {
        let action = self.machine().writer_deinitialized();
        self.run_writer_finish_action(action);
    }

    fn run_writer_finish_action(&self, action: WriterFinishAction<D>) {
        match action {
            WriterFinishAction::None => {}
            WriterFinishAction::ResumeWriters { resumers } => {
                debug!("Writer finished: resuming {} writers", resumers.len());
                resume_normally(resumers);
            }
            WriterFinishAction::CallDidTerminate { delegate, error } => {
                debug!("Writer terminated: {:?}", error);
                delegate.did_terminate(error);
            }
        }
    }

    /// Finish from the sink side.
    pub(crate) fn sink_finish(&self, error: Option<BridgeError>) {
        let action = self.machine().sink_finish(error);
        match action {
            SinkFinishAction::None => {}
            SinkFinishAction::ResumeWritersWithError { resumers, error } => {
                debug!("Sink finished: failing {} writers", resumers.len());
                resume_with_error(resumers, error);
            }
            SinkFinishAction::ResumeWritersWithErrorAndTerminate {
                resumers,
                resume_error,
                delegate,
                termination_error,
            } => {
                debug!(
                    "Sink finished: failing {} writers, terminating: {:?}",
                    resumers.len(),
                    termination_error
                );
                resume_with_error(resumers, resume_error);
                delegate.did_terminate(termination_error);
            }
            SinkFinishAction::CallDidTerminate { delegate, error } => {
                debug!("Sink finished: terminating: {:?}", error);
                delegate.did_terminate(error);
            }
        }
    }

    /// Snapshot the writer's internal state.
    pub(crate) fn stats(&self) -> WriterStats {
        self.machine().stats()
    }

    /// Drain work that accumulated while a delegate callout was in flight.
    ///
    /// The outcall window stays open across the whole loop, which is what
    /// serializes delegate callouts against reentrant writability toggles.
    fn unbuffer_queued_events(&self) {
        loop {
            let action = self.machine().unbuffer_queued_events();
            match action {
                None => break,
                Some(UnbufferAction::DeliverAndResume {
                    delegate,
                    elements,
                    resumers,
                }) => {
                    deliver(&*delegate, elements);
                    resume_normally(resumers);
                }
                Some(UnbufferAction::CallDidTerminate { delegate, error }) => {
                    debug!("Writer terminated after drain: {:?}", error);
                    delegate.did_terminate(error);
                    break;
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Outcall Helpers
// ----------------------------------------------------------------------------

/// Deliver a batch, using the delegate's single-element fast path when the
/// batch has exactly one element. Empty batches never reach the delegate.
fn deliver<D: WriterDelegate>(delegate: &D, mut elements: Vec<D::Element>) {
    if elements.len() == 1 {
        if let Some(element) = elements.pop() {
            delegate.did_yield_element(element);
        }
    } else if !elements.is_empty() {
        delegate.did_yield(elements);
    }
}

fn resume_normally(resumers: Vec<YieldResumer>) {
    for resumer in resumers {
        // The producer may already be gone; resolving is best-effort.
        let _ = resumer.send(Ok(()));
    }
}

fn resume_with_error(resumers: Vec<YieldResumer>, error: BridgeError) {
    for resumer in resumers {
        let _ = resumer.send(Err(error.clone()));
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    /// Counts callouts and records delivered elements.
    #[derive(Default)]
    struct CountingDelegate {
        batches: StdMutex<Vec<Vec<u32>>>,
        terminations: AtomicUsize,
    }

    impl WriterDelegate for CountingDelegate {
        type Element = u32;

        fn did_yield(&self, elements: Vec<u32>) {
            self.batches.lock().unwrap().push(elements);
        }

        fn did_terminate(&self, _error: Option<BridgeError>) {
            self.terminations.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_termination_is_delivered_exactly_once() {
        let delegate = Arc::new(CountingDelegate::default());
        let storage = Storage::new(true, delegate.clone());

        storage.writer_finish(None);
        storage.writer_finish(None);
        storage.sink_finish(None);
        storage.writer_deinitialized();

        assert_eq!(delegate.terminations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_direct_write_delivers_outside_lock() {
        let delegate = Arc::new(CountingDelegate::default());
        let storage = Storage::new(true, delegate.clone());

        let id = storage.make_yield_id();
        let outcome = storage.write_elements(id, vec![1, 2]);
        assert!(matches!(outcome, WriteOutcome::Completed(Ok(()))));
        assert_eq!(delegate.batches.lock().unwrap().as_slice(), &[vec![1, 2]]);
    }

    #[test]
    fn test_yield_ids_are_unique_and_monotonic() {
        let delegate = Arc::new(CountingDelegate::default());
        let storage = Storage::new(true, delegate);

        let first = storage.make_yield_id();
        let second = storage.make_yield_id();
        assert!(second.0 > first.0);
    }

    #[test]
    fn test_suspended_write_resumes_on_writability() {
        let delegate = Arc::new(CountingDelegate::default());
        let storage = Storage::new(false, delegate.clone());

        let id = storage.make_yield_id();
        let WriteOutcome::Suspended(mut resumption) = storage.write_elements(id, vec![5]) else {
            panic!("expected suspension");
        };
        assert!(resumption.try_recv().is_err());

        storage.set_writability(true);
        assert!(matches!(resumption.try_recv(), Ok(Ok(()))));
        assert_eq!(delegate.batches.lock().unwrap().as_slice(), &[vec![5]]);
    }
}
