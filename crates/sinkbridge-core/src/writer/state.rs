//! Writer State Machine
//!
//! The tagged state automaton governing writability transitions, buffering,
//! suspension and resumption of producers, cancellation races, reentrancy
//! around delegate callouts, and shutdown. Every event method computes the
//! next state and returns an action describing the side effects to execute;
//! the caller ([`Storage`](super::storage::Storage)) runs those side effects
//! only after releasing the state lock.
//!
//! States move strictly forward: `Initial` -> `Streaming` ->
//! (`WriterFinished`) -> `Finished`. `Finished` is absorbing.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use tokio::sync::oneshot;

use super::delegate::WriterDelegate;
use crate::errors::{BridgeError, BridgeResult};

// ----------------------------------------------------------------------------
// Identifiers and Suspension Records
// ----------------------------------------------------------------------------

/// Unique token correlating a cancellation with a specific in-flight write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct YieldId(pub(crate) u64);

/// One-shot completion handle that resumes a suspended producer
///
/// Resolved with `Ok(())` for normal resumption and `Err(_)` when the sink
/// finished. Safe to resolve into an already-dropped receiver.
pub(crate) type YieldResumer = oneshot::Sender<BridgeResult<()>>;

/// A producer parked behind back-pressure
///
/// Held exclusively inside the state machine until resumed; resumption always
/// happens outside the lock.
pub(crate) struct SuspendedYield {
    pub(crate) yield_id: YieldId,
    pub(crate) resumer: YieldResumer,
}

// ----------------------------------------------------------------------------
// Lifecycle Snapshot
// ----------------------------------------------------------------------------

/// Coarse lifecycle phase reported by [`WriterStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterPhase {
    /// No write or finish has been observed yet
    Initial,
    /// Normal operation: writes flowing, possibly buffered or suspended
    Streaming,
    /// The producer side finished; buffered elements await delivery
    Draining,
    /// Terminal: the delegate has been (or is being) told to terminate
    Terminated,
}

/// Point-in-time snapshot of a writer's internal state
///
/// Produced by [`Sink::stats`](crate::Sink::stats) for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    /// Current lifecycle phase
    pub phase: WriterPhase,
    /// Writability flag, if the phase still tracks one
    pub writable: Option<bool>,
    /// Elements accepted but not yet delivered to the delegate
    pub buffered_elements: usize,
    /// Producers currently parked behind back-pressure
    pub suspended_writers: usize,
    /// Cancellations recorded ahead of their write
    pub pending_cancellations: usize,
}

// ----------------------------------------------------------------------------
// States
// ----------------------------------------------------------------------------

enum WriterState<D: WriterDelegate> {
    /// Before any write or finish
    Initial { writable: bool, delegate: Arc<D> },
    /// Normal operation
    Streaming {
        writable: bool,
        /// A delegate callout is executing outside the lock; no other callout
        /// may begin until this drops back to `false`.
        in_delegate_outcall: bool,
        /// Cancellations that arrived before their write did
        cancelled_yields: Vec<YieldId>,
        /// Producers parked behind back-pressure
        suspended_yields: Vec<SuspendedYield>,
        /// Elements accepted while unwritable or during a callout
        buffered_elements: VecDeque<D::Element>,
        delegate: Arc<D>,
    },
    /// Producer side finished; remaining elements drain before termination
    WriterFinished {
        in_delegate_outcall: bool,
        buffered_elements: VecDeque<D::Element>,
        /// Error to hand to `did_terminate` once the buffer drains
        termination_error: Option<BridgeError>,
        /// Error thrown from writes arriving after full termination
        sink_error: Option<BridgeError>,
        delegate: Arc<D>,
    },
    /// Terminal state; the delegate reference has been released
    Finished { sink_error: Option<BridgeError> },
    /// Transient sentinel held only while a transition is in progress
    Modifying,
}

// ----------------------------------------------------------------------------
// Actions
// ----------------------------------------------------------------------------

/// Side effects of a write classification
pub(crate) enum YieldAction<D: WriterDelegate> {
    /// Deliver the elements now; an outcall window has been opened and the
    /// caller must run the unbuffer loop afterwards
    CallDidYield {
        delegate: Arc<D>,
        elements: Vec<D::Element>,
    },
    /// Elements were enqueued; the write returns without suspending
    Buffered,
    /// Back-pressure: the caller must register a resumer for these elements
    /// under the same lock acquisition, then await it
    Suspend { elements: Vec<D::Element> },
    /// The write is rejected
    Fail { error: BridgeError },
}

/// Side effects of a writability change
pub(crate) enum SetWritabilityAction<D: WriterDelegate> {
    /// Resume these producers normally; nothing to deliver
    ResumeWriters { resumers: Vec<YieldResumer> },
    /// Deliver the drained buffer, resume these producers normally, then run
    /// the unbuffer loop (an outcall window has been opened)
    DeliverAndResume {
        delegate: Arc<D>,
        elements: Vec<D::Element>,
        resumers: Vec<YieldResumer>,
    },
}

/// Side effects of a writer-side finish or last-handle drop
pub(crate) enum WriterFinishAction<D: WriterDelegate> {
    /// Nothing to do (idempotent finish, or termination deferred to the
    /// outcall currently in flight)
    None,
    /// Resume these producers normally; their elements stay buffered
    ResumeWriters { resumers: Vec<YieldResumer> },
    /// Terminal: tell the delegate the writer is done
    CallDidTerminate {
        delegate: Arc<D>,
        error: Option<BridgeError>,
    },
}

/// Side effects of a sink-side finish
pub(crate) enum SinkFinishAction<D: WriterDelegate> {
    None,
    /// Fail these producers; termination is deferred to the outcall in flight
    ResumeWritersWithError {
        resumers: Vec<YieldResumer>,
        error: BridgeError,
    },
    /// Fail these producers and terminate the delegate
    ResumeWritersWithErrorAndTerminate {
        resumers: Vec<YieldResumer>,
        resume_error: BridgeError,
        delegate: Arc<D>,
        termination_error: Option<BridgeError>,
    },
    /// Terminal: tell the delegate the writer is done
    CallDidTerminate {
        delegate: Arc<D>,
        error: Option<BridgeError>,
    },
}

/// One step of the post-callout drain loop
pub(crate) enum UnbufferAction<D: WriterDelegate> {
    /// Deliver the drained buffer and resume these producers normally; the
    /// outcall window stays open and the loop continues
    DeliverAndResume {
        delegate: Arc<D>,
        elements: Vec<D::Element>,
        resumers: Vec<YieldResumer>,
    },
    /// Terminal: tell the delegate the writer is done and stop the loop
    CallDidTerminate {
        delegate: Arc<D>,
        error: Option<BridgeError>,
    },
}

// ----------------------------------------------------------------------------
// State Machine
// ----------------------------------------------------------------------------

pub(crate) struct StateMachine<D: WriterDelegate> {
    state: WriterState<D>,
}

impl<D: WriterDelegate> StateMachine<D> {
    pub(crate) fn new(initially_writable: bool, delegate: Arc<D>) -> Self {
        Self {
            state: WriterState::Initial {
                writable: initially_writable,
                delegate,
            },
        }
    }

    /// Classify a write call.
    ///
    /// Two-phase with [`register_suspended`](Self::register_suspended): when
    /// this returns [`YieldAction::Suspend`], the caller must register its
    /// resumer while still holding the same lock acquisition.
    pub(crate) fn yield_elements(
        &mut self,
        yield_id: YieldId,
        elements: Vec<D::Element>,
    ) -> YieldAction<D> {
        match mem::replace(&mut self.state, WriterState::Modifying) {
            WriterState::Initial { writable, delegate } => {
                // First write promotes to Streaming, then classifies normally.
                self.state = WriterState::Streaming {
                    writable,
                    in_delegate_outcall: false,
                    cancelled_yields: Vec::new(),
                    suspended_yields: Vec::new(),
                    buffered_elements: VecDeque::new(),
                    delegate,
                };
                self.yield_elements(yield_id, elements)
            }
            WriterState::Streaming {
                writable,
                in_delegate_outcall,
                mut cancelled_yields,
                suspended_yields,
                mut buffered_elements,
                delegate,
            } => {
                // Consume a cancellation that raced ahead of this write.
                let was_cancelled =
                    if let Some(pos) = cancelled_yields.iter().position(|c| *c == yield_id) {
                        cancelled_yields.swap_remove(pos);
                        true
                    } else {
                        false
                    };

                if writable {
                    if elements.is_empty() {
                        // Nothing to deliver; an empty write is accepted as-is.
                        self.state = WriterState::Streaming {
                            writable,
                            in_delegate_outcall,
                            cancelled_yields,
                            suspended_yields,
                            buffered_elements,
                            delegate,
                        };
                        YieldAction::Buffered
                    } else if in_delegate_outcall {
                        // A callout is in flight; the drain loop will pick
                        // these up once it returns.
                        buffered_elements.extend(elements);
                        self.state = WriterState::Streaming {
                            writable,
                            in_delegate_outcall,
                            cancelled_yields,
                            suspended_yields,
                            buffered_elements,
                            delegate,
                        };
                        YieldAction::Buffered
                    } else {
                        debug_assert!(buffered_elements.is_empty());
                        self.state = WriterState::Streaming {
                            writable,
                            in_delegate_outcall: true,
                            cancelled_yields,
                            suspended_yields,
                            buffered_elements,
                            delegate: delegate.clone(),
                        };
                        YieldAction::CallDidYield { delegate, elements }
                    }
                } else if was_cancelled {
                    // Already cancelled: accept the elements but do not park
                    // the producer behind back-pressure.
                    buffered_elements.extend(elements);
                    self.state = WriterState::Streaming {
                        writable,
                        in_delegate_outcall,
                        cancelled_yields,
                        suspended_yields,
                        buffered_elements,
                        delegate,
                    };
                    YieldAction::Buffered
                } else {
                    self.state = WriterState::Streaming {
                        writable,
                        in_delegate_outcall,
                        cancelled_yields,
                        suspended_yields,
                        buffered_elements,
                        delegate,
                    };
                    YieldAction::Suspend { elements }
                }
            }
            state @ WriterState::WriterFinished { .. } => {
                self.state = state;
                YieldAction::Fail {
                    error: BridgeError::AlreadyFinished,
                }
            }
            WriterState::Finished { sink_error } => {
                let error = sink_error.clone().unwrap_or(BridgeError::AlreadyFinished);
                self.state = WriterState::Finished { sink_error };
                YieldAction::Fail { error }
            }
            WriterState::Modifying => unreachable!("writer state observed mid-transition"),
        }
    }

    /// Park a producer whose write was classified as [`YieldAction::Suspend`].
    ///
    /// Must run under the same lock acquisition as the classification.
    pub(crate) fn register_suspended(
        &mut self,
        yield_id: YieldId,
        resumer: YieldResumer,
        elements: Vec<D::Element>,
    ) {
        match &mut self.state {
            WriterState::Streaming {
                suspended_yields,
                buffered_elements,
                ..
            } => {
                debug_assert!(
                    suspended_yields.iter().all(|s| s.yield_id != yield_id),
                    "yield id registered twice"
                );
                buffered_elements.extend(elements);
                suspended_yields.push(SuspendedYield { yield_id, resumer });
            }
            _ => unreachable!("suspension registered outside of streaming"),
        }
    }

    /// Record a cancellation, resuming the producer if it is parked.
    ///
    /// Returns the resumer to resolve (normally) outside the lock, if any.
    /// Elements already accepted from the cancelled write stay buffered.
    pub(crate) fn cancel(&mut self, yield_id: YieldId) -> Option<YieldResumer> {
        match mem::replace(&mut self.state, WriterState::Modifying) {
            WriterState::Initial { writable, delegate } => {
                // Cancellation raced ahead of the first write.
                self.state = WriterState::Streaming {
                    writable,
                    in_delegate_outcall: false,
                    cancelled_yields: vec![yield_id],
                    suspended_yields: Vec::new(),
                    buffered_elements: VecDeque::new(),
                    delegate,
                };
                None
            }
            WriterState::Streaming {
                writable,
                in_delegate_outcall,
                mut cancelled_yields,
                mut suspended_yields,
                buffered_elements,
                delegate,
            } => {
                let resumer = if let Some(pos) = suspended_yields
                    .iter()
                    .position(|s| s.yield_id == yield_id)
                {
                    Some(suspended_yields.remove(pos).resumer)
                } else {
                    cancelled_yields.push(yield_id);
                    None
                };
                self.state = WriterState::Streaming {
                    writable,
                    in_delegate_outcall,
                    cancelled_yields,
                    suspended_yields,
                    buffered_elements,
                    delegate,
                };
                resumer
            }
            state @ (WriterState::WriterFinished { .. } | WriterState::Finished { .. }) => {
                self.state = state;
                None
            }
            WriterState::Modifying => unreachable!("writer state observed mid-transition"),
        }
    }

    /// Toggle the sink's writability flag.
    pub(crate) fn set_writability(&mut self, writable: bool) -> Option<SetWritabilityAction<D>> {
        match mem::replace(&mut self.state, WriterState::Modifying) {
            WriterState::Initial { delegate, .. } => {
                self.state = WriterState::Initial { writable, delegate };
                None
            }
            WriterState::Streaming {
                writable: current,
                in_delegate_outcall,
                cancelled_yields,
                mut suspended_yields,
                mut buffered_elements,
                delegate,
            } => {
                if current == writable || !writable || in_delegate_outcall {
                    // Same value, turning off, or a callout in flight: record
                    // the flag; the drain loop observes it on its next pass.
                    self.state = WriterState::Streaming {
                        writable,
                        in_delegate_outcall,
                        cancelled_yields,
                        suspended_yields,
                        buffered_elements,
                        delegate,
                    };
                    return None;
                }

                // false -> true with no callout in flight: release the
                // parked producers and drain whatever accumulated.
                let resumers: Vec<YieldResumer> = suspended_yields
                    .drain(..)
                    .map(|suspended| suspended.resumer)
                    .collect();
                if buffered_elements.is_empty() {
                    self.state = WriterState::Streaming {
                        writable: true,
                        in_delegate_outcall: false,
                        cancelled_yields,
                        suspended_yields,
                        buffered_elements,
                        delegate,
                    };
                    if resumers.is_empty() {
                        None
                    } else {
                        Some(SetWritabilityAction::ResumeWriters { resumers })
                    }
                } else {
                    let elements: Vec<D::Element> = buffered_elements.drain(..).collect();
                    self.state = WriterState::Streaming {
                        writable: true,
                        in_delegate_outcall: true,
                        cancelled_yields,
                        suspended_yields,
                        buffered_elements,
                        delegate: delegate.clone(),
                    };
                    Some(SetWritabilityAction::DeliverAndResume {
                        delegate,
                        elements,
                        resumers,
                    })
                }
            }
            WriterState::WriterFinished {
                in_delegate_outcall,
                mut buffered_elements,
                termination_error,
                sink_error,
                delegate,
            } => {
                if writable && !in_delegate_outcall && !buffered_elements.is_empty() {
                    let elements: Vec<D::Element> = buffered_elements.drain(..).collect();
                    self.state = WriterState::WriterFinished {
                        in_delegate_outcall: true,
                        buffered_elements,
                        termination_error,
                        sink_error,
                        delegate: delegate.clone(),
                    };
                    Some(SetWritabilityAction::DeliverAndResume {
                        delegate,
                        elements,
                        resumers: Vec::new(),
                    })
                } else {
                    self.state = WriterState::WriterFinished {
                        in_delegate_outcall,
                        buffered_elements,
                        termination_error,
                        sink_error,
                        delegate,
                    };
                    None
                }
            }
            state @ WriterState::Finished { .. } => {
                self.state = state;
                None
            }
            WriterState::Modifying => unreachable!("writer state observed mid-transition"),
        }
    }

    /// Finish from the producer side.
    ///
    /// Suspended producers resume normally and their buffered elements stay
    /// queued for delivery; termination fires once the buffer drains.
    pub(crate) fn writer_finish(&mut self, error: Option<BridgeError>) -> WriterFinishAction<D> {
        match mem::replace(&mut self.state, WriterState::Modifying) {
            WriterState::Initial { delegate, .. } => {
                self.state = WriterState::Finished { sink_error: None };
                WriterFinishAction::CallDidTerminate {
                    delegate,
                    error: None,
                }
            }
            WriterState::Streaming {
                in_delegate_outcall,
                mut suspended_yields,
                buffered_elements,
                delegate,
                ..
            } => {
                if buffered_elements.is_empty() {
                    debug_assert!(suspended_yields.is_empty());
                    if in_delegate_outcall {
                        // The running drain loop performs the termination.
                        self.state = WriterState::WriterFinished {
                            in_delegate_outcall: true,
                            buffered_elements,
                            termination_error: error,
                            sink_error: None,
                            delegate,
                        };
                        WriterFinishAction::None
                    } else {
                        self.state = WriterState::Finished { sink_error: None };
                        WriterFinishAction::CallDidTerminate { delegate, error }
                    }
                } else {
                    let resumers: Vec<YieldResumer> = suspended_yields
                        .drain(..)
                        .map(|suspended| suspended.resumer)
                        .collect();
                    self.state = WriterState::WriterFinished {
                        in_delegate_outcall,
                        buffered_elements,
                        termination_error: error,
                        sink_error: None,
                        delegate,
                    };
                    if resumers.is_empty() {
                        WriterFinishAction::None
                    } else {
                        WriterFinishAction::ResumeWriters { resumers }
                    }
                }
            }
            state @ (WriterState::WriterFinished { .. } | WriterState::Finished { .. }) => {
                self.state = state;
                WriterFinishAction::None
            }
            WriterState::Modifying => unreachable!("writer state observed mid-transition"),
        }
    }

    /// Last producer handle dropped.
    ///
    /// A suspended producer keeps its handle alive for the duration of the
    /// write, so no producer can be parked when this fires.
    pub(crate) fn writer_deinitialized(&mut self) -> WriterFinishAction<D> {
        if let WriterState::Streaming {
            suspended_yields, ..
        } = &self.state
        {
            debug_assert!(
                suspended_yields.is_empty(),
                "writer handle dropped with suspended producers"
            );
        }
        self.writer_finish(None)
    }

    /// Finish from the sink side.
    ///
    /// Suspended producers fail with the supplied error (or
    /// `AlreadyFinished`); queued elements are discarded.
    pub(crate) fn sink_finish(&mut self, error: Option<BridgeError>) -> SinkFinishAction<D> {
        match mem::replace(&mut self.state, WriterState::Modifying) {
            WriterState::Initial { delegate, .. } => {
                self.state = WriterState::Finished {
                    sink_error: error.clone(),
                };
                SinkFinishAction::CallDidTerminate { delegate, error }
            }
            WriterState::Streaming {
                in_delegate_outcall,
                mut suspended_yields,
                delegate,
                ..
            } => {
                let resume_error = error.clone().unwrap_or(BridgeError::AlreadyFinished);
                let resumers: Vec<YieldResumer> = suspended_yields
                    .drain(..)
                    .map(|suspended| suspended.resumer)
                    .collect();
                if in_delegate_outcall {
                    // Termination is deferred to the drain loop in flight;
                    // queued elements are dropped here.
                    self.state = WriterState::WriterFinished {
                        in_delegate_outcall: true,
                        buffered_elements: VecDeque::new(),
                        termination_error: error.clone(),
                        sink_error: error,
                        delegate,
                    };
                    SinkFinishAction::ResumeWritersWithError {
                        resumers,
                        error: resume_error,
                    }
                } else {
                    self.state = WriterState::Finished {
                        sink_error: error.clone(),
                    };
                    SinkFinishAction::ResumeWritersWithErrorAndTerminate {
                        resumers,
                        resume_error,
                        delegate,
                        termination_error: error,
                    }
                }
            }
            WriterState::WriterFinished {
                in_delegate_outcall,
                termination_error,
                sink_error,
                delegate,
                ..
            } => {
                if in_delegate_outcall {
                    // The loop in flight terminates; remaining elements are
                    // discarded because the sink is gone.
                    self.state = WriterState::WriterFinished {
                        in_delegate_outcall: true,
                        buffered_elements: VecDeque::new(),
                        termination_error,
                        sink_error: sink_error.or(error),
                        delegate,
                    };
                    SinkFinishAction::None
                } else {
                    // The writer's finish reached the terminal transition
                    // first; its error takes precedence.
                    self.state = WriterState::Finished {
                        sink_error: sink_error.or(error.clone()),
                    };
                    SinkFinishAction::CallDidTerminate {
                        delegate,
                        error: termination_error.or(error),
                    }
                }
            }
            state @ WriterState::Finished { .. } => {
                self.state = state;
                SinkFinishAction::None
            }
            WriterState::Modifying => unreachable!("writer state observed mid-transition"),
        }
    }

    /// One step of the post-callout drain loop.
    ///
    /// Called repeatedly after every delegate callout until it returns `None`.
    /// The outcall window stays open across the whole loop, which is what
    /// keeps delegate callouts serialized.
    pub(crate) fn unbuffer_queued_events(&mut self) -> Option<UnbufferAction<D>> {
        match mem::replace(&mut self.state, WriterState::Modifying) {
            WriterState::Streaming {
                writable,
                in_delegate_outcall,
                cancelled_yields,
                mut suspended_yields,
                mut buffered_elements,
                delegate,
            } => {
                debug_assert!(in_delegate_outcall, "drain loop entered without an outcall");
                if !writable || (buffered_elements.is_empty() && suspended_yields.is_empty()) {
                    // Unwritable again, or nothing accumulated: close the
                    // outcall window. Anything left waits for the next
                    // writability transition.
                    self.state = WriterState::Streaming {
                        writable,
                        in_delegate_outcall: false,
                        cancelled_yields,
                        suspended_yields,
                        buffered_elements,
                        delegate,
                    };
                    None
                } else {
                    let resumers: Vec<YieldResumer> = suspended_yields
                        .drain(..)
                        .map(|suspended| suspended.resumer)
                        .collect();
                    let elements: Vec<D::Element> = buffered_elements.drain(..).collect();
                    self.state = WriterState::Streaming {
                        writable,
                        in_delegate_outcall: true,
                        cancelled_yields,
                        suspended_yields,
                        buffered_elements,
                        delegate: delegate.clone(),
                    };
                    Some(UnbufferAction::DeliverAndResume {
                        delegate,
                        elements,
                        resumers,
                    })
                }
            }
            WriterState::WriterFinished {
                in_delegate_outcall,
                mut buffered_elements,
                termination_error,
                sink_error,
                delegate,
            } => {
                debug_assert!(in_delegate_outcall, "drain loop entered without an outcall");
                if buffered_elements.is_empty() {
                    self.state = WriterState::Finished { sink_error };
                    Some(UnbufferAction::CallDidTerminate {
                        delegate,
                        error: termination_error,
                    })
                } else {
                    let elements: Vec<D::Element> = buffered_elements.drain(..).collect();
                    self.state = WriterState::WriterFinished {
                        in_delegate_outcall: true,
                        buffered_elements,
                        termination_error,
                        sink_error,
                        delegate: delegate.clone(),
                    };
                    Some(UnbufferAction::DeliverAndResume {
                        delegate,
                        elements,
                        resumers: Vec::new(),
                    })
                }
            }
            state @ WriterState::Finished { .. } => {
                self.state = state;
                None
            }
            WriterState::Initial { .. } => unreachable!("drain loop entered before streaming"),
            WriterState::Modifying => unreachable!("writer state observed mid-transition"),
        }
    }

    /// Snapshot the current state for diagnostics.
    pub(crate) fn stats(&self) -> WriterStats {
        match &self.state {
            WriterState::Initial { writable, .. } => WriterStats {
                phase: WriterPhase::Initial,
                writable: Some(*writable),
                buffered_elements: 0,
                suspended_writers: 0,
                pending_cancellations: 0,
            },
            WriterState::Streaming {
                writable,
                cancelled_yields,
                suspended_yields,
                buffered_elements,
                ..
            } => WriterStats {
                phase: WriterPhase::Streaming,
                writable: Some(*writable),
                buffered_elements: buffered_elements.len(),
                suspended_writers: suspended_yields.len(),
                pending_cancellations: cancelled_yields.len(),
            },
            WriterState::WriterFinished {
                buffered_elements, ..
            } => WriterStats {
                phase: WriterPhase::Draining,
                writable: None,
                buffered_elements: buffered_elements.len(),
                suspended_writers: 0,
                pending_cancellations: 0,
            },
            WriterState::Finished { .. } => WriterStats {
                phase: WriterPhase::Terminated,
                writable: None,
                buffered_elements: 0,
                suspended_writers: 0,
                pending_cancellations: 0,
            },
            WriterState::Modifying => unreachable!("writer state observed mid-transition"),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Delegate whose methods are never invoked by the machine itself;
    /// transitions only return actions.
    struct InertDelegate;

    impl WriterDelegate for InertDelegate {
        type Element = u32;

        fn did_yield(&self, _elements: Vec<u32>) {}

        fn did_terminate(&self, _error: Option<BridgeError>) {}
    }

    fn machine(writable: bool) -> StateMachine<InertDelegate> {
        StateMachine::new(writable, Arc::new(InertDelegate))
    }

    fn suspend_write(
        machine: &mut StateMachine<InertDelegate>,
        id: u64,
        elements: Vec<u32>,
    ) -> oneshot::Receiver<BridgeResult<()>> {
        let action = machine.yield_elements(YieldId(id), elements);
        let YieldAction::Suspend { elements } = action else {
            panic!("expected write to suspend");
        };
        let (resumer, resumption) = oneshot::channel();
        machine.register_suspended(YieldId(id), resumer, elements);
        resumption
    }

    #[test]
    fn test_first_write_on_writable_sink_delivers() {
        let mut machine = machine(true);
        let action = machine.yield_elements(YieldId(0), vec![1, 2, 3]);
        let YieldAction::CallDidYield { elements, .. } = action else {
            panic!("expected direct delivery");
        };
        assert_eq!(elements, vec![1, 2, 3]);
        assert_eq!(machine.stats().phase, WriterPhase::Streaming);

        // The outcall window is open; a concurrent write buffers.
        assert!(matches!(
            machine.yield_elements(YieldId(1), vec![4]),
            YieldAction::Buffered
        ));
        assert_eq!(machine.stats().buffered_elements, 1);
    }

    #[test]
    fn test_write_on_unwritable_sink_suspends() {
        let mut machine = machine(false);
        let mut resumption = suspend_write(&mut machine, 0, vec![7]);
        assert_eq!(machine.stats().suspended_writers, 1);
        assert_eq!(machine.stats().buffered_elements, 1);
        assert!(resumption.try_recv().is_err());
    }

    #[test]
    fn test_writability_toggle_drains_and_resumes() {
        let mut machine = machine(false);
        let mut first = suspend_write(&mut machine, 0, vec![1]);
        let mut second = suspend_write(&mut machine, 1, vec![2]);

        let action = machine.set_writability(true);
        let Some(SetWritabilityAction::DeliverAndResume {
            elements, resumers, ..
        }) = action
        else {
            panic!("expected a drain");
        };
        assert_eq!(elements, vec![1, 2]);
        assert_eq!(resumers.len(), 2);

        for resumer in resumers {
            resumer.send(Ok(())).unwrap();
        }
        assert!(matches!(first.try_recv(), Ok(Ok(()))));
        assert!(matches!(second.try_recv(), Ok(Ok(()))));

        // Drain loop closes the outcall window.
        assert!(machine.unbuffer_queued_events().is_none());
        assert_eq!(machine.stats().suspended_writers, 0);
        assert_eq!(machine.stats().buffered_elements, 0);
    }

    #[test]
    fn test_writability_toggle_with_empty_buffer_only_resumes() {
        let mut machine = machine(false);
        // An empty write is a pure back-pressure wait.
        let _resumption = suspend_write(&mut machine, 0, vec![]);

        let action = machine.set_writability(true);
        let Some(SetWritabilityAction::ResumeWriters { resumers }) = action else {
            panic!("expected resumption without delivery");
        };
        assert_eq!(resumers.len(), 1);
        // No outcall window was opened.
        assert!(matches!(
            machine.yield_elements(YieldId(1), vec![5]),
            YieldAction::CallDidYield { .. }
        ));
    }

    #[test]
    fn test_writability_same_value_is_noop() {
        let mut machine = machine(true);
        assert!(machine.set_writability(true).is_none());
        assert!(machine.yield_elements(YieldId(0), vec![1]).is_delivery());
        assert!(machine.unbuffer_queued_events().is_none());
        assert!(machine.set_writability(false).is_none());
        assert!(machine.set_writability(false).is_none());
    }

    #[test]
    fn test_writability_toggle_during_outcall_is_deferred() {
        let mut machine = machine(true);
        assert!(machine.yield_elements(YieldId(0), vec![1]).is_delivery());

        // Reentrant toggles from inside the callout only update the flag.
        assert!(machine.set_writability(false).is_none());
        assert!(machine.set_writability(true).is_none());

        // A concurrent write buffers rather than starting a second callout.
        assert!(matches!(
            machine.yield_elements(YieldId(1), vec![2]),
            YieldAction::Buffered
        ));

        // The drain loop picks the buffered element up, then closes the window.
        let Some(UnbufferAction::DeliverAndResume { elements, .. }) =
            machine.unbuffer_queued_events()
        else {
            panic!("expected the drain loop to deliver");
        };
        assert_eq!(elements, vec![2]);
        assert!(machine.unbuffer_queued_events().is_none());
    }

    #[test]
    fn test_drain_loop_stops_while_unwritable() {
        let mut machine = machine(true);
        assert!(machine.yield_elements(YieldId(0), vec![1]).is_delivery());
        assert!(machine.set_writability(false).is_none());
        assert!(matches!(
            machine.yield_elements(YieldId(1), vec![2]),
            YieldAction::Suspend { .. }
        ));

        // The loop must not deliver while the sink is unwritable.
        assert!(machine.unbuffer_queued_events().is_none());
        assert_eq!(machine.stats().suspended_writers, 0); // never registered
    }

    #[test]
    fn test_cancel_before_write_delivers_directly_when_writable() {
        let mut machine = machine(true);
        machine.cancel(YieldId(0));
        assert_eq!(machine.stats().pending_cancellations, 1);

        let action = machine.yield_elements(YieldId(0), vec![9]);
        assert!(action.is_delivery());
        assert_eq!(machine.stats().pending_cancellations, 0);
    }

    #[test]
    fn test_cancel_before_write_buffers_without_suspending_when_unwritable() {
        let mut machine = machine(false);
        machine.cancel(YieldId(0));

        // The producer is already cancelled, so it must not park.
        let action = machine.yield_elements(YieldId(0), vec![9]);
        assert!(matches!(action, YieldAction::Buffered));
        assert_eq!(machine.stats().buffered_elements, 1);
        assert_eq!(machine.stats().suspended_writers, 0);
        assert_eq!(machine.stats().pending_cancellations, 0);
    }

    #[test]
    fn test_cancel_during_suspension_resumes_and_keeps_elements() {
        let mut machine = machine(false);
        let mut resumption = suspend_write(&mut machine, 0, vec![9]);

        let resumer = machine.cancel(YieldId(0)).expect("resumer returned");
        resumer.send(Ok(())).unwrap();
        assert!(matches!(resumption.try_recv(), Ok(Ok(()))));

        // Accepted elements are not retracted by cancellation.
        assert_eq!(machine.stats().suspended_writers, 0);
        assert_eq!(machine.stats().buffered_elements, 1);

        let action = machine.set_writability(true);
        let Some(SetWritabilityAction::DeliverAndResume { elements, .. }) = action else {
            panic!("expected the kept element to drain");
        };
        assert_eq!(elements, vec![9]);
    }

    #[test]
    fn test_cancel_of_unknown_write_is_recorded() {
        let mut machine = machine(true);
        assert!(machine.yield_elements(YieldId(0), vec![1]).is_delivery());
        assert!(machine.unbuffer_queued_events().is_none());

        assert!(machine.cancel(YieldId(7)).is_none());
        assert_eq!(machine.stats().pending_cancellations, 1);
    }

    #[test]
    fn test_writer_finish_with_empty_buffer_terminates() {
        let mut machine = machine(true);
        assert!(machine.yield_elements(YieldId(0), vec![1]).is_delivery());
        assert!(machine.unbuffer_queued_events().is_none());

        let action = machine.writer_finish(None);
        assert!(matches!(
            action,
            WriterFinishAction::CallDidTerminate { error: None, .. }
        ));
        assert_eq!(machine.stats().phase, WriterPhase::Terminated);

        // Subsequent writes are rejected.
        let YieldAction::Fail { error } = machine.yield_elements(YieldId(1), vec![2]) else {
            panic!("expected rejection");
        };
        assert!(error.is_already_finished());
    }

    #[test]
    fn test_writer_finish_during_outcall_defers_termination() {
        let mut machine = machine(true);
        assert!(machine.yield_elements(YieldId(0), vec![1]).is_delivery());

        assert!(matches!(
            machine.writer_finish(None),
            WriterFinishAction::None
        ));
        assert_eq!(machine.stats().phase, WriterPhase::Draining);

        let Some(UnbufferAction::CallDidTerminate { error: None, .. }) =
            machine.unbuffer_queued_events()
        else {
            panic!("expected the drain loop to terminate");
        };
        assert_eq!(machine.stats().phase, WriterPhase::Terminated);
    }

    #[test]
    fn test_writer_finish_resumes_suspended_and_drains_later() {
        let mut machine = machine(false);
        let mut resumption = suspend_write(&mut machine, 0, vec![1, 2]);

        let action = machine.writer_finish(None);
        let WriterFinishAction::ResumeWriters { resumers } = action else {
            panic!("expected normal resumption");
        };
        for resumer in resumers {
            resumer.send(Ok(())).unwrap();
        }
        assert!(matches!(resumption.try_recv(), Ok(Ok(()))));
        assert_eq!(machine.stats().phase, WriterPhase::Draining);
        assert_eq!(machine.stats().buffered_elements, 2);

        // Writability release drains the remainder, then terminates.
        let Some(SetWritabilityAction::DeliverAndResume { elements, .. }) =
            machine.set_writability(true)
        else {
            panic!("expected a drain");
        };
        assert_eq!(elements, vec![1, 2]);
        let Some(UnbufferAction::CallDidTerminate { error: None, .. }) =
            machine.unbuffer_queued_events()
        else {
            panic!("expected termination after the drain");
        };
        assert_eq!(machine.stats().phase, WriterPhase::Terminated);
    }

    #[test]
    fn test_sink_finish_fails_suspended_writers() {
        let mut machine = machine(false);
        let mut first = suspend_write(&mut machine, 0, vec![1]);
        let mut second = suspend_write(&mut machine, 1, vec![2]);

        let action = machine.sink_finish(None);
        let SinkFinishAction::ResumeWritersWithErrorAndTerminate {
            resumers,
            resume_error,
            termination_error: None,
            ..
        } = action
        else {
            panic!("expected failing resumption plus termination");
        };
        assert!(resume_error.is_already_finished());
        assert_eq!(resumers.len(), 2);
        for resumer in resumers {
            resumer.send(Err(resume_error.clone())).unwrap();
        }
        assert!(matches!(first.try_recv(), Ok(Err(_))));
        assert!(matches!(second.try_recv(), Ok(Err(_))));

        // Queued elements were discarded, state is terminal.
        assert_eq!(machine.stats().phase, WriterPhase::Terminated);
        assert_eq!(machine.stats().buffered_elements, 0);
    }

    #[test]
    fn test_sink_finish_during_outcall_defers_termination() {
        let mut machine = machine(true);
        assert!(machine.yield_elements(YieldId(0), vec![1]).is_delivery());

        let action = machine.sink_finish(None);
        assert!(matches!(
            action,
            SinkFinishAction::ResumeWritersWithError { .. }
        ));
        assert_eq!(machine.stats().phase, WriterPhase::Draining);

        let Some(UnbufferAction::CallDidTerminate { .. }) = machine.unbuffer_queued_events()
        else {
            panic!("expected the drain loop to terminate");
        };
        assert_eq!(machine.stats().phase, WriterPhase::Terminated);
    }

    #[test]
    fn test_write_after_sink_finish_fails_with_sink_error() {
        #[derive(Debug, thiserror::Error)]
        #[error("boom")]
        struct Boom;

        let mut machine = machine(true);
        machine.sink_finish(Some(BridgeError::terminated(Boom)));

        let YieldAction::Fail { error } = machine.yield_elements(YieldId(0), vec![1]) else {
            panic!("expected rejection");
        };
        assert_eq!(error.to_string(), "boom");
    }

    #[test]
    fn test_writer_error_takes_precedence_over_later_sink_error() {
        #[derive(Debug, thiserror::Error)]
        #[error("writer side")]
        struct WriterSide;
        #[derive(Debug, thiserror::Error)]
        #[error("sink side")]
        struct SinkSide;

        let mut machine = machine(false);
        let _resumption = suspend_write(&mut machine, 0, vec![1]);
        machine.writer_finish(Some(BridgeError::terminated(WriterSide)));

        let action = machine.sink_finish(Some(BridgeError::terminated(SinkSide)));
        let SinkFinishAction::CallDidTerminate { error, .. } = action else {
            panic!("expected termination");
        };
        assert_eq!(error.unwrap().to_string(), "writer side");
    }

    #[test]
    fn test_finish_events_are_idempotent() {
        let mut machine = machine(true);
        assert!(matches!(
            machine.writer_finish(None),
            WriterFinishAction::CallDidTerminate { .. }
        ));
        assert!(matches!(
            machine.writer_finish(None),
            WriterFinishAction::None
        ));
        assert!(matches!(machine.sink_finish(None), SinkFinishAction::None));
        assert!(machine.set_writability(true).is_none());
        assert!(machine.cancel(YieldId(0)).is_none());
        assert_eq!(machine.stats().phase, WriterPhase::Terminated);
    }

    #[test]
    fn test_writer_deinit_before_any_write_terminates() {
        let mut machine = machine(true);
        let action = machine.writer_deinitialized();
        assert!(matches!(
            action,
            WriterFinishAction::CallDidTerminate { error: None, .. }
        ));
        assert_eq!(machine.stats().phase, WriterPhase::Terminated);
    }

    impl<D: WriterDelegate> YieldAction<D> {
        fn is_delivery(&self) -> bool {
            matches!(self, YieldAction::CallDidYield { .. })
        }
    }
}
