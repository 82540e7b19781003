//! Test Delegates
//!
//! In-memory delegates with deterministic, inspectable behavior. Production
//! delegates write into a transport; these record or forward instead so tests
//! can assert on exactly what the bridge delivered and when.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use sinkbridge_core::{BridgeError, WriterDelegate};
use tokio::sync::mpsc;

// ----------------------------------------------------------------------------
// Recording Delegate Configuration
// ----------------------------------------------------------------------------

/// Configuration for recording delegate behavior
#[derive(Debug, Clone)]
pub struct RecordingConfig {
    /// Simulated consumer latency: how long each `did_yield*` callout is
    /// held open before returning (None = return immediately)
    pub callout_delay: Option<Duration>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            callout_delay: None, // Instant consumer by default
        }
    }
}

impl RecordingConfig {
    /// Create config for an instantaneous consumer
    pub fn instant() -> Self {
        Self {
            callout_delay: None,
        }
    }

    /// Create config for a slow consumer that holds every callout open
    ///
    /// Useful for widening the outcall window so tests can deterministically
    /// land concurrent writes inside it. Blocks the calling thread; tests
    /// using it need a multi-threaded runtime.
    pub fn slow_consumer(delay: Duration) -> Self {
        Self {
            callout_delay: Some(delay),
        }
    }
}

// ----------------------------------------------------------------------------
// Recording Delegate
// ----------------------------------------------------------------------------

/// One recorded `did_yield` / `did_yield_element` callout
#[derive(Debug, Clone)]
pub struct DeliveredBatch<E> {
    /// Elements of the callout, in delivery order
    pub elements: Vec<E>,
    /// Whether the single-element fast path was used
    pub single_element_path: bool,
}

type ReentrantHook<E> = Box<dyn FnMut(&[E]) + Send>;

/// Delegate that records every callout for later inspection
///
/// Wrap it in an [`Arc`](std::sync::Arc) and hand a clone to
/// [`create_writer`](sinkbridge_core::create_writer) so the test keeps its
/// own handle for assertions.
///
/// Overlapping callouts (a serialization violation in the bridge) are
/// counted rather than panicking, so a test can assert
/// `overlap_violations() == 0` at a well-defined point.
pub struct RecordingDelegate<E> {
    config: RecordingConfig,
    batches: Mutex<Vec<DeliveredBatch<E>>>,
    terminations: Mutex<Vec<Option<BridgeError>>>,
    in_callout: AtomicBool,
    overlap_violations: AtomicUsize,
    reentrant_hook: Mutex<Option<ReentrantHook<E>>>,
}

impl<E> RecordingDelegate<E> {
    /// Create a recording delegate with an instantaneous consumer
    pub fn new() -> Self {
        Self::with_config(RecordingConfig::default())
    }

    /// Create a recording delegate with the given behavior configuration
    pub fn with_config(config: RecordingConfig) -> Self {
        Self {
            config,
            batches: Mutex::new(Vec::new()),
            terminations: Mutex::new(Vec::new()),
            in_callout: AtomicBool::new(false),
            overlap_violations: AtomicUsize::new(0),
            reentrant_hook: Mutex::new(None),
        }
    }

    /// Install a hook that runs inside every `did_yield*` callout.
    ///
    /// The hook typically toggles writability on a cloned
    /// [`Sink`](sinkbridge_core::Sink) to exercise reentrancy.
    pub fn set_reentrant_hook<F>(&self, hook: F)
    where
        F: FnMut(&[E]) + Send + 'static,
    {
        *self.reentrant_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Number of `did_yield*` callouts observed so far
    pub fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    /// Number of `did_terminate` callouts observed so far
    pub fn termination_count(&self) -> usize {
        self.terminations.lock().unwrap().len()
    }

    /// Errors passed to `did_terminate`, in callout order
    pub fn terminations(&self) -> Vec<Option<BridgeError>> {
        self.terminations.lock().unwrap().clone()
    }

    /// Callouts that overlapped in wall time (must stay zero)
    pub fn overlap_violations(&self) -> usize {
        self.overlap_violations.load(Ordering::SeqCst)
    }

    fn enter_callout(&self) {
        if self.in_callout.swap(true, Ordering::SeqCst) {
            self.overlap_violations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn exit_callout(&self) {
        self.in_callout.store(false, Ordering::SeqCst);
    }

    fn record(&self, elements: Vec<E>, single_element_path: bool) {
        self.enter_callout();
        if let Some(hook) = self.reentrant_hook.lock().unwrap().as_mut() {
            hook(&elements);
        }
        self.batches.lock().unwrap().push(DeliveredBatch {
            elements,
            single_element_path,
        });
        if let Some(delay) = self.config.callout_delay {
            std::thread::sleep(delay);
        }
        self.exit_callout();
    }
}

impl<E: Clone> RecordingDelegate<E> {
    /// Recorded callouts, in delivery order
    pub fn batches(&self) -> Vec<DeliveredBatch<E>> {
        self.batches.lock().unwrap().clone()
    }

    /// All delivered elements flattened into delivery order
    pub fn delivered_elements(&self) -> Vec<E> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|batch| batch.elements.clone())
            .collect()
    }
}

impl<E> Default for RecordingDelegate<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Send + 'static> WriterDelegate for RecordingDelegate<E> {
    type Element = E;

    fn did_yield(&self, elements: Vec<E>) {
        self.record(elements, false);
    }

    fn did_yield_element(&self, element: E) {
        self.record(vec![element], true);
    }

    fn did_terminate(&self, error: Option<BridgeError>) {
        self.enter_callout();
        self.terminations.lock().unwrap().push(error);
        self.exit_callout();
    }
}

// ----------------------------------------------------------------------------
// Forwarding Delegate
// ----------------------------------------------------------------------------

/// Callout forwarded by a [`ForwardingDelegate`]
#[derive(Debug)]
pub enum DelegateEvent<E> {
    /// A `did_yield` / `did_yield_element` callout
    Batch(Vec<E>),
    /// The `did_terminate` callout
    Terminated(Option<BridgeError>),
}

/// Delegate that forwards every callout into an unbounded tokio channel
///
/// Useful when the asserting side runs as a separate task and wants to await
/// deliveries instead of polling a recording.
pub struct ForwardingDelegate<E> {
    events: mpsc::UnboundedSender<DelegateEvent<E>>,
}

impl<E> ForwardingDelegate<E> {
    /// Create a delegate plus the receiving end of its event stream.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DelegateEvent<E>>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (Self { events }, receiver)
    }
}

impl<E: Send + 'static> WriterDelegate for ForwardingDelegate<E> {
    type Element = E;

    fn did_yield(&self, elements: Vec<E>) {
        // The receiver may be gone once the test stops caring.
        let _ = self.events.send(DelegateEvent::Batch(elements));
    }

    fn did_terminate(&self, error: Option<BridgeError>) {
        let _ = self.events.send(DelegateEvent::Terminated(error));
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
