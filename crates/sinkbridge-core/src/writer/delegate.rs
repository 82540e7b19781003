//! Writer Delegate Trait Definition
//!
//! Defines the consumer-side contract of the bridge. Concrete implementations
//! wrap a downstream transport (a byte-stream channel, socket, file) and live
//! with the component that owns the [`Sink`](crate::Sink).

use crate::errors::BridgeError;

// ----------------------------------------------------------------------------
// Writer Delegate Trait
// ----------------------------------------------------------------------------

/// Consumer-side contract invoked by the writer bridge
///
/// The bridge calls into the delegate to hand over elements accepted from
/// producers and to signal termination. All callouts are made with no internal
/// lock held and are serialized: at any moment at most one delegate method is
/// executing, although consecutive callouts may arrive on different producer
/// threads.
///
/// ## Reentrancy
///
/// `did_yield` implementations may call `set_writability` on their own
/// [`Sink`](crate::Sink) handle. The bridge converts such reentrant toggles
/// into buffered work that is drained after the current callout returns; no
/// nested delegate invocation ever occurs.
///
/// ## Blocking
///
/// Delegate methods must not block indefinitely. A blocked callout stalls
/// every producer of this writer.
pub trait WriterDelegate: Send + Sync + 'static {
    /// The element type accepted from producers
    type Element: Send + 'static;

    /// Deliver a contiguous batch of elements to the downstream transport
    fn did_yield(&self, elements: Vec<Self::Element>);

    /// Fast path for single-element batches
    ///
    /// The default implementation wraps the element into a one-element batch
    /// and calls [`did_yield`](WriterDelegate::did_yield).
    fn did_yield_element(&self, element: Self::Element) {
        self.did_yield(vec![element]);
    }

    /// Signal that the writer has terminated
    ///
    /// Called exactly once over the lifetime of a writer, after every element
    /// accepted before termination has been delivered. `error` carries the
    /// originating finish error, or `None` on a clean finish. This is the
    /// delegate's cue to release downstream resources.
    fn did_terminate(&self, error: Option<BridgeError>);
}

// Shared-ownership delegates are common in tests and in consumers that need
// to keep a handle on their own delegate after handing it to `create_writer`.
impl<D: WriterDelegate> WriterDelegate for std::sync::Arc<D> {
    type Element = D::Element;

    fn did_yield(&self, elements: Vec<Self::Element>) {
        (**self).did_yield(elements);
    }

    fn did_yield_element(&self, element: Self::Element) {
        (**self).did_yield_element(element);
    }

    fn did_terminate(&self, error: Option<BridgeError>) {
        (**self).did_terminate(error);
    }
}
