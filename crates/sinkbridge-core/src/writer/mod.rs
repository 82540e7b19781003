//! Back-Pressured Writer Bridge
//!
//! Bridges any number of asynchronous producers to a single synchronous
//! consumer. Producers submit elements through a [`Writer`]; the consumer
//! receives them through a [`WriterDelegate`] whenever the [`Sink`]'s
//! writability flag is on, and producers suspend while it is off.
//!
//! Construction goes through [`create_writer`]:
//!
//! ```rust,ignore
//! let (writer, sink) = create_writer(&WriterConfig::default(), delegate);
//! ```
//!
//! Internals: a single mutex-guarded state machine computes transitions and
//! returns actions; the shared storage executes those actions strictly
//! outside the lock.

use std::sync::Arc;

use crate::config::WriterConfig;

pub mod delegate;
mod handle;
mod sink;
mod state;
mod storage;

pub use delegate::WriterDelegate;
pub use handle::Writer;
pub use sink::Sink;
pub use state::{WriterPhase, WriterStats};

use storage::Storage;

/// Create a connected writer/sink pair around the given delegate
///
/// The [`Writer`] goes to the producer side, the [`Sink`] stays with the
/// consumer that owns the downstream transport.
pub fn create_writer<D: WriterDelegate>(
    config: &WriterConfig,
    delegate: D,
) -> (Writer<D>, Sink<D>) {
    let storage = Arc::new(Storage::new(config.initially_writable, delegate));
    (Writer::new(Arc::clone(&storage)), Sink::new(storage))
}
