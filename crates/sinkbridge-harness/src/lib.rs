//! Sinkbridge Harness
//!
//! Deterministic [`WriterDelegate`](sinkbridge_core::WriterDelegate)
//! implementations for testing components built on the writer bridge:
//!
//! - [`RecordingDelegate`]: records every callout in memory, detects
//!   overlapping callouts, can run a caller-supplied hook from inside
//!   `did_yield` to exercise reentrancy, and simulates consumer latency per
//!   its [`RecordingConfig`].
//! - [`ForwardingDelegate`]: forwards callouts into a tokio channel so a
//!   test task can await them.

pub mod delegate;

pub use delegate::{
    DelegateEvent, DeliveredBatch, ForwardingDelegate, RecordingConfig, RecordingDelegate,
};
