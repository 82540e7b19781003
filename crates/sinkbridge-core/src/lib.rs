//! Sinkbridge Core
//!
//! An asynchronous, back-pressured writer that bridges concurrent async
//! producers to a single-threaded synchronous consumer.
//!
//! ## Architecture Overview
//!
//! The crate is built from three cooperating pieces:
//!
//! - **Writer handle** ([`Writer`]): producer-facing. Accepts elements,
//!   suspends callers while the sink applies back-pressure, propagates
//!   cancellation (dropping a suspended write future) and finish.
//! - **Sink handle** ([`Sink`]): consumer-facing. Toggles the writability
//!   flag, finishes the consumer side, exposes a [`WriterStats`] snapshot.
//! - **Shared storage + state machine** (internal): a single mutex-guarded
//!   tagged automaton. Every event computes the next state and an action;
//!   delegate callouts and producer resumptions run strictly outside the
//!   lock, and a drain loop after each callout picks up work that
//!   accumulated reentrantly.
//!
//! Elements flow producer -> [`Writer`] -> storage -> [`WriterDelegate`]
//! -> downstream transport. The delegate's `did_terminate` fires exactly
//! once, after every accepted element has been delivered.
//!
//! The [`close_ratchet`] module carries the companion half-closure
//! coordinator used by duplex handlers built on top of the bridge.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sinkbridge_core::{create_writer, BridgeError, WriterConfig, WriterDelegate};
//!
//! struct PrintDelegate;
//!
//! impl WriterDelegate for PrintDelegate {
//!     type Element = String;
//!
//!     fn did_yield(&self, elements: Vec<String>) {
//!         for element in elements {
//!             println!("{element}");
//!         }
//!     }
//!
//!     fn did_terminate(&self, error: Option<BridgeError>) {
//!         println!("terminated: {error:?}");
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (writer, sink) = create_writer(&WriterConfig::default(), PrintDelegate);
//!
//! writer.write_all(["hello".to_string(), "world".to_string()]).await?;
//!
//! // Apply back-pressure: subsequent writes suspend...
//! sink.set_writability(false);
//! // ...until the transport has capacity again.
//! sink.set_writability(true);
//!
//! writer.finish();
//! # Ok(())
//! # }
//! ```

pub mod close_ratchet;
pub mod config;
pub mod errors;
pub mod writer;

pub use close_ratchet::{CloseAction, CloseRatchet};
pub use config::WriterConfig;
pub use errors::{BridgeError, BridgeResult};
pub use writer::{create_writer, Sink, Writer, WriterDelegate, WriterPhase, WriterStats};
