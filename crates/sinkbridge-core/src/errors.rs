//! Error types for the sinkbridge writer
//!
//! This module contains the single error vocabulary shared by producers and
//! the sink delegate: a writer that has finished, plus pass-through of
//! arbitrary user errors supplied to `finish_with_error`.

use std::sync::Arc;

/// Convenience alias used throughout the crate
pub type BridgeResult<T> = core::result::Result<T, BridgeError>;

/// Errors surfaced to producers and to the sink delegate
///
/// User-supplied termination errors are wrapped in an [`Arc`] so that one
/// error instance can resolve every suspended producer and still be handed
/// to the delegate's `did_terminate` afterwards.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// The writer or sink has already finished; no further writes are accepted
    #[error("writer has already finished")]
    AlreadyFinished,
    /// The sink was finished with a caller-supplied error
    #[error(transparent)]
    Terminated(Arc<dyn std::error::Error + Send + Sync + 'static>),
}

impl PartialEq for BridgeError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (BridgeError::AlreadyFinished, BridgeError::AlreadyFinished) => true,
            (BridgeError::Terminated(a), BridgeError::Terminated(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl BridgeError {
    /// Wrap an arbitrary user error for propagation through the bridge
    pub fn terminated<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        BridgeError::Terminated(Arc::new(error))
    }

    /// Check whether this error is the `AlreadyFinished` taxonomy value
    pub fn is_already_finished(&self) -> bool {
        matches!(self, BridgeError::AlreadyFinished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("downstream channel closed")]
    struct DownstreamClosed;

    #[test]
    fn test_already_finished_display() {
        let error = BridgeError::AlreadyFinished;
        assert!(error.is_already_finished());
        assert_eq!(error.to_string(), "writer has already finished");
    }

    #[test]
    fn test_terminated_passes_user_error_through() {
        let error = BridgeError::terminated(DownstreamClosed);
        assert!(!error.is_already_finished());
        assert_eq!(error.to_string(), "downstream channel closed");

        // Clones share the same underlying user error
        let clone = error.clone();
        assert_eq!(clone.to_string(), "downstream channel closed");
    }
}
