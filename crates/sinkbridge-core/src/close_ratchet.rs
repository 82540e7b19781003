//! Half-Closure Coordinator
//!
//! A duplex channel has two independent halves that each close exactly once.
//! The ratchet tracks which halves have closed and tells the caller what to
//! do next: nothing yet, half-close the output, or perform the full teardown.
//! Whichever side closes last triggers the full close.
//!
//! Pure and synchronous; the surrounding duplex handler owns the instance and
//! drives it from its own event loop.

// ----------------------------------------------------------------------------
// Actions
// ----------------------------------------------------------------------------

/// What the caller must do after reporting a half-closure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Wait for the peer half
    Nothing,
    /// Both halves are closed: perform the full teardown
    Close,
    /// Half-close the write side only
    CloseOutput,
}

// ----------------------------------------------------------------------------
// Ratchet
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RatchetState {
    NotClosed { half_close_enabled: bool },
    ReadClosed,
    WriteClosed,
    BothClosed,
}

/// Two-half closure coordinator
///
/// Each half may be closed exactly once; closing the same half twice is a
/// programming error and panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseRatchet {
    state: RatchetState,
}

impl CloseRatchet {
    /// Create a ratchet.
    ///
    /// With `half_close_enabled`, closing the write side first half-closes
    /// the output instead of waiting silently for the peer.
    pub fn new(half_close_enabled: bool) -> Self {
        Self {
            state: RatchetState::NotClosed { half_close_enabled },
        }
    }

    /// Report that the read half closed.
    pub fn close_read(&mut self) -> CloseAction {
        match self.state {
            RatchetState::NotClosed { .. } => {
                self.state = RatchetState::ReadClosed;
                CloseAction::Nothing
            }
            RatchetState::WriteClosed => {
                self.state = RatchetState::BothClosed;
                CloseAction::Close
            }
            RatchetState::ReadClosed | RatchetState::BothClosed => {
                panic!("read half closed twice")
            }
        }
    }

    /// Report that the write half closed.
    pub fn close_write(&mut self) -> CloseAction {
        match self.state {
            RatchetState::NotClosed { half_close_enabled } => {
                self.state = RatchetState::WriteClosed;
                if half_close_enabled {
                    CloseAction::CloseOutput
                } else {
                    CloseAction::Nothing
                }
            }
            RatchetState::ReadClosed => {
                self.state = RatchetState::BothClosed;
                CloseAction::Close
            }
            RatchetState::WriteClosed | RatchetState::BothClosed => {
                panic!("write half closed twice")
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
