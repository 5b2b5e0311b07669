//! Typed errors for the playout engine.
//!
//! [`EngineError`] is the top-level error of the control surface. Faults
//! that do not change a channel's fate (transient decode errors, queue
//! overflow) never appear here; they are counted where they happen.

use thiserror::Error;

use kinocast_decode::DecodeError;

/// Errors produced by the transport writer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No consumer is attached; nothing was written.
    #[error("no consumer connected")]
    NotConnected,
    /// The consumer went away mid-write; the client has been closed.
    #[error("consumer disconnected during write")]
    Disconnected,
    /// Listener setup or teardown failed.
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced by the control surface of the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Operation requirements were not met; no state was mutated.
    #[error("precondition violated: {reason}")]
    PreconditionViolation { reason: String },
    /// Unknown channel.
    #[error("channel {channel_id} not found")]
    NotFound { channel_id: i32 },
    /// A bounded wait expired.
    #[error("timed out waiting for {what} after {waited_ms}ms")]
    Timeout { what: &'static str, waited_ms: u64 },
    /// The decoder became non-functional; stop is required to recover.
    #[error("decoder failed: {0}")]
    DecoderFatal(#[from] DecodeError),
    /// The producer slot ended in a failed state.
    #[error("producer slot failed: {reason}")]
    SlotFailed { reason: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Programmer error surfaced at a boundary instead of a panic.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub(crate) fn precondition(reason: impl Into<String>) -> Self {
        Self::PreconditionViolation {
            reason: reason.into(),
        }
    }
}
