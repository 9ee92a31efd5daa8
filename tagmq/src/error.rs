//! Error types for tagmq.

use thiserror::Error;

use crate::tag::PatternClass;

/// Error type for tagmq operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Two entries claimed the same completion. Queue state is corrupt.
    #[error("duplicate match for request {id}")]
    DuplicateMatch { id: u64 },
    /// A match queue's internal bookkeeping disagrees with its contents.
    #[error("match queue corrupted: {0}")]
    QueueCorrupted(&'static str),
    /// No hash config could be made available for a pattern class.
    #[error("hash config table full, {class:?} stays on the linear list")]
    CapacityExceeded { class: PatternClass },
    /// The rendezvous handshake did not agree on a usable window.
    #[error("rendezvous window negotiation failed: requested {requested}, peer offered {offered:?}")]
    WindowNegotiationFailed {
        requested: usize,
        offered: Option<usize>,
    },
    /// A debug-discipline lock was re-acquired by its owning thread.
    #[error("recursive acquisition of a context lock")]
    RecursiveLock,
    /// The owning context closed before the request completed.
    #[error("request cancelled")]
    Cancelled,
    /// Failure reported by the transport collaborator.
    #[error("transport error: {0}")]
    Transport(String),
    /// Rail index outside the supported range.
    #[error("invalid rail {rail}")]
    InvalidRail { rail: usize },
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// IO error from a register/BAR backend.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for tagmq operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Report a matching-structure invariant violation and abort the operation.
///
/// Queue corruption cannot be recovered from, so this never returns.
#[cold]
#[track_caller]
pub fn fatal(err: Error) -> ! {
    tracing::error!(error = %err, "match queue invariant violated");
    panic!("tagmq: {err}");
}
