//! Completion handles.
//!
//! Each posted receive has exactly one [`Completer`] (owned by the match
//! queue entry, later by a rendezvous transfer) and any number of
//! [`RecvHandle`] clones held by the application. The outcome is written
//! once; a second write is a fatal `DuplicateMatch`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use crate::error::{Error, Result, fatal};
use crate::protocol::Protocol;
use crate::tag::{PeerId, Tag};

/// Identifier of a posted receive or unexpected message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// What a successful receive delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvStatus {
    /// Tag of the matched message.
    pub tag: Tag,
    /// Sender of the matched message.
    pub sender: PeerId,
    /// Length the sender sent.
    pub msg_len: usize,
    /// Bytes placed in the receive buffer.
    pub recv_len: usize,
    /// Protocol the data moved with.
    pub protocol: Protocol,
    /// Inline payload for TINY/EAGER messages, to be placed by the caller.
    pub data: Option<Vec<u8>>,
}

impl RecvStatus {
    /// True if the message was longer than the receive buffer.
    #[inline]
    pub fn truncated(&self) -> bool {
        self.recv_len < self.msg_len
    }
}

/// Terminal outcome of a receive.
#[derive(Debug)]
pub enum Outcome {
    Success(RecvStatus),
    Cancelled,
    TransportError(Error),
}

impl Outcome {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    /// The delivered status, or the reason there is none.
    pub fn status(&self) -> Result<&RecvStatus> {
        match self {
            Outcome::Success(s) => Ok(s),
            Outcome::Cancelled => Err(Error::Cancelled),
            Outcome::TransportError(e) => Err(Error::Transport(e.to_string())),
        }
    }
}

const PENDING: u8 = 0;
const MATCHED: u8 = 1;
const COMPLETE: u8 = 2;

struct Slot {
    id: RequestId,
    state: AtomicU8,
    outcome: OnceLock<Outcome>,
}

/// Application-side view of a receive.
#[derive(Clone)]
pub struct RecvHandle {
    slot: Arc<Slot>,
}

impl RecvHandle {
    #[inline]
    pub fn id(&self) -> RequestId {
        self.slot.id
    }

    /// True once an outcome has been delivered.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.slot.state.load(Ordering::Acquire) == COMPLETE
    }

    /// True once the receive has been paired with a message, whether or not
    /// its data has finished moving.
    #[inline]
    pub fn is_matched(&self) -> bool {
        self.slot.state.load(Ordering::Acquire) >= MATCHED
    }

    /// The outcome, if delivered.
    #[inline]
    pub fn outcome(&self) -> Option<&Outcome> {
        self.slot.outcome.get()
    }

    /// Spin until the outcome is delivered.
    pub fn spin_wait(&self) -> &Outcome {
        loop {
            if let Some(o) = self.slot.outcome.get() {
                return o;
            }
            std::hint::spin_loop();
        }
    }
}

impl std::fmt::Debug for RecvHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecvHandle")
            .field("id", &self.slot.id)
            .field("state", &self.slot.state.load(Ordering::Relaxed))
            .finish()
    }
}

/// Write side of a receive. Dropping it undelivered cancels the receive.
pub struct Completer {
    slot: Arc<Slot>,
}

impl Completer {
    /// Create a linked handle/completer pair.
    pub fn pair(id: RequestId) -> (RecvHandle, Completer) {
        let slot = Arc::new(Slot {
            id,
            state: AtomicU8::new(PENDING),
            outcome: OnceLock::new(),
        });
        (RecvHandle { slot: slot.clone() }, Completer { slot })
    }

    #[inline]
    pub fn id(&self) -> RequestId {
        self.slot.id
    }

    /// Record that the receive has been paired with a message.
    pub fn mark_matched(&self) {
        let _ = self.slot.state.compare_exchange(
            PENDING,
            MATCHED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Deliver the terminal outcome.
    pub fn complete(self, outcome: Outcome) {
        self.deliver(outcome);
    }

    fn deliver(&self, outcome: Outcome) {
        if self.slot.outcome.set(outcome).is_err() {
            fatal(Error::DuplicateMatch { id: self.slot.id.0 });
        }
        self.slot.state.store(COMPLETE, Ordering::Release);
    }
}

impl std::fmt::Debug for Completer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Completer").field(&self.slot.id).finish()
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if self.slot.state.load(Ordering::Acquire) != COMPLETE {
            self.deliver(Outcome::Cancelled);
        }
    }
}
