//! # tagmq - adaptive tag matching for RDMA messaging
//!
//! This crate implements the receive-side matching core of a tagged
//! messaging library: posted receives are matched against arriving message
//! headers, and each matched pair is moved with a protocol picked from its
//! size, path and GPU residency.
//!
//! ## Features
//!
//! - **Learned hashing**: pattern classes whose queues grow past a threshold
//!   get their own hash subqueue; idle ones are evicted or released
//! - **Per-key FIFO**: among receives that accept a message, the oldest wins
//! - **Protocol selection**: TINY, EAGER or RENDEZVOUS with per-path
//!   thresholds and window negotiation
//! - **GPU staging**: page-aligned bounce buffers, prefetch pipelining and
//!   GPU-direct hysteresis
//! - **Lock disciplines**: spinlock, mutex, or a debug mutex that faults on
//!   recursive acquisition
//!
//! ## Usage
//!
//! ```
//! use std::sync::Arc;
//! use tagmq::{
//!     Arrival, BufferDesc, Context, Envelope, HostMemory, MatchConfig, MsgHeader, Path, PeerId,
//!     Selector, Tag,
//! };
//!
//! let ctx = Context::new(Arc::new(MatchConfig::default()), Arc::new(HostMemory))?;
//!
//! let post = ctx.post_receive(Tag(42), Selector::ALL, None, BufferDesc::new(0x1000, 64));
//! let arrival = ctx.message_arrived(MsgHeader {
//!     tag: Tag(42),
//!     sender: PeerId(3),
//!     path: Path::Shm,
//!     msg_len: 5,
//!     gpu_resident: false,
//!     envelope: Envelope::Eager(b"hello".to_vec()),
//! });
//! assert!(matches!(arrival, Arrival::Delivered(_)));
//! assert!(post.handle.outcome().unwrap().is_success());
//! # Ok::<(), tagmq::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`config`]: Configuration (`MatchConfig`) and constants
//! - [`tag`]: Tags, selectors, pattern classes and the match predicate
//! - [`list`]: Index-linked lists over a slab arena
//! - [`learn`]: Hash config table and selector learning
//! - [`queue`]: Posted and unexpected queues, matching (`MatchQueue`)
//! - [`completion`]: Completion handles (`RecvHandle`, `Outcome`)
//! - [`protocol`]: Protocol selection and rendezvous windows
//! - [`gpu`]: GPU staging policy
//! - [`lock`]: Lock disciplines
//! - [`transport`]: Collaborator interfaces and the simulator BAR
//! - [`context`]: Communication context (`Context`)

pub mod completion;
pub mod config;
pub mod context;
pub mod error;
pub mod gpu;
pub mod learn;
pub mod list;
pub mod lock;
pub mod protocol;
pub mod queue;
pub mod tag;
pub mod transport;

// Re-export main types
pub use completion::{Outcome, RecvHandle, RecvStatus, RequestId};
pub use config::{GpuProfile, LockKind, MatchConfig};
pub use context::{Arrival, Context, MatchStats, Post, ProbeStatus, RndvTransfer, TransferPlan};
pub use error::{Error, Result};
pub use gpu::{Direction, GpuStrategy};
pub use learn::ConfigId;
pub use protocol::{Chunk, Envelope, MsgHeader, Path, Protocol, RndvWindow};
pub use queue::{MatchFlags, QueueStats};
pub use tag::{PatternClass, PeerId, Selector, Tag};
pub use transport::{
    BarAccess, BufferDesc, GpuMemory, HostMemory, LoopbackTransport, SimBar, Transport,
};
