//! Common test utilities for tagmq integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use tagmq::{
    BufferDesc, Context, Envelope, HostMemory, LockKind, MatchConfig, MsgHeader, Path, PeerId, Tag,
};

/// Context over host memory with the given config.
pub fn context(config: MatchConfig) -> Context {
    Context::new(Arc::new(config), Arc::new(HostMemory)).expect("valid config")
}

/// Context with default config and the given lock discipline.
pub fn context_with_lock(lock: LockKind) -> Context {
    context(MatchConfig::default().with_lock(lock))
}

/// Host buffer of `len` bytes.
pub fn buffer(len: usize) -> BufferDesc {
    BufferDesc::new(0x10_0000, len)
}

/// Eager header of `len` bytes over shared memory.
pub fn eager(tag: u64, sender: u64, len: usize) -> MsgHeader {
    MsgHeader {
        tag: Tag(tag),
        sender: PeerId(sender),
        path: Path::Shm,
        msg_len: len,
        gpu_resident: false,
        envelope: Envelope::Eager(vec![0xab; len]),
    }
}

/// Rendezvous request over NIC rail 0.
pub fn rndv(tag: u64, sender: u64, len: usize, window: Option<usize>) -> MsgHeader {
    MsgHeader {
        tag: Tag(tag),
        sender: PeerId(sender),
        path: Path::Nic { rail: 0 },
        msg_len: len,
        gpu_resident: false,
        envelope: Envelope::RndvRequest { window },
    }
}
