//! Transport protocol selection.
//!
//! A message moves with one of three protocols:
//!
//! - **TINY**: payload of at most `tiny_max` bytes carried in the header.
//! - **EAGER**: payload copied into receiver-side storage without waiting
//!   for the receiver. Used below the path's rendezvous threshold.
//! - **RENDEZVOUS**: sender and receiver agree on a window first; data is
//!   then placed directly into the destination buffer in window-sized chunks.
//!
//! Thresholds depend on the path, so a message that is EAGER over shared
//! memory may be RENDEZVOUS over a NIC rail.

use crate::config::{MAX_RAILS, MatchConfig};
use crate::error::{Error, Result};
use crate::tag::{PeerId, Tag};

/// Route a message takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Path {
    /// Intra-node shared memory.
    Shm,
    /// NIC fabric, on one of up to `MAX_RAILS` devices.
    Nic { rail: u8 },
}

impl Path {
    /// Reject rail indices outside `0..MAX_RAILS`.
    pub fn validate(self) -> Result<Self> {
        match self {
            Path::Nic { rail } if rail as usize >= MAX_RAILS => Err(Error::InvalidRail {
                rail: rail as usize,
            }),
            _ => Ok(self),
        }
    }
}

/// Wire protocol chosen for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tiny,
    Eager,
    Rendezvous,
}

/// Sender-side envelope carried by an incoming header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Payload inline in the header.
    Tiny(Vec<u8>),
    /// Payload copied eagerly.
    Eager(Vec<u8>),
    /// Request to send; carries the window the sender can serve, if the
    /// handshake produced one.
    RndvRequest { window: Option<usize> },
}

/// An arrived message header as handed over by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgHeader {
    pub tag: Tag,
    pub sender: PeerId,
    pub path: Path,
    /// Full message length.
    pub msg_len: usize,
    /// True if the sender's buffer is GPU memory.
    pub gpu_resident: bool,
    pub envelope: Envelope,
}

impl MsgHeader {
    /// Inline payload, for TINY and EAGER envelopes.
    pub fn inline_data(&self) -> Option<&[u8]> {
        match &self.envelope {
            Envelope::Tiny(d) | Envelope::Eager(d) => Some(d),
            Envelope::RndvRequest { .. } => None,
        }
    }
}

/// Byte range of one rendezvous chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub offset: usize,
    pub len: usize,
}

/// Outcome of a window handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RndvWindow {
    /// Window asked for, after clamping.
    pub requested: usize,
    /// Window both sides agreed on.
    pub window: usize,
}

impl RndvWindow {
    /// True if the peer offered less than was requested.
    #[inline]
    pub fn resegmented(&self) -> bool {
        self.window < self.requested
    }

    /// Split `len` bytes into window-sized chunks.
    pub fn chunks(&self, len: usize) -> Chunks {
        Chunks {
            offset: 0,
            len,
            step: self.window,
        }
    }

    /// Number of chunks needed for `len` bytes.
    #[inline]
    pub fn num_chunks(&self, len: usize) -> usize {
        len.div_ceil(self.window)
    }
}

/// Iterator over the chunks of a transfer.
#[derive(Debug, Clone)]
pub struct Chunks {
    offset: usize,
    len: usize,
    step: usize,
}

impl Iterator for Chunks {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.offset >= self.len {
            return None;
        }
        let len = self.step.min(self.len - self.offset);
        let chunk = Chunk {
            offset: self.offset,
            len,
        };
        self.offset += len;
        Some(chunk)
    }
}

/// Current protocol thresholds, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolThresholds {
    pub tiny_max: usize,
    pub rndv_shm: usize,
    pub rndv_nic: usize,
    pub window: usize,
    pub window_max: usize,
}

/// Picks the protocol and negotiates rendezvous windows.
#[derive(Debug, Clone)]
pub struct ProtocolSelector {
    thresholds: ProtocolThresholds,
}

impl ProtocolSelector {
    pub fn new(config: &MatchConfig) -> Self {
        Self {
            thresholds: ProtocolThresholds {
                tiny_max: config.tiny_max,
                rndv_shm: config.rndv_shm_thresh,
                rndv_nic: config.rndv_nic_thresh,
                window: config.rndv_window.min(config.rndv_window_max),
                window_max: config.rndv_window_max,
            },
        }
    }

    #[inline]
    pub fn thresholds(&self) -> ProtocolThresholds {
        self.thresholds
    }

    /// Size at and above which `path` uses rendezvous.
    #[inline]
    pub fn rndv_threshold(&self, path: Path) -> usize {
        match path {
            Path::Shm => self.thresholds.rndv_shm,
            Path::Nic { .. } => self.thresholds.rndv_nic,
        }
    }

    /// Choose the protocol for a message of `size` bytes over `path`.
    ///
    /// GPU-resident payloads cannot be inlined into a header without a
    /// device copy, so they never take TINY.
    pub fn select_protocol(&self, size: usize, path: Path, gpu_resident: bool) -> Result<Protocol> {
        let path = path.validate()?;
        Ok(if size >= self.rndv_threshold(path) {
            Protocol::Rendezvous
        } else if size <= self.thresholds.tiny_max && !gpu_resident {
            Protocol::Tiny
        } else {
            Protocol::Eager
        })
    }

    /// Classify an arrived header by its envelope.
    #[inline]
    pub fn classify(&self, header: &MsgHeader) -> Protocol {
        match header.envelope {
            Envelope::Tiny(_) => Protocol::Tiny,
            Envelope::Eager(_) => Protocol::Eager,
            Envelope::RndvRequest { .. } => Protocol::Rendezvous,
        }
    }

    /// Clamp a requested window to the configured maximum. `None` asks for
    /// the default window.
    #[inline]
    pub fn requested_window(&self, want: Option<usize>) -> usize {
        want.unwrap_or(self.thresholds.window)
            .clamp(1, self.thresholds.window_max)
    }

    /// Agree on a window with a peer that offered `offered`.
    ///
    /// A smaller offer is honored and the transfer resegmented. No offer, or
    /// a zero offer, fails the handshake; it is not retried.
    pub fn negotiate(&self, requested: usize, offered: Option<usize>) -> Result<RndvWindow> {
        let requested = self.requested_window(Some(requested));
        match offered {
            Some(peer) if peer > 0 => Ok(RndvWindow {
                requested,
                window: requested.min(peer),
            }),
            _ => Err(Error::WindowNegotiationFailed { requested, offered }),
        }
    }
}
