//! Communication context.
//!
//! A [`Context`] owns one match queue behind its lock, together with the
//! protocol selector and GPU staging state. Receives are posted and headers
//! delivered through it; a matched pair is completed on the spot for TINY
//! and EAGER messages, or handed back as an [`RndvTransfer`] that the caller
//! drives through the transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::completion::{Completer, Outcome, RecvHandle, RecvStatus, RequestId};
use crate::config::{LockKind, MatchConfig};
use crate::error::{Error, Result};
use crate::gpu::{Direction, GpuBufferManager, GpuStrategy};
use crate::lock::ContextLock;
use crate::protocol::{
    Chunk, Envelope, MsgHeader, Path, Protocol, ProtocolSelector, ProtocolThresholds, RndvWindow,
};
use crate::queue::{Hit, MatchFlags, MatchQueue, Pairing, PostedRecv, QueueStats, UnexpectedMsg};
use crate::tag::{PeerId, Selector, Tag};
use crate::transport::{BufferDesc, GpuMemory, Transport};

/// Result of posting a receive.
#[derive(Debug)]
pub struct Post {
    pub handle: RecvHandle,
    /// Set when the receive consumed an unexpected rendezvous request.
    pub transfer: Option<RndvTransfer>,
}

/// Result of delivering an arrived header.
#[derive(Debug)]
pub enum Arrival {
    /// Matched a TINY or EAGER message; the receive is complete.
    Delivered(RequestId),
    /// Matched a rendezvous request; drive the transfer to finish it.
    Rendezvous(RndvTransfer),
    /// Matched, but the rendezvous handshake failed; the receive completed
    /// with a transport error.
    Failed(RequestId),
    /// No receive wanted it; queued as unexpected under this id.
    Unexpected(RequestId),
    /// The context is closing or the header was malformed.
    Dropped,
}

/// Envelope of a queued unexpected message, as seen by a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeStatus {
    pub id: RequestId,
    pub tag: Tag,
    pub sender: PeerId,
    pub msg_len: usize,
    pub protocol: Protocol,
}

/// How an outgoing or incoming message of a given size will move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPlan {
    pub protocol: Protocol,
    /// Agreed window, for rendezvous.
    pub window: Option<RndvWindow>,
    pub gpu: GpuStrategy,
}

/// Snapshot of a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchStats {
    pub queue: QueueStats,
    pub thresholds: ProtocolThresholds,
    pub lock: LockKind,
    pub lock_contention: u64,
    pub gpu_qualifying_transfers: u32,
    pub closing: bool,
}

struct Inner {
    queue: MatchQueue,
    closing: bool,
}

/// One communication context.
pub struct Context {
    config: Arc<MatchConfig>,
    mem: Arc<dyn GpuMemory>,
    inner: ContextLock<Inner>,
    selector: ProtocolSelector,
    gpu: GpuBufferManager,
    next_id: AtomicU64,
}

impl Context {
    pub fn new(config: Arc<MatchConfig>, mem: Arc<dyn GpuMemory>) -> Result<Self> {
        config.validate()?;
        if let Some(profile) = config.gpu
            && profile.page_size() != mem.gpu_page_size()
        {
            return Err(Error::InvalidConfig(format!(
                "{:?} profile expects {} byte GPU pages, driver reports {}",
                profile,
                profile.page_size(),
                mem.gpu_page_size()
            )));
        }
        debug!(lock = ?config.lock, gpu = ?config.gpu, learn = config.learn_hash_selector, "context created");
        Ok(Self {
            inner: ContextLock::new(
                config.lock,
                Inner {
                    queue: MatchQueue::new(&config),
                    closing: false,
                },
            ),
            selector: ProtocolSelector::new(&config),
            gpu: GpuBufferManager::new(&config),
            next_id: AtomicU64::new(1),
            config,
            mem,
        })
    }

    #[inline]
    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    #[inline]
    fn next_id(&self) -> RequestId {
        RequestId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Post a receive for messages matching `tag` under `selector`, from
    /// `source` or from anyone.
    pub fn post_receive(
        &self,
        tag: Tag,
        selector: Selector,
        source: Option<PeerId>,
        buffer: BufferDesc,
    ) -> Post {
        let id = self.next_id();
        let (handle, completer) = Completer::pair(id);
        let recv = PostedRecv {
            id,
            tag,
            selector,
            source,
            buffer,
            completer,
        };

        let pairing = {
            let mut inner = self.inner.lock();
            if inner.closing {
                drop(inner);
                recv.completer.complete(Outcome::Cancelled);
                return Post {
                    handle,
                    transfer: None,
                };
            }
            inner.queue.post_receive(recv)
        };

        let transfer = match pairing.map(|p| self.finish(p)) {
            Some(Arrival::Rendezvous(t)) => Some(t),
            _ => None,
        };
        Post { handle, transfer }
    }

    /// Deliver an arrived header.
    pub fn message_arrived(&self, header: MsgHeader) -> Arrival {
        if let Err(e) = header.path.validate() {
            warn!(error = %e, tag = header.tag.0, "header dropped");
            return Arrival::Dropped;
        }
        let id = self.next_id();
        let pairing = {
            let mut inner = self.inner.lock();
            if inner.closing {
                debug!(tag = header.tag.0, sender = header.sender.0, "arrival on closing context dropped");
                return Arrival::Dropped;
            }
            inner.queue.message_arrived(UnexpectedMsg { id, header })
        };
        match pairing {
            Some(p) => self.finish(p),
            None => Arrival::Unexpected(id),
        }
    }

    /// Look for a queued unexpected message without consuming it.
    pub fn probe(&self, tag: Tag, selector: Selector, source: Option<PeerId>) -> Option<ProbeStatus> {
        let mut inner = self.inner.lock();
        let Some(Hit::Peeked(m)) =
            inner.queue.search_unexpected(tag, selector, source, MatchFlags::empty())
        else {
            return None;
        };
        Some(ProbeStatus {
            id: m.id,
            tag: m.header.tag,
            sender: m.header.sender,
            msg_len: m.header.msg_len,
            protocol: self.selector.classify(&m.header),
        })
    }

    /// Poll `transport` until it runs dry, delivering every header and
    /// handing each result to `on_arrival`. Returns the number of headers.
    pub fn progress<T, F>(&self, transport: &T, mut on_arrival: F) -> usize
    where
        T: Transport + ?Sized,
        F: FnMut(Arrival),
    {
        let mut n = 0;
        while let Some(header) = transport.poll() {
            on_arrival(self.message_arrived(header));
            n += 1;
        }
        n
    }

    /// Protocol for a message of `size` bytes over `path`.
    pub fn select_protocol(&self, size: usize, path: Path, gpu_resident: bool) -> Result<Protocol> {
        self.selector.select_protocol(size, path, gpu_resident)
    }

    /// Full data-movement plan for a message of `size` bytes in `buffer`.
    /// `peer_window` is the window the peer offered, used for rendezvous.
    pub fn plan(
        &self,
        size: usize,
        path: Path,
        dir: Direction,
        buffer: &BufferDesc,
        peer_window: Option<usize>,
    ) -> Result<TransferPlan> {
        let gpu_resident = self.mem.is_gpu_resident(buffer);
        let protocol = self.select_protocol(size, path, gpu_resident)?;
        let window = match protocol {
            Protocol::Rendezvous => Some(self.selector.negotiate(self.config.rndv_window, peer_window)?),
            Protocol::Tiny | Protocol::Eager => None,
        };
        let gpu = self.gpu.plan(
            protocol,
            dir,
            buffer.addr,
            size,
            window.map_or(0, |w| w.window),
            gpu_resident,
        );
        Ok(TransferPlan {
            protocol,
            window,
            gpu,
        })
    }

    /// Close the context: cancel every posted receive and discard unexpected
    /// messages. Later posts complete as cancelled and later arrivals are
    /// dropped. Returns the number of receives cancelled.
    pub fn on_context_closing(&self) -> usize {
        let drained = {
            let mut inner = self.inner.lock();
            inner.closing = true;
            inner.queue.drain()
        };
        let n = drained.len();
        for recv in drained {
            recv.completer.complete(Outcome::Cancelled);
        }
        debug!(cancelled = n, "context closing");
        n
    }

    pub fn is_closing(&self) -> bool {
        self.inner.lock().closing
    }

    pub fn stats(&self) -> MatchStats {
        let inner = self.inner.lock();
        MatchStats {
            queue: inner.queue.stats(),
            thresholds: self.selector.thresholds(),
            lock: self.inner.kind(),
            lock_contention: self.inner.contention_count(),
            gpu_qualifying_transfers: self.gpu.qualifying_transfers(),
            closing: inner.closing,
        }
    }

    /// Complete or hand off a matched pair. Runs outside the lock.
    fn finish(&self, pairing: Pairing) -> Arrival {
        let Pairing { recv, msg } = pairing;
        let header = msg.header;
        let recv_len = header.msg_len.min(recv.buffer.len);
        let protocol = self.selector.classify(&header);

        match header.envelope {
            Envelope::Tiny(mut data) | Envelope::Eager(mut data) => {
                data.truncate(recv_len);
                recv.completer.complete(Outcome::Success(RecvStatus {
                    tag: header.tag,
                    sender: header.sender,
                    msg_len: header.msg_len,
                    recv_len,
                    protocol,
                    data: Some(data),
                }));
                Arrival::Delivered(recv.id)
            }
            Envelope::RndvRequest { window: offered } => {
                match self.selector.negotiate(self.config.rndv_window, offered) {
                    Ok(window) => {
                        let gpu_resident =
                            header.gpu_resident || self.mem.is_gpu_resident(&recv.buffer);
                        let strategy = self.gpu.plan(
                            Protocol::Rendezvous,
                            Direction::Recv,
                            recv.buffer.addr,
                            recv_len,
                            window.window,
                            gpu_resident,
                        );
                        if window.resegmented() {
                            debug!(
                                requested = window.requested,
                                window = window.window,
                                "rendezvous resegmented to peer window"
                            );
                        }
                        Arrival::Rendezvous(RndvTransfer::new(
                            recv.id,
                            &header,
                            recv_len,
                            window,
                            strategy,
                            recv.completer,
                        ))
                    }
                    Err(e) => {
                        warn!(error = %e, id = recv.id.0, "rendezvous handshake failed");
                        recv.completer.complete(Outcome::TransportError(e));
                        Arrival::Failed(recv.id)
                    }
                }
            }
        }
    }
}

/// Receive side of one rendezvous transfer.
///
/// Chunks are requested from the sender up to the strategy's in-flight
/// limit; the receive completes once every chunk has landed. Dropping an
/// unfinished transfer fails the receive.
///
/// Under staging, chunk boundaries fall on GPU pages: the first chunk is
/// short by the buffer's offset into its page.
#[derive(Debug)]
pub struct RndvTransfer {
    id: RequestId,
    tag: Tag,
    sender: PeerId,
    path: Path,
    msg_len: usize,
    recv_len: usize,
    window: RndvWindow,
    strategy: GpuStrategy,
    step: usize,
    lead: usize,
    next_chunk: usize,
    landed: Vec<bool>,
    in_flight: usize,
    done_bytes: usize,
    completer: Option<Completer>,
}

impl RndvTransfer {
    fn new(
        id: RequestId,
        header: &MsgHeader,
        recv_len: usize,
        window: RndvWindow,
        strategy: GpuStrategy,
        completer: Completer,
    ) -> Self {
        let step = match strategy {
            GpuStrategy::Staged { chunk, .. } => chunk.min(window.window),
            _ => window.window,
        }
        .max(1);
        let lead = if recv_len == 0 { 0 } else { strategy.lead() % step };
        let chunks = (lead + recv_len).div_ceil(step);
        Self {
            id,
            tag: header.tag,
            sender: header.sender,
            path: header.path,
            msg_len: header.msg_len,
            recv_len,
            window,
            strategy,
            step,
            lead,
            next_chunk: 0,
            landed: vec![false; chunks],
            in_flight: 0,
            done_bytes: 0,
            completer: Some(completer),
        }
    }

    #[inline]
    pub fn id(&self) -> RequestId {
        self.id
    }

    #[inline]
    pub fn window(&self) -> RndvWindow {
        self.window
    }

    #[inline]
    pub fn strategy(&self) -> GpuStrategy {
        self.strategy
    }

    /// Bytes that will be placed in the receive buffer.
    #[inline]
    pub fn recv_len(&self) -> usize {
        self.recv_len
    }

    #[inline]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Size of each requested chunk.
    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.step
    }

    /// Chunks still to be requested.
    #[inline]
    pub fn remaining_chunks(&self) -> usize {
        self.landed.len() - self.next_chunk
    }

    /// Byte range of chunk `idx` within the receive buffer.
    fn chunk_at(&self, idx: usize) -> Chunk {
        let start = (idx * self.step).saturating_sub(self.lead);
        let end = ((idx + 1) * self.step - self.lead).min(self.recv_len);
        Chunk {
            offset: start,
            len: end - start,
        }
    }

    /// Request as many chunks as the in-flight limit allows.
    ///
    /// On a send error the failed chunk is not counted as issued, so a
    /// later call retries it.
    pub fn issue<T: Transport + ?Sized>(&mut self, transport: &T) -> Result<usize> {
        let limit = self.strategy.max_in_flight().unwrap_or(usize::MAX);
        let mut issued = 0;
        while self.in_flight < limit && self.next_chunk < self.landed.len() {
            let chunk = self.chunk_at(self.next_chunk);
            transport.send(self.path, self.sender, self.id, chunk)?;
            self.next_chunk += 1;
            self.in_flight += 1;
            issued += 1;
        }
        Ok(issued)
    }

    /// Record that `chunk` has landed.
    ///
    /// A chunk that was never issued, does not line up with an issued
    /// chunk, or has already landed is rejected and leaves the transfer
    /// unchanged.
    pub fn chunk_complete(&mut self, chunk: Chunk) -> Result<()> {
        let idx = chunk
            .offset
            .checked_add(self.lead)
            .map(|pos| pos / self.step)
            .filter(|&idx| idx < self.next_chunk && self.chunk_at(idx) == chunk)
            .ok_or_else(|| {
                Error::Transport(format!(
                    "completion for unissued chunk at offset {} len {}",
                    chunk.offset, chunk.len
                ))
            })?;
        if self.landed[idx] {
            return Err(Error::Transport(format!(
                "chunk at offset {} completed twice",
                chunk.offset
            )));
        }
        self.landed[idx] = true;
        self.in_flight -= 1;
        self.done_bytes += chunk.len;
        Ok(())
    }

    /// True once every byte has been requested and has landed.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.landed.iter().all(|&l| l)
    }

    /// Complete the receive successfully. Fails the receive instead if
    /// bytes are still outstanding.
    pub fn complete(mut self) -> Result<RequestId> {
        if !self.is_done() {
            let err = Error::Transport(format!(
                "rendezvous completed with {} of {} bytes",
                self.done_bytes, self.recv_len
            ));
            return Err(err);
        }
        if let Some(c) = self.completer.take() {
            c.complete(Outcome::Success(RecvStatus {
                tag: self.tag,
                sender: self.sender,
                msg_len: self.msg_len,
                recv_len: self.recv_len,
                protocol: Protocol::Rendezvous,
                data: None,
            }));
        }
        Ok(self.id)
    }

    /// Fail the receive with a transport error.
    pub fn fail(mut self, err: Error) {
        if let Some(c) = self.completer.take() {
            c.complete(Outcome::TransportError(err));
        }
    }
}

impl Drop for RndvTransfer {
    fn drop(&mut self) {
        if let Some(c) = self.completer.take() {
            c.complete(Outcome::TransportError(Error::Transport(format!(
                "rendezvous abandoned after {} of {} bytes",
                self.done_bytes, self.recv_len
            ))));
        }
    }
}
