//! GPU-aware staging policy.
//!
//! Decides how the bytes of a matched message move when either endpoint
//! buffer lives in GPU memory: a single GPU-direct copy for small payloads,
//! page-aligned staging through a host bounce buffer, or GPU-direct
//! rendezvous once a context has seen enough qualifying transfers.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::debug;

use crate::config::{GpuProfile, MatchConfig};
use crate::protocol::Protocol;

/// Direction of a transfer relative to this endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

/// How the data of one message moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuStrategy {
    /// Plain host memory, no GPU involvement.
    Host,
    /// Single GPU-direct copy.
    GdrCopy,
    /// Copy through the host bounce buffer in `chunk`-sized pieces, with
    /// `prefetch` pieces in flight. Staging starts at the GPU page holding
    /// the buffer, `lead` bytes before its first byte.
    Staged {
        chunk: usize,
        prefetch: usize,
        lead: usize,
    },
    /// Direct placement into GPU memory, `prefetch` chunks in flight.
    GpuDirect { prefetch: usize },
}

impl GpuStrategy {
    /// Chunks allowed in flight, or `None` if unbounded.
    #[inline]
    pub fn max_in_flight(&self) -> Option<usize> {
        match *self {
            GpuStrategy::Host => None,
            GpuStrategy::GdrCopy => Some(1),
            GpuStrategy::Staged { prefetch, .. } | GpuStrategy::GpuDirect { prefetch } => {
                Some(prefetch)
            }
        }
    }

    /// Offset of the buffer start within its first staged page.
    #[inline]
    pub fn lead(&self) -> usize {
        match *self {
            GpuStrategy::Staged { lead, .. } => lead,
            _ => 0,
        }
    }

    #[inline]
    pub fn is_gpu(&self) -> bool {
        !matches!(self, GpuStrategy::Host)
    }
}

/// Per-context GPU staging state.
#[derive(Debug)]
pub struct GpuBufferManager {
    profile: Option<GpuProfile>,
    page_size: usize,
    small_host_buf: usize,
    prefetch: usize,
    gdr_copy_limit_send: usize,
    gdr_copy_limit_recv: usize,
    gpudirect_thresh_rv: u32,
    qualifying_rv: AtomicU32,
}

impl GpuBufferManager {
    pub fn new(config: &MatchConfig) -> Self {
        Self {
            profile: config.gpu,
            page_size: config.gpu.map_or(4096, GpuProfile::page_size),
            small_host_buf: config.gpu_small_host_buf,
            prefetch: config.gpu_window_prefetch.max(1),
            gdr_copy_limit_send: config.gdr_copy_limit_send,
            gdr_copy_limit_recv: config.gdr_copy_limit_recv,
            gpudirect_thresh_rv: config.gpudirect_thresh_rv,
            qualifying_rv: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.profile.is_some()
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Offset of `addr` within its GPU page.
    #[inline]
    pub fn page_offset(&self, addr: u64) -> usize {
        (addr & (self.page_size as u64 - 1)) as usize
    }

    /// `addr` rounded down to its GPU page.
    #[inline]
    pub fn page_align_down(&self, addr: u64) -> u64 {
        addr & !(self.page_size as u64 - 1)
    }

    /// Bytes that must be staged to cover `[addr, addr + len)` with whole
    /// GPU pages.
    pub fn staging_span(&self, addr: u64, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        (self.page_offset(addr) + len).next_multiple_of(self.page_size)
    }

    /// GPU-direct single-copy limit for a direction.
    #[inline]
    pub fn gdr_copy_limit(&self, dir: Direction) -> usize {
        match dir {
            Direction::Send => self.gdr_copy_limit_send,
            Direction::Recv => self.gdr_copy_limit_recv,
        }
    }

    /// Qualifying GPU rendezvous transfers seen so far.
    #[inline]
    pub fn qualifying_transfers(&self) -> u32 {
        self.qualifying_rv.load(Ordering::Relaxed)
    }

    /// Choose how a message of `len` bytes at `addr` moves.
    ///
    /// Each GPU-resident rendezvous counts toward the hysteresis threshold;
    /// GPU-direct engages only once that many have been seen before it.
    pub fn plan(
        &self,
        protocol: Protocol,
        dir: Direction,
        addr: u64,
        len: usize,
        window: usize,
        gpu_resident: bool,
    ) -> GpuStrategy {
        if !gpu_resident || !self.is_enabled() {
            return GpuStrategy::Host;
        }
        match protocol {
            Protocol::Tiny | Protocol::Eager => {
                if len <= self.gdr_copy_limit(dir) {
                    GpuStrategy::GdrCopy
                } else {
                    GpuStrategy::Staged {
                        chunk: self
                            .staging_span(addr, len)
                            .min(self.staging_chunk(usize::MAX)),
                        prefetch: 1,
                        lead: self.page_offset(addr),
                    }
                }
            }
            Protocol::Rendezvous => {
                let prior = self.qualifying_rv.fetch_add(1, Ordering::Relaxed);
                if prior >= self.gpudirect_thresh_rv {
                    if prior == self.gpudirect_thresh_rv {
                        debug!(transfers = prior + 1, "gpu-direct rendezvous engaged");
                    }
                    GpuStrategy::GpuDirect {
                        prefetch: self.prefetch,
                    }
                } else {
                    GpuStrategy::Staged {
                        chunk: self.staging_chunk(window),
                        prefetch: self.prefetch,
                        lead: self.page_offset(addr),
                    }
                }
            }
        }
    }

    /// Largest whole number of GPU pages that fits both the window and the
    /// host bounce buffer, at least one page.
    fn staging_chunk(&self, window: usize) -> usize {
        let cap = window.min(self.small_host_buf);
        (cap - cap % self.page_size).max(self.page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cuda() -> GpuBufferManager {
        GpuBufferManager::new(&MatchConfig::default().with_gpu(Some(GpuProfile::Cuda)))
    }

    #[test]
    fn test_host_buffers_bypass() {
        let m = cuda();
        assert_eq!(
            m.plan(Protocol::Rendezvous, Direction::Recv, 0, 1 << 20, 131072, false),
            GpuStrategy::Host
        );
        assert_eq!(m.qualifying_transfers(), 0);

        let host_only = GpuBufferManager::new(&MatchConfig::default());
        assert_eq!(
            host_only.plan(Protocol::Eager, Direction::Send, 0, 64, 0, true),
            GpuStrategy::Host
        );
    }

    #[test]
    fn test_direction_asymmetry() {
        let m = cuda();
        assert_eq!(m.plan(Protocol::Eager, Direction::Send, 0, 128, 0, true), GpuStrategy::GdrCopy);
        assert!(matches!(
            m.plan(Protocol::Eager, Direction::Send, 0, 129, 0, true),
            GpuStrategy::Staged { .. }
        ));
        assert_eq!(m.plan(Protocol::Eager, Direction::Recv, 0, 64000, 0, true), GpuStrategy::GdrCopy);
        assert!(matches!(
            m.plan(Protocol::Eager, Direction::Recv, 0, 64001, 0, true),
            GpuStrategy::Staged { .. }
        ));
    }

    #[test]
    fn test_gpudirect_hysteresis() {
        let m = cuda();
        for _ in 0..3 {
            let s = m.plan(Protocol::Rendezvous, Direction::Recv, 0, 1 << 20, 131072, true);
            assert!(matches!(s, GpuStrategy::Staged { prefetch: 2, .. }));
        }
        assert_eq!(
            m.plan(Protocol::Rendezvous, Direction::Recv, 0, 1 << 20, 131072, true),
            GpuStrategy::GpuDirect { prefetch: 2 }
        );
        assert_eq!(m.qualifying_transfers(), 4);
    }

    #[test]
    fn test_staging_chunk_is_page_multiple() {
        let m = cuda();
        match m.plan(Protocol::Rendezvous, Direction::Send, 0, 1 << 20, 200_000, true) {
            GpuStrategy::Staged { chunk, .. } => assert_eq!(chunk, 196608),
            other => panic!("unexpected strategy {:?}", other),
        }
        // Window below one page still stages a whole page.
        match m.plan(Protocol::Rendezvous, Direction::Send, 0, 1 << 20, 1000, true) {
            GpuStrategy::Staged { chunk, .. } => assert_eq!(chunk, 65536),
            other => panic!("unexpected strategy {:?}", other),
        }
    }

    #[test]
    fn test_staging_masked_to_page() {
        let m = cuda();
        let addr = 0x7000_0000_0100;
        match m.plan(Protocol::Eager, Direction::Recv, addr, 70_000, 0, true) {
            GpuStrategy::Staged { chunk, prefetch, lead } => {
                assert_eq!(lead, 0x100);
                assert_eq!(chunk, 2 * 65536);
                assert_eq!(prefetch, 1);
            }
            other => panic!("unexpected strategy {:?}", other),
        }
        // Spans larger than the bounce buffer are capped at its page multiple.
        match m.plan(Protocol::Eager, Direction::Recv, addr, 1 << 20, 0, true) {
            GpuStrategy::Staged { chunk, .. } => assert_eq!(chunk, 4 * 65536),
            other => panic!("unexpected strategy {:?}", other),
        }
        let s = m.plan(Protocol::Rendezvous, Direction::Recv, addr, 1 << 20, 131072, true);
        assert_eq!(s.lead(), 0x100);
        assert_eq!(GpuStrategy::GdrCopy.lead(), 0);
    }

    #[test]
    fn test_page_masks() {
        let m = cuda();
        assert_eq!(m.page_offset(0x1_0010), 0x10);
        assert_eq!(m.page_align_down(0x1_0010), 0x1_0000);
        assert_eq!(m.staging_span(0x1_fff0, 32), 2 * 65536);
        assert_eq!(m.staging_span(0x2_0000, 65536), 65536);

        let one = GpuBufferManager::new(&MatchConfig::default().with_gpu(Some(GpuProfile::OneApi)));
        assert_eq!(one.page_size(), 4096);
        assert_eq!(one.page_offset(0x1_0010), 0x10);
        assert_eq!(one.staging_span(0, 0), 0);
    }

    #[test]
    fn test_in_flight_limits() {
        assert_eq!(GpuStrategy::Host.max_in_flight(), None);
        assert_eq!(GpuStrategy::GpuDirect { prefetch: 2 }.max_in_flight(), Some(2));
        assert!(GpuStrategy::GdrCopy.is_gpu());
    }
}
