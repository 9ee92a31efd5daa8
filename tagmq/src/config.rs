//! Configuration types for tagmq.
//!
//! Lock discipline, GPU vendor profile and selector learning are runtime
//! fields of [`MatchConfig`] rather than build features. A config is built
//! once per process or context and shared by `Arc` into every component.

use crate::error::{Error, Result};

/// Number of buckets in each hash subqueue.
pub const NUM_HASH_BUCKETS: usize = 128;
/// Queue depth for a pattern class above which it is moved to hashing.
pub const DEFAULT_HASH_THRESH: usize = 64;
/// Hash configs available when selector learning is enabled.
pub const NUM_HASH_CONFIGS_LEARNED: usize = 5;
/// Hash configs available in the fixed (non-learning) build.
pub const NUM_HASH_CONFIGS_FIXED: usize = 3;
/// Observations between halvings of the learning counters.
pub const LEARN_DECAY_PERIOD: u64 = 1024;

/// Maximum payload carried inline by a TINY message.
pub const MQ_NIC_MAX_TINY: usize = 8;
/// Rendezvous threshold for the shared-memory path.
pub const MQ_RNDV_SHM_THRESH: usize = 16000;
/// Rendezvous threshold for the NIC path.
pub const MQ_RNDV_NIC_THRESH: usize = 64000;
/// Default rendezvous window.
pub const MQ_RNDV_NIC_WINDOW: usize = 131072;
/// Largest rendezvous window that may be requested.
pub const MQ_RNDV_NIC_WINDOW_MAX: usize = 4 * 1024 * 1024;

/// Maximum number of distinct NIC devices (rails).
pub const MAX_RAILS: usize = 32;

/// Rendezvous chunks kept in flight for GPU buffers.
pub const GPU_WINDOW_PREFETCH_DEFAULT: usize = 2;
/// Size of the host bounce buffer used for GPU staging.
pub const GPU_SMALLHOSTBUF_SZ: usize = 256 * 1024;
/// Qualifying rendezvous transfers seen before GPU-direct is engaged.
pub const GPUDIRECT_THRESH_RV: u32 = 3;
/// Largest send that may use a GPU-direct single copy.
pub const GDR_COPY_LIMIT_SEND: usize = 128;
/// Largest receive that may use a GPU-direct single copy.
pub const GDR_COPY_LIMIT_RECV: usize = 64000;

/// Lock discipline guarding a context's match structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockKind {
    /// Busy-wait spinlock. Best with one dedicated poller per context.
    #[default]
    Spin,
    /// Blocking mutex.
    Mutex,
    /// Blocking mutex that faults on recursive acquisition.
    MutexDebug,
    /// Like `MutexDebug`, and logs every contended acquisition.
    MutexDebugLogContention,
}

impl LockKind {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spin" | "spinlock" => Some(LockKind::Spin),
            "mutex" => Some(LockKind::Mutex),
            "mutex-debug" => Some(LockKind::MutexDebug),
            "mutex-debug-log" | "mutex-debug-log-contention" => {
                Some(LockKind::MutexDebugLogContention)
            }
            _ => None,
        }
    }
}

/// GPU vendor family. The two profiles are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuProfile {
    /// 64 KiB GPU pages.
    Cuda,
    /// 4 KiB GPU pages.
    OneApi,
}

impl GpuProfile {
    /// GPU page size assumed for staging alignment.
    #[inline]
    pub fn page_size(self) -> usize {
        match self {
            GpuProfile::Cuda => 65536,
            GpuProfile::OneApi => 4096,
        }
    }
}

/// Matching and protocol configuration.
#[derive(Debug, Clone)]
pub struct MatchConfig {
    /// Lock discipline for every context built from this config.
    /// Default: `Spin`
    pub lock: LockKind,
    /// GPU profile, or `None` for a host-only build.
    /// Default: None
    pub gpu: Option<GpuProfile>,
    /// Learn hash configs from observed tag/selector usage.
    /// Default: true
    pub learn_hash_selector: bool,
    /// Per-class queue depth that triggers hashing.
    /// Default: 64
    pub hash_thresh: usize,
    /// Buckets per hash subqueue.
    /// Default: 128
    pub num_hash_buckets: usize,
    /// Largest TINY payload.
    /// Default: 8
    pub tiny_max: usize,
    /// Rendezvous threshold over shared memory.
    /// Default: 16000
    pub rndv_shm_thresh: usize,
    /// Rendezvous threshold over the NIC.
    /// Default: 64000
    pub rndv_nic_thresh: usize,
    /// Requested rendezvous window.
    /// Default: 131072
    pub rndv_window: usize,
    /// Upper clamp for the rendezvous window.
    /// Default: 4 MiB
    pub rndv_window_max: usize,
    /// GPU rendezvous chunks in flight.
    /// Default: 2
    pub gpu_window_prefetch: usize,
    /// Host bounce buffer size for GPU staging.
    /// Default: 256 KiB
    pub gpu_small_host_buf: usize,
    /// GPU-direct copy limit for sends.
    /// Default: 128
    pub gdr_copy_limit_send: usize,
    /// GPU-direct copy limit for receives.
    /// Default: 64000
    pub gdr_copy_limit_recv: usize,
    /// Qualifying rendezvous transfers before GPU-direct engages.
    /// Default: 3
    pub gpudirect_thresh_rv: u32,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            lock: LockKind::Spin,
            gpu: None,
            learn_hash_selector: true,
            hash_thresh: DEFAULT_HASH_THRESH,
            num_hash_buckets: NUM_HASH_BUCKETS,
            tiny_max: MQ_NIC_MAX_TINY,
            rndv_shm_thresh: MQ_RNDV_SHM_THRESH,
            rndv_nic_thresh: MQ_RNDV_NIC_THRESH,
            rndv_window: MQ_RNDV_NIC_WINDOW,
            rndv_window_max: MQ_RNDV_NIC_WINDOW_MAX,
            gpu_window_prefetch: GPU_WINDOW_PREFETCH_DEFAULT,
            gpu_small_host_buf: GPU_SMALLHOSTBUF_SZ,
            gdr_copy_limit_send: GDR_COPY_LIMIT_SEND,
            gdr_copy_limit_recv: GDR_COPY_LIMIT_RECV,
            gpudirect_thresh_rv: GPUDIRECT_THRESH_RV,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl MatchConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from defaults overridden by `TAGMQ_*`
    /// environment variables. Values that fail to parse are ignored.
    pub fn from_env() -> Self {
        let d = Self::default();
        let lock = std::env::var("TAGMQ_LOCK")
            .ok()
            .and_then(|s| LockKind::parse(&s))
            .unwrap_or(d.lock);
        let gpu = match std::env::var("TAGMQ_GPU").ok().as_deref().map(str::trim) {
            Some("cuda") => Some(GpuProfile::Cuda),
            Some("oneapi") => Some(GpuProfile::OneApi),
            Some("none") => None,
            _ => d.gpu,
        };
        Self {
            lock,
            gpu,
            learn_hash_selector: env_or::<u8>("TAGMQ_LEARN_HASH", d.learn_hash_selector as u8)
                != 0,
            hash_thresh: env_or("TAGMQ_HASH_THRESH", d.hash_thresh),
            num_hash_buckets: d.num_hash_buckets,
            tiny_max: d.tiny_max,
            rndv_shm_thresh: env_or("TAGMQ_RNDV_SHM_THRESH", d.rndv_shm_thresh),
            rndv_nic_thresh: env_or("TAGMQ_RNDV_NIC_THRESH", d.rndv_nic_thresh),
            rndv_window: env_or("TAGMQ_RNDV_NIC_WINDOW", d.rndv_window),
            rndv_window_max: d.rndv_window_max,
            gpu_window_prefetch: env_or("TAGMQ_GPU_PREFETCH", d.gpu_window_prefetch),
            gpu_small_host_buf: d.gpu_small_host_buf,
            gdr_copy_limit_send: env_or("TAGMQ_GDR_COPY_LIMIT_SEND", d.gdr_copy_limit_send),
            gdr_copy_limit_recv: env_or("TAGMQ_GDR_COPY_LIMIT_RECV", d.gdr_copy_limit_recv),
            gpudirect_thresh_rv: env_or("TAGMQ_GPUDIRECT_THRESH_RV", d.gpudirect_thresh_rv),
        }
    }

    /// Number of hash configs a match queue may hold.
    #[inline]
    pub fn num_hash_configs(&self) -> usize {
        if self.learn_hash_selector {
            NUM_HASH_CONFIGS_LEARNED
        } else {
            NUM_HASH_CONFIGS_FIXED
        }
    }

    /// Check that the thresholds are mutually consistent.
    pub fn validate(&self) -> Result<()> {
        if self.num_hash_buckets == 0 {
            return Err(Error::InvalidConfig("num_hash_buckets must be non-zero".into()));
        }
        if self.tiny_max >= self.rndv_shm_thresh || self.tiny_max >= self.rndv_nic_thresh {
            return Err(Error::InvalidConfig(format!(
                "tiny_max {} must be below both rendezvous thresholds",
                self.tiny_max
            )));
        }
        if self.rndv_window == 0 || self.rndv_window_max == 0 {
            return Err(Error::InvalidConfig("rendezvous window must be non-zero".into()));
        }
        if self.gpu.is_some() && self.gpu_window_prefetch == 0 {
            return Err(Error::InvalidConfig("gpu_window_prefetch must be non-zero".into()));
        }
        if let Some(profile) = self.gpu
            && self.gpu_small_host_buf < profile.page_size()
        {
            return Err(Error::InvalidConfig(format!(
                "gpu_small_host_buf {} is smaller than one {} byte GPU page",
                self.gpu_small_host_buf,
                profile.page_size()
            )));
        }
        Ok(())
    }

    /// Set the lock discipline.
    pub fn with_lock(mut self, lock: LockKind) -> Self {
        self.lock = lock;
        self
    }

    /// Set the GPU profile.
    pub fn with_gpu(mut self, gpu: Option<GpuProfile>) -> Self {
        self.gpu = gpu;
        self
    }

    /// Enable or disable selector learning.
    pub fn with_learning(mut self, learn: bool) -> Self {
        self.learn_hash_selector = learn;
        self
    }

    /// Set the hashing threshold.
    pub fn with_hash_thresh(mut self, hash_thresh: usize) -> Self {
        self.hash_thresh = hash_thresh;
        self
    }

    /// Set the shared-memory rendezvous threshold.
    pub fn with_rndv_shm_thresh(mut self, thresh: usize) -> Self {
        self.rndv_shm_thresh = thresh;
        self
    }

    /// Set the NIC rendezvous threshold.
    pub fn with_rndv_nic_thresh(mut self, thresh: usize) -> Self {
        self.rndv_nic_thresh = thresh;
        self
    }

    /// Set the requested rendezvous window.
    pub fn with_rndv_window(mut self, window: usize) -> Self {
        self.rndv_window = window;
        self
    }

    /// Set the GPU prefetch depth.
    pub fn with_gpu_window_prefetch(mut self, depth: usize) -> Self {
        self.gpu_window_prefetch = depth;
        self
    }

    /// Set the GPU-direct hysteresis threshold.
    pub fn with_gpudirect_thresh_rv(mut self, thresh: u32) -> Self {
        self.gpudirect_thresh_rv = thresh;
        self
    }
}
