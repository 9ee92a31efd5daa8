//! Interfaces to the collaborators around the matching core.
//!
//! The core never touches a NIC or GPU driver directly. It sees:
//!
//! - [`GpuMemory`]: classifies buffers and reports the GPU page size.
//! - [`Transport`]: sends rendezvous chunks and yields arrived headers.
//! - [`BarAccess`]: 64-bit register store/load on a device BAR.
//!
//! [`SimBar`] implements [`BarAccess`] over a file, for running against a
//! device simulator that exposes its BAR as a resource file.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path as FsPath, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use crate::completion::RequestId;
use crate::error::{Error, Result};
use crate::protocol::{Chunk, MsgHeader, Path};
use crate::tag::PeerId;

/// A registered buffer: start address and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferDesc {
    pub addr: u64,
    pub len: usize,
}

impl BufferDesc {
    pub fn new(addr: u64, len: usize) -> Self {
        Self { addr, len }
    }
}

/// Memory classification service.
pub trait GpuMemory: Send + Sync {
    /// True if `buf` lives in GPU memory.
    fn is_gpu_resident(&self, buf: &BufferDesc) -> bool;
    /// GPU page size of the installed driver, 4096 or 65536.
    fn gpu_page_size(&self) -> usize;
}

/// Host-only memory: nothing is GPU-resident.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostMemory;

impl GpuMemory for HostMemory {
    fn is_gpu_resident(&self, _buf: &BufferDesc) -> bool {
        false
    }

    fn gpu_page_size(&self) -> usize {
        4096
    }
}

/// Data-movement service of an established connection.
pub trait Transport {
    /// Request one rendezvous chunk of transfer `id` from `dest` over `path`.
    fn send(&self, path: Path, dest: PeerId, id: RequestId, chunk: Chunk) -> Result<()>;
    /// Next arrived header, if any.
    fn poll(&self) -> Option<MsgHeader>;
}

/// In-process transport: headers are injected by the caller and every
/// issued chunk is recorded.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    incoming: Mutex<VecDeque<MsgHeader>>,
    sent: Mutex<Vec<(RequestId, Chunk)>>,
    fail_next: Mutex<usize>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a header for the next `poll`.
    pub fn inject(&self, header: MsgHeader) {
        self.incoming.lock().push_back(header);
    }

    /// Make the next `n` sends fail.
    pub fn fail_sends(&self, n: usize) {
        *self.fail_next.lock() = n;
    }

    /// Chunks sent so far, in issue order.
    pub fn sent(&self) -> Vec<(RequestId, Chunk)> {
        self.sent.lock().clone()
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, _path: Path, _dest: PeerId, id: RequestId, chunk: Chunk) -> Result<()> {
        {
            let mut fail = self.fail_next.lock();
            if *fail > 0 {
                *fail -= 1;
                return Err(Error::Transport("injected send failure".into()));
            }
        }
        self.sent.lock().push((id, chunk));
        Ok(())
    }

    fn poll(&self) -> Option<MsgHeader> {
        self.incoming.lock().pop_front()
    }
}

/// 64-bit register access on a device BAR.
pub trait BarAccess {
    fn store(&self, offset: u64, value: u64) -> Result<()>;
    fn load(&self, offset: u64) -> Result<u64>;
}

/// Environment variable naming the simulator resource file.
pub const SIM_BAR_ENV: &str = "HFI_FNAME";

/// Resource files probed per unit when `HFI_FNAME` is not set.
pub const SIM_BAR_DEFAULTS: [&str; 4] = [
    "/sys/devices/pcif00f:00/f00f:00:00.0/resource0",
    "/sys/devices/pcif00f:00/f00f:00:01.0/resource0",
    "/sys/devices/f00f:01:00.0/resource0",
    "/sys/devices/f00f:02:00.0/resource0",
];

/// BAR access through positioned I/O on a simulator resource file.
#[derive(Debug)]
pub struct SimBar {
    file: File,
    path: PathBuf,
}

impl SimBar {
    /// Open `path` for read/write.
    pub fn open(path: impl AsRef<FsPath>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        debug!(path = %path.display(), "simulator BAR opened");
        Ok(Self { file, path })
    }

    /// Open the resource file of `unit`, honoring `HFI_FNAME`.
    pub fn open_unit(unit: usize) -> Result<Self> {
        Self::open(resource_path(unit, std::env::var(SIM_BAR_ENV).ok())?)
    }

    pub fn path(&self) -> &FsPath {
        &self.path
    }
}

/// Resource file for `unit`: the override if given, else the unit's default.
fn resource_path(unit: usize, env_override: Option<String>) -> Result<PathBuf> {
    if let Some(path) = env_override {
        return Ok(PathBuf::from(path));
    }
    SIM_BAR_DEFAULTS
        .get(unit)
        .map(PathBuf::from)
        .ok_or_else(|| Error::InvalidConfig(format!("no simulator resource for unit {unit}")))
}

impl BarAccess for SimBar {
    fn store(&self, offset: u64, value: u64) -> Result<()> {
        self.file.write_all_at(&value.to_le_bytes(), offset)?;
        Ok(())
    }

    fn load(&self, offset: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(u64::from_le_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Envelope;
    use crate::tag::Tag;

    fn scratch(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("tagmq-{}-{}", name, std::process::id()));
        std::fs::write(&path, vec![0u8; 64]).unwrap();
        path
    }

    #[test]
    fn test_sim_bar_store_load() {
        let path = scratch("bar");
        let bar = SimBar::open(&path).unwrap();
        bar.store(8, 0xdead_beef_0000_0001).unwrap();
        bar.store(16, 42).unwrap();
        assert_eq!(bar.load(8).unwrap(), 0xdead_beef_0000_0001);
        assert_eq!(bar.load(16).unwrap(), 42);
        assert_eq!(bar.load(0).unwrap(), 0);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_sim_bar_errors_surface_as_io() {
        assert!(matches!(
            SimBar::open("/nonexistent/tagmq/resource0"),
            Err(Error::Io(_))
        ));
        let path = scratch("short");
        let bar = SimBar::open(&path).unwrap();
        assert!(matches!(bar.load(60), Err(Error::Io(_))));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_resource_path_lookup() {
        assert_eq!(
            resource_path(2, None).unwrap(),
            PathBuf::from("/sys/devices/f00f:01:00.0/resource0")
        );
        let path = scratch("unit");
        let named = path.to_string_lossy().into_owned();
        assert_eq!(resource_path(7, Some(named.clone())).unwrap(), path);
        assert!(matches!(
            resource_path(SIM_BAR_DEFAULTS.len(), None),
            Err(Error::InvalidConfig(_))
        ));

        let bar = SimBar::open(resource_path(0, Some(named)).unwrap()).unwrap();
        assert_eq!(bar.path(), path.as_path());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_loopback() {
        let t = LoopbackTransport::new();
        assert!(t.poll().is_none());
        t.inject(MsgHeader {
            tag: Tag(1),
            sender: PeerId(2),
            path: Path::Shm,
            msg_len: 1,
            gpu_resident: false,
            envelope: Envelope::Tiny(vec![9]),
        });
        assert_eq!(t.poll().unwrap().tag, Tag(1));

        t.fail_sends(1);
        let chunk = Chunk { offset: 0, len: 8 };
        assert!(t.send(Path::Shm, PeerId(2), RequestId(1), chunk).is_err());
        assert!(t.send(Path::Shm, PeerId(2), RequestId(1), chunk).is_ok());
        assert_eq!(t.sent(), vec![(RequestId(1), chunk)]);
    }

    #[test]
    fn test_host_memory() {
        let m = HostMemory;
        assert!(!m.is_gpu_resident(&BufferDesc::new(0x1000, 64)));
        assert_eq!(m.gpu_page_size(), 4096);
    }
}
