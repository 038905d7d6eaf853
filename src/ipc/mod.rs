/*
 * Inter-Task Communication
 *
 * Three families, all built on the kernel's own mutex and condition
 * variables exactly as the data model prescribes:
 *
 *   - typed message queues (key-indexed, bounded ring, typed receive)
 *   - shared memory segments (key-indexed, ref-counted, page-backed)
 *   - pipes (byte ring with close semantics, EOF and BrokenPipe)
 *
 * The registry spin lock is only ever held for short state inspection
 * and mutation; every wait happens through a condition variable with
 * the object's kernel mutex held, never with the registry locked.
 *
 * Timeouts follow one convention: 0 never blocks (WouldBlock), u64::MAX
 * waits forever, anything else bounds the wait in ticks (TimedOut).
 */

pub mod msgq;
pub mod shmem;
pub mod pipe;

use alloc::collections::BTreeMap;

use crate::kernel::Kernel;

pub use msgq::MsgqId;
pub use pipe::PipeFd;
pub use shmem::ShmId;

/// Upper bound on live IPC objects across all families
pub(crate) const MAX_IPC_OBJECTS: usize = 256;

/// IPC activity counters
#[derive(Debug, Clone, Copy, Default)]
pub struct IpcStats {
    /// Live objects per family
    pub msg_queues: u64,
    pub shm_segments: u64,
    pub pipes: u64,
    /// Operation counts
    pub msg_sends: u64,
    pub msg_receives: u64,
    pub shm_attaches: u64,
    pub pipe_writes: u64,
    pub pipe_reads: u64,
}

pub(crate) struct IpcRegistry {
    next_id: u32,
    next_fd: u32,
    pub msgqs: BTreeMap<u32, msgq::MsgQueue>,
    pub shms: BTreeMap<u32, shmem::ShmSegment>,
    /// Next free virtual address in the shared-memory window
    pub shm_window: u64,
    /// Attachment bookkeeping: mapped vaddr -> segment id
    pub shm_attachments: BTreeMap<u64, u32>,
    pub pipes: BTreeMap<u32, pipe::Pipe>,
    /// fd -> (pipe id, end)
    pub fds: BTreeMap<u32, (u32, pipe::PipeEnd)>,
    pub stats: IpcStats,
}

impl IpcRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            next_fd: 3, // 0..2 read as std streams elsewhere
            msgqs: BTreeMap::new(),
            shms: BTreeMap::new(),
            shm_window: shmem::SHM_WINDOW_BASE,
            shm_attachments: BTreeMap::new(),
            pipes: BTreeMap::new(),
            fds: BTreeMap::new(),
            stats: IpcStats::default(),
        }
    }

    fn live_objects(&self) -> usize {
        self.msgqs.len() + self.shms.len() + self.pipes.len()
    }

    pub fn alloc_id(&mut self) -> crate::error::Result<u32> {
        if self.live_objects() >= MAX_IPC_OBJECTS {
            return Err(crate::error::KernelError::TooManyObjects);
        }
        let id = self.next_id;
        self.next_id += 1;
        Ok(id)
    }

    pub fn alloc_fd(&mut self) -> u32 {
        let fd = self.next_fd;
        self.next_fd += 1;
        fd
    }
}

/// How long a blocking IPC call may wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Timeout {
    NonBlocking,
    Forever,
    Until(u64),
}

impl Kernel {
    pub(crate) fn resolve_timeout(&self, timeout_ms: u64) -> Timeout {
        match timeout_ms {
            0 => Timeout::NonBlocking,
            u64::MAX => Timeout::Forever,
            ms => Timeout::Until(self.now_ticks() + ms),
        }
    }

    /// IPC activity snapshot
    pub fn ipc_stats(&self) -> IpcStats {
        self.ipc.lock().stats
    }

    pub fn reset_ipc_stats(&self) {
        let mut ipc = self.ipc.lock();
        let live = (ipc.stats.msg_queues, ipc.stats.shm_segments, ipc.stats.pipes);
        ipc.stats = IpcStats::default();
        // Object counts describe live objects, not traffic.
        ipc.stats.msg_queues = live.0;
        ipc.stats.shm_segments = live.1;
        ipc.stats.pipes = live.2;
    }
}
