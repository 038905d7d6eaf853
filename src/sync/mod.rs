/*
 * Synchronization Primitives
 *
 * Mutex (plain and recursive, with optional priority donation),
 * counting semaphore, condition variable, writer-preferring
 * reader/writer lock and interrupt-gating spinlock.
 *
 * Objects live in a registry keyed by small integer handles; the wait
 * lists themselves are owned by the scheduler so that wakeup order,
 * timeouts and cancellation have one home. Destroying an object that
 * still has waiters is a reported usage error and fails.
 */

pub mod mutex;
pub mod semaphore;
pub mod condvar;
pub mod rwlock;
pub mod spinlock;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use crate::kernel::Kernel;
use crate::task::KernelName;

pub use mutex::MutexId;
pub use semaphore::SemaphoreId;
pub use condvar::CondvarId;
pub use rwlock::RwLockId;
pub use spinlock::SpinlockId;

/// Contention counters, one slot per primitive family
///
/// Each counter moves exactly once per block.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncStats {
    pub mutex_contentions: u64,
    pub sem_contentions: u64,
    pub cond_contentions: u64,
    pub rwlock_contentions: u64,
    pub spin_contentions: u64,
}

pub(crate) struct KMutex {
    pub locked: bool,
    pub owner: Option<crate::task::TaskId>,
    pub depth: u32,
    pub recursive: bool,
    /// A priority donation is outstanding on the owner
    pub donated: bool,
    pub name: KernelName,
}

pub(crate) struct KSemaphore {
    pub count: i32,
    pub name: KernelName,
}

pub(crate) struct KCondvar {
    pub name: KernelName,
}

pub(crate) struct KRwLock {
    pub mutex: MutexId,
    pub readers: CondvarId,
    pub writers: CondvarId,
    pub reader_count: i32,
    pub writer_owner: Option<crate::task::TaskId>,
    pub waiting_writers: u32,
    pub name: KernelName,
}

pub(crate) struct KSpinlock {
    pub locked: core::sync::atomic::AtomicBool,
    /// Interrupt state saved by the holder, restored at unlock
    pub saved_irq: core::sync::atomic::AtomicBool,
    pub name: KernelName,
}

pub(crate) struct SyncRegistry {
    next_id: u32,
    pub mutexes: BTreeMap<u32, KMutex>,
    pub semaphores: BTreeMap<u32, KSemaphore>,
    pub condvars: BTreeMap<u32, KCondvar>,
    pub rwlocks: BTreeMap<u32, KRwLock>,
    pub spinlocks: BTreeMap<u32, Arc<KSpinlock>>,
    pub stats: SyncStats,
}

/// Upper bound on live synchronization objects across all families
pub(crate) const MAX_SYNC_OBJECTS: usize = 1024;

impl SyncRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            mutexes: BTreeMap::new(),
            semaphores: BTreeMap::new(),
            condvars: BTreeMap::new(),
            rwlocks: BTreeMap::new(),
            spinlocks: BTreeMap::new(),
            stats: SyncStats::default(),
        }
    }

    fn live_objects(&self) -> usize {
        self.mutexes.len()
            + self.semaphores.len()
            + self.condvars.len()
            + self.rwlocks.len()
            + self.spinlocks.len()
    }

    pub fn alloc_id(&mut self) -> crate::error::Result<u32> {
        if self.live_objects() >= MAX_SYNC_OBJECTS {
            return Err(crate::error::KernelError::TooManyObjects);
        }
        let id = self.next_id;
        self.next_id += 1;
        Ok(id)
    }
}

macro_rules! sync_id {
    ($(#[$doc:meta])* $name:ident, $label:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
        pub struct $name(pub(crate) u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "({})"), self.0)
            }
        }
    };
}
pub(crate) use sync_id;

impl Kernel {
    /// Contention counters snapshot
    pub fn sync_stats(&self) -> SyncStats {
        self.sync.lock().stats
    }

    pub fn reset_sync_stats(&self) {
        self.sync.lock().stats = SyncStats::default();
    }
}
