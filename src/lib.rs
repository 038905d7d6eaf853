/*
 * ferrokern - preemptive RTOS kernel core
 *
 * A library kernel: the task model, a pluggable scheduler family
 * (round-robin, priority, EDF/RM, MLFQ, weighted fair), blocking
 * synchronization primitives, a two-layer memory manager (frame table
 * with pluggable page replacement plus a boundary-tag heap) and typed
 * IPC (message queues, shared memory, pipes).
 *
 * Everything hardware-shaped - timer, interrupts, MMU, context switch,
 * swap - is borrowed from the host through the `Platform` trait; the
 * core itself is architecture-neutral and persists nothing.
 */

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod platform;
pub mod task;
pub mod kernel;
pub mod sched;
pub mod sync;
pub mod mm;
pub mod ipc;

pub use error::{KernelError, Result};
pub use ipc::{IpcStats, MsgqId, PipeFd, ShmId};
pub use kernel::{Kernel, KernelConfig};
pub use mm::frame::{FrameStats, ReplacementAlgorithm};
pub use mm::heap::HeapStats;
pub use mm::VmArea;
pub use sync::{CondvarId, MutexId, RwLockId, SemaphoreId, SpinlockId, SyncStats};
pub use platform::{
    AccessKind, Context, Platform, PlatformCallbacks, Protection, StackRegion, SwapHandle,
    PAGE_SIZE,
};
pub use sched::{PolicyKind, RtMode, SchedStats};
pub use task::{SchedData, TaskId, TaskPriority, TaskState, WaitOutcome};

/// Timeout value meaning "wait forever"
pub const TIMEOUT_FOREVER: u64 = u64::MAX;
