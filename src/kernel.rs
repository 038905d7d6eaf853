/*
 * Kernel Object
 *
 * All mutable kernel state lives behind this one object: the scheduler
 * core, the synchronization registry, the memory manager, the heap and
 * the IPC registry, each under its own spin lock.
 *
 * Lock order, outermost first: ipc -> sync -> sched, and heap -> mm.
 * The scheduler lock is innermost and is never held across a context
 * switch.
 *
 * The kernel hands the platform two callbacks at construction: the
 * timer tick and the page-fault handler. Both re-enter the kernel
 * through a weak self-reference, as do task exit trampolines.
 */

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};

use spin::Mutex as SpinMutex;

use crate::error::Result;
use crate::ipc::IpcRegistry;
use crate::mm::frame::ReplacementAlgorithm;
use crate::mm::heap::KernelHeap;
use crate::mm::MemoryManager;
use crate::platform::{AccessKind, Platform, PlatformCallbacks};
use crate::sched::policy::{PolicyKind, DEFAULT_TIME_SLICE};
use crate::sched::SchedCore;
use crate::sync::SyncRegistry;
use crate::task::TaskPriority;

/// Initial creation parameters
///
/// There is no runtime configuration surface beyond this struct; the
/// defaults match the constants the kernel was tuned with.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Upper bound on live tasks, idle included
    pub max_tasks: usize,
    /// Stack bytes for tasks that do not ask for more
    pub default_stack_size: usize,
    /// Stack bytes reserved for the idle task
    pub idle_stack_size: usize,
    /// Dispatch slice for the round-robin and priority policies
    pub default_time_slice: u32,
    /// Scheduling policy installed at construction
    pub policy: PolicyKind,
    /// MLFQ queue count
    pub mlfq_queue_count: usize,
    /// MLFQ queue-0 slice; queue q gets base << q
    pub mlfq_base_slice: u32,
    /// Ticks between MLFQ anti-starvation boosts
    pub mlfq_boost_period: u64,
    /// Fair-policy preemption granularity in ticks
    pub fair_min_granularity: u32,
    /// Enable mutex priority donation
    pub priority_inheritance: bool,
    /// Frames managed by the replacement layer
    pub frame_count: usize,
    /// Victim selection algorithm
    pub replacement: ReplacementAlgorithm,
    /// Ticks between NFU reference-register aging samples
    pub nfu_sample_period: u64,
    /// Smallest number of pages the heap grows by
    pub heap_grow_pages: usize,
    /// Pipe ring capacity in bytes
    pub pipe_capacity: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_tasks: 32,
            default_stack_size: 4096,
            idle_stack_size: 1024,
            default_time_slice: DEFAULT_TIME_SLICE,
            policy: PolicyKind::RoundRobin,
            mlfq_queue_count: 8,
            mlfq_base_slice: 4,
            mlfq_boost_period: 100,
            fair_min_granularity: 4,
            priority_inheritance: true,
            frame_count: 64,
            replacement: ReplacementAlgorithm::Lru,
            nfu_sample_period: 8,
            heap_grow_pages: 16,
            pipe_capacity: 4096,
        }
    }
}

/// The kernel core
///
/// Construct with [`Kernel::new`], populate with tasks and objects, and
/// enter multitasking with [`Kernel::start`].
pub struct Kernel {
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) config: KernelConfig,
    selfref: Weak<Kernel>,
    pub(crate) sched: SpinMutex<SchedCore>,
    pub(crate) sync: SpinMutex<SyncRegistry>,
    pub(crate) mm: SpinMutex<MemoryManager>,
    pub(crate) heap: SpinMutex<KernelHeap>,
    pub(crate) ipc: SpinMutex<IpcRegistry>,
}

impl Kernel {
    /// Build a kernel over a platform
    ///
    /// Registers the tick and page-fault callbacks, initializes every
    /// subsystem and creates the idle task.
    pub fn new(platform: Arc<dyn Platform>, config: KernelConfig) -> Result<Arc<Kernel>> {
        let boot_context = platform.boot_context();
        let kernel = Arc::new_cyclic(|selfref: &Weak<Kernel>| Kernel {
            sched: SpinMutex::new(SchedCore::new(&config, boot_context)),
            sync: SpinMutex::new(SyncRegistry::new()),
            mm: SpinMutex::new(MemoryManager::new(&config)),
            heap: SpinMutex::new(KernelHeap::new(config.heap_grow_pages)),
            selfref: selfref.clone(),
            platform: platform.clone(),
            ipc: SpinMutex::new(IpcRegistry::new()),
            config,
        });

        let tick_kernel = Arc::downgrade(&kernel);
        let fault_kernel = Arc::downgrade(&kernel);
        platform.register_callbacks(PlatformCallbacks {
            tick: Box::new(move || {
                if let Some(kernel) = tick_kernel.upgrade() {
                    kernel.timer_tick();
                }
            }),
            page_fault: Box::new(move |addr: u64, kind: AccessKind| {
                let kernel = fault_kernel.upgrade().ok_or(crate::KernelError::InvalidState)?;
                kernel.handle_page_fault(addr, kind)
            }),
        });

        kernel.create_idle_task()?;
        log::info!(
            "kernel initialized: {} frames, {:?} replacement, policy {:?}",
            kernel.config.frame_count,
            kernel.config.replacement,
            kernel.config.policy
        );
        Ok(kernel)
    }

    pub(crate) fn self_arc(&self) -> Arc<Kernel> {
        self.selfref.upgrade().expect("kernel dropped while in use")
    }

    /// The idle task: reaps the terminated and waits for the timer
    fn create_idle_task(&self) -> Result<()> {
        let kernel = self.self_arc();
        let platform = self.platform.clone();
        let stack_size = self.config.idle_stack_size;
        self.task_create_inner(
            "idle",
            Box::new(move || loop {
                kernel.reap_terminated();
                platform.wait_for_interrupt();
            }),
            TaskPriority::Idle,
            stack_size,
            true,
        )?;
        Ok(())
    }
}
