/*
 * Task Model
 *
 * A task is the unit of execution. Each task owns a stack region carved
 * from the kernel heap, an opaque platform context, a five-state
 * lifecycle and a policy extension that carries whatever the active
 * scheduling policy needs (real-time parameters, virtual runtime, MLFQ
 * queue position).
 *
 * State invariant: a task is Running iff it is the scheduler's current
 * task iff it is on no queue. A Blocked task is on exactly one wait
 * list; if it also has a wake deadline it additionally appears in the
 * scheduler's timer queue.
 */

use core::fmt;

use heapless::String as FixedString;

use crate::platform::{Context, StackRegion};

/// Maximum length of a task or kernel-object name
pub const NAME_LEN: usize = 31;

/// Fixed-capacity name used by tasks and synchronization objects
pub type KernelName = FixedString<NAME_LEN>;

/// Build a kernel name, truncating at 31 bytes
pub(crate) fn make_name(s: &str) -> KernelName {
    let mut name = KernelName::new();
    for ch in s.chars() {
        if name.push(ch).is_err() {
            break;
        }
    }
    name
}

/// Stable opaque task handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Suspended,
    Terminated,
}

/// Five-level ordinal task priority
///
/// Higher variants are scheduled first by the priority policy. The
/// ordinal also seeds the fair policy's initial weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    Idle = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    Realtime = 4,
}

impl TaskPriority {
    /// Number of priority levels
    pub const LEVELS: usize = 5;

    /// Dense index, 0 = lowest
    pub fn index(self) -> usize {
        self as usize
    }

    pub(crate) fn from_index(idx: usize) -> TaskPriority {
        match idx {
            0 => TaskPriority::Idle,
            1 => TaskPriority::Low,
            2 => TaskPriority::Normal,
            3 => TaskPriority::High,
            _ => TaskPriority::Realtime,
        }
    }
}

/// Why a blocked task woke up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeResult {
    /// The wait condition was satisfied (lock granted, message arrived,
    /// signal delivered, sleep expired)
    Completed,
    /// The wake deadline fired before the condition was satisfied
    TimedOut,
    /// Another task deleted this one mid-wait
    Canceled,
}

/// Outcome of a timed condition wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken by signal or broadcast
    Completed,
    /// The timeout expired first
    TimedOut,
}

/// What a blocked task is waiting on
///
/// Wait lists are owned centrally by the scheduler and keyed by this
/// channel, one FIFO per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum WaitChannel {
    /// The sleep list; woken by the tick handler
    Sleep,
    /// A mutex's wait list
    Mutex(u32),
    /// A semaphore's wait list
    Semaphore(u32),
    /// A condition variable's wait list
    Condvar(u32),
}

/// Real-time policy parameters
#[derive(Debug, Clone, Copy)]
pub struct RtParams {
    /// Release period in ticks
    pub period: u64,
    /// Deadline relative to each release
    pub relative_deadline: u64,
    /// Worst-case execution budget per instance
    pub worst_case_exec: u64,
    /// Tick of the next release
    pub next_release: u64,
    /// Absolute deadline of the current instance
    pub absolute_deadline: u64,
    /// Execution time consumed by the current instance
    pub exec_time_used: u64,
    /// The current instance already counted a deadline miss
    pub(crate) deadline_missed: bool,
}

/// Fair (CFS-style) policy parameters
#[derive(Debug, Clone, Copy)]
pub struct FairParams {
    /// Virtual runtime, scaled by `fair::VRUNTIME_SCALE`
    pub vruntime: u64,
    /// Load weight; `NICE0_LOAD` (1024) is the default
    pub weight: u32,
}

/// MLFQ policy parameters
#[derive(Debug, Clone, Copy)]
pub struct MlfqParams {
    /// Queue the task currently lives in, 0 = highest
    pub current_queue: u32,
    /// Ticks left in the current slice
    pub slice_remaining: u32,
}

/// Policy-specific task extension
///
/// Exactly one variant is attached to a task at a time. Switching the
/// global policy converts mismatched variants; a matching variant is
/// retained so e.g. vruntime survives a fair -> other -> fair round
/// trip.
#[derive(Debug, Clone, Copy)]
pub enum SchedData {
    /// Round-robin and priority policies need only the base priority
    Simple,
    Rt(RtParams),
    Fair(FairParams),
    Mlfq(MlfqParams),
}

/// Task control block
pub struct Task {
    pub id: TaskId,
    pub name: KernelName,
    pub state: TaskState,
    /// Priority the task was created with
    pub base_priority: TaskPriority,
    /// Priority used for scheduling; differs from base only while a
    /// mutex owner holds a donation
    pub effective_priority: TaskPriority,
    /// Stack region owned by this task, released at reap time
    pub stack: StackRegion,
    /// Platform context token
    pub context: Context,
    /// Ticks left in the current dispatch slice
    pub ticks_remaining: u32,
    /// Total ticks this task has run
    pub total_ticks: u64,
    /// Absolute tick at which a sleep or timed wait expires
    pub wake_deadline: Option<u64>,
    /// Channel the task is blocked on, if any
    pub(crate) waiting_on: Option<WaitChannel>,
    /// Result delivered by the waker, consumed on resume
    pub(crate) wake_result: Option<WakeResult>,
    /// Deletion arrived while blocked; every further blocking call fails
    pub(crate) canceled: bool,
    /// Suspension arrived while blocked; applied at wake time
    pub(crate) suspend_pending: bool,
    /// Policy extension
    pub sched: SchedData,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        name: &str,
        priority: TaskPriority,
        stack: StackRegion,
        context: Context,
    ) -> Self {
        Self {
            id,
            name: make_name(name),
            state: TaskState::Ready,
            base_priority: priority,
            effective_priority: priority,
            stack,
            context,
            ticks_remaining: 0,
            total_ticks: 0,
            wake_deadline: None,
            waiting_on: None,
            wake_result: None,
            canceled: false,
            suspend_pending: false,
            sched: SchedData::Simple,
        }
    }

    /// Real-time parameters, if this task carries them
    pub fn rt_params(&self) -> Option<&RtParams> {
        match &self.sched {
            SchedData::Rt(p) => Some(p),
            _ => None,
        }
    }

    pub(crate) fn rt_params_mut(&mut self) -> Option<&mut RtParams> {
        match &mut self.sched {
            SchedData::Rt(p) => Some(p),
            _ => None,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name.as_str())
            .field("state", &self.state)
            .field("priority", &self.effective_priority)
            .finish()
    }
}

/// All live tasks, keyed by id
pub(crate) type TaskTable = alloc::collections::BTreeMap<TaskId, Task>;
