/*
 * Scheduling Policy Interface
 *
 * Separates policy from mechanism: the scheduler core owns the task
 * table, wait lists and context switching, and forwards decisions to a
 * boxed policy. Policies own only their ready structures and each
 * task's `SchedData` extension.
 *
 * The core guarantees that `pick_next` removes the chosen task from the
 * policy's ready structures and that the current task is never inside
 * them while it runs.
 */

use crate::sched::SchedStats;
use crate::task::{TaskId, TaskTable};

/// Which policy is installed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    RoundRobin,
    Priority,
    Realtime(RtMode),
    Mlfq,
    Fair,
}

/// Victim-ordering rule of the real-time policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtMode {
    /// Earliest absolute deadline first
    EarliestDeadline,
    /// Smallest period first
    RateMonotonic,
}

/// Outcome of a scheduling decision
#[derive(Debug, Clone, Copy)]
pub struct DispatchDecision {
    /// Task to run next
    pub tid: TaskId,
    /// Ticks it may run before the policy reconsiders
    pub timeslice: u32,
}

/// What the policy wants after a timer tick
#[derive(Debug, Clone, Copy, Default)]
pub struct TickOutcome {
    /// The current task should be preempted
    pub resched: bool,
    /// The current task must stop running until this tick (real-time
    /// execution-budget exhaustion)
    pub block_current_until: Option<u64>,
}

/// Default dispatch slice in ticks
pub const DEFAULT_TIME_SLICE: u32 = 10;

/// A scheduling policy
///
/// All methods are called with the scheduler lock held; policies must
/// not call back into the kernel.
pub(crate) trait SchedPolicy: Send {
    fn kind(&self) -> PolicyKind;

    fn name(&self) -> &'static str;

    /// Admit a READY task, initializing its `SchedData` variant when it
    /// does not match this policy
    fn enqueue(&mut self, tasks: &mut TaskTable, tid: TaskId);

    /// Remove a task from the ready structures wherever it sits
    fn remove(&mut self, tasks: &mut TaskTable, tid: TaskId);

    /// Choose and dequeue the next task to run; None means idle
    fn pick_next(&mut self, tasks: &mut TaskTable) -> Option<DispatchDecision>;

    /// Per-tick accounting for the current task and any global
    /// bookkeeping (releases, boosts, aging)
    fn on_tick(
        &mut self,
        tasks: &mut TaskTable,
        current: Option<TaskId>,
        now: u64,
        stats: &mut SchedStats,
    ) -> TickOutcome;

    /// Should `woken` preempt `current` right now?
    fn should_preempt(&self, tasks: &TaskTable, woken: TaskId, current: TaskId) -> bool {
        let _ = (tasks, woken, current);
        false
    }
}
