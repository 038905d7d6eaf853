/*
 * Scheduler Core (mechanism)
 *
 * Owns the task table, the current task, the FIFO wait lists, the sleep
 * and timeout timer queue and the statistics counters, and delegates
 * every ordering decision to the installed policy.
 *
 * Tick ordering on every timer interrupt:
 *   1. advance the global tick counter
 *   2. move expired sleepers and timed waiters back to READY
 *   3. policy accounting (slice countdown, vruntime, RT releases and
 *      deadline checks, MLFQ boost)
 *   4. if preemption is required, reschedule on the way out
 *
 * Wait lists are owned here rather than by the synchronization objects
 * so the "a task is on at most one queue" invariant has a single
 * enforcement point, and so the tick handler can time out a waiter
 * without touching the object registries.
 */

pub mod policy;
pub mod round_robin;
pub mod priority;
pub mod realtime;
pub mod mlfq;
pub mod fair;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::vec::Vec;

use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::platform::{Context, IrqGuard, StackRegion};
use crate::task::{
    SchedData, Task, TaskId, TaskPriority, TaskState, TaskTable, WaitChannel, WakeResult,
};

pub use policy::{PolicyKind, RtMode, DEFAULT_TIME_SLICE};
use policy::{DispatchDecision, SchedPolicy, TickOutcome};

/// Scheduler statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedStats {
    pub context_switches: u64,
    pub preemptions: u64,
    pub scheduler_runs: u64,
    pub missed_deadlines: u64,
}

pub(crate) struct SchedCore {
    pub tasks: TaskTable,
    next_id: u64,
    max_tasks: usize,
    pub current: Option<TaskId>,
    pub idle: Option<TaskId>,
    policy: Box<dyn SchedPolicy>,
    pub policy_kind: PolicyKind,
    wait_lists: BTreeMap<WaitChannel, VecDeque<TaskId>>,
    timers: BTreeSet<(u64, TaskId)>,
    pub terminated: Vec<TaskId>,
    pub stats: SchedStats,
    pub ticks: u64,
    pub need_resched: bool,
    pub running: bool,
    boot_context: Context,
}

fn build_policy(kind: PolicyKind, config: &crate::kernel::KernelConfig) -> Box<dyn SchedPolicy> {
    match kind {
        PolicyKind::RoundRobin => Box::new(round_robin::RoundRobinPolicy::new(
            config.default_time_slice,
        )),
        PolicyKind::Priority => Box::new(priority::PriorityPolicy::new(config.default_time_slice)),
        PolicyKind::Realtime(mode) => Box::new(realtime::RealtimePolicy::new(mode)),
        PolicyKind::Mlfq => Box::new(mlfq::MlfqPolicy::new(
            config.mlfq_queue_count,
            config.mlfq_base_slice,
            config.mlfq_boost_period,
        )),
        PolicyKind::Fair => Box::new(fair::FairPolicy::new(config.fair_min_granularity)),
    }
}

impl SchedCore {
    pub fn new(config: &crate::kernel::KernelConfig, boot_context: Context) -> Self {
        Self {
            tasks: TaskTable::new(),
            next_id: 1,
            max_tasks: config.max_tasks,
            current: None,
            idle: None,
            policy: build_policy(config.policy, config),
            policy_kind: config.policy,
            wait_lists: BTreeMap::new(),
            timers: BTreeSet::new(),
            terminated: Vec::new(),
            stats: SchedStats::default(),
            ticks: 0,
            need_resched: false,
            running: false,
            boot_context,
        }
    }

    pub fn alloc_id(&mut self) -> Result<TaskId> {
        if self.tasks.len() >= self.max_tasks {
            return Err(KernelError::TooManyTasks);
        }
        let id = TaskId(self.next_id);
        self.next_id += 1;
        Ok(id)
    }

    fn enqueue_ready(&mut self, tid: TaskId) {
        self.policy.enqueue(&mut self.tasks, tid);
    }

    fn dequeue(&mut self, tid: TaskId) {
        self.policy.remove(&mut self.tasks, tid);
    }

    /// Re-admit a READY task after its scheduling key changed
    pub fn requeue(&mut self, tid: TaskId) {
        self.dequeue(tid);
        self.enqueue_ready(tid);
    }

    /// Should `woken` displace the current task?
    fn check_preempt(&mut self, woken: TaskId) {
        let Some(cur) = self.current else { return };
        if Some(cur) == self.idle || self.policy.should_preempt(&self.tasks, woken, cur) {
            self.need_resched = true;
        }
    }

    /// Admit a task that just became READY
    pub fn make_ready(&mut self, tid: TaskId) {
        if let Some(task) = self.tasks.get_mut(&tid) {
            task.state = TaskState::Ready;
        }
        self.enqueue_ready(tid);
        self.check_preempt(tid);
    }

    /// Park the current task on a wait channel
    ///
    /// The caller must already have decided the wait is necessary; the
    /// actual context switch happens at the next `schedule`.
    pub fn block_current(&mut self, channel: WaitChannel, deadline: Option<u64>) {
        let Some(cur) = self.current else { return };
        if let Some(task) = self.tasks.get_mut(&cur) {
            task.state = TaskState::Blocked;
            task.waiting_on = Some(channel);
            task.wake_deadline = deadline;
        }
        self.wait_lists.entry(channel).or_default().push_back(cur);
        if let Some(deadline) = deadline {
            self.timers.insert((deadline, cur));
        }
    }

    /// Detach a task from its wait channel and timer, if any
    fn detach_waiter(&mut self, tid: TaskId) {
        let Some(task) = self.tasks.get_mut(&tid) else { return };
        if let Some(channel) = task.waiting_on.take() {
            if let Some(queue) = self.wait_lists.get_mut(&channel) {
                queue.retain(|&id| id != tid);
            }
        }
        if let Some(deadline) = task.wake_deadline.take() {
            self.timers.remove(&(deadline, tid));
        }
    }

    /// Wake a blocked task with the given result
    ///
    /// Honors a pending suspension: the task moves to SUSPENDED instead
    /// of READY and delivers its wake result when finally resumed.
    pub fn wake_task(&mut self, tid: TaskId, result: WakeResult) {
        self.detach_waiter(tid);
        let Some(task) = self.tasks.get_mut(&tid) else { return };
        if task.state != TaskState::Blocked {
            return;
        }
        task.wake_result = Some(result);
        if task.suspend_pending {
            task.suspend_pending = false;
            task.state = TaskState::Suspended;
            return;
        }
        self.make_ready(tid);
    }

    /// Pop the longest-waiting task off a channel, waking it
    pub fn wake_one(&mut self, channel: WaitChannel, result: WakeResult) -> Option<TaskId> {
        let tid = self.wait_lists.get_mut(&channel)?.pop_front()?;
        self.wake_task(tid, result);
        Some(tid)
    }

    /// Wake every waiter on a channel in FIFO order
    pub fn wake_all(&mut self, channel: WaitChannel, result: WakeResult) -> usize {
        let mut woken = 0;
        while self.wake_one(channel, result).is_some() {
            woken += 1;
        }
        woken
    }

    pub fn has_waiters(&self, channel: WaitChannel) -> bool {
        self.wait_lists
            .get(&channel)
            .map(|q| !q.is_empty())
            .unwrap_or(false)
    }

    /// Move expired sleepers and timed waiters back to READY
    fn expire_timers(&mut self, now: u64) {
        loop {
            let Some(&(deadline, tid)) = self.timers.first() else {
                return;
            };
            if deadline > now {
                return;
            }
            self.timers.remove(&(deadline, tid));
            let result = match self.tasks.get(&tid).and_then(|t| t.waiting_on) {
                Some(WaitChannel::Sleep) => WakeResult::Completed,
                Some(_) => WakeResult::TimedOut,
                None => continue,
            };
            self.wake_task(tid, result);
        }
    }

    /// Consume the wake result delivered to a resumed task
    pub fn take_wake_result(&mut self, tid: TaskId) -> WakeResult {
        self.tasks
            .get_mut(&tid)
            .and_then(|t| t.wake_result.take())
            .unwrap_or(WakeResult::Completed)
    }

    /// Choose the next task and hand back the context pair to switch
    ///
    /// Returns None when no switch is needed. The caller performs the
    /// switch after releasing the scheduler lock.
    pub fn prepare_switch(&mut self) -> Option<(Context, Context)> {
        if !self.running {
            return None;
        }
        self.stats.scheduler_runs += 1;

        let prev = self.current;
        let was_running = prev
            .and_then(|p| self.tasks.get(&p))
            .map(|t| t.state == TaskState::Running)
            .unwrap_or(false);

        if let Some(pid) = prev {
            if was_running {
                if let Some(task) = self.tasks.get_mut(&pid) {
                    task.state = TaskState::Ready;
                }
                if Some(pid) != self.idle {
                    self.enqueue_ready(pid);
                }
            }
        }

        let decision = self.policy.pick_next(&mut self.tasks);
        let (next, slice) = match decision {
            Some(DispatchDecision { tid, timeslice }) => (tid, timeslice),
            None => (self.idle.expect("idle task missing"), DEFAULT_TIME_SLICE),
        };

        self.need_resched = false;

        if Some(next) == prev {
            if let Some(task) = self.tasks.get_mut(&next) {
                task.state = TaskState::Running;
            }
            return None;
        }

        let prev_ctx = prev
            .and_then(|p| self.tasks.get(&p))
            .map(|t| t.context)
            .unwrap_or(self.boot_context);

        let next_task = self.tasks.get_mut(&next)?;
        next_task.state = TaskState::Running;
        next_task.ticks_remaining = slice;
        let next_ctx = next_task.context;

        self.current = Some(next);
        self.stats.context_switches += 1;
        if was_running {
            self.stats.preemptions += 1;
        }

        Some((prev_ctx, next_ctx))
    }

    /// Convert every task's policy extension for a new policy, keeping
    /// matching variants (vruntime survives a round trip) and
    /// re-entering MLFQ at the top queue
    fn convert_sched_data(&mut self, kind: PolicyKind, config: &crate::kernel::KernelConfig) {
        for task in self.tasks.values_mut() {
            match kind {
                PolicyKind::RoundRobin | PolicyKind::Priority => {
                    task.sched = SchedData::Simple;
                }
                PolicyKind::Mlfq => {
                    task.sched = SchedData::Mlfq(crate::task::MlfqParams {
                        current_queue: 0,
                        slice_remaining: config.mlfq_base_slice,
                    });
                }
                PolicyKind::Fair => {
                    if !matches!(task.sched, SchedData::Fair(_)) {
                        task.sched = SchedData::Fair(crate::task::FairParams {
                            vruntime: 0,
                            weight: fair::NICE0_LOAD,
                        });
                    }
                }
                // Real-time parameters are installed explicitly; other
                // tasks keep their extension and run as background.
                PolicyKind::Realtime(_) => {}
            }
        }
    }

    pub fn set_policy(&mut self, kind: PolicyKind, config: &crate::kernel::KernelConfig) {
        if kind == self.policy_kind {
            return;
        }
        let policy = build_policy(kind, config);
        log::info!(
            "scheduler: switching policy {} -> {}",
            self.policy.name(),
            policy.name()
        );
        self.policy = policy;
        self.policy_kind = kind;
        self.convert_sched_data(kind, config);

        let ready: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(id, t)| t.state == TaskState::Ready && Some(**id) != self.idle)
            .map(|(id, _)| *id)
            .collect();
        for tid in ready {
            self.enqueue_ready(tid);
        }
        self.need_resched = true;
    }

    fn on_tick(&mut self, config: &crate::kernel::KernelConfig) -> TickOutcome {
        let _ = config;
        self.ticks += 1;
        self.stats.scheduler_runs += 1;
        let now = self.ticks;

        if let Some(task) = self.current.and_then(|c| self.tasks.get_mut(&c)) {
            task.total_ticks += 1;
        }

        self.expire_timers(now);

        // The idle task is not the policy's concern.
        let accountable = self.current.filter(|c| Some(*c) != self.idle);
        let outcome = self
            .policy
            .on_tick(&mut self.tasks, accountable, now, &mut self.stats);
        if outcome.resched {
            self.need_resched = true;
        }
        outcome
    }
}

// ================================================================================================
// KERNEL-FACING TASK AND SCHEDULER API
// ================================================================================================

impl Kernel {
    /// Create a task, ready to run
    ///
    /// The stack is carved from the kernel heap and the initial context
    /// is built so that returning from `entry` terminates the task.
    ///
    /// # Arguments
    /// * `name` - Diagnostic name, truncated at 31 bytes
    /// * `entry` - Body of the task
    /// * `priority` - Ordinal priority
    /// * `stack_size` - Stack bytes to reserve
    pub fn task_create<F>(
        &self,
        name: &str,
        entry: F,
        priority: TaskPriority,
        stack_size: usize,
    ) -> Result<TaskId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.task_create_inner(name, Box::new(entry), priority, stack_size, false)
    }

    pub(crate) fn task_create_inner(
        &self,
        name: &str,
        entry: Box<dyn FnOnce() + Send + 'static>,
        priority: TaskPriority,
        stack_size: usize,
        is_idle: bool,
    ) -> Result<TaskId> {
        if stack_size == 0 {
            return Err(KernelError::InvalidArgument);
        }

        let stack_base = self.heap_alloc(stack_size)?;
        let stack = StackRegion {
            base: stack_base.as_ptr() as u64,
            size: stack_size,
        };

        let kernel = self.self_arc();
        let exit = Box::new(move || kernel.task_exit());
        let context = self.platform.context_init(stack, entry, exit);

        let id = {
            let _irq = IrqGuard::new(&*self.platform);
            let mut sched = self.sched.lock();
            let id = match sched.alloc_id() {
                Ok(id) => id,
                Err(e) => {
                    drop(sched);
                    self.platform.context_release(context);
                    // Stack goes back before the error surfaces.
                    let _ = self.heap_free(stack_base);
                    return Err(e);
                }
            };
            sched
                .tasks
                .insert(id, Task::new(id, name, priority, stack, context));
            if is_idle {
                sched.idle = Some(id);
                if let Some(task) = sched.tasks.get_mut(&id) {
                    task.state = TaskState::Ready;
                }
            } else {
                sched.make_ready(id);
            }
            id
        };

        log::info!("created task '{}' as {} (stack {} bytes)", name, id, stack_size);
        self.preemption_point();
        Ok(id)
    }

    /// Terminate the calling task; never returns
    pub fn task_exit(&self) {
        {
            let _irq = IrqGuard::new(&*self.platform);
            let mut sched = self.sched.lock();
            let Some(cur) = sched.current else { return };
            if let Some(task) = sched.tasks.get_mut(&cur) {
                log::info!("task '{}' ({}) exiting", task.name.as_str(), cur);
                task.state = TaskState::Terminated;
            }
            sched.terminated.push(cur);
        }
        self.schedule();
        // A terminated task must never be dispatched again.
        log::error!("terminated task resumed; halting this context");
        loop {
            self.platform.wait_for_interrupt();
        }
    }

    /// Delete a task
    ///
    /// A BLOCKED target is woken with `Canceled` and unwinds itself; a
    /// READY or SUSPENDED target terminates immediately; deleting the
    /// calling task never returns.
    pub fn task_delete(&self, tid: TaskId) -> Result<()> {
        let is_current = {
            let _irq = IrqGuard::new(&*self.platform);
            let mut sched = self.sched.lock();
            if Some(tid) == sched.idle {
                return Err(KernelError::InvalidArgument);
            }
            if sched.current == Some(tid) {
                true
            } else {
                let state = sched
                    .tasks
                    .get(&tid)
                    .map(|t| t.state)
                    .ok_or(KernelError::NotFound)?;
                match state {
                    TaskState::Blocked => {
                        // The target observes the cancel on its next
                        // return from the blocking primitive.
                        if let Some(task) = sched.tasks.get_mut(&tid) {
                            task.canceled = true;
                            task.suspend_pending = false;
                        }
                        sched.wake_task(tid, WakeResult::Canceled);
                    }
                    TaskState::Ready | TaskState::Suspended => {
                        sched.dequeue(tid);
                        if let Some(task) = sched.tasks.get_mut(&tid) {
                            task.state = TaskState::Terminated;
                        }
                        sched.terminated.push(tid);
                    }
                    TaskState::Terminated => {}
                    TaskState::Running => unreachable!("running task is not current"),
                }
                false
            }
        };

        if is_current {
            self.task_exit();
            return Ok(());
        }
        log::debug!("deleted {}", tid);
        self.preemption_point();
        Ok(())
    }

    /// Move a task out of scheduling until resumed
    ///
    /// Suspending a BLOCKED task defers until it would have woken;
    /// suspending the calling task reschedules immediately.
    pub fn task_suspend(&self, tid: TaskId) -> Result<()> {
        let need_resched = {
            let _irq = IrqGuard::new(&*self.platform);
            let mut sched = self.sched.lock();
            if Some(tid) == sched.idle {
                return Err(KernelError::InvalidArgument);
            }
            let state = sched
                .tasks
                .get(&tid)
                .map(|t| t.state)
                .ok_or(KernelError::NotFound)?;
            match state {
                TaskState::Running => {
                    if let Some(task) = sched.tasks.get_mut(&tid) {
                        task.state = TaskState::Suspended;
                    }
                    true
                }
                TaskState::Ready => {
                    sched.dequeue(tid);
                    if let Some(task) = sched.tasks.get_mut(&tid) {
                        task.state = TaskState::Suspended;
                    }
                    false
                }
                TaskState::Blocked => {
                    if let Some(task) = sched.tasks.get_mut(&tid) {
                        task.suspend_pending = true;
                    }
                    false
                }
                TaskState::Suspended => false,
                TaskState::Terminated => return Err(KernelError::InvalidState),
            }
        };
        if need_resched {
            self.schedule();
        }
        Ok(())
    }

    /// Make a suspended task runnable again
    pub fn task_resume(&self, tid: TaskId) -> Result<()> {
        {
            let _irq = IrqGuard::new(&*self.platform);
            let mut sched = self.sched.lock();
            let state = sched
                .tasks
                .get(&tid)
                .map(|t| t.state)
                .ok_or(KernelError::NotFound)?;
            match state {
                TaskState::Suspended => sched.make_ready(tid),
                TaskState::Blocked => {
                    if let Some(task) = sched.tasks.get_mut(&tid) {
                        task.suspend_pending = false;
                    }
                }
                _ => {}
            }
        }
        self.preemption_point();
        Ok(())
    }

    /// Block the calling task for at least `ms` ticks
    pub fn task_sleep(&self, ms: u64) -> Result<()> {
        if ms == 0 {
            self.task_yield();
            return Ok(());
        }
        let deadline = self.sched.lock().ticks + ms;
        match self.block_current_and_wait(WaitChannel::Sleep, Some(deadline))? {
            WakeResult::Canceled => Err(KernelError::Canceled),
            _ => Ok(()),
        }
    }

    /// Give up the CPU without changing state
    pub fn task_yield(&self) {
        self.schedule();
    }

    /// Change a task's base priority
    ///
    /// The effective priority follows unless a donation is active.
    pub fn task_set_priority(&self, tid: TaskId, priority: TaskPriority) -> Result<()> {
        {
            let _irq = IrqGuard::new(&*self.platform);
            let mut sched = self.sched.lock();
            if Some(tid) == sched.idle {
                return Err(KernelError::InvalidArgument);
            }
            let task = sched.tasks.get_mut(&tid).ok_or(KernelError::NotFound)?;
            let donated = task.effective_priority > task.base_priority;
            task.base_priority = priority;
            if !donated {
                task.effective_priority = priority;
            }
            let state = task.state;
            if state == TaskState::Ready {
                sched.dequeue(tid);
                sched.enqueue_ready(tid);
                sched.check_preempt(tid);
            }
        }
        self.preemption_point();
        Ok(())
    }

    /// The RUNNING task, if the scheduler has started
    pub fn current_task(&self) -> Option<TaskId> {
        self.sched.lock().current
    }

    /// A task's lifecycle state
    pub fn task_state(&self, tid: TaskId) -> Result<TaskState> {
        self.sched
            .lock()
            .tasks
            .get(&tid)
            .map(|t| t.state)
            .ok_or(KernelError::NotFound)
    }

    /// A task's policy extension snapshot
    pub fn task_sched_data(&self, tid: TaskId) -> Result<SchedData> {
        self.sched
            .lock()
            .tasks
            .get(&tid)
            .map(|t| t.sched)
            .ok_or(KernelError::NotFound)
    }

    /// Total ticks a task has run
    pub fn task_total_ticks(&self, tid: TaskId) -> Result<u64> {
        self.sched
            .lock()
            .tasks
            .get(&tid)
            .map(|t| t.total_ticks)
            .ok_or(KernelError::NotFound)
    }

    /// Install a scheduling policy, preserving per-task extension state
    pub fn set_policy(&self, kind: PolicyKind) {
        {
            let _irq = IrqGuard::new(&*self.platform);
            let mut sched = self.sched.lock();
            let config = self.config.clone();
            sched.set_policy(kind, &config);
        }
        self.preemption_point();
    }

    /// The installed scheduling policy
    pub fn policy(&self) -> PolicyKind {
        self.sched.lock().policy_kind
    }

    /// Enter the real-time class with {period, relative deadline,
    /// worst-case execution} in ticks
    pub fn set_realtime_params(
        &self,
        tid: TaskId,
        period: u64,
        relative_deadline: u64,
        worst_case_exec: u64,
    ) -> Result<()> {
        if period == 0 || relative_deadline == 0 || worst_case_exec == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let _irq = IrqGuard::new(&*self.platform);
        let mut sched = self.sched.lock();
        let now = sched.ticks;
        let task = sched.tasks.get_mut(&tid).ok_or(KernelError::NotFound)?;
        task.sched = realtime::init_rt_data(now, period, relative_deadline, worst_case_exec);
        let state = task.state;
        if state == TaskState::Ready {
            sched.dequeue(tid);
            sched.enqueue_ready(tid);
        }
        Ok(())
    }

    /// Liu-Layland utilization advisory over the real-time task set
    pub fn check_schedulability(&self) -> bool {
        realtime::check_schedulability(&self.sched.lock().tasks)
    }

    /// Set a fair-class task's load weight directly
    pub fn set_weight(&self, tid: TaskId, weight: u32) -> Result<()> {
        if weight == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let _irq = IrqGuard::new(&*self.platform);
        let mut sched = self.sched.lock();
        let task = sched.tasks.get_mut(&tid).ok_or(KernelError::NotFound)?;
        match &mut task.sched {
            SchedData::Fair(params) => params.weight = weight,
            other => {
                *other = SchedData::Fair(crate::task::FairParams { vruntime: 0, weight });
            }
        }
        let state = task.state;
        if state == TaskState::Ready {
            sched.dequeue(tid);
            sched.enqueue_ready(tid);
        }
        Ok(())
    }

    /// Set a fair-class task's weight through the nice table
    pub fn set_nice(&self, tid: TaskId, nice: i8) -> Result<()> {
        self.set_weight(tid, fair::weight_for_nice(nice))
    }

    /// Scheduler statistics snapshot
    pub fn sched_stats(&self) -> SchedStats {
        self.sched.lock().stats
    }

    pub fn reset_sched_stats(&self) {
        self.sched.lock().stats = SchedStats::default();
    }

    /// Global tick counter
    pub fn now_ticks(&self) -> u64 {
        self.sched.lock().ticks
    }

    // ============================================================
    // Mechanism internals shared with sync/mm/ipc
    // ============================================================

    /// Timer interrupt entry: counter, sleepers, policy accounting,
    /// replacement sampling, then the preemption decision on the way out
    pub fn timer_tick(&self) {
        let (outcome, now) = {
            let _irq = IrqGuard::new(&*self.platform);
            let mut sched = self.sched.lock();
            let outcome = sched.on_tick(&self.config);
            (outcome, sched.ticks)
        };

        if self.config.replacement == crate::mm::frame::ReplacementAlgorithm::Nfu
            && now % self.config.nfu_sample_period.max(1) == 0
        {
            self.replacement_sample();
        }

        if let Some(until) = outcome.block_current_until {
            // Real-time budget exhausted: off the CPU until the next
            // release.
            let _ = self.block_current_and_wait(WaitChannel::Sleep, Some(until));
            return;
        }
        self.preemption_point();
    }

    /// Run the scheduler now; switches context when a different task wins
    pub(crate) fn schedule(&self) {
        let switch = {
            let _irq = IrqGuard::new(&*self.platform);
            self.sched.lock().prepare_switch()
        };
        if let Some((prev, next)) = switch {
            self.platform.context_switch(prev, next);
        }
    }

    /// Reschedule if something marked the flag since the last switch
    pub(crate) fn preemption_point(&self) {
        let pending = {
            let sched = self.sched.lock();
            sched.need_resched && sched.running && sched.current.is_some()
        };
        if pending {
            self.schedule();
        }
    }

    /// Block the calling task on `channel` and wait to be woken
    ///
    /// Returns the waker's verdict. Fails fast with `Canceled` for a
    /// task already marked for deletion and `InvalidState` outside task
    /// context.
    pub(crate) fn block_current_and_wait(
        &self,
        channel: WaitChannel,
        deadline: Option<u64>,
    ) -> Result<WakeResult> {
        {
            let _irq = IrqGuard::new(&*self.platform);
            let mut sched = self.sched.lock();
            let cur = sched.current.ok_or(KernelError::InvalidState)?;
            let task = sched.tasks.get(&cur).ok_or(KernelError::InvalidState)?;
            if task.canceled {
                return Err(KernelError::Canceled);
            }
            sched.block_current(channel, deadline);
        }
        self.schedule();
        // Back on the CPU: somebody woke us.
        let mut sched = self.sched.lock();
        let cur = sched.current.ok_or(KernelError::InvalidState)?;
        Ok(sched.take_wake_result(cur))
    }

    /// Release the resources of terminated tasks; run by the idle task
    pub fn reap_terminated(&self) {
        let reapable = {
            let _irq = IrqGuard::new(&*self.platform);
            let mut sched = self.sched.lock();
            let current = sched.current;
            let mut keep = Vec::new();
            let mut reapable = Vec::new();
            for tid in core::mem::take(&mut sched.terminated) {
                if Some(tid) == current {
                    keep.push(tid);
                    continue;
                }
                if let Some(task) = sched.tasks.remove(&tid) {
                    reapable.push((task.stack, task.context));
                }
            }
            sched.terminated = keep;
            reapable
        };
        for (stack, context) in reapable {
            self.platform.context_release(context);
            if let Some(ptr) = core::ptr::NonNull::new(stack.base as *mut u8) {
                let _ = self.heap_free(ptr);
            }
        }
    }

    /// Start multitasking; returns when `stop` is called
    pub fn start(&self) {
        log::info!("scheduler starting ({} tasks)", self.sched.lock().tasks.len());
        {
            let mut sched = self.sched.lock();
            sched.running = true;
        }
        let switch = {
            let _irq = IrqGuard::new(&*self.platform);
            self.sched.lock().prepare_switch()
        };
        if let Some((prev, next)) = switch {
            self.platform.context_switch(prev, next);
        }
        log::info!("scheduler stopped");
    }

    /// Stop multitasking and hand control back to the `start` caller
    pub fn stop(&self) {
        let switch = {
            let _irq = IrqGuard::new(&*self.platform);
            let mut sched = self.sched.lock();
            sched.running = false;
            let cur = sched.current.and_then(|c| sched.tasks.get(&c)).map(|t| t.context);
            cur.map(|ctx| (ctx, sched.boot_context))
        };
        if let Some((prev, next)) = switch {
            self.platform.context_switch(prev, next);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::platform::Context;

    /// A task table of bare tasks for policy tests
    pub fn table_with(ids: &[u64]) -> TaskTable {
        table_with_priorities(
            &ids.iter()
                .map(|&id| (id, TaskPriority::Normal))
                .collect::<Vec<_>>(),
        )
    }

    pub fn table_with_priorities(entries: &[(u64, TaskPriority)]) -> TaskTable {
        let mut tasks = TaskTable::new();
        for &(id, priority) in entries {
            let task = Task::new(
                TaskId(id),
                "test",
                priority,
                StackRegion { base: 0, size: 0 },
                Context(0),
            );
            tasks.insert(TaskId(id), task);
        }
        tasks
    }

    fn core_with(ids: &[u64]) -> SchedCore {
        let config = crate::kernel::KernelConfig::default();
        let mut core = SchedCore::new(&config, Context(0));
        core.tasks = table_with(ids);
        core.next_id = ids.iter().max().map(|m| m + 1).unwrap_or(1);
        core
    }

    #[test]
    fn waiters_wake_in_fifo_order() {
        let mut core = core_with(&[1, 2, 3]);
        let channel = WaitChannel::Mutex(7);
        for id in [1u64, 2, 3] {
            core.current = Some(TaskId(id));
            core.block_current(channel, None);
        }
        core.current = None;

        assert_eq!(core.wake_one(channel, WakeResult::Completed), Some(TaskId(1)));
        assert_eq!(core.wake_one(channel, WakeResult::Completed), Some(TaskId(2)));
        assert_eq!(core.wake_one(channel, WakeResult::Completed), Some(TaskId(3)));
        assert_eq!(core.wake_one(channel, WakeResult::Completed), None);
    }

    #[test]
    fn timer_expiry_delivers_timeout_and_clears_wait_list() {
        let mut core = core_with(&[1]);
        let channel = WaitChannel::Condvar(3);
        core.current = Some(TaskId(1));
        core.block_current(channel, Some(10));
        core.current = None;

        core.expire_timers(9);
        assert_eq!(core.tasks[&TaskId(1)].state, TaskState::Blocked);
        core.expire_timers(10);
        assert_eq!(core.tasks[&TaskId(1)].state, TaskState::Ready);
        assert!(!core.has_waiters(channel));
        assert_eq!(core.take_wake_result(TaskId(1)), WakeResult::TimedOut);
    }

    #[test]
    fn suspension_of_blocked_task_defers_to_wake() {
        let mut core = core_with(&[1]);
        let channel = WaitChannel::Semaphore(1);
        core.current = Some(TaskId(1));
        core.block_current(channel, None);
        core.current = None;
        core.tasks.get_mut(&TaskId(1)).unwrap().suspend_pending = true;

        core.wake_one(channel, WakeResult::Completed);
        assert_eq!(core.tasks[&TaskId(1)].state, TaskState::Suspended);
        // The wake result is kept for delivery on resume.
        assert_eq!(core.take_wake_result(TaskId(1)), WakeResult::Completed);
    }

    #[test]
    fn blocked_task_sits_on_exactly_one_wait_list() {
        let mut core = core_with(&[1, 2]);
        core.current = Some(TaskId(1));
        core.block_current(WaitChannel::Mutex(1), None);
        core.current = Some(TaskId(2));
        core.block_current(WaitChannel::Sleep, Some(5));
        core.current = None;

        let mut appearances = 0;
        for queue in core.wait_lists.values() {
            appearances += queue.iter().filter(|&&id| id == TaskId(1)).count();
        }
        assert_eq!(appearances, 1);
        assert_eq!(core.tasks[&TaskId(1)].waiting_on, Some(WaitChannel::Mutex(1)));
        assert_eq!(core.tasks[&TaskId(2)].waiting_on, Some(WaitChannel::Sleep));
    }
}
