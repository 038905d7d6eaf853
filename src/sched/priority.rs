/*
 * Fixed-Priority Policy
 *
 * One FIFO per priority level. The head of the highest non-empty queue
 * runs next; ties within a level rotate round-robin on slice
 * exhaustion. A task queues at its effective priority, so a mutex
 * priority donation moves its owner up a level for as long as the
 * donation lasts.
 */

use alloc::collections::VecDeque;

use crate::sched::SchedStats;
use crate::sched::policy::{
    DispatchDecision, PolicyKind, SchedPolicy, TickOutcome, DEFAULT_TIME_SLICE,
};
use crate::task::{SchedData, TaskId, TaskPriority, TaskTable};

pub(crate) struct PriorityPolicy {
    queues: [VecDeque<TaskId>; TaskPriority::LEVELS],
    slice: u32,
}

impl PriorityPolicy {
    pub fn new(slice: u32) -> Self {
        Self {
            queues: Default::default(),
            slice,
        }
    }

    fn level_of(tasks: &TaskTable, tid: TaskId) -> usize {
        tasks
            .get(&tid)
            .map(|t| t.effective_priority.index())
            .unwrap_or(0)
    }
}

impl SchedPolicy for PriorityPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Priority
    }

    fn name(&self) -> &'static str {
        "priority"
    }

    fn enqueue(&mut self, tasks: &mut TaskTable, tid: TaskId) {
        let level = {
            let Some(task) = tasks.get_mut(&tid) else { return };
            if !matches!(task.sched, SchedData::Simple) {
                task.sched = SchedData::Simple;
            }
            task.effective_priority.index()
        };
        if !self.queues[level].contains(&tid) {
            self.queues[level].push_back(tid);
        }
    }

    fn remove(&mut self, _tasks: &mut TaskTable, tid: TaskId) {
        for queue in &mut self.queues {
            queue.retain(|&id| id != tid);
        }
    }

    fn pick_next(&mut self, _tasks: &mut TaskTable) -> Option<DispatchDecision> {
        for queue in self.queues.iter_mut().rev() {
            if let Some(tid) = queue.pop_front() {
                return Some(DispatchDecision {
                    tid,
                    timeslice: self.slice,
                });
            }
        }
        None
    }

    fn on_tick(
        &mut self,
        tasks: &mut TaskTable,
        current: Option<TaskId>,
        _now: u64,
        _stats: &mut SchedStats,
    ) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        let Some(tid) = current else {
            return outcome;
        };
        let level = Self::level_of(tasks, tid);

        // A higher-priority arrival preempts immediately at the tick.
        if self.queues[level + 1..].iter().any(|q| !q.is_empty()) {
            outcome.resched = true;
            return outcome;
        }

        if let Some(task) = tasks.get_mut(&tid) {
            if task.ticks_remaining > 0 {
                task.ticks_remaining -= 1;
            }
            // Round-robin among equals when the slice runs out.
            if task.ticks_remaining == 0 && !self.queues[level].is_empty() {
                outcome.resched = true;
            }
        }
        outcome
    }

    fn should_preempt(&self, tasks: &TaskTable, woken: TaskId, current: TaskId) -> bool {
        Self::level_of(tasks, woken) > Self::level_of(tasks, current)
    }
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_TIME_SLICE)
    }
}
