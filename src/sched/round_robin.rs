/*
 * Round-Robin Policy
 *
 * A single FIFO of ready tasks. Every dispatch hands out the same
 * slice; when the slice is exhausted the task goes to the back of the
 * queue and the head runs next.
 */

use alloc::collections::VecDeque;

use crate::sched::SchedStats;
use crate::sched::policy::{
    DispatchDecision, PolicyKind, SchedPolicy, TickOutcome, DEFAULT_TIME_SLICE,
};
use crate::task::{SchedData, TaskId, TaskTable};

pub(crate) struct RoundRobinPolicy {
    ready: VecDeque<TaskId>,
    slice: u32,
}

impl RoundRobinPolicy {
    pub fn new(slice: u32) -> Self {
        Self {
            ready: VecDeque::new(),
            slice,
        }
    }
}

impl SchedPolicy for RoundRobinPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::RoundRobin
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn enqueue(&mut self, tasks: &mut TaskTable, tid: TaskId) {
        if let Some(task) = tasks.get_mut(&tid) {
            if !matches!(task.sched, SchedData::Simple) {
                task.sched = SchedData::Simple;
            }
        }
        if !self.ready.contains(&tid) {
            self.ready.push_back(tid);
        }
    }

    fn remove(&mut self, _tasks: &mut TaskTable, tid: TaskId) {
        self.ready.retain(|&id| id != tid);
    }

    fn pick_next(&mut self, _tasks: &mut TaskTable) -> Option<DispatchDecision> {
        self.ready.pop_front().map(|tid| DispatchDecision {
            tid,
            timeslice: self.slice,
        })
    }

    fn on_tick(
        &mut self,
        tasks: &mut TaskTable,
        current: Option<TaskId>,
        _now: u64,
        _stats: &mut SchedStats,
    ) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        if let Some(task) = current.and_then(|tid| tasks.get_mut(&tid)) {
            if task.ticks_remaining > 0 {
                task.ticks_remaining -= 1;
            }
            if task.ticks_remaining == 0 && !self.ready.is_empty() {
                outcome.resched = true;
            }
        }
        outcome
    }
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_TIME_SLICE)
    }
}
