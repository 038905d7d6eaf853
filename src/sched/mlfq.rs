/*
 * Multi-Level Feedback Queue Policy
 *
 * N FIFOs with geometrically growing slices (base << queue). New tasks
 * enter queue 0; exhausting a slice demotes one queue (capped at the
 * bottom). Every boost_period ticks every task returns to queue 0,
 * which both prevents starvation and defeats slice gaming.
 */

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::sched::SchedStats;
use crate::sched::policy::{DispatchDecision, PolicyKind, SchedPolicy, TickOutcome};
use crate::task::{MlfqParams, SchedData, TaskId, TaskTable};

pub(crate) struct MlfqPolicy {
    queues: Vec<VecDeque<TaskId>>,
    base_slice: u32,
    boost_period: u64,
    boost_counter: u64,
}

impl MlfqPolicy {
    pub fn new(queue_count: usize, base_slice: u32, boost_period: u64) -> Self {
        let mut queues = Vec::with_capacity(queue_count);
        for _ in 0..queue_count {
            queues.push(VecDeque::new());
        }
        Self {
            queues,
            base_slice,
            boost_period,
            boost_counter: 0,
        }
    }

    /// Slice for a queue index: base << queue
    fn quantum(&self, queue: u32) -> u32 {
        self.base_slice << queue
    }

    /// Promote every queued task back to queue 0 with a fresh top slice
    fn boost(&mut self, tasks: &mut TaskTable) {
        let base = self.base_slice;
        let mut moved = 0usize;
        for level in 1..self.queues.len() {
            while let Some(tid) = self.queues[level].pop_front() {
                if let Some(data) = mlfq_data(tasks, tid) {
                    data.current_queue = 0;
                    data.slice_remaining = base;
                }
                self.queues[0].push_back(tid);
                moved += 1;
            }
        }
        self.boost_counter = 0;
        if moved > 0 {
            log::debug!("mlfq: boosted {} tasks to queue 0", moved);
        }
    }
}

fn mlfq_data(tasks: &mut TaskTable, tid: TaskId) -> Option<&mut MlfqParams> {
    match tasks.get_mut(&tid).map(|t| &mut t.sched) {
        Some(SchedData::Mlfq(params)) => Some(params),
        _ => None,
    }
}

impl SchedPolicy for MlfqPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Mlfq
    }

    fn name(&self) -> &'static str {
        "mlfq"
    }

    fn enqueue(&mut self, tasks: &mut TaskTable, tid: TaskId) {
        let base = self.base_slice;
        let queue = {
            let Some(task) = tasks.get_mut(&tid) else { return };
            match &mut task.sched {
                SchedData::Mlfq(params) => params.current_queue,
                other => {
                    *other = SchedData::Mlfq(MlfqParams {
                        current_queue: 0,
                        slice_remaining: base,
                    });
                    0
                }
            }
        } as usize;
        let queue = queue.min(self.queues.len() - 1);
        if !self.queues[queue].contains(&tid) {
            self.queues[queue].push_back(tid);
        }
    }

    fn remove(&mut self, _tasks: &mut TaskTable, tid: TaskId) {
        for queue in &mut self.queues {
            queue.retain(|&id| id != tid);
        }
    }

    fn pick_next(&mut self, tasks: &mut TaskTable) -> Option<DispatchDecision> {
        for queue in &mut self.queues {
            if let Some(tid) = queue.pop_front() {
                let timeslice = mlfq_data(tasks, tid)
                    .map(|d| d.slice_remaining)
                    .filter(|&s| s > 0)
                    .unwrap_or(self.base_slice);
                return Some(DispatchDecision { tid, timeslice });
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
        let bottom = (self.queues.len() - 1) as u32;
        let base = self.base_slice;

        if let Some(tid) = current {
            let mut demote_resched = false;
            if let Some(data) = mlfq_data(tasks, tid) {
                if data.slice_remaining > 0 {
                    data.slice_remaining -= 1;
                }
                if data.slice_remaining == 0 {
                    // Slice used up: drop one queue and refill there.
                    data.current_queue = (data.current_queue + 1).min(bottom);
                    data.slice_remaining = base << data.current_queue;
                    demote_resched = true;
                }
            }
            outcome.resched = demote_resched;
        }

        self.boost_counter += 1;
        if self.boost_counter >= self.boost_period {
            self.boost(tasks);
            // The running task is not queued but is promoted all the
            // same.
            if let Some(data) = current.and_then(|tid| mlfq_data(tasks, tid)) {
                data.current_queue = 0;
                data.slice_remaining = base;
            }
        }
        outcome
    }

    fn should_preempt(&self, tasks: &TaskTable, woken: TaskId, current: TaskId) -> bool {
        let queue_of = |tid: TaskId| match tasks.get(&tid).map(|t| &t.sched) {
            Some(SchedData::Mlfq(p)) => p.current_queue,
            _ => 0,
        };
        queue_of(woken) < queue_of(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::tests::table_with;

    #[test]
    fn new_tasks_enter_queue_zero_with_base_slice() {
        let mut tasks = table_with(&[1]);
        let mut policy = MlfqPolicy::new(8, 4, 100);
        policy.enqueue(&mut tasks, TaskId(1));

        let decision = policy.pick_next(&mut tasks).unwrap();
        assert_eq!(decision.tid, TaskId(1));
        assert_eq!(decision.timeslice, 4);
    }

    #[test]
    fn exhaustion_demotes_and_caps_at_bottom() {
        let mut tasks = table_with(&[1]);
        let mut policy = MlfqPolicy::new(3, 4, 1000);
        policy.enqueue(&mut tasks, TaskId(1));
        policy.pick_next(&mut tasks).unwrap();

        let mut stats = SchedStats::default();
        let mut queues_seen = alloc::vec![0u32];
        // Run the task dry repeatedly; it should walk 0 -> 1 -> 2 and stay.
        for _ in 0..200 {
            let out = policy.on_tick(&mut tasks, Some(TaskId(1)), 0, &mut stats);
            if out.resched {
                let queue = mlfq_data(&mut tasks, TaskId(1)).unwrap().current_queue;
                queues_seen.push(queue);
                policy.enqueue(&mut tasks, TaskId(1));
                policy.pick_next(&mut tasks).unwrap();
            }
        }
        assert!(queues_seen.starts_with(&[0, 1, 2, 2]));
    }

    #[test]
    fn boost_returns_everyone_to_the_top() {
        let mut tasks = table_with(&[1, 2]);
        let mut policy = MlfqPolicy::new(4, 2, 10);
        policy.enqueue(&mut tasks, TaskId(1));
        policy.enqueue(&mut tasks, TaskId(2));

        // Demote task 2 by hand, then tick past the boost period.
        mlfq_data(&mut tasks, TaskId(2)).unwrap().current_queue = 3;
        policy.remove(&mut tasks, TaskId(2));
        policy.enqueue(&mut tasks, TaskId(2));

        let mut stats = SchedStats::default();
        for _ in 0..10 {
            policy.on_tick(&mut tasks, None, 0, &mut stats);
        }
        assert_eq!(mlfq_data(&mut tasks, TaskId(2)).unwrap().current_queue, 0);
    }
}
