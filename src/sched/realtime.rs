/*
 * Real-Time Policy (EDF / Rate-Monotonic)
 *
 * Periodic tasks carry {period, relative deadline, worst-case execution
 * budget}. Each tick the policy releases due instances, counts missed
 * deadlines and charges the running instance against its budget; a task
 * that exhausts its budget is put to sleep until its next release.
 *
 * EDF picks the ready task with the smallest absolute deadline,
 * rate-monotonic the one with the smallest period. Tasks without
 * real-time parameters fall back to a background FIFO that only runs
 * when no real-time task is ready.
 *
 * The Liu-Layland feasibility advisory uses an integer bound table for
 * n*(2^(1/n)-1) in thousandths; above the table the bound converges to
 * ln 2 (693/1000).
 */

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::sched::SchedStats;
use crate::sched::policy::{
    DispatchDecision, PolicyKind, RtMode, SchedPolicy, TickOutcome, DEFAULT_TIME_SLICE,
};
use crate::task::{SchedData, TaskId, TaskState, TaskTable};

/// n * (2^(1/n) - 1) in thousandths, for n = 1..=16
const UTILIZATION_BOUND: [u64; 16] = [
    1000, 828, 780, 757, 743, 735, 729, 724, 721, 718, 716, 714, 712, 711, 710, 709,
];

/// Liu-Layland bound for an n-task set, in thousandths
pub(crate) fn utilization_bound(n: usize) -> u64 {
    if n == 0 {
        return 1000;
    }
    if n <= UTILIZATION_BOUND.len() {
        UTILIZATION_BOUND[n - 1]
    } else {
        693
    }
}

pub(crate) struct RealtimePolicy {
    mode: RtMode,
    /// Ready real-time tasks, selection order decided at pick time
    ready: Vec<TaskId>,
    /// Ready tasks without real-time parameters
    background: VecDeque<TaskId>,
}

impl RealtimePolicy {
    pub fn new(mode: RtMode) -> Self {
        Self {
            mode,
            ready: Vec::new(),
            background: VecDeque::new(),
        }
    }

    /// Selection key: lower wins
    fn key(&self, tasks: &TaskTable, tid: TaskId) -> u64 {
        let Some(params) = tasks.get(&tid).and_then(|t| t.rt_params()) else {
            return u64::MAX;
        };
        match self.mode {
            RtMode::EarliestDeadline => params.absolute_deadline,
            RtMode::RateMonotonic => params.period,
        }
    }
}

impl SchedPolicy for RealtimePolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Realtime(self.mode)
    }

    fn name(&self) -> &'static str {
        match self.mode {
            RtMode::EarliestDeadline => "edf",
            RtMode::RateMonotonic => "rate-monotonic",
        }
    }

    fn enqueue(&mut self, tasks: &mut TaskTable, tid: TaskId) {
        let is_rt = tasks
            .get(&tid)
            .map(|t| t.rt_params().is_some())
            .unwrap_or(false);
        if is_rt {
            if !self.ready.contains(&tid) {
                self.ready.push(tid);
            }
        } else if !self.background.contains(&tid) {
            self.background.push_back(tid);
        }
    }

    fn remove(&mut self, _tasks: &mut TaskTable, tid: TaskId) {
        self.ready.retain(|&id| id != tid);
        self.background.retain(|&id| id != tid);
    }

    fn pick_next(&mut self, tasks: &mut TaskTable) -> Option<DispatchDecision> {
        let best = self
            .ready
            .iter()
            .enumerate()
            .min_by_key(|&(_, &tid)| self.key(tasks, tid))
            .map(|(pos, _)| pos);
        if let Some(pos) = best {
            let tid = self.ready.swap_remove(pos);
            return Some(DispatchDecision {
                tid,
                timeslice: DEFAULT_TIME_SLICE,
            });
        }
        self.background.pop_front().map(|tid| DispatchDecision {
            tid,
            timeslice: DEFAULT_TIME_SLICE,
        })
    }

    fn on_tick(
        &mut self,
        tasks: &mut TaskTable,
        current: Option<TaskId>,
        now: u64,
        stats: &mut SchedStats,
    ) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        // Release due instances and count missed deadlines. A task
        // sleeping out a budget overrun is woken by its wake deadline,
        // which the release schedule below keeps aligned.
        for task in tasks.values_mut() {
            let state = task.state;
            let Some(params) = task.rt_params_mut() else {
                continue;
            };
            if now >= params.next_release {
                params.absolute_deadline = now + params.relative_deadline;
                params.exec_time_used = 0;
                params.deadline_missed = false;
                params.next_release += params.period;
            } else if now > params.absolute_deadline
                && !params.deadline_missed
                && params.exec_time_used < params.worst_case_exec
                && state != TaskState::Terminated
            {
                // The instance ran past its deadline without finishing
                // its budget.
                params.deadline_missed = true;
                stats.missed_deadlines += 1;
            }
        }

        // Charge the running instance against its budget.
        if let Some(task) = current.and_then(|tid| tasks.get_mut(&tid)) {
            if let Some(params) = task.rt_params_mut() {
                params.exec_time_used += 1;
                if params.exec_time_used >= params.worst_case_exec {
                    outcome.block_current_until = Some(params.next_release);
                    outcome.resched = true;
                    return outcome;
                }
            }
        }

        // Preempt when a ready instance now outranks the current one.
        if let Some(cur) = current {
            let cur_key = self.key(tasks, cur);
            if self
                .ready
                .iter()
                .any(|&tid| self.key(tasks, tid) < cur_key)
            {
                outcome.resched = true;
            }
        }
        outcome
    }

    fn should_preempt(&self, tasks: &TaskTable, woken: TaskId, current: TaskId) -> bool {
        self.key(tasks, woken) < self.key(tasks, current)
    }
}

/// Liu-Layland schedulability advisory over every task carrying
/// real-time parameters: sum of exec/period must stay under
/// n*(2^(1/n)-1)
pub(crate) fn check_schedulability(tasks: &TaskTable) -> bool {
    let mut n = 0usize;
    let mut utilization = 0u64; // thousandths
    for task in tasks.values() {
        if let Some(params) = task.rt_params() {
            if params.period == 0 {
                return false;
            }
            n += 1;
            utilization += params.worst_case_exec * 1000 / params.period;
        }
    }
    utilization <= utilization_bound(n)
}

/// Fresh parameter block for a task entering the real-time class
pub(crate) fn init_rt_data(now: u64, period: u64, deadline: u64, exec: u64) -> SchedData {
    SchedData::Rt(crate::task::RtParams {
        period,
        relative_deadline: deadline,
        worst_case_exec: exec,
        next_release: now,
        absolute_deadline: now + deadline,
        exec_time_used: 0,
        deadline_missed: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::tests::table_with;
    use crate::task::TaskId;

    fn give_rt(tasks: &mut TaskTable, id: u64, period: u64, deadline: u64, exec: u64) {
        tasks.get_mut(&TaskId(id)).unwrap().sched = init_rt_data(0, period, deadline, exec);
    }

    #[test]
    fn edf_picks_earliest_deadline() {
        let mut tasks = table_with(&[1, 2, 3]);
        give_rt(&mut tasks, 1, 100, 100, 10);
        give_rt(&mut tasks, 2, 50, 50, 10);
        give_rt(&mut tasks, 3, 80, 80, 10);

        let mut policy = RealtimePolicy::new(RtMode::EarliestDeadline);
        for id in [1u64, 2, 3] {
            policy.enqueue(&mut tasks, TaskId(id));
        }
        assert_eq!(policy.pick_next(&mut tasks).unwrap().tid, TaskId(2));
        assert_eq!(policy.pick_next(&mut tasks).unwrap().tid, TaskId(3));
    }

    #[test]
    fn rate_monotonic_picks_smallest_period() {
        let mut tasks = table_with(&[1, 2]);
        give_rt(&mut tasks, 1, 200, 200, 10);
        give_rt(&mut tasks, 2, 40, 40, 5);

        let mut policy = RealtimePolicy::new(RtMode::RateMonotonic);
        policy.enqueue(&mut tasks, TaskId(1));
        policy.enqueue(&mut tasks, TaskId(2));
        assert_eq!(policy.pick_next(&mut tasks).unwrap().tid, TaskId(2));
    }

    #[test]
    fn budget_overrun_blocks_until_next_release() {
        let mut tasks = table_with(&[1]);
        give_rt(&mut tasks, 1, 100, 100, 2);
        let mut policy = RealtimePolicy::new(RtMode::EarliestDeadline);
        let mut stats = SchedStats::default();

        // Tick 1 releases the first instance and charges one tick.
        let out = policy.on_tick(&mut tasks, Some(TaskId(1)), 1, &mut stats);
        assert!(out.block_current_until.is_none());
        let out = policy.on_tick(&mut tasks, Some(TaskId(1)), 2, &mut stats);
        assert_eq!(out.block_current_until, Some(100));
    }

    #[test]
    fn feasibility_bound_accepts_light_load_and_rejects_overload() {
        let mut tasks = table_with(&[1, 2]);
        give_rt(&mut tasks, 1, 100, 100, 20);
        give_rt(&mut tasks, 2, 100, 100, 30);
        assert!(check_schedulability(&tasks)); // 0.5 <= 0.828

        tasks.get_mut(&TaskId(2)).unwrap().sched = init_rt_data(0, 100, 100, 70);
        assert!(!check_schedulability(&tasks)); // 0.9 > 0.828
    }
}
