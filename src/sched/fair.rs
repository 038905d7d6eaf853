/*
 * Weighted Fair Policy (CFS-style)
 *
 * Ready tasks are ordered by virtual runtime in a balanced tree; the
 * leftmost (smallest vruntime) runs next. Each tick the running task's
 * vruntime advances by NICE0_LOAD/weight, so heavier tasks accumulate
 * vruntime more slowly and therefore run proportionally longer. The
 * current task is preempted once its vruntime exceeds the tree minimum
 * by more than the minimum granularity.
 *
 * vruntime is kept in fixed-point (scale 1024) so integer division by
 * the weight keeps sub-tick precision.
 */

use alloc::collections::BTreeSet;

use crate::sched::SchedStats;
use crate::sched::policy::{
    DispatchDecision, PolicyKind, SchedPolicy, TickOutcome, DEFAULT_TIME_SLICE,
};
use crate::task::{FairParams, SchedData, TaskId, TaskPriority, TaskTable};

/// Weight of a nice-0 task
pub const NICE0_LOAD: u32 = 1024;

/// Fixed-point scale of vruntime
pub(crate) const VRUNTIME_SCALE: u64 = 1024;

/// Nice level (-20..=19) to load weight, the standard CFS table
pub(crate) const NICE_TO_WEIGHT: [u32; 40] = [
    88761, 71755, 56483, 46273, 36291, // -20..-16
    29154, 23254, 18705, 14949, 11916, // -15..-11
    9548, 7620, 6100, 4904, 3906, // -10..-6
    3121, 2501, 1991, 1586, 1277, // -5..-1
    1024, 820, 655, 526, 423, // 0..4
    335, 272, 215, 172, 137, // 5..9
    110, 87, 70, 56, 45, // 10..14
    36, 29, 23, 18, 15, // 15..19
];

/// Weight for a nice level, clamped to the table range
pub(crate) fn weight_for_nice(nice: i8) -> u32 {
    let idx = (nice as i32 + 20).clamp(0, 39) as usize;
    NICE_TO_WEIGHT[idx]
}

/// Initial weight for a task created with an ordinal priority
fn weight_for_priority(priority: TaskPriority) -> u32 {
    // Map the five ordinals onto nice 8, 4, 0, -4, -8.
    let nice = 8 - 4 * priority.index() as i32;
    weight_for_nice(nice as i8)
}

pub(crate) struct FairPolicy {
    /// Ready tasks ordered by (vruntime, id); the first element is the
    /// leftmost node
    tree: BTreeSet<(u64, TaskId)>,
    /// Preemption threshold in vruntime units
    min_granularity: u64,
}

impl FairPolicy {
    pub fn new(min_granularity_ticks: u32) -> Self {
        Self {
            tree: BTreeSet::new(),
            min_granularity: min_granularity_ticks as u64 * VRUNTIME_SCALE,
        }
    }

    /// Smallest vruntime among ready tasks
    fn min_vruntime(&self) -> Option<u64> {
        self.tree.first().map(|&(vruntime, _)| vruntime)
    }
}

impl SchedPolicy for FairPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Fair
    }

    fn name(&self) -> &'static str {
        "fair"
    }

    fn enqueue(&mut self, tasks: &mut TaskTable, tid: TaskId) {
        let floor = self.min_vruntime().unwrap_or(0);
        let Some(task) = tasks.get_mut(&tid) else { return };
        let params = match &mut task.sched {
            SchedData::Fair(params) => params,
            other => {
                *other = SchedData::Fair(FairParams {
                    vruntime: 0,
                    weight: weight_for_priority(task.base_priority),
                });
                match other {
                    SchedData::Fair(params) => params,
                    _ => unreachable!(),
                }
            }
        };
        // A task entering the tree never starts behind the pack far
        // enough to monopolize the CPU.
        if params.vruntime < floor {
            params.vruntime = floor;
        }
        self.tree.insert((params.vruntime, tid));
    }

    fn remove(&mut self, tasks: &mut TaskTable, tid: TaskId) {
        if let Some(SchedData::Fair(params)) = tasks.get(&tid).map(|t| &t.sched) {
            self.tree.remove(&(params.vruntime, tid));
        }
        // Stale key defense when vruntime moved outside the tree.
        self.tree.retain(|&(_, id)| id != tid);
    }

    fn pick_next(&mut self, _tasks: &mut TaskTable) -> Option<DispatchDecision> {
        let entry = self.tree.first().copied()?;
        self.tree.remove(&entry);
        Some(DispatchDecision {
            tid: entry.1,
            timeslice: DEFAULT_TIME_SLICE,
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
        let Some(task) = current.and_then(|tid| tasks.get_mut(&tid)) else {
            return outcome;
        };
        let SchedData::Fair(params) = &mut task.sched else {
            return outcome;
        };

        // One tick of real time, weighted into virtual time.
        params.vruntime += NICE0_LOAD as u64 * VRUNTIME_SCALE / params.weight as u64;

        if let Some(min) = self.min_vruntime() {
            if params.vruntime > min + self.min_granularity {
                outcome.resched = true;
            }
        }
        outcome
    }

    fn should_preempt(&self, tasks: &TaskTable, woken: TaskId, current: TaskId) -> bool {
        let vruntime_of = |tid: TaskId| match tasks.get(&tid).map(|t| &t.sched) {
            Some(SchedData::Fair(p)) => Some(p.vruntime),
            _ => None,
        };
        match (vruntime_of(woken), vruntime_of(current)) {
            (Some(w), Some(c)) => w + self.min_granularity < c,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::tests::table_with;

    fn fair_data(tasks: &TaskTable, id: u64) -> FairParams {
        match tasks.get(&TaskId(id)).unwrap().sched {
            SchedData::Fair(p) => p,
            _ => panic!("not fair data"),
        }
    }

    #[test]
    fn leftmost_task_runs_first() {
        let mut tasks = table_with(&[1, 2]);
        let mut policy = FairPolicy::new(4);
        policy.enqueue(&mut tasks, TaskId(1));
        policy.enqueue(&mut tasks, TaskId(2));

        // Advance task 1 past the granularity, re-admit, and the tree
        // must now prefer task 2.
        policy.remove(&mut tasks, TaskId(1));
        if let SchedData::Fair(p) = &mut tasks.get_mut(&TaskId(1)).unwrap().sched {
            p.vruntime += 100 * VRUNTIME_SCALE;
        }
        policy.enqueue(&mut tasks, TaskId(1));
        assert_eq!(policy.pick_next(&mut tasks).unwrap().tid, TaskId(2));
    }

    #[test]
    fn heavier_tasks_accumulate_vruntime_slower() {
        let mut tasks = table_with(&[1, 2]);
        let mut policy = FairPolicy::new(4);
        policy.enqueue(&mut tasks, TaskId(1));
        policy.enqueue(&mut tasks, TaskId(2));
        if let SchedData::Fair(p) = &mut tasks.get_mut(&TaskId(1)).unwrap().sched {
            p.weight = NICE0_LOAD;
        }
        if let SchedData::Fair(p) = &mut tasks.get_mut(&TaskId(2)).unwrap().sched {
            p.weight = NICE0_LOAD / 2;
        }

        let mut stats = SchedStats::default();
        policy.remove(&mut tasks, TaskId(1));
        policy.on_tick(&mut tasks, Some(TaskId(1)), 0, &mut stats);
        policy.enqueue(&mut tasks, TaskId(1));
        policy.remove(&mut tasks, TaskId(2));
        policy.on_tick(&mut tasks, Some(TaskId(2)), 0, &mut stats);
        policy.enqueue(&mut tasks, TaskId(2));

        assert_eq!(fair_data(&tasks, 1).vruntime, VRUNTIME_SCALE);
        assert_eq!(fair_data(&tasks, 2).vruntime, 2 * VRUNTIME_SCALE);
    }

    #[test]
    fn granularity_bounds_preemption() {
        let mut tasks = table_with(&[1, 2]);
        let mut policy = FairPolicy::new(4);
        policy.enqueue(&mut tasks, TaskId(1));
        policy.enqueue(&mut tasks, TaskId(2));
        policy.pick_next(&mut tasks).unwrap(); // task 1 runs

        let mut stats = SchedStats::default();
        let mut ticks_until_preempt = 0;
        loop {
            ticks_until_preempt += 1;
            if policy.on_tick(&mut tasks, Some(TaskId(1)), 0, &mut stats).resched {
                break;
            }
            assert!(ticks_until_preempt < 100, "never preempted");
        }
        // With equal weights, preemption comes right after the
        // granularity is exceeded.
        assert_eq!(ticks_until_preempt, 5);
    }
}
