/*
 * Condition Variable
 *
 * wait() atomically parks the caller on the condition's wait list,
 * releases the paired mutex and blocks; on wake it reacquires the mutex
 * before returning. Spurious wakes are permitted, so callers re-check
 * their predicate in a loop.
 *
 * The caller is parked on the wait list before the mutex is released,
 * which closes the signal-lost window between unlock and block.
 */

use core::fmt;

use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::platform::IrqGuard;
use crate::sync::{sync_id, KCondvar, MutexId};
use crate::task::{make_name, WaitChannel, WaitOutcome, WakeResult};

sync_id!(
    /// Handle of a condition variable
    CondvarId,
    "Condvar"
);

impl Kernel {
    /// Create a condition variable
    pub fn cond_create(&self, name: &str) -> Result<CondvarId> {
        let mut sync = self.sync.lock();
        let id = sync.alloc_id()?;
        sync.condvars.insert(
            id,
            KCondvar {
                name: make_name(name),
            },
        );
        log::debug!("created condvar '{}' as Condvar({})", name, id);
        Ok(CondvarId(id))
    }

    /// Wait for a signal, releasing `mutex` while parked
    pub fn cond_wait(&self, id: CondvarId, mutex: MutexId) -> Result<()> {
        match self.cond_wait_inner(id, mutex, None)? {
            WaitOutcome::Completed | WaitOutcome::TimedOut => Ok(()),
        }
    }

    /// Wait for a signal with a bound of `ms` ticks
    ///
    /// The mutex is reacquired whichever way the wait ends.
    pub fn cond_timedwait(
        &self,
        id: CondvarId,
        mutex: MutexId,
        ms: u64,
    ) -> Result<WaitOutcome> {
        if ms == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let deadline = self.sched.lock().ticks + ms;
        self.cond_wait_inner(id, mutex, Some(deadline))
    }

    fn cond_wait_inner(
        &self,
        id: CondvarId,
        mutex: MutexId,
        deadline: Option<u64>,
    ) -> Result<WaitOutcome> {
        let _irq = IrqGuard::new(&*self.platform);
        let cur = self.current_task().ok_or(KernelError::InvalidState)?;
        {
            let mut sync = self.sync.lock();
            sync.condvars.get(&id.0).ok_or(KernelError::NotFound)?;
            let owner = sync
                .mutexes
                .get(&mutex.0)
                .ok_or(KernelError::NotFound)?
                .owner;
            if owner != Some(cur) {
                log::warn!("condvar Condvar({}): wait without holding the mutex", id.0);
                return Err(KernelError::InvalidState);
            }
            sync.stats.cond_contentions += 1;

            // Park on the condition before letting the mutex go.
            let mut sched = self.sched.lock();
            if sched.tasks.get(&cur).map(|t| t.canceled).unwrap_or(false) {
                return Err(KernelError::Canceled);
            }
            sched.block_current(WaitChannel::Condvar(id.0), deadline);
        }
        self.mutex_unlock_inner(mutex)?;
        self.schedule();

        // Back on the CPU; find out why.
        let result = {
            let mut sched = self.sched.lock();
            let cur = sched.current.ok_or(KernelError::InvalidState)?;
            sched.take_wake_result(cur)
        };
        match result {
            WakeResult::Canceled => Err(KernelError::Canceled),
            WakeResult::TimedOut => {
                self.mutex_lock(mutex)?;
                Ok(WaitOutcome::TimedOut)
            }
            WakeResult::Completed => {
                self.mutex_lock(mutex)?;
                Ok(WaitOutcome::Completed)
            }
        }
    }

    /// Wake the longest waiter
    pub fn cond_signal(&self, id: CondvarId) -> Result<()> {
        {
            let _irq = IrqGuard::new(&*self.platform);
            let sync = self.sync.lock();
            sync.condvars.get(&id.0).ok_or(KernelError::NotFound)?;
            self.sched
                .lock()
                .wake_one(WaitChannel::Condvar(id.0), WakeResult::Completed);
        }
        self.preemption_point();
        Ok(())
    }

    /// Wake every waiter in FIFO order
    pub fn cond_broadcast(&self, id: CondvarId) -> Result<()> {
        {
            let _irq = IrqGuard::new(&*self.platform);
            let sync = self.sync.lock();
            sync.condvars.get(&id.0).ok_or(KernelError::NotFound)?;
            self.sched
                .lock()
                .wake_all(WaitChannel::Condvar(id.0), WakeResult::Completed);
        }
        self.preemption_point();
        Ok(())
    }

    /// Destroy a condition variable; fails while tasks wait on it
    pub fn cond_destroy(&self, id: CondvarId) -> Result<()> {
        let _irq = IrqGuard::new(&*self.platform);
        let mut sync = self.sync.lock();
        let cond = sync.condvars.get(&id.0).ok_or(KernelError::NotFound)?;
        if self.sched.lock().has_waiters(WaitChannel::Condvar(id.0)) {
            log::warn!("condvar '{}': destroy with waiters", cond.name.as_str());
            return Err(KernelError::InvalidState);
        }
        sync.condvars.remove(&id.0);
        Ok(())
    }
}
