/*
 * Counting Semaphore
 *
 * Post hands the count directly to the longest waiter instead of
 * incrementing, so the "count > 0 implies nobody waits" invariant holds
 * at every quiescent point.
 */

use core::fmt;

use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::platform::IrqGuard;
use crate::sync::{sync_id, KSemaphore};
use crate::task::{make_name, WaitChannel, WakeResult};

sync_id!(
    /// Handle of a counting semaphore
    SemaphoreId,
    "Semaphore"
);

impl Kernel {
    /// Create a semaphore with an initial count
    pub fn sem_create(&self, name: &str, initial: i32) -> Result<SemaphoreId> {
        if initial < 0 {
            return Err(KernelError::InvalidArgument);
        }
        let mut sync = self.sync.lock();
        let id = sync.alloc_id()?;
        sync.semaphores.insert(
            id,
            KSemaphore {
                count: initial,
                name: make_name(name),
            },
        );
        log::debug!("created semaphore '{}' as Semaphore({})", name, id);
        Ok(SemaphoreId(id))
    }

    /// Take one unit, blocking while the count is zero
    pub fn sem_wait(&self, id: SemaphoreId) -> Result<()> {
        let _irq = IrqGuard::new(&*self.platform);
        {
            let mut sync = self.sync.lock();
            let sem = sync.semaphores.get_mut(&id.0).ok_or(KernelError::NotFound)?;
            if sem.count > 0 {
                sem.count -= 1;
                return Ok(());
            }
            sync.stats.sem_contentions += 1;
        }
        match self.block_current_and_wait(WaitChannel::Semaphore(id.0), None)? {
            WakeResult::Canceled => Err(KernelError::Canceled),
            // The poster passed its unit straight to us.
            _ => Ok(()),
        }
    }

    /// Take one unit without blocking
    pub fn sem_trywait(&self, id: SemaphoreId) -> Result<()> {
        let mut sync = self.sync.lock();
        let sem = sync.semaphores.get_mut(&id.0).ok_or(KernelError::NotFound)?;
        if sem.count > 0 {
            sem.count -= 1;
            Ok(())
        } else {
            Err(KernelError::WouldBlock)
        }
    }

    /// Release one unit, waking the longest waiter if any
    pub fn sem_post(&self, id: SemaphoreId) -> Result<()> {
        {
            let _irq = IrqGuard::new(&*self.platform);
            let mut sync = self.sync.lock();
            sync.semaphores.get(&id.0).ok_or(KernelError::NotFound)?;
            let woken = self
                .sched
                .lock()
                .wake_one(WaitChannel::Semaphore(id.0), WakeResult::Completed);
            if woken.is_none() {
                if let Some(sem) = sync.semaphores.get_mut(&id.0) {
                    sem.count += 1;
                }
            }
        }
        self.preemption_point();
        Ok(())
    }

    /// Current count
    pub fn sem_count(&self, id: SemaphoreId) -> Result<i32> {
        self.sync
            .lock()
            .semaphores
            .get(&id.0)
            .map(|s| s.count)
            .ok_or(KernelError::NotFound)
    }

    /// Destroy a semaphore; fails while tasks wait on it
    pub fn sem_destroy(&self, id: SemaphoreId) -> Result<()> {
        let _irq = IrqGuard::new(&*self.platform);
        let mut sync = self.sync.lock();
        let sem = sync.semaphores.get(&id.0).ok_or(KernelError::NotFound)?;
        if self.sched.lock().has_waiters(WaitChannel::Semaphore(id.0)) {
            log::warn!("semaphore '{}': destroy with waiters", sem.name.as_str());
            return Err(KernelError::InvalidState);
        }
        sync.semaphores.remove(&id.0);
        Ok(())
    }
}
