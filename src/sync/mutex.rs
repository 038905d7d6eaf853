/*
 * Mutex
 *
 * Blocking lock with FIFO handoff: unlock passes ownership directly to
 * the longest waiter, so the lock is never observably free while
 * someone waits. The recursive variant admits nested locking by the
 * owner; ownership only transfers when the depth returns to zero.
 *
 * With priority inheritance enabled, a waiter outranking the owner
 * donates its effective priority for the duration of the hold.
 * Donation changes owner priority only; wakeup order stays FIFO.
 */

use core::fmt;

use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::platform::IrqGuard;
use crate::sync::{sync_id, KMutex};
use crate::task::{make_name, TaskState, WaitChannel, WakeResult};

sync_id!(
    /// Handle of a kernel mutex
    MutexId,
    "Mutex"
);

impl Kernel {
    /// Create a mutex
    pub fn mutex_create(&self, name: &str) -> Result<MutexId> {
        self.mutex_create_inner(name, false)
    }

    /// Create a mutex that the owner may lock recursively
    pub fn recursive_mutex_create(&self, name: &str) -> Result<MutexId> {
        self.mutex_create_inner(name, true)
    }

    fn mutex_create_inner(&self, name: &str, recursive: bool) -> Result<MutexId> {
        let mut sync = self.sync.lock();
        let id = sync.alloc_id()?;
        sync.mutexes.insert(
            id,
            KMutex {
                locked: false,
                owner: None,
                depth: 0,
                recursive,
                donated: false,
                name: make_name(name),
            },
        );
        log::debug!("created mutex '{}' as Mutex({})", name, id);
        Ok(MutexId(id))
    }

    /// Acquire, blocking until available
    pub fn mutex_lock(&self, id: MutexId) -> Result<()> {
        let _irq = IrqGuard::new(&*self.platform);
        let cur = self.current_task().ok_or(KernelError::InvalidState)?;
        {
            let mut sync = self.sync.lock();
            let mutex = sync.mutexes.get_mut(&id.0).ok_or(KernelError::NotFound)?;

            if !mutex.locked {
                mutex.locked = true;
                mutex.owner = Some(cur);
                mutex.depth = 1;
                return Ok(());
            }
            if mutex.owner == Some(cur) {
                if mutex.recursive {
                    mutex.depth += 1;
                    return Ok(());
                }
                log::warn!("mutex '{}': relock by owner {}", mutex.name.as_str(), cur);
                return Err(KernelError::InvalidState);
            }

            sync.stats.mutex_contentions += 1;
            let owner = sync.mutexes.get(&id.0).and_then(|m| m.owner);

            // Donate the waiter's priority to a lower-priority owner.
            if self.config.priority_inheritance {
                if let Some(owner) = owner {
                    let mut sched = self.sched.lock();
                    let waiter_prio = sched.tasks.get(&cur).map(|t| t.effective_priority);
                    let mut donated = false;
                    if let (Some(prio), Some(task)) = (waiter_prio, sched.tasks.get_mut(&owner)) {
                        if prio > task.effective_priority {
                            task.effective_priority = prio;
                            donated = true;
                        }
                    }
                    if donated {
                        if sched.tasks.get(&owner).map(|t| t.state) == Some(TaskState::Ready) {
                            sched.requeue(owner);
                        }
                        drop(sched);
                        if let Some(mutex) = sync.mutexes.get_mut(&id.0) {
                            mutex.donated = true;
                        }
                        log::debug!("mutex Mutex({}): priority donated to {}", id.0, owner);
                    }
                }
            }
        }

        match self.block_current_and_wait(WaitChannel::Mutex(id.0), None)? {
            WakeResult::Canceled => Err(KernelError::Canceled),
            // Ownership was transferred by the releaser.
            _ => Ok(()),
        }
    }

    /// Acquire without blocking
    pub fn mutex_trylock(&self, id: MutexId) -> Result<()> {
        let _irq = IrqGuard::new(&*self.platform);
        let cur = self.current_task().ok_or(KernelError::InvalidState)?;
        let mut sync = self.sync.lock();
        let mutex = sync.mutexes.get_mut(&id.0).ok_or(KernelError::NotFound)?;
        if !mutex.locked {
            mutex.locked = true;
            mutex.owner = Some(cur);
            mutex.depth = 1;
            return Ok(());
        }
        if mutex.recursive && mutex.owner == Some(cur) {
            mutex.depth += 1;
            return Ok(());
        }
        Err(KernelError::WouldBlock)
    }

    /// Release; must be called by the owner
    pub fn mutex_unlock(&self, id: MutexId) -> Result<()> {
        self.mutex_unlock_inner(id)?;
        self.preemption_point();
        Ok(())
    }

    /// Release without taking the preemption point; the condvar wait
    /// path schedules immediately afterwards anyway
    pub(crate) fn mutex_unlock_inner(&self, id: MutexId) -> Result<()> {
        let _irq = IrqGuard::new(&*self.platform);
        let cur = self.current_task().ok_or(KernelError::InvalidState)?;
        let mut sync = self.sync.lock();
        let mutex = sync.mutexes.get_mut(&id.0).ok_or(KernelError::NotFound)?;

        if mutex.owner != Some(cur) {
            log::warn!(
                "mutex '{}': unlock by {} which is not the owner",
                mutex.name.as_str(),
                cur
            );
            return Err(KernelError::InvalidState);
        }
        if mutex.depth > 1 {
            mutex.depth -= 1;
            return Ok(());
        }

        let restore_donation = mutex.donated;
        mutex.donated = false;

        let mut sched = self.sched.lock();
        if restore_donation {
            if let Some(task) = sched.tasks.get_mut(&cur) {
                task.effective_priority = task.base_priority;
            }
        }
        let next = sched.wake_one(WaitChannel::Mutex(id.0), WakeResult::Completed);
        drop(sched);

        match next {
            Some(next) => {
                mutex.owner = Some(next);
                mutex.depth = 1;
            }
            None => {
                mutex.locked = false;
                mutex.owner = None;
                mutex.depth = 0;
            }
        }
        Ok(())
    }

    /// Whether the mutex is currently held
    pub fn mutex_is_locked(&self, id: MutexId) -> Result<bool> {
        self.sync
            .lock()
            .mutexes
            .get(&id.0)
            .map(|m| m.locked)
            .ok_or(KernelError::NotFound)
    }

    /// Destroy a mutex; fails while it is held or waited on
    pub fn mutex_destroy(&self, id: MutexId) -> Result<()> {
        let _irq = IrqGuard::new(&*self.platform);
        let mut sync = self.sync.lock();
        let mutex = sync.mutexes.get(&id.0).ok_or(KernelError::NotFound)?;
        let busy =
            mutex.locked || self.sched.lock().has_waiters(WaitChannel::Mutex(id.0));
        if busy {
            log::warn!("mutex '{}': destroy while busy", mutex.name.as_str());
            return Err(KernelError::InvalidState);
        }
        sync.mutexes.remove(&id.0);
        Ok(())
    }
}
