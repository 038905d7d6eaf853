/*
 * Reader/Writer Lock
 *
 * Layered on a mutex and two condition variables, writer-preferring: a
 * waiting writer blocks new readers, so writers cannot starve behind a
 * stream of readers. Release order follows the same rule - a writer
 * unlock signals one writer first and only broadcasts readers when no
 * writer waits.
 */

use core::fmt;

use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::sync::{sync_id, KRwLock};
use crate::task::make_name;

sync_id!(
    /// Handle of a reader/writer lock
    RwLockId,
    "RwLock"
);

impl Kernel {
    /// Create a reader/writer lock
    pub fn rwlock_create(&self, name: &str) -> Result<RwLockId> {
        let mutex = self.mutex_create(name)?;
        let readers = self.cond_create(name)?;
        let writers = self.cond_create(name)?;
        let mut sync = self.sync.lock();
        let id = sync.alloc_id()?;
        sync.rwlocks.insert(
            id,
            KRwLock {
                mutex,
                readers,
                writers,
                reader_count: 0,
                writer_owner: None,
                waiting_writers: 0,
                name: make_name(name),
            },
        );
        log::debug!("created rwlock '{}' as RwLock({})", name, id);
        Ok(RwLockId(id))
    }

    fn rwlock_parts(&self, id: RwLockId) -> Result<(crate::sync::MutexId, crate::sync::CondvarId, crate::sync::CondvarId)> {
        let sync = self.sync.lock();
        let rw = sync.rwlocks.get(&id.0).ok_or(KernelError::NotFound)?;
        Ok((rw.mutex, rw.readers, rw.writers))
    }

    /// Acquire for reading; blocks while a writer holds or waits
    pub fn rwlock_read_lock(&self, id: RwLockId) -> Result<()> {
        let (mutex, readers, _) = self.rwlock_parts(id)?;
        self.mutex_lock(mutex)?;
        loop {
            let blocked = {
                let mut sync = self.sync.lock();
                let rw = sync.rwlocks.get(&id.0).ok_or(KernelError::NotFound)?;
                let blocked = rw.writer_owner.is_some() || rw.waiting_writers > 0;
                if blocked {
                    sync.stats.rwlock_contentions += 1;
                }
                blocked
            };
            if !blocked {
                break;
            }
            self.cond_wait(readers, mutex)?;
        }
        {
            let mut sync = self.sync.lock();
            if let Some(rw) = sync.rwlocks.get_mut(&id.0) {
                rw.reader_count += 1;
            }
        }
        self.mutex_unlock(mutex)
    }

    /// Acquire for reading without blocking
    pub fn rwlock_read_trylock(&self, id: RwLockId) -> Result<()> {
        let (mutex, _, _) = self.rwlock_parts(id)?;
        self.mutex_trylock(mutex)?;
        let acquired = {
            let mut sync = self.sync.lock();
            let rw = sync.rwlocks.get_mut(&id.0).ok_or(KernelError::NotFound)?;
            if rw.writer_owner.is_none() && rw.waiting_writers == 0 {
                rw.reader_count += 1;
                true
            } else {
                false
            }
        };
        self.mutex_unlock(mutex)?;
        if acquired {
            Ok(())
        } else {
            Err(KernelError::WouldBlock)
        }
    }

    /// Release a read hold; the last reader out signals one writer
    pub fn rwlock_read_unlock(&self, id: RwLockId) -> Result<()> {
        let (mutex, _, writers) = self.rwlock_parts(id)?;
        self.mutex_lock(mutex)?;
        let last_reader = {
            let mut sync = self.sync.lock();
            let rw = sync.rwlocks.get_mut(&id.0).ok_or(KernelError::NotFound)?;
            if rw.reader_count == 0 {
                log::warn!("rwlock '{}': read unlock without readers", rw.name.as_str());
                drop(sync);
                self.mutex_unlock(mutex)?;
                return Err(KernelError::InvalidState);
            }
            rw.reader_count -= 1;
            rw.reader_count == 0
        };
        if last_reader {
            self.cond_signal(writers)?;
        }
        self.mutex_unlock(mutex)
    }

    /// Acquire for writing; blocks while readers or a writer are inside
    pub fn rwlock_write_lock(&self, id: RwLockId) -> Result<()> {
        let (mutex, _, writers) = self.rwlock_parts(id)?;
        let cur = self.current_task().ok_or(KernelError::InvalidState)?;
        self.mutex_lock(mutex)?;
        {
            let mut sync = self.sync.lock();
            if let Some(rw) = sync.rwlocks.get_mut(&id.0) {
                rw.waiting_writers += 1;
            }
        }
        loop {
            let blocked = {
                let mut sync = self.sync.lock();
                let rw = sync.rwlocks.get_mut(&id.0).ok_or(KernelError::NotFound)?;
                let blocked = rw.reader_count > 0 || rw.writer_owner.is_some();
                if blocked {
                    sync.stats.rwlock_contentions += 1;
                }
                blocked
            };
            if !blocked {
                break;
            }
            if let Err(e) = self.cond_wait(writers, mutex) {
                // Leave the gate consistent for the surviving tasks.
                let mut sync = self.sync.lock();
                if let Some(rw) = sync.rwlocks.get_mut(&id.0) {
                    rw.waiting_writers -= 1;
                }
                return Err(e);
            }
        }
        {
            let mut sync = self.sync.lock();
            if let Some(rw) = sync.rwlocks.get_mut(&id.0) {
                rw.waiting_writers -= 1;
                rw.writer_owner = Some(cur);
            }
        }
        self.mutex_unlock(mutex)
    }

    /// Acquire for writing without blocking
    pub fn rwlock_write_trylock(&self, id: RwLockId) -> Result<()> {
        let (mutex, _, _) = self.rwlock_parts(id)?;
        let cur = self.current_task().ok_or(KernelError::InvalidState)?;
        self.mutex_trylock(mutex)?;
        let acquired = {
            let mut sync = self.sync.lock();
            let rw = sync.rwlocks.get_mut(&id.0).ok_or(KernelError::NotFound)?;
            if rw.reader_count == 0 && rw.writer_owner.is_none() {
                rw.writer_owner = Some(cur);
                true
            } else {
                false
            }
        };
        self.mutex_unlock(mutex)?;
        if acquired {
            Ok(())
        } else {
            Err(KernelError::WouldBlock)
        }
    }

    /// Release a write hold
    ///
    /// Prefers a waiting writer; otherwise every parked reader is let in.
    pub fn rwlock_write_unlock(&self, id: RwLockId) -> Result<()> {
        let (mutex, readers, writers) = self.rwlock_parts(id)?;
        let cur = self.current_task().ok_or(KernelError::InvalidState)?;
        self.mutex_lock(mutex)?;
        let writer_waiting = {
            let mut sync = self.sync.lock();
            let rw = sync.rwlocks.get_mut(&id.0).ok_or(KernelError::NotFound)?;
            if rw.writer_owner != Some(cur) {
                log::warn!(
                    "rwlock '{}': write unlock by {} which is not the writer",
                    rw.name.as_str(),
                    cur
                );
                drop(sync);
                self.mutex_unlock(mutex)?;
                return Err(KernelError::InvalidState);
            }
            rw.writer_owner = None;
            rw.waiting_writers > 0
        };
        if writer_waiting {
            self.cond_signal(writers)?;
        } else {
            self.cond_broadcast(readers)?;
        }
        self.mutex_unlock(mutex)
    }

    /// Destroy a reader/writer lock; fails while held or waited on
    pub fn rwlock_destroy(&self, id: RwLockId) -> Result<()> {
        let (mutex, readers, writers) = {
            let sync = self.sync.lock();
            let rw = sync.rwlocks.get(&id.0).ok_or(KernelError::NotFound)?;
            if rw.reader_count > 0 || rw.writer_owner.is_some() || rw.waiting_writers > 0 {
                log::warn!("rwlock '{}': destroy while busy", rw.name.as_str());
                return Err(KernelError::InvalidState);
            }
            (rw.mutex, rw.readers, rw.writers)
        };
        self.cond_destroy(readers)?;
        self.cond_destroy(writers)?;
        self.mutex_destroy(mutex)?;
        self.sync.lock().rwlocks.remove(&id.0);
        Ok(())
    }
}
