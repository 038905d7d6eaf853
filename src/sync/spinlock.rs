/*
 * Spinlock
 *
 * For very short critical sections at interrupt priority: acquisition
 * disables interrupts and busy-waits, never blocks. Code holding a
 * spinlock must not invoke any blocking primitive.
 */

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use alloc::sync::Arc;

use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::sync::{sync_id, KSpinlock};
use crate::task::make_name;

sync_id!(
    /// Handle of a spinlock
    SpinlockId,
    "Spinlock"
);

impl Kernel {
    /// Create a spinlock
    pub fn spin_create(&self, name: &str) -> Result<SpinlockId> {
        let mut sync = self.sync.lock();
        let id = sync.alloc_id()?;
        sync.spinlocks.insert(
            id,
            Arc::new(KSpinlock {
                locked: AtomicBool::new(false),
                saved_irq: AtomicBool::new(false),
                name: make_name(name),
            }),
        );
        log::debug!("created spinlock '{}' as Spinlock({})", name, id);
        Ok(SpinlockId(id))
    }

    fn spinlock(&self, id: SpinlockId) -> Result<Arc<KSpinlock>> {
        self.sync
            .lock()
            .spinlocks
            .get(&id.0)
            .cloned()
            .ok_or(KernelError::NotFound)
    }

    /// Acquire, spinning with interrupts disabled
    pub fn spin_lock(&self, id: SpinlockId) -> Result<()> {
        let lock = self.spinlock(id)?;
        let prior = self.platform.disable_interrupts();
        let mut contended = false;
        while lock
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            if !contended {
                contended = true;
                self.sync.lock().stats.spin_contentions += 1;
            }
            core::hint::spin_loop();
        }
        lock.saved_irq.store(prior, Ordering::Relaxed);
        Ok(())
    }

    /// Acquire without spinning
    pub fn spin_trylock(&self, id: SpinlockId) -> Result<()> {
        let lock = self.spinlock(id)?;
        let prior = self.platform.disable_interrupts();
        if lock
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            lock.saved_irq.store(prior, Ordering::Relaxed);
            Ok(())
        } else {
            self.platform.restore_interrupts(prior);
            Err(KernelError::WouldBlock)
        }
    }

    /// Release and restore the interrupt state saved at acquisition
    pub fn spin_unlock(&self, id: SpinlockId) -> Result<()> {
        let lock = self.spinlock(id)?;
        if !lock.locked.load(Ordering::Relaxed) {
            log::warn!("spinlock '{}': unlock while not held", lock.name.as_str());
            return Err(KernelError::InvalidState);
        }
        let prior = lock.saved_irq.load(Ordering::Relaxed);
        lock.locked.store(false, Ordering::Release);
        self.platform.restore_interrupts(prior);
        Ok(())
    }

    /// Destroy a spinlock; fails while held
    pub fn spin_destroy(&self, id: SpinlockId) -> Result<()> {
        let mut sync = self.sync.lock();
        let lock = sync.spinlocks.get(&id.0).ok_or(KernelError::NotFound)?;
        if lock.locked.load(Ordering::Relaxed) {
            log::warn!("spinlock '{}': destroy while held", lock.name.as_str());
            return Err(KernelError::InvalidState);
        }
        sync.spinlocks.remove(&id.0);
        Ok(())
    }
}
