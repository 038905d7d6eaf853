/*
 * Shared Memory Segments
 *
 * Key-indexed, ref-counted segments backed by physically contiguous
 * pages from the page service. Attach maps the segment at the next free
 * slot of the shared-memory window and bumps the refcount; delete is
 * only legal once every attachment is gone.
 */

use core::fmt;

use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::platform::{pages_for, Protection, PAGE_SIZE};
use crate::sync::{sync_id, MutexId};

sync_id!(
    /// Handle of a shared memory segment
    ShmId,
    "Shm"
);

/// Base of the virtual window attachments are mapped into
pub(crate) const SHM_WINDOW_BASE: u64 = 0x5000_0000;

pub(crate) struct ShmSegment {
    pub key: u32,
    /// Page-rounded size in bytes
    pub size: usize,
    pub pages: usize,
    pub phys_base: u64,
    pub ref_count: u32,
    pub lock: MutexId,
}

impl Kernel {
    /// Create a segment of at least `size` bytes under `key`
    pub fn shm_create(&self, key: u32, size: usize) -> Result<ShmId> {
        if size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        {
            let ipc = self.ipc.lock();
            if ipc.shms.values().any(|s| s.key == key) {
                return Err(KernelError::AlreadyExists);
            }
        }
        let pages = pages_for(size);
        let phys_base = self.mm_alloc_pages(pages)?;
        let lock = self.mutex_create("shm")?;

        let mut ipc = self.ipc.lock();
        let id = ipc.alloc_id()?;
        ipc.shms.insert(
            id,
            ShmSegment {
                key,
                size: pages * PAGE_SIZE,
                pages,
                phys_base,
                ref_count: 0,
                lock,
            },
        );
        ipc.stats.shm_segments += 1;
        log::debug!(
            "created shm segment key={} as Shm({}) ({} pages)",
            key,
            id,
            pages
        );
        Ok(ShmId(id))
    }

    /// Look up the segment created under `key`
    pub fn shm_open(&self, key: u32) -> Result<ShmId> {
        self.ipc
            .lock()
            .shms
            .iter()
            .find(|(_, s)| s.key == key)
            .map(|(&id, _)| ShmId(id))
            .ok_or(KernelError::NotFound)
    }

    /// Map the segment into the shared window
    ///
    /// # Returns
    /// The virtual address of the new attachment.
    pub fn shm_attach(&self, id: ShmId) -> Result<u64> {
        let (lock, pages, phys_base, span) = {
            let ipc = self.ipc.lock();
            let seg = ipc.shms.get(&id.0).ok_or(KernelError::NotFound)?;
            (seg.lock, seg.pages, seg.phys_base, seg.size as u64)
        };

        self.mutex_lock(lock)?;
        let vaddr = {
            let mut ipc = self.ipc.lock();
            let vaddr = ipc.shm_window;
            ipc.shm_window += span;
            vaddr
        };

        let prot = Protection::READ | Protection::WRITE | Protection::SHARED;
        for page in 0..pages {
            let offset = (page * PAGE_SIZE) as u64;
            if let Err(e) = self
                .platform
                .map_page(vaddr + offset, phys_base + offset, prot)
            {
                for undo in 0..page {
                    self.platform.unmap_page(vaddr + (undo * PAGE_SIZE) as u64);
                }
                self.mutex_unlock(lock)?;
                return Err(e);
            }
        }

        {
            let mut ipc = self.ipc.lock();
            ipc.shm_attachments.insert(vaddr, id.0);
            ipc.stats.shm_attaches += 1;
            if let Some(seg) = ipc.shms.get_mut(&id.0) {
                seg.ref_count += 1;
            }
        }
        self.mutex_unlock(lock)?;
        log::debug!("attached Shm({}) at 0x{:x}", id.0, vaddr);
        Ok(vaddr)
    }

    /// Tear down the attachment at `addr`
    pub fn shm_detach(&self, addr: u64) -> Result<()> {
        let (id, lock, pages) = {
            let ipc = self.ipc.lock();
            let id = *ipc.shm_attachments.get(&addr).ok_or(KernelError::NotFound)?;
            let seg = ipc.shms.get(&id).ok_or(KernelError::NotFound)?;
            (id, seg.lock, seg.pages)
        };

        self.mutex_lock(lock)?;
        for page in 0..pages {
            self.platform.unmap_page(addr + (page * PAGE_SIZE) as u64);
        }
        {
            let mut ipc = self.ipc.lock();
            ipc.shm_attachments.remove(&addr);
            if let Some(seg) = ipc.shms.get_mut(&id) {
                seg.ref_count = seg.ref_count.saturating_sub(1);
            }
        }
        self.mutex_unlock(lock)
    }

    /// Current attachment count
    pub fn shm_ref_count(&self, id: ShmId) -> Result<u32> {
        self.ipc
            .lock()
            .shms
            .get(&id.0)
            .map(|s| s.ref_count)
            .ok_or(KernelError::NotFound)
    }

    /// Destroy a segment; legal only with no attachments
    pub fn shm_delete(&self, id: ShmId) -> Result<()> {
        let (lock, phys_base, pages) = {
            let ipc = self.ipc.lock();
            let seg = ipc.shms.get(&id.0).ok_or(KernelError::NotFound)?;
            if seg.ref_count > 0 {
                log::warn!("shm Shm({}): delete with {} attachments", id.0, seg.ref_count);
                return Err(KernelError::InvalidState);
            }
            (seg.lock, seg.phys_base, seg.pages)
        };
        self.mutex_destroy(lock)?;
        self.mm_free_pages(phys_base, pages);
        let mut ipc = self.ipc.lock();
        ipc.shms.remove(&id.0);
        ipc.stats.shm_segments -= 1;
        Ok(())
    }
}
