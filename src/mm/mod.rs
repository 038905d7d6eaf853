/*
 * Memory Management
 *
 * Two layers. The frame table (frame.rs) backs demand-paged virtual
 * pages with a pluggable replacement algorithm; the heap (heap.rs)
 * serves byte-granular allocations out of whole pages. This module owns
 * the virtual side: VM areas with protection flags, the page-fault
 * handler and the mapping bookkeeping, plus the raw page service the
 * heap and shared memory grow from.
 *
 * Fault flow: locate the covering area, check permissions against the
 * access kind (a violation terminates the task), claim a frame (maybe
 * evicting), install the mapping and pull the page image back from swap
 * when it was evicted earlier.
 */

pub mod frame;
pub mod heap;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::platform::{AccessKind, Protection, SwapHandle, PAGE_SIZE};

use frame::{FrameStats, FrameTable, ReplacementAlgorithm};

/// Base of the window handed out when `mm_map` is called without an
/// address
const MAP_WINDOW_BASE: u64 = 0x4000_0000;

/// A contiguous virtual region with uniform protection
#[derive(Debug, Clone, Copy)]
pub struct VmArea {
    pub start: u64,
    /// Exclusive end
    pub end: u64,
    pub prot: Protection,
}

impl VmArea {
    fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

pub(crate) struct MemoryManager {
    pub frames: FrameTable,
    areas: Vec<VmArea>,
    /// Resident pages: page vaddr -> frame index
    mappings: BTreeMap<u64, usize>,
    /// Evicted pages awaiting swap-in: page vaddr -> handle
    swapped: BTreeMap<u64, SwapHandle>,
    next_map_addr: u64,
    /// Pages handed out by the raw page service
    pub pages_allocated: u64,
    pub pages_freed: u64,
}

impl MemoryManager {
    pub fn new(config: &crate::kernel::KernelConfig) -> Self {
        Self {
            frames: FrameTable::new(config.frame_count, config.replacement),
            areas: Vec::new(),
            mappings: BTreeMap::new(),
            swapped: BTreeMap::new(),
            next_map_addr: MAP_WINDOW_BASE,
            pages_allocated: 0,
            pages_freed: 0,
        }
    }

    fn area_covering(&self, addr: u64) -> Option<&VmArea> {
        self.areas.iter().find(|a| a.contains(addr))
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.areas.iter().any(|a| start < a.end && a.start < end)
    }
}

impl Kernel {
    /// Create an anonymous demand-paged area
    ///
    /// # Arguments
    /// * `addr` - Fixed page-aligned start, or 0 to let the kernel pick
    /// * `len` - Bytes; rounded up to whole pages
    /// * `prot` - Access permissions
    ///
    /// # Returns
    /// The area's start address. No frames are committed until the
    /// first fault.
    pub fn mm_map(&self, addr: u64, len: usize, prot: Protection) -> Result<u64> {
        if len == 0 || addr % PAGE_SIZE as u64 != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let len = crate::platform::page_align_up(len) as u64;
        let mut mm = self.mm.lock();
        let start = if addr == 0 {
            let start = mm.next_map_addr;
            mm.next_map_addr += len;
            start
        } else {
            addr
        };
        if mm.overlaps(start, start + len) {
            return Err(KernelError::AlreadyExists);
        }
        mm.areas.push(VmArea {
            start,
            end: start + len,
            prot,
        });
        log::debug!(
            "mm: mapped area 0x{:x}-0x{:x} ({:?})",
            start,
            start + len,
            prot
        );
        Ok(start)
    }

    /// Tear down the area starting at `addr`
    pub fn mm_unmap(&self, addr: u64, len: usize) -> Result<()> {
        let len = crate::platform::page_align_up(len) as u64;
        let mut mm = self.mm.lock();
        let index = mm
            .areas
            .iter()
            .position(|a| a.start == addr && a.end == addr + len)
            .ok_or(KernelError::NotFound)?;
        let area = mm.areas.remove(index);

        let resident: Vec<u64> = mm
            .mappings
            .range(area.start..area.end)
            .map(|(&vaddr, _)| vaddr)
            .collect();
        for vaddr in resident {
            self.platform.unmap_page(vaddr);
            let _ = mm.frames.free(vaddr);
            mm.mappings.remove(&vaddr);
        }
        let stale: Vec<u64> = mm
            .swapped
            .range(area.start..area.end)
            .map(|(&vaddr, _)| vaddr)
            .collect();
        for vaddr in stale {
            mm.swapped.remove(&vaddr);
        }
        Ok(())
    }

    /// Change protection over `[addr, addr+len)`
    ///
    /// The range must sit inside one area; its flags are rewritten and
    /// resident mappings in the range are updated in place.
    pub fn mm_protect(&self, addr: u64, len: usize, prot: Protection) -> Result<()> {
        if len == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let start = addr & !(PAGE_SIZE as u64 - 1);
        let end = crate::platform::page_align_up(addr as usize + len) as u64;
        let mut mm = self.mm.lock();
        let area = mm
            .areas
            .iter_mut()
            .find(|a| start >= a.start && end <= a.end)
            .ok_or(KernelError::AccessDenied)?;
        area.prot = prot;

        let resident: Vec<u64> = mm
            .mappings
            .range(start..end)
            .map(|(&vaddr, _)| vaddr)
            .collect();
        for vaddr in resident {
            self.platform.update_protection(vaddr, prot);
        }
        log::debug!("mm: protection of 0x{:x}-0x{:x} now {:?}", start, end, prot);
        Ok(())
    }

    /// Page-fault entry, registered with the platform
    ///
    /// A fault outside any area or against the area's permissions
    /// terminates the faulting task; otherwise the page is
    /// demand-allocated and mapped with the area's protection.
    pub fn handle_page_fault(&self, addr: u64, kind: AccessKind) -> Result<()> {
        let page = addr & !(PAGE_SIZE as u64 - 1);

        let violation = {
            let mm = self.mm.lock();
            match mm.area_covering(addr) {
                None => true,
                Some(area) => !area.prot.contains(kind.required()),
            }
        };
        if violation {
            log::error!("page fault: illegal {:?} at 0x{:x}", kind, addr);
            if self.current_task().is_some() {
                // Protection violation is fatal to the task.
                self.task_exit();
            }
            return Err(KernelError::AccessDenied);
        }

        let mut mm = self.mm.lock();
        if mm.mappings.contains_key(&page) {
            // Already resident; record the touch and move on.
            mm.frames.access(page, kind == AccessKind::Write);
            return Ok(());
        }

        let prot = mm.area_covering(addr).map(|a| a.prot).unwrap_or(Protection::READ);
        let owner = self.current_task();
        let (index, eviction) = mm.frames.allocate(page, owner, &*self.platform)?;
        if let Some(eviction) = eviction {
            mm.mappings.remove(&eviction.old_vaddr);
            if let Some(handle) = eviction.swapped {
                mm.swapped.insert(eviction.old_vaddr, handle);
            }
        }

        let phys = mm.frames.frame(index).phys;
        self.platform.map_page(page, phys, prot)?;
        if let Some(handle) = mm.swapped.remove(&page) {
            self.platform.swap_in(handle, page)?;
        }
        mm.mappings.insert(page, index);
        if kind == AccessKind::Write {
            mm.frames.access(page, true);
        }
        Ok(())
    }

    /// Record an access to a resident page for the replacement
    /// bookkeeping
    pub fn mm_touch(&self, addr: u64, write: bool) -> bool {
        let page = addr & !(PAGE_SIZE as u64 - 1);
        self.mm.lock().frames.access(page, write)
    }

    /// Raw page service: `n` contiguous pages from the platform
    pub fn mm_alloc_pages(&self, n: usize) -> Result<u64> {
        if n == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let base = self.platform.allocate_physical_pages(n)?;
        self.mm.lock().pages_allocated += n as u64;
        Ok(base)
    }

    /// Return pages to the platform
    pub fn mm_free_pages(&self, base: u64, n: usize) {
        self.platform.free_physical_pages(base, n);
        self.mm.lock().pages_freed += n as u64;
    }

    /// Paging statistics snapshot
    pub fn frame_stats(&self) -> FrameStats {
        self.mm.lock().frames.stats
    }

    pub fn reset_frame_stats(&self) {
        self.mm.lock().frames.stats = FrameStats::default();
    }

    /// Free frames currently available
    pub fn free_frame_count(&self) -> usize {
        self.mm.lock().frames.free_frames()
    }

    /// The configured replacement algorithm's aging hook; driven by the
    /// timer
    pub(crate) fn replacement_sample(&self) {
        self.mm.lock().frames.nfu_sample();
    }

    /// Snapshot of the VM areas, in creation order
    pub fn vm_areas(&self) -> Vec<VmArea> {
        self.mm.lock().areas.clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::platform::{
        Context, EntryFn, ExitFn, Platform, PlatformCallbacks, StackRegion,
    };
    use core::sync::atomic::{AtomicU64, Ordering};

    /// Minimal platform for memory unit tests: leaks host memory for
    /// pages, mints swap handles, ignores the MMU
    pub struct PagePool {
        next_swap: AtomicU64,
    }

    impl PagePool {
        pub fn new() -> Self {
            Self {
                next_swap: AtomicU64::new(1),
            }
        }
    }

    impl Platform for PagePool {
        fn now_ticks(&self) -> u64 {
            0
        }
        fn disable_interrupts(&self) -> bool {
            true
        }
        fn restore_interrupts(&self, _prior: bool) {}
        fn context_init(&self, _stack: StackRegion, _entry: EntryFn, _exit: ExitFn) -> Context {
            Context(0)
        }
        fn boot_context(&self) -> Context {
            Context(0)
        }
        fn context_switch(&self, _prev: Context, _next: Context) {}
        fn context_release(&self, _ctx: Context) {}
        fn map_page(&self, _virt: u64, _phys: u64, _prot: Protection) -> Result<()> {
            Ok(())
        }
        fn unmap_page(&self, _virt: u64) {}
        fn update_protection(&self, _virt: u64, _prot: Protection) {}
        fn swap_out(&self, _virt: u64) -> Result<SwapHandle> {
            Ok(SwapHandle(self.next_swap.fetch_add(1, Ordering::SeqCst)))
        }
        fn swap_in(&self, _handle: SwapHandle, _virt: u64) -> Result<()> {
            Ok(())
        }
        fn allocate_physical_pages(&self, n: usize) -> Result<u64> {
            let bytes = vec![0u8; n * PAGE_SIZE].into_boxed_slice();
            Ok(Box::leak(bytes).as_mut_ptr() as u64)
        }
        fn free_physical_pages(&self, _base: u64, _n: usize) {}
        fn wait_for_interrupt(&self) {}
        fn register_callbacks(&self, _callbacks: PlatformCallbacks) {}
    }
}
