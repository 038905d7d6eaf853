/*
 * Frame Table and Page Replacement
 *
 * A fixed array of frames indexed by frame number; a free frame has
 * vaddr == 0. Allocation claims a free frame when one exists, otherwise
 * a victim is chosen by the configured algorithm, written to swap if
 * dirty, unmapped and reassigned.
 *
 * Victim selection:
 *   FIFO  - insertion-order queue, head goes first
 *   Clock - one global hand; a set accessed bit buys one more lap
 *   LRU   - smallest last-touch stamp; never-touched frames stamp 0
 *   NFU   - aging register, shifted right each sampling tick with the
 *           accessed bit ORed into the top
 *
 * Each frame binds its physical page lazily on first use and keeps it
 * for the table's lifetime; eviction recycles the physical page for the
 * new virtual owner.
 */

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::error::{KernelError, Result};
use crate::platform::{Platform, SwapHandle};
use crate::task::TaskId;

/// Victim selection algorithm, chosen at kernel construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementAlgorithm {
    Fifo,
    Clock,
    Lru,
    Nfu,
}

/// Paging statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStats {
    /// Demand allocations that missed
    pub page_faults: u64,
    /// Frame assignments (first-time and replacement)
    pub page_ins: u64,
    /// Dirty victims written to swap
    pub page_outs: u64,
    /// Evictions
    pub replaced_pages: u64,
}

/// One physical page container
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    /// Virtual page this frame backs; 0 means free
    pub vaddr: u64,
    /// Physical page bound to this frame; 0 until first use
    pub phys: u64,
    pub accessed: bool,
    pub dirty: bool,
    /// LRU last-touch stamp or NFU aging register
    pub reference: u64,
    pub owner: Option<TaskId>,
}

impl Frame {
    const FREE: Frame = Frame {
        vaddr: 0,
        phys: 0,
        accessed: false,
        dirty: false,
        reference: 0,
        owner: None,
    };
}

/// What `allocate` displaced, if anything
pub(crate) struct Eviction {
    pub old_vaddr: u64,
    pub swapped: Option<SwapHandle>,
}

pub(crate) struct FrameTable {
    frames: Vec<Frame>,
    algorithm: ReplacementAlgorithm,
    /// Insertion order of occupied frames, for FIFO
    fifo: VecDeque<usize>,
    clock_hand: usize,
    /// Monotonic stamp source for LRU
    access_clock: u64,
    pub stats: FrameStats,
}

impl FrameTable {
    pub fn new(frame_count: usize, algorithm: ReplacementAlgorithm) -> Self {
        let mut frames = Vec::with_capacity(frame_count);
        frames.resize(frame_count, Frame::FREE);
        Self {
            frames,
            algorithm,
            fifo: VecDeque::new(),
            clock_hand: 0,
            access_clock: 0,
            stats: FrameStats::default(),
        }
    }

    pub fn frame(&self, index: usize) -> &Frame {
        &self.frames[index]
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn free_frames(&self) -> usize {
        self.frames.iter().filter(|f| f.vaddr == 0).count()
    }

    /// Index of the frame backing `vaddr`, if resident
    pub fn find(&self, vaddr: u64) -> Option<usize> {
        self.frames.iter().position(|f| f.vaddr == vaddr && vaddr != 0)
    }

    /// Record an access for the replacement bookkeeping
    pub fn access(&mut self, vaddr: u64, write: bool) -> bool {
        let Some(index) = self.find(vaddr) else {
            return false;
        };
        let frame = &mut self.frames[index];
        frame.accessed = true;
        if write {
            frame.dirty = true;
        }
        if self.algorithm == ReplacementAlgorithm::Lru {
            self.access_clock += 1;
            frame.reference = self.access_clock;
        }
        true
    }

    /// NFU aging pass: shift every register right and fold in the
    /// accessed bit at the top, then clear accessed
    pub fn nfu_sample(&mut self) {
        for frame in &mut self.frames {
            if frame.vaddr == 0 {
                continue;
            }
            frame.reference = (frame.reference >> 1) | ((frame.accessed as u64) << 63);
            frame.accessed = false;
        }
    }

    fn select_victim(&mut self) -> Option<usize> {
        match self.algorithm {
            ReplacementAlgorithm::Fifo => self.fifo.pop_front(),
            ReplacementAlgorithm::Clock => {
                let count = self.frames.len();
                // Two laps bound the scan: the first may clear every
                // accessed bit, the second must find a victim.
                for _ in 0..(2 * count + 1) {
                    let index = self.clock_hand;
                    self.clock_hand = (self.clock_hand + 1) % count;
                    let frame = &mut self.frames[index];
                    if frame.vaddr == 0 {
                        continue;
                    }
                    if frame.accessed {
                        frame.accessed = false;
                    } else {
                        return Some(index);
                    }
                }
                None
            }
            ReplacementAlgorithm::Lru | ReplacementAlgorithm::Nfu => self
                .frames
                .iter()
                .enumerate()
                .filter(|(_, f)| f.vaddr != 0)
                .min_by_key(|(_, f)| f.reference)
                .map(|(index, _)| index),
        }
    }

    /// Claim a frame for `vaddr`, evicting under pressure
    ///
    /// # Returns
    /// The frame index and the eviction performed, if any
    pub fn allocate(
        &mut self,
        vaddr: u64,
        owner: Option<TaskId>,
        platform: &dyn Platform,
    ) -> Result<(usize, Option<Eviction>)> {
        if vaddr == 0 {
            return Err(KernelError::InvalidArgument);
        }
        self.stats.page_faults += 1;

        if let Some(index) = self.frames.iter().position(|f| f.vaddr == 0) {
            let phys = if self.frames[index].phys == 0 {
                platform.allocate_physical_pages(1)?
            } else {
                self.frames[index].phys
            };
            let frame = &mut self.frames[index];
            frame.vaddr = vaddr;
            frame.phys = phys;
            frame.accessed = true;
            frame.dirty = false;
            frame.reference = 0;
            frame.owner = owner;
            self.fifo.push_back(index);
            self.stats.page_ins += 1;
            return Ok((index, None));
        }

        // No free frame: replace.
        let index = self.select_victim().ok_or(KernelError::OutOfMemory)?;
        self.fifo.retain(|&i| i != index);

        let (old_vaddr, was_dirty) = {
            let frame = &self.frames[index];
            (frame.vaddr, frame.dirty)
        };
        let swapped = if was_dirty {
            // A failed swap-out aborts the allocation; the victim keeps
            // its frame.
            let handle = platform.swap_out(old_vaddr).map_err(|e| {
                self.fifo.push_back(index);
                e
            })?;
            self.stats.page_outs += 1;
            Some(handle)
        } else {
            None
        };
        platform.unmap_page(old_vaddr);

        let frame = &mut self.frames[index];
        frame.vaddr = vaddr;
        frame.accessed = true;
        frame.dirty = false;
        frame.reference = 0;
        frame.owner = owner;
        self.fifo.push_back(index);
        self.stats.replaced_pages += 1;
        self.stats.page_ins += 1;

        log::debug!(
            "frame {}: replaced page 0x{:x} with 0x{:x}",
            index,
            old_vaddr,
            vaddr
        );
        Ok((index, Some(Eviction { old_vaddr, swapped })))
    }

    /// Return the frame backing `vaddr` to the free pool
    pub fn free(&mut self, vaddr: u64) -> Result<usize> {
        let index = self.find(vaddr).ok_or(KernelError::NotFound)?;
        let frame = &mut self.frames[index];
        frame.vaddr = 0;
        frame.accessed = false;
        frame.dirty = false;
        frame.reference = 0;
        frame.owner = None;
        self.fifo.retain(|&i| i != index);
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::tests::PagePool;

    fn table(count: usize, algorithm: ReplacementAlgorithm) -> (FrameTable, PagePool) {
        (FrameTable::new(count, algorithm), PagePool::new())
    }

    /// Access pattern driver: allocate on miss, touch on hit
    fn reference(table: &mut FrameTable, pool: &PagePool, page: u64) -> Option<u64> {
        let vaddr = page * 0x1000;
        if table.access(vaddr, false) {
            return None;
        }
        let (_, eviction) = table.allocate(vaddr, None, pool).unwrap();
        eviction.map(|e| e.old_vaddr / 0x1000)
    }

    #[test]
    fn allocated_plus_free_is_invariant() {
        let (mut table, pool) = table(4, ReplacementAlgorithm::Fifo);
        for page in 1..=3u64 {
            reference(&mut table, &pool, page);
        }
        assert_eq!(table.free_frames(), 1);
        table.free(0x1000).unwrap();
        assert_eq!(table.free_frames(), 2);
        assert_eq!(table.frame_count(), 4);
    }

    #[test]
    fn fifo_evicts_in_insertion_order() {
        let (mut table, pool) = table(3, ReplacementAlgorithm::Fifo);
        for page in [1u64, 2, 3] {
            assert_eq!(reference(&mut table, &pool, page), None);
        }
        assert_eq!(reference(&mut table, &pool, 4), Some(1));
        assert_eq!(reference(&mut table, &pool, 5), Some(2));
    }

    #[test]
    fn clock_gives_accessed_frames_a_second_chance() {
        let (mut table, pool) = table(3, ReplacementAlgorithm::Clock);
        for page in [1u64, 2, 3] {
            reference(&mut table, &pool, page);
        }
        // Everyone has accessed=1 from allocation; the first lap clears
        // page 1's bit and the victim is still page 1 on lap two.
        assert_eq!(reference(&mut table, &pool, 4), Some(1));
        // Page 2 was cleared on that scan; keep 2 hot and 3 is next out.
        table.access(2 * 0x1000, false);
        assert_eq!(reference(&mut table, &pool, 5), Some(3));
    }

    #[test]
    fn lru_evicts_least_recently_touched() {
        let (mut table, pool) = table(5, ReplacementAlgorithm::Lru);
        for page in [1u64, 2, 3, 4, 5] {
            reference(&mut table, &pool, page);
        }
        reference(&mut table, &pool, 1);
        reference(&mut table, &pool, 2);
        // Among 3, 4, 5 nothing was touched since allocation; the
        // lowest-indexed untouched frame goes first.
        assert_eq!(reference(&mut table, &pool, 6), Some(3));
        assert_eq!(table.stats.page_faults, 6);
        assert_eq!(table.stats.replaced_pages, 1);
    }

    #[test]
    fn nfu_aging_prefers_cold_frames() {
        let (mut table, pool) = table(2, ReplacementAlgorithm::Nfu);
        reference(&mut table, &pool, 1);
        reference(&mut table, &pool, 2);
        // Touch page 1 across two sampling windows, page 2 never.
        table.access(0x1000, false);
        table.nfu_sample();
        table.access(0x1000, false);
        table.nfu_sample();
        assert_eq!(reference(&mut table, &pool, 3), Some(2));
    }

    #[test]
    fn dirty_victims_are_swapped_out() {
        let (mut table, pool) = table(1, ReplacementAlgorithm::Fifo);
        reference(&mut table, &pool, 1);
        table.access(0x1000, true);
        let (_, eviction) = table.allocate(0x2000, None, &pool).unwrap();
        let eviction = eviction.unwrap();
        assert_eq!(eviction.old_vaddr, 0x1000);
        assert!(eviction.swapped.is_some());
        assert_eq!(table.stats.page_outs, 1);
    }
}
