/*
 * Platform Abstraction
 *
 * The kernel core is architecture-neutral. Everything that touches real
 * hardware - the timer, the interrupt controller, the MMU, the context
 * switch and the swap device - is supplied by the host through this
 * trait.
 *
 * Contexts are opaque: the platform hands out stable `Context` tokens
 * from `context_init` and the kernel only ever passes them back to
 * `context_switch`. The kernel never looks inside a context.
 *
 * The platform delivers two events back into the core through the
 * callbacks registered at kernel construction: the periodic timer tick
 * and page faults. Both callbacks run in the interrupted task's context
 * and must not be re-entered.
 */

use alloc::boxed::Box;

use crate::error::Result;

bitflags::bitflags! {
    /// Access permissions for a virtual memory area or mapping
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        /// Region is readable
        const READ = 0x1;
        /// Region is writable
        const WRITE = 0x2;
        /// Region is executable
        const EXEC = 0x4;
        /// Region is shared between tasks
        const SHARED = 0x8;
    }
}

/// Kind of memory access that raised a page fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

impl AccessKind {
    /// The protection bit this access requires
    pub fn required(self) -> Protection {
        match self {
            AccessKind::Read => Protection::READ,
            AccessKind::Write => Protection::WRITE,
            AccessKind::Execute => Protection::EXEC,
        }
    }
}

/// Opaque execution context token
///
/// Minted by `Platform::context_init`; the platform owns the real
/// register blob behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context(pub u64);

/// Platform-opaque identifier for a page image stored on the swap device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapHandle(pub u64);

/// A task's stack memory, owned by the kernel heap
#[derive(Debug, Clone, Copy)]
pub struct StackRegion {
    /// Lowest address of the stack
    pub base: u64,
    /// Size in bytes
    pub size: usize,
}

/// Closure run when a context first executes
pub type EntryFn = Box<dyn FnOnce() + Send + 'static>;

/// Closure run if the entry function returns
pub type ExitFn = Box<dyn FnOnce() + Send + 'static>;

/// Callbacks the kernel registers into the platform at construction
pub struct PlatformCallbacks {
    /// Invoked once per timer interrupt, in the interrupted context
    pub tick: Box<dyn Fn() + Send + Sync>,
    /// Invoked on a page fault with the faulting address and access kind
    pub page_fault: Box<dyn Fn(u64, AccessKind) -> Result<()> + Send + Sync>,
}

/// Host services required by the kernel core
///
/// A real port backs this with the timer, interrupt controller, MMU and
/// swap device; the test suite backs it with threads and a manual clock.
pub trait Platform: Send + Sync {
    /// Monotonic tick counter (nominally 1 tick = 1 ms)
    fn now_ticks(&self) -> u64;

    /// Disable interrupts, returning the prior enable state
    fn disable_interrupts(&self) -> bool;

    /// Restore the interrupt enable state returned by `disable_interrupts`
    fn restore_interrupts(&self, prior: bool);

    /// Build an execution context over `stack` so that dispatching it
    /// runs `entry`, and a return from `entry` runs `exit`
    fn context_init(&self, stack: StackRegion, entry: EntryFn, exit: ExitFn) -> Context;

    /// The context of the caller that will later invoke `Kernel::start`
    fn boot_context(&self) -> Context;

    /// Save the current register state into `prev` and resume `next`
    ///
    /// Returns when `prev` is dispatched again.
    fn context_switch(&self, prev: Context, next: Context);

    /// Release a context that will never be dispatched again
    fn context_release(&self, ctx: Context);

    /// Install a mapping from a virtual page to a physical page
    fn map_page(&self, virt: u64, phys: u64, prot: Protection) -> Result<()>;

    /// Remove the mapping of a virtual page
    fn unmap_page(&self, virt: u64);

    /// Rewrite the permissions of an existing mapping
    fn update_protection(&self, virt: u64, prot: Protection);

    /// Write the page at `virt` to the swap device
    fn swap_out(&self, virt: u64) -> Result<SwapHandle>;

    /// Read a swapped page image back into the page at `virt`
    fn swap_in(&self, handle: SwapHandle, virt: u64) -> Result<()>;

    /// Allocate `n` contiguous physical pages, returning the base address
    fn allocate_physical_pages(&self, n: usize) -> Result<u64>;

    /// Return pages obtained from `allocate_physical_pages`
    fn free_physical_pages(&self, base: u64, n: usize);

    /// Park the CPU until the next interrupt; the idle task's body
    fn wait_for_interrupt(&self);

    /// Register the kernel's tick and page-fault callbacks
    fn register_callbacks(&self, callbacks: PlatformCallbacks);
}

/// Scoped interrupt gate
///
/// Disables interrupts on construction and restores the prior state on
/// drop, so every exit path of a kernel operation releases the gate.
pub(crate) struct IrqGuard<'a> {
    platform: &'a dyn Platform,
    prior: bool,
}

impl<'a> IrqGuard<'a> {
    pub fn new(platform: &'a dyn Platform) -> Self {
        let prior = platform.disable_interrupts();
        Self { platform, prior }
    }
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        self.platform.restore_interrupts(self.prior);
    }
}

/// Number of bytes in a page
pub const PAGE_SIZE: usize = 4096;

/// Round `n` up to the next page boundary
pub(crate) fn page_align_up(n: usize) -> usize {
    (n + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Number of whole pages covering `n` bytes
pub(crate) fn pages_for(n: usize) -> usize {
    page_align_up(n) / PAGE_SIZE
}
