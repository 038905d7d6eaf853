#![allow(dead_code)]

/*
 * Hosted Test Platform
 *
 * Realizes the Platform contract on a development host so the kernel's
 * end-to-end behavior can be exercised by `cargo test`:
 *
 *   - every Context token is a std thread parked behind a gate, and
 *     context_switch opens the target's gate before parking the
 *     caller's, so exactly one context runs at a time
 *   - the clock is a counter advanced explicitly by `tick()`, which
 *     also delivers the kernel's registered tick callback in the
 *     calling context (the "timer interrupt at a preemption point")
 *   - physical pages are leaked host allocations, so heap and shared
 *     memory operate on real writable memory
 *   - swap-outs mint opaque handles; mapping calls are counted
 *
 * Everything is deterministic: no sleeps, no races, wakeups are purely
 * state-driven.
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use ferrokern::{
    AccessKind, Context, Kernel, KernelConfig, Platform, PlatformCallbacks, Protection,
    StackRegion, SwapHandle, PAGE_SIZE,
};

/// A context's run gate: true = may run
struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            open: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    fn release(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_one();
    }

    fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cv.wait(open).unwrap();
        }
        *open = false;
    }
}

pub struct HostPlatform {
    clock: AtomicU64,
    irq_enabled: AtomicBool,
    next_context: AtomicU64,
    contexts: Mutex<HashMap<u64, Arc<Gate>>>,
    callbacks: Mutex<Option<Arc<PlatformCallbacks>>>,
    next_swap: AtomicU64,
    pub mapped_pages: AtomicU64,
    pub unmapped_pages: AtomicU64,
    pub swap_outs: AtomicU64,
    pub swap_ins: AtomicU64,
}

impl HostPlatform {
    pub fn new() -> Arc<Self> {
        let platform = Arc::new(Self {
            clock: AtomicU64::new(0),
            irq_enabled: AtomicBool::new(true),
            next_context: AtomicU64::new(1),
            contexts: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(None),
            next_swap: AtomicU64::new(1),
            mapped_pages: AtomicU64::new(0),
            unmapped_pages: AtomicU64::new(0),
            swap_outs: AtomicU64::new(0),
            swap_ins: AtomicU64::new(0),
        });
        // Context 0 is the boot context (whoever calls start()).
        platform
            .contexts
            .lock()
            .unwrap()
            .insert(0, Gate::new());
        platform
    }

    fn gate(&self, ctx: Context) -> Arc<Gate> {
        self.contexts
            .lock()
            .unwrap()
            .get(&ctx.0)
            .expect("unknown context")
            .clone()
    }

    /// Advance the clock one tick and deliver the timer interrupt in
    /// the calling context
    pub fn tick(&self) {
        self.clock.fetch_add(1, Ordering::SeqCst);
        let callbacks = self.callbacks.lock().unwrap().clone();
        if let Some(callbacks) = callbacks {
            (callbacks.tick)();
        }
    }

    /// Run `n` ticks back to back
    pub fn run_ticks(&self, n: u64) {
        for _ in 0..n {
            self.tick();
        }
    }

    /// Deliver a page fault as the platform would
    pub fn raise_page_fault(&self, addr: u64, kind: AccessKind) -> ferrokern::Result<()> {
        let callbacks = self.callbacks.lock().unwrap().clone();
        match callbacks {
            Some(callbacks) => (callbacks.page_fault)(addr, kind),
            None => Ok(()),
        }
    }
}

impl Platform for HostPlatform {
    fn now_ticks(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    fn disable_interrupts(&self) -> bool {
        self.irq_enabled.swap(false, Ordering::SeqCst)
    }

    fn restore_interrupts(&self, prior: bool) {
        self.irq_enabled.store(prior, Ordering::SeqCst)
    }

    fn context_init(
        &self,
        _stack: StackRegion,
        entry: ferrokern::platform::EntryFn,
        exit: ferrokern::platform::ExitFn,
    ) -> Context {
        let id = self.next_context.fetch_add(1, Ordering::SeqCst);
        let gate = Gate::new();
        self.contexts.lock().unwrap().insert(id, gate.clone());
        // The context's thread: parked until first dispatched, then the
        // task body, then the kernel's exit trampoline.
        thread::spawn(move || {
            gate.wait();
            entry();
            exit();
        });
        Context(id)
    }

    fn boot_context(&self) -> Context {
        Context(0)
    }

    fn context_switch(&self, prev: Context, next: Context) {
        let next_gate = self.gate(next);
        let prev_gate = self.gate(prev);
        next_gate.release();
        prev_gate.wait();
    }

    fn context_release(&self, ctx: Context) {
        self.contexts.lock().unwrap().remove(&ctx.0);
    }

    fn map_page(&self, _virt: u64, _phys: u64, _prot: Protection) -> ferrokern::Result<()> {
        self.mapped_pages.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unmap_page(&self, _virt: u64) {
        self.unmapped_pages.fetch_add(1, Ordering::SeqCst);
    }

    fn update_protection(&self, _virt: u64, _prot: Protection) {}

    fn swap_out(&self, _virt: u64) -> ferrokern::Result<SwapHandle> {
        self.swap_outs.fetch_add(1, Ordering::SeqCst);
        Ok(SwapHandle(self.next_swap.fetch_add(1, Ordering::SeqCst)))
    }

    fn swap_in(&self, _handle: SwapHandle, _virt: u64) -> ferrokern::Result<()> {
        self.swap_ins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn allocate_physical_pages(&self, n: usize) -> ferrokern::Result<u64> {
        let bytes = vec![0u8; n * PAGE_SIZE].into_boxed_slice();
        Ok(Box::leak(bytes).as_mut_ptr() as u64)
    }

    fn free_physical_pages(&self, _base: u64, _n: usize) {}

    fn wait_for_interrupt(&self) {
        // The idle loop's halt doubles as the timer source: time only
        // moves when nothing else is runnable.
        self.tick();
    }

    fn register_callbacks(&self, callbacks: PlatformCallbacks) {
        *self.callbacks.lock().unwrap() = Some(Arc::new(callbacks));
    }
}

/// A kernel over a fresh host platform
pub fn boot(config: KernelConfig) -> (Arc<Kernel>, Arc<HostPlatform>) {
    let platform = HostPlatform::new();
    let kernel = Kernel::new(platform.clone(), config).expect("kernel construction failed");
    (kernel, platform)
}

pub fn boot_default() -> (Arc<Kernel>, Arc<HostPlatform>) {
    boot(KernelConfig::default())
}
