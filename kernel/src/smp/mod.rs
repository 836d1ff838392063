//! Logical-CPU lifecycle and inter-processor coordination
//!
//! Every hardware thread is represented by an [`Lcpu`] record in a fixed
//! pool. The record's `state` field is a counter-encoded state machine:
//!
//! ```text
//! OFFLINE ── start ──▶ INIT ── init done ──▶ BUSY0 ──(dec)──▶ IDLE
//!                                              ▲               │
//!                                              └──(inc / fn)───┘
//! any state ── fatal ──▶ HALTED    (terminal)
//! ```
//!
//! `IDLE` is zero; busy levels are positive, enqueueing a cross-CPU
//! function increments and its completion decrements. The non-online states
//! are negative, so a plain increment can never be used: all transitions
//! between online states go through a CAS loop that aborts when the target
//! left the online range ([`Lcpu::transition_safe`]).
//!
//! Each LCPU has a single cross-CPU function slot. Producers claim it by
//! CAS on the function pointer; the user argument is written after the
//! claim and published by a release fence before the RUN IPI is raised. The
//! consumer reads the pointer with acquire ordering, takes the argument,
//! and only then clears the slot for the next producer.

use core::sync::atomic::{fence, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::arch;
use crate::arch::context::Regs;
use crate::error::{KernelError, KernelResult};
use crate::irq;
use crate::timer;

/// Maximum number of logical CPUs
pub const MAX_LCPUS: usize = 16;

/// Terminal failure state; never left once entered
pub const STATE_HALTED: i32 = -3;
/// Not started
pub const STATE_OFFLINE: i32 = -2;
/// Startup in progress
pub const STATE_INIT: i32 = -1;
/// Online, nothing queued
pub const STATE_IDLE: i32 = 0;
/// First busy level; higher values count pending/running work
pub const STATE_BUSY0: i32 = 1;

const fn state_is_online(state: i32) -> bool {
    state >= STATE_IDLE
}

const fn state_is_busy(state: i32) -> bool {
    state >= STATE_BUSY0
}

/// A function to run on a remote LCPU
#[derive(Clone, Copy)]
pub struct RemoteFn {
    /// The function; receives the interrupted register snapshot (when the
    /// trap entry provides one) and the user argument.
    pub func: fn(Option<&mut Regs>, *mut ()),
    /// Opaque user argument
    pub arg: *mut (),
}

bitflags::bitflags! {
    /// Flags for [`LcpuPool::run`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RunFlags: u64 {
        /// Fail with `WouldBlock` instead of spinning when the target's
        /// function slot is occupied
        const DONOTBLOCK = 1 << 0;
    }
}

/// Per-CPU record.
///
/// `repr(C)`: the AP entry trampoline reads the startup stack pointer from
/// offset 0 and the startup entry point from offset 8 before any Rust code
/// runs on the new CPU.
#[repr(C)]
pub struct Lcpu {
    startup_sp: AtomicU64,
    startup_entry: AtomicU64,
    id: AtomicU64,
    idx: AtomicU32,
    state: AtomicI32,
    error_code: AtomicI32,
    fn_ptr: AtomicUsize,
    fn_arg: AtomicUsize,
}

impl Lcpu {
    const fn new() -> Self {
        Self {
            startup_sp: AtomicU64::new(0),
            startup_entry: AtomicU64::new(0),
            id: AtomicU64::new(0),
            idx: AtomicU32::new(0),
            state: AtomicI32::new(STATE_OFFLINE),
            error_code: AtomicI32::new(0),
            fn_ptr: AtomicUsize::new(0),
            fn_arg: AtomicUsize::new(0),
        }
    }

    /// Hardware identifier (APIC id / MPIDR affinity)
    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Relaxed)
    }

    /// Index of this record in the pool
    pub fn idx(&self) -> u32 {
        self.idx.load(Ordering::Relaxed)
    }

    /// Current state-machine value
    pub fn state(&self) -> i32 {
        self.state.load(Ordering::Acquire)
    }

    /// Error code recorded when the CPU halted
    pub fn error_code(&self) -> i32 {
        self.error_code.load(Ordering::Acquire)
    }

    /// Whether the CPU is in an online state (IDLE or BUSY)
    pub fn is_online(&self) -> bool {
        state_is_online(self.state())
    }

    /// Move between online states by `incr`, aborting if the CPU is (or
    /// becomes) non-online. Returns whether the transition was performed.
    fn transition_safe(&self, incr: i32) -> bool {
        let mut old = self.state.load(Ordering::Acquire);
        loop {
            if !state_is_online(old) {
                return false;
            }
            let new = old + incr;
            debug_assert!(state_is_online(new));
            match self
                .state
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => old = actual,
            }
        }
    }

    /// Try to claim the one-entry function slot. The argument is stored
    /// after the claim; the release fence pairs with the acquire read in
    /// [`Lcpu::dequeue`], and the caller raises the RUN IPI only after this
    /// returns.
    fn enqueue(&self, f: RemoteFn) -> KernelResult<()> {
        let raw = f.func as usize;
        debug_assert_ne!(raw, 0);

        if self.fn_ptr.load(Ordering::Acquire) != 0 {
            return Err(KernelError::WouldBlock);
        }
        self.fn_ptr
            .compare_exchange(0, raw, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| KernelError::WouldBlock)?;

        // We own the slot. The consumer reads the argument only after
        // observing the non-null function pointer at IPI delivery, which
        // happens after this fence.
        self.fn_arg.store(f.arg as usize, Ordering::Relaxed);
        fence(Ordering::Release);
        Ok(())
    }

    /// Take the pending function, freeing the slot for the next producer
    fn dequeue(&self) -> RemoteFn {
        let raw = self.fn_ptr.load(Ordering::Acquire);
        debug_assert_ne!(raw, 0, "RUN IPI without a queued function");
        let arg = self.fn_arg.load(Ordering::Relaxed) as *mut ();
        fence(Ordering::Acquire);

        // SAFETY: Non-zero values are only written by `enqueue` from a
        // valid `fn(Option<&mut Regs>, *mut ())`.
        let func = unsafe {
            core::mem::transmute::<usize, fn(Option<&mut Regs>, *mut ())>(raw)
        };

        self.fn_ptr.store(0, Ordering::Release);
        RemoteFn { func, arg }
    }
}

/// The pool of LCPU records. One global instance backs the module-level
/// API; the type itself is separate so the state machine can be exercised
/// in isolation.
pub struct LcpuPool {
    lcpus: [Lcpu; MAX_LCPUS],
    count: AtomicU32,
}

impl LcpuPool {
    const EMPTY: Lcpu = Lcpu::new();

    pub const fn new() -> Self {
        Self {
            lcpus: [Self::EMPTY; MAX_LCPUS],
            count: AtomicU32::new(1),
        }
    }

    /// Number of known LCPUs (1 before MP init)
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// The record at `idx`
    pub fn get(&self, idx: u32) -> Option<&Lcpu> {
        if idx < self.count() {
            Some(&self.lcpus[idx as usize])
        } else {
            None
        }
    }

    /// The record of the executing CPU. Secondary CPUs are matched by
    /// hardware id; anything unknown is the BSP by definition (its id is
    /// recorded during [`LcpuPool::init_current`]).
    pub fn current(&self) -> &Lcpu {
        let hw_id = arch::lcpu::hw_id();
        let n = self.count() as usize;
        self.lcpus[1..n]
            .iter()
            .find(|l| l.id.load(Ordering::Relaxed) == hw_id)
            .unwrap_or(&self.lcpus[0])
    }

    fn is_bsp(&self, lcpu: &Lcpu) -> bool {
        core::ptr::eq(lcpu, &self.lcpus[0])
    }

    /// Bring the executing CPU online: BSP goes (implicit) → INIT → BUSY0,
    /// APs arrive here in INIT (placed there by [`LcpuPool::start`]) and
    /// complete the same transition.
    pub fn init_current(&self) -> KernelResult<()> {
        let lcpu = self.current();

        if self.is_bsp(lcpu) {
            if self.count() > 1 {
                return Err(KernelError::InvalidState {
                    expected: "BSP init before MP init",
                    actual: "secondary CPUs already allocated",
                });
            }
            lcpu.idx.store(0, Ordering::Relaxed);
            lcpu.id.store(arch::lcpu::hw_id(), Ordering::Relaxed);
            lcpu.state.store(STATE_INIT, Ordering::Release);
        } else if lcpu.state() != STATE_INIT {
            return Err(KernelError::InvalidState {
                expected: "INIT",
                actual: "secondary CPU in unexpected state",
            });
        }

        arch::lcpu::init_current()?;

        lcpu.fn_ptr.store(0, Ordering::Relaxed);

        // Publish everything written so far before going online; from this
        // point on other CPUs may queue functions to us (IRQs still off).
        lcpu.state.store(STATE_BUSY0, Ordering::Release);
        Ok(())
    }

    /// Allocate a record for a secondary CPU with hardware id `id`. BSP
    /// only, before any AP is started.
    pub fn alloc(&self, id: u64) -> KernelResult<&Lcpu> {
        let idx = self.count();
        if idx as usize == MAX_LCPUS {
            return Err(KernelError::OutOfMemory {
                requested: core::mem::size_of::<Lcpu>(),
            });
        }
        let lcpu = &self.lcpus[idx as usize];
        lcpu.state.store(STATE_OFFLINE, Ordering::Relaxed);
        lcpu.id.store(id, Ordering::Relaxed);
        lcpu.idx.store(idx, Ordering::Relaxed);
        self.count.store(idx + 1, Ordering::Release);
        Ok(lcpu)
    }

    /// Number of targets of a bulk operation and the index of the `k`-th
    /// one: the listed indices, or every known LCPU when `indices` is
    /// `None`. The executing CPU is skipped by all callers.
    fn target_count(&self, indices: Option<&[u32]>) -> usize {
        match indices {
            Some(list) => list.len(),
            None => self.count() as usize,
        }
    }

    fn target_idx(indices: Option<&[u32]>, k: usize) -> u32 {
        match indices {
            Some(list) => list[k],
            None => k as u32,
        }
    }

    /// Start the given secondary CPUs (all known APs when `indices` is
    /// `None`). `sps` supplies one startup stack per target, `entries`
    /// optionally one entry point per target (0 selects the default entry).
    ///
    /// On a per-CPU startup failure the CPU is marked HALTED with its error
    /// code and the operation continues; the first error is returned and
    /// `num` is left at the count of successfully started CPUs.
    pub fn start(
        &self,
        indices: Option<&[u32]>,
        num: &mut usize,
        sps: &[u64],
        entries: Option<&[u64]>,
    ) -> KernelResult<()> {
        let this_id = self.current().id();
        let mut started: usize = 0;
        let mut argi = 0;
        let mut first_err: KernelResult<()> = Ok(());

        for k in 0..self.target_count(indices) {
            let idx = Self::target_idx(indices, k);
            let Some(lcpu) = self.get(idx) else {
                argi += 1;
                continue;
            };
            if lcpu.id() == this_id {
                // The executing CPU carries no startup arguments unless it
                // was explicitly listed.
                if indices.is_some() {
                    argi += 1;
                }
                continue;
            }

            // Acquire the CPU for initialization. Racing starters fall out
            // with a non-OFFLINE observation and skip it.
            if lcpu
                .state
                .compare_exchange(
                    STATE_OFFLINE,
                    STATE_INIT,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                log::warn!("lcpu {:#x}: not offline, skipping start", lcpu.id());
                argi += 1;
                continue;
            }

            lcpu.startup_entry
                .store(entries.and_then(|e| e.get(argi)).copied().unwrap_or(0), Ordering::Relaxed);
            lcpu.startup_sp
                .store(sps.get(argi).copied().unwrap_or(0), Ordering::Relaxed);

            // Make the startup arguments visible before the wakeup kick.
            fence(Ordering::Release);

            if let Err(e) = arch::lcpu::start(lcpu.id()) {
                lcpu.state.store(STATE_HALTED, Ordering::Release);
                lcpu.error_code.store(e.code(), Ordering::Release);
                first_err = Err(e);
                // A startup failure is serious; the caller can see how far
                // we got through `num`.
                break;
            }

            started += 1;
            argi += 1;
        }

        if arch::lcpu::MULTI_PHASE_STARTUP && started > 0 {
            if let Err(e) = arch::lcpu::post_start(indices, &mut started) {
                *num = started;
                return if first_err.is_err() { first_err } else { Err(e) };
            }
        }

        *num = started;
        first_err
    }

    /// Queue `f` on each target LCPU and raise the RUN IPI. Targets that
    /// are not online are skipped. With a contended function slot,
    /// `DONOTBLOCK` rolls the busy transition back and fails; otherwise the
    /// producer spins until the slot frees up.
    pub fn run(&self, indices: Option<&[u32]>, f: RemoteFn, flags: RunFlags) -> KernelResult<()> {
        let this_id = self.current().id();

        for k in 0..self.target_count(indices) {
            let idx = Self::target_idx(indices, k);
            let Some(lcpu) = self.get(idx) else { continue };
            if lcpu.id() == this_id {
                continue;
            }

            // Raise the busy level first so waiters see the CPU as busy the
            // moment the function becomes runnable.
            if !lcpu.transition_safe(1) {
                continue;
            }

            loop {
                match lcpu.enqueue(f) {
                    Ok(()) => break,
                    Err(KernelError::WouldBlock) => {
                        if flags.contains(RunFlags::DONOTBLOCK) {
                            // Roll back the busy level; the CPU may have
                            // gone offline meanwhile, which is fine.
                            lcpu.transition_safe(-1);
                            return Err(KernelError::WouldBlock);
                        }
                        core::hint::spin_loop();
                    }
                    Err(e) => return Err(e),
                }
            }

            arch::lcpu::send_run_ipi(lcpu.id());
        }

        Ok(())
    }

    /// Busy-wait until every target is observed IDLE, OFFLINE, or HALTED.
    /// A `timeout_ns` of 0 waits forever.
    pub fn wait(&self, indices: Option<&[u32]>, timeout_ns: u64) -> KernelResult<()> {
        let this_id = self.current().id();
        let deadline = (timeout_ns > 0).then(|| timer::monotonic_ns() + timeout_ns);

        for k in 0..self.target_count(indices) {
            let idx = Self::target_idx(indices, k);
            let Some(lcpu) = self.get(idx) else { continue };
            if lcpu.id() == this_id {
                continue;
            }

            loop {
                let state = lcpu.state();
                if state == STATE_OFFLINE || state == STATE_HALTED || state == STATE_IDLE {
                    break;
                }
                if let Some(d) = deadline {
                    if timer::monotonic_ns() >= d {
                        return Err(KernelError::Timeout);
                    }
                }
                core::hint::spin_loop();
            }
        }

        Ok(())
    }

    /// Send the wakeup IPI to every online target; offline and halted CPUs
    /// are ignored. A target halting after the check is harmless: its halt
    /// loop goes back to sleep after the spurious wakeup.
    pub fn wakeup(&self, indices: Option<&[u32]>) -> KernelResult<()> {
        let this_id = self.current().id();

        for k in 0..self.target_count(indices) {
            let idx = Self::target_idx(indices, k);
            let Some(lcpu) = self.get(idx) else { continue };
            if lcpu.id() == this_id || !lcpu.is_online() {
                continue;
            }
            arch::lcpu::send_wakeup_ipi(lcpu.id());
        }

        Ok(())
    }

    /// RUN IPI consumer: take the queued function, run it, then leave the
    /// busy level it was accounted under.
    fn run_pending(&self, lcpu: &Lcpu, regs: Option<&mut Regs>) {
        let f = lcpu.dequeue();
        (f.func)(regs, f.arg);

        // A fatal transition inside the function would have halted the CPU
        // and never returned here, so the state is still a busy level.
        debug_assert!(state_is_busy(lcpu.state()));
        lcpu.state.fetch_sub(1, Ordering::AcqRel);
    }

    /// Halt the executing CPU with `error_code`. Terminal: IRQs stay off
    /// and only NMIs can briefly interrupt the halt loop.
    pub fn halt_current(&self, error_code: i32) -> ! {
        arch::irq_disable();

        let lcpu = self.current();
        lcpu.state.store(STATE_HALTED, Ordering::Release);
        lcpu.error_code.store(error_code, Ordering::Release);

        loop {
            arch::halt();
        }
    }
}

impl Default for LcpuPool {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Global pool and module-level API
// ---------------------------------------------------------------------------

static POOL: LcpuPool = LcpuPool::new();

static RUN_IRQ: AtomicU32 = AtomicU32::new(0);
static WAKEUP_IRQ: AtomicU32 = AtomicU32::new(0);

/// IRQ vector carrying cross-CPU function requests (0 before MP init)
pub fn run_irq_vector() -> u32 {
    RUN_IRQ.load(Ordering::Acquire)
}

/// IRQ vector for bare wakeups (0 before MP init)
pub fn wakeup_irq_vector() -> u32 {
    WAKEUP_IRQ.load(Ordering::Acquire)
}

/// Number of known LCPUs
pub fn lcpu_count() -> u32 {
    POOL.count()
}

/// Record of the LCPU at `idx`
pub fn lcpu_get(idx: u32) -> Option<&'static Lcpu> {
    POOL.get(idx)
}

/// Record of the LCPU with hardware id `id`
pub fn lcpu_get_by_id(id: u64) -> Option<&'static Lcpu> {
    let n = POOL.count();
    (0..n)
        .filter_map(|i| POOL.get(i))
        .find(|l| l.id() == id)
}

/// Record of the executing CPU
pub fn lcpu_current() -> &'static Lcpu {
    POOL.current()
}

/// Bring the executing CPU online (see [`LcpuPool::init_current`])
pub fn lcpu_init() -> KernelResult<()> {
    POOL.init_current()
}

/// Allocate a record for a secondary CPU (BSP only, during MP init)
pub fn lcpu_alloc(id: u64) -> KernelResult<&'static Lcpu> {
    POOL.alloc(id)
}

/// Start secondary CPUs (see [`LcpuPool::start`])
pub fn lcpu_start(
    indices: Option<&[u32]>,
    num: &mut usize,
    sps: &[u64],
    entries: Option<&[u64]>,
) -> KernelResult<()> {
    POOL.start(indices, num, sps, entries)
}

/// Run a function on remote LCPUs (see [`LcpuPool::run`])
pub fn lcpu_run(indices: Option<&[u32]>, f: RemoteFn, flags: RunFlags) -> KernelResult<()> {
    POOL.run(indices, f, flags)
}

/// Wait for remote LCPUs to drain (see [`LcpuPool::wait`])
pub fn lcpu_wait(indices: Option<&[u32]>, timeout_ns: u64) -> KernelResult<()> {
    POOL.wait(indices, timeout_ns)
}

/// Wake halted-waiting LCPUs (see [`LcpuPool::wakeup`])
pub fn lcpu_wakeup(indices: Option<&[u32]>) -> KernelResult<()> {
    POOL.wakeup(indices)
}

/// Halt the executing CPU with error code 0
pub fn halt() -> ! {
    POOL.halt_current(0)
}

/// Halt the executing CPU with `error_code`
pub fn halt_with(error_code: i32) -> ! {
    POOL.halt_current(error_code)
}

/// Block until the monotonic clock reaches `deadline` (ns). Must be called
/// with IRQs disabled; IRQs (including the wakeup IPI) terminate individual
/// halts while the clock catches up.
pub fn halt_irq_until(deadline: u64) {
    debug_assert!(arch::irqs_disabled());
    timer::block_until(deadline);
}

fn run_ipi_handler(regs: Option<&mut Regs>, _irq: u32) {
    POOL.run_pending(POOL.current(), regs);
}

fn wakeup_ipi_handler(_regs: Option<&mut Regs>, _irq: u32) {
    // Delivery alone suffices to leave a halt.
}

/// Multi-processor init, run once on the BSP: allocate records for the
/// secondary CPUs handed over by firmware discovery and wire up the RUN and
/// WAKEUP IPI vectors.
pub fn mp_init(secondary_ids: &[u64], run_irq: u32, wakeup_irq: u32) -> KernelResult<()> {
    if POOL.count() != 1 {
        return Err(KernelError::InvalidState {
            expected: "BSP only",
            actual: "MP init already performed",
        });
    }

    for &id in secondary_ids {
        POOL.alloc(id)?;
    }

    irq::register(run_irq, run_ipi_handler)?;
    irq::register(wakeup_irq, wakeup_ipi_handler)?;
    RUN_IRQ.store(run_irq, Ordering::Release);
    WAKEUP_IRQ.store(wakeup_irq, Ordering::Release);

    log::info!(
        "mp: {} cpus, run ipi {}, wakeup ipi {}",
        POOL.count(),
        run_irq,
        wakeup_irq
    );
    Ok(())
}

/// Default entry point for started APs: finish initialization, then either
/// jump to the user-supplied entry on the user-supplied stack or settle
/// into the IPI-serving idle loop.
pub extern "C" fn lcpu_entry_default(lcpu: &'static Lcpu) -> ! {
    let entry = lcpu.startup_entry.load(Ordering::Acquire);
    let sp = lcpu.startup_sp.load(Ordering::Acquire);

    if let Err(e) = POOL.init_current() {
        POOL.halt_current(e.code());
    }

    if entry != 0 {
        // SAFETY: The starter stored a valid entry point and stack for this
        // CPU before kicking it.
        unsafe { arch::lcpu::jump_to(sp, entry) };
    }

    // Coming from BUSY0 with functions possibly queued already, so a
    // decrement rather than a store to IDLE.
    lcpu.state.fetch_sub(1, Ordering::AcqRel);

    arch::irq_enable();
    loop {
        // Interruptible by IPIs; the RUN handler serves queued functions.
        arch::halt();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    fn noop_fn(_regs: Option<&mut Regs>, _arg: *mut ()) {}

    fn count_fn(_regs: Option<&mut Regs>, arg: *mut ()) {
        // SAFETY: Tests always pass a pointer to a live AtomicUsize.
        let counter = unsafe { &*(arg as *const StdAtomicUsize) };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn bsp_init_reaches_busy0() {
        let pool = LcpuPool::new();
        pool.init_current().expect("BSP init");
        let bsp = pool.get(0).expect("BSP record");
        assert_eq!(bsp.state(), STATE_BUSY0);
        assert_eq!(bsp.idx(), 0);

        // The boot thread leaving init drops to IDLE.
        bsp.state.fetch_sub(1, Ordering::AcqRel);
        assert_eq!(bsp.state(), STATE_IDLE);
    }

    #[test]
    fn alloc_extends_pool() {
        let pool = LcpuPool::new();
        pool.init_current().expect("BSP init");
        assert_eq!(pool.count(), 1);

        let ap = pool.alloc(7).expect("alloc");
        assert_eq!(pool.count(), 2);
        assert_eq!(ap.idx(), 1);
        assert_eq!(ap.id(), 7);
        assert_eq!(ap.state(), STATE_OFFLINE);

        assert!(pool.get(2).is_none());
    }

    #[test]
    fn pool_capacity_is_bounded() {
        let pool = LcpuPool::new();
        for i in 1..MAX_LCPUS as u64 {
            pool.alloc(i).expect("alloc within capacity");
        }
        assert!(matches!(
            pool.alloc(99),
            Err(KernelError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn start_moves_offline_to_init() {
        let pool = LcpuPool::new();
        pool.init_current().expect("BSP init");
        pool.alloc(1).expect("alloc");

        let mut num = 0;
        pool.start(Some(&[1]), &mut num, &[0x9000], None)
            .expect("start");
        assert_eq!(num, 1);
        let ap = pool.get(1).expect("AP record");
        assert_eq!(ap.state(), STATE_INIT);
        assert_eq!(ap.startup_sp.load(Ordering::Relaxed), 0x9000);

        // Starting a CPU that is not offline is skipped, not an error.
        let mut num2 = 0;
        pool.start(Some(&[1]), &mut num2, &[0xA000], None)
            .expect("second start");
        assert_eq!(num2, 0);
        assert_eq!(
            ap.startup_sp.load(Ordering::Relaxed),
            0x9000,
            "skipped start must not touch startup arguments"
        );
    }

    #[test]
    fn run_queues_and_handler_drains() {
        let pool = LcpuPool::new();
        pool.init_current().expect("BSP init");
        let ap = pool.alloc(1).expect("alloc");
        ap.state.store(STATE_IDLE, Ordering::Release);

        let counter = StdAtomicUsize::new(0);
        let f = RemoteFn {
            func: count_fn,
            arg: &counter as *const _ as *mut (),
        };

        pool.run(Some(&[1]), f, RunFlags::empty()).expect("run");
        assert_eq!(ap.state(), STATE_BUSY0, "enqueue must raise the busy level");
        assert_ne!(ap.fn_ptr.load(Ordering::Acquire), 0);

        // Simulate the RUN IPI on the target CPU.
        pool.run_pending(ap, None);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(ap.state(), STATE_IDLE, "completion must return to IDLE");
        assert_eq!(ap.fn_ptr.load(Ordering::Acquire), 0, "slot must be free again");
    }

    #[test]
    fn run_donotblock_on_full_slot_fails_cleanly() {
        let pool = LcpuPool::new();
        pool.init_current().expect("BSP init");
        let ap = pool.alloc(1).expect("alloc");
        ap.state.store(STATE_IDLE, Ordering::Release);

        // Occupy the slot directly.
        ap.enqueue(RemoteFn {
            func: noop_fn,
            arg: core::ptr::null_mut(),
        })
        .expect("first enqueue");
        let state_before = ap.state();

        let result = pool.run(
            Some(&[1]),
            RemoteFn {
                func: noop_fn,
                arg: core::ptr::null_mut(),
            },
            RunFlags::DONOTBLOCK,
        );
        assert!(matches!(result, Err(KernelError::WouldBlock)));
        assert_eq!(
            ap.state(),
            state_before,
            "DONOTBLOCK failure must leave the target state unchanged"
        );
    }

    #[test]
    fn run_skips_offline_and_halted_targets() {
        let pool = LcpuPool::new();
        pool.init_current().expect("BSP init");
        let ap = pool.alloc(1).expect("alloc");

        // OFFLINE: ignored entirely.
        pool.run(
            Some(&[1]),
            RemoteFn {
                func: noop_fn,
                arg: core::ptr::null_mut(),
            },
            RunFlags::empty(),
        )
        .expect("run against offline target");
        assert_eq!(ap.state(), STATE_OFFLINE);
        assert_eq!(ap.fn_ptr.load(Ordering::Acquire), 0);

        // HALTED is terminal: still ignored.
        ap.state.store(STATE_HALTED, Ordering::Release);
        pool.run(
            Some(&[1]),
            RemoteFn {
                func: noop_fn,
                arg: core::ptr::null_mut(),
            },
            RunFlags::empty(),
        )
        .expect("run against halted target");
        assert_eq!(ap.state(), STATE_HALTED);
    }

    #[test]
    fn producer_spins_until_consumer_drains() {
        let pool = LcpuPool::new();
        pool.init_current().expect("BSP init");
        let ap = pool.alloc(1).expect("alloc");
        ap.state.store(STATE_IDLE, Ordering::Release);

        let counter = StdAtomicUsize::new(0);
        const ROUNDS: usize = 64;

        std::thread::scope(|s| {
            // Consumer: play the target CPU, drain whenever work shows up.
            s.spawn(|| {
                let mut seen = 0;
                while seen < ROUNDS {
                    if ap.fn_ptr.load(Ordering::Acquire) != 0 {
                        pool.run_pending(ap, None);
                        seen += 1;
                    } else {
                        std::thread::yield_now();
                    }
                }
            });

            // Producer: enqueue more work than the one-deep slot can hold,
            // relying on the spin path.
            for _ in 0..ROUNDS {
                pool.run(
                    Some(&[1]),
                    RemoteFn {
                        func: count_fn,
                        arg: &counter as *const _ as *mut (),
                    },
                    RunFlags::empty(),
                )
                .expect("run with blocking producer");
            }
        });

        assert_eq!(counter.load(Ordering::SeqCst), ROUNDS);
        assert_eq!(ap.state(), STATE_IDLE);
    }

    #[test]
    fn wait_returns_for_idle_and_times_out_for_busy() {
        let pool = LcpuPool::new();
        pool.init_current().expect("BSP init");
        let ap = pool.alloc(1).expect("alloc");

        ap.state.store(STATE_IDLE, Ordering::Release);
        pool.wait(Some(&[1]), 0).expect("wait on idle target");

        ap.state.store(STATE_BUSY0, Ordering::Release);
        assert!(matches!(
            pool.wait(Some(&[1]), 1_000_000),
            Err(KernelError::Timeout)
        ));

        // HALTED is a wait-terminating state.
        ap.state.store(STATE_HALTED, Ordering::Release);
        pool.wait(Some(&[1]), 0).expect("wait on halted target");
    }

    #[test]
    fn transition_safe_rejects_non_online_states() {
        let pool = LcpuPool::new();
        let ap = pool.alloc(1).expect("alloc");

        for state in [STATE_OFFLINE, STATE_INIT, STATE_HALTED] {
            ap.state.store(state, Ordering::Release);
            assert!(
                !ap.transition_safe(1),
                "transition from state {} must be rejected",
                state
            );
            assert_eq!(ap.state(), state);
        }

        ap.state.store(STATE_IDLE, Ordering::Release);
        assert!(ap.transition_safe(1));
        assert_eq!(ap.state(), STATE_BUSY0);
        assert!(ap.transition_safe(-1));
        assert_eq!(ap.state(), STATE_IDLE);
    }
}
