//! IRQ handler registration and dispatch
//!
//! A fixed table of one handler per interrupt line, filled in by subsystems
//! at init time and consumed by the interrupt controller's acknowledge loop
//! (see [`gic`]). Registration is rare and init-time; dispatch is the hot
//! path and reads a single atomic.

pub mod gic;

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::context::Regs;
use crate::error::{KernelError, KernelResult};

/// Number of interrupt lines the dispatch table covers
pub const MAX_IRQ: usize = 256;

/// An interrupt handler. `regs` is the interrupted register snapshot when
/// the trap entry provides one.
pub type IrqHandler = fn(regs: Option<&mut Regs>, irq: u32);

struct Slot {
    handler: AtomicUsize,
}

impl Slot {
    const EMPTY: Slot = Slot {
        handler: AtomicUsize::new(0),
    };
}

static TABLE: [Slot; MAX_IRQ] = [Slot::EMPTY; MAX_IRQ];

/// Register `handler` for `irq`. One handler per line; re-registration is
/// rejected.
pub fn register(irq: u32, handler: IrqHandler) -> KernelResult<()> {
    let slot = TABLE
        .get(irq as usize)
        .ok_or(KernelError::InvalidArgument { what: "irq number" })?;

    slot.handler
        .compare_exchange(0, handler as usize, Ordering::AcqRel, Ordering::Acquire)
        .map_err(|_| KernelError::InvalidState {
            expected: "unregistered irq",
            actual: "irq already has a handler",
        })?;

    log::debug!("irq {}: handler registered", irq);
    Ok(())
}

/// Remove the handler for `irq`
pub fn unregister(irq: u32) -> KernelResult<()> {
    let slot = TABLE
        .get(irq as usize)
        .ok_or(KernelError::InvalidArgument { what: "irq number" })?;
    slot.handler.store(0, Ordering::Release);
    Ok(())
}

/// Invoke the handler registered for `irq`. Returns whether one was
/// registered.
pub fn dispatch(regs: Option<&mut Regs>, irq: u32) -> bool {
    let Some(slot) = TABLE.get(irq as usize) else {
        return false;
    };
    let raw = slot.handler.load(Ordering::Acquire);
    if raw == 0 {
        log::warn!("unhandled irq {}", irq);
        return false;
    }
    // SAFETY: Non-zero slot values are only ever written by `register` from
    // a valid `IrqHandler`, so transmuting back yields the same function.
    let handler: IrqHandler = unsafe { core::mem::transmute(raw) };
    handler(regs, irq);
    true
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU32;

    static CALLS: AtomicU32 = AtomicU32::new(0);

    fn count_handler(_regs: Option<&mut Regs>, _irq: u32) {
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

    fn other_handler(_regs: Option<&mut Regs>, _irq: u32) {}

    #[test]
    fn register_dispatch_unregister() {
        // Use a line no other test touches.
        let irq = 77;
        register(irq, count_handler).expect("registration of a free line");
        assert!(matches!(
            register(irq, other_handler),
            Err(KernelError::InvalidState { .. })
        ));

        let before = CALLS.load(Ordering::SeqCst);
        assert!(dispatch(None, irq));
        assert_eq!(CALLS.load(Ordering::SeqCst), before + 1);

        unregister(irq).expect("unregister");
        assert!(!dispatch(None, irq), "dispatch after unregister must report unhandled");
    }

    #[test]
    fn out_of_range_irq_is_rejected() {
        assert!(register(MAX_IRQ as u32, other_handler).is_err());
        assert!(!dispatch(None, MAX_IRQ as u32 + 5));
    }
}
