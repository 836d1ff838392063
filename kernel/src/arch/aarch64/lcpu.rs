//! AArch64 LCPU support: PSCI startup and GIC software interrupts
//!
//! Secondary CPUs come up through PSCI `CPU_ON` (hypervisor call
//! convention), entering `_ferrite_ap_entry` with their [`crate::smp::Lcpu`]
//! record in `x0`. RUN and WAKEUP IPIs are GIC software-generated
//! interrupts.

use crate::error::{KernelError, KernelResult};
use crate::irq::gic::{self, SgiTarget};

/// PSCI handles the whole startup in one phase
pub const MULTI_PHASE_STARTUP: bool = false;

/// SGI carrying cross-CPU function requests
pub const RUN_IRQ: u32 = 14;

/// SGI for bare wakeups
pub const WAKEUP_IRQ: u32 = 15;

/// PSCI 0.2 CPU_ON function id (SMC64 convention)
const PSCI_CPU_ON: u64 = 0xC400_0003;

const MPIDR_AFF_MASK: u64 = 0x0000_00FF_00FF_FFFF;

#[cfg(target_os = "none")]
core::arch::global_asm!(
    r#"
    .text

    // PSCI entry for secondary CPUs: x0 carries the Lcpu record whose
    // first field is the startup stack pointer. Switch onto it and enter
    // the common AP path.
    .global _ferrite_ap_entry
_ferrite_ap_entry:
    ldr x1, [x0, #0]
    mov sp, x1
    b _ferrite_ap_boot
"#
);

#[cfg(target_os = "none")]
extern "C" {
    fn _ferrite_ap_entry();
}

/// Rust continuation of the AP entry assembly
#[cfg(target_os = "none")]
#[no_mangle]
extern "C" fn _ferrite_ap_boot(lcpu: &'static crate::smp::Lcpu) -> ! {
    crate::smp::lcpu_entry_default(lcpu)
}

/// Hardware id of the executing CPU: the MPIDR affinity fields
pub fn hw_id() -> u64 {
    #[cfg(target_os = "none")]
    {
        let mpidr: u64;
        // SAFETY: Reading MPIDR_EL1 has no side effects.
        unsafe {
            core::arch::asm!("mrs {}, mpidr_el1", out(reg) mpidr, options(nomem, nostack));
        }
        mpidr & MPIDR_AFF_MASK
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

/// Per-CPU architectural init. Exception vectors are installed by the boot
/// shim before the core runs.
pub fn init_current() -> KernelResult<()> {
    Ok(())
}

/// Start the CPU with MPIDR affinity `id` through PSCI `CPU_ON`
pub fn start(id: u64) -> KernelResult<()> {
    #[cfg(target_os = "none")]
    {
        let lcpu = crate::smp::lcpu_get_by_id(id)
            .ok_or(KernelError::NotFound { resource: "lcpu" })?;
        let entry = _ferrite_ap_entry as usize as u64;
        let context = lcpu as *const _ as u64;
        let ret: i64;
        // SAFETY: PSCI CPU_ON with a valid entry point and context only
        // affects the target CPU.
        unsafe {
            core::arch::asm!(
                "hvc #0",
                inout("x0") PSCI_CPU_ON => ret,
                in("x1") id,
                in("x2") entry,
                in("x3") context,
                options(nostack)
            );
        }
        if ret != 0 {
            return Err(KernelError::NotSupported {
                feature: "PSCI CPU_ON for this target",
            });
        }
        Ok(())
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = id;
        Ok(())
    }
}

/// No second startup phase with PSCI
pub fn post_start(_indices: Option<&[u32]>, _started: &mut usize) -> KernelResult<()> {
    Ok(())
}

fn send_sgi(sgi: u32, id: u64) {
    if let Ok(dev) = gic::device() {
        let _ = dev.sgi_gen(sgi, SgiTarget::Cpu(id));
    }
}

/// Raise the RUN IPI on the target CPU
pub fn send_run_ipi(id: u64) {
    send_sgi(RUN_IRQ, id);
}

/// Raise the WAKEUP IPI on the target CPU
pub fn send_wakeup_ipi(id: u64) {
    send_sgi(WAKEUP_IRQ, id);
}

/// Continue execution at `entry` on the stack `sp`; used when an AP was
/// started with a user-supplied entry point.
///
/// # Safety
///
/// `entry` must be the address of a non-returning function and `sp` a valid
/// stack top for it.
pub unsafe fn jump_to(sp: u64, entry: u64) -> ! {
    let ctx = crate::ctx::Context { ip: entry, sp };
    // SAFETY: Forwarded caller contract.
    unsafe { super::context::ctx_jump(&ctx) }
}
