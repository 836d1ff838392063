//! Architecture-specific code
//!
//! Each architecture module exposes the same surface: page-table entry
//! construction and decoding (`paging`), context-switch and call-trampoline
//! assembly (`context`), extended-context save/restore (`ectx`), LCPU
//! startup and IPI kicks (`lcpu`), and the monotonic clock (`time`). The
//! re-export below flattens the current architecture into `crate::arch::*`.

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "aarch64")]
pub use self::aarch64::*;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64::*;
