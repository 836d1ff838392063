//! Write-once cell with lock-free reads
//!
//! Unlike [`super::GlobalState`], readers get a plain `&'static` reference
//! after initialization instead of running under a lock. Used for
//! singletons that are read from interrupt context (the interrupt
//! controller device), where taking a mutex in the read path could deadlock
//! against an interrupted writer.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

const STATE_EMPTY: u8 = 0;
const STATE_BUSY: u8 = 1;
const STATE_READY: u8 = 2;

/// A cell that can be written exactly once and read lock-free thereafter
pub struct OnceCell<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: The state machine guarantees the value is written exactly once
// (guarded by the BUSY state) before any shared reference is handed out,
// and never mutated afterwards.
unsafe impl<T: Send + Sync> Sync for OnceCell<T> {}

impl<T> OnceCell<T> {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Initialize the cell. Returns `Err(value)` if it was (or is being)
    /// initialized already.
    pub fn set(&self, value: T) -> Result<(), T> {
        if self
            .state
            .compare_exchange(
                STATE_EMPTY,
                STATE_BUSY,
                Ordering::Acquire,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(value);
        }

        // SAFETY: The BUSY state excludes every other writer and no reader
        // observes the value before READY is published below.
        unsafe { (*self.value.get()).write(value) };
        self.state.store(STATE_READY, Ordering::Release);
        Ok(())
    }

    /// The contained value, if initialized
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) != STATE_READY {
            return None;
        }
        // SAFETY: READY is only published after the value was fully
        // written, with release/acquire pairing on `state`.
        Some(unsafe { (*self.value.get()).assume_init_ref() })
    }

    /// Whether the cell has been initialized
    pub fn is_set(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_READY
    }
}

impl<T> Default for OnceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for OnceCell<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == STATE_READY {
            // SAFETY: READY implies the value was initialized; we have
            // exclusive access in drop.
            unsafe { (*self.value.get()).assume_init_drop() };
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn set_once_then_read() {
        let cell = OnceCell::new();
        assert!(cell.get().is_none());
        assert!(cell.set(41u32).is_ok());
        assert_eq!(cell.set(42u32), Err(42));
        assert_eq!(cell.get(), Some(&41));
        assert!(cell.is_set());
    }
}
