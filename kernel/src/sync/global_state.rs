//! One-shot global initialization without allocation
//!
//! The core has several process-wide singletons with an init-then-read
//! lifecycle (the interrupt-controller device, the kernel logger). They are
//! created during early, single-threaded boot, before any allocator exists,
//! so a heap-backed `OnceLock` is not an option. `GlobalState` keeps the
//! value inline behind a `spin::Mutex<Option<T>>`.

use spin::Mutex;

/// A cell that is written once during boot and read for the rest of the
/// kernel's lifetime.
pub struct GlobalState<T> {
    inner: Mutex<Option<T>>,
}

impl<T> GlobalState<T> {
    /// Create a new empty cell
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Initialize the cell with a value.
    ///
    /// Returns `Err(value)` if the cell was already initialized.
    pub fn init(&self, value: T) -> Result<(), T> {
        let mut guard = self.inner.lock();
        if guard.is_some() {
            return Err(value);
        }
        *guard = Some(value);
        Ok(())
    }

    /// Run `f` with a reference to the contained value, if initialized.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let guard = self.inner.lock();
        guard.as_ref().map(f)
    }

    /// Run `f` with a mutable reference to the contained value, if
    /// initialized.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = self.inner.lock();
        guard.as_mut().map(f)
    }

    /// Whether the cell has been initialized
    pub fn is_initialized(&self) -> bool {
        self.inner.lock().is_some()
    }
}

impl<T> Default for GlobalState<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn init_once() {
        let cell = GlobalState::new();
        assert!(!cell.is_initialized());
        assert!(cell.init(7u32).is_ok());
        assert_eq!(cell.init(8u32), Err(8), "second init must be rejected");
        assert_eq!(cell.with(|v| *v), Some(7));
    }

    #[test]
    fn with_mut_updates_in_place() {
        let cell = GlobalState::new();
        cell.init(1u32).expect("first init should succeed");
        cell.with_mut(|v| *v += 1);
        assert_eq!(cell.with(|v| *v), Some(2));
    }
}
