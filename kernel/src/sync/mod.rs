//! Synchronization primitives for init-then-read globals

mod global_state;
mod once_cell;

pub use global_state::GlobalState;
pub use once_cell::OnceCell;
