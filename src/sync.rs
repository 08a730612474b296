//! Switches the Atomic-Primitives between the Standard-Library and loom,
//! depending on whether or not we are currently running loom based tests

#[cfg(loom)]
pub use loom::sync::atomic;

#[cfg(not(loom))]
pub use core::sync::atomic;

#[cfg(loom)]
pub use loom::sync::Mutex;
