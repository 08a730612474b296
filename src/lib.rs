#![deny(missing_docs)]
#![warn(rust_2018_idioms, missing_debug_implementations)]
//! This crate provides an unbounded Lock-Free Multi-Producer-Multi-Consumer
//! Queue, which reclaims its Memory using split Reference-Counting instead of
//! Hazard-Pointers or Epochs
//!
//! # Example
//! ```rust
//! use std::{sync::Arc, thread};
//!
//! use splitref::Queue;
//!
//! let queue = Arc::new(Queue::new());
//!
//! let producer = {
//!     let queue = queue.clone();
//!     thread::spawn(move || {
//!         for i in 0..10 {
//!             queue.push(i);
//!         }
//!     })
//! };
//! producer.join().unwrap();
//!
//! for i in 0..10 {
//!     assert_eq!(Some(i), queue.pop());
//! }
//! assert_eq!(None, queue.pop());
//! ```
//!
//! # Feature-Flags
//! * `demo`: Builds the `splitref-demo` Binary, a small Producer/Consumer
//!   Stress-Run that logs its Results
//!
//! # Testing
//! The Queue can be checked using [loom](https://docs.rs/loom), by running
//! the Tests with `RUSTFLAGS="--cfg loom"`

mod queue;
mod sync;

pub use queue::Queue;
