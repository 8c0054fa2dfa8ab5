//! User-space synchronization and thread lifecycle core.
//!
//! This crate is the futex-facing heart of a POSIX threads implementation:
//! mutexes, condition variables, reader/writer locks, semaphores, one-time
//! initialization, barriers, thread-local keys, thread creation and join,
//! cancellation, fork handlers, and process-wide credential changes. Every
//! blocking primitive is one or two 32-bit atomic words plus the kernel's
//! address-keyed wait and wake; everything else is the bookkeeping that keeps
//! those words honest across creation, exit, cancellation, and fork.
//!
//! The C-compatible surface lives in the `spindle-abi` crate; this crate
//! exposes the typed API it wraps.

pub mod atfork;
pub mod barrier;
pub mod cancel;
pub mod cleanup;
pub mod cond;
pub mod error;
pub mod key;
pub mod mutex;
pub mod once;
pub mod rwlock;
pub mod sema;
pub mod setids;
pub mod sys;
pub mod thread;

pub use error::{Error, Result};
