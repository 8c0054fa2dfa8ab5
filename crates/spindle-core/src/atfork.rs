//! Fork handlers.
//!
//! Handlers register under a recursive mutex so a prepare handler may itself
//! register more handlers. Prepare handlers run in reverse registration
//! order; parent and child handlers run forward, the conventional bracket
//! that lets lock acquisitions in prepare pair with releases in parent and
//! child. The registry lock is held across the fork itself, and the child's
//! copy of that lock is garbage, so the child path reinitializes it before
//! running its handlers.
//!
//! The `tag` on each registration identifies the registering image so a
//! dynamically unloaded module can pull its handlers back out.

use crate::error::{Error, Result};
use crate::mutex;
use crate::thread;

use std::cell::UnsafeCell;

/// Handler run around a fork.
pub type ForkRoutine = extern "C" fn();

struct ForkEntry {
    prepare: Option<ForkRoutine>,
    parent: Option<ForkRoutine>,
    child: Option<ForkRoutine>,
    tag: usize,
}

struct ForkRegistry {
    guard: mutex::Mutex,
    entries: UnsafeCell<Vec<ForkEntry>>,
}

// The vector is only touched with the guard held.
unsafe impl Sync for ForkRegistry {}

static REGISTRY: ForkRegistry =
    ForkRegistry { guard: mutex::internal_recursive(), entries: UnsafeCell::new(Vec::new()) };

/// Register a prepare/parent/child handler triple under `tag`.
pub fn register(
    prepare: Option<ForkRoutine>,
    parent: Option<ForkRoutine>,
    child: Option<ForkRoutine>,
    tag: usize,
) -> Result<()> {
    REGISTRY.guard.acquire();
    // SAFETY: guard held.
    unsafe {
        (*REGISTRY.entries.get()).push(ForkEntry { prepare, parent, child, tag });
    }
    REGISTRY.guard.unlock()?;
    Ok(())
}

/// Remove every handler registered under `tag`.
pub fn unregister(tag: usize) -> Result<()> {
    REGISTRY.guard.acquire();
    // SAFETY: guard held.
    unsafe {
        (*REGISTRY.entries.get()).retain(|entry| entry.tag != tag);
    }
    REGISTRY.guard.unlock()?;
    Ok(())
}

/// Fork the process with the registered handlers bracketing the clone.
///
/// Returns zero in the child and the child's pid in the parent.
pub fn fork() -> Result<i32> {
    thread::ensure_runtime_init();
    run_prepare();
    // SAFETY: fork itself; the handler protocol around it is this function.
    let pid = unsafe { libc::fork() };
    if pid == 0 {
        run_child();
        return Ok(0);
    }
    run_parent();
    if pid < 0 {
        return Err(Error::NoResources);
    }
    Ok(pid)
}

/// Run prepare handlers, newest first, and keep the registry locked so no
/// registration can slip between prepare and the fork.
pub(crate) fn run_prepare() {
    REGISTRY.guard.acquire();
    // SAFETY: guard held from here until run_parent or run_child.
    unsafe {
        for entry in (*REGISTRY.entries.get()).iter().rev() {
            if let Some(routine) = entry.prepare {
                routine();
            }
        }
    }
}

/// Run parent handlers, oldest first, and release the registry.
pub(crate) fn run_parent() {
    // SAFETY: guard still held by run_prepare.
    unsafe {
        for entry in (*REGISTRY.entries.get()).iter() {
            if let Some(routine) = entry.parent {
                routine();
            }
        }
    }
    let _ = REGISTRY.guard.unlock();
}

/// Repair the registry lock inherited from the parent, then run child
/// handlers, oldest first.
pub(crate) fn run_child() {
    REGISTRY.guard.reinit();
    // SAFETY: the child is single-threaded here.
    unsafe {
        for entry in (*REGISTRY.entries.get()).iter() {
            if let Some(routine) = entry.child {
                routine();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Each phase appends a digit so ordering failures show the whole trace.
    static TRACE: AtomicUsize = AtomicUsize::new(0);

    fn log(digit: usize) {
        let trace = TRACE.load(Ordering::Relaxed);
        TRACE.store(trace * 10 + digit, Ordering::Relaxed);
    }

    extern "C" fn first_prepare() {
        log(1);
    }
    extern "C" fn first_parent() {
        log(3);
    }
    extern "C" fn second_prepare() {
        log(0);
    }
    extern "C" fn second_parent() {
        log(4);
    }
    extern "C" fn second_child() {
        log(9);
    }

    // One test drives every phase so nothing else touches the shared
    // registry while the trace is being checked.
    #[test]
    fn phases_run_in_bracket_order() {
        const TAG: usize = 0x5EED;
        TRACE.store(0, Ordering::Relaxed);
        register(Some(first_prepare), Some(first_parent), None, TAG).unwrap();
        register(Some(second_prepare), Some(second_parent), Some(second_child), TAG).unwrap();

        // Drive the phases directly: prepare reversed, parent forward.
        run_prepare();
        run_parent();
        assert_eq!(TRACE.load(Ordering::Relaxed), 134);

        // Simulate the child side: the guard must come back usable and the
        // child handlers must run forward.
        TRACE.store(0, Ordering::Relaxed);
        run_prepare();
        run_child();
        assert_eq!(TRACE.load(Ordering::Relaxed), 19);
        register(None, None, None, TAG).unwrap();

        unregister(TAG).unwrap();
        TRACE.store(0, Ordering::Relaxed);
        run_prepare();
        run_parent();
        assert_eq!(TRACE.load(Ordering::Relaxed), 0);
    }
}
