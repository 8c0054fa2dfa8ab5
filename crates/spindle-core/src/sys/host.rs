//! Host thread bring-up.
//!
//! Thread records, lifecycle, synchronization, and teardown all belong to this
//! crate; the one thing delegated to the host libc is the `clone` dance
//! itself, via `pthread_create`, because a raw clone child would share the
//! parent's TLS block and corrupt the allocator. Caller-supplied stacks and
//! guard sizes are forwarded through the host attribute object, so the stack
//! discipline in the thread module still holds.

use crate::error::{Error, Result};

use std::cell::Cell;
use std::mem;
use std::ptr;

/// Handle to a host thread, kept so the retiring side can join it before the
/// stack underneath it is unmapped.
#[derive(Debug, Clone, Copy)]
pub struct HostThread(libc::pthread_t);

// pthread_t is a plain identifier on Linux.
unsafe impl Send for HostThread {}

/// Stack placement forwarded to the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpawnOptions {
    /// Exact stack region to run on, lowest usable address and size.
    pub stack: Option<(usize, usize)>,
    /// Stack size hint when the host picks the placement.
    pub stack_size: Option<usize>,
    /// Guard size hint when the host picks the placement.
    pub guard_size: Option<usize>,
}

/// Start a host thread running `entry(arg)`.
///
/// # Safety
///
/// `arg` must stay valid until `entry` takes ownership of it, and any stack
/// region in `options` must stay mapped until the thread is joined.
pub unsafe fn spawn(
    entry: extern "C" fn(*mut libc::c_void) -> *mut libc::c_void,
    arg: *mut libc::c_void,
    options: &SpawnOptions,
) -> Result<HostThread> {
    // SAFETY: attr is initialized before every use and destroyed on all
    // paths; the stack contract is the caller's per the function contract.
    unsafe {
        let mut attr: libc::pthread_attr_t = mem::zeroed();
        if libc::pthread_attr_init(&raw mut attr) != 0 {
            return Err(Error::NoResources);
        }
        let mut rc = 0;
        if let Some((base, size)) = options.stack {
            rc = libc::pthread_attr_setstack(&raw mut attr, base as *mut libc::c_void, size);
        } else {
            if let Some(size) = options.stack_size {
                rc = libc::pthread_attr_setstacksize(&raw mut attr, size);
            }
            if rc == 0 {
                if let Some(guard) = options.guard_size {
                    rc = libc::pthread_attr_setguardsize(&raw mut attr, guard);
                }
            }
        }
        if rc != 0 {
            libc::pthread_attr_destroy(&raw mut attr);
            return Err(Error::InvalidArgument);
        }
        let mut handle: libc::pthread_t = mem::zeroed();
        let rc = libc::pthread_create(&raw mut handle, &raw const attr, entry, arg);
        libc::pthread_attr_destroy(&raw mut attr);
        match rc {
            0 => Ok(HostThread(handle)),
            libc::EAGAIN => Err(Error::NoResources),
            libc::ENOMEM => Err(Error::OutOfMemory),
            _ => Err(Error::InvalidArgument),
        }
    }
}

/// Wait for a host thread to finish. Must precede unmapping its stack.
pub fn join(thread: HostThread) {
    // SAFETY: each handle is joined or detached exactly once; the lifecycle
    // word in the owning record serializes the callers.
    unsafe {
        libc::pthread_join(thread.0, ptr::null_mut());
    }
}

/// Tell the host it may reclaim the thread's resources when it exits.
pub fn detach(thread: HostThread) {
    // SAFETY: see `join`.
    unsafe {
        libc::pthread_detach(thread.0);
    }
}

thread_local! {
    static CACHED_TID: Cell<u32> = const { Cell::new(0) };
}

/// Kernel thread id of the caller.
#[must_use]
pub fn current_tid() -> u32 {
    CACHED_TID.with(|cached| {
        let tid = cached.get();
        if tid != 0 {
            return tid;
        }
        // SAFETY: gettid takes no arguments and cannot fail.
        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as u32;
        cached.set(tid);
        tid
    })
}

/// System page size in bytes.
#[must_use]
pub fn page_size() -> usize {
    // SAFETY: sysconf with a valid name.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 4096 } else { size as usize }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn tid_is_stable_within_a_thread() {
        assert_eq!(current_tid(), current_tid());
        assert_ne!(current_tid(), 0);
    }

    #[test]
    fn tids_differ_across_threads() {
        let here = current_tid();
        let there = thread::spawn(current_tid).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn page_size_is_a_power_of_two() {
        let page = page_size();
        assert!(page.is_power_of_two());
    }
}
