//! Cleanup handler stack.
//!
//! Each thread carries a singly linked stack of cleanup handlers threaded
//! through caller-owned storage; pushing and popping never allocate. The
//! stack drains in reverse push order when the thread exits, whether by
//! returning, calling [`crate::thread::exit`], or honoring a cancellation
//! request.

use crate::thread;

use std::ptr;

/// Routine invoked with its argument when a handler runs.
pub type CleanupRoutine = extern "C" fn(usize);

/// Caller-owned storage for one pushed handler.
///
/// The entry must stay at a fixed address between push and pop, so hold it in
/// a local and do not move it. The layout is fixed so C callers can reserve
/// the storage themselves.
#[derive(Debug)]
#[repr(C)]
pub struct CleanupEntry {
    routine: CleanupRoutine,
    argument: usize,
    previous: *mut CleanupEntry,
}

impl CleanupEntry {
    #[must_use]
    pub fn new(routine: CleanupRoutine, argument: usize) -> Self {
        Self { routine, argument, previous: ptr::null_mut() }
    }
}

/// Push `entry` onto the calling thread's cleanup stack.
///
/// # Safety
///
/// `entry` must outlive the matching [`pop`] in the same function scope, and
/// pushes and pops must nest.
pub unsafe fn push(entry: &mut CleanupEntry) {
    thread::with_current(|current| {
        // SAFETY: the head pointer is touched only by its own thread.
        unsafe {
            let head = current.cleanup_head();
            entry.previous = *head;
            *head = ptr::from_mut(entry);
        }
    });
}

/// Pop the most recently pushed handler, running it when `execute` is set.
pub fn pop(execute: bool) {
    let top = thread::with_current(|current| {
        // SAFETY: the head pointer is touched only by its own thread.
        unsafe {
            let head = current.cleanup_head();
            let top = *head;
            if !top.is_null() {
                *head = (*top).previous;
            }
            top
        }
    });
    if top.is_null() {
        return;
    }
    // SAFETY: the entry was pinned by the push contract and is no longer
    // reachable from the stack.
    let (routine, argument) = unsafe { ((*top).routine, (*top).argument) };
    if execute {
        routine(argument);
    }
}

/// Drain the whole stack, running every handler. Exit path only.
pub(crate) fn run_all(current: &thread::Thread) {
    // SAFETY: called on the exiting thread itself, after user code stopped.
    unsafe {
        let head = current.cleanup_head();
        while !(*head).is_null() {
            let top = *head;
            *head = (*top).previous;
            ((*top).routine)((*top).argument);
        }
    }
}
