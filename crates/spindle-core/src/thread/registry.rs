//! Global thread list.
//!
//! Every live record the runtime knows about sits in one mutex-guarded list.
//! Lookups resolve a [`ThreadId`](super::ThreadId) by address so a stale or
//! forged id fails cleanly instead of dereferencing garbage. The credential
//! broadcast snapshots the whole list while holding the lock, which is why
//! the guard is exposed as a scoped visitor rather than a lock handle.

use super::Thread;
use crate::mutex::Mutex;

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::Arc;

struct ThreadList {
    guard: Mutex,
    threads: UnsafeCell<Vec<Arc<Thread>>>,
}

// The vector is only touched with the guard held.
unsafe impl Sync for ThreadList {}

static LIST: ThreadList = ThreadList { guard: Mutex::new(), threads: UnsafeCell::new(Vec::new()) };

fn with_list<R>(visit: impl FnOnce(&mut Vec<Arc<Thread>>) -> R) -> R {
    LIST.guard.acquire();
    // SAFETY: the guard is held for the duration of the visit.
    let result = visit(unsafe { &mut *LIST.threads.get() });
    let _ = LIST.guard.unlock();
    result
}

/// Publish a new record.
pub(crate) fn insert(record: Arc<Thread>) {
    with_list(|threads| threads.push(record));
}

/// Drop the record from the list. Harmless if it was already removed.
pub(crate) fn remove(record: &Thread) {
    with_list(|threads| {
        threads.retain(|entry| !ptr::eq(Arc::as_ptr(entry), ptr::from_ref(record)));
    });
}

/// Resolve a record address back to its list entry.
pub(crate) fn find(address: usize) -> Option<Arc<Thread>> {
    with_list(|threads| {
        threads
            .iter()
            .find(|entry| Arc::as_ptr(entry) as usize == address)
            .map(Arc::clone)
    })
}

/// Visit every record with the list locked.
///
/// Nothing in `visit` may create, join, or look up threads.
pub(crate) fn visit_all(visit: impl FnMut(&Arc<Thread>)) {
    with_list(|threads| threads.iter().for_each(visit));
}
