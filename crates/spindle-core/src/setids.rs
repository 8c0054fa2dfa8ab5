//! Process-wide credential changes.
//!
//! The kernel's uid and gid syscalls act on one thread, but POSIX promises
//! that a credential change covers the whole process. The bridge is a signal
//! broadcast: the changing thread applies the new identity to itself, then
//! walks the thread list with the list locked, pointing a shared request
//! record at one target tid at a time and delivering the reserved setid
//! signal. Each target applies the same syscalls inside the handler, clears
//! the target word, and signals the producer's condition variable. Threads
//! that vanished mid-walk are skipped; a thread that simply never responds
//! exhausts the retry budget and takes the process down, since half-applied
//! credentials are not a state to keep running in.

use crate::cancel;
use crate::cond::Cond;
use crate::error::Result;
use crate::mutex::Mutex;
use crate::sys::time::Clock;
use crate::sys::{host, ident, signal, time};
use crate::thread;

use std::process;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

/// Delivery attempts per target before the producer gives up.
const DELIVERY_ATTEMPTS: u32 = 10;

/// Wait per attempt, in milliseconds.
const DELIVERY_WAIT_MS: u32 = 500;

/// One credential change in flight.
enum Payload {
    UserIds { real: u32, effective: u32, saved: u32 },
    GroupIds { real: u32, effective: u32, saved: u32 },
    SupplementaryGroups(Vec<u32>),
}

impl Payload {
    fn apply(&self) -> Result<()> {
        match self {
            Payload::UserIds { real, effective, saved } => {
                ident::set_user_ids(*real, *effective, *saved)
            }
            Payload::GroupIds { real, effective, saved } => {
                ident::set_group_ids(*real, *effective, *saved)
            }
            Payload::SupplementaryGroups(groups) => ident::set_supplementary_groups(groups),
        }
    }
}

struct Request {
    payload: Payload,
    /// Tid the producer is currently waiting on; zeroed by the handler.
    target: AtomicU32,
    guard: Mutex,
    done: Cond,
}

/// The request the handler reads. Non-null only during a broadcast.
static REQUEST: AtomicPtr<Request> = AtomicPtr::new(std::ptr::null_mut());

/// Serializes broadcasts; there is exactly one request slot.
static BROADCAST_GUARD: Mutex = Mutex::new();

/// Change the process's real, effective, and saved user ids.
pub fn set_user_ids(real: u32, effective: u32, saved: u32) -> Result<()> {
    broadcast(Payload::UserIds { real, effective, saved })
}

/// Change the process's real, effective, and saved group ids.
pub fn set_group_ids(real: u32, effective: u32, saved: u32) -> Result<()> {
    broadcast(Payload::GroupIds { real, effective, saved })
}

/// Replace the process's supplementary group list.
pub fn set_supplementary_groups(groups: &[u32]) -> Result<()> {
    broadcast(Payload::SupplementaryGroups(groups.to_vec()))
}

fn broadcast(payload: Payload) -> Result<()> {
    thread::ensure_runtime_init();
    // Applying locally first surfaces permission failures before any other
    // thread is disturbed; the peers then apply a change the kernel already
    // accepted once.
    payload.apply()?;

    // The per-target waits below are cancellation points; a cancel landing
    // mid-broadcast would abandon the request slot with targets pending.
    let previous = cancel::set_state(cancel::CancelState::Disabled)?;
    BROADCAST_GUARD.acquire();
    let outcome = broadcast_locked(payload);
    let _ = BROADCAST_GUARD.unlock();
    let _ = cancel::set_state(previous);
    outcome
}

fn broadcast_locked(payload: Payload) -> Result<()> {
    let request =
        Box::new(Request { payload, target: AtomicU32::new(0), guard: Mutex::new(), done: Cond::new() });
    let request_ptr = Box::into_raw(request);
    REQUEST.store(request_ptr, Ordering::Release);
    // SAFETY: the box stays live until the null store below.
    let request = unsafe { &*request_ptr };

    let me = host::current_tid();
    thread::visit_all_threads(|record| {
        let tid = record.tid.load(Ordering::Acquire);
        if tid == 0 || tid == me {
            return;
        }
        request.guard.acquire();
        request.target.store(tid, Ordering::Release);
        let mut attempts = 0;
        while request.target.load(Ordering::Acquire) != 0 {
            if signal::send(tid, signal::setid_signal()).is_err() {
                // Gone between the list walk and the delivery.
                request.target.store(0, Ordering::Release);
                break;
            }
            let deadline = time::deadline_after_ms(Clock::Realtime, DELIVERY_WAIT_MS);
            let _ = request.done.timedwait(&request.guard, &deadline);
            if request.target.load(Ordering::Acquire) == 0 {
                break;
            }
            attempts += 1;
            if attempts >= DELIVERY_ATTEMPTS {
                // A thread that cannot be reached leaves the process with
                // mixed credentials.
                process::abort();
            }
        }
        let _ = request.guard.unlock();
    });

    REQUEST.store(std::ptr::null_mut(), Ordering::Release);
    // SAFETY: no handler can reach the record once the pointer is null; any
    // handler already past the load is targeting a tid we finished waiting
    // on.
    drop(unsafe { Box::from_raw(request_ptr) });
    Ok(())
}

/// Delivery handler for the setid signal.
pub(crate) extern "C-unwind" fn on_setid_signal(_signal: libc::c_int) {
    let request_ptr = REQUEST.load(Ordering::Acquire);
    if request_ptr.is_null() {
        return;
    }
    // SAFETY: the producer keeps the record live while any target tid is
    // outstanding, and we only act when the target is us.
    let request = unsafe { &*request_ptr };
    if request.target.load(Ordering::Acquire) != host::current_tid() {
        return;
    }
    if request.payload.apply().is_err() {
        // The producer already applied this change; a refusal here means the
        // process has threads with different credentials.
        process::abort();
    }
    request.guard.acquire();
    request.target.store(0, Ordering::Release);
    request.done.signal();
    let _ = request.guard.unlock();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasserting_current_identity_broadcasts_cleanly() {
        let (real, effective, saved) = ident::user_ids();
        set_user_ids(real, effective, saved).unwrap();
        let (group_real, group_effective, group_saved) = ident::group_ids();
        set_group_ids(group_real, group_effective, group_saved).unwrap();
    }
}
