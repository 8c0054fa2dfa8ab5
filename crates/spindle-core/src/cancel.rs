//! Thread cancellation.
//!
//! A cancellation request sets a pending flag on the target record and pokes
//! the target with a reserved real-time signal so any kernel wait it sits in
//! returns early. Deferred targets act on the flag at cancellation points,
//! which every blocking wait in this crate passes through; asynchronous
//! targets act inside the signal handler itself. Acting means exiting the
//! thread with [`CANCELED_RETVAL`], running cleanup handlers and key
//! destructors on the way out.

use crate::error::{Error, Result};
use crate::thread;

use std::sync::atomic::Ordering;

/// Return value a cancelled thread's joiner observes.
pub const CANCELED_RETVAL: usize = usize::MAX;

pub(crate) const STATE_ENABLED: u32 = 0;
pub(crate) const STATE_DISABLED: u32 = 1;
const TYPE_DEFERRED: u32 = 0;
const TYPE_ASYNC: u32 = 1;

/// Whether cancellation requests are acted upon at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    Enabled,
    Disabled,
}

/// When an enabled thread acts on a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelType {
    /// Only at cancellation points.
    Deferred,
    /// Immediately, inside the delivery handler.
    Asynchronous,
}

/// Set the calling thread's cancel state, returning the previous one.
pub fn set_state(state: CancelState) -> Result<CancelState> {
    let raw = match state {
        CancelState::Enabled => STATE_ENABLED,
        CancelState::Disabled => STATE_DISABLED,
    };
    let previous = thread::with_current(|current| current.cancel_state.swap(raw, Ordering::AcqRel));
    // Enabling with a request already pending acts on it here.
    if raw == STATE_ENABLED {
        test();
    }
    Ok(if previous == STATE_DISABLED { CancelState::Disabled } else { CancelState::Enabled })
}

/// Set the calling thread's cancel type, returning the previous one.
pub fn set_type(kind: CancelType) -> Result<CancelType> {
    let raw = match kind {
        CancelType::Deferred => TYPE_DEFERRED,
        CancelType::Asynchronous => TYPE_ASYNC,
    };
    let previous = thread::with_current(|current| current.cancel_type.swap(raw, Ordering::AcqRel));
    if raw == TYPE_ASYNC {
        test();
    }
    Ok(if previous == TYPE_ASYNC { CancelType::Asynchronous } else { CancelType::Deferred })
}

/// Explicit cancellation point.
pub fn test() {
    if pending() {
        thread::exit_current(CANCELED_RETVAL);
    }
}

/// Cancellation point inside a blocking wait. Same as [`test`]; named so the
/// call sites read as protocol steps rather than user API.
pub(crate) fn point() {
    test();
}

/// True when the caller has an actionable request: pending and enabled.
pub(crate) fn pending() -> bool {
    thread::try_with_current(|current| {
        current.cancel_pending.load(Ordering::Acquire) != 0
            && current.cancel_state.load(Ordering::Acquire) == STATE_ENABLED
    })
    .unwrap_or(false)
}

/// Mark a request on `target` and interrupt it.
pub(crate) fn request(target: &thread::Thread) -> Result<()> {
    target.cancel_pending.store(1, Ordering::Release);
    let tid = target.tid.load(Ordering::Acquire);
    if tid == 0 {
        // Already exited; the request simply never fires.
        return Ok(());
    }
    match crate::sys::signal::send(tid, crate::sys::signal::cancel_signal()) {
        Ok(()) | Err(Error::NoSuchThread) => Ok(()),
        Err(error) => Err(error),
    }
}

/// Delivery handler for the cancellation signal.
pub(crate) extern "C-unwind" fn on_cancel_signal(_signal: libc::c_int) {
    let act = thread::try_with_current(|current| {
        current.cancel_pending.load(Ordering::Acquire) != 0
            && current.cancel_state.load(Ordering::Acquire) == STATE_ENABLED
            && current.cancel_type.load(Ordering::Acquire) == TYPE_ASYNC
    })
    .unwrap_or(false);
    if act {
        thread::exit_current(CANCELED_RETVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_and_type_swaps_report_previous_values() {
        assert_eq!(set_state(CancelState::Disabled).unwrap(), CancelState::Enabled);
        assert_eq!(set_state(CancelState::Enabled).unwrap(), CancelState::Disabled);
        assert_eq!(set_type(CancelType::Deferred).unwrap(), CancelType::Deferred);
        assert_eq!(set_type(CancelType::Deferred).unwrap(), CancelType::Deferred);
    }

    #[test]
    fn test_without_a_request_returns() {
        test();
    }
}
