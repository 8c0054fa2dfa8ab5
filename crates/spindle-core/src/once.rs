//! One-time initialization.
//!
//! A once control is a three-state word: not started, running, complete. The
//! thread that wins the not-started to running race runs the routine; losers
//! sleep on the word until it goes complete. The winner runs under a pushed
//! cleanup handler so a cancellation inside the routine rolls the control
//! back to not started and wakes the losers to elect a new winner.

use crate::cleanup::{self, CleanupEntry};
use crate::error::Result;
use crate::sys::userlock;

use std::sync::atomic::{AtomicU32, Ordering};

const NOT_STARTED: u32 = 0;
const RUNNING: u32 = 1;
const COMPLETE: u32 = 2;

/// Initialization routine run at most once per control.
pub type OnceRoutine = extern "C-unwind" fn();

/// A one-time initialization control. Usable in statics.
#[derive(Debug)]
pub struct Once {
    state: AtomicU32,
}

impl Default for Once {
    fn default() -> Self {
        Self::new()
    }
}

extern "C" fn roll_back(argument: usize) {
    // SAFETY: the argument is the address of the live control whose winner is
    // unwinding.
    let state = unsafe { &*(argument as *const AtomicU32) };
    state.store(NOT_STARTED, Ordering::Release);
    userlock::wake(state, userlock::WAKE_ALL, true);
}

impl Once {
    #[must_use]
    pub const fn new() -> Self {
        Self { state: AtomicU32::new(NOT_STARTED) }
    }

    /// Run `routine` if no call on this control has completed it yet.
    ///
    /// Every caller returns only after some invocation of `routine` has
    /// finished.
    pub fn call(&self, routine: OnceRoutine) -> Result<()> {
        loop {
            match self.state.compare_exchange(
                NOT_STARTED,
                RUNNING,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let mut guard =
                        CleanupEntry::new(roll_back, (&raw const self.state) as usize);
                    // SAFETY: the entry outlives the pop below.
                    unsafe {
                        cleanup::push(&mut guard);
                    }
                    routine();
                    cleanup::pop(false);
                    self.state.store(COMPLETE, Ordering::Release);
                    userlock::wake(&self.state, userlock::WAKE_ALL, true);
                    return Ok(());
                }
                Err(COMPLETE) => return Ok(()),
                Err(current) => {
                    // A winner is running; sleep until the word moves.
                    let _ = userlock::wait(&self.state, current, None, true);
                }
            }
        }
    }

    /// Whether the routine has completed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETE
    }
}
