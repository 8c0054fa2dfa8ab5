//! Condition variables.
//!
//! A condition variable is a single 32-bit word: two flag bits at the bottom
//! and a 30-bit wakeup sequence above them. Signaling bumps the sequence and
//! wakes; waiting snapshots the word while the caller still holds its mutex,
//! releases the mutex, and sleeps only while the word still equals the
//! snapshot. A signal that lands between the release and the sleep leaves the
//! word changed, so the sleep fails immediately instead of missing the wake.
//!
//! Sequence wraparound after 2^30 signals is harmless: a waiter whose
//! snapshot collides with a wrapped value oversleeps at most until the next
//! signal, the same exposure every futex-sequence design accepts.

use crate::cancel;
use crate::error::{Error, Result};
use crate::mutex::Mutex;
use crate::sys::time::{Clock, Timespec};
use crate::sys::{time, userlock};

use std::sync::atomic::{AtomicU32, Ordering};

const SHARED_BIT: u32 = 1 << 0;
const MONOTONIC_BIT: u32 = 1 << 1;
const SEQUENCE_UNIT: u32 = 1 << 2;

/// Creation-time options for a [`Cond`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CondAttr {
    shared: bool,
    clock: Clock,
}

impl CondAttr {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn process_shared(&self) -> bool {
        self.shared
    }

    pub fn set_process_shared(&mut self, shared: bool) {
        self.shared = shared;
    }

    #[must_use]
    pub fn clock(&self) -> Clock {
        self.clock
    }

    /// Clock that timed waits on this variable measure their deadline on.
    pub fn set_clock(&mut self, clock: Clock) {
        self.clock = clock;
    }
}

/// A futex-backed condition variable.
#[derive(Debug)]
pub struct Cond {
    state: AtomicU32,
}

impl Default for Cond {
    fn default() -> Self {
        Self::new()
    }
}

impl Cond {
    /// A private, real-time-clock condition variable. Usable in statics.
    #[must_use]
    pub const fn new() -> Self {
        Self { state: AtomicU32::new(0) }
    }

    /// A condition variable configured from an attribute object.
    #[must_use]
    pub fn from_attr(attr: &CondAttr) -> Self {
        let mut word = 0;
        if attr.shared {
            word |= SHARED_BIT;
        }
        if attr.clock.is_monotonic() {
            word |= MONOTONIC_BIT;
        }
        Self { state: AtomicU32::new(word) }
    }

    /// Release `mutex`, sleep until signaled, and reacquire `mutex`.
    ///
    /// The caller must hold `mutex`. This is a cancellation point; a
    /// cancelled waiter reacquires the mutex before its exit unwinds, so
    /// cleanup handlers observe the same lock state as a normal return.
    pub fn wait(&self, mutex: &Mutex) -> Result<()> {
        self.wait_inner(mutex, None)
    }

    /// As [`Cond::wait`], giving up once `deadline` passes on the variable's
    /// configured clock. The mutex is reacquired even on timeout.
    pub fn timedwait(&self, mutex: &Mutex, deadline: &Timespec) -> Result<()> {
        if !deadline.is_valid() {
            return Err(Error::InvalidArgument);
        }
        self.wait_inner(mutex, Some(deadline))
    }

    /// Wake one waiter.
    pub fn signal(&self) {
        let word = self.state.fetch_add(SEQUENCE_UNIT, Ordering::Release);
        userlock::wake(&self.state, 1, word & SHARED_BIT == 0);
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        let word = self.state.fetch_add(SEQUENCE_UNIT, Ordering::Release);
        userlock::wake(&self.state, userlock::WAKE_ALL, word & SHARED_BIT == 0);
    }

    /// Retire the variable. Waiters still parked on it are the caller's bug;
    /// there is no waiter accounting to detect them with.
    pub fn destroy(&self) -> Result<()> {
        Ok(())
    }

    /// Raw state word, for diagnostics.
    #[must_use]
    pub fn raw_state(&self) -> u32 {
        self.state.load(Ordering::Relaxed)
    }

    fn wait_inner(&self, mutex: &Mutex, deadline: Option<&Timespec>) -> Result<()> {
        let snapshot = self.state.load(Ordering::Acquire);
        let private = snapshot & SHARED_BIT == 0;
        let clock =
            if snapshot & MONOTONIC_BIT != 0 { Clock::Monotonic } else { Clock::Realtime };

        mutex.unlock()?;
        let mut outcome = Ok(());
        loop {
            if cancel::pending() {
                break;
            }
            let timeout = match deadline {
                Some(deadline) => match time::remaining_ms(clock, deadline) {
                    Ok(ms) => Some(ms),
                    Err(error) => {
                        outcome = Err(error);
                        break;
                    }
                },
                None => None,
            };
            match userlock::wait(&self.state, snapshot, timeout, private) {
                // Woken, or the sequence already moved on.
                Ok(()) | Err(userlock::WaitError::Stale) => break,
                // A signal interrupted the sleep; re-arm with the same
                // snapshot so an intervening wake still stops the wait.
                Err(userlock::WaitError::Interrupted) => continue,
                Err(userlock::WaitError::TimedOut) => {
                    outcome = Err(Error::TimedOut);
                    break;
                }
            }
        }
        mutex.lock()?;
        cancel::point();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn attribute_bits_land_in_the_word() {
        assert_eq!(Cond::new().raw_state(), 0);
        let mut attr = CondAttr::new();
        attr.set_process_shared(true);
        attr.set_clock(Clock::Monotonic);
        assert_eq!(Cond::from_attr(&attr).raw_state(), SHARED_BIT | MONOTONIC_BIT);
    }

    #[test]
    fn signal_bumps_the_sequence_only() {
        let cond = Cond::new();
        cond.signal();
        cond.signal();
        assert_eq!(cond.raw_state(), 2 * SEQUENCE_UNIT);
    }

    #[test]
    fn timedwait_rejects_malformed_deadline() {
        let cond = Cond::new();
        let mutex = Mutex::new();
        let bad = Timespec::new(0, -1);
        assert_eq!(cond.timedwait(&mutex, &bad), Err(Error::InvalidArgument));
    }

    #[test]
    fn timedwait_times_out_and_reacquires_the_mutex() {
        let cond = Cond::new();
        let mutex = Mutex::new();
        mutex.lock().unwrap();
        let deadline = time::deadline_after_ms(Clock::Realtime, 30);
        assert_eq!(cond.timedwait(&mutex, &deadline), Err(Error::TimedOut));
        // Still held by us if reacquisition happened.
        assert_eq!(mutex.trylock(), Err(Error::Busy));
        mutex.unlock().unwrap();
    }

    #[test]
    fn signal_releases_a_predicate_waiter() {
        let cond = Arc::new(Cond::new());
        let mutex = Arc::new(Mutex::new());
        let ready = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let cond = Arc::clone(&cond);
            let mutex = Arc::clone(&mutex);
            let ready = Arc::clone(&ready);
            thread::spawn(move || {
                mutex.lock().unwrap();
                while ready.load(Ordering::Relaxed) == 0 {
                    cond.wait(&mutex).unwrap();
                }
                mutex.unlock().unwrap();
            })
        };

        thread::sleep(Duration::from_millis(20));
        mutex.lock().unwrap();
        ready.store(1, Ordering::Relaxed);
        cond.signal();
        mutex.unlock().unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn broadcast_releases_every_waiter() {
        let cond = Arc::new(Cond::new());
        let mutex = Arc::new(Mutex::new());
        let ready = Arc::new(AtomicUsize::new(0));
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let cond = Arc::clone(&cond);
            let mutex = Arc::clone(&mutex);
            let ready = Arc::clone(&ready);
            waiters.push(thread::spawn(move || {
                mutex.lock().unwrap();
                while ready.load(Ordering::Relaxed) == 0 {
                    cond.wait(&mutex).unwrap();
                }
                mutex.unlock().unwrap();
            }));
        }
        thread::sleep(Duration::from_millis(20));
        mutex.lock().unwrap();
        ready.store(1, Ordering::Relaxed);
        cond.broadcast();
        mutex.unlock().unwrap();
        for waiter in waiters {
            waiter.join().unwrap();
        }
    }

    #[test]
    fn wake_that_races_the_sleep_is_not_missed() {
        // Signal lands after the waiter snapshots but before it can sleep
        // long; the stale check must bound the wait.
        let cond = Arc::new(Cond::new());
        let mutex = Arc::new(Mutex::new());
        for _ in 0..50 {
            let waiter = {
                let cond = Arc::clone(&cond);
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || {
                    mutex.lock().unwrap();
                    let deadline = time::deadline_after_ms(Clock::Realtime, 200);
                    let result = cond.timedwait(&mutex, &deadline);
                    mutex.unlock().unwrap();
                    result
                })
            };
            thread::sleep(Duration::from_millis(1));
            cond.signal();
            // Either outcome is fine as long as it does not hang.
            let _ = waiter.join().unwrap();
        }
    }
}
