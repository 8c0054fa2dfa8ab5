//! Counting semaphores.
//!
//! The count lives in a single word as a signed value shifted up one bit,
//! with the process-shared flag in the low bit. A count of minus one is the
//! waited-on sentinel: the first waiter that finds the semaphore empty
//! publishes it, and any post that observes a negative count knows sleepers
//! exist and wakes them all. Waiters that lose the ensuing race re-publish
//! the sentinel and go back to sleep.

use crate::cancel;
use crate::error::{Error, Result};
use crate::sys::time::{Clock, Timespec};
use crate::sys::{time, userlock};

use std::sync::atomic::{AtomicU32, Ordering};

const SHARED_BIT: u32 = 1 << 0;
const COUNT_SHIFT: u32 = 1;

/// Highest count the encoding can carry.
pub const SEM_VALUE_MAX: i32 = i32::MAX >> COUNT_SHIFT;

const WAITED_ON: i32 = -1;

/// A futex-backed counting semaphore.
#[derive(Debug)]
pub struct Semaphore {
    state: AtomicU32,
}

impl Semaphore {
    /// A semaphore holding `count` permits.
    pub fn new(count: u32, shared: bool) -> Result<Self> {
        if count > SEM_VALUE_MAX as u32 {
            return Err(Error::InvalidArgument);
        }
        Ok(Self { state: AtomicU32::new(encode(count as i32, shared)) })
    }

    /// Take a permit, blocking until one is posted.
    pub fn wait(&self) -> Result<()> {
        self.wait_inner(None)
    }

    /// Take a permit with a real-time-clock deadline.
    pub fn timedwait(&self, deadline: &Timespec) -> Result<()> {
        if !deadline.is_valid() {
            return Err(Error::InvalidArgument);
        }
        self.wait_inner(Some(deadline))
    }

    /// Take a permit without blocking.
    pub fn trywait(&self) -> Result<()> {
        loop {
            let word = self.state.load(Ordering::Relaxed);
            let count = decode(word);
            if count <= 0 {
                return Err(Error::Busy);
            }
            if self
                .state
                .compare_exchange(
                    word,
                    encode(count - 1, is_shared(word)),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Release one permit.
    ///
    /// A post that finds sleepers leaves the count at one and wakes them all;
    /// the winners decrement and the rest go back to sleep. A post at the
    /// maximum count still wakes sleepers before reporting overflow.
    pub fn post(&self) -> Result<()> {
        loop {
            let word = self.state.load(Ordering::Relaxed);
            let count = decode(word);
            let shared = is_shared(word);
            if count == SEM_VALUE_MAX {
                userlock::wake(&self.state, userlock::WAKE_ALL, !shared);
                return Err(Error::WouldOverflow);
            }
            let next = if count < 0 { 1 } else { count + 1 };
            if self
                .state
                .compare_exchange(word, encode(next, shared), Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                if count < 0 {
                    userlock::wake(&self.state, userlock::WAKE_ALL, !shared);
                }
                return Ok(());
            }
        }
    }

    /// Current count, clamped to zero while waiters are parked.
    #[must_use]
    pub fn value(&self) -> i32 {
        decode(self.state.load(Ordering::Relaxed)).max(0)
    }

    /// Verify no thread is waiting on the semaphore.
    pub fn destroy(&self) -> Result<()> {
        if decode(self.state.load(Ordering::Relaxed)) < 0 {
            return Err(Error::Busy);
        }
        Ok(())
    }

    /// Raw state word, for diagnostics.
    #[must_use]
    pub fn raw_state(&self) -> u32 {
        self.state.load(Ordering::Relaxed)
    }

    fn wait_inner(&self, deadline: Option<&Timespec>) -> Result<()> {
        loop {
            let word = self.state.load(Ordering::Relaxed);
            let count = decode(word);
            let shared = is_shared(word);
            if count > 0 {
                if self
                    .state
                    .compare_exchange(
                        word,
                        encode(count - 1, shared),
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }
            cancel::point();
            let sentinel = encode(WAITED_ON, shared);
            if word != sentinel
                && self
                    .state
                    .compare_exchange(word, sentinel, Ordering::Relaxed, Ordering::Relaxed)
                    .is_err()
            {
                continue;
            }
            let timeout = match deadline {
                Some(deadline) => Some(time::remaining_ms(Clock::Realtime, deadline)?),
                None => None,
            };
            match userlock::wait(&self.state, sentinel, timeout, !shared) {
                Ok(())
                | Err(userlock::WaitError::Stale)
                | Err(userlock::WaitError::Interrupted) => {}
                Err(userlock::WaitError::TimedOut) => return Err(Error::TimedOut),
            }
        }
    }
}

fn encode(count: i32, shared: bool) -> u32 {
    let word = (count << COUNT_SHIFT) as u32;
    if shared { word | SHARED_BIT } else { word }
}

fn decode(word: u32) -> i32 {
    // Arithmetic shift recovers the sign of the sentinel.
    (word as i32) >> COUNT_SHIFT
}

fn is_shared(word: u32) -> bool {
    word & SHARED_BIT != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn encoding_round_trips_and_keeps_the_flag() {
        assert_eq!(decode(encode(0, false)), 0);
        assert_eq!(decode(encode(5, true)), 5);
        assert_eq!(decode(encode(WAITED_ON, false)), WAITED_ON);
        assert!(is_shared(encode(WAITED_ON, true)));
        assert_eq!(decode(encode(SEM_VALUE_MAX, false)), SEM_VALUE_MAX);
    }

    #[test]
    fn over_limit_initial_count_is_rejected() {
        assert_eq!(Semaphore::new(SEM_VALUE_MAX as u32 + 1, false).err(), Some(Error::InvalidArgument));
    }

    #[test]
    fn trywait_on_empty_is_busy() {
        let sem = Semaphore::new(1, false).unwrap();
        sem.trywait().unwrap();
        assert_eq!(sem.trywait(), Err(Error::Busy));
        sem.post().unwrap();
        assert_eq!(sem.value(), 1);
    }

    #[test]
    fn value_clamps_the_sentinel_to_zero() {
        let sem = Semaphore::new(0, false).unwrap();
        assert_eq!(sem.value(), 0);
        let deadline = time::deadline_after_ms(Clock::Realtime, 20);
        assert_eq!(sem.timedwait(&deadline), Err(Error::TimedOut));
        assert_eq!(sem.value(), 0);
        assert_eq!(sem.destroy(), Err(Error::Busy));
    }

    #[test]
    fn post_at_the_limit_overflows() {
        let sem = Semaphore::new(SEM_VALUE_MAX as u32, false).unwrap();
        assert_eq!(sem.post(), Err(Error::WouldOverflow));
        assert_eq!(sem.value(), SEM_VALUE_MAX);
    }

    #[test]
    fn posts_release_exactly_their_permits() {
        let sem = Arc::new(Semaphore::new(0, false).unwrap());
        let taken = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::new();
        for _ in 0..4 {
            let sem = Arc::clone(&sem);
            let taken = Arc::clone(&taken);
            workers.push(thread::spawn(move || {
                for _ in 0..500 {
                    sem.wait().unwrap();
                    taken.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        for _ in 0..2_000 {
            sem.post().unwrap();
        }
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(taken.load(Ordering::Relaxed), 2_000);
        assert_eq!(sem.value(), 0);
    }

    #[test]
    fn post_wakes_a_parked_waiter() {
        let sem = Arc::new(Semaphore::new(0, false).unwrap());
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.wait().unwrap())
        };
        thread::sleep(Duration::from_millis(20));
        sem.post().unwrap();
        waiter.join().unwrap();
    }
}
