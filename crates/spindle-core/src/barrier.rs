//! Barriers.
//!
//! A barrier combines an internal mutex, an arrival counter, and a state word
//! whose upper bits are a generation number. Arrivals count up under the
//! mutex; the thread that completes the party resets the counter, bumps the
//! generation, and wakes everyone. Waiters sleep on the generation they
//! snapshot while still holding the mutex, so a release that slips in before
//! they reach the kernel fails the sleep immediately and counts as crossing.

use crate::error::{Error, Result};
use crate::mutex::Mutex;
use crate::sys::userlock;

use std::sync::atomic::{AtomicU32, Ordering};

const SHARED_BIT: u32 = 1 << 0;
const GENERATION_UNIT: u32 = 1 << 1;

/// Creation-time options for a [`Barrier`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BarrierAttr {
    shared: bool,
}

impl BarrierAttr {
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
}

/// Distinguishes the one serial thread each crossing elects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierWaitResult {
    /// This thread completed the party; run the one-per-crossing work here.
    Serial,
    /// An ordinary crossing.
    Waiter,
}

/// A futex-backed barrier.
#[derive(Debug)]
pub struct Barrier {
    state: AtomicU32,
    threshold: u32,
    waiting: AtomicU32,
    guard: Mutex,
}

impl Barrier {
    /// A barrier released once `threshold` threads arrive.
    pub fn new(threshold: u32, attr: &BarrierAttr) -> Result<Self> {
        if threshold == 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(Self {
            state: AtomicU32::new(if attr.shared { SHARED_BIT } else { 0 }),
            threshold,
            waiting: AtomicU32::new(0),
            guard: Mutex::new(),
        })
    }

    /// Arrive and block until the party is complete.
    pub fn wait(&self) -> Result<BarrierWaitResult> {
        self.guard.lock()?;
        let arrived = self.waiting.load(Ordering::Relaxed) + 1;
        if arrived == self.threshold {
            self.waiting.store(0, Ordering::Relaxed);
            let word = self.state.fetch_add(GENERATION_UNIT, Ordering::Release);
            userlock::wake(&self.state, userlock::WAKE_ALL, word & SHARED_BIT == 0);
            self.guard.unlock()?;
            return Ok(BarrierWaitResult::Serial);
        }
        self.waiting.store(arrived, Ordering::Relaxed);
        // Snapshot the generation before releasing the mutex; any later
        // release changes the word and fails the sleep below.
        let snapshot = self.state.load(Ordering::Acquire);
        let private = snapshot & SHARED_BIT == 0;
        self.guard.unlock()?;
        loop {
            match userlock::wait(&self.state, snapshot, None, private) {
                Ok(()) | Err(userlock::WaitError::Stale) => {
                    if self.state.load(Ordering::Acquire) != snapshot {
                        return Ok(BarrierWaitResult::Waiter);
                    }
                    // Spurious wake inside the same generation.
                }
                Err(_) => {}
            }
        }
    }

    /// Verify no thread is waiting inside the barrier.
    pub fn destroy(&self) -> Result<()> {
        self.guard.lock()?;
        let busy = self.waiting.load(Ordering::Relaxed) != 0;
        self.guard.unlock()?;
        if busy { Err(Error::Busy) } else { Ok(()) }
    }

    /// Raw state word, for diagnostics.
    #[must_use]
    pub fn raw_state(&self) -> u32 {
        self.state.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn zero_threshold_is_rejected() {
        assert!(Barrier::new(0, &BarrierAttr::new()).is_err());
    }

    #[test]
    fn single_thread_barrier_is_always_serial() {
        let barrier = Barrier::new(1, &BarrierAttr::new()).unwrap();
        assert_eq!(barrier.wait().unwrap(), BarrierWaitResult::Serial);
        assert_eq!(barrier.wait().unwrap(), BarrierWaitResult::Serial);
        assert_eq!(barrier.raw_state(), 2 * GENERATION_UNIT);
    }

    #[test]
    fn each_crossing_elects_one_serial_thread() {
        const PARTY: usize = 4;
        const ROUNDS: usize = 25;
        let barrier = Arc::new(Barrier::new(PARTY as u32, &BarrierAttr::new()).unwrap());
        let serial = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::new();
        for _ in 0..PARTY {
            let barrier = Arc::clone(&barrier);
            let serial = Arc::clone(&serial);
            workers.push(thread::spawn(move || {
                for _ in 0..ROUNDS {
                    if barrier.wait().unwrap() == BarrierWaitResult::Serial {
                        serial.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(serial.load(Ordering::Relaxed), ROUNDS);
        assert_eq!(barrier.raw_state(), (ROUNDS as u32) * GENERATION_UNIT);
    }

    #[test]
    fn idle_barrier_destroys_cleanly() {
        let barrier = Barrier::new(3, &BarrierAttr::new()).unwrap();
        barrier.destroy().unwrap();
    }
}
