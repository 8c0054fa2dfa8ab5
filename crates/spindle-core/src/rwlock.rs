//! Reader/writer locks.
//!
//! The state word is a plain reader count: zero means unlocked, the all-ones
//! value means write-locked, anything else counts the readers inside. Two
//! side counters track threads parked waiting for each side; a releasing
//! thread wakes everyone whenever either counter is nonzero and lets the
//! woken threads re-run their acquire loops. That favors simplicity over
//! strict fairness, matching the single-word design.

use crate::cancel;
use crate::error::{Error, Result};
use crate::sys::time::{Clock, Timespec};
use crate::sys::{host, time, userlock};

use std::sync::atomic::{AtomicU32, Ordering};

const WRITE_LOCKED: u32 = u32::MAX;
const MAX_READERS: u32 = WRITE_LOCKED - 1;

/// Creation-time options for a [`RwLock`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RwLockAttr {
    shared: bool,
}

impl RwLockAttr {
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

/// A futex-backed reader/writer lock.
#[derive(Debug)]
pub struct RwLock {
    state: AtomicU32,
    writer: AtomicU32,
    pending_readers: AtomicU32,
    pending_writers: AtomicU32,
    shared: bool,
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RwLock {
    /// A private reader/writer lock. Usable in statics.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
            writer: AtomicU32::new(0),
            pending_readers: AtomicU32::new(0),
            pending_writers: AtomicU32::new(0),
            shared: false,
        }
    }

    /// A lock configured from an attribute object.
    #[must_use]
    pub fn from_attr(attr: &RwLockAttr) -> Self {
        Self { shared: attr.shared, ..Self::new() }
    }

    /// Acquire for reading, blocking while a writer holds the lock.
    pub fn read_lock(&self) -> Result<()> {
        self.read_inner(None)
    }

    /// Acquire for reading with a real-time-clock deadline.
    pub fn timed_read_lock(&self, deadline: &Timespec) -> Result<()> {
        if !deadline.is_valid() {
            return Err(Error::InvalidArgument);
        }
        self.read_inner(Some(deadline))
    }

    /// Acquire for reading without blocking.
    pub fn try_read_lock(&self) -> Result<()> {
        loop {
            let word = self.state.load(Ordering::Relaxed);
            if word == WRITE_LOCKED {
                return Err(Error::Busy);
            }
            if word == MAX_READERS {
                return Err(Error::WouldOverflow);
            }
            if self
                .state
                .compare_exchange(word, word + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Acquire exclusively, blocking while anyone holds the lock.
    pub fn write_lock(&self) -> Result<()> {
        self.write_inner(None)
    }

    /// Acquire exclusively with a real-time-clock deadline.
    pub fn timed_write_lock(&self, deadline: &Timespec) -> Result<()> {
        if !deadline.is_valid() {
            return Err(Error::InvalidArgument);
        }
        self.write_inner(Some(deadline))
    }

    /// Acquire exclusively without blocking.
    pub fn try_write_lock(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(0, WRITE_LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.writer.store(host::current_tid(), Ordering::Relaxed);
            return Ok(());
        }
        Err(Error::Busy)
    }

    /// Release one hold, read or write.
    pub fn unlock(&self) -> Result<()> {
        let word = self.state.load(Ordering::Relaxed);
        if word == WRITE_LOCKED {
            if self.writer.load(Ordering::Relaxed) != host::current_tid() {
                return Err(Error::NotOwner);
            }
            self.writer.store(0, Ordering::Relaxed);
            self.state.store(0, Ordering::Release);
            self.wake_pending();
            return Ok(());
        }
        let mut current = word;
        loop {
            if current == 0 {
                return Err(Error::NotOwner);
            }
            match self.state.compare_exchange(
                current,
                current - 1,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    // Only the last reader out can unblock anyone.
                    if current == 1 {
                        self.wake_pending();
                    }
                    return Ok(());
                }
                Err(seen) => current = seen,
            }
        }
    }

    /// Verify the lock is idle and unwaited.
    pub fn destroy(&self) -> Result<()> {
        if self.state.load(Ordering::Relaxed) != 0
            || self.pending_readers.load(Ordering::Relaxed) != 0
            || self.pending_writers.load(Ordering::Relaxed) != 0
        {
            return Err(Error::Busy);
        }
        Ok(())
    }

    /// Raw state word, for diagnostics.
    #[must_use]
    pub fn raw_state(&self) -> u32 {
        self.state.load(Ordering::Relaxed)
    }

    fn read_inner(&self, deadline: Option<&Timespec>) -> Result<()> {
        let me = host::current_tid();
        loop {
            let word = self.state.load(Ordering::Relaxed);
            if word != WRITE_LOCKED {
                if word == MAX_READERS {
                    return Err(Error::WouldOverflow);
                }
                if self
                    .state
                    .compare_exchange(word, word + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }
            if self.writer.load(Ordering::Relaxed) == me {
                return Err(Error::Deadlock);
            }
            cancel::point();
            self.pending_readers.fetch_add(1, Ordering::Relaxed);
            let outcome = self.block(WRITE_LOCKED, deadline);
            self.pending_readers.fetch_sub(1, Ordering::Relaxed);
            outcome?;
        }
    }

    fn write_inner(&self, deadline: Option<&Timespec>) -> Result<()> {
        let me = host::current_tid();
        loop {
            let word = self.state.load(Ordering::Relaxed);
            if word == 0 {
                if self
                    .state
                    .compare_exchange(0, WRITE_LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    self.writer.store(me, Ordering::Relaxed);
                    return Ok(());
                }
                continue;
            }
            if word == WRITE_LOCKED && self.writer.load(Ordering::Relaxed) == me {
                return Err(Error::Deadlock);
            }
            cancel::point();
            self.pending_writers.fetch_add(1, Ordering::Relaxed);
            let outcome = self.block(word, deadline);
            self.pending_writers.fetch_sub(1, Ordering::Relaxed);
            outcome?;
        }
    }

    fn wake_pending(&self) {
        if self.pending_readers.load(Ordering::Relaxed) != 0
            || self.pending_writers.load(Ordering::Relaxed) != 0
        {
            userlock::wake(&self.state, userlock::WAKE_ALL, !self.shared);
        }
    }

    fn block(&self, expected: u32, deadline: Option<&Timespec>) -> Result<()> {
        let timeout = match deadline {
            Some(deadline) => Some(time::remaining_ms(Clock::Realtime, deadline)?),
            None => None,
        };
        match userlock::wait(&self.state, expected, timeout, !self.shared) {
            Ok(()) | Err(userlock::WaitError::Stale) | Err(userlock::WaitError::Interrupted) => {
                Ok(())
            }
            Err(userlock::WaitError::TimedOut) => Err(Error::TimedOut),
        }
    }
}
