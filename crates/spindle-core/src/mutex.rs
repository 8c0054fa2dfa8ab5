//! Mutexes.
//!
//! A mutex is one 32-bit state word plus an owner word. The state word packs
//! everything the fast path needs: the lock state in the low two bits, the
//! recursion depth above it, the process-shared flag, and the mutex type in
//! the top bits. Acquisition and release are single compare-exchange or
//! exchange operations on that word; only contention touches the kernel.
//!
//! # State word layout
//!
//! ```text
//! bits 31..30  type        0 normal, 1 recursive, 2 errorcheck
//! bit  29      shared      cross-process when set
//! bits 17..2   recursion   additional acquisitions beyond the first
//! bits 1..0    lock state  0 unlocked, 1 locked, 2 locked with waiters
//! ```
//!
//! Normal mutexes skip owner tracking entirely and acquire straight into the
//! locked-with-waiters state, trading one possibly spurious wake at release
//! for a second atomic on the contended acquire path. Recursive and
//! errorcheck mutexes stamp the owner's kernel tid into the auxiliary word
//! while held.

use crate::cancel;
use crate::error::{Error, Result};
use crate::sys::time::{Clock, Timespec};
use crate::sys::{host, time, userlock};

use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicU32, Ordering};

const STATE_UNLOCKED: u32 = 0;
const STATE_LOCKED: u32 = 1;
const STATE_LOCKED_WAITERS: u32 = 2;
const STATE_MASK: u32 = 0x3;

const COUNT_SHIFT: u32 = 2;
const COUNT_UNIT: u32 = 1 << COUNT_SHIFT;
const COUNT_MAX: u32 = 0xFFFF;
const COUNT_MASK: u32 = COUNT_MAX << COUNT_SHIFT;

const SHARED_BIT: u32 = 1 << 29;
const TYPE_SHIFT: u32 = 30;
const TYPE_MASK: u32 = 0x3 << TYPE_SHIFT;

// The configuration bits must stay clear of the count field.
const_assert_eq!(COUNT_MASK & (SHARED_BIT | TYPE_MASK), 0);
const_assert_eq!(COUNT_MASK & STATE_MASK, 0);

/// Behavior on relock and unmatched unlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum MutexType {
    /// No owner tracking; relock deadlocks in the kernel.
    #[default]
    Normal = 0,
    /// Counted reacquisition by the owner.
    Recursive = 1,
    /// Relock and unmatched unlock are reported as errors.
    Errorcheck = 2,
}

/// Creation-time options for a [`Mutex`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MutexAttr {
    kind: MutexType,
    shared: bool,
}

impl MutexAttr {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn kind(&self) -> MutexType {
        self.kind
    }

    pub fn set_kind(&mut self, kind: MutexType) {
        self.kind = kind;
    }

    #[must_use]
    pub fn process_shared(&self) -> bool {
        self.shared
    }

    pub fn set_process_shared(&mut self, shared: bool) {
        self.shared = shared;
    }
}

/// A futex-backed mutex.
#[derive(Debug)]
pub struct Mutex {
    state: AtomicU32,
    owner: AtomicU32,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    /// A private, normal-type mutex. Usable in statics.
    #[must_use]
    pub const fn new() -> Self {
        Self::new_with(MutexType::Normal, false)
    }

    /// A mutex with explicit type and sharing. Usable in statics.
    #[must_use]
    pub const fn new_with(kind: MutexType, shared: bool) -> Self {
        let mut word = (kind as u32) << TYPE_SHIFT;
        if shared {
            word |= SHARED_BIT;
        }
        Self { state: AtomicU32::new(word), owner: AtomicU32::new(0) }
    }

    /// A mutex configured from an attribute object.
    #[must_use]
    pub fn from_attr(attr: &MutexAttr) -> Self {
        Self::new_with(attr.kind, attr.shared)
    }

    /// Acquire, blocking indefinitely.
    pub fn lock(&self) -> Result<()> {
        self.lock_inner(None)
    }

    /// Acquire, giving up once `deadline` passes on the real-time clock.
    pub fn timedlock(&self, deadline: &Timespec) -> Result<()> {
        if !deadline.is_valid() {
            return Err(Error::InvalidArgument);
        }
        self.lock_inner(Some(deadline))
    }

    /// Acquire without blocking.
    pub fn trylock(&self) -> Result<()> {
        let word = self.state.load(Ordering::Relaxed);
        match kind_of(word) {
            MutexType::Normal => {
                let unlocked = config_bits(word);
                self.state
                    .compare_exchange(
                        unlocked,
                        unlocked | STATE_LOCKED_WAITERS,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .map(|_| ())
                    .map_err(|_| Error::Busy)
            }
            MutexType::Recursive | MutexType::Errorcheck => self.try_owned(Error::Busy),
        }
    }

    /// Release.
    ///
    /// For recursive and errorcheck mutexes the caller must be the owner and
    /// only the outermost release publishes the unlock. Normal mutexes have
    /// no owner to verify.
    pub fn unlock(&self) -> Result<()> {
        let word = self.state.load(Ordering::Relaxed);
        match kind_of(word) {
            MutexType::Normal => {
                self.release(word);
                Ok(())
            }
            MutexType::Recursive | MutexType::Errorcheck => {
                if self.owner.load(Ordering::Relaxed) != host::current_tid() {
                    return Err(Error::NotOwner);
                }
                if count_of(word) > 0 {
                    self.state.fetch_sub(COUNT_UNIT, Ordering::Relaxed);
                    return Ok(());
                }
                self.owner.store(0, Ordering::Relaxed);
                self.release(word);
                Ok(())
            }
        }
    }

    /// Verify the mutex is idle and return it to its initial state.
    pub fn destroy(&self) -> Result<()> {
        self.trylock()?;
        self.owner.store(0, Ordering::Relaxed);
        let word = self.state.load(Ordering::Relaxed);
        self.state.store(config_bits(word), Ordering::Release);
        Ok(())
    }

    /// Raw state word, for diagnostics.
    #[must_use]
    pub fn raw_state(&self) -> u32 {
        self.state.load(Ordering::Relaxed)
    }

    /// Acquisitions held by the owner beyond the first.
    #[must_use]
    pub fn recursion_count(&self) -> u32 {
        count_of(self.state.load(Ordering::Relaxed))
    }

    /// Infallible lock for runtime-internal mutexes.
    ///
    /// Valid only on normal and recursive private mutexes, which cannot fail
    /// to lock when the caller respects the recursion limit.
    pub(crate) fn acquire(&self) {
        let _ = self.lock_inner(None);
    }

    /// Reset to the unlocked initial state, keeping type and sharing.
    ///
    /// Used on runtime-internal mutexes whose lock state is garbage in a
    /// forked child.
    pub(crate) fn reinit(&self) {
        let word = self.state.load(Ordering::Relaxed);
        self.owner.store(0, Ordering::Relaxed);
        self.state.store(config_bits(word), Ordering::Release);
    }

    fn lock_inner(&self, deadline: Option<&Timespec>) -> Result<()> {
        let word = self.state.load(Ordering::Relaxed);
        match kind_of(word) {
            MutexType::Normal => self.lock_normal(word, deadline),
            MutexType::Recursive | MutexType::Errorcheck => self.lock_owned(word, deadline),
        }
    }

    fn lock_normal(&self, word: u32, deadline: Option<&Timespec>) -> Result<()> {
        let config = config_bits(word);
        let held = config | STATE_LOCKED_WAITERS;
        let private = word & SHARED_BIT == 0;
        loop {
            if self
                .state
                .compare_exchange(config, held, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }
            cancel::point();
            self.block(held, deadline, private)?;
        }
    }

    fn lock_owned(&self, initial: u32, deadline: Option<&Timespec>) -> Result<()> {
        let me = host::current_tid();
        let private = initial & SHARED_BIT == 0;
        loop {
            let word = self.state.load(Ordering::Relaxed);
            if lock_state(word) == STATE_UNLOCKED {
                if self
                    .state
                    .compare_exchange(
                        word,
                        with_lock_state(word, STATE_LOCKED),
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    self.owner.store(me, Ordering::Relaxed);
                    return Ok(());
                }
                continue;
            }
            if self.owner.load(Ordering::Relaxed) == me {
                return self.relock(word, Error::Deadlock);
            }
            // Advertise a waiter, then sleep on the advertised value.
            let waiting = with_lock_state(word, STATE_LOCKED_WAITERS);
            if lock_state(word) == STATE_LOCKED
                && self
                    .state
                    .compare_exchange(word, waiting, Ordering::Relaxed, Ordering::Relaxed)
                    .is_err()
            {
                continue;
            }
            cancel::point();
            self.block(waiting, deadline, private)?;
        }
    }

    /// Relock by the current owner: count for recursive, error for the rest.
    fn relock(&self, word: u32, errorcheck_failure: Error) -> Result<()> {
        match kind_of(word) {
            MutexType::Recursive => {
                if count_of(word) == COUNT_MAX {
                    return Err(Error::WouldOverflow);
                }
                self.state.fetch_add(COUNT_UNIT, Ordering::Relaxed);
                Ok(())
            }
            _ => Err(errorcheck_failure),
        }
    }

    fn try_owned(&self, held_failure: Error) -> Result<()> {
        let me = host::current_tid();
        loop {
            let word = self.state.load(Ordering::Relaxed);
            if lock_state(word) == STATE_UNLOCKED {
                if self
                    .state
                    .compare_exchange(
                        word,
                        with_lock_state(word, STATE_LOCKED),
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    self.owner.store(me, Ordering::Relaxed);
                    return Ok(());
                }
                continue;
            }
            if self.owner.load(Ordering::Relaxed) == me {
                return self.relock(word, held_failure);
            }
            return Err(Error::Busy);
        }
    }

    fn release(&self, word: u32) {
        let config = config_bits(word);
        let previous = self.state.swap(config, Ordering::Release);
        if lock_state(previous) == STATE_LOCKED_WAITERS {
            userlock::wake(&self.state, 1, word & SHARED_BIT == 0);
        }
    }

    /// One kernel wait on the state word. Interrupts return to the caller's
    /// loop; a lapsed deadline fails with `TimedOut`.
    fn block(&self, expected: u32, deadline: Option<&Timespec>, private: bool) -> Result<()> {
        let timeout = match deadline {
            Some(deadline) => Some(time::remaining_ms(Clock::Realtime, deadline)?),
            None => None,
        };
        match userlock::wait(&self.state, expected, timeout, private) {
            Ok(()) | Err(userlock::WaitError::Stale) | Err(userlock::WaitError::Interrupted) => {
                Ok(())
            }
            Err(userlock::WaitError::TimedOut) => Err(Error::TimedOut),
        }
    }
}

/// Statically initialized recursive mutex for runtime-internal registries.
pub(crate) const fn internal_recursive() -> Mutex {
    Mutex::new_with(MutexType::Recursive, false)
}

fn lock_state(word: u32) -> u32 {
    word & STATE_MASK
}

fn with_lock_state(word: u32, state: u32) -> u32 {
    (word & !STATE_MASK) | state
}

fn count_of(word: u32) -> u32 {
    (word & COUNT_MASK) >> COUNT_SHIFT
}

/// Type and shared bits, with lock state and count cleared.
fn config_bits(word: u32) -> u32 {
    word & (TYPE_MASK | SHARED_BIT)
}

fn kind_of(word: u32) -> MutexType {
    match (word & TYPE_MASK) >> TYPE_SHIFT {
        1 => MutexType::Recursive,
        2 => MutexType::Errorcheck,
        _ => MutexType::Normal,
    }
}
