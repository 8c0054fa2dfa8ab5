//! Thread-local storage keys.
//!
//! Keys come from a fixed-size global registry of sequence numbers. The low
//! bit of a slot's sequence says whether it is live: creation bumps an even
//! sequence to odd, deletion bumps it back to even, and both bumps are single
//! compare-exchanges, so create and delete never take a lock. Each thread
//! stores, per slot, the sequence it wrote its value under; a value is only
//! visible while that stamp still matches the registry, which makes deletion
//! invalidate every thread's value at once without touching any thread.

use crate::error::{Error, Result};
use crate::thread::{self, Thread};

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Number of keys the registry offers.
pub const KEYS_MAX: usize = 128;

/// Destructor passes made at thread exit before remaining values are dropped.
pub const DESTRUCTOR_ITERATIONS: usize = 4;

/// Destructor invoked with the thread's value at thread exit.
pub type KeyDestructor = extern "C" fn(usize);

// Distinguishes a real key from a zeroed or garbage handle.
const KEY_VALID_BIT: u32 = 1 << 31;

const IN_USE_BIT: u32 = 1;

/// Handle to a live registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Key(u32);

impl Key {
    /// Raw bits for carrying the handle across a C boundary.
    #[must_use]
    pub const fn to_raw(self) -> u32 {
        self.0
    }

    /// Rebuild a handle from raw bits. Garbage bits fail validation.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

struct RegistrySlot {
    sequence: AtomicU32,
    destructor: AtomicUsize,
}

impl RegistrySlot {
    const fn new() -> Self {
        Self { sequence: AtomicU32::new(0), destructor: AtomicUsize::new(0) }
    }
}

static REGISTRY: [RegistrySlot; KEYS_MAX] = [const { RegistrySlot::new() }; KEYS_MAX];

/// Per-thread storage for one key, held inside the thread record.
#[derive(Debug)]
pub(crate) struct KeySlot {
    sequence: AtomicU32,
    value: AtomicUsize,
}

impl KeySlot {
    pub(crate) const fn new() -> Self {
        Self { sequence: AtomicU32::new(0), value: AtomicUsize::new(0) }
    }
}

/// Allocate a key, optionally with a destructor run at thread exit.
pub fn create(destructor: Option<KeyDestructor>) -> Result<Key> {
    for (index, slot) in REGISTRY.iter().enumerate() {
        let sequence = slot.sequence.load(Ordering::Relaxed);
        if sequence & IN_USE_BIT != 0 {
            continue;
        }
        if slot
            .sequence
            .compare_exchange(
                sequence,
                sequence.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            let routine = destructor.map_or(0, |routine| routine as usize);
            slot.destructor.store(routine, Ordering::Release);
            return Ok(Key(index as u32 | KEY_VALID_BIT));
        }
    }
    Err(Error::NoResources)
}

/// Release a key. Values stored under it become invisible everywhere; its
/// destructor no longer runs.
pub fn delete(key: Key) -> Result<()> {
    let slot = registry_slot(key)?;
    let sequence = slot.sequence.load(Ordering::Relaxed);
    if sequence & IN_USE_BIT == 0 {
        return Err(Error::InvalidArgument);
    }
    slot.destructor.store(0, Ordering::Relaxed);
    slot.sequence
        .compare_exchange(
            sequence,
            sequence.wrapping_add(1),
            Ordering::Release,
            Ordering::Relaxed,
        )
        .map(|_| ())
        .map_err(|_| Error::InvalidArgument)
}

/// The calling thread's value for `key`, or zero when none was set.
///
/// An invalid or deleted key reads as zero rather than failing, so readers
/// need no error path.
#[must_use]
pub fn get(key: Key) -> usize {
    let Ok(slot) = registry_slot(key) else {
        return 0;
    };
    let sequence = slot.sequence.load(Ordering::Acquire);
    if sequence & IN_USE_BIT == 0 {
        return 0;
    }
    thread::with_current(|current| {
        let local = &current.key_slots()[key_index(key)];
        if local.sequence.load(Ordering::Relaxed) == sequence {
            local.value.load(Ordering::Relaxed)
        } else {
            0
        }
    })
}

/// Set the calling thread's value for `key`.
pub fn set(key: Key, value: usize) -> Result<()> {
    let slot = registry_slot(key)?;
    let sequence = slot.sequence.load(Ordering::Acquire);
    if sequence & IN_USE_BIT == 0 {
        return Err(Error::InvalidArgument);
    }
    thread::with_current(|current| {
        let local = &current.key_slots()[key_index(key)];
        local.sequence.store(sequence, Ordering::Relaxed);
        local.value.store(value, Ordering::Relaxed);
    });
    Ok(())
}

/// Run key destructors for an exiting thread.
///
/// Destructors may set further values; passes repeat until a pass runs
/// nothing or the iteration limit is hit. Each value is cleared before its
/// destructor runs so a destructor reading its own key sees empty.
pub(crate) fn run_destructors(current: &Thread) {
    for _ in 0..DESTRUCTOR_ITERATIONS {
        let mut ran = 0usize;
        for (index, slot) in REGISTRY.iter().enumerate() {
            let sequence = slot.sequence.load(Ordering::Acquire);
            if sequence & IN_USE_BIT == 0 {
                continue;
            }
            let routine = slot.destructor.load(Ordering::Acquire);
            let local = &current.key_slots()[index];
            if local.sequence.load(Ordering::Relaxed) != sequence {
                continue;
            }
            let value = local.value.load(Ordering::Relaxed);
            if value == 0 {
                continue;
            }
            local.value.store(0, Ordering::Relaxed);
            if routine != 0 {
                // SAFETY: the registry only ever stores addresses of
                // KeyDestructor functions.
                let destructor: KeyDestructor =
                    unsafe { std::mem::transmute::<usize, KeyDestructor>(routine) };
                destructor(value);
                ran += 1;
            }
        }
        if ran == 0 {
            break;
        }
    }
}

fn key_index(key: Key) -> usize {
    (key.0 & !KEY_VALID_BIT) as usize
}

fn registry_slot(key: Key) -> Result<&'static RegistrySlot> {
    if key.0 & KEY_VALID_BIT == 0 {
        return Err(Error::InvalidArgument);
    }
    REGISTRY.get(key_index(key)).ok_or(Error::InvalidArgument)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_round_trip() {
        let key = create(None).unwrap();
        assert_eq!(get(key), 0);
        set(key, 0xDEAD).unwrap();
        assert_eq!(get(key), 0xDEAD);
        delete(key).unwrap();
    }

    #[test]
    fn values_are_per_thread() {
        let key = create(None).unwrap();
        set(key, 11).unwrap();
        std::thread::spawn(move || {
            assert_eq!(get(key), 0);
            set(key, 22).unwrap();
            assert_eq!(get(key), 22);
        })
        .join()
        .unwrap();
        assert_eq!(get(key), 11);
        delete(key).unwrap();
    }

    #[test]
    fn deletion_hides_stale_values() {
        let key = create(None).unwrap();
        set(key, 77).unwrap();
        delete(key).unwrap();
        assert_eq!(get(key), 0);
        assert_eq!(set(key, 1), Err(Error::InvalidArgument));
        assert_eq!(delete(key), Err(Error::InvalidArgument));
    }

    #[test]
    fn reused_slot_does_not_leak_old_values() {
        let first = create(None).unwrap();
        set(first, 99).unwrap();
        delete(first).unwrap();
        // The slot may be reissued under a new sequence; the old value must
        // stay invisible.
        let second = create(None).unwrap();
        assert_eq!(get(second), 0);
        delete(second).unwrap();
    }

    #[test]
    fn garbage_handles_are_rejected() {
        let bogus = Key(5);
        assert_eq!(get(bogus), 0);
        assert_eq!(set(bogus, 1), Err(Error::InvalidArgument));
        assert_eq!(delete(bogus), Err(Error::InvalidArgument));
    }
}
