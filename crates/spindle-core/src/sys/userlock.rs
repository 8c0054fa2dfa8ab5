//! Address-keyed kernel blocking.
//!
//! The entire synchronization core rests on two calls: sleep on a 32-bit word
//! if it still holds an expected value, and wake some number of sleepers on a
//! word. On Linux these are `futex` WAIT and WAKE. Process-private primitives
//! set the private flag so the kernel can skip the shared hash; process-shared
//! primitives leave it off.
//!
//! # Design
//!
//! The wait call reports exactly three recoverable outcomes besides success:
//! the word no longer held the expected value (`Stale`), a signal interrupted
//! the sleep (`Interrupted`), or the timeout lapsed (`TimedOut`). Callers own
//! the retry policy; nothing here loops.

use std::ptr;
use std::sync::atomic::AtomicU32;

/// Wake every sleeper on the word.
pub const WAKE_ALL: u32 = i32::MAX as u32;

/// Recoverable outcomes of a kernel wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The word did not hold the expected value at sleep time.
    Stale,
    /// A signal arrived while sleeping.
    Interrupted,
    /// The timeout lapsed.
    TimedOut,
}

/// Sleep on `word` while it holds `expected`.
///
/// `timeout_ms` of `None` sleeps indefinitely. Returns `Ok(())` when woken by
/// a [`wake`] call; spurious `Ok` returns are possible and callers must
/// re-check their predicate.
pub fn wait(
    word: &AtomicU32,
    expected: u32,
    timeout_ms: Option<u32>,
    private: bool,
) -> Result<(), WaitError> {
    let op = futex_op(libc::FUTEX_WAIT, private);
    let timespec;
    let timeout_ptr = match timeout_ms {
        Some(ms) => {
            timespec = libc::timespec {
                tv_sec: libc::time_t::from(ms / 1000),
                tv_nsec: libc::c_long::from(ms % 1000) * 1_000_000,
            };
            &raw const timespec
        }
        None => ptr::null(),
    };
    // SAFETY: the word outlives the call and the timespec, when present, is a
    // live local. The kernel only reads both.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            op,
            expected,
            timeout_ptr,
            ptr::null::<u32>(),
            0u32,
        )
    };
    if rc == 0 {
        return Ok(());
    }
    match super::last_errno() {
        libc::EAGAIN => Err(WaitError::Stale),
        libc::EINTR => Err(WaitError::Interrupted),
        libc::ETIMEDOUT => Err(WaitError::TimedOut),
        // EINVAL on an unaligned word cannot happen for our repr(C) state
        // words; treat anything else as a spurious wake.
        _ => Ok(()),
    }
}

/// Wake up to `count` sleepers on `word`. Returns the number released.
pub fn wake(word: &AtomicU32, count: u32, private: bool) -> u32 {
    let op = futex_op(libc::FUTEX_WAKE, private);
    // SAFETY: the word outlives the call; WAKE takes no pointers besides it.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            op,
            count.min(WAKE_ALL),
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0u32,
        )
    };
    if rc < 0 { 0 } else { rc as u32 }
}

fn futex_op(base: libc::c_int, private: bool) -> libc::c_int {
    if private { base | libc::FUTEX_PRIVATE_FLAG } else { base }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn stale_value_fails_immediately() {
        let word = AtomicU32::new(7);
        assert_eq!(wait(&word, 8, None, true), Err(WaitError::Stale));
    }

    #[test]
    fn timeout_lapses() {
        let word = AtomicU32::new(1);
        assert_eq!(wait(&word, 1, Some(10), true), Err(WaitError::TimedOut));
    }

    #[test]
    fn wake_releases_sleeper() {
        let word = Arc::new(AtomicU32::new(0));
        let sleeper = {
            let word = Arc::clone(&word);
            thread::spawn(move || {
                while word.load(Ordering::Acquire) == 0 {
                    let _ = wait(&word, 0, Some(5_000), true);
                }
            })
        };
        thread::sleep(Duration::from_millis(20));
        word.store(1, Ordering::Release);
        wake(&word, WAKE_ALL, true);
        sleeper.join().unwrap();
    }

    #[test]
    fn wake_with_no_sleepers_reports_zero() {
        let word = AtomicU32::new(0);
        assert_eq!(wake(&word, 1, true), 0);
    }
}
