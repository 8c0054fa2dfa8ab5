//! Error taxonomy for the threads core.
//!
//! Every fallible operation in this crate reports one of the kinds below and
//! nothing else. The errno mapping is the counterpart of the original
//! kernel-status-to-errno conversion: the C boundary in `spindle-abi` turns
//! each kind into the POSIX error number callers expect.

use thiserror::Error;

/// Error kinds returned by the threads core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Malformed input, unsupported attribute value, double-destroy, or an
    /// operation applied to the wrong primitive flavor.
    #[error("invalid argument")]
    InvalidArgument,

    /// The referenced thread does not exist.
    #[error("no such thread")]
    NoSuchThread,

    /// Release of a lock the caller does not hold.
    #[error("caller does not own the lock")]
    NotOwner,

    /// Self-join, or self-relock on an errorcheck mutex.
    #[error("resource deadlock would occur")]
    Deadlock,

    /// The primitive is held: destroy of an acquired primitive, trylock of a
    /// held lock.
    #[error("resource busy")]
    Busy,

    /// Counter saturation (recursive mutex depth, semaphore count).
    #[error("counter would overflow")]
    WouldOverflow,

    /// The deadline passed before the operation completed.
    #[error("operation timed out")]
    TimedOut,

    /// Allocation for a thread, key table, or handler failed.
    #[error("out of memory")]
    OutOfMemory,

    /// The requested mode is not offered by this implementation.
    #[error("not supported")]
    NotSupported,

    /// Too many threads or keys.
    #[error("no resources available")]
    NoResources,
}

/// Result alias used throughout the core.
pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// Map an error kind to its POSIX errno value.
    #[must_use]
    pub const fn to_errno(self) -> i32 {
        match self {
            Error::InvalidArgument => libc::EINVAL,
            Error::NoSuchThread => libc::ESRCH,
            Error::NotOwner => libc::EPERM,
            Error::Deadlock => libc::EDEADLK,
            Error::Busy => libc::EBUSY,
            Error::WouldOverflow => libc::EOVERFLOW,
            Error::TimedOut => libc::ETIMEDOUT,
            Error::OutOfMemory => libc::ENOMEM,
            Error::NotSupported => libc::ENOTSUP,
            Error::NoResources => libc::EAGAIN,
        }
    }

    /// Map a raw errno value back into the taxonomy, where a mapping exists.
    #[must_use]
    pub const fn from_errno(errno: i32) -> Option<Error> {
        match errno {
            libc::EINVAL => Some(Error::InvalidArgument),
            libc::ESRCH => Some(Error::NoSuchThread),
            libc::EPERM => Some(Error::NotOwner),
            libc::EDEADLK => Some(Error::Deadlock),
            libc::EBUSY => Some(Error::Busy),
            libc::EOVERFLOW => Some(Error::WouldOverflow),
            libc::ETIMEDOUT => Some(Error::TimedOut),
            libc::ENOMEM => Some(Error::OutOfMemory),
            libc::ENOTSUP => Some(Error::NotSupported),
            libc::EAGAIN => Some(Error::NoResources),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Error; 10] = [
        Error::InvalidArgument,
        Error::NoSuchThread,
        Error::NotOwner,
        Error::Deadlock,
        Error::Busy,
        Error::WouldOverflow,
        Error::TimedOut,
        Error::OutOfMemory,
        Error::NotSupported,
        Error::NoResources,
    ];

    #[test]
    fn errno_mapping_is_total_and_distinct() {
        let mut seen = Vec::new();
        for kind in ALL {
            let errno = kind.to_errno();
            assert!(errno > 0, "errno for {kind:?} must be positive");
            assert!(!seen.contains(&errno), "duplicate errno for {kind:?}");
            seen.push(errno);
        }
    }

    #[test]
    fn errno_round_trips() {
        for kind in ALL {
            assert_eq!(Error::from_errno(kind.to_errno()), Some(kind));
        }
    }

    #[test]
    fn unknown_errno_has_no_kind() {
        assert_eq!(Error::from_errno(0), None);
        assert_eq!(Error::from_errno(libc::EIO), None);
    }
}
