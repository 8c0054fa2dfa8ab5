//! Platform layer.
//!
//! Everything in this crate that needs the kernel goes through the modules
//! below rather than calling `libc` directly. The split mirrors the services
//! the synchronization core consumes: address-keyed blocking (`userlock`),
//! clocks (`time`), stack mappings (`mem`), directed signals (`signal`),
//! process credentials (`ident`), and host thread bring-up (`host`).

pub mod host;
pub mod ident;
pub mod mem;
pub mod signal;
pub mod time;
pub mod userlock;

/// Fetch the calling thread's errno value after a failed C call.
pub(crate) fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL)
}
