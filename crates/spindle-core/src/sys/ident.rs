//! Per-thread credential syscalls.
//!
//! On Linux the uid/gid syscalls act on the calling thread only, which is why
//! the credential broadcast in `setids` exists at all. These wrappers issue
//! the raw syscalls directly instead of the libc functions so they stay
//! per-thread even under a libc that performs its own broadcast.

use crate::error::{Error, Result};

/// Set the real, effective, and saved user ids of the calling thread.
pub fn set_user_ids(real: u32, effective: u32, saved: u32) -> Result<()> {
    // SAFETY: plain integer arguments.
    let rc = unsafe { libc::syscall(libc::SYS_setresuid, real, effective, saved) };
    check(rc)
}

/// Set the real, effective, and saved group ids of the calling thread.
pub fn set_group_ids(real: u32, effective: u32, saved: u32) -> Result<()> {
    // SAFETY: plain integer arguments.
    let rc = unsafe { libc::syscall(libc::SYS_setresgid, real, effective, saved) };
    check(rc)
}

/// Replace the supplementary group list of the calling thread.
pub fn set_supplementary_groups(groups: &[u32]) -> Result<()> {
    // SAFETY: the kernel reads `groups.len()` gid_t entries from the slice.
    let rc = unsafe { libc::syscall(libc::SYS_setgroups, groups.len(), groups.as_ptr()) };
    check(rc)
}

/// Read the real, effective, and saved user ids of the calling thread.
#[must_use]
pub fn user_ids() -> (u32, u32, u32) {
    let (mut r, mut e, mut s) = (0u32, 0u32, 0u32);
    // SAFETY: three live out-pointers.
    unsafe {
        libc::getresuid(&raw mut r, &raw mut e, &raw mut s);
    }
    (r, e, s)
}

/// Read the real, effective, and saved group ids of the calling thread.
#[must_use]
pub fn group_ids() -> (u32, u32, u32) {
    let (mut r, mut e, mut s) = (0u32, 0u32, 0u32);
    // SAFETY: three live out-pointers.
    unsafe {
        libc::getresgid(&raw mut r, &raw mut e, &raw mut s);
    }
    (r, e, s)
}

fn check(rc: libc::c_long) -> Result<()> {
    if rc == 0 {
        return Ok(());
    }
    match super::last_errno() {
        libc::EPERM => Err(Error::NotOwner),
        libc::EINVAL => Err(Error::InvalidArgument),
        _ => Err(Error::NoResources),
    }
}
