//! Directed signals and masks.
//!
//! The runtime reserves two real-time signals: one delivers cancellation
//! requests, the other carries the credential-broadcast protocol. Both are
//! installed without SA_RESTART so a delivery interrupts any kernel wait the
//! target is parked in, which is what lets a blocked thread notice a pending
//! request.

use crate::error::{Error, Result};

use std::mem;

/// Signal used to interrupt a thread with a pending cancellation request.
#[must_use]
pub fn cancel_signal() -> libc::c_int {
    libc::SIGRTMIN()
}

/// Signal used to apply a credential change on every thread.
#[must_use]
pub fn setid_signal() -> libc::c_int {
    libc::SIGRTMIN() + 1
}

/// Install `handler` for `signal` without SA_RESTART.
pub fn install(signal: libc::c_int, handler: extern "C-unwind" fn(libc::c_int)) -> Result<()> {
    // SAFETY: action is zero-initialized and then fully populated before use.
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = handler as usize;
        libc::sigemptyset(&raw mut action.sa_mask);
        if libc::sigaction(signal, &raw const action, std::ptr::null_mut()) != 0 {
            return Err(Error::InvalidArgument);
        }
    }
    Ok(())
}

/// Block every signal on the calling thread, returning the previous mask.
#[must_use]
pub fn block_all() -> libc::sigset_t {
    // SAFETY: both sets are live locals; sigfillset initializes `all`.
    unsafe {
        let mut all: libc::sigset_t = mem::zeroed();
        let mut old: libc::sigset_t = mem::zeroed();
        libc::sigfillset(&raw mut all);
        libc::pthread_sigmask(libc::SIG_SETMASK, &raw const all, &raw mut old);
        old
    }
}

/// Restore a mask previously returned by [`block_all`].
pub fn set_mask(mask: &libc::sigset_t) {
    // SAFETY: the mask came from the kernel and is a live reference.
    unsafe {
        libc::pthread_sigmask(libc::SIG_SETMASK, mask, std::ptr::null_mut());
    }
}

/// Send `signal` to the thread with kernel id `tid`.
///
/// A `signal` of zero probes for existence without delivering anything.
pub fn send(tid: u32, signal: libc::c_int) -> Result<()> {
    // SAFETY: tgkill takes plain integers.
    let rc = unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), tid as libc::pid_t, signal) };
    if rc == 0 {
        return Ok(());
    }
    match super::last_errno() {
        libc::ESRCH => Err(Error::NoSuchThread),
        libc::EINVAL => Err(Error::InvalidArgument),
        _ => Err(Error::NotOwner),
    }
}

/// Queue `signal` with an accompanying value word at the thread `tid`.
pub fn queue(tid: u32, signal: libc::c_int, value: usize) -> Result<()> {
    // Offsets into the kernel siginfo for an SI_QUEUE delivery on 64-bit
    // Linux: signo at 0, code at 8, sender pid at 16, uid at 20, value at 24.
    const SI_CODE_OFFSET: usize = 8;
    const SI_PID_OFFSET: usize = 16;
    const SI_UID_OFFSET: usize = 20;
    const SI_VALUE_OFFSET: usize = 24;

    // SAFETY: info is a zeroed buffer of the kernel's size; the stores below
    // stay inside it and match the SI_QUEUE layout.
    let rc = unsafe {
        let mut info: libc::siginfo_t = mem::zeroed();
        let base = (&raw mut info).cast::<u8>();
        base.cast::<libc::c_int>().write(signal);
        base.add(SI_CODE_OFFSET).cast::<libc::c_int>().write(-1); // SI_QUEUE
        base.add(SI_PID_OFFSET).cast::<libc::pid_t>().write(libc::getpid());
        base.add(SI_UID_OFFSET).cast::<libc::uid_t>().write(libc::getuid());
        base.add(SI_VALUE_OFFSET).cast::<usize>().write(value);
        libc::syscall(
            libc::SYS_rt_tgsigqueueinfo,
            libc::getpid(),
            tid as libc::pid_t,
            signal,
            &raw const info,
        )
    };
    if rc == 0 {
        return Ok(());
    }
    match super::last_errno() {
        libc::ESRCH => Err(Error::NoSuchThread),
        libc::EINVAL => Err(Error::InvalidArgument),
        libc::EAGAIN => Err(Error::NoResources),
        _ => Err(Error::NotOwner),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::host;

    #[test]
    fn zero_signal_probes_live_thread() {
        send(host::current_tid(), 0).unwrap();
    }

    #[test]
    fn probe_of_dead_tid_reports_no_such_thread() {
        // Tid 0 is never a valid target.
        assert!(send(u32::MAX - 1, 0).is_err());
    }

    #[test]
    fn mask_round_trip() {
        let old = block_all();
        set_mask(&old);
    }
}
