//! C-callable surface over the threads core.
//!
//! Every function returns zero on success or a positive errno value, the
//! POSIX convention, translated from the core's typed errors. Primitives are
//! heap-allocated behind opaque handles: `*_init` writes a handle through an
//! out-pointer, `*_destroy` verifies idleness and frees it. Symbols carry the
//! `spindle_` prefix so the library can coexist with the host pthreads.

use spindle_core::barrier::{Barrier, BarrierAttr, BarrierWaitResult};
use spindle_core::cleanup::{self, CleanupEntry};
use spindle_core::cond::{Cond, CondAttr};
use spindle_core::error::Result;
use spindle_core::mutex::{Mutex, MutexAttr, MutexType};
use spindle_core::once::Once;
use spindle_core::rwlock::RwLock;
use spindle_core::sema::Semaphore;
use spindle_core::sys::time::{Clock, Timespec};
use spindle_core::thread::{self, DetachState, ThreadAttr, ThreadId};
use spindle_core::{atfork, cancel, key, setids};

/// Detached thread flag in [`SpindleThreadAttr::flags`].
pub const SPINDLE_THREAD_DETACHED: u32 = 1 << 0;

/// C layout of a thread attribute block.
#[repr(C)]
pub struct SpindleThreadAttr {
    pub stack_base: usize,
    pub stack_size: usize,
    pub guard_size: usize,
    pub flags: u32,
}

/// C layout of an absolute deadline.
#[repr(C)]
pub struct SpindleTimespec {
    pub sec: i64,
    pub nsec: i64,
}

fn errno_of(result: Result<()>) -> libc::c_int {
    match result {
        Ok(()) => 0,
        Err(error) => error.to_errno(),
    }
}

fn deadline_of(abstime: *const SpindleTimespec) -> Option<Timespec> {
    if abstime.is_null() {
        return None;
    }
    // SAFETY: non-null per the check; the caller owns the struct.
    let raw = unsafe { &*abstime };
    Some(Timespec::new(raw.sec, raw.nsec))
}

unsafe fn handle<'a, T>(pointer: *mut T) -> Option<&'a T> {
    // SAFETY: defers the validity obligation to the C caller.
    unsafe { pointer.as_ref() }
}

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

/// kind: 0 normal, 1 recursive, 2 errorcheck. shared: nonzero for
/// cross-process.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn spindle_mutex_init(
    out: *mut *mut Mutex,
    kind: libc::c_int,
    shared: libc::c_int,
) -> libc::c_int {
    if out.is_null() {
        return libc::EINVAL;
    }
    let mut attr = MutexAttr::new();
    match kind {
        0 => attr.set_kind(MutexType::Normal),
        1 => attr.set_kind(MutexType::Recursive),
        2 => attr.set_kind(MutexType::Errorcheck),
        _ => return libc::EINVAL,
    }
    attr.set_process_shared(shared != 0);
    // SAFETY: out checked above.
    unsafe {
        *out = Box::into_raw(Box::new(Mutex::from_attr(&attr)));
    }
    0
}

#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn spindle_mutex_lock(mutex: *mut Mutex) -> libc::c_int {
    // SAFETY: caller passes a handle from spindle_mutex_init.
    match unsafe { handle(mutex) } {
        Some(mutex) => errno_of(mutex.lock()),
        None => libc::EINVAL,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spindle_mutex_trylock(mutex: *mut Mutex) -> libc::c_int {
    // SAFETY: see spindle_mutex_lock.
    match unsafe { handle(mutex) } {
        Some(mutex) => errno_of(mutex.trylock()),
        None => libc::EINVAL,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn spindle_mutex_timedlock(
    mutex: *mut Mutex,
    abstime: *const SpindleTimespec,
) -> libc::c_int {
    // SAFETY: see spindle_mutex_lock.
    let Some(mutex) = (unsafe { handle(mutex) }) else {
        return libc::EINVAL;
    };
    match deadline_of(abstime) {
        Some(deadline) => errno_of(mutex.timedlock(&deadline)),
        None => libc::EINVAL,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spindle_mutex_unlock(mutex: *mut Mutex) -> libc::c_int {
    // SAFETY: see spindle_mutex_lock.
    match unsafe { handle(mutex) } {
        Some(mutex) => errno_of(mutex.unlock()),
        None => libc::EINVAL,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spindle_mutex_destroy(mutex: *mut Mutex) -> libc::c_int {
    if mutex.is_null() {
        return libc::EINVAL;
    }
    // SAFETY: see spindle_mutex_lock.
    let rc = errno_of(unsafe { &*mutex }.destroy());
    if rc == 0 {
        // SAFETY: the handle came from spindle_mutex_init and is now dead.
        drop(unsafe { Box::from_raw(mutex) });
    }
    rc
}

// ---------------------------------------------------------------------------
// Condition variables
// ---------------------------------------------------------------------------

/// clock: 0 realtime, 1 monotonic. shared: nonzero for cross-process.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn spindle_cond_init(
    out: *mut *mut Cond,
    clock: libc::c_int,
    shared: libc::c_int,
) -> libc::c_int {
    if out.is_null() {
        return libc::EINVAL;
    }
    let mut attr = CondAttr::new();
    match clock {
        0 => attr.set_clock(Clock::Realtime),
        1 => attr.set_clock(Clock::Monotonic),
        _ => return libc::EINVAL,
    }
    attr.set_process_shared(shared != 0);
    // SAFETY: out checked above.
    unsafe {
        *out = Box::into_raw(Box::new(Cond::from_attr(&attr)));
    }
    0
}

#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn spindle_cond_wait(cond: *mut Cond, mutex: *mut Mutex) -> libc::c_int {
    // SAFETY: both handles come from the matching init calls.
    match unsafe { (handle(cond), handle(mutex)) } {
        (Some(cond), Some(mutex)) => errno_of(cond.wait(mutex)),
        _ => libc::EINVAL,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn spindle_cond_timedwait(
    cond: *mut Cond,
    mutex: *mut Mutex,
    abstime: *const SpindleTimespec,
) -> libc::c_int {
    // SAFETY: see spindle_cond_wait.
    let (Some(cond), Some(mutex)) = (unsafe { handle(cond) }, unsafe { handle(mutex) }) else {
        return libc::EINVAL;
    };
    match deadline_of(abstime) {
        Some(deadline) => errno_of(cond.timedwait(mutex, &deadline)),
        None => libc::EINVAL,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spindle_cond_signal(cond: *mut Cond) -> libc::c_int {
    // SAFETY: see spindle_cond_wait.
    match unsafe { handle(cond) } {
        Some(cond) => {
            cond.signal();
            0
        }
        None => libc::EINVAL,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spindle_cond_broadcast(cond: *mut Cond) -> libc::c_int {
    // SAFETY: see spindle_cond_wait.
    match unsafe { handle(cond) } {
        Some(cond) => {
            cond.broadcast();
            0
        }
        None => libc::EINVAL,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spindle_cond_destroy(cond: *mut Cond) -> libc::c_int {
    if cond.is_null() {
        return libc::EINVAL;
    }
    // SAFETY: the handle came from spindle_cond_init and is now dead.
    let rc = errno_of(unsafe { &*cond }.destroy());
    if rc == 0 {
        // SAFETY: see above.
        drop(unsafe { Box::from_raw(cond) });
    }
    rc
}

// ---------------------------------------------------------------------------
// Reader/writer locks
// ---------------------------------------------------------------------------

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spindle_rwlock_init(
    out: *mut *mut RwLock,
    shared: libc::c_int,
) -> libc::c_int {
    if out.is_null() {
        return libc::EINVAL;
    }
    let mut attr = spindle_core::rwlock::RwLockAttr::new();
    attr.set_process_shared(shared != 0);
    // SAFETY: out checked above.
    unsafe {
        *out = Box::into_raw(Box::new(RwLock::from_attr(&attr)));
    }
    0
}

#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn spindle_rwlock_rdlock(lock: *mut RwLock) -> libc::c_int {
    // SAFETY: caller passes a handle from spindle_rwlock_init.
    match unsafe { handle(lock) } {
        Some(lock) => errno_of(lock.read_lock()),
        None => libc::EINVAL,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spindle_rwlock_tryrdlock(lock: *mut RwLock) -> libc::c_int {
    // SAFETY: see spindle_rwlock_rdlock.
    match unsafe { handle(lock) } {
        Some(lock) => errno_of(lock.try_read_lock()),
        None => libc::EINVAL,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn spindle_rwlock_wrlock(lock: *mut RwLock) -> libc::c_int {
    // SAFETY: see spindle_rwlock_rdlock.
    match unsafe { handle(lock) } {
        Some(lock) => errno_of(lock.write_lock()),
        None => libc::EINVAL,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spindle_rwlock_trywrlock(lock: *mut RwLock) -> libc::c_int {
    // SAFETY: see spindle_rwlock_rdlock.
    match unsafe { handle(lock) } {
        Some(lock) => errno_of(lock.try_write_lock()),
        None => libc::EINVAL,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spindle_rwlock_unlock(lock: *mut RwLock) -> libc::c_int {
    // SAFETY: see spindle_rwlock_rdlock.
    match unsafe { handle(lock) } {
        Some(lock) => errno_of(lock.unlock()),
        None => libc::EINVAL,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spindle_rwlock_destroy(lock: *mut RwLock) -> libc::c_int {
    if lock.is_null() {
        return libc::EINVAL;
    }
    // SAFETY: the handle came from spindle_rwlock_init and is now dead.
    let rc = errno_of(unsafe { &*lock }.destroy());
    if rc == 0 {
        // SAFETY: see above.
        drop(unsafe { Box::from_raw(lock) });
    }
    rc
}

// ---------------------------------------------------------------------------
// Semaphores
// ---------------------------------------------------------------------------

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spindle_sem_init(
    out: *mut *mut Semaphore,
    value: libc::c_uint,
    shared: libc::c_int,
) -> libc::c_int {
    if out.is_null() {
        return libc::EINVAL;
    }
    match Semaphore::new(value, shared != 0) {
        Ok(semaphore) => {
            // SAFETY: out checked above.
            unsafe {
                *out = Box::into_raw(Box::new(semaphore));
            }
            0
        }
        Err(error) => error.to_errno(),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn spindle_sem_wait(semaphore: *mut Semaphore) -> libc::c_int {
    // SAFETY: caller passes a handle from spindle_sem_init.
    match unsafe { handle(semaphore) } {
        Some(semaphore) => errno_of(semaphore.wait()),
        None => libc::EINVAL,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spindle_sem_trywait(semaphore: *mut Semaphore) -> libc::c_int {
    // SAFETY: see spindle_sem_wait.
    match unsafe { handle(semaphore) } {
        Some(semaphore) => errno_of(semaphore.trywait()),
        None => libc::EINVAL,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn spindle_sem_timedwait(
    semaphore: *mut Semaphore,
    abstime: *const SpindleTimespec,
) -> libc::c_int {
    // SAFETY: see spindle_sem_wait.
    let Some(semaphore) = (unsafe { handle(semaphore) }) else {
        return libc::EINVAL;
    };
    match deadline_of(abstime) {
        Some(deadline) => errno_of(semaphore.timedwait(&deadline)),
        None => libc::EINVAL,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spindle_sem_post(semaphore: *mut Semaphore) -> libc::c_int {
    // SAFETY: see spindle_sem_wait.
    match unsafe { handle(semaphore) } {
        Some(semaphore) => errno_of(semaphore.post()),
        None => libc::EINVAL,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spindle_sem_getvalue(
    semaphore: *mut Semaphore,
    out: *mut libc::c_int,
) -> libc::c_int {
    // SAFETY: see spindle_sem_wait; out is the caller's int.
    match (unsafe { handle(semaphore) }, !out.is_null()) {
        (Some(semaphore), true) => {
            // SAFETY: out checked non-null.
            unsafe {
                *out = semaphore.value();
            }
            0
        }
        _ => libc::EINVAL,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spindle_sem_destroy(semaphore: *mut Semaphore) -> libc::c_int {
    if semaphore.is_null() {
        return libc::EINVAL;
    }
    // SAFETY: the handle came from spindle_sem_init and is now dead.
    let rc = errno_of(unsafe { &*semaphore }.destroy());
    if rc == 0 {
        // SAFETY: see above.
        drop(unsafe { Box::from_raw(semaphore) });
    }
    rc
}

// ---------------------------------------------------------------------------
// Once and barriers
// ---------------------------------------------------------------------------

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spindle_once_init(out: *mut *mut Once) -> libc::c_int {
    if out.is_null() {
        return libc::EINVAL;
    }
    // SAFETY: out checked above.
    unsafe {
        *out = Box::into_raw(Box::new(Once::new()));
    }
    0
}

#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn spindle_once(
    once: *mut Once,
    routine: extern "C-unwind" fn(),
) -> libc::c_int {
    // SAFETY: caller passes a handle from spindle_once_init.
    match unsafe { handle(once) } {
        Some(once) => errno_of(once.call(routine)),
        None => libc::EINVAL,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spindle_barrier_init(
    out: *mut *mut Barrier,
    count: libc::c_uint,
    shared: libc::c_int,
) -> libc::c_int {
    if out.is_null() {
        return libc::EINVAL;
    }
    let mut attr = BarrierAttr::new();
    attr.set_process_shared(shared != 0);
    match Barrier::new(count, &attr) {
        Ok(barrier) => {
            // SAFETY: out checked above.
            unsafe {
                *out = Box::into_raw(Box::new(barrier));
            }
            0
        }
        Err(error) => error.to_errno(),
    }
}

/// Returns 0 for ordinary waiters, 1 for the serial thread, or a negated
/// errno on failure.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn spindle_barrier_wait(barrier: *mut Barrier) -> libc::c_int {
    // SAFETY: caller passes a handle from spindle_barrier_init.
    match unsafe { handle(barrier) } {
        Some(barrier) => match barrier.wait() {
            Ok(BarrierWaitResult::Serial) => 1,
            Ok(BarrierWaitResult::Waiter) => 0,
            Err(error) => -error.to_errno(),
        },
        None => -libc::EINVAL,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spindle_barrier_destroy(barrier: *mut Barrier) -> libc::c_int {
    if barrier.is_null() {
        return libc::EINVAL;
    }
    // SAFETY: the handle came from spindle_barrier_init and is now dead.
    let rc = errno_of(unsafe { &*barrier }.destroy());
    if rc == 0 {
        // SAFETY: see above.
        drop(unsafe { Box::from_raw(barrier) });
    }
    rc
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spindle_key_create(
    out: *mut u64,
    destructor: Option<extern "C" fn(usize)>,
) -> libc::c_int {
    if out.is_null() {
        return libc::EINVAL;
    }
    match key::create(destructor) {
        Ok(created) => {
            // SAFETY: out checked above.
            unsafe {
                *out = key_bits(created);
            }
            0
        }
        Err(error) => error.to_errno(),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn spindle_key_delete(raw: u64) -> libc::c_int {
    errno_of(key::delete(key_of(raw)))
}

#[unsafe(no_mangle)]
pub extern "C" fn spindle_getspecific(raw: u64) -> usize {
    key::get(key_of(raw))
}

#[unsafe(no_mangle)]
pub extern "C" fn spindle_setspecific(raw: u64, value: usize) -> libc::c_int {
    errno_of(key::set(key_of(raw), value))
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spindle_thread_create(
    out: *mut usize,
    attr: *const SpindleThreadAttr,
    entry: extern "C-unwind" fn(*mut libc::c_void) -> *mut libc::c_void,
    argument: *mut libc::c_void,
) -> libc::c_int {
    if out.is_null() {
        return libc::EINVAL;
    }
    let mut thread_attr = ThreadAttr::new();
    if !attr.is_null() {
        // SAFETY: non-null per the check; the caller owns the struct.
        let raw = unsafe { &*attr };
        if raw.stack_base != 0 {
            if let Err(error) = thread_attr.set_stack(raw.stack_base, raw.stack_size) {
                return error.to_errno();
            }
        } else if raw.stack_size != 0 {
            if let Err(error) = thread_attr.set_stack_size(raw.stack_size) {
                return error.to_errno();
            }
        }
        if raw.guard_size != 0 {
            if let Err(error) = thread_attr.set_guard_size(raw.guard_size) {
                return error.to_errno();
            }
        }
        if raw.flags & SPINDLE_THREAD_DETACHED != 0 {
            thread_attr.set_detach_state(DetachState::Detached);
        }
    }
    let argument = argument as usize;
    match thread::create(
        &thread_attr,
        Box::new(move || entry(argument as *mut libc::c_void) as usize),
    ) {
        Ok(id) => {
            // SAFETY: out checked above.
            unsafe {
                *out = id_bits(id);
            }
            0
        }
        Err(error) => error.to_errno(),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn spindle_thread_join(
    raw: usize,
    retval: *mut *mut libc::c_void,
) -> libc::c_int {
    match id_of(raw).map(thread::join) {
        Some(Ok(value)) => {
            if !retval.is_null() {
                // SAFETY: retval checked non-null; caller owns it.
                unsafe {
                    *retval = value as *mut libc::c_void;
                }
            }
            0
        }
        Some(Err(error)) => error.to_errno(),
        None => libc::ESRCH,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn spindle_thread_detach(raw: usize) -> libc::c_int {
    match id_of(raw) {
        Some(id) => errno_of(thread::detach(id)),
        None => libc::ESRCH,
    }
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn spindle_thread_exit(retval: *mut libc::c_void) -> ! {
    thread::exit(retval as usize)
}

#[unsafe(no_mangle)]
pub extern "C" fn spindle_thread_self() -> usize {
    id_bits(thread::current())
}

#[unsafe(no_mangle)]
pub extern "C" fn spindle_thread_equal(a: usize, b: usize) -> libc::c_int {
    libc::c_int::from(a == b)
}

#[unsafe(no_mangle)]
pub extern "C" fn spindle_thread_kill(raw: usize, signal: libc::c_int) -> libc::c_int {
    match id_of(raw) {
        Some(id) => errno_of(thread::kill(id, signal)),
        None => libc::ESRCH,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn spindle_thread_sigqueue(
    raw: usize,
    signal: libc::c_int,
    value: usize,
) -> libc::c_int {
    match id_of(raw) {
        Some(id) => errno_of(thread::sigqueue(id, signal, value)),
        None => libc::ESRCH,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn spindle_thread_cancel(raw: usize) -> libc::c_int {
    match id_of(raw) {
        Some(id) => errno_of(thread::cancel_thread(id)),
        None => libc::ESRCH,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spindle_thread_gettid(raw: usize, out: *mut u32) -> libc::c_int {
    let Some(id) = id_of(raw) else {
        return libc::ESRCH;
    };
    match thread::kernel_tid(id) {
        Ok(tid) => {
            if !out.is_null() {
                // SAFETY: out checked non-null; caller owns it.
                unsafe {
                    *out = tid;
                }
            }
            0
        }
        Err(error) => error.to_errno(),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spindle_thread_getattr(
    raw: usize,
    out: *mut SpindleThreadAttr,
) -> libc::c_int {
    if out.is_null() {
        return libc::EINVAL;
    }
    let Some(id) = id_of(raw) else {
        return libc::ESRCH;
    };
    match thread::getattr(id) {
        Ok(reported) => {
            // A zero base means the host or process owns stack placement.
            let (base, size) = reported.stack().unwrap_or((0, reported.stack_size()));
            let flags = if reported.detach_state() == DetachState::Detached {
                SPINDLE_THREAD_DETACHED
            } else {
                0
            };
            // SAFETY: out checked above.
            unsafe {
                *out = SpindleThreadAttr {
                    stack_base: base,
                    stack_size: size,
                    guard_size: reported.guard_size(),
                    flags,
                };
            }
            0
        }
        Err(error) => error.to_errno(),
    }
}

/// state: 0 enable, 1 disable. Previous state lands in `out` when non-null.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn spindle_setcancelstate(
    state: libc::c_int,
    out: *mut libc::c_int,
) -> libc::c_int {
    let requested = match state {
        0 => cancel::CancelState::Enabled,
        1 => cancel::CancelState::Disabled,
        _ => return libc::EINVAL,
    };
    match cancel::set_state(requested) {
        Ok(previous) => {
            if !out.is_null() {
                // SAFETY: out checked non-null; caller owns it.
                unsafe {
                    *out = match previous {
                        cancel::CancelState::Enabled => 0,
                        cancel::CancelState::Disabled => 1,
                    };
                }
            }
            0
        }
        Err(error) => error.to_errno(),
    }
}

/// kind: 0 deferred, 1 asynchronous. Previous type lands in `out` when
/// non-null.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn spindle_setcanceltype(
    kind: libc::c_int,
    out: *mut libc::c_int,
) -> libc::c_int {
    let requested = match kind {
        0 => cancel::CancelType::Deferred,
        1 => cancel::CancelType::Asynchronous,
        _ => return libc::EINVAL,
    };
    match cancel::set_type(requested) {
        Ok(previous) => {
            if !out.is_null() {
                // SAFETY: out checked non-null; caller owns it.
                unsafe {
                    *out = match previous {
                        cancel::CancelType::Deferred => 0,
                        cancel::CancelType::Asynchronous => 1,
                    };
                }
            }
            0
        }
        Err(error) => error.to_errno(),
    }
}

#[unsafe(no_mangle)]
pub extern "C-unwind" fn spindle_testcancel() {
    cancel::test();
}

// ---------------------------------------------------------------------------
// Cleanup handlers
// ---------------------------------------------------------------------------

/// Push a cleanup handler using caller-reserved storage.
///
/// `entry` must stay at a fixed address until the matching pop, and pushes
/// and pops must nest within one function scope.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn spindle_cleanup_push(
    entry: *mut CleanupEntry,
    routine: extern "C" fn(usize),
    argument: usize,
) -> libc::c_int {
    if entry.is_null() {
        return libc::EINVAL;
    }
    // SAFETY: entry is writable caller storage that outlives the pop, per
    // the contract above.
    unsafe {
        entry.write(CleanupEntry::new(routine, argument));
        cleanup::push(&mut *entry);
    }
    0
}

#[unsafe(no_mangle)]
pub extern "C" fn spindle_cleanup_pop(execute: libc::c_int) {
    cleanup::pop(execute != 0);
}

/// Register a C++ thread-local destructor. `home` tags the owning image and
/// is otherwise unused here.
#[unsafe(no_mangle)]
pub extern "C" fn spindle_cxa_thread_atexit(
    destructor: extern "C" fn(usize),
    argument: usize,
    _home: usize,
) -> libc::c_int {
    errno_of(thread::cxa_thread_atexit(destructor, argument))
}

// ---------------------------------------------------------------------------
// Fork and credentials
// ---------------------------------------------------------------------------

#[unsafe(no_mangle)]
pub extern "C" fn spindle_atfork(
    prepare: Option<extern "C" fn()>,
    parent: Option<extern "C" fn()>,
    child: Option<extern "C" fn()>,
    tag: usize,
) -> libc::c_int {
    errno_of(atfork::register(prepare, parent, child, tag))
}

#[unsafe(no_mangle)]
pub extern "C" fn spindle_atfork_unregister(tag: usize) -> libc::c_int {
    errno_of(atfork::unregister(tag))
}

#[unsafe(no_mangle)]
pub extern "C" fn spindle_fork() -> libc::pid_t {
    match atfork::fork() {
        Ok(pid) => pid,
        Err(_) => -1,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn spindle_setresuid(real: u32, effective: u32, saved: u32) -> libc::c_int {
    errno_of(setids::set_user_ids(real, effective, saved))
}

#[unsafe(no_mangle)]
pub extern "C" fn spindle_setresgid(real: u32, effective: u32, saved: u32) -> libc::c_int {
    errno_of(setids::set_group_ids(real, effective, saved))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spindle_setgroups(count: usize, groups: *const u32) -> libc::c_int {
    if count != 0 && groups.is_null() {
        return libc::EINVAL;
    }
    let groups = if count == 0 {
        // A null pointer is fine for an empty list; never hand it to
        // from_raw_parts.
        &[]
    } else {
        // SAFETY: non-null per the check; the caller supplies count entries.
        unsafe { std::slice::from_raw_parts(groups, count) }
    };
    errno_of(setids::set_supplementary_groups(groups))
}

// ---------------------------------------------------------------------------
// Handle packing
// ---------------------------------------------------------------------------

fn id_bits(id: ThreadId) -> usize {
    id.to_raw()
}

fn id_of(raw: usize) -> Option<ThreadId> {
    if raw == 0 {
        return None;
    }
    Some(ThreadId::from_raw(raw))
}

fn key_bits(key: key::Key) -> u64 {
    u64::from(key.to_raw())
}

fn key_of(raw: u64) -> key::Key {
    key::Key::from_raw(raw as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::mem::MaybeUninit;
    use std::ptr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static POPPED: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn note_pop(argument: usize) {
        POPPED.fetch_add(argument, Ordering::Relaxed);
    }

    #[test]
    fn cleanup_pop_runs_the_pushed_handler() {
        POPPED.store(0, Ordering::Relaxed);
        let mut entry = MaybeUninit::<CleanupEntry>::uninit();
        // SAFETY: the storage outlives the pop below.
        let rc = unsafe { spindle_cleanup_push(entry.as_mut_ptr(), note_pop, 7) };
        assert_eq!(rc, 0);
        spindle_cleanup_pop(1);
        assert_eq!(POPPED.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn getattr_reports_the_calling_thread() {
        let mut out = SpindleThreadAttr {
            stack_base: 0,
            stack_size: 0,
            guard_size: 0,
            flags: 0,
        };
        // SAFETY: out is a live local.
        let rc = unsafe { spindle_thread_getattr(spindle_thread_self(), &raw mut out) };
        assert_eq!(rc, 0);
        assert!(out.stack_size > 0);
        assert_eq!(out.flags & SPINDLE_THREAD_DETACHED, 0);

        // SAFETY: a null out-pointer must be rejected before any write.
        let rc = unsafe { spindle_thread_getattr(spindle_thread_self(), ptr::null_mut()) };
        assert_eq!(rc, libc::EINVAL);
    }

    #[test]
    fn setgroups_accepts_an_empty_null_list() {
        // SAFETY: a zero count never touches the pointer.
        let rc = unsafe { spindle_setgroups(0, ptr::null()) };
        assert!(rc == 0 || rc == libc::EPERM, "unexpected errno {rc}");
    }
}
