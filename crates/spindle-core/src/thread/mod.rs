//! Thread lifecycle.
//!
//! Every thread the runtime knows about has one heap record holding its
//! lifecycle word, kernel tid, return value, cancellation flags, key slots,
//! and teardown resources. The public [`ThreadId`] is the record's address,
//! validated against the global list on every use.
//!
//! # Lifecycle
//!
//! The lifecycle word moves through four states:
//!
//! ```text
//! NotJoined --exit--> Exited --join--> Joined
//!     |                  |
//!  detach             detach (reaps immediately)
//!     v
//! Detached
//! ```
//!
//! Join and detach race exit with plain compare-exchanges on the word; the
//! loser of each race sees the winner's state and reacts per the table in the
//! operations below. A joiner blocks on the record's tid word, which the
//! exiting thread clears and wakes as its very last touch of the record, so
//! whoever reaps the record knows the stack under the departed thread is
//! quiescent once it also joins the host handle.
//!
//! # Adoption
//!
//! Threads not created here, the process main thread included, get a record
//! lazily the first time they call into the runtime. Adopted threads leave
//! through [`exit`] for joiners to see their return value; if the host thread
//! instead dies on its own, a thread-local guard unregisters the record so
//! stale handles fail with `NoSuchThread` instead of naming a dead thread.

mod attr;
mod registry;

pub use attr::{DEFAULT_STACK_SIZE, DetachState, STACK_MIN, Scope, ThreadAttr};

use crate::cancel;
use crate::cleanup;
use crate::error::{Error, Result};
use crate::key::{self, KeySlot};
use crate::mutex::Mutex;
use crate::sys::mem::{self, Mapping};
use crate::sys::{host, signal, userlock};

use std::cell::{Cell, UnsafeCell};
use std::mem::MaybeUninit;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Once as HostOnce};

const LIFECYCLE_NOT_JOINED: u32 = 0;
const LIFECYCLE_EXITED: u32 = 1;
const LIFECYCLE_JOINED: u32 = 2;
const LIFECYCLE_DETACHED: u32 = 3;

/// Entry routine for a new thread.
pub type ThreadEntry = Box<dyn FnOnce() -> usize + Send + 'static>;

/// Destructor registered by C++ thread_local machinery.
pub type CxaDestructor = extern "C" fn(usize);

/// Opaque thread handle. Copyable and comparable; stale handles fail lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadId(usize);

impl ThreadId {
    /// Raw bits for carrying the handle across a C boundary.
    #[must_use]
    pub const fn to_raw(self) -> usize {
        self.0
    }

    /// Rebuild a handle from raw bits. Garbage bits fail lookup, they are
    /// never dereferenced.
    #[must_use]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }
}

struct CxaEntry {
    destructor: CxaDestructor,
    argument: usize,
}

/// One per-thread record.
pub struct Thread {
    lifecycle: AtomicU32,
    /// Kernel tid; doubles as the join futex word, cleared at exit.
    pub(crate) tid: AtomicU32,
    retval: AtomicUsize,
    pub(crate) cancel_state: AtomicU32,
    pub(crate) cancel_type: AtomicU32,
    pub(crate) cancel_pending: AtomicU32,
    /// Serializes start-up: the creator holds it until the record is
    /// published, so the new thread cannot run user code early.
    start_guard: Mutex,
    entry: UnsafeCell<Option<ThreadEntry>>,
    cleanup_top: UnsafeCell<*mut cleanup::CleanupEntry>,
    cxa_entries: UnsafeCell<Vec<CxaEntry>>,
    key_slots: [KeySlot; key::KEYS_MAX],
    /// Stack mapping owned by the runtime, absent for caller or host stacks.
    mapping: UnsafeCell<Option<Mapping>>,
    host_handle: UnsafeCell<Option<host::HostThread>>,
    saved_mask: UnsafeCell<MaybeUninit<libc::sigset_t>>,
    /// True for records created by [`create`]; adopted records unwind
    /// nothing and exit through the host.
    has_shim: bool,
    attr_stack_base: AtomicUsize,
    attr_stack_size: AtomicUsize,
    attr_guard_size: AtomicUsize,
}

// Cross-thread fields are atomic; the UnsafeCell fields follow a hand-off
// discipline ordered by the start guard and the lifecycle word.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    fn new(has_shim: bool) -> Self {
        Self {
            lifecycle: AtomicU32::new(LIFECYCLE_NOT_JOINED),
            tid: AtomicU32::new(0),
            retval: AtomicUsize::new(0),
            cancel_state: AtomicU32::new(cancel::STATE_ENABLED),
            cancel_type: AtomicU32::new(0),
            cancel_pending: AtomicU32::new(0),
            start_guard: Mutex::new(),
            entry: UnsafeCell::new(None),
            cleanup_top: UnsafeCell::new(ptr::null_mut()),
            cxa_entries: UnsafeCell::new(Vec::new()),
            key_slots: [const { KeySlot::new() }; key::KEYS_MAX],
            mapping: UnsafeCell::new(None),
            host_handle: UnsafeCell::new(None),
            saved_mask: UnsafeCell::new(MaybeUninit::uninit()),
            has_shim,
            attr_stack_base: AtomicUsize::new(0),
            attr_stack_size: AtomicUsize::new(0),
            attr_guard_size: AtomicUsize::new(0),
        }
    }

    pub(crate) fn key_slots(&self) -> &[KeySlot; key::KEYS_MAX] {
        &self.key_slots
    }

    pub(crate) fn cleanup_head(&self) -> *mut *mut cleanup::CleanupEntry {
        self.cleanup_top.get()
    }
}

thread_local! {
    static CURRENT: Cell<*const Thread> = const { Cell::new(ptr::null()) };
    static ADOPTED: Cell<Option<AdoptGuard>> = const { Cell::new(None) };
}

/// Unregisters an adopted record when its host thread dies without passing
/// through [`exit`]. Runs as a thread-local destructor.
struct AdoptGuard {
    record: Arc<Thread>,
}

impl Drop for AdoptGuard {
    fn drop(&mut self) {
        let record = &self.record;
        if record.tid.load(Ordering::Acquire) == 0 {
            // The thread left through exit; the record stays for its joiner.
            return;
        }
        // The host thread is dying under us. No cancellation point may fire
        // during this teardown.
        record.cancel_state.store(cancel::STATE_DISABLED, Ordering::Release);
        let _ = record.lifecycle.compare_exchange(
            LIFECYCLE_NOT_JOINED,
            LIFECYCLE_EXITED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        registry::remove(record);
        record.tid.store(0, Ordering::Release);
        userlock::wake(&record.tid, userlock::WAKE_ALL, true);
        // Other thread locals may already be gone at this point.
        let _ = CURRENT.try_with(|current| current.set(ptr::null()));
    }
}

static RUNTIME_INIT: HostOnce = HostOnce::new();

/// Install the runtime's signal handlers. Idempotent.
pub(crate) fn ensure_runtime_init() {
    RUNTIME_INIT.call_once(|| {
        let _ = signal::install(signal::cancel_signal(), cancel::on_cancel_signal);
        let _ = signal::install(signal::setid_signal(), crate::setids::on_setid_signal);
    });
}

/// Run `visit` against the calling thread's record, adopting the thread into
/// the runtime if it has none yet.
pub(crate) fn with_current<R>(visit: impl FnOnce(&Thread) -> R) -> R {
    let existing = CURRENT.with(Cell::get);
    if !existing.is_null() {
        // SAFETY: the record outlives the thread that owns it; the raw
        // pointer is cleared before the backing Arc can drop.
        return visit(unsafe { &*existing });
    }
    adopt_current();
    let adopted = CURRENT.with(Cell::get);
    // SAFETY: adopt_current just published the record.
    visit(unsafe { &*adopted })
}

/// As [`with_current`] without adopting. Safe to call from a signal handler
/// and during thread-local teardown.
pub(crate) fn try_with_current<R>(visit: impl FnOnce(&Thread) -> R) -> Option<R> {
    let existing = CURRENT.try_with(Cell::get).unwrap_or(ptr::null());
    if existing.is_null() {
        return None;
    }
    // SAFETY: see with_current.
    Some(visit(unsafe { &*existing }))
}

fn adopt_current() {
    ensure_runtime_init();
    let record = Arc::new(Thread::new(false));
    record.tid.store(host::current_tid(), Ordering::Release);
    CURRENT.with(|current| current.set(Arc::as_ptr(&record)));
    ADOPTED.with(|slot| {
        slot.set(Some(AdoptGuard {
            record: Arc::clone(&record),
        }));
    });
    registry::insert(record);
}

/// Visit every known record with the thread list locked.
///
/// The visitor must not create, join, or look up threads.
pub(crate) fn visit_all_threads(visit: impl FnMut(&Arc<Thread>)) {
    registry::visit_all(visit);
}

/// Handle of the calling thread.
#[must_use]
pub fn current() -> ThreadId {
    with_current(|record| ThreadId(ptr::from_ref(record) as usize))
}

/// Whether two handles name the same thread.
#[must_use]
pub fn equal(a: ThreadId, b: ThreadId) -> bool {
    a == b
}

/// Kernel tid of the calling thread.
#[must_use]
pub fn current_tid() -> u32 {
    host::current_tid()
}

/// Kernel tid behind a handle, failing once the thread has exited.
pub fn kernel_tid(id: ThreadId) -> Result<u32> {
    let record = registry::find(id.0).ok_or(Error::NoSuchThread)?;
    match record.tid.load(Ordering::Acquire) {
        0 => Err(Error::NoSuchThread),
        tid => Ok(tid),
    }
}

/// Start a new thread running `entry`.
pub fn create(attr: &ThreadAttr, entry: ThreadEntry) -> Result<ThreadId> {
    // Adopt the creator first so the new thread has a peer to be joined by.
    let _ = current();
    drain_retired();

    let record = Arc::new(Thread::new(true));
    let page = host::page_size();
    let mut options = host::SpawnOptions::default();
    match attr.stack() {
        Some((base, size)) => {
            options.stack = Some((base, size));
            record.attr_stack_base.store(base, Ordering::Relaxed);
            record.attr_stack_size.store(size, Ordering::Relaxed);
        }
        None if mem::align_up(attr.guard_size(), page) <= page => {
            // Guards up to one page are exactly what the host hands out; let
            // it place and reclaim the stack itself.
            let guard = mem::align_up(attr.guard_size(), page);
            let size = mem::align_up(attr.stack_size().max(STACK_MIN), page);
            options.stack_size = Some(size);
            options.guard_size = Some(guard);
            record.attr_stack_size.store(size, Ordering::Relaxed);
            record.attr_guard_size.store(guard, Ordering::Relaxed);
        }
        None => {
            let guard = mem::align_up(attr.guard_size(), page);
            let size = mem::align_up(attr.stack_size().max(STACK_MIN), page);
            let mapping = mem::map_stack(guard + size, guard)?;
            options.stack = Some((mapping.stack_base() as usize, mapping.stack_size()));
            record.attr_stack_base.store(mapping.stack_base() as usize, Ordering::Relaxed);
            record.attr_stack_size.store(mapping.stack_size(), Ordering::Relaxed);
            record.attr_guard_size.store(guard, Ordering::Relaxed);
            // SAFETY: the record is not yet shared.
            unsafe {
                *record.mapping.get() = Some(mapping);
            }
        }
    }

    // SAFETY: the record is not yet shared.
    unsafe {
        *record.entry.get() = Some(entry);
    }

    // Hold the start guard so the new thread parks right after announcing
    // its tid, until the record is published below.
    record.start_guard.acquire();

    // The new thread inherits a fully blocked mask and restores the
    // creator's mask once it owns its record.
    let mask = signal::block_all();
    // SAFETY: the record is not yet shared.
    unsafe {
        (*record.saved_mask.get()).write(mask);
    }

    let argument = Arc::into_raw(Arc::clone(&record)) as *mut libc::c_void;
    // SAFETY: the argument is the raw half of an Arc the shim reclaims, and
    // any explicit stack stays mapped until the record is reaped.
    let spawned = unsafe { host::spawn(thread_shim, argument, &options) };
    signal::set_mask(&mask);

    let handle = match spawned {
        Ok(handle) => handle,
        Err(error) => {
            // SAFETY: reclaim the Arc half the shim will never see.
            unsafe {
                Arc::from_raw(argument as *const Thread);
            }
            let _ = record.start_guard.unlock();
            // SAFETY: the thread never started; nothing runs on the stack.
            unsafe {
                if let Some(mapping) = (*record.mapping.get()).take() {
                    mapping.unmap();
                }
            }
            return Err(error);
        }
    };

    // SAFETY: published before the start guard is released; the shim reads
    // it only during teardown.
    unsafe {
        *record.host_handle.get() = Some(handle);
    }

    if attr.detach_state() == DetachState::Detached {
        record.lifecycle.store(LIFECYCLE_DETACHED, Ordering::Release);
    }

    // The shim publishes the tid before parking on the start guard; wait for
    // it so a join immediately after create has a word to sleep on.
    loop {
        if record.tid.load(Ordering::Acquire) != 0 {
            break;
        }
        let _ = userlock::wait(&record.tid, 0, None, true);
    }

    let id = ThreadId(Arc::as_ptr(&record) as usize);
    registry::insert(record.clone());
    let _ = record.start_guard.unlock();
    Ok(id)
}

extern "C" fn thread_shim(argument: *mut libc::c_void) -> *mut libc::c_void {
    // SAFETY: the argument is the raw Arc produced in create.
    let record = unsafe { Arc::from_raw(argument as *const Thread) };
    CURRENT.with(|current| current.set(Arc::as_ptr(&record)));
    record.tid.store(host::current_tid(), Ordering::Release);
    userlock::wake(&record.tid, userlock::WAKE_ALL, true);

    // Park until the creator has published the record. The guard only
    // sequences bring-up and is released right away.
    record.start_guard.acquire();
    let _ = record.start_guard.unlock();

    // SAFETY: the creator wrote the mask before releasing the guard.
    let mask = unsafe { (*record.saved_mask.get()).assume_init() };
    signal::set_mask(&mask);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        cancel::test();
        // SAFETY: the entry is written once by the creator and taken once
        // here.
        let entry = unsafe { (*record.entry.get()).take() };
        entry.map(|entry| entry())
    }));
    match outcome {
        Ok(Some(value)) => {
            record.retval.store(value, Ordering::Release);
            // A plain return never passed through exit_current; run the
            // user-visible teardown here.
            finish_user_state(&record);
        }
        Ok(None) => finish_user_state(&record),
        Err(payload) => {
            if payload.downcast_ref::<ExitUnwind>().is_none() {
                // A user panic crossing the C boundary has no sane recovery.
                std::process::abort();
            }
            // retval and the user teardown happened before the unwind
            // started, while the user frames were still live.
        }
    }

    finish_lifecycle(&record);
    CURRENT.with(|current| current.set(ptr::null()));
    drop(record);
    ptr::null_mut()
}

/// Payload that carries a structured exit through user frames.
struct ExitUnwind;

/// Exit the calling thread with `value`.
///
/// Runs C++ thread-local destructors, cleanup handlers, and key destructors,
/// then makes the thread joinable. For threads created by [`create`] this
/// unwinds back to the runtime; for adopted threads, the main thread
/// included, teardown runs in place and the host ends the thread.
pub fn exit(value: usize) -> ! {
    exit_current(value)
}

/// Shared exit path for [`exit`] and cancellation.
///
/// The user-visible teardown runs here, before any unwinding, because
/// cleanup handlers live in stack frames this exit is about to destroy.
pub(crate) fn exit_current(value: usize) -> ! {
    let has_shim = with_current(|record| {
        record.retval.store(value, Ordering::Release);
        // No cancellation point may fire inside teardown.
        record.cancel_state.store(cancel::STATE_DISABLED, Ordering::Release);
        record.has_shim
    });
    let pointer = CURRENT.with(Cell::get);
    // SAFETY: the record outlives the thread: the shim holds an Arc below
    // this frame, and adopted records stay in the registry.
    let record = unsafe { &*pointer };
    finish_user_state(record);
    if has_shim {
        panic::resume_unwind(Box::new(ExitUnwind));
    }
    // Adopted thread: no shim to unwind to; let the host finish.
    finish_lifecycle(record);
    CURRENT.with(|current| current.set(ptr::null()));
    // SAFETY: ends only the calling host thread.
    unsafe {
        libc::pthread_exit(ptr::null_mut());
    }
}

/// User-visible teardown: C++ thread-local destructors, cleanup handlers,
/// key destructors. Runs on the exiting thread with its frames still live.
fn finish_user_state(record: &Thread) {
    record.cancel_state.store(cancel::STATE_DISABLED, Ordering::Release);

    // SAFETY: cxa entries belong to the exiting thread alone.
    unsafe {
        let entries = &mut *record.cxa_entries.get();
        while let Some(entry) = entries.pop() {
            (entry.destructor)(entry.argument);
        }
    }
    cleanup::run_all(record);
    key::run_destructors(record);
}

/// Lifecycle teardown: publish the exit and reap or hand off resources.
fn finish_lifecycle(record: &Thread) {
    // From here the record must stay quiet: block every signal so neither
    // cancellation nor a credential broadcast lands mid-teardown.
    let _ = signal::block_all();

    let was = record.lifecycle.compare_exchange(
        LIFECYCLE_NOT_JOINED,
        LIFECYCLE_EXITED,
        Ordering::AcqRel,
        Ordering::Acquire,
    );
    if was == Err(LIFECYCLE_DETACHED) {
        // Nobody will join; reap ourselves. The stack cannot be unmapped
        // while we stand on it, so park the resources for a later caller.
        registry::remove(record);
        // SAFETY: teardown ownership of both cells is ours, being the
        // detached exit path.
        unsafe {
            let mapping = (*record.mapping.get()).take();
            let handle = (*record.host_handle.get()).take();
            match (handle, mapping) {
                (Some(handle), Some(mapping)) => retire(handle, mapping),
                (Some(handle), None) => host::detach(handle),
                _ => {}
            }
        }
    }

    // Final touch: wake joiners. The record may be reaped the instant this
    // lands.
    record.tid.store(0, Ordering::Release);
    userlock::wake(&record.tid, userlock::WAKE_ALL, true);
}

/// Wait for a thread to exit and collect its return value.
pub fn join(id: ThreadId) -> Result<usize> {
    cancel::test();
    if id == current() {
        return Err(Error::Deadlock);
    }
    let record = registry::find(id.0).ok_or(Error::NoSuchThread)?;
    claim_for_join(&record)?;
    reap(&record)
}

/// Mark a thread as never-to-be-joined. A thread that already exited is
/// reaped here.
pub fn detach(id: ThreadId) -> Result<()> {
    let record = registry::find(id.0).ok_or(Error::NoSuchThread)?;
    loop {
        match record.lifecycle.load(Ordering::Acquire) {
            LIFECYCLE_NOT_JOINED => {
                // Still running; the exit path sees the detached state and
                // reaps its own resources.
                if record
                    .lifecycle
                    .compare_exchange(
                        LIFECYCLE_NOT_JOINED,
                        LIFECYCLE_DETACHED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return Ok(());
                }
            }
            LIFECYCLE_EXITED => {
                // Exited already: detaching means reaping it now.
                if record
                    .lifecycle
                    .compare_exchange(
                        LIFECYCLE_EXITED,
                        LIFECYCLE_JOINED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    let _ = reap(&record)?;
                    return Ok(());
                }
            }
            _ => return Err(Error::InvalidArgument),
        }
    }
}

/// Request cancellation of a thread.
pub fn cancel_thread(id: ThreadId) -> Result<()> {
    let record = registry::find(id.0).ok_or(Error::NoSuchThread)?;
    cancel::request(&record)
}

/// Send `signal` to a thread. Zero probes without delivering.
pub fn kill(id: ThreadId, signal_number: i32) -> Result<()> {
    let tid = kernel_tid(id)?;
    signal::send(tid, signal_number)
}

/// Queue `signal` with a value word at a thread.
pub fn sigqueue(id: ThreadId, signal_number: i32, value: usize) -> Result<()> {
    let tid = kernel_tid(id)?;
    signal::queue(tid, signal_number, value)
}

/// Report the attributes a thread is actually running with.
pub fn getattr(id: ThreadId) -> Result<ThreadAttr> {
    let record = registry::find(id.0).ok_or(Error::NoSuchThread)?;
    let mut attr = ThreadAttr::new();
    if record.lifecycle.load(Ordering::Acquire) == LIFECYCLE_DETACHED {
        attr.set_detach_state(DetachState::Detached);
    }
    let mut base = record.attr_stack_base.load(Ordering::Relaxed);
    let mut size = record.attr_stack_size.load(Ordering::Relaxed);
    if size == 0 {
        // Adopted thread: report the process stack limit.
        let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
        // SAFETY: limit is a live out-parameter.
        unsafe {
            libc::getrlimit(libc::RLIMIT_STACK, &raw mut limit);
        }
        size = if limit.rlim_cur == libc::RLIM_INFINITY {
            DEFAULT_STACK_SIZE
        } else {
            limit.rlim_cur as usize
        };
        base = 0;
        record.attr_stack_size.store(size, Ordering::Relaxed);
    }
    let guard = record.attr_guard_size.load(Ordering::Relaxed);
    attr.set_reported_stack(base, size, guard);
    Ok(attr)
}

/// Register a destructor for a C++ thread-local object on the calling thread.
///
/// Destructors run in reverse registration order at exit. The owning-image
/// tag of the C interface is accepted there and dropped; nothing unloads
/// images underneath a live thread here.
pub fn cxa_thread_atexit(destructor: CxaDestructor, argument: usize) -> Result<()> {
    with_current(|record| {
        // SAFETY: the entry list belongs to the calling thread alone.
        unsafe {
            (*record.cxa_entries.get()).push(CxaEntry { destructor, argument });
        }
    });
    Ok(())
}

fn claim_for_join(record: &Thread) -> Result<()> {
    let mut seen = LIFECYCLE_NOT_JOINED;
    loop {
        match record.lifecycle.compare_exchange(
            seen,
            LIFECYCLE_JOINED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return Ok(()),
            Err(current_state @ (LIFECYCLE_NOT_JOINED | LIFECYCLE_EXITED)) => {
                seen = current_state;
            }
            Err(_) => return Err(Error::InvalidArgument),
        }
    }
}

/// Wait for the claimed thread to finish and release its resources.
fn reap(record: &Thread) -> Result<usize> {
    loop {
        let tid = record.tid.load(Ordering::Acquire);
        if tid == 0 {
            break;
        }
        let _ = userlock::wait(&record.tid, tid, None, true);
    }
    let value = record.retval.load(Ordering::Acquire);
    registry::remove(record);
    // SAFETY: we won the join claim and observed tid zero, so the exiting
    // side is past its last record access and the cells are ours.
    unsafe {
        if let Some(handle) = (*record.host_handle.get()).take() {
            host::join(handle);
        }
        if let Some(mapping) = (*record.mapping.get()).take() {
            mapping.unmap();
        }
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Retired detached resources
// ---------------------------------------------------------------------------

struct Retired {
    guard: Mutex,
    entries: UnsafeCell<Vec<(host::HostThread, Mapping)>>,
}

// Touched only with the guard held.
unsafe impl Sync for Retired {}

static RETIRED: Retired = Retired { guard: Mutex::new(), entries: UnsafeCell::new(Vec::new()) };

/// Park a detached thread's stack and handle until someone can reap them.
fn retire(handle: host::HostThread, mapping: Mapping) {
    RETIRED.guard.acquire();
    // SAFETY: guard held.
    unsafe {
        (*RETIRED.entries.get()).push((handle, mapping));
    }
    let _ = RETIRED.guard.unlock();
}

/// Reap every parked detached stack whose thread has finished.
fn drain_retired() {
    RETIRED.guard.acquire();
    // SAFETY: guard held.
    let parked = unsafe { std::mem::take(&mut *RETIRED.entries.get()) };
    let _ = RETIRED.guard.unlock();
    for (handle, mapping) in parked {
        host::join(handle);
        // SAFETY: the host join above proves the stack is quiescent.
        unsafe {
            mapping.unmap();
        }
    }
}
