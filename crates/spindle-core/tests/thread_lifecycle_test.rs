//! Thread creation, join, detach, exit, and cancellation behavior.

use spindle_core::error::Error;
use spindle_core::sys::mem;
use spindle_core::sys::time::{self, Clock};
use spindle_core::thread::{self, DetachState, STACK_MIN, ThreadAttr};
use spindle_core::{cancel, cleanup, key, sema};

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread as host_thread;
use std::time::Duration;

#[test]
fn join_returns_the_entry_value_verbatim() {
    let attr = ThreadAttr::new();
    let id = thread::create(&attr, Box::new(|| 0xDEAD_BEEF_usize)).unwrap();
    assert_eq!(thread::join(id).unwrap(), 0xDEAD_BEEF_usize);
}

#[test]
fn exit_mid_entry_carries_its_value() {
    let attr = ThreadAttr::new();
    let id = thread::create(
        &attr,
        Box::new(|| {
            thread::exit(41);
        }),
    )
    .unwrap();
    assert_eq!(thread::join(id).unwrap(), 41);
}

#[test]
fn self_join_is_a_deadlock_error() {
    assert_eq!(thread::join(thread::current()), Err(Error::Deadlock));
}

#[test]
fn forged_ids_fail_lookup() {
    let bogus = thread::current();
    let attr = ThreadAttr::new();
    let id = thread::create(&attr, Box::new(|| 0)).unwrap();
    thread::join(id).unwrap();
    // The id points at a reaped record now.
    assert_eq!(thread::join(id), Err(Error::NoSuchThread));
    assert!(thread::equal(bogus, bogus));
}

#[test]
fn joining_a_detached_thread_is_invalid() {
    let hold = Arc::new(sema::Semaphore::new(0, false).unwrap());
    let mut attr = ThreadAttr::new();
    attr.set_detach_state(DetachState::Detached);
    let gate = Arc::clone(&hold);
    let id = thread::create(
        &attr,
        Box::new(move || {
            gate.wait().unwrap();
            0
        }),
    )
    .unwrap();
    assert_eq!(thread::join(id), Err(Error::InvalidArgument));
    assert_eq!(thread::detach(id), Err(Error::InvalidArgument));
    hold.post().unwrap();
}

#[test]
fn detach_of_an_exited_thread_reaps_it() {
    let attr = ThreadAttr::new();
    let id = thread::create(&attr, Box::new(|| 7)).unwrap();
    // Give it time to reach the exited state.
    host_thread::sleep(Duration::from_millis(50));
    thread::detach(id).unwrap();
    assert_eq!(thread::join(id), Err(Error::NoSuchThread));
}

#[test]
fn kernel_tid_is_live_only_while_the_thread_runs() {
    let hold = Arc::new(sema::Semaphore::new(0, false).unwrap());
    let attr = ThreadAttr::new();
    let gate = Arc::clone(&hold);
    let id = thread::create(
        &attr,
        Box::new(move || {
            gate.wait().unwrap();
            0
        }),
    )
    .unwrap();
    let tid = thread::kernel_tid(id).unwrap();
    assert_ne!(tid, 0);
    assert_ne!(tid, thread::current_tid());
    thread::kill(id, 0).unwrap();
    hold.post().unwrap();
    thread::join(id).unwrap();
    assert_eq!(thread::kernel_tid(id), Err(Error::NoSuchThread));
}

#[test]
fn adopted_records_vanish_when_their_host_thread_dies() {
    // A std thread that merely touches the runtime gets adopted; once the
    // host thread is gone its handle must stop resolving.
    let id = host_thread::spawn(thread::current).join().unwrap();
    assert_eq!(thread::kernel_tid(id), Err(Error::NoSuchThread));
    assert_eq!(thread::join(id), Err(Error::NoSuchThread));
}

#[test]
fn default_guards_leave_stack_placement_to_the_host() {
    let hold = Arc::new(sema::Semaphore::new(0, false).unwrap());
    let attr = ThreadAttr::new();
    let gate = Arc::clone(&hold);
    let id = thread::create(
        &attr,
        Box::new(move || {
            gate.wait().unwrap();
            0
        }),
    )
    .unwrap();
    let reported = thread::getattr(id).unwrap();
    // The host placed the stack, so no base is known; the sizing still holds.
    assert_eq!(reported.stack(), None);
    assert!(reported.stack_size() >= STACK_MIN);
    assert!(reported.guard_size() > 0);
    hold.post().unwrap();
    thread::join(id).unwrap();
}

#[test]
fn oversized_guards_get_a_runtime_mapped_stack() {
    let page = spindle_core::sys::host::page_size();
    let hold = Arc::new(sema::Semaphore::new(0, false).unwrap());
    let mut attr = ThreadAttr::new();
    attr.set_guard_size(page * 4).unwrap();
    let gate = Arc::clone(&hold);
    let id = thread::create(
        &attr,
        Box::new(move || {
            gate.wait().unwrap();
            0
        }),
    )
    .unwrap();
    let reported = thread::getattr(id).unwrap();
    assert!(reported.stack().is_some());
    assert!(reported.guard_size() >= page * 4);
    hold.post().unwrap();
    thread::join(id).unwrap();
}

#[test]
fn caller_provided_stacks_are_honored() {
    let page = spindle_core::sys::host::page_size();
    let size = mem::align_up(STACK_MIN.max(page * 64), page);
    let mapping = mem::map_stack(size, 0).unwrap();
    let mut attr = ThreadAttr::new();
    attr.set_stack(mapping.stack_base() as usize, mapping.stack_size()).unwrap();
    let base = mapping.stack_base() as usize;
    let limit = base + mapping.stack_size();
    let id = thread::create(
        &attr,
        Box::new(move || {
            let probe = 0u8;
            let address = std::ptr::from_ref(&probe) as usize;
            usize::from(address >= base && address < limit)
        }),
    )
    .unwrap();
    assert_eq!(thread::join(id).unwrap(), 1);
    // SAFETY: the thread was joined above.
    unsafe {
        mapping.unmap();
    }
}

#[test]
fn getattr_reports_the_running_configuration() {
    let hold = Arc::new(sema::Semaphore::new(0, false).unwrap());
    let mut attr = ThreadAttr::new();
    attr.set_stack_size(STACK_MIN * 8).unwrap();
    let gate = Arc::clone(&hold);
    let id = thread::create(
        &attr,
        Box::new(move || {
            gate.wait().unwrap();
            0
        }),
    )
    .unwrap();
    let reported = thread::getattr(id).unwrap();
    assert!(reported.stack_size() >= STACK_MIN * 8);
    assert_eq!(reported.detach_state(), DetachState::Joinable);
    hold.post().unwrap();
    thread::join(id).unwrap();

    let own = thread::getattr(thread::current()).unwrap();
    assert!(own.stack_size() > 0);
}

extern "C" fn trace_cleanup(argument: usize) {
    CLEANUP_TRACE.fetch_add(argument, Ordering::Relaxed);
}

static CLEANUP_TRACE: AtomicUsize = AtomicUsize::new(0);

#[test]
fn cleanup_handlers_run_on_every_exit_path() {
    CLEANUP_TRACE.store(0, Ordering::Relaxed);
    let attr = ThreadAttr::new();
    let id = thread::create(
        &attr,
        Box::new(|| {
            let mut entry = cleanup::CleanupEntry::new(trace_cleanup, 100);
            // SAFETY: popped by the exit path before the frame dies.
            unsafe {
                cleanup::push(&mut entry);
            }
            thread::exit(5);
        }),
    )
    .unwrap();
    assert_eq!(thread::join(id).unwrap(), 5);
    assert_eq!(CLEANUP_TRACE.load(Ordering::Relaxed), 100);
}

static DESTRUCTOR_SAW: AtomicUsize = AtomicUsize::new(0);
static DESTRUCTOR_KEY_READ: AtomicUsize = AtomicUsize::new(usize::MAX);
static KEY_UNDER_TEST: std::sync::OnceLock<key::Key> = std::sync::OnceLock::new();

extern "C" fn observe_destructor(value: usize) {
    DESTRUCTOR_SAW.store(value, Ordering::Relaxed);
    let key = *KEY_UNDER_TEST.get().expect("set before the thread ran");
    DESTRUCTOR_KEY_READ.store(key::get(key), Ordering::Relaxed);
}

#[test]
fn key_destructors_observe_a_cleared_slot() {
    let key = key::create(Some(observe_destructor)).unwrap();
    KEY_UNDER_TEST.set(key).unwrap();
    let attr = ThreadAttr::new();
    let id = thread::create(
        &attr,
        Box::new(move || {
            key::set(key, 0x77).unwrap();
            0
        }),
    )
    .unwrap();
    thread::join(id).unwrap();
    assert_eq!(DESTRUCTOR_SAW.load(Ordering::Relaxed), 0x77);
    // The slot was emptied before the destructor ran.
    assert_eq!(DESTRUCTOR_KEY_READ.load(Ordering::Relaxed), 0);
    key::delete(key).unwrap();
}

static CXA_TRACE: AtomicUsize = AtomicUsize::new(0);

extern "C" fn cxa_log(argument: usize) {
    let trace = CXA_TRACE.load(Ordering::Relaxed);
    CXA_TRACE.store(trace * 10 + argument, Ordering::Relaxed);
}

#[test]
fn cxa_destructors_run_in_reverse_registration_order() {
    CXA_TRACE.store(0, Ordering::Relaxed);
    let attr = ThreadAttr::new();
    let id = thread::create(
        &attr,
        Box::new(|| {
            thread::cxa_thread_atexit(cxa_log, 1).unwrap();
            thread::cxa_thread_atexit(cxa_log, 2).unwrap();
            thread::cxa_thread_atexit(cxa_log, 3).unwrap();
            0
        }),
    )
    .unwrap();
    thread::join(id).unwrap();
    assert_eq!(CXA_TRACE.load(Ordering::Relaxed), 321);
}

static CANCEL_CLEANUP_RAN: AtomicUsize = AtomicUsize::new(0);

extern "C" fn cancel_cleanup(argument: usize) {
    CANCEL_CLEANUP_RAN.store(argument, Ordering::Relaxed);
}

#[test]
fn deferred_cancellation_interrupts_a_blocked_wait() {
    CANCEL_CLEANUP_RAN.store(0, Ordering::Relaxed);
    let parked = Arc::new(sema::Semaphore::new(0, false).unwrap());
    let attr = ThreadAttr::new();
    let gate = Arc::clone(&parked);
    let id = thread::create(
        &attr,
        Box::new(move || {
            let mut entry = cleanup::CleanupEntry::new(cancel_cleanup, 1);
            // SAFETY: consumed by the cancellation exit path.
            unsafe {
                cleanup::push(&mut entry);
            }
            // Blocks forever; only cancellation gets us out.
            gate.wait().unwrap();
            cleanup::pop(false);
            0
        }),
    )
    .unwrap();
    host_thread::sleep(Duration::from_millis(50));
    thread::cancel_thread(id).unwrap();
    assert_eq!(thread::join(id).unwrap(), cancel::CANCELED_RETVAL);
    assert_eq!(CANCEL_CLEANUP_RAN.load(Ordering::Relaxed), 1);
}

#[test]
fn disabled_cancellation_is_deferred_until_reenabled() {
    let attr = ThreadAttr::new();
    let id = thread::create(
        &attr,
        Box::new(|| {
            cancel::set_state(cancel::CancelState::Disabled).unwrap();
            // Give the canceller time to land while we are immune.
            host_thread::sleep(Duration::from_millis(80));
            // Reenabling acts on the pending request immediately.
            cancel::set_state(cancel::CancelState::Enabled).unwrap();
            cancel::test();
            0
        }),
    )
    .unwrap();
    host_thread::sleep(Duration::from_millis(20));
    thread::cancel_thread(id).unwrap();
    assert_eq!(thread::join(id).unwrap(), cancel::CANCELED_RETVAL);
}

#[test]
fn timed_wait_honors_its_deadline() {
    let parked = sema::Semaphore::new(0, false).unwrap();
    let before = time::now(Clock::Monotonic);
    let deadline = time::deadline_after_ms(Clock::Realtime, 100);
    assert_eq!(parked.timedwait(&deadline), Err(Error::TimedOut));
    let after = time::now(Clock::Monotonic);
    let elapsed_ms = (after.sec - before.sec) * 1_000 + (after.nsec - before.nsec) / 1_000_000;
    assert!(elapsed_ms >= 90, "returned after {elapsed_ms} ms");
}
