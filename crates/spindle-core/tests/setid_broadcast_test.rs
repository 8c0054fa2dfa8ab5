//! Credential broadcast across live threads, isolated in its own process
//! because it installs signal handlers and interrupts every thread.

use spindle_core::sema::Semaphore;
use spindle_core::sys::ident;
use spindle_core::thread::{self, ThreadAttr};
use spindle_core::{cancel, setids};

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[test]
fn broadcast_reaches_threads_blocked_in_kernel_waits() {
    let parked = Arc::new(Semaphore::new(0, false).unwrap());
    let resumed = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for _ in 0..4 {
        let parked = Arc::clone(&parked);
        let resumed = Arc::clone(&resumed);
        workers.push(
            thread::create(
                &ThreadAttr::new(),
                Box::new(move || {
                    // Cancellation stays off so the broadcast signal can only
                    // interrupt, never kill.
                    cancel::set_state(cancel::CancelState::Disabled).unwrap();
                    parked.wait().unwrap();
                    resumed.fetch_add(1, Ordering::Relaxed);
                    0
                }),
            )
            .unwrap(),
        );
    }

    // Let every worker reach the kernel wait.
    std::thread::sleep(Duration::from_millis(50));

    // Re-asserting the current identity exercises the full broadcast:
    // signal delivery, handler application, and the completion handshake.
    let (real, effective, saved) = ident::user_ids();
    setids::set_user_ids(real, effective, saved).unwrap();
    let (group_real, group_effective, group_saved) = ident::group_ids();
    setids::set_group_ids(group_real, group_effective, group_saved).unwrap();

    // Every worker survived the interruption and still waits correctly.
    for _ in 0..workers.len() {
        parked.post().unwrap();
    }
    for worker in workers {
        assert_eq!(thread::join(worker).unwrap(), 0);
    }
    assert_eq!(resumed.load(Ordering::Relaxed), 4);
}

#[test]
fn broadcast_with_no_peers_is_a_local_change() {
    let (real, effective, saved) = ident::user_ids();
    setids::set_user_ids(real, effective, saved).unwrap();
    assert_eq!(ident::user_ids(), (real, effective, saved));
}
