use std::fs::File;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use timebox::{BackendKind, CallError, Fate, is_cancelled};

use super::{OVERSHOOT, policy};

static STOP_STUBBORN: AtomicBool = AtomicBool::new(false);

fn stubborn(_: ()) -> Result<(), String> {
    // Never looks at the cancellation flag
    while !STOP_STUBBORN.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(5));
    }
    Ok(())
}

#[test]
fn test_loop_ignoring_cancellation_is_abandoned() {
    let wrapped = policy(0.1, BackendKind::Thread).wrap(stubborn).unwrap();
    let started = Instant::now();
    let error = wrapped.call(()).unwrap_err();
    STOP_STUBBORN.store(true, Ordering::SeqCst);

    let timeout = error.timed_out().unwrap();
    assert_eq!(timeout.fate, Fate::Abandoned);
    assert!(!timeout.fate.is_stopped());
    assert!(started.elapsed() < Duration::from_millis(100) + OVERSHOOT);
}

#[test]
fn test_cancelled_callable_stops_running() {
    static ITERATIONS: AtomicUsize = AtomicUsize::new(0);

    let wrapped = policy(0.1, BackendKind::Thread)
        .wrap_named("counter", |_: ()| -> Result<(), String> {
            while !is_cancelled() {
                ITERATIONS.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(2));
            }
            Err("stopped".to_string())
        })
        .unwrap();

    let error = wrapped.call(()).unwrap_err();
    assert_eq!(error.timed_out().unwrap().fate, Fate::Cancelled);

    // The thread was joined, so the counter no longer moves
    let seen = ITERATIONS.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(30));
    assert_eq!(ITERATIONS.load(Ordering::SeqCst), seen);
}

#[test]
fn test_late_result_is_discarded() {
    let wrapped = policy(0.05, BackendKind::Thread)
        .wrap_named("late", |_: ()| -> Result<u32, String> {
            thread::sleep(Duration::from_millis(80));
            Ok(1)
        })
        .unwrap();

    match wrapped.call(()) {
        Err(CallError::TimedOut(timeout)) => assert_eq!(timeout.name, "late"),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[test]
fn test_checkpoint_outside_wrapper_is_never_cancelled() {
    assert!(!is_cancelled());
    assert!(timebox::checkpoint().is_ok());
}

fn open_missing(path: String) -> Result<File, io::Error> {
    File::open(path)
}

#[test]
fn test_unserializable_error_is_returned_unchanged() {
    let open = policy(1.0, BackendKind::Thread).wrap(open_missing).unwrap();
    match open.call("/nonexistent/timebox/input".to_string()) {
        Err(CallError::Failed(error)) => assert_eq!(error.kind(), io::ErrorKind::NotFound),
        other => panic!("expected io error, got {other:?}"),
    }
}
