use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use timebox::{BackendKind, Fate};

use super::{OVERSHOOT, policy};

#[derive(Debug, PartialEq, Serialize, Deserialize)]
enum FetchError {
    NotFound { key: String },
    Corrupt(u32),
}

fn lookup(key: String) -> Result<Vec<u8>, FetchError> {
    match key.as_str() {
        "ok" => Ok(vec![1, 2, 3]),
        "bad" => Err(FetchError::Corrupt(7)),
        _ => Err(FetchError::NotFound { key }),
    }
}

/// Record the worker pid, then hang forever
fn hang(pid_file: String) -> Result<(), String> {
    fs::write(&pid_file, std::process::id().to_string()).map_err(|e| e.to_string())?;
    loop {
        thread::sleep(Duration::from_secs(1));
    }
}

fn read_pid(path: &Path) -> i32 {
    fs::read_to_string(path)
        .expect("worker wrote its pid")
        .trim()
        .parse()
        .expect("pid is a number")
}

#[test]
fn test_structured_error_survives_the_boundary() {
    let wrapped = policy(5.0, BackendKind::Isolated).wrap(lookup).unwrap();

    assert_eq!(wrapped.call_transported("ok".to_string()).unwrap(), vec![1, 2, 3]);
    assert_eq!(
        wrapped.call_transported("bad".to_string()).unwrap_err().into_failure(),
        Some(FetchError::Corrupt(7))
    );
    assert_eq!(
        wrapped.call_transported("gone".to_string()).unwrap_err().into_failure(),
        Some(FetchError::NotFound {
            key: "gone".to_string()
        })
    );
}

#[test]
fn test_no_worker_survives_repeated_timeouts() {
    let dir = TempDir::new().unwrap();
    let wrapped = policy(0.2, BackendKind::Isolated).wrap(hang).unwrap();

    for attempt in 0..3 {
        let pid_file = dir.path().join(format!("worker-{attempt}.pid"));
        let started = Instant::now();
        let error = wrapped
            .call_transported(pid_file.to_string_lossy().into_owned())
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(200) + OVERSHOOT);

        let timeout = error.timed_out().unwrap();
        assert_eq!(timeout.name, "hang");
        assert_eq!(timeout.fate, Fate::Killed);

        let pid = read_pid(&pid_file);
        assert_ne!(pid as u32, std::process::id());
        assert_eq!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH));
    }
}

#[test]
fn test_worker_killed_by_signal_is_crash() {
    let wrapped = policy(5.0, BackendKind::Isolated)
        .wrap_named("aborts", |_: ()| -> Result<(), String> { std::process::abort() })
        .unwrap();

    let started = Instant::now();
    let error = wrapped.call_transported(()).unwrap_err();
    assert_eq!(
        error.timed_out().unwrap().fate,
        Fate::Crashed {
            exit_code: None,
            signal: Some(libc::SIGABRT)
        }
    );
    // Reported as soon as the worker died, not at the deadline
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[test]
#[should_panic(expected = "worker gave up")]
fn test_worker_panic_resumes_in_caller() {
    let wrapped = policy(5.0, BackendKind::Isolated)
        .wrap_named("gives_up", |_: ()| -> Result<(), String> { panic!("worker gave up") })
        .unwrap();
    let _ = wrapped.call_transported(());
}

#[test]
fn test_worker_memory_is_isolated() {
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let wrapped = policy(5.0, BackendKind::Isolated)
        .wrap_named("bump", |_: ()| -> Result<u32, String> {
            Ok(COUNTER.fetch_add(1, Ordering::SeqCst) + 1)
        })
        .unwrap();

    assert_eq!(wrapped.call_transported(()).unwrap(), 1);
    assert_eq!(wrapped.call_transported(()).unwrap(), 1);
    assert_eq!(COUNTER.load(Ordering::SeqCst), 0);
}
