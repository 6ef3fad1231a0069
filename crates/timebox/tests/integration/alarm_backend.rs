use std::io::Read;
use std::thread;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use serial_test::serial;
use timebox::{BackendError, BackendKind, CallError, Fate};

use super::{OVERSHOOT, policy};

fn blocking_read(_: ()) -> Result<usize, String> {
    let (mut reader, _writer) = UnixStream::pair().map_err(|e| e.to_string())?;
    let mut buf = [0u8; 1];
    // Nothing is ever written, only the alarm can end this read
    reader.read(&mut buf).map_err(|e| format!("{:?}", e.kind()))
}

fn timer_is_disarmed() -> bool {
    // SAFETY: getitimer writes into a valid itimerval
    let current = unsafe {
        let mut current: libc::itimerval = std::mem::zeroed();
        assert_eq!(libc::getitimer(libc::ITIMER_REAL, &mut current), 0);
        current
    };
    current.it_value.tv_sec == 0 && current.it_value.tv_usec == 0
}

#[test]
#[serial(alarm)]
fn test_blocking_syscall_is_interrupted() {
    let wrapped = policy(0.2, BackendKind::Alarm).wrap(blocking_read).unwrap();
    let started = Instant::now();
    let error = wrapped.call(()).unwrap_err();

    let timeout = error.timed_out().unwrap();
    assert_eq!(timeout.name, "blocking_read");
    assert_eq!(timeout.fate, Fate::Interrupted);
    assert!(started.elapsed() < Duration::from_millis(200) + OVERSHOOT);
    assert!(timer_is_disarmed());
}

#[test]
#[serial(alarm)]
fn test_completed_call_leaves_no_timer() {
    let wrapped = policy(5.0, BackendKind::Alarm)
        .wrap_named("quick", |x: u32| -> Result<u32, String> { Ok(x * 3) })
        .unwrap();
    assert_eq!(wrapped.call(5).unwrap(), 15);
    assert!(timer_is_disarmed());
}

#[test]
#[serial(alarm)]
fn test_nested_alarm_is_busy() {
    let outer = policy(5.0, BackendKind::Alarm)
        .wrap_named("outer", |_: ()| -> Result<bool, String> {
            let inner = policy(1.0, BackendKind::Alarm)
                .wrap_named("inner", |_: ()| -> Result<(), String> { Ok(()) })
                .map_err(|e| e.to_string())?;
            Ok(matches!(
                inner.call(()),
                Err(CallError::Backend(BackendError::AlarmBusy))
            ))
        })
        .unwrap();

    assert!(outer.call(()).unwrap());
}

#[test]
#[serial(alarm)]
fn test_alarm_usable_again_after_timeout() {
    let reader = policy(0.1, BackendKind::Alarm).wrap(blocking_read).unwrap();
    for _ in 0..3 {
        assert!(reader.call(()).unwrap_err().is_timeout());
    }
    let quick = policy(1.0, BackendKind::Alarm)
        .wrap_named("quick", |_: ()| -> Result<String, String> { Ok("done".to_string()) })
        .unwrap();
    assert_eq!(quick.call(()).unwrap(), "done");
}

fn sleep_and_return(ms: u64) -> Result<u64, String> {
    // thread::sleep resumes after EINTR, so the alarm cannot cut it short
    thread::sleep(Duration::from_millis(ms));
    Ok(ms)
}

#[test]
#[serial(alarm)]
fn test_uninterruptible_call_times_out_only_after_returning() {
    let wrapped = policy(0.1, BackendKind::Alarm).wrap(sleep_and_return).unwrap();
    let started = Instant::now();
    let error = wrapped.call(600).unwrap_err();

    assert_eq!(error.timed_out().unwrap().fate, Fate::Interrupted);
    assert!(started.elapsed() >= Duration::from_millis(600));
    assert!(timer_is_disarmed());
}
