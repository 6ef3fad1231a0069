use std::thread;
use std::time::{Duration, Instant};

use serial_test::serial;
use timebox::{BackendKind, CallError, ConfigError, Fate, checkpoint, with_timeout};

use super::{OVERSHOOT, policy};

fn slow_square(x: u64) -> Result<u64, String> {
    thread::sleep(Duration::from_millis(100));
    Ok(x * x)
}

fn parse_port(raw: String) -> Result<u16, String> {
    raw.parse::<u16>().map_err(|e| format!("bad port '{raw}': {e}"))
}

fn counting_loop(_: ()) -> Result<(), timebox::Cancelled> {
    loop {
        checkpoint()?;
        thread::sleep(Duration::from_millis(2));
    }
}

fn available_backends() -> impl Iterator<Item = BackendKind> {
    BackendKind::ALL.into_iter().filter(BackendKind::is_available)
}

#[test]
#[serial(alarm)]
fn test_value_within_budget_on_every_backend() {
    for backend in available_backends() {
        let square = policy(1.0, backend).wrap(slow_square).unwrap();
        assert_eq!(square.call_transported(12).unwrap(), 144, "backend {backend}");
    }
}

#[test]
#[serial(alarm)]
fn test_error_within_budget_on_every_backend() {
    for backend in available_backends() {
        let parse = policy(1.0, backend).wrap(parse_port).unwrap();
        assert_eq!(parse.call_transported("8080".to_string()).unwrap(), 8080);

        let error = parse.call_transported("http".to_string()).unwrap_err();
        assert!(!error.is_timeout(), "backend {backend}");
        let message = error.into_failure().unwrap();
        assert!(message.starts_with("bad port 'http'"), "backend {backend}");
    }
}

#[test]
#[serial(alarm)]
fn test_cooperative_loop_times_out_on_every_backend() {
    for backend in available_backends() {
        let spin = policy(0.2, backend).wrap(counting_loop).unwrap();
        let started = Instant::now();
        let error = spin.call_transported(()).unwrap_err();
        let timeout = error.timed_out().expect("timeout");
        assert_eq!(timeout.name, "counting_loop");
        assert_eq!(timeout.budget.as_secs_f64(), 0.2);
        assert!(started.elapsed() < Duration::from_millis(200) + OVERSHOOT);

        let expected = match backend {
            BackendKind::Thread => Fate::Cancelled,
            BackendKind::Alarm => Fate::Interrupted,
            BackendKind::Isolated => Fate::Killed,
        };
        assert_eq!(timeout.fate, expected, "backend {backend}");
    }
}

#[test]
#[serial(alarm)]
fn test_sequential_calls_are_independent() {
    for backend in available_backends() {
        let square = policy(0.3, backend).wrap(slow_square).unwrap();
        let spin = policy(0.1, backend).wrap(counting_loop).unwrap();

        assert_eq!(square.call_transported(2).unwrap(), 4);
        assert!(spin.call_transported(()).unwrap_err().is_timeout());
        assert_eq!(square.call_transported(3).unwrap(), 9);
        assert!(spin.call_transported(()).unwrap_err().is_timeout());
        assert_eq!(square.call_transported(4).unwrap(), 16);
    }
}

#[test]
fn test_zero_budget_never_invokes() {
    assert!(matches!(
        with_timeout(0.0),
        Err(ConfigError::InvalidBudget(_))
    ));
    assert!(with_timeout(-3.0).is_err());
    assert!(with_timeout(f64::NAN).is_err());
}

#[test]
fn test_timeout_message_is_descriptive() {
    let spin = policy(0.1, BackendKind::Thread).wrap(counting_loop).unwrap();
    match spin.call(()) {
        Err(CallError::TimedOut(timeout)) => {
            assert_eq!(
                timeout.to_string(),
                "\"counting_loop\" takes more than 0.1s to run (thread cancelled)"
            );
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[test]
fn test_wrapped_is_shared_across_threads() {
    let square = policy(1.0, BackendKind::Thread).wrap(slow_square).unwrap();
    let handles: Vec<_> = (0..4u64)
        .map(|i| {
            let square = square.clone();
            thread::spawn(move || square.call(i).unwrap())
        })
        .collect();
    let results: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results, vec![0, 1, 4, 9]);
}
