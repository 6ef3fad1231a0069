use std::time::{Duration, Instant};

use timebox::{Budget, CommandEvent, CommandEventStream, CommandSpec, Limits, run_command};

fn limits(seconds: f64) -> Limits {
    Limits::new(Budget::from_secs_f64(seconds).unwrap()).with_kill_grace(Duration::from_millis(200))
}

#[tokio::test]
async fn test_program_reads_input_and_exits() {
    let spec = CommandSpec::new("sh")
        .arg("-c")
        .arg("read first; read second; echo \"$second $first\"; exit 4")
        .input("world\nhello\n");

    let report = run_command(spec, &limits(5.0)).await.unwrap();
    assert_eq!(report.stdout, vec!["hello world"]);
    assert_eq!(report.exit_code, Some(4));
    assert!(!report.timed_out);
}

#[tokio::test]
async fn test_missing_input_reads_eof() {
    let spec = CommandSpec::new("sh")
        .arg("-c")
        .arg("if read line; then echo got; else echo eof; fi");

    let report = run_command(spec, &limits(5.0)).await.unwrap();
    assert_eq!(report.stdout, vec!["eof"]);
}

#[tokio::test]
async fn test_hung_program_is_terminated() {
    let started = Instant::now();
    let spec = CommandSpec::new("sleep").arg("30");

    let report = run_command(spec, &limits(0.2)).await.unwrap();
    assert!(report.timed_out);
    assert!(!report.is_success());
    assert!(report.elapsed >= Duration::from_millis(200));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_stream_reports_lines_in_order() {
    let spec = CommandSpec::new("sh")
        .arg("-c")
        .arg("for i in 1 2 3 4 5; do echo line$i; done");
    let mut stream = CommandEventStream::spawn(spec, limits(5.0));

    let mut lines = Vec::new();
    let mut exits = 0;
    while let Some(event) = stream.recv().await {
        match event {
            CommandEvent::Stdout(line) => lines.push(line),
            CommandEvent::Stderr(line) => panic!("unexpected stderr: {line}"),
            CommandEvent::Exited(report) => {
                exits += 1;
                assert_eq!(report.stdout, lines);
            }
        }
    }
    assert_eq!(exits, 1);
    assert_eq!(lines, vec!["line1", "line2", "line3", "line4", "line5"]);
}
