use std::fs;

use tempfile::TempDir;
use timebox::{BackendKind, Config, ConfigError, EXAMPLE_CONFIG, Timeout};

fn write_config(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("timebox.toml");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_load_example_config_from_disk() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, EXAMPLE_CONFIG);

    let config = Config::from_file(&path).expect("Failed to load config");
    assert_eq!(config.backend, BackendKind::Thread);
    assert_eq!(config.budget, 5.0);
}

#[test]
fn test_config_drives_timeout_policy() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "budget = 0.25\nbackend = \"thread\"\ncancel_grace = 0.01\n",
    );

    let config = Config::from_file(&path).unwrap();
    let timeout = Timeout::from_config(&config).unwrap();
    assert_eq!(timeout.budget().as_secs_f64(), 0.25);
    assert_eq!(timeout.backend_kind(), BackendKind::Thread);
    assert_eq!(timeout.limits().cancel_grace.as_millis(), 10);

    let double = timeout
        .wrap_named("double", |x: i64| -> Result<i64, String> { Ok(x * 2) })
        .unwrap();
    assert_eq!(double.call(21).unwrap(), 42);
}

#[test]
fn test_load_invalid_budget() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "budget = 0.0\n");
    assert!(matches!(
        Config::from_file(&path),
        Err(ConfigError::InvalidBudget(_))
    ));
}

#[test]
fn test_load_invalid_grace() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "kill_grace = -1.0\n");
    assert!(matches!(
        Config::from_file(&path),
        Err(ConfigError::Invalid(_))
    ));
}

#[test]
fn test_load_malformed_toml() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "budget = [\n");
    assert!(matches!(
        Config::from_file(&path),
        Err(ConfigError::Parse(_))
    ));
}
