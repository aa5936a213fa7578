use std::time::Duration;

use dispatchq::Error;
use dispatchq::config::Config;

#[test]
fn config_from_env_reads_overrides_and_rejects_garbage() {
    // One test owns the process environment to avoid racing other tests.
    unsafe {
        std::env::set_var("DISPATCHQ_WORKERS", "6");
        std::env::set_var("DISPATCHQ_MAX_PRODUCERS", "20");
        std::env::set_var("DISPATCHQ_SUBMIT_TIMEOUT_MS", "250");
        std::env::remove_var("DISPATCHQ_SUBMISSION_CAPACITY");
    }

    let config = Config::from_env().unwrap();
    assert_eq!(config.workers, 6);
    assert_eq!(config.max_producers, 20);
    assert_eq!(config.submission_capacity, Config::default().submission_capacity);
    assert_eq!(config.submit_timeout(), Some(Duration::from_millis(250)));

    let dispatch = config.dispatch();
    assert_eq!(dispatch.workers, 6);
    assert_eq!(dispatch.max_producers, 20);
    assert_eq!(dispatch.submit_timeout, Some(Duration::from_millis(250)));

    unsafe {
        std::env::set_var("DISPATCHQ_WORKERS", "many");
    }
    assert!(matches!(Config::from_env(), Err(Error::Config(_))));

    unsafe {
        std::env::set_var("DISPATCHQ_WORKERS", "0");
    }
    assert!(matches!(Config::from_env(), Err(Error::Config(_))));

    // Clean up
    unsafe {
        std::env::remove_var("DISPATCHQ_WORKERS");
        std::env::remove_var("DISPATCHQ_MAX_PRODUCERS");
        std::env::remove_var("DISPATCHQ_SUBMIT_TIMEOUT_MS");
    }
}

#[test]
fn config_defaults_are_usable() {
    let config = Config::default();
    assert!(config.validate().is_ok());
    assert!(config.workers >= 1);
    assert_eq!(config.submit_timeout(), None);
    assert_eq!(config.log_level, "info");
}

#[test]
fn config_from_toml_fills_missing_keys() {
    let config = Config::from_toml(
        r#"
        workers = 3
        submit_timeout_ms = 1500
        otel_endpoint = "http://localhost:4317"
        "#,
    )
    .unwrap();

    assert_eq!(config.workers, 3);
    assert_eq!(config.max_producers, Config::default().max_producers);
    assert_eq!(config.submit_timeout(), Some(Duration::from_millis(1500)));

    let telemetry = config.telemetry("dispatchq-test");
    assert_eq!(telemetry.endpoint.as_deref(), Some("http://localhost:4317"));
    assert_eq!(telemetry.default_filter, "info");
}

#[test]
fn config_from_toml_rejects_invalid_pools() {
    assert!(matches!(
        Config::from_toml("workers = 0"),
        Err(Error::Config(_))
    ));
    assert!(matches!(
        Config::from_toml("max_producers = 0"),
        Err(Error::Config(_))
    ));
    assert!(matches!(
        Config::from_toml("workers = \"two\""),
        Err(Error::Config(_))
    ));
}

#[test]
fn config_from_file_round_trips_through_disk() {
    let path = std::env::temp_dir().join(format!("dispatchq-{}.toml", uuid::Uuid::new_v4()));
    std::fs::write(&path, "workers = 2\nmax_producers = 5\nlog_level = \"debug\"\n").unwrap();

    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.workers, 2);
    assert_eq!(config.max_producers, 5);
    assert_eq!(config.log_level, "debug");

    std::fs::remove_file(&path).unwrap();
    assert!(matches!(Config::from_file(&path), Err(Error::Config(_))));
}
