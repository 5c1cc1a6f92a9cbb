use super::*;

#[test]
fn defaults_are_valid() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert!(settings.database.url.is_none());
    assert_eq!(settings.cache.capacity.get(), 10_000);
    assert_eq!(settings.cache.positive_ttl, Duration::from_secs(300));
    assert_eq!(settings.cache.negative_ttl, Duration::from_secs(60));
    assert_eq!(settings.watchdog.slow_threshold, Duration::from_millis(250));
    assert_eq!(settings.watchdog.capacity.get(), 1_000);
    assert_eq!(settings.watchdog.quarantine_threshold.get(), 3);
    assert_eq!(settings.watchdog.retention, Duration::from_secs(7 * 86_400));
    assert_eq!(settings.offload.max_concurrency.get(), 3);
    assert_eq!(settings.offload.max_attempts.get(), 3);
    assert_eq!(
        settings.offload.backoff,
        vec![
            Duration::ZERO,
            Duration::from_secs(60),
            Duration::from_secs(120),
            Duration::from_secs(240),
        ]
    );
    assert!(settings.offload.remove_local_copy);
    assert_eq!(settings.offload.deletion_grace, Duration::from_secs(600));
    assert_eq!(settings.janitor.log_keep.get(), 100);
    assert_eq!(settings.janitor.task_retention, Duration::from_secs(30 * 86_400));
    assert_eq!(settings.scheduler.tick_interval, Duration::from_secs(30));
    assert!(settings.storage.endpoint.is_none());
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.offload.max_concurrency = Some(8);
    raw.logging.level = Some("info".to_string());

    let overrides = ServeOverrides {
        offload_max_concurrency: Some(5),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.offload.max_concurrency.get(), 5);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn zero_values_are_rejected() {
    let mut raw = RawSettings::default();
    raw.offload.max_concurrency = Some(0);
    let err = Settings::from_raw(raw).expect_err("zero concurrency");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "offload.max_concurrency",
            ..
        }
    ));

    let mut raw = RawSettings::default();
    raw.cache.capacity = Some(0);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn empty_backoff_schedule_is_rejected() {
    let mut raw = RawSettings::default();
    raw.offload.backoff_seconds = Some(Vec::new());
    let err = Settings::from_raw(raw).expect_err("empty schedule");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "offload.backoff_seconds",
            ..
        }
    ));
}

#[test]
fn cache_ceiling_cannot_exceed_two_days() {
    let mut raw = RawSettings::default();
    raw.cache.max_ttl_seconds = Some(3 * 86_400);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn invalid_storage_endpoint_is_reported() {
    let mut raw = RawSettings::default();
    raw.storage.endpoint = Some("not a url".to_string());
    let err = Settings::from_raw(raw).expect_err("bad url");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "storage.endpoint",
            ..
        }
    ));
}

#[test]
fn blank_database_url_means_memory_backend() {
    let mut raw = RawSettings::default();
    raw.database.url = Some("   ".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.database.url.is_none());
}

#[test]
fn parse_resolve_arguments() {
    let args = CliArgs::parse_from([
        "offsite",
        "resolve",
        "--database-url",
        "postgres://example",
        "/uploads/a.jpg",
        "/uploads/b.jpg",
    ]);

    match args.command.expect("resolve command") {
        Command::Resolve(resolve) => {
            assert_eq!(
                resolve.database.database_url.as_deref(),
                Some("postgres://example")
            );
            assert_eq!(resolve.keys, vec!["/uploads/a.jpg", "/uploads/b.jpg"]);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn parse_processing_complete_arguments() {
    let args = CliArgs::parse_from(["offsite", "processing-complete", "42"]);
    assert!(matches!(
        args.command,
        Some(Command::ProcessingComplete(IdentityArgs { identity: 42, .. }))
    ));
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["offsite"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}
