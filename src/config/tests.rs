use super::*;

#[test]
fn defaults_are_valid() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert_eq!(settings.transport.base_url.as_str(), DEFAULT_BASE_URL);
    assert_eq!(settings.transport.timeout, Duration::from_secs(30));
    assert_eq!(settings.cache.space_limit.get(), 500);
    assert_eq!(settings.queue.storage_directory, PathBuf::from(".courier"));
    assert_eq!(settings.queue.retry, 0);
    assert_eq!(settings.queue.deduplicate_time, Duration::from_millis(10));
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.transport.base_url = Some("http://file.example/".to_string());
    raw.logging.level = Some("info".to_string());

    let overrides = SettingsOverrides {
        base_url: Some("https://cli.example/api/".to_string()),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.transport.base_url.as_str(), "https://cli.example/api/");
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = SettingsOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn zero_space_limit_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.space_limit = Some(0);

    let err = Settings::from_raw(raw).expect_err("zero limit");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.space_limit",
            ..
        }
    ));
}

#[test]
fn non_http_base_url_is_rejected() {
    let mut raw = RawSettings::default();
    raw.transport.base_url = Some("ftp://files.example/".to_string());

    let err = Settings::from_raw(raw).expect_err("ftp scheme");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "transport.base_url",
            ..
        }
    ));
}

#[test]
fn zero_timeout_is_rejected() {
    let mut raw = RawSettings::default();
    raw.transport.timeout_seconds = Some(0);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn bad_log_level_is_rejected() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("chatty".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "logging.level",
            ..
        })
    ));
}

#[test]
fn parse_fetch_arguments() {
    let args = CliArgs::parse_from([
        "courier",
        "fetch",
        "/users/:id",
        "--param",
        "id=7",
        "--query",
        "expand=posts",
        "--cancelable",
        "--base-url",
        "http://api.example/",
    ]);

    assert_eq!(args.overrides.base_url.as_deref(), Some("http://api.example/"));
    match args.command {
        Command::Fetch(fetch) => {
            assert_eq!(fetch.endpoint, "/users/:id");
            assert_eq!(fetch.request.params, vec![("id".to_string(), "7".to_string())]);
            assert_eq!(
                fetch.request.query,
                vec![("expand".to_string(), "posts".to_string())]
            );
            assert!(fetch.cancelable);
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_submit_arguments() {
    let args = CliArgs::parse_from([
        "courier",
        "submit",
        "/orders",
        "--method",
        "put",
        "--body",
        r#"{"sku":"A-1"}"#,
        "--queue-key",
        "orders",
        "--offline",
        "--retry",
        "3",
    ]);

    match args.command {
        Command::Submit(submit) => {
            assert_eq!(submit.method, "put");
            assert_eq!(submit.body.as_deref(), Some(r#"{"sku":"A-1"}"#));
            assert_eq!(submit.queue_key.as_deref(), Some("orders"));
            assert!(submit.offline);
            assert_eq!(submit.request.retry, Some(3));
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn malformed_pair_is_rejected() {
    let result = CliArgs::try_parse_from(["courier", "fetch", "/users", "--query", "nokey"]);
    assert!(result.is_err());
}

#[test]
fn parse_storage_commands() {
    let args = CliArgs::parse_from(["courier", "pending", "--storage-dir", "/tmp/courier"]);
    assert!(matches!(args.command, Command::Pending));
    assert_eq!(
        args.overrides.storage_directory.as_deref(),
        Some(std::path::Path::new("/tmp/courier"))
    );

    let args = CliArgs::parse_from(["courier", "flush"]);
    assert!(matches!(args.command, Command::Flush));
}
