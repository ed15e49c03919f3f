use std::sync::Mutex;

use tempfile::NamedTempFile;

use proctor_kernel::config::ProctorConfig;
use proctor_kernel::{Severity, ViolationKind};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PROCTOR_CONFIG",
        "PROCTOR_MAX_WARNINGS",
        "PROCTOR_CRITICAL_WEIGHT",
        "PROCTOR_DEVTOOLS_THRESHOLD_PX",
        "PROCTOR_MEDIA_DENIED_CRITICAL_AFTER",
        "PROCTOR_MANDATORY_MEDIA",
        "PROCTOR_LEDGER_DB",
        "PROCTOR_MQTT_BROKER",
        "PROCTOR_MQTT_TOPIC_PREFIX",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(suffix: &str, body: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    std::io::Write::write_all(&mut file, body.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = ProctorConfig::load().expect("load defaults");
    assert_eq!(cfg.controller.policy.max_warnings, 3);
    assert_eq!(cfg.controller.policy.weights.warning, 1);
    assert_eq!(cfg.controller.policy.weights.critical, 2);
    assert_eq!(cfg.controller.classifier.devtools_threshold_px, 160);
    assert_eq!(cfg.controller.classifier.media_denied_critical_after, None);
    assert!(cfg.controller.mandatory_media);
    assert_eq!(cfg.ledger_db_path, "proctor_ledger.db");
    assert!(cfg.mqtt_settings().is_none());
}

#[test]
fn loads_toml_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".toml",
        r#"
        mandatory_media = false

        [policy]
        max_warnings = 5
        critical_weight = 3

        [classifier]
        devtools_threshold_px = 200
        media_denied_critical_after = 2

        [classifier.severity_overrides]
        tab_switch = "terminal"

        [ledger]
        db_path = "exam_ledger.db"

        [mqtt]
        broker = "127.0.0.1:1883"
        topic_prefix = "campus/proctor"
        "#,
    );

    std::env::set_var("PROCTOR_CONFIG", file.path());
    std::env::set_var("PROCTOR_MAX_WARNINGS", "4");
    std::env::set_var("PROCTOR_LEDGER_DB", "override.db");
    std::env::set_var("PROCTOR_DEVTOOLS_THRESHOLD_PX", "");

    let cfg = ProctorConfig::load().expect("load config");

    assert_eq!(cfg.controller.policy.max_warnings, 4);
    assert_eq!(cfg.controller.policy.weights.critical, 3);
    assert_eq!(cfg.controller.policy.weights.warning, 1);
    assert_eq!(cfg.controller.classifier.devtools_threshold_px, 200);
    assert_eq!(cfg.controller.classifier.media_denied_critical_after, Some(2));
    assert_eq!(
        cfg.controller
            .classifier
            .severity_overrides
            .get(&ViolationKind::TabSwitch),
        Some(&Severity::Terminal)
    );
    assert!(!cfg.controller.mandatory_media);
    assert_eq!(cfg.ledger_db_path, "override.db");

    let mqtt = cfg.mqtt_settings().expect("mqtt enabled");
    assert_eq!(mqtt.broker, "127.0.0.1:1883");
    assert_eq!(mqtt.topic_prefix, "campus/proctor");
    assert!(!mqtt.allow_remote);

    clear_env();
}

#[test]
fn json_file_is_accepted() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".json",
        r#"{"policy": {"max_warnings": 2}, "classifier": {"severity_overrides": {"window_blur": "critical"}}}"#,
    );
    let cfg = ProctorConfig::load_from(Some(file.path())).expect("load json");
    assert_eq!(cfg.controller.policy.max_warnings, 2);
    assert_eq!(
        cfg.controller
            .classifier
            .severity_overrides
            .get(&ViolationKind::WindowBlur),
        Some(&Severity::Critical)
    );
}

#[test]
fn env_only_media_escalation_and_mqtt() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PROCTOR_MEDIA_DENIED_CRITICAL_AFTER", "3");
    std::env::set_var("PROCTOR_MANDATORY_MEDIA", "no");
    std::env::set_var("PROCTOR_MQTT_BROKER", "localhost:1883");
    std::env::set_var("PROCTOR_MQTT_TOPIC_PREFIX", "exams");

    let cfg = ProctorConfig::load().expect("load env");
    assert_eq!(cfg.controller.classifier.media_denied_critical_after, Some(3));
    assert!(!cfg.controller.mandatory_media);
    let mqtt = cfg.mqtt_settings().expect("mqtt enabled");
    assert_eq!(mqtt.topic_prefix, "exams");

    std::env::set_var("PROCTOR_MEDIA_DENIED_CRITICAL_AFTER", "off");
    let cfg = ProctorConfig::load().expect("load env");
    assert_eq!(cfg.controller.classifier.media_denied_critical_after, None);

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cases: [(&str, &str, &str); 6] = [
        ("PROCTOR_MAX_WARNINGS", "0", "max_warnings"),
        ("PROCTOR_MAX_WARNINGS", "three", "PROCTOR_MAX_WARNINGS"),
        ("PROCTOR_CRITICAL_WEIGHT", "0", "weights"),
        ("PROCTOR_MEDIA_DENIED_CRITICAL_AFTER", "0", "media_denied_critical_after"),
        ("PROCTOR_MQTT_TOPIC_PREFIX", "proctor/#", "wildcards"),
        ("PROCTOR_MQTT_BROKER", "broker.example.com:1883", "loopback"),
    ];
    for (key, value, expected) in cases {
        clear_env();
        std::env::set_var(key, value);
        let err = ProctorConfig::load().unwrap_err();
        assert!(
            err.to_string().contains(expected),
            "{}={} gave {}",
            key,
            value,
            err
        );
    }

    clear_env();
}

#[test]
fn critical_weight_below_warning_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".toml",
        "[policy]\nwarning_weight = 3\ncritical_weight = 2\n",
    );
    let err = ProctorConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("critical_weight"));
}

#[test]
fn remote_broker_needs_opt_in() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".toml",
        "[mqtt]\nbroker = \"mqtts://broker.example.com:8883\"\nallow_remote = true\n",
    );
    let cfg = ProctorConfig::load_from(Some(file.path())).expect("remote allowed");
    assert!(cfg.mqtt_settings().expect("mqtt").allow_remote);
}

#[test]
fn unknown_override_kind_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".toml",
        "[classifier.severity_overrides]\ncopy_paste = \"warning\"\n",
    );
    let err = ProctorConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("copy_paste"));
}

#[test]
fn unreadable_file_names_the_path() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PROCTOR_CONFIG", "/nonexistent/proctor.toml");
    let err = ProctorConfig::load().unwrap_err();
    assert!(err
        .to_string()
        .contains("failed to read config file /nonexistent/proctor.toml"));
    clear_env();
}
