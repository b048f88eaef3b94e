use super::*;
use crate::broker::queue::BackpressurePolicy;
use serial_test::serial;
use std::env;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.server.port, 8080);
    assert_eq!(settings.broker.max_messages_per_topic, 100);
    assert_eq!(settings.broker.max_queue_size, 1000);
    assert_eq!(
        settings.broker.backpressure_policy,
        BackpressurePolicy::DropOldest
    );
    assert_eq!(settings.broker.heartbeat_interval_ms, 30_000);
    assert!(settings.broker.topics.is_empty());
    assert_eq!(settings.log.level, "info");
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    // load_config reads config/default.toml relative to the working directory.
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    let toml = r#"
        [server]
        host = "0.0.0.0"
        port = 9000

        [broker]
        max_queue_size = 10
        backpressure_policy = "disconnect"
        topics = ["orders", "billing"]
    "#;
    fs::write("config/default.toml", toml).expect("write config file");

    let cfg = load_config();
    env::set_current_dir(orig).expect("restore cwd");

    let cfg = cfg.expect("load_config failed");
    assert_eq!(cfg.server.host, "0.0.0.0");
    assert_eq!(cfg.server.port, 9000);
    assert_eq!(cfg.server.outbound_buffer, 256);
    assert_eq!(cfg.broker.max_queue_size, 10);
    assert_eq!(cfg.broker.max_messages_per_topic, 100);
    assert_eq!(
        cfg.broker.backpressure_policy,
        BackpressurePolicy::Disconnect
    );
    assert_eq!(cfg.broker.topics, vec!["orders", "billing"]);
}

#[test]
#[serial]
fn load_config_reads_prefixed_environment() {
    temp_env::with_vars(
        [
            ("FANBUS_BROKER__MAX_MESSAGES_PER_TOPIC", Some("7")),
            ("FANBUS_LOG__LEVEL", Some("debug")),
        ],
        || {
            let cfg = load_config().expect("load_config failed");
            assert_eq!(cfg.broker.max_messages_per_topic, 7);
            assert_eq!(cfg.log.level, "debug");
            assert_eq!(cfg.broker.max_queue_size, 1000);
        },
    );
}
