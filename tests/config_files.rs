// Coldwatch - Cold-chain sensor gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Loading the device list and gateway tunables from disk

use std::io::Write;
use std::time::Duration;

use coldwatch::{load_devices, ConfigError, GatewayConfig, SensorDescriptor};
use tempfile::NamedTempFile;

fn json_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn device_list_pairs_keep_order() {
    let file = json_file(
        r#"[["C4:7C:8D:6A:00:02", "walk-in"], ["C4:7C:8D:6A:00:01", "reach-in"]]"#,
    );
    let devices = load_devices(file.path()).unwrap();
    assert_eq!(
        devices,
        vec![
            SensorDescriptor::new("C4:7C:8D:6A:00:02", "walk-in"),
            SensorDescriptor::new("C4:7C:8D:6A:00:01", "reach-in"),
        ]
    );
}

#[test]
fn device_list_objects_and_pairs_mixed() {
    let file = json_file(
        r#"[{"address": "C4:7C:8D:6A:00:01", "name": "dock"}, ["C4:7C:8D:6A:00:02", "van"]]"#,
    );
    let devices = load_devices(file.path()).unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].name, "dock");
    assert_eq!(devices[1].address, "C4:7C:8D:6A:00:02");
}

#[test]
fn device_list_rejects_duplicates_and_empty() {
    let file = json_file(r#"[["AA", "one"], ["AA", "two"]]"#);
    assert!(matches!(
        load_devices(file.path()),
        Err(ConfigError::Invalid(_))
    ));

    let file = json_file("[]");
    assert!(matches!(
        load_devices(file.path()),
        Err(ConfigError::Invalid(_))
    ));
}

#[test]
fn device_list_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_devices(dir.path().join("sensors.json")).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
    assert!(err.to_string().contains("sensors.json"));
}

#[test]
fn gateway_config_partial_file() {
    let file = json_file(
        r#"{"connection": {"max_retries": 5}, "alarm": {"resend_interval_s": 1800}}"#,
    );
    let config = GatewayConfig::load(file.path()).unwrap();
    assert_eq!(config.connection.max_retries, 5);
    assert_eq!(config.connection.retry_delay(), Duration::from_secs(2));
    assert_eq!(config.alarm.resend_interval(), chrono::Duration::minutes(30));
    assert_eq!(config.alarm.min_duration_after_start_s, 300);
    assert_eq!(config.scheduler.floor(), Duration::from_millis(200));
}

#[test]
fn gateway_config_rejects_zero_retries() {
    let file = json_file(r#"{"connection": {"max_retries": 0}}"#);
    assert!(matches!(
        GatewayConfig::load(file.path()),
        Err(ConfigError::Invalid(_))
    ));
}

#[test]
fn gateway_config_parse_error_names_file() {
    let file = json_file(r#"{"connection": "#);
    let err = GatewayConfig::load(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
}

#[test]
fn gateway_config_rejects_unbounded_alarm_interval() {
    let file = json_file(r#"{"alarm": {"resend_interval_s": 10000000000000000}}"#);
    assert!(matches!(
        GatewayConfig::load(file.path()),
        Err(ConfigError::Invalid(_))
    ));
}
