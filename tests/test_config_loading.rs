//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.

use std::io::Write;
use std::path::PathBuf;
use tb_device_client::config::{ConfigError, DeviceConfig};
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[device]
name = "ESP32_DEVICE_004"
provision_key = "key"
provision_secret = "secret"

[mqtt]
broker_url = "mqtt://demo.thingsboard.io:1883"
keep_alive_secs = 30
reconnect_interval_ms = 5000

[claim]
secret_key = "abcd1234"
duration_ms = 120000

[storage]
path = "/var/lib/tb-device/credentials.json"

[telemetry]
interval_secs = 10
"#,
    );

    let config = DeviceConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.device.name.as_deref(), Some("ESP32_DEVICE_004"));
    assert_eq!(config.mqtt.broker_url, "mqtt://demo.thingsboard.io:1883");
    assert_eq!(config.mqtt.keep_alive_secs, 30);
    assert_eq!(config.mqtt.reconnect_interval_ms, 5000);
    assert_eq!(config.mqtt.restart_delay_ms, 1000);
    assert_eq!(config.claim.as_ref().unwrap().duration_ms, 120000);
    assert_eq!(
        config.storage.path,
        PathBuf::from("/var/lib/tb-device/credentials.json")
    );
    assert_eq!(config.telemetry.interval_secs, 10);
}

#[test]
fn test_config_secrets_from_environment() {
    std::env::set_var("TB_DEVICE_TEST_PROVISION_SECRET", "from-env");
    std::env::set_var("TB_DEVICE_TEST_CLAIM_SECRET", "claim-from-env");

    let temp_file = write_config(
        r#"
[device]
provision_key = "key"
provision_secret_env = "TB_DEVICE_TEST_PROVISION_SECRET"

[mqtt]
broker_url = "mqtts://demo.thingsboard.io"

[claim]
secret_key_env = "TB_DEVICE_TEST_CLAIM_SECRET"
"#,
    );

    let config = DeviceConfig::load_from_file(temp_file.path()).unwrap();
    assert_eq!(config.device.provision_secret, "from-env");
    assert_eq!(config.claim.unwrap().secret_key, "claim-from-env");

    std::env::remove_var("TB_DEVICE_TEST_PROVISION_SECRET");
    std::env::remove_var("TB_DEVICE_TEST_CLAIM_SECRET");
}

#[test]
fn test_missing_file_reported() {
    let result = DeviceConfig::load_from_file("/nonexistent/device.toml".as_ref());
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_invalid_toml_reported() {
    let temp_file = write_config("[device\nprovision_key = ");
    let result = DeviceConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_missing_mqtt_section_reported() {
    let temp_file = write_config(
        r#"
[device]
provision_key = "key"
provision_secret = "secret"
"#,
    );
    let result = DeviceConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_invalid_values_rejected() {
    let cases = [
        // unsupported scheme
        r#"
[device]
provision_key = "key"
provision_secret = "secret"
[mqtt]
broker_url = "tcp://localhost:1883"
"#,
        // empty provisioning secret
        r#"
[device]
provision_key = "key"
[mqtt]
broker_url = "mqtt://localhost"
"#,
        // empty claim secret
        r#"
[device]
provision_key = "key"
provision_secret = "secret"
[mqtt]
broker_url = "mqtt://localhost"
[claim]
duration_ms = 1000
"#,
        // zero keep-alive
        r#"
[device]
provision_key = "key"
provision_secret = "secret"
[mqtt]
broker_url = "mqtt://localhost"
keep_alive_secs = 0
"#,
    ];

    for content in cases {
        let temp_file = write_config(content);
        assert!(
            matches!(
                DeviceConfig::load_from_file(temp_file.path()),
                Err(ConfigError::InvalidConfig(_))
            ),
            "should be rejected: {content}"
        );
    }
}

#[test]
fn test_redacted_config_serializes_without_secrets() {
    let config = DeviceConfig::from_toml_str(
        r#"
[device]
provision_key = "key"
provision_secret = "very-secret"
[mqtt]
broker_url = "mqtt://localhost"
[claim]
secret_key = "abcd1234"
"#,
    )
    .unwrap();

    let shown = toml::to_string_pretty(&config.redacted()).unwrap();
    assert!(!shown.contains("very-secret"));
    assert!(!shown.contains("abcd1234"));
    assert!(shown.contains("mqtt://localhost"));
}
