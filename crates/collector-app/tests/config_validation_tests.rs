use std::path::PathBuf;

use collector_app::CollectorConfig;

#[test]
fn toml_config_validates() {
    let config = CollectorConfig::load_with_path(Some(fixture_path("config-valid.toml"))).expect("load config");
    config.validate().expect("validate config");
    assert_eq!(config.connections.len(), 1);
    assert_eq!(config.devices.len(), 1);
}

#[test]
fn json_config_validates() {
    let config = CollectorConfig::load_with_path(Some(fixture_path("config-valid.json"))).expect("load config");
    config.validate().expect("validate config");
    assert_eq!(config.devices[0].measurements.len(), 2);
}

#[test]
fn invalid_config_fails_validation() {
    let config = CollectorConfig::load_with_path(Some(fixture_path("config-invalid.toml"))).expect("load config");
    assert!(config.validate().is_err());
}

#[test]
fn default_config_with_no_devices_fails_validation() {
    let config = CollectorConfig::default();
    assert!(config.validate().is_err());
}

fn fixture_path(name: &str) -> String {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    path.to_string_lossy().to_string()
}
