use std::collections::HashSet;
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use modbus_client::ClientConfig;
use types::MeasurementCategory;

const DEFAULT_HTTP_BIND: &str = "0.0.0.0:8080";
const CONFIG_PATH_ENV: &str = "MODBUS_CONFIG";
const HTTP_BIND_ENV: &str = "MODBUS_HTTP_BIND";

/// Layered configuration: compiled-in defaults, overridden by an optional
/// TOML/JSON file (`MODBUS_CONFIG`), overridden by environment variables,
/// validated before the process starts polling.
#[derive(Clone, Debug)]
pub struct CollectorConfig {
    pub connections: Vec<ConnectionEntry>,
    pub devices: Vec<DeviceEntry>,
    pub http_bind_address: String,
}

#[derive(Clone, Debug)]
pub struct ConnectionEntry {
    pub name: String,
    pub client: ClientConfig,
}

#[derive(Clone, Debug)]
pub struct DeviceEntry {
    pub device_id: String,
    pub connection: String,
    pub poll_interval: Duration,
    pub initial_delay: Duration,
    pub measurements: Vec<MeasurementEntry>,
}

#[derive(Clone, Debug)]
pub struct MeasurementEntry {
    pub id: String,
    pub category: MeasurementCategory,
    pub address: u16,
    pub count: u16,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            connections: Vec::new(),
            devices: Vec::new(),
            http_bind_address: DEFAULT_HTTP_BIND.to_string(),
        }
    }
}

impl CollectorConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    pub fn load_with_path(config_path: Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = load_file_config(config_path.as_deref())? {
            apply_file_config(&mut config, file_config)?;
        }

        apply_env_overrides(&mut config);
        Ok(config)
    }

    /// Surfaces every invalid field before the process starts polling
    ///, rather than failing lazily on first use.
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            anyhow::bail!("at least one device must be configured");
        }

        self.http_bind_address
            .parse::<SocketAddr>()
            .with_context(|| format!("http.bind_address '{}' is not a valid socket address", self.http_bind_address))?;

        let mut connection_names = HashSet::new();
        for conn in &self.connections {
            if conn.name.trim().is_empty() {
                anyhow::bail!("connection name must not be blank");
            }
            if !connection_names.insert(conn.name.clone()) {
                anyhow::bail!("duplicate connection name '{}'", conn.name);
            }
            conn.client.validate().with_context(|| format!("connection '{}'", conn.name))?;
        }

        let mut device_ids = HashSet::new();
        for device in &self.devices {
            if device.device_id.trim().is_empty() {
                anyhow::bail!("device_id must not be blank");
            }
            if !device_ids.insert(device.device_id.clone()) {
                anyhow::bail!("duplicate device_id '{}'", device.device_id);
            }
            if !connection_names.contains(&device.connection) {
                anyhow::bail!(
                    "device '{}' references unknown connection '{}'",
                    device.device_id,
                    device.connection
                );
            }
            if device.poll_interval.is_zero() {
                anyhow::bail!("device '{}' poll_interval_ms must be >= 1", device.device_id);
            }
            if device.measurements.is_empty() {
                anyhow::bail!("device '{}' must declare at least one measurement", device.device_id);
            }

            let mut measurement_ids = HashSet::new();
            for measurement in &device.measurements {
                if measurement.id.trim().is_empty() {
                    anyhow::bail!("device '{}' has a measurement with a blank id", device.device_id);
                }
                if !measurement_ids.insert(measurement.id.clone()) {
                    anyhow::bail!(
                        "device '{}' has duplicate measurement id '{}'",
                        device.device_id,
                        measurement.id
                    );
                }
                if measurement.count == 0 {
                    anyhow::bail!("measurement '{}' count must be >= 1", measurement.id);
                }
            }
        }

        Ok(())
    }
}

fn apply_env_overrides(config: &mut CollectorConfig) {
    if let Ok(bind) = env::var(HTTP_BIND_ENV) {
        config.http_bind_address = bind;
    }
}

#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    http: Option<FileHttpConfig>,
    connections: Option<Vec<FileConnectionConfig>>,
    devices: Option<Vec<FileDeviceConfig>>,
}

#[derive(Debug, Deserialize)]
struct FileHttpConfig {
    bind_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileConnectionConfig {
    name: String,
    connection_string: String,
    request_timeout_ms: Option<u64>,
    max_retries: Option<usize>,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    jitter: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct FileDeviceConfig {
    device_id: String,
    connection: String,
    poll_interval_ms: Option<u64>,
    initial_delay_ms: Option<u64>,
    measurements: Vec<FileMeasurementConfig>,
}

#[derive(Debug, Deserialize)]
struct FileMeasurementConfig {
    id: String,
    category: String,
    address: u16,
    count: Option<u16>,
}

fn load_file_config(config_path: Option<&str>) -> Result<Option<FileConfig>> {
    let path = match config_path {
        Some(path) => path.to_string(),
        None => match env::var(CONFIG_PATH_ENV) {
            Ok(value) => value,
            Err(_) => return Ok(None),
        },
    };

    let content = fs::read_to_string(&path).with_context(|| format!("read config file {path}"))?;
    let ext = Path::new(&path).extension().and_then(|value| value.to_str());

    let config = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json config")?,
        _ => toml::from_str(&content).context("parse toml config")?,
    };

    Ok(Some(config))
}

fn apply_file_config(config: &mut CollectorConfig, file: FileConfig) -> Result<()> {
    if let Some(http) = file.http {
        if let Some(bind) = http.bind_address {
            config.http_bind_address = bind;
        }
    }

    if let Some(connections) = file.connections {
        config.connections = connections.into_iter().map(connection_from_file).collect();
    }

    if let Some(devices) = file.devices {
        let mut entries = Vec::with_capacity(devices.len());
        for device in devices {
            entries.push(device_from_file(device)?);
        }
        config.devices = entries;
    }

    Ok(())
}

fn connection_from_file(file: FileConnectionConfig) -> ConnectionEntry {
    let mut client = ClientConfig { connection_string: file.connection_string, ..ClientConfig::default() };
    if let Some(ms) = file.request_timeout_ms {
        client.request_timeout = Duration::from_millis(ms);
    }
    if let Some(retries) = file.max_retries {
        client.max_retries = retries;
    }
    if let Some(ms) = file.initial_backoff_ms {
        client.initial_backoff = Duration::from_millis(ms);
    }
    if let Some(ms) = file.max_backoff_ms {
        client.max_backoff = Duration::from_millis(ms);
    }
    if let Some(jitter) = file.jitter {
        client.jitter = jitter;
    }
    ConnectionEntry { name: file.name, client }
}

fn device_from_file(file: FileDeviceConfig) -> Result<DeviceEntry> {
    let mut measurements = Vec::with_capacity(file.measurements.len());
    for measurement in file.measurements {
        measurements.push(MeasurementEntry {
            id: measurement.id,
            category: parse_category(&measurement.category)?,
            address: measurement.address,
            count: measurement.count.unwrap_or(1),
        });
    }

    Ok(DeviceEntry {
        device_id: file.device_id,
        connection: file.connection,
        poll_interval: Duration::from_millis(file.poll_interval_ms.unwrap_or(5_000)),
        initial_delay: Duration::from_millis(file.initial_delay_ms.unwrap_or(0)),
        measurements,
    })
}

fn parse_category(value: &str) -> Result<MeasurementCategory> {
    match value {
        "coil" => Ok(MeasurementCategory::Coil),
        "discrete-input" => Ok(MeasurementCategory::DiscreteInput),
        "holding-register" => Ok(MeasurementCategory::HoldingRegister),
        "input-register" => Ok(MeasurementCategory::InputRegister),
        other => anyhow::bail!("unknown measurement category '{other}'"),
    }
}
