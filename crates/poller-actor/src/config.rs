use std::sync::Arc;
use std::time::Duration;

use modbus_client::ConnectionManager;
use types::{find_overlap, ConfigError, MeasurementDefinition};

/// Declarative description of what to poll for one device and how often.
#[derive(Clone)]
pub struct DevicePollingConfig {
    pub device_id: String,
    pub poll_interval: Duration,
    pub initial_delay: Duration,
    pub connection_manager: Arc<ConnectionManager>,
    pub measurements: Vec<MeasurementDefinition>,
}

/// Builds a `DevicePollingConfig`, rejecting duplicate ids, invalid
/// durations, an empty measurement list, and overlapping ranges before the
/// config is constructed.
pub struct DevicePollingConfigBuilder {
    device_id: String,
    connection_manager: Arc<ConnectionManager>,
    poll_interval: Duration,
    initial_delay: Duration,
    measurements: Vec<MeasurementDefinition>,
}

impl DevicePollingConfigBuilder {
    pub fn new(device_id: impl Into<String>, connection_manager: Arc<ConnectionManager>) -> Self {
        Self {
            device_id: device_id.into(),
            connection_manager,
            poll_interval: Duration::from_secs(5),
            initial_delay: Duration::ZERO,
            measurements: Vec::new(),
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn measurement(mut self, definition: MeasurementDefinition) -> Self {
        self.measurements.push(definition);
        self
    }

    pub fn measurements(mut self, definitions: impl IntoIterator<Item = MeasurementDefinition>) -> Self {
        self.measurements.extend(definitions);
        self
    }

    pub fn build(self) -> Result<DevicePollingConfig, ConfigError> {
        if self.device_id.trim().is_empty() {
            return Err(ConfigError::Blank { field: "device_id" });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::NotPositive { field: "poll_interval" });
        }
        if self.measurements.is_empty() {
            return Err(ConfigError::NoMeasurements);
        }

        let mut seen_ids = std::collections::HashSet::new();
        for definition in &self.measurements {
            if !seen_ids.insert(definition.id.clone()) {
                return Err(ConfigError::DuplicateMeasurementId(definition.id.clone()));
            }
        }

        if let Some((a, b, category)) = find_overlap(&self.measurements) {
            return Err(ConfigError::OverlappingRanges { a, b, category });
        }

        Ok(DevicePollingConfig {
            device_id: self.device_id,
            poll_interval: self.poll_interval,
            initial_delay: self.initial_delay,
            connection_manager: self.connection_manager,
            measurements: self.measurements,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modbus_client::ClientConfig;
    use types::MeasurementCategory;

    fn manager() -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager::new(ClientConfig::default()).unwrap())
    }

    #[test]
    fn rejects_empty_measurement_list() {
        let err = DevicePollingConfigBuilder::new("dev-1", manager()).build().unwrap_err();
        assert_eq!(err, ConfigError::NoMeasurements);
    }

    #[test]
    fn rejects_duplicate_measurement_ids() {
        let a = MeasurementDefinition::new("hr100", MeasurementCategory::HoldingRegister, 100, 1).unwrap();
        let b = MeasurementDefinition::new("hr100", MeasurementCategory::HoldingRegister, 200, 1).unwrap();
        let err = DevicePollingConfigBuilder::new("dev-1", manager())
            .measurement(a)
            .measurement(b)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateMeasurementId(id) if id == "hr100"));
    }

    #[test]
    fn rejects_overlapping_ranges() {
        let a = MeasurementDefinition::new("a", MeasurementCategory::HoldingRegister, 100, 5).unwrap();
        let b = MeasurementDefinition::new("b", MeasurementCategory::HoldingRegister, 104, 2).unwrap();
        let err = DevicePollingConfigBuilder::new("dev-1", manager())
            .measurement(a)
            .measurement(b)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::OverlappingRanges { .. }));
    }

    #[test]
    fn rejects_zero_poll_interval() {
        let def = MeasurementDefinition::new("a", MeasurementCategory::Coil, 0, 1).unwrap();
        let err = DevicePollingConfigBuilder::new("dev-1", manager())
            .poll_interval(Duration::ZERO)
            .measurement(def)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::NotPositive { field: "poll_interval" });
    }

    #[test]
    fn accepts_valid_config() {
        let def = MeasurementDefinition::new("a", MeasurementCategory::Coil, 0, 1).unwrap();
        let config = DevicePollingConfigBuilder::new("dev-1", manager()).measurement(def).build().unwrap();
        assert_eq!(config.device_id, "dev-1");
        assert_eq!(config.measurements.len(), 1);
    }
}
