mod config;
mod http;

pub use config::{CollectorConfig, ConnectionEntry, DeviceEntry, MeasurementEntry};
pub use http::{build_router, AppState};

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use modbus_client::ConnectionManager;
use poller_actor::{debug_logging_subscriber, DevicePollingConfigBuilder, EventBus, PollingScheduler};
use types::MeasurementDefinition;

/// Everything `main` needs to run the HTTP server and poll registered
/// devices: the scheduler (owns per-device tasks), the named connection
/// table (for `/health`), and the event bus (for subscribers beyond the
/// built-in debug logger).
pub struct Collector {
    pub scheduler: Arc<PollingScheduler>,
    pub connections: Arc<HashMap<String, Arc<ConnectionManager>>>,
    pub event_bus: EventBus,
}

/// Builds `ConnectionManager`s and `DevicePollingConfig`s from `config` and
/// registers every device with a fresh `PollingScheduler`.
pub async fn build_collector(config: &CollectorConfig) -> Result<Collector> {
    let event_bus = EventBus::new();
    event_bus.subscribe(debug_logging_subscriber);

    let mut connections = HashMap::with_capacity(config.connections.len());
    for entry in &config.connections {
        let manager = Arc::new(
            ConnectionManager::new(entry.client.clone())
                .with_context(|| format!("connection '{}'", entry.name))?,
        );
        connections.insert(entry.name.clone(), manager);
    }
    let connections = Arc::new(connections);

    let scheduler = Arc::new(PollingScheduler::new(event_bus.clone()));

    for device in &config.devices {
        let connection_manager = connections
            .get(&device.connection)
            .cloned()
            .with_context(|| format!("device '{}' references unknown connection '{}'", device.device_id, device.connection))?;

        let mut builder = DevicePollingConfigBuilder::new(device.device_id.clone(), connection_manager)
            .poll_interval(device.poll_interval)
            .initial_delay(device.initial_delay);

        for measurement in &device.measurements {
            let definition =
                MeasurementDefinition::new(measurement.id.clone(), measurement.category, measurement.address, measurement.count)
                    .with_context(|| format!("device '{}' measurement '{}'", device.device_id, measurement.id))?;
            builder = builder.measurement(definition);
        }

        let polling_config = builder.build().with_context(|| format!("device '{}'", device.device_id))?;
        scheduler
            .register_device(polling_config)
            .await
            .with_context(|| format!("registering device '{}'", device.device_id))?;
    }

    Ok(Collector { scheduler, connections, event_bus })
}
