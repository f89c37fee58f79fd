use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};

use modbus_client::{ClientError, ConnectionManager};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;
use types::{Batch, ConfigError, MeasurementCategory, MeasurementEvent, MeasurementSample, SampleValue, Slice};

use crate::batch::BatchPlanner;
use crate::config::DevicePollingConfig;
use crate::event_bus::EventBus;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to start connection: {0}")]
    Connection(#[from] ClientError),
}

#[derive(Debug, Error)]
enum PollError {
    #[error(transparent)]
    Connection(#[from] ClientError),
    #[error("batch for {category} returned {returned} values, expected at least {expected}")]
    ShortBatch { category: MeasurementCategory, returned: usize, expected: usize },
}

struct DeviceHandle {
    cancelled: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
    task: JoinHandle<()>,
    last_error: Arc<Mutex<Option<String>>>,
    connection_manager: Arc<ConnectionManager>,
}

/// Periodically polls registered devices, batches reads via each device's
/// `ConnectionManager`, and publishes `MeasurementEvent`s on an `EventBus`.
pub struct PollingScheduler {
    devices: Mutex<HashMap<String, DeviceHandle>>,
    event_bus: EventBus,
}

impl Default for PollingScheduler {
    fn default() -> Self {
        Self::new(EventBus::new())
    }
}

impl PollingScheduler {
    pub fn new(event_bus: EventBus) -> Self {
        Self { devices: Mutex::new(HashMap::new()), event_bus }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Fails if `device_id` is already registered or the planner yields no
    /// batches; otherwise starts the connection manager and schedules a
    /// fixed-rate polling task.
    pub async fn register_device(&self, config: DevicePollingConfig) -> Result<(), SchedulerError> {
        {
            let devices = self.devices.lock().unwrap_or_else(|p| p.into_inner());
            if devices.contains_key(&config.device_id) {
                return Err(SchedulerError::Config(ConfigError::DuplicateDevice(config.device_id.clone())));
            }
        }

        let batches = BatchPlanner::plan(&config.measurements);
        if batches.is_empty() {
            return Err(SchedulerError::Config(ConfigError::NoMeasurements));
        }

        config.connection_manager.start().await?;

        let device_id = config.device_id.clone();
        let connection_manager = config.connection_manager.clone();
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancel_notify = Arc::new(Notify::new());
        let in_flight = Arc::new(AtomicBool::new(false));
        let last_error = Arc::new(Mutex::new(None));

        let task = tokio::spawn(run_device(
            device_id.clone(),
            config,
            batches,
            self.event_bus.clone(),
            in_flight,
            cancelled.clone(),
            cancel_notify.clone(),
            last_error.clone(),
        ));

        self.devices.lock().unwrap_or_else(|p| p.into_inner()).insert(
            device_id,
            DeviceHandle { cancelled, cancel_notify, task, last_error, connection_manager },
        );
        Ok(())
    }

    /// Cancels the device's task without interrupting an in-flight tick,
    /// then stops its `ConnectionManager`. Idempotent on unknown ids.
    pub async fn unregister_device(&self, device_id: &str) {
        let handle = self.devices.lock().unwrap_or_else(|p| p.into_inner()).remove(device_id);
        if let Some(handle) = handle {
            handle.cancelled.store(true, Ordering::SeqCst);
            handle.cancel_notify.notify_waiters();
            let _ = handle.task.await;
            handle.connection_manager.stop().await;
        }
    }

    pub fn is_registered(&self, device_id: &str) -> bool {
        self.devices.lock().unwrap_or_else(|p| p.into_inner()).contains_key(device_id)
    }

    pub fn last_error(&self, device_id: &str) -> Option<String> {
        self.devices
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(device_id)
            .and_then(|handle| handle.last_error.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    /// Cancels all tasks (interrupting in-flight ticks via `abort`), stops
    /// every `ConnectionManager`, and clears registrations.
    pub async fn close(&self) {
        let handles: Vec<DeviceHandle> =
            self.devices.lock().unwrap_or_else(|p| p.into_inner()).drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.cancelled.store(true, Ordering::SeqCst);
            handle.task.abort();
            handle.connection_manager.stop().await;
        }
    }
}

async fn run_device(
    device_id: String,
    config: DevicePollingConfig,
    batches: Vec<Batch>,
    event_bus: EventBus,
    in_flight: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
    last_error: Arc<Mutex<Option<String>>>,
) {
    tokio::time::sleep(config.initial_delay).await;

    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel_notify.notified() => break,
        }
        if cancelled.load(Ordering::SeqCst) {
            break;
        }
        run_tick(&device_id, &config, &batches, &event_bus, &in_flight, &last_error).await;
    }
}

/// One poll cycle: backpressure guard, sequential batch reads, sample
/// slicing in declared order, and event publication.
async fn run_tick(
    device_id: &str,
    config: &DevicePollingConfig,
    batches: &[Batch],
    event_bus: &EventBus,
    in_flight: &AtomicBool,
    last_error: &Mutex<Option<String>>,
) {
    if in_flight.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
        metrics::counter!("modbus.poll.backpressure", "device" => device_id.to_string()).increment(1);
        return;
    }

    let start = Instant::now();
    match poll_once(config, batches).await {
        Ok(event) => {
            metrics::histogram!("modbus.poll.duration", "device" => device_id.to_string())
                .record(start.elapsed().as_secs_f64());
            event_bus.publish(&event);
            *last_error.lock().unwrap_or_else(|p| p.into_inner()) = None;
        }
        Err(err) => {
            metrics::counter!("modbus.poll.errors", "device" => device_id.to_string()).increment(1);
            warn!(device_id, error = %err, "poll cycle failed");
            *last_error.lock().unwrap_or_else(|p| p.into_inner()) = Some(err.to_string());
        }
    }

    in_flight.store(false, Ordering::SeqCst);
}

async fn poll_once(config: &DevicePollingConfig, batches: &[Batch]) -> Result<MeasurementEvent, PollError> {
    let manager = &config.connection_manager;
    let mut values_by_id: HashMap<String, SampleValue> = HashMap::new();

    for batch in batches {
        match batch.category {
            MeasurementCategory::Coil => {
                let values = manager.read_coils(batch.start_address, batch.count).await?;
                require_len(&values, batch)?;
                for slice in &batch.slices {
                    insert_bool_sample(&mut values_by_id, slice, &values);
                }
            }
            MeasurementCategory::DiscreteInput => {
                let values = manager.read_discrete_inputs(batch.start_address, batch.count).await?;
                require_len(&values, batch)?;
                for slice in &batch.slices {
                    insert_bool_sample(&mut values_by_id, slice, &values);
                }
            }
            MeasurementCategory::HoldingRegister => {
                let values = manager.read_holding_registers(batch.start_address, batch.count).await?;
                require_len(&values, batch)?;
                for slice in &batch.slices {
                    insert_reg_sample(&mut values_by_id, slice, &values);
                }
            }
            MeasurementCategory::InputRegister => {
                let values = manager.read_input_registers(batch.start_address, batch.count).await?;
                require_len(&values, batch)?;
                for slice in &batch.slices {
                    insert_reg_sample(&mut values_by_id, slice, &values);
                }
            }
        }
    }

    let mut samples = Vec::with_capacity(config.measurements.len());
    for definition in &config.measurements {
        let value = values_by_id
            .remove(&definition.id)
            .expect("every declared measurement is covered by exactly one batch slice");
        samples.push(MeasurementSample::new(Arc::new(definition.clone()), value));
    }

    Ok(MeasurementEvent::new(config.device_id.clone(), SystemTime::now(), samples))
}

fn require_len<T>(values: &[T], batch: &Batch) -> Result<(), PollError> {
    if values.len() < batch.count as usize {
        return Err(PollError::ShortBatch {
            category: batch.category,
            returned: values.len(),
            expected: batch.count as usize,
        });
    }
    Ok(())
}

fn insert_bool_sample(map: &mut HashMap<String, SampleValue>, slice: &Slice, values: &[bool]) {
    let start = slice.offset as usize;
    let count = slice.definition.count as usize;
    let value = if count == 1 {
        SampleValue::BoolScalar(values[start])
    } else {
        SampleValue::BoolSeq(values[start..start + count].to_vec())
    };
    map.insert(slice.definition.id.clone(), value);
}

fn insert_reg_sample(map: &mut HashMap<String, SampleValue>, slice: &Slice, values: &[u16]) {
    let start = slice.offset as usize;
    let count = slice.definition.count as usize;
    let value = if count == 1 {
        SampleValue::RegScalar(values[start])
    } else {
        SampleValue::RegSeq(values[start..start + count].to_vec())
    };
    map.insert(slice.definition.id.clone(), value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DevicePollingConfigBuilder;
    use async_trait::async_trait;
    use modbus_client::{ClientConfig, Tag, TagResponse, TransportDriver};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use types::MeasurementDefinition;

    struct FixedRegisterDriver {
        value: u16,
        reads: Arc<AtomicU32>,
    }

    #[async_trait]
    impl TransportDriver for FixedRegisterDriver {
        async fn read(&mut self, tag: Tag) -> Result<TagResponse, ClientError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(TagResponse::ok_shorts(tag, vec![self.value; tag.count.max(1) as usize]))
        }
        async fn write_booleans(&mut self, tag: Tag, values: &[bool]) -> Result<TagResponse, ClientError> {
            Ok(TagResponse::ok_booleans(tag, values.to_vec()))
        }
        async fn write_shorts(&mut self, tag: Tag, values: &[u16]) -> Result<TagResponse, ClientError> {
            Ok(TagResponse::ok_shorts(tag, values.to_vec()))
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn close(&mut self) {}
    }

    fn fast_client_config() -> ClientConfig {
        ClientConfig {
            connection_string: "fake://scheduler".to_string(),
            request_timeout: Duration::from_millis(200),
            max_retries: 1,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn single_register_poll_publishes_decoded_value() {
        let reads = Arc::new(AtomicU32::new(0));
        let driver = FixedRegisterDriver { value: 0x1234, reads: reads.clone() };
        let manager = Arc::new(ConnectionManager::for_testing(fast_client_config(), Box::new(driver)).unwrap());

        let def = MeasurementDefinition::new("hr100", MeasurementCategory::HoldingRegister, 100, 1).unwrap();
        let config = DevicePollingConfigBuilder::new("dev-1", manager)
            .poll_interval(Duration::from_millis(20))
            .measurement(def)
            .build()
            .unwrap();

        let scheduler = PollingScheduler::default();
        let received = Arc::new(Mutex::new(None));
        let received_clone = received.clone();
        let _handle = scheduler.event_bus().subscribe(move |event| {
            *received_clone.lock().unwrap() = Some(event.clone());
        });

        scheduler.register_device(config).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.close().await;

        let event = received.lock().unwrap().clone().expect("event published");
        assert_eq!(event.samples.len(), 1);
        assert_eq!(event.samples[0].as_register().unwrap(), 0x1234);
        assert!(reads.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn duplicate_device_id_is_rejected() {
        let manager = Arc::new(
            ConnectionManager::for_testing(
                fast_client_config(),
                Box::new(FixedRegisterDriver { value: 1, reads: Arc::new(AtomicU32::new(0)) }),
            )
            .unwrap(),
        );
        let def = MeasurementDefinition::new("hr1", MeasurementCategory::HoldingRegister, 1, 1).unwrap();
        let config_a = DevicePollingConfigBuilder::new("dev-x", manager.clone()).measurement(def.clone()).build().unwrap();
        let config_b = DevicePollingConfigBuilder::new("dev-x", manager).measurement(def).build().unwrap();

        let scheduler = PollingScheduler::default();
        scheduler.register_device(config_a).await.unwrap();
        let err = scheduler.register_device(config_b).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Config(ConfigError::DuplicateDevice(_))));
        scheduler.close().await;
    }

    #[tokio::test]
    async fn unregister_is_idempotent_on_unknown_device() {
        let scheduler = PollingScheduler::default();
        scheduler.unregister_device("does-not-exist").await;
        assert!(!scheduler.is_registered("does-not-exist"));
    }
}
