//! Declarative per-device polling configuration, address batching, a
//! fixed-rate polling scheduler, and an in-process event bus sitting on
//! top of `modbus-client`'s `ConnectionManager`.

mod batch;
mod config;
mod event_bus;
mod scheduler;

pub use batch::BatchPlanner;
pub use config::{DevicePollingConfig, DevicePollingConfigBuilder};
pub use event_bus::{debug_logging_subscriber, EventBus, SubscriptionHandle};
pub use scheduler::{PollingScheduler, SchedulerError};
