//! Connection management and typed read/write operations for a single
//! Modbus endpoint: reconnect with backoff, retry coordinated with
//! reconnect, and a tagged request/response surface consumed by the
//! polling engine.

mod backoff;
mod config;
mod driver;
mod error;
mod manager;

pub use backoff::compute_backoff;
pub use config::ClientConfig;
pub use driver::{ResponseCode, Tag, TagResponse, TransportDriver};
pub use error::ClientError;
pub use manager::ConnectionManager;

pub use types::{ConnectionHealth, ConnectionStatus, MeasurementCategory};
