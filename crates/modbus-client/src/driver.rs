use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio_modbus::client::tcp;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::{Reader, Slave, SlaveContext, Writer};
use tracing::debug;
use types::MeasurementCategory;

use crate::error::ClientError;

/// A tagged request address: `"<category>:<address>[<count>]"`.
/// The bracketed count is omitted for single-element reads/writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub category: MeasurementCategory,
    pub address: u16,
    pub count: u16,
}

impl Tag {
    pub fn new(category: MeasurementCategory, address: u16, count: u16) -> Self {
        Self { category, address, count }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.count <= 1 {
            write!(f, "{}:{}", self.category.tag_prefix(), self.address)
        } else {
            write!(f, "{}:{}[{}]", self.category.tag_prefix(), self.address, self.count)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseCode {
    Ok,
    Error(String),
}

/// A per-tag response: a status code plus the typed values the driver
/// decoded for it.
#[derive(Debug, Clone)]
pub struct TagResponse {
    pub tag: Tag,
    pub code: ResponseCode,
    booleans: Option<Vec<bool>>,
    shorts: Option<Vec<u16>>,
}

impl TagResponse {
    pub fn ok_booleans(tag: Tag, values: Vec<bool>) -> Self {
        Self { tag, code: ResponseCode::Ok, booleans: Some(values), shorts: None }
    }

    pub fn ok_shorts(tag: Tag, values: Vec<u16>) -> Self {
        Self { tag, code: ResponseCode::Ok, booleans: None, shorts: Some(values) }
    }

    pub fn error(tag: Tag, message: impl Into<String>) -> Self {
        Self { tag, code: ResponseCode::Error(message.into()), booleans: None, shorts: None }
    }

    fn require_ok(&self) -> Result<(), ClientError> {
        match &self.code {
            ResponseCode::Ok => Ok(()),
            ResponseCode::Error(msg) => {
                Err(ClientError::ProtocolError(format!("tag {}: {msg}", self.tag)))
            }
        }
    }

    pub fn boolean(&self) -> Result<bool, ClientError> {
        self.require_ok()?;
        self.booleans
            .as_ref()
            .and_then(|v| v.first().copied())
            .ok_or_else(|| ClientError::ProtocolError(format!("tag {} returned no boolean value", self.tag)))
    }

    /// Registers travel the wire as 16-bit words; the API exposes them as
    /// unsigned ints by masking with `0xFFFF`.
    pub fn short(&self) -> Result<u16, ClientError> {
        self.require_ok()?;
        self.shorts
            .as_ref()
            .and_then(|v| v.first().copied())
            .map(|v| v & 0xFFFF)
            .ok_or_else(|| ClientError::ProtocolError(format!("tag {} returned no register value", self.tag)))
    }

    pub fn all_booleans(&self) -> Result<&[bool], ClientError> {
        self.require_ok()?;
        self.booleans
            .as_deref()
            .ok_or_else(|| ClientError::ProtocolError(format!("tag {} returned no boolean values", self.tag)))
    }

    pub fn all_shorts(&self) -> Result<Vec<u16>, ClientError> {
        self.require_ok()?;
        self.shorts
            .as_ref()
            .map(|values| values.iter().map(|v| v & 0xFFFF).collect())
            .ok_or_else(|| ClientError::ProtocolError(format!("tag {} returned no register values", self.tag)))
    }
}

/// The transport boundary this workspace consumes: opens a connection
/// to a Modbus endpoint and executes tagged reads/writes against it. The
/// wire-level PDU encoding itself lives in `tokio-modbus` and is opaque here.
#[async_trait]
pub trait TransportDriver: Send + Sync {
    async fn read(&mut self, tag: Tag) -> Result<TagResponse, ClientError>;
    async fn write_booleans(&mut self, tag: Tag, values: &[bool]) -> Result<TagResponse, ClientError>;
    async fn write_shorts(&mut self, tag: Tag, values: &[u16]) -> Result<TagResponse, ClientError>;
    fn is_connected(&self) -> bool;
    async fn close(&mut self);
}

/// Opens a `TransportDriver` for an opaque connection string. Canonical
/// forms: `modbus:tcp://<host>:<port>?unit-identifier=<n>` and
/// `modbus:rtu-tcp://...`; both are carried over plain TCP since RTU
/// framing over a TCP byte stream is transparent to `tokio-modbus`.
pub async fn open(connection_string: &str) -> Result<Box<dyn TransportDriver>, ClientError> {
    let (addr, unit_id) = parse_connection_string(connection_string)?;
    let driver = TokioModbusDriver::connect(addr, unit_id).await?;
    Ok(Box::new(driver))
}

fn parse_connection_string(connection_string: &str) -> Result<(SocketAddr, u8), ClientError> {
    let without_scheme = connection_string
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(connection_string);
    let (host_port, query) = without_scheme.split_once('?').unwrap_or((without_scheme, ""));

    let addr: SocketAddr = host_port.parse().map_err(|_| {
        ClientError::TransportError(format!("invalid host:port in connection string '{connection_string}'"))
    })?;

    let unit_id = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("unit-identifier="))
        .and_then(|value| value.parse::<u8>().ok())
        .unwrap_or(1);

    Ok((addr, unit_id))
}

/// `TransportDriver` backed by a real `tokio-modbus` TCP context: connect
/// once, reuse the context, set the unit id per call.
pub struct TokioModbusDriver {
    ctx: Context,
    unit_id: u8,
}

impl TokioModbusDriver {
    pub async fn connect(addr: SocketAddr, unit_id: u8) -> Result<Self, ClientError> {
        let ctx = tcp::connect(addr)
            .await
            .map_err(|err| ClientError::TransportError(err.to_string()))?;
        debug!(%addr, unit_id, "modbus transport connected");
        Ok(Self { ctx, unit_id })
    }
}

#[async_trait]
impl TransportDriver for TokioModbusDriver {
    async fn read(&mut self, tag: Tag) -> Result<TagResponse, ClientError> {
        self.ctx.set_slave(Slave(self.unit_id));
        use MeasurementCategory::*;
        match tag.category {
            Coil => match self.ctx.read_coils(tag.address, tag.count).await {
                Ok(values) => Ok(TagResponse::ok_booleans(tag, values)),
                Err(err) => Ok(TagResponse::error(tag, err.to_string())),
            },
            DiscreteInput => match self.ctx.read_discrete_inputs(tag.address, tag.count).await {
                Ok(values) => Ok(TagResponse::ok_booleans(tag, values)),
                Err(err) => Ok(TagResponse::error(tag, err.to_string())),
            },
            HoldingRegister => match self.ctx.read_holding_registers(tag.address, tag.count).await {
                Ok(values) => Ok(TagResponse::ok_shorts(tag, values)),
                Err(err) => Ok(TagResponse::error(tag, err.to_string())),
            },
            InputRegister => match self.ctx.read_input_registers(tag.address, tag.count).await {
                Ok(values) => Ok(TagResponse::ok_shorts(tag, values)),
                Err(err) => Ok(TagResponse::error(tag, err.to_string())),
            },
        }
    }

    async fn write_booleans(&mut self, tag: Tag, values: &[bool]) -> Result<TagResponse, ClientError> {
        self.ctx.set_slave(Slave(self.unit_id));
        let result = if values.len() <= 1 {
            let value = values.first().copied().unwrap_or(false);
            self.ctx.write_single_coil(tag.address, value).await
        } else {
            self.ctx.write_multiple_coils(tag.address, values).await
        };
        match result {
            Ok(()) => Ok(TagResponse::ok_booleans(tag, values.to_vec())),
            Err(err) => Ok(TagResponse::error(tag, err.to_string())),
        }
    }

    async fn write_shorts(&mut self, tag: Tag, values: &[u16]) -> Result<TagResponse, ClientError> {
        self.ctx.set_slave(Slave(self.unit_id));
        let masked: Vec<u16> = values.iter().map(|v| v & 0xFFFF).collect();
        let result = if masked.len() <= 1 {
            let value = masked.first().copied().unwrap_or(0);
            self.ctx.write_single_register(tag.address, value).await
        } else {
            self.ctx.write_multiple_registers(tag.address, &masked).await
        };
        match result {
            Ok(()) => Ok(TagResponse::ok_shorts(tag, masked)),
            Err(err) => Ok(TagResponse::error(tag, err.to_string())),
        }
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn close(&mut self) {
        let _ = self.ctx.disconnect().await;
    }
}
