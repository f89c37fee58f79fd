#![allow(dead_code)]

//! Shared data model for the Modbus connection manager and polling engine:
//! measurement declarations, typed sample values, batching primitives, and
//! connection health snapshots. No crate in this workspace owns a concrete
//! transport; this crate owns none at all.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The four standard Modbus object categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeasurementCategory {
    Coil,
    DiscreteInput,
    HoldingRegister,
    InputRegister,
}

impl MeasurementCategory {
    /// True for the single-bit categories (coils, discrete inputs).
    pub fn is_boolean(self) -> bool {
        matches!(self, MeasurementCategory::Coil | MeasurementCategory::DiscreteInput)
    }

    /// The tag-string prefix used when addressing the transport.
    pub fn tag_prefix(self) -> &'static str {
        match self {
            MeasurementCategory::Coil => "coil",
            MeasurementCategory::DiscreteInput => "discrete-input",
            MeasurementCategory::HoldingRegister => "holding-register",
            MeasurementCategory::InputRegister => "input-register",
        }
    }
}

impl fmt::Display for MeasurementCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag_prefix())
    }
}

/// Errors raised by builders in this workspace. Never retried; surfaced
/// straight to the caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must not be blank")]
    Blank { field: &'static str },
    #[error("{field} must be > 0")]
    NotPositive { field: &'static str },
    #[error("jitter must be within [0, 1], got {0}")]
    JitterOutOfRange(f64),
    #[error("measurement count must be >= 1")]
    ZeroCount,
    #[error("duplicate measurement id '{0}'")]
    DuplicateMeasurementId(String),
    #[error("device '{0}' is already registered")]
    DuplicateDevice(String),
    #[error("a device polling config needs at least one measurement")]
    NoMeasurements,
    #[error("measurements '{a}' and '{b}' have overlapping address ranges in category {category}")]
    OverlappingRanges {
        a: String,
        b: String,
        category: MeasurementCategory,
    },
}

/// An immutable description of one thing to poll: an address range within a
/// category, addressed under a stable `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementDefinition {
    pub id: String,
    pub category: MeasurementCategory,
    pub address: u16,
    pub count: u16,
}

impl MeasurementDefinition {
    pub fn new(
        id: impl Into<String>,
        category: MeasurementCategory,
        address: u16,
        count: u16,
    ) -> Result<Self, ConfigError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ConfigError::Blank { field: "measurement.id" });
        }
        if count == 0 {
            return Err(ConfigError::ZeroCount);
        }
        Ok(Self { id, category, address, count })
    }

    /// One past the last address this definition covers.
    pub fn end_exclusive(&self) -> u32 {
        u32::from(self.address) + u32::from(self.count)
    }

    fn overlaps(&self, other: &MeasurementDefinition) -> bool {
        self.category == other.category
            && u32::from(self.address) < other.end_exclusive()
            && u32::from(other.address) < self.end_exclusive()
    }
}

/// A single typed measurement value, tagged by category and arity.
/// Implementations must match exhaustively rather than probing at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SampleValue {
    BoolScalar(bool),
    BoolSeq(Vec<bool>),
    RegScalar(u16),
    RegSeq(Vec<u16>),
}

/// Raised when a typed accessor is used against the wrong `SampleValue`
/// variant ("fails loudly when asked for the wrong variant").
#[derive(Debug, Clone, PartialEq, Error)]
#[error("sample for '{definition_id}' is not a {expected}")]
pub struct SampleAccessError {
    pub definition_id: String,
    pub expected: &'static str,
}

/// A `MeasurementDefinition` paired with the value read for it in one poll
/// cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSample {
    pub definition: Arc<MeasurementDefinition>,
    pub value: SampleValue,
}

impl MeasurementSample {
    pub fn new(definition: Arc<MeasurementDefinition>, value: SampleValue) -> Self {
        Self { definition, value }
    }

    pub fn as_bool(&self) -> Result<bool, SampleAccessError> {
        match self.value {
            SampleValue::BoolScalar(v) => Ok(v),
            _ => Err(self.access_error("boolean scalar")),
        }
    }

    pub fn as_bool_seq(&self) -> Result<&[bool], SampleAccessError> {
        match &self.value {
            SampleValue::BoolSeq(v) => Ok(v),
            _ => Err(self.access_error("boolean sequence")),
        }
    }

    pub fn as_register(&self) -> Result<u16, SampleAccessError> {
        match self.value {
            SampleValue::RegScalar(v) => Ok(v),
            _ => Err(self.access_error("register scalar")),
        }
    }

    pub fn as_register_seq(&self) -> Result<&[u16], SampleAccessError> {
        match &self.value {
            SampleValue::RegSeq(v) => Ok(v),
            _ => Err(self.access_error("register sequence")),
        }
    }

    fn access_error(&self, expected: &'static str) -> SampleAccessError {
        SampleAccessError { definition_id: self.definition.id.clone(), expected }
    }
}

/// Published once per successful poll cycle. Sample order equals the
/// declaring `DevicePollingConfig`'s order, not batch order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementEvent {
    pub device_id: String,
    #[serde(with = "system_time_millis")]
    pub timestamp: SystemTime,
    pub samples: Vec<MeasurementSample>,
}

impl MeasurementEvent {
    pub fn new(device_id: impl Into<String>, timestamp: SystemTime, samples: Vec<MeasurementSample>) -> Self {
        Self { device_id: device_id.into(), timestamp, samples }
    }
}

/// One slice of a `Batch`: the definition it fulfills and its offset into
/// the batch's value array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slice {
    pub definition: Arc<MeasurementDefinition>,
    pub offset: u16,
}

/// A single contiguous-address wire transaction covering one category,
/// produced by `BatchPlanner::plan`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub category: MeasurementCategory,
    pub start_address: u16,
    pub count: u16,
    pub slices: Vec<Slice>,
}

impl Batch {
    pub fn end_exclusive(&self) -> u32 {
        u32::from(self.start_address) + u32::from(self.count)
    }
}

/// Health of a `ConnectionManager`, observable via `health()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Created but `start()` not yet called, or the reconnect loop has not
    /// yet attempted a connection.
    Initial,
    Healthy,
    Connecting,
    Unhealthy,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionHealth {
    pub status: ConnectionStatus,
    #[serde(with = "option_system_time_millis")]
    pub last_connected_at: Option<SystemTime>,
    #[serde(with = "option_system_time_millis")]
    pub last_attempt_at: Option<SystemTime>,
    pub last_error: Option<String>,
}

impl ConnectionHealth {
    pub fn initial() -> Self {
        Self {
            status: ConnectionStatus::Initial,
            last_connected_at: None,
            last_attempt_at: None,
            last_error: None,
        }
    }
}

/// Checks whether `definitions` contain any overlapping address range within
/// the same category; returns the first overlapping pair found. Used by the
/// `DevicePollingConfig` builder to reject overlaps eagerly at configuration
/// time rather than leaving them undefined in the planner.
pub fn find_overlap(definitions: &[MeasurementDefinition]) -> Option<(String, String, MeasurementCategory)> {
    for i in 0..definitions.len() {
        for j in (i + 1)..definitions.len() {
            if definitions[i].overlaps(&definitions[j]) {
                return Some((
                    definitions[i].id.clone(),
                    definitions[j].id.clone(),
                    definitions[i].category,
                ));
            }
        }
    }
    None
}

mod system_time_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub fn serialize<S: Serializer>(value: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = value
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SystemTime, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(UNIX_EPOCH + Duration::from_millis(millis))
    }
}

mod option_system_time_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub fn serialize<S: Serializer>(value: &Option<SystemTime>, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = value.map(|t| t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_millis() as u64);
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<SystemTime>, D::Error> {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(|m| UNIX_EPOCH + Duration::from_millis(m)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_rejects_blank_id() {
        let err = MeasurementDefinition::new("  ", MeasurementCategory::Coil, 0, 1).unwrap_err();
        assert_eq!(err, ConfigError::Blank { field: "measurement.id" });
    }

    #[test]
    fn definition_rejects_zero_count() {
        let err = MeasurementDefinition::new("a", MeasurementCategory::Coil, 0, 0).unwrap_err();
        assert_eq!(err, ConfigError::ZeroCount);
    }

    #[test]
    fn end_exclusive_is_address_plus_count() {
        let def = MeasurementDefinition::new("a", MeasurementCategory::HoldingRegister, 100, 2).unwrap();
        assert_eq!(def.end_exclusive(), 102);
    }

    #[test]
    fn overlap_detected_within_same_category() {
        let a = MeasurementDefinition::new("a", MeasurementCategory::HoldingRegister, 100, 5).unwrap();
        let b = MeasurementDefinition::new("b", MeasurementCategory::HoldingRegister, 104, 2).unwrap();
        let found = find_overlap(&[a, b]);
        assert!(found.is_some());
    }

    #[test]
    fn adjacent_ranges_do_not_overlap() {
        let a = MeasurementDefinition::new("a", MeasurementCategory::HoldingRegister, 100, 2).unwrap();
        let b = MeasurementDefinition::new("b", MeasurementCategory::HoldingRegister, 102, 2).unwrap();
        assert!(find_overlap(&[a, b]).is_none());
    }

    #[test]
    fn overlap_ignores_different_categories() {
        let a = MeasurementDefinition::new("a", MeasurementCategory::HoldingRegister, 100, 5).unwrap();
        let b = MeasurementDefinition::new("b", MeasurementCategory::Coil, 100, 5).unwrap();
        assert!(find_overlap(&[a, b]).is_none());
    }

    #[test]
    fn sample_accessor_fails_loudly_on_wrong_variant() {
        let def = Arc::new(MeasurementDefinition::new("a", MeasurementCategory::Coil, 0, 1).unwrap());
        let sample = MeasurementSample::new(def, SampleValue::BoolScalar(true));
        assert!(sample.as_register().is_err());
        assert!(sample.as_bool().unwrap());
    }
}
