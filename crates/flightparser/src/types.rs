use std::sync::Arc;

use crate::metadata::Type;
use crate::value::Value;

// === Error types ===

/// Errors that can occur while decoding a recording.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A read went past the data known to be committed.
    /// In streaming mode this means "wait for more data".
    #[error("read at position {position} past valid size {size}")]
    Truncated { position: u64, size: u64 },

    #[error("invalid chunk magic at position {0}")]
    InvalidMagic(u64),

    #[error("unsupported recording version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("invalid record size {size} at position {position}")]
    InvalidRecordSize { position: u64, size: i64 },

    #[error("expected metadata record at position {position}, found type {found}")]
    ExpectedMetadata { position: u64, found: i64 },

    #[error("expected checkpoint record at position {position}, found type {found}")]
    ExpectedCheckpoint { position: u64, found: i64 },

    #[error("checkpoint at position {position} does not match its declared size")]
    CheckpointSizeMismatch { position: u64 },

    #[error("checkpoint chain revisits position {position}")]
    CheckpointCycle { position: u64 },

    #[error("unknown primitive type: {0}")]
    UnknownPrimitive(String),

    #[error("type id {0} is not declared in metadata")]
    MissingType(u64),

    #[error("no parser for constant pool of type id {0}")]
    MissingParser(u64),

    #[error("constant pool for {0} has no entries")]
    EmptyPool(String),

    #[error("invalid string encoding: {0}")]
    InvalidStringEncoding(u8),

    #[error("invalid length {length} at position {position}")]
    InvalidLength { position: u64, length: i64 },

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// The reader was closed while waiting for data.
    #[error("reader closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ParseError>;

// === Time conversion ===

/// Converts chunk-relative ticks into wall-clock nanoseconds.
#[derive(Debug, Clone, Copy)]
pub struct TimeConverter {
    start_ticks: i64,
    start_nanos: i64,
    divisor: f64,
}

impl TimeConverter {
    pub fn new(start_ticks: i64, start_nanos: i64, ticks_per_second: i64) -> Self {
        Self {
            start_ticks,
            start_nanos,
            divisor: ticks_per_second as f64 / 1_000_000_000.0,
        }
    }

    /// Convert a tick timestamp to nanoseconds since the Unix epoch.
    pub fn convert_timestamp(&self, ticks: i64) -> i64 {
        let elapsed = ticks.saturating_sub(self.start_ticks) as f64 / self.divisor;
        self.start_nanos.saturating_add(elapsed as i64)
    }

    /// Convert a tick duration to nanoseconds.
    pub fn convert_timespan(&self, ticks: i64) -> i64 {
        (ticks as f64 / self.divisor) as i64
    }
}

// === Events ===

/// A decoded event.
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub event_type: Arc<Type>,
    pub start_ticks: i64,
    pub end_ticks: i64,
    pub start_nanos: i64,
    pub end_nanos: i64,
    /// Field values, excluding the start time and duration.
    pub values: Vec<Value>,
}

impl RecordedEvent {
    pub fn name(&self) -> &str {
        &self.event_type.name
    }

    pub fn duration_nanos(&self) -> i64 {
        self.end_nanos - self.start_nanos
    }

    /// Looks up a field value by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        let offset = self.event_type.event_value_offset();
        self.event_type.fields[offset..]
            .iter()
            .position(|f| f.name == name)
            .and_then(|i| self.values.get(i))
    }
}
