//! # Event Types
//!
//! The structured event that travels from a producer to a receiver.
//!
//! ## Event Anatomy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Event                                                                  │
//! │  ├── stream_id         "org.example.Stats:1.0.0"                       │
//! │  ├── timestamp         explicit millis, or enqueue time when absent    │
//! │  ├── meta_data         [ "127.0.0.1" ]             ordered             │
//! │  ├── correlation_data  None | [ ... ]              ordered, optional   │
//! │  ├── payload_data      [ "example", 123.4, 2, ... ]   ordered             │
//! │  └── arbitrary_data    None | { "k": "v", ... }    unordered, optional │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Events are immutable once built. The only "mutation" the agent performs is
//! [`Event::stamped`], which consumes an event without a timestamp and returns
//! one carrying the enqueue time.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Separator between stream name and version in a stream id.
pub const STREAM_ID_DELIMITER: &str = ":";

/// Builds the canonical stream id for a stream name and version.
///
/// ```rust
/// use databridge_core::event::stream_id;
///
/// assert_eq!(stream_id("org.example.MediatorStatistics", "1.0.0"),
///            "org.example.MediatorStatistics:1.0.0");
/// ```
pub fn stream_id(name: &str, version: &str) -> String {
    format!("{}{}{}", name, STREAM_ID_DELIMITER, version)
}

// =============================================================================
// Attribute Value
// =============================================================================

/// One attribute value inside meta, correlation or payload data.
///
/// Mirrors the attribute types a stream definition can declare. Serialized
/// untagged, so `[ "example", 123.4, 2 ]` round-trips through JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Missing attribute.
    Null,
    /// BOOL attribute.
    Bool(bool),
    /// INT attribute.
    Int(i32),
    /// LONG attribute.
    Long(i64),
    /// DOUBLE attribute. JSON decimals decode to this variant.
    Double(f64),
    /// FLOAT attribute.
    Float(f32),
    /// STRING attribute.
    String(String),
}

impl Value {
    /// Returns true for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the string content, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

// =============================================================================
// Event
// =============================================================================

/// A structured event bound for one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    stream_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,

    #[serde(default)]
    meta_data: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_data: Option<Vec<Value>>,

    #[serde(default)]
    payload_data: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    arbitrary_data: Option<HashMap<String, String>>,
}

impl Event {
    /// Starts building an event for the given stream.
    pub fn builder(stream_id: impl Into<String>) -> EventBuilder {
        EventBuilder::new(stream_id)
    }

    /// Target stream id (`name:version`).
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Explicit timestamp in milliseconds since the Unix epoch, if one was set.
    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    /// Meta data values, in declaration order.
    pub fn meta_data(&self) -> &[Value] {
        &self.meta_data
    }

    /// Correlation data values, when present.
    pub fn correlation_data(&self) -> Option<&[Value]> {
        self.correlation_data.as_deref()
    }

    /// Payload values, in declaration order.
    pub fn payload_data(&self) -> &[Value] {
        &self.payload_data
    }

    /// Arbitrary key/value pairs, when present.
    pub fn arbitrary_data(&self) -> Option<&HashMap<String, String>> {
        self.arbitrary_data.as_ref()
    }

    /// Returns this event with its timestamp defaulted to `at`.
    ///
    /// An explicit timestamp always wins.
    pub fn stamped(mut self, at: DateTime<Utc>) -> Self {
        if self.timestamp.is_none() {
            self.timestamp = Some(at.timestamp_millis());
        }
        self
    }
}

// =============================================================================
// Event Builder
// =============================================================================

/// Builder for [`Event`].
///
/// ## Example
/// ```rust
/// use std::collections::HashMap;
/// use databridge_core::{Event, Value};
///
/// let mut arbitrary = HashMap::new();
/// arbitrary.insert("test".to_string(), "testValue".to_string());
///
/// let event = Event::builder("org.example.MediatorStatistics:1.0.0")
///     .meta_data(vec!["127.0.0.1".into()])
///     .payload_data(vec!["example".into(), 123.4.into(), 2.into(), 12.4.into(), 1.3.into()])
///     .arbitrary_data(arbitrary)
///     .build()
///     .unwrap();
///
/// assert_eq!(event.payload_data().len(), 5);
/// assert!(event.correlation_data().is_none());
/// assert_eq!(event.payload_data()[0], Value::String("example".into()));
/// ```
#[derive(Debug, Clone)]
pub struct EventBuilder {
    stream_id: String,
    timestamp: Option<i64>,
    meta_data: Vec<Value>,
    correlation_data: Option<Vec<Value>>,
    payload_data: Vec<Value>,
    arbitrary_data: Option<HashMap<String, String>>,
}

impl EventBuilder {
    /// Creates a builder with empty data sections.
    pub fn new(stream_id: impl Into<String>) -> Self {
        EventBuilder {
            stream_id: stream_id.into(),
            timestamp: None,
            meta_data: Vec::new(),
            correlation_data: None,
            payload_data: Vec::new(),
            arbitrary_data: None,
        }
    }

    /// Sets an explicit timestamp (milliseconds since the Unix epoch).
    pub fn timestamp(mut self, millis: i64) -> Self {
        self.timestamp = Some(millis);
        self
    }

    /// Sets an explicit timestamp from a chrono instant.
    pub fn timestamp_at(self, at: DateTime<Utc>) -> Self {
        self.timestamp(at.timestamp_millis())
    }

    /// Sets the meta data values.
    pub fn meta_data(mut self, values: Vec<Value>) -> Self {
        self.meta_data = values;
        self
    }

    /// Sets the correlation data values. `None` leaves the section absent.
    pub fn correlation_data(mut self, values: impl Into<Option<Vec<Value>>>) -> Self {
        self.correlation_data = values.into();
        self
    }

    /// Sets the payload values.
    pub fn payload_data(mut self, values: Vec<Value>) -> Self {
        self.payload_data = values;
        self
    }

    /// Sets the arbitrary key/value map.
    pub fn arbitrary_data(mut self, data: impl Into<Option<HashMap<String, String>>>) -> Self {
        self.arbitrary_data = data.into();
        self
    }

    /// Builds the event.
    ///
    /// ## Errors
    /// - [`CoreError::Required`] when the stream id is blank
    pub fn build(self) -> CoreResult<Event> {
        if self.stream_id.trim().is_empty() {
            return Err(CoreError::Required {
                field: "stream_id".to_string(),
            });
        }

        Ok(Event {
            stream_id: self.stream_id,
            timestamp: self.timestamp,
            meta_data: self.meta_data,
            correlation_data: self.correlation_data,
            payload_data: self.payload_data,
            arbitrary_data: self.arbitrary_data,
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
