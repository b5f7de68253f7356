pub mod handlers;
pub mod instance;
pub mod meta;
pub mod sink;
pub mod slave;

use std::collections::HashSet;
use std::fmt;
use std::io;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Row-change kinds surfaced to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
  #[serde(rename = "INSERT")]
  Insert,
  #[serde(rename = "UPDATE")]
  Update,
  #[serde(rename = "DELETE")]
  Delete,
}

impl fmt::Display for EventType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      EventType::Insert => write!(f, "INSERT"),
      EventType::Update => write!(f, "UPDATE"),
      EventType::Delete => write!(f, "DELETE"),
    }
  }
}

impl std::str::FromStr for EventType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "INSERT" => Ok(EventType::Insert),
      "UPDATE" => Ok(EventType::Update),
      "DELETE" => Ok(EventType::Delete),
      other => Err(format!("unknown event type {}", other)),
    }
  }
}

pub fn all_event_types() -> HashSet<EventType> {
  [EventType::Insert, EventType::Update, EventType::Delete].into()
}

/// A location in the primary's binlog. The empty file name with offset 4
/// means "start from the primary's current head".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
  #[serde(rename = "name")]
  pub file: String,
  #[serde(rename = "pos")]
  pub offset: u32,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub gtid_set: Option<String>,
}

impl Default for Position {
  fn default() -> Self {
    Self {
      file: String::new(),
      offset: 4,
      gtid_set: None,
    }
  }
}

impl fmt::Display for Position {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.file, self.offset)
  }
}

/// A decoded column value. Binary payloads keep their original bytes in
/// memory; the lossy UTF-8 rendering happens only when an event crosses the
/// JSON boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
  Null,
  Int(i64),
  UInt(u64),
  Float(f64),
  Decimal(String),
  String(String),
  Bytes(Vec<u8>),
  DateTime(String),
}

impl ColumnValue {
  pub fn is_null(&self) -> bool {
    matches!(self, ColumnValue::Null)
  }
}

impl Serialize for ColumnValue {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    match self {
      ColumnValue::Null => serializer.serialize_unit(),
      ColumnValue::Int(v) => serializer.serialize_i64(*v),
      ColumnValue::UInt(v) => serializer.serialize_u64(*v),
      ColumnValue::Float(v) => serializer.serialize_f64(*v),
      ColumnValue::Decimal(v) | ColumnValue::String(v) | ColumnValue::DateTime(v) => serializer.serialize_str(v),
      ColumnValue::Bytes(v) => serializer.serialize_str(&String::from_utf8_lossy(v)),
    }
  }
}

impl<'de> Deserialize<'de> for ColumnValue {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: serde::Deserializer<'de>,
  {
    struct ScalarVisitor;

    impl<'de> serde::de::Visitor<'de> for ScalarVisitor {
      type Value = ColumnValue;

      fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a null, number or string column value")
      }

      fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
        Ok(ColumnValue::Null)
      }

      fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
        Ok(ColumnValue::Int(v))
      }

      fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(match i64::try_from(v) {
          Ok(v) => ColumnValue::Int(v),
          Err(_) => ColumnValue::UInt(v),
        })
      }

      fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Self::Value, E> {
        Ok(ColumnValue::Float(v))
      }

      fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
        Ok(ColumnValue::String(v.to_string()))
      }

      fn visit_string<E: serde::de::Error>(self, v: String) -> Result<Self::Value, E> {
        Ok(ColumnValue::String(v))
      }
    }

    deserializer.deserialize_any(ScalarVisitor)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
  pub name: String,
  #[serde(rename = "type")]
  pub column_type: String,
  pub value: ColumnValue,
  pub is_null: bool,
  /// Only meaningful in the after image of an UPDATE event.
  #[serde(skip_serializing_if = "std::ops::Not::not", default)]
  pub updated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowData {
  pub columns: Vec<Column>,
}

/// One logical row change, decoded against live table metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
  pub id: String,
  pub schema: String,
  pub table: String,
  pub event_type: EventType,
  pub timestamp: DateTime<Utc>,
  pub position: Position,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub before_data: Option<RowData>,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub after_data: Option<RowData>,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub sql: Option<String>,
}

/// Cached descriptor of a table's shape, persisted through the meta store
/// and superseded on schema change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
  pub schema: String,
  pub table: String,
  pub columns: Vec<String>,
  pub types: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
  pub running: bool,
  pub position: Position,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub last_event: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error_msg: Option<String>,
}

/// Errors a subscriber can surface from `handle`. They are logged by the
/// sink and never interrupt the stream.
#[derive(Debug, Error)]
pub enum HandlerError {
  #[error("http delivery failed: {0}")]
  Http(#[from] reqwest::Error),
  #[error("event log rejected: {0}")]
  EventLog(String),
  #[error("{0}")]
  Other(String),
}

/// Engine error taxonomy. Transport errors drive the reconnect policy,
/// protocol errors are skippable per event, storage errors degrade but do
/// not stop an instance.
#[derive(Debug, Error)]
pub enum CanalError {
  #[error("configuration error: {0}")]
  Config(String),
  #[error("transport error: {0}")]
  Transport(#[from] io::Error),
  #[error("protocol error: {0}")]
  Protocol(String),
  #[error("row decode error: {0}")]
  Decode(String),
  #[error("event sink backpressure: {0}")]
  Backpressure(String),
  #[error("storage error: {0}")]
  Storage(#[from] rusqlite::Error),
  #[error("encoding error: {0}")]
  Encoding(#[from] serde_json::Error),
  #[error("instance failed: {0}")]
  Failed(String),
}

/// A subscriber of row-change events. Registration is idempotent by
/// `name()`.
#[async_trait]
pub trait EventHandler: Send + Sync {
  fn name(&self) -> &str;
  async fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}
