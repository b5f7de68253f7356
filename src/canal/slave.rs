use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::net;
use tracing::{debug, info, warn};

use crate::mysql::binlog::{BinlogEvent, BinlogEventHeader, BinlogValue, TableMapEvent};
use crate::mysql::{BinlogCursor, BinlogStream, Connection, ConnectionOptions, ReplicationOptions};

use super::meta::MetaStore;
use super::{CanalError, Column, ColumnValue, Event, EventType, Position, RowData, TableMeta};

/// Consecutive per-event protocol failures tolerated before the stream is
/// declared broken and handed to the reconnect policy.
const PROTOCOL_ERROR_LIMIT: u32 = 50;

/// What to do with a rows event whose payload cannot be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePolicy {
  /// Log and drop the undecodable rows.
  Drop,
  /// Emit a data-less event flagged as undecodable so downstream consumers
  /// can account for the gap.
  Emit,
}

/// Connection settings for one replication session.
#[derive(Debug, Clone)]
pub struct MysqlConfig {
  pub host: String,
  pub port: u16,
  pub username: String,
  pub password: String,
  pub server_id: u32,
  pub heartbeat_period: Duration,
  pub read_timeout: Duration,
  pub gtid_enabled: bool,
  pub decode_policy: DecodePolicy,
}

impl Default for MysqlConfig {
  fn default() -> Self {
    Self {
      host: "127.0.0.1".to_string(),
      port: 3306,
      username: "root".to_string(),
      password: String::new(),
      server_id: 1001,
      heartbeat_period: Duration::from_secs(30),
      read_timeout: Duration::from_secs(90),
      gtid_enabled: false,
      decode_policy: DecodePolicy::Drop,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveState {
  New,
  Connecting,
  Preparing,
  Streaming,
  Stopped,
  Failed,
}

/// A replication session viewed as a stream of logical row-change events.
/// The production implementation speaks to a real primary; tests script one.
#[async_trait]
pub trait BinlogSlave: Send {
  async fn start(&mut self) -> Result<(), CanalError>;
  async fn stop(&mut self);
  /// The next batch of decoded events, in binlog order. Bookkeeping events
  /// yield an empty batch; the authoritative position still advances.
  async fn recv(&mut self) -> Result<Vec<Event>, CanalError>;
  /// The position of the next event to read.
  fn position(&self) -> Position;
  fn set_position(&mut self, position: Position);
  fn add_watch_table(&mut self, schema: &str, table: &str);
  fn remove_watch_table(&mut self, schema: &str, table: &str);
  fn set_event_types(&mut self, event_types: HashSet<EventType>);
  fn is_running(&self) -> bool;
}

pub struct MysqlBinlogSlave {
  config: MysqlConfig,
  meta: Option<Arc<MetaStore>>,
  state: SlaveState,
  stream: Option<BinlogStream>,
  position: Position,
  watch_tables: HashSet<(String, String)>,
  event_types: HashSet<EventType>,
  table_maps: HashMap<u64, TableMapEvent>,
  // uuid -> highest gno seen; rendered into Position::gtid_set.
  gtids: BTreeMap<String, u64>,
  protocol_errors: u32,
  events_decoded: u64,
  rows_failed: u64,
}

impl MysqlBinlogSlave {
  pub fn new(config: MysqlConfig, meta: Option<Arc<MetaStore>>) -> Self {
    Self {
      config,
      meta,
      state: SlaveState::New,
      stream: None,
      position: Position::default(),
      watch_tables: HashSet::new(),
      event_types: super::all_event_types(),
      table_maps: HashMap::new(),
      gtids: BTreeMap::new(),
      protocol_errors: 0,
      events_decoded: 0,
      rows_failed: 0,
    }
  }

  pub fn state(&self) -> SlaveState {
    self.state
  }

  pub fn events_decoded(&self) -> u64 {
    self.events_decoded
  }

  fn watches(&self, schema: &str, table: &str) -> bool {
    if self.watch_tables.is_empty() {
      return true;
    }
    // Empty schema or table in a watch entry acts as a wildcard.
    self.watch_tables.contains(&(schema.to_string(), table.to_string()))
      || self.watch_tables.contains(&(schema.to_string(), String::new()))
      || self.watch_tables.contains(&(String::new(), table.to_string()))
      || self.watch_tables.contains(&(String::new(), String::new()))
  }

  fn rendered_gtid_set(&self) -> Option<String> {
    if self.gtids.is_empty() {
      return None;
    }
    Some(
      self
        .gtids
        .iter()
        .map(|(uuid, gno)| format!("{}:1-{}", uuid, gno))
        .collect::<Vec<_>>()
        .join(","),
    )
  }

  fn current_position(&self) -> Position {
    Position {
      file: self.position.file.clone(),
      offset: self.position.offset,
      gtid_set: self.rendered_gtid_set(),
    }
  }

  async fn open_stream(&mut self) -> Result<BinlogStream, CanalError> {
    if self.config.server_id == 0 {
      return Err(CanalError::Config("server_id must be a non-zero unique id".to_string()));
    }

    self.state = SlaveState::Connecting;
    let addrs = net::lookup_host((self.config.host.as_str(), self.config.port))
      .await?
      .collect::<Vec<_>>();
    let options = ConnectionOptions {
      user: self.config.username.clone(),
      password: if self.config.password.is_empty() {
        None
      } else {
        Some(self.config.password.clone())
      },
      read_timeout: Some(self.config.read_timeout),
      ..Default::default()
    };
    let mut conn = Connection::connect_tcp(addrs, options).await?;

    // An empty file name means "the primary's current head": resolve it so
    // the dump starts where the primary is now, not at its oldest log.
    if self.position.file.is_empty() {
      let cursor = conn.binlog_cursor().await?;
      info!(cursor = %cursor, "starting from the primary's current position");
      self.position.file = cursor.log_file;
      self.position.offset = cursor.log_position;
    }

    self.state = SlaveState::Preparing;
    let replication_options = ReplicationOptions {
      server_id: self.config.server_id,
      heartbeat_period: Some(self.config.heartbeat_period),
      gtid_set: if self.config.gtid_enabled {
        self.position.gtid_set.clone()
      } else {
        None
      },
    };
    let cursor = BinlogCursor {
      log_file: self.position.file.clone(),
      log_position: self.position.offset,
    };
    let stream = conn.binlog_stream(replication_options, cursor).await?;
    Ok(stream)
  }

  fn persist_table_meta(&self, map: &TableMapEvent) {
    let Some(meta_store) = self.meta.as_ref() else { return };

    let columns = map.columns();
    let table_meta = TableMeta {
      schema: map.schema.clone(),
      table: map.table.clone(),
      columns: columns.iter().map(|c| c.name.clone()).collect(),
      types: columns.iter().map(|c| c.column_type.sql_name().to_string()).collect(),
    };

    match meta_store.load_table_meta(&map.schema, &map.table) {
      Ok(Some(existing)) if existing == table_meta => {}
      Ok(_) => {
        if let Err(err) = meta_store.save_table_meta(&map.schema, &map.table, &table_meta) {
          warn!(schema = %map.schema, table = %map.table, %err, "failed to persist table metadata");
        }
      }
      Err(err) => {
        warn!(schema = %map.schema, table = %map.table, %err, "failed to load table metadata");
      }
    }
  }

  fn invalidate_table_meta_for_ddl(&mut self, schema: &str, query: &str) {
    let lowered = query.to_ascii_lowercase();
    if !(lowered.starts_with("alter table")
      || lowered.starts_with("drop table")
      || lowered.starts_with("create table")
      || lowered.starts_with("rename table")
      || lowered.starts_with("truncate table"))
    {
      return;
    }

    // The statement may qualify the table name; checking containment keeps
    // this robust against backticks and IF EXISTS noise.
    let stale: Vec<(String, String)> = self
      .table_maps
      .values()
      .filter(|map| {
        (map.schema == schema || lowered.contains(&map.schema.to_ascii_lowercase()))
          && lowered.contains(&map.table.to_ascii_lowercase())
      })
      .map(|map| (map.schema.clone(), map.table.clone()))
      .collect();

    for (schema, table) in stale {
      debug!(schema, table, "invalidating table metadata after ddl");
      self.table_maps.retain(|_, map| !(map.schema == schema && map.table == table));
      if let Some(meta_store) = self.meta.as_ref() {
        if let Err(err) = meta_store.delete_table_meta(&schema, &table) {
          warn!(schema, table, %err, "failed to invalidate table metadata");
        }
      }
    }
  }

  fn build_events(
    &mut self,
    header: &BinlogEventHeader,
    event_type: EventType,
    map: &TableMapEvent,
    rows_event: &crate::mysql::binlog::RowsEvent,
  ) -> Result<Vec<Event>, io::Error> {
    let columns = map.columns();
    let images = rows_event.rows(&columns)?;

    let timestamp = DateTime::from_timestamp(header.timestamp.into(), 0).unwrap_or_else(Utc::now);
    let position = Position {
      file: self.position.file.clone(),
      offset: header.log_position,
      gtid_set: self.rendered_gtid_set(),
    };

    let make_row = |values: &[BinlogValue]| RowData {
      columns: values
        .iter()
        .zip(columns.iter())
        .map(|(value, col)| {
          let value = convert_value(value);
          Column {
            name: col.name.clone(),
            column_type: col.column_type.sql_name().to_string(),
            is_null: value.is_null(),
            value,
            updated: false,
          }
        })
        .collect(),
    };

    let make_event = |row_index: usize, before: Option<RowData>, after: Option<RowData>| Event {
      id: format!("{}:{}:{}", position.file, header.log_position, row_index),
      schema: map.schema.clone(),
      table: map.table.clone(),
      event_type,
      timestamp,
      position: position.clone(),
      before_data: before,
      after_data: after,
      sql: None,
    };

    let mut events = Vec::new();
    match event_type {
      EventType::Insert => {
        for (i, image) in images.iter().enumerate() {
          events.push(make_event(i, None, Some(make_row(image))));
        }
      }
      EventType::Delete => {
        for (i, image) in images.iter().enumerate() {
          events.push(make_event(i, Some(make_row(image)), None));
        }
      }
      EventType::Update => {
        for (i, pair) in images.chunks_exact(2).enumerate() {
          let before = make_row(&pair[0]);
          let mut after = make_row(&pair[1]);
          for (after_col, before_col) in after.columns.iter_mut().zip(before.columns.iter()) {
            after_col.updated = after_col.value != before_col.value;
          }
          events.push(make_event(i, Some(before), Some(after)));
        }
      }
    }

    self.events_decoded += events.len() as u64;
    Ok(events)
  }

  fn decode_failed_event(&self, header: &BinlogEventHeader, event_type: EventType, map: &TableMapEvent) -> Event {
    Event {
      id: format!("{}:{}:0", self.position.file, header.log_position),
      schema: map.schema.clone(),
      table: map.table.clone(),
      event_type,
      timestamp: DateTime::from_timestamp(header.timestamp.into(), 0).unwrap_or_else(Utc::now),
      position: Position {
        file: self.position.file.clone(),
        offset: header.log_position,
        gtid_set: self.rendered_gtid_set(),
      },
      before_data: None,
      after_data: None,
      sql: Some("decode-failed".to_string()),
    }
  }

  /// Advances the cursor past an event. Artificial events (e.g. the fake
  /// rotate at dump start) carry a zero log position and must not move it.
  fn advance(&mut self, header: &BinlogEventHeader) {
    if header.log_position > 0 {
      self.position.offset = header.log_position;
    }
  }
}

// Wire values map onto the event data model without re-encoding: byte
// payloads stay bytes until an event is serialized, and decimal/temporal
// values keep their tags.
fn convert_value(value: &BinlogValue) -> ColumnValue {
  match value {
    BinlogValue::Null => ColumnValue::Null,
    BinlogValue::Int(v) => ColumnValue::Int(*v),
    BinlogValue::UInt(v) => ColumnValue::UInt(*v),
    BinlogValue::Float(v) => ColumnValue::Float(*v),
    BinlogValue::Decimal(v) => ColumnValue::Decimal(v.clone()),
    BinlogValue::Bytes(v) => ColumnValue::Bytes(v.clone()),
    BinlogValue::Date(v) | BinlogValue::Time(v) | BinlogValue::DateTime(v) => ColumnValue::DateTime(v.clone()),
    BinlogValue::Year(v) => ColumnValue::Int((*v).into()),
    BinlogValue::Bit(v) => ColumnValue::UInt(*v),
    BinlogValue::Enum(v) | BinlogValue::Set(v) => ColumnValue::UInt(*v),
  }
}

#[async_trait]
impl BinlogSlave for MysqlBinlogSlave {
  async fn start(&mut self) -> Result<(), CanalError> {
    if matches!(self.state, SlaveState::Streaming) {
      return Err(CanalError::Failed("binlog slave is already running".to_string()));
    }

    match self.open_stream().await {
      Ok(stream) => {
        self.stream = Some(stream);
        self.table_maps.clear();
        self.protocol_errors = 0;
        self.state = SlaveState::Streaming;
        info!(
          host = %self.config.host,
          port = self.config.port,
          server_id = self.config.server_id,
          position = %self.position,
          "binlog slave streaming"
        );
        Ok(())
      }
      Err(err) => {
        self.state = SlaveState::Failed;
        Err(err)
      }
    }
  }

  async fn stop(&mut self) {
    if let Some(stream) = self.stream.take() {
      if let Err(err) = stream.close().await {
        debug!(%err, "error closing binlog stream");
      }
    }
    self.state = SlaveState::Stopped;
  }

  async fn recv(&mut self) -> Result<Vec<Event>, CanalError> {
    loop {
      let stream = self
        .stream
        .as_mut()
        .ok_or_else(|| CanalError::Failed("binlog slave is not running".to_string()))?;

      let (header, event) = match stream.recv().await {
        Ok(v) => v,
        Err(err) if err.kind() == io::ErrorKind::InvalidData => {
          // A malformed event is skippable, but repeated failures mean the
          // cursor has lost the frame boundary.
          self.protocol_errors += 1;
          warn!(%err, consecutive = self.protocol_errors, "skipping malformed binlog event");
          if self.protocol_errors >= PROTOCOL_ERROR_LIMIT {
            self.state = SlaveState::Failed;
            return Err(CanalError::Transport(io::Error::new(
              io::ErrorKind::InvalidData,
              "too many consecutive protocol errors",
            )));
          }
          continue;
        }
        Err(err) => {
          self.state = SlaveState::Failed;
          return Err(CanalError::Transport(err));
        }
      };

      self.protocol_errors = 0;

      match event {
        BinlogEvent::Rotate(rotate) => {
          debug!(file = %rotate.next_log_file, position = rotate.next_log_position, "binlog rotated");
          self.position.file = rotate.next_log_file;
          self.position.offset = rotate.next_log_position;
          // Table ids are only stable within a log; drop the registry.
          self.table_maps.clear();
        }
        BinlogEvent::Format(format) => {
          debug!(server_version = %format.server_version, checksum = ?format.checksum_algorithm, "format description");
          self.advance(&header);
        }
        BinlogEvent::TableMap(map) => {
          if self.watches(&map.schema, &map.table) {
            self.persist_table_meta(&map);
            self.table_maps.insert(map.table_id, map);
          }
          self.advance(&header);
        }
        BinlogEvent::Gtid(gtid) => {
          let rendered = gtid.to_gtid_string();
          if let Some((uuid, gno)) = rendered.rsplit_once(':') {
            if let Ok(gno) = gno.parse::<u64>() {
              let entry = self.gtids.entry(uuid.to_string()).or_insert(0);
              *entry = (*entry).max(gno);
            }
          }
          self.advance(&header);
        }
        BinlogEvent::Query(query) => {
          self.invalidate_table_meta_for_ddl(&query.schema, &query.query);
          self.advance(&header);
        }
        BinlogEvent::Xid(_) => {
          self.advance(&header);
        }
        BinlogEvent::Heartbeat => {
          // Keep-alive only; nothing to emit and no position to advance.
        }
        BinlogEvent::NotSupported(event_type) => {
          debug!(event_type, "ignoring unsupported binlog event");
          self.advance(&header);
        }
        rows_event @ (BinlogEvent::Insert(_) | BinlogEvent::Update(_) | BinlogEvent::Delete(_)) => {
          let (event_type, rows) = match rows_event {
            BinlogEvent::Insert(rows) => (EventType::Insert, rows),
            BinlogEvent::Update(rows) => (EventType::Update, rows),
            BinlogEvent::Delete(rows) => (EventType::Delete, rows),
            _ => unreachable!(),
          };

          let Some(map) = self.table_maps.get(&rows.table_id).cloned() else {
            // Either the table is filtered out or the map got lost; only the
            // latter is worth noting.
            if self.watch_tables.is_empty() {
              warn!(table_id = rows.table_id, "rows event without a table map");
            }
            self.advance(&header);
            continue;
          };

          if !self.watches(&map.schema, &map.table) || !self.event_types.contains(&event_type) {
            self.advance(&header);
            continue;
          }

          let events = match self.build_events(&header, event_type, &map, &rows) {
            Ok(events) => events,
            Err(err) => {
              self.rows_failed += 1;
              warn!(schema = %map.schema, table = %map.table, %err, "failed to decode row image");
              match self.config.decode_policy {
                DecodePolicy::Drop => {
                  self.advance(&header);
                  continue;
                }
                DecodePolicy::Emit => vec![self.decode_failed_event(&header, event_type, &map)],
              }
            }
          };

          self.advance(&header);
          if events.is_empty() {
            continue;
          }
          return Ok(events);
        }
      }
    }
  }

  fn position(&self) -> Position {
    self.current_position()
  }

  fn set_position(&mut self, position: Position) {
    self.position = position;
  }

  fn add_watch_table(&mut self, schema: &str, table: &str) {
    self.watch_tables.insert((schema.to_string(), table.to_string()));
  }

  fn remove_watch_table(&mut self, schema: &str, table: &str) {
    self.watch_tables.remove(&(schema.to_string(), table.to_string()));
  }

  fn set_event_types(&mut self, event_types: HashSet<EventType>) {
    self.event_types = event_types;
  }

  fn is_running(&self) -> bool {
    matches!(self.state, SlaveState::Streaming)
  }
}
