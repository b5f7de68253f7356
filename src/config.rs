use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;

use crate::canal::instance::InstanceOptions;
use crate::canal::slave::{DecodePolicy, MysqlConfig};
use crate::canal::EventType;

/// Runtime configuration of the replication engine. Loading this from a file
/// is the embedding application's concern; the struct itself is the
/// contract.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub canal: CanalConfig,
  pub database_storage: DatabaseStorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CanalConfig {
  pub host: String,
  pub port: u16,
  pub username: String,
  pub password: String,
  pub charset: String,
  pub server_id: u32,
  pub binlog: BinlogConfig,
  pub watch: WatchConfig,
  pub reconnect: ReconnectConfig,
  pub performance: PerformanceConfig,
}

impl Default for CanalConfig {
  fn default() -> Self {
    Self {
      host: "127.0.0.1".to_string(),
      port: 3306,
      username: "root".to_string(),
      password: String::new(),
      charset: "utf8mb4".to_string(),
      server_id: 1001,
      binlog: BinlogConfig::default(),
      watch: WatchConfig::default(),
      reconnect: ReconnectConfig::default(),
      performance: PerformanceConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BinlogConfig {
  pub filename: String,
  pub position: u32,
  pub gtid_enabled: bool,
}

impl Default for BinlogConfig {
  fn default() -> Self {
    Self {
      filename: String::new(),
      position: 4,
      gtid_enabled: false,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
  pub databases: Vec<String>,
  pub tables: Vec<String>,
  pub event_types: Vec<String>,
}

impl WatchConfig {
  /// `(schema, table)` pairs the replication filter should admit. Empty
  /// strings are wildcards; empty lists widen the other dimension.
  pub fn table_filters(&self) -> Vec<(String, String)> {
    match (self.databases.is_empty(), self.tables.is_empty()) {
      (true, true) => Vec::new(),
      (false, true) => self.databases.iter().map(|db| (db.clone(), String::new())).collect(),
      (true, false) => self.tables.iter().map(|t| (String::new(), t.clone())).collect(),
      (false, false) => self
        .databases
        .iter()
        .flat_map(|db| self.tables.iter().map(move |t| (db.clone(), t.clone())))
        .collect(),
    }
  }

  pub fn parsed_event_types(&self) -> HashSet<EventType> {
    let parsed: HashSet<EventType> = self
      .event_types
      .iter()
      .filter_map(|s| s.parse().ok())
      .collect();
    if parsed.is_empty() {
      crate::canal::all_event_types()
    } else {
      parsed
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
  pub max_attempts: u32,
  pub interval_secs: u64,
}

impl Default for ReconnectConfig {
  fn default() -> Self {
    Self {
      max_attempts: 10,
      interval_secs: 5,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
  pub event_buffer_size: usize,
  pub batch_size: usize,
}

impl Default for PerformanceConfig {
  fn default() -> Self {
    Self {
      event_buffer_size: 1000,
      batch_size: 100,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseStorageConfig {
  pub enabled: bool,
}

impl Default for DatabaseStorageConfig {
  fn default() -> Self {
    Self { enabled: true }
  }
}

impl Config {
  pub fn mysql_config(&self) -> MysqlConfig {
    MysqlConfig {
      host: self.canal.host.clone(),
      port: self.canal.port,
      username: self.canal.username.clone(),
      password: self.canal.password.clone(),
      server_id: self.canal.server_id,
      gtid_enabled: self.canal.binlog.gtid_enabled,
      decode_policy: DecodePolicy::Drop,
      ..MysqlConfig::default()
    }
  }

  pub fn instance_options(&self) -> InstanceOptions {
    InstanceOptions {
      reconnect_interval: Duration::from_secs(self.canal.reconnect.interval_secs),
      max_reconnect_attempts: self.canal.reconnect.max_attempts,
      ..InstanceOptions::default()
    }
  }

  /// The configured starting position, honoring `canal.binlog.*`.
  pub fn initial_position(&self) -> crate::canal::Position {
    crate::canal::Position {
      file: self.canal.binlog.filename.clone(),
      offset: self.canal.binlog.position,
      gtid_set: None,
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn defaults_match_the_documented_values() {
    let config = Config::default();
    assert_eq!(3306, config.canal.port);
    assert_eq!(1001, config.canal.server_id);
    assert_eq!(4, config.canal.binlog.position);
    assert_eq!(10, config.canal.reconnect.max_attempts);
    assert_eq!(1000, config.canal.performance.event_buffer_size);
    assert_eq!(100, config.canal.performance.batch_size);
    assert!(config.database_storage.enabled);
    assert_eq!(3, config.canal.watch.parsed_event_types().len());
  }

  #[test]
  fn watch_filters_cross_databases_and_tables() {
    let watch = WatchConfig {
      databases: vec!["shop".to_string()],
      tables: vec!["orders".to_string(), "users".to_string()],
      event_types: vec!["INSERT".to_string()],
    };
    let filters = watch.table_filters();
    assert_eq!(2, filters.len());
    assert!(filters.contains(&("shop".to_string(), "orders".to_string())));

    let only_db = WatchConfig {
      databases: vec!["shop".to_string()],
      ..Default::default()
    };
    assert_eq!(vec![("shop".to_string(), String::new())], only_db.table_filters());
  }

  #[test]
  fn config_deserializes_from_partial_input() {
    let config: Config = serde_json::from_str(
      r#"{"canal": {"host": "db.internal", "watch": {"event_types": ["INSERT", "DELETE"]}}}"#,
    )
    .unwrap();
    assert_eq!("db.internal", config.canal.host);
    assert_eq!(3306, config.canal.port);
    assert_eq!(2, config.canal.watch.parsed_event_types().len());
  }
}
