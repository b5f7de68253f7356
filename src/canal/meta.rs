use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{CanalError, Position, TableMeta};

/// Durable store for replication positions and table metadata, fronted by a
/// write-through cache. Readers share the cache lock; writers hold it across
/// the storage write so cache and storage cannot diverge.
pub struct MetaStore {
  conn: Mutex<Connection>,
  cache: RwLock<MetaCache>,
}

#[derive(Default)]
struct MetaCache {
  positions: HashMap<String, Position>,
  tables: HashMap<(String, String), TableMeta>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS binlog_positions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  instance_id TEXT NOT NULL UNIQUE,
  filename TEXT NOT NULL DEFAULT '',
  position INTEGER NOT NULL,
  gtid_set TEXT,
  updated_at INTEGER NOT NULL,
  created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS table_metadata (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  "schema" TEXT NOT NULL,
  "table" TEXT NOT NULL,
  columns TEXT NOT NULL,
  types TEXT NOT NULL,
  updated_at INTEGER NOT NULL,
  created_at INTEGER NOT NULL,
  UNIQUE("schema", "table")
);
"#;

// Millisecond precision keeps retention sweeps deterministic even for rows
// written within the same second.
fn now_unix_millis() -> i64 {
  chrono::Utc::now().timestamp_millis()
}

impl MetaStore {
  pub fn open(path: impl AsRef<Path>) -> Result<Self, CanalError> {
    Self::from_connection(Connection::open(path)?)
  }

  /// In-memory store, used by tests and by deployments that accept losing
  /// resume state across restarts.
  pub fn open_in_memory() -> Result<Self, CanalError> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> Result<Self, CanalError> {
    conn.execute_batch(SCHEMA)?;
    let store = Self {
      conn: Mutex::new(conn),
      cache: RwLock::new(MetaCache::default()),
    };
    store.reload_cache()?;
    Ok(store)
  }

  /// Returns the persisted position for `instance_id`. A never-seen instance
  /// yields the default position, meaning "start at the primary's head".
  pub fn load_position(&self, instance_id: &str) -> Result<Position, CanalError> {
    if let Some(pos) = self.cache.read().unwrap().positions.get(instance_id) {
      return Ok(pos.clone());
    }

    let loaded = {
      let conn = self.conn.lock().unwrap();
      conn
        .query_row(
          "SELECT filename, position, gtid_set FROM binlog_positions WHERE instance_id = ?1",
          params![instance_id],
          |row| {
            Ok(Position {
              file: row.get(0)?,
              offset: row.get::<_, i64>(1)? as u32,
              gtid_set: row.get(2)?,
            })
          },
        )
        .optional()?
    };

    match loaded {
      Some(pos) => {
        let mut cache = self.cache.write().unwrap();
        cache.positions.insert(instance_id.to_string(), pos.clone());
        Ok(pos)
      }
      None => Ok(Position::default()),
    }
  }

  pub fn save_position(&self, instance_id: &str, pos: &Position) -> Result<(), CanalError> {
    let mut cache = self.cache.write().unwrap();
    {
      let conn = self.conn.lock().unwrap();
      conn.execute(
        "INSERT INTO binlog_positions (instance_id, filename, position, gtid_set, updated_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)
         ON CONFLICT(instance_id) DO UPDATE SET
           filename = excluded.filename,
           position = excluded.position,
           gtid_set = excluded.gtid_set,
           updated_at = excluded.updated_at",
        params![instance_id, pos.file, pos.offset as i64, pos.gtid_set, now_unix_millis()],
      )?;
    }
    cache.positions.insert(instance_id.to_string(), pos.clone());
    debug!(instance_id, position = %pos, "saved binlog position");
    Ok(())
  }

  pub fn delete_position(&self, instance_id: &str) -> Result<(), CanalError> {
    let mut cache = self.cache.write().unwrap();
    {
      let conn = self.conn.lock().unwrap();
      conn.execute("DELETE FROM binlog_positions WHERE instance_id = ?1", params![instance_id])?;
    }
    cache.positions.remove(instance_id);
    Ok(())
  }

  pub fn load_table_meta(&self, schema: &str, table: &str) -> Result<Option<TableMeta>, CanalError> {
    let key = (schema.to_string(), table.to_string());
    if let Some(meta) = self.cache.read().unwrap().tables.get(&key) {
      return Ok(Some(meta.clone()));
    }

    let loaded = {
      let conn = self.conn.lock().unwrap();
      conn
        .query_row(
          r#"SELECT columns, types FROM table_metadata WHERE "schema" = ?1 AND "table" = ?2"#,
          params![schema, table],
          |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?
    };

    match loaded {
      Some((columns, types)) => {
        let meta = TableMeta {
          schema: schema.to_string(),
          table: table.to_string(),
          columns: serde_json::from_str(&columns)?,
          types: serde_json::from_str(&types)?,
        };
        let mut cache = self.cache.write().unwrap();
        cache.tables.insert(key, meta.clone());
        Ok(Some(meta))
      }
      None => Ok(None),
    }
  }

  pub fn save_table_meta(&self, schema: &str, table: &str, meta: &TableMeta) -> Result<(), CanalError> {
    let columns = serde_json::to_string(&meta.columns)?;
    let types = serde_json::to_string(&meta.types)?;

    let mut cache = self.cache.write().unwrap();
    {
      let conn = self.conn.lock().unwrap();
      conn.execute(
        r#"INSERT INTO table_metadata ("schema", "table", columns, types, updated_at, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?5)
           ON CONFLICT("schema", "table") DO UPDATE SET
             columns = excluded.columns,
             types = excluded.types,
             updated_at = excluded.updated_at"#,
        params![schema, table, columns, types, now_unix_millis()],
      )?;
    }
    cache
      .tables
      .insert((schema.to_string(), table.to_string()), meta.clone());
    Ok(())
  }

  pub fn delete_table_meta(&self, schema: &str, table: &str) -> Result<(), CanalError> {
    let mut cache = self.cache.write().unwrap();
    {
      let conn = self.conn.lock().unwrap();
      conn.execute(
        r#"DELETE FROM table_metadata WHERE "schema" = ?1 AND "table" = ?2"#,
        params![schema, table],
      )?;
    }
    cache.tables.remove(&(schema.to_string(), table.to_string()));
    Ok(())
  }

  /// Deletes records whose `updated_at` is older than the cutoff and reloads
  /// the cache from what survived.
  pub fn cleanup(&self, older_than: Duration) -> Result<(), CanalError> {
    let cutoff = now_unix_millis() - older_than.as_millis() as i64;
    {
      let conn = self.conn.lock().unwrap();
      conn.execute("DELETE FROM binlog_positions WHERE updated_at < ?1", params![cutoff])?;
      conn.execute("DELETE FROM table_metadata WHERE updated_at < ?1", params![cutoff])?;
    }
    self.reload_cache()
  }

  fn reload_cache(&self) -> Result<(), CanalError> {
    let mut positions = HashMap::new();
    let mut tables = HashMap::new();
    {
      let conn = self.conn.lock().unwrap();

      let mut stmt = conn.prepare("SELECT instance_id, filename, position, gtid_set FROM binlog_positions")?;
      let rows = stmt.query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          Position {
            file: row.get(1)?,
            offset: row.get::<_, i64>(2)? as u32,
            gtid_set: row.get(3)?,
          },
        ))
      })?;
      for row in rows {
        let (instance_id, pos) = row?;
        positions.insert(instance_id, pos);
      }

      let mut stmt = conn.prepare(r#"SELECT "schema", "table", columns, types FROM table_metadata"#)?;
      let rows = stmt.query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
        ))
      })?;
      for row in rows {
        let (schema, table, columns, types) = row?;
        let meta = TableMeta {
          schema: schema.clone(),
          table: table.clone(),
          columns: serde_json::from_str(&columns)?,
          types: serde_json::from_str(&types)?,
        };
        tables.insert((schema, table), meta);
      }
    }

    let mut cache = self.cache.write().unwrap();
    cache.positions = positions;
    cache.tables = tables;
    Ok(())
  }

  /// Snapshot of every cached position, keyed by instance id.
  pub fn positions(&self) -> HashMap<String, Position> {
    self.cache.read().unwrap().positions.clone()
  }

  /// Snapshot of every cached table descriptor.
  pub fn table_metas(&self) -> HashMap<(String, String), TableMeta> {
    self.cache.read().unwrap().tables.clone()
  }
}
