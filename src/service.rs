use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::canal::handlers::{DatabaseHandler, EventLogSink, WebhookHandler, WebhookOptions};
use crate::canal::instance::CanalInstance;
use crate::canal::meta::MetaStore;
use crate::canal::slave::{BinlogSlave, MysqlBinlogSlave};
use crate::canal::{CanalError, EventType, InstanceStatus};
use crate::config::Config;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const STALE_INSTANCE_AFTER: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
  Active,
  Inactive,
}

/// A subscription record handed in by the task-management layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
  pub id: u32,
  pub name: String,
  /// Empty means any database.
  pub database: String,
  /// Empty means any table.
  pub table: String,
  pub event_types: HashSet<EventType>,
  pub callback_url: String,
  pub status: TaskStatus,
}

#[derive(Debug, Serialize)]
pub struct ServiceStatus {
  pub running: bool,
  pub instance_count: usize,
  pub instances: HashMap<String, InstanceStatus>,
}

type SlaveFactory = dyn Fn(&Config) -> Box<dyn BinlogSlave> + Send + Sync;

struct TaskEntry {
  task: Task,
  instance: Arc<CanalInstance>,
  webhook: Arc<WebhookHandler>,
}

/// Creates, restarts and tears down one canal instance per active task, and
/// runs the periodic health and cleanup jobs.
pub struct CanalService {
  config: Config,
  meta: Arc<MetaStore>,
  event_logs: Arc<dyn EventLogSink>,
  slave_factory: Box<SlaveFactory>,
  entries: Arc<tokio::sync::Mutex<HashMap<u32, TaskEntry>>>,
  meta_ttl: Option<Duration>,
  token: CancellationToken,
  jobs: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl CanalService {
  pub fn new(config: Config, meta: Arc<MetaStore>, event_logs: Arc<dyn EventLogSink>) -> Self {
    Self {
      config,
      meta,
      event_logs,
      slave_factory: Box::new(|config: &Config| {
        let mut slave = MysqlBinlogSlave::new(config.mysql_config(), None);
        slave.set_position(config.initial_position());
        Box::new(slave)
      }),
      entries: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
      meta_ttl: None,
      token: CancellationToken::new(),
      jobs: std::sync::Mutex::new(Vec::new()),
    }
  }

  /// Replaces how replication sessions are built. Tests use this to script a
  /// slave instead of dialing a real primary.
  pub fn with_slave_factory(mut self, factory: impl Fn(&Config) -> Box<dyn BinlogSlave> + Send + Sync + 'static) -> Self {
    self.slave_factory = Box::new(factory);
    self
  }

  /// Enables the periodic meta-store retention sweep.
  pub fn with_meta_ttl(mut self, ttl: Duration) -> Self {
    self.meta_ttl = Some(ttl);
    self
  }

  /// Spawns the periodic health-check and cleanup jobs.
  pub fn start(&self) {
    let mut jobs = self.jobs.lock().unwrap();
    if !jobs.is_empty() {
      return;
    }

    {
      let entries = Arc::clone(&self.entries);
      let token = self.token.clone();
      jobs.push(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.reset();
        loop {
          tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
          }
          health_check(&entries).await;
        }
      }));
    }

    if let Some(ttl) = self.meta_ttl {
      let meta = Arc::clone(&self.meta);
      let token = self.token.clone();
      jobs.push(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.reset();
        loop {
          tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
          }
          if let Err(err) = meta.cleanup(ttl) {
            warn!(%err, "meta store cleanup failed");
          }
        }
      }));
    }
  }

  /// Builds, wires and starts a canal instance for an active task.
  pub async fn create_task(&self, task: Task) -> Result<(), CanalError> {
    if task.status != TaskStatus::Active {
      info!(task = task.id, "task is inactive, no instance created");
      return Ok(());
    }

    let mut entries = self.entries.lock().await;
    if entries.contains_key(&task.id) {
      return Err(CanalError::Failed(format!("task {} already has an instance", task.id)));
    }

    let instance_id = format!("task-{}", task.id);
    info!(task = task.id, %instance_id, database = %task.database, table = %task.table, "creating canal instance");

    let slave = (self.slave_factory)(&self.config);
    let instance = Arc::new(CanalInstance::new(
      instance_id,
      slave,
      Arc::clone(&self.meta),
      self.config.canal.performance.event_buffer_size,
      self.config.instance_options(),
    ));

    // The task's event-type set narrows the stream; an empty set falls back
    // to the configured default.
    let event_types = if task.event_types.is_empty() {
      self.config.canal.watch.parsed_event_types()
    } else {
      task.event_types.clone()
    };
    instance.set_event_types(event_types);

    for (schema, table) in self.config.canal.watch.table_filters() {
      instance.add_watch_table(&schema, &table);
    }

    let webhook = WebhookHandler::new(
      format!("webhook-{}", task.id),
      task.callback_url.clone(),
      WebhookOptions {
        batch_size: self.config.canal.performance.batch_size,
        ..WebhookOptions::default()
      },
    )?;
    let database = Arc::new(DatabaseHandler::new(
      format!("db-{}", task.id),
      task.id,
      Arc::clone(&self.event_logs),
      self.config.database_storage.enabled,
    ));

    instance.subscribe(&task.database, &task.table, webhook.clone());
    instance.subscribe(&task.database, &task.table, database);

    instance.start().await?;

    entries.insert(
      task.id,
      TaskEntry {
        task,
        instance,
        webhook,
      },
    );
    Ok(())
  }

  /// Stops the existing instance and builds a fresh one from the new task
  /// definition; there is no in-place mutation.
  pub async fn update_task(&self, id: u32, task: Task) -> Result<(), CanalError> {
    self.stop_task(id).await;
    self.create_task(Task { id, ..task }).await
  }

  /// Stops and forgets the task's instance. Returns true when one existed.
  pub async fn stop_task(&self, id: u32) -> bool {
    let entry = self.entries.lock().await.remove(&id);
    match entry {
      Some(entry) => {
        entry.instance.stop().await;
        entry.webhook.shutdown();
        info!(task = id, "canal instance stopped");
        true
      }
      None => false,
    }
  }

  /// Tears the instance down. The persisted position is deliberately kept
  /// so a task re-created with the same id resumes where it left off.
  pub async fn delete_task(&self, id: u32) -> bool {
    self.stop_task(id).await
  }

  pub async fn get_status(&self) -> ServiceStatus {
    let entries = self.entries.lock().await;
    let instances = entries
      .values()
      .map(|entry| (entry.instance.instance_id().to_string(), entry.instance.status()))
      .collect::<HashMap<_, _>>();
    ServiceStatus {
      running: !self.token.is_cancelled(),
      instance_count: instances.len(),
      instances,
    }
  }

  pub async fn task(&self, id: u32) -> Option<Task> {
    self.entries.lock().await.get(&id).map(|entry| entry.task.clone())
  }

  /// `(success_count, error_count, buffered)` of a task's webhook handler.
  pub async fn webhook_stats(&self, id: u32) -> Option<(u64, u64, usize)> {
    self.entries.lock().await.get(&id).map(|entry| entry.webhook.stats())
  }

  /// Stops every instance and the periodic jobs.
  pub async fn stop(&self) {
    self.token.cancel();

    let jobs = std::mem::take(&mut *self.jobs.lock().unwrap());
    for job in jobs {
      let _ = job.await;
    }

    let entries: Vec<TaskEntry> = {
      let mut map = self.entries.lock().await;
      map.drain().map(|(_, entry)| entry).collect()
    };
    for entry in entries {
      entry.instance.stop().await;
      entry.webhook.shutdown();
    }
    info!("canal service stopped");
  }
}

async fn health_check(entries: &tokio::sync::Mutex<HashMap<u32, TaskEntry>>) {
  let entries = entries.lock().await;
  let now = Utc::now();
  for (id, entry) in entries.iter() {
    let status = entry.instance.status();
    if !status.running {
      warn!(task = id, error = ?status.error_msg, "instance is not running");
      continue;
    }
    if let Some(last_event) = status.last_event {
      let idle = (now - last_event).to_std().unwrap_or_default();
      if idle > STALE_INSTANCE_AFTER {
        warn!(task = id, idle_secs = idle.as_secs(), "no events received recently");
      }
    }
    if entry.instance.is_degraded() {
      warn!(task = id, "instance checkpointing is degraded");
    }
  }
  info!(instances = entries.len(), "health check completed");
}
