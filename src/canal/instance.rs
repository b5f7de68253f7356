use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::meta::MetaStore;
use super::sink::EventSink;
use super::slave::BinlogSlave;
use super::{CanalError, Event, EventHandler, EventType, InstanceStatus, Position};

/// Consecutive checkpoint failures tolerated before the instance is flagged
/// degraded. Delivery continues on the in-memory position either way.
const CHECKPOINT_FAILURE_LIMIT: u32 = 10;

#[derive(Debug, Clone)]
pub struct InstanceOptions {
  pub reconnect_interval: Duration,
  pub max_reconnect_attempts: u32,
  pub checkpoint_interval: Duration,
  /// Attempts to enqueue one event into the sink before the instance fails.
  pub send_retries: u32,
}

impl Default for InstanceOptions {
  fn default() -> Self {
    Self {
      reconnect_interval: Duration::from_secs(5),
      max_reconnect_attempts: 10,
      checkpoint_interval: Duration::from_secs(10),
      send_retries: 3,
    }
  }
}

struct InstanceShared {
  instance_id: String,
  running: AtomicBool,
  degraded: AtomicBool,
  position: RwLock<Position>,
  last_event: RwLock<Option<DateTime<Utc>>>,
  error: RwLock<Option<String>>,
}

impl InstanceShared {
  fn fail(&self, msg: impl Into<String>) {
    let msg = msg.into();
    error!(instance = %self.instance_id, %msg, "canal instance failed");
    *self.error.write().unwrap() = Some(msg);
    self.running.store(false, Ordering::SeqCst);
  }
}

/// One replication session coupled to an event sink and a set of handlers,
/// on behalf of one task. Owns a pump task that moves decoded events into
/// the sink and a checkpoint task that persists delivered progress.
pub struct CanalInstance {
  shared: Arc<InstanceShared>,
  sink: Arc<EventSink>,
  meta: Arc<MetaStore>,
  options: InstanceOptions,
  event_types: Mutex<HashSet<EventType>>,
  slave: Mutex<Option<Box<dyn BinlogSlave>>>,
  tasks: Mutex<Vec<JoinHandle<()>>>,
  token: Mutex<CancellationToken>,
}

impl CanalInstance {
  pub fn new(
    instance_id: impl Into<String>,
    slave: Box<dyn BinlogSlave>,
    meta: Arc<MetaStore>,
    event_buffer_size: usize,
    options: InstanceOptions,
  ) -> Self {
    Self {
      shared: Arc::new(InstanceShared {
        instance_id: instance_id.into(),
        running: AtomicBool::new(false),
        degraded: AtomicBool::new(false),
        position: RwLock::new(Position::default()),
        last_event: RwLock::new(None),
        error: RwLock::new(None),
      }),
      sink: Arc::new(EventSink::new(event_buffer_size)),
      meta,
      options,
      event_types: Mutex::new(super::all_event_types()),
      slave: Mutex::new(Some(slave)),
      tasks: Mutex::new(Vec::new()),
      token: Mutex::new(CancellationToken::new()),
    }
  }

  pub fn instance_id(&self) -> &str {
    &self.shared.instance_id
  }

  /// Registers a handler and widens the slave's watch filter. Handlers are
  /// expected to subscribe before `start`; later subscriptions reach the
  /// sink but cannot widen a live replication session's filter.
  pub fn subscribe(&self, schema: &str, table: &str, handler: Arc<dyn EventHandler>) {
    self.sink.subscribe(schema, table, handler);
    if let Some(slave) = self.slave.lock().unwrap().as_mut() {
      slave.add_watch_table(schema, table);
    }
  }

  /// Widens the replication filter without registering a handler, for
  /// configuration-level watch lists.
  pub fn add_watch_table(&self, schema: &str, table: &str) {
    if let Some(slave) = self.slave.lock().unwrap().as_mut() {
      slave.add_watch_table(schema, table);
    }
  }

  pub fn unsubscribe(&self, schema: &str, table: &str, handler_name: &str) {
    self.sink.unsubscribe(schema, table, handler_name);
    if let Some(slave) = self.slave.lock().unwrap().as_mut() {
      slave.remove_watch_table(schema, table);
    }
  }

  pub fn set_event_types(&self, event_types: HashSet<EventType>) {
    if let Some(slave) = self.slave.lock().unwrap().as_mut() {
      slave.set_event_types(event_types.clone());
    }
    *self.event_types.lock().unwrap() = event_types;
  }

  pub async fn start(&self) -> Result<(), CanalError> {
    if self.shared.running.swap(true, Ordering::SeqCst) {
      return Err(CanalError::Failed(format!(
        "canal instance {} is already running",
        self.shared.instance_id
      )));
    }

    let mut slave = match self.slave.lock().unwrap().take() {
      Some(slave) => slave,
      None => {
        self.shared.running.store(false, Ordering::SeqCst);
        return Err(CanalError::Failed("canal instance was already consumed".to_string()));
      }
    };

    // Resume from the last checkpoint. Without one the slave keeps its
    // seeded position, which defaults to the primary's head.
    let position = match self.meta.load_position(&self.shared.instance_id) {
      Ok(position) => position,
      Err(err) => {
        self.shared.running.store(false, Ordering::SeqCst);
        *self.slave.lock().unwrap() = Some(slave);
        return Err(err);
      }
    };
    if !position.file.is_empty() {
      slave.set_position(position);
    }
    info!(instance = %self.shared.instance_id, position = %slave.position(), "starting canal instance");
    *self.shared.position.write().unwrap() = slave.position();
    *self.shared.error.write().unwrap() = None;

    if let Err(err) = self.sink.start() {
      self.shared.running.store(false, Ordering::SeqCst);
      *self.slave.lock().unwrap() = Some(slave);
      return Err(err);
    }

    if let Err(err) = slave.start().await {
      self.sink.stop().await;
      self.shared.running.store(false, Ordering::SeqCst);
      *self.slave.lock().unwrap() = Some(slave);
      return Err(err);
    }

    let token = CancellationToken::new();
    *self.token.lock().unwrap() = token.clone();

    let pump = tokio::spawn(pump_loop(
      slave,
      Arc::clone(&self.sink),
      Arc::clone(&self.shared),
      self.event_types.lock().unwrap().clone(),
      self.options.clone(),
      token.clone(),
    ));
    let checkpoint = tokio::spawn(checkpoint_loop(
      Arc::clone(&self.meta),
      Arc::clone(&self.shared),
      self.options.checkpoint_interval,
      token.clone(),
    ));
    *self.tasks.lock().unwrap() = vec![pump, checkpoint];

    Ok(())
  }

  pub async fn stop(&self) {
    self.token.lock().unwrap().cancel();

    // The checkpoint task flushes the delivered position once before it
    // exits, so joining it is what makes restart resume correctly.
    let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
    for task in tasks {
      let _ = task.await;
    }

    self.sink.stop().await;
    self.shared.running.store(false, Ordering::SeqCst);
    info!(instance = %self.shared.instance_id, "canal instance stopped");
  }

  pub fn status(&self) -> InstanceStatus {
    InstanceStatus {
      running: self.shared.running.load(Ordering::SeqCst),
      position: self.shared.position.read().unwrap().clone(),
      last_event: *self.shared.last_event.read().unwrap(),
      error_msg: self.shared.error.read().unwrap().clone(),
    }
  }

  pub fn is_degraded(&self) -> bool {
    self.shared.degraded.load(Ordering::SeqCst)
  }
}

async fn pump_loop(
  mut slave: Box<dyn BinlogSlave>,
  sink: Arc<EventSink>,
  shared: Arc<InstanceShared>,
  event_types: HashSet<EventType>,
  options: InstanceOptions,
  token: CancellationToken,
) {
  let mut reconnects = 0_u32;

  'pump: loop {
    let received = tokio::select! {
      _ = token.cancelled() => break 'pump,
      received = slave.recv() => received,
    };

    match received {
      Ok(events) => {
        for event in events {
          if !event_types.contains(&event.event_type) {
            continue;
          }
          if !deliver(&sink, event, options.send_retries, &token).await {
            // A delivery abandoned by shutdown is not a failure; the event
            // is redelivered from the last checkpoint on restart.
            if !token.is_cancelled() {
              shared.fail("event sink rejected an event after retries");
            }
            break 'pump;
          }
          *shared.last_event.write().unwrap() = Some(Utc::now());
        }
        // Progress is published only after every event of the batch has
        // been handed to the sink, which keeps checkpoints at-least-once.
        *shared.position.write().unwrap() = slave.position();
        reconnects = 0;
      }
      Err(CanalError::Transport(err)) => {
        warn!(instance = %shared.instance_id, %err, "binlog stream broken");
        slave.stop().await;

        loop {
          reconnects += 1;
          if reconnects > options.max_reconnect_attempts {
            shared.fail(format!(
              "giving up after {} reconnect attempts",
              options.max_reconnect_attempts
            ));
            break 'pump;
          }

          tokio::select! {
            _ = token.cancelled() => break 'pump,
            _ = tokio::time::sleep(options.reconnect_interval) => {}
          }

          slave.set_position(shared.position.read().unwrap().clone());
          match slave.start().await {
            Ok(()) => {
              info!(instance = %shared.instance_id, attempt = reconnects, "reconnected to the primary");
              continue 'pump;
            }
            Err(err) => {
              warn!(instance = %shared.instance_id, attempt = reconnects, %err, "reconnect failed");
            }
          }
        }
      }
      Err(err) => {
        shared.fail(err.to_string());
        break 'pump;
      }
    }
  }

  slave.stop().await;
}

/// Hands one event to the sink, retrying on backpressure. Returns false once
/// the retry budget is exhausted or an unrecoverable sink error shows up.
async fn deliver(sink: &EventSink, event: Event, retries: u32, token: &CancellationToken) -> bool {
  let mut attempt = 0;
  loop {
    if token.is_cancelled() {
      return false;
    }
    match sink.send(event.clone()).await {
      Ok(()) => return true,
      Err(CanalError::Backpressure(msg)) => {
        attempt += 1;
        warn!(event = %event.id, attempt, %msg, "event sink backpressure");
        if attempt > retries {
          return false;
        }
      }
      Err(err) => {
        warn!(event = %event.id, %err, "event sink rejected event");
        return false;
      }
    }
  }
}

async fn checkpoint_loop(
  meta: Arc<MetaStore>,
  shared: Arc<InstanceShared>,
  interval: Duration,
  token: CancellationToken,
) {
  let mut failures = 0_u32;
  let mut ticker = tokio::time::interval(interval);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
  ticker.reset();

  loop {
    tokio::select! {
      _ = token.cancelled() => break,
      _ = ticker.tick() => {}
    }

    checkpoint(&meta, &shared, &mut failures);
  }

  // Final flush before exit so a clean stop never loses progress.
  checkpoint(&meta, &shared, &mut failures);
}

fn checkpoint(meta: &MetaStore, shared: &InstanceShared, failures: &mut u32) {
  let position = shared.position.read().unwrap().clone();
  if position.file.is_empty() {
    return;
  }

  match meta.save_position(&shared.instance_id, &position) {
    Ok(()) => {
      *failures = 0;
      shared.degraded.store(false, Ordering::SeqCst);
    }
    Err(err) => {
      *failures += 1;
      warn!(instance = %shared.instance_id, %err, failures, "checkpoint failed");
      if *failures > CHECKPOINT_FAILURE_LIMIT {
        shared.degraded.store(true, Ordering::SeqCst);
      }
    }
  }
}
