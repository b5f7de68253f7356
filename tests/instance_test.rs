use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use rowhook::canal::instance::{CanalInstance, InstanceOptions};
use rowhook::canal::meta::MetaStore;
use rowhook::canal::slave::BinlogSlave;
use rowhook::canal::{CanalError, Event, EventHandler, EventType, HandlerError, Position};

fn event(offset: u32, event_type: EventType) -> Event {
  Event {
    id: format!("mysql-bin.000001:{}:0", offset),
    schema: "test".to_string(),
    table: "users".to_string(),
    event_type,
    timestamp: Utc::now(),
    position: Position {
      file: "mysql-bin.000001".to_string(),
      offset,
      gtid_set: None,
    },
    before_data: None,
    after_data: None,
    sql: None,
  }
}

fn transport_error() -> CanalError {
  CanalError::Transport(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "primary went away"))
}

/// Replays a script of `recv` outcomes; the position follows delivered
/// batches the way the real slave follows the binlog cursor.
struct ScriptedSlave {
  script: Mutex<VecDeque<Result<Vec<Event>, CanalError>>>,
  position: Mutex<Position>,
  set_positions: Arc<Mutex<Vec<Position>>>,
  starts: Arc<AtomicU32>,
  fail_restarts: AtomicBool,
  running: AtomicBool,
}

impl ScriptedSlave {
  fn new(script: Vec<Result<Vec<Event>, CanalError>>) -> Self {
    Self {
      script: Mutex::new(script.into()),
      position: Mutex::new(Position::default()),
      set_positions: Arc::new(Mutex::new(Vec::new())),
      starts: Arc::new(AtomicU32::new(0)),
      fail_restarts: AtomicBool::new(false),
      running: AtomicBool::new(false),
    }
  }

  fn starts_handle(&self) -> Arc<AtomicU32> {
    Arc::clone(&self.starts)
  }

  fn set_positions_handle(&self) -> Arc<Mutex<Vec<Position>>> {
    Arc::clone(&self.set_positions)
  }

  fn fail_restarts(self) -> Self {
    self.fail_restarts.store(true, Ordering::SeqCst);
    self
  }
}

#[async_trait]
impl BinlogSlave for ScriptedSlave {
  async fn start(&mut self) -> Result<(), CanalError> {
    let attempt = self.starts.fetch_add(1, Ordering::SeqCst);
    if attempt > 0 && self.fail_restarts.load(Ordering::SeqCst) {
      return Err(transport_error());
    }
    self.running.store(true, Ordering::SeqCst);
    Ok(())
  }

  async fn stop(&mut self) {
    self.running.store(false, Ordering::SeqCst);
  }

  async fn recv(&mut self) -> Result<Vec<Event>, CanalError> {
    let next = self.script.lock().unwrap().pop_front();
    match next {
      Some(Ok(events)) => {
        if let Some(last) = events.last() {
          *self.position.lock().unwrap() = last.position.clone();
        }
        Ok(events)
      }
      Some(Err(err)) => Err(err),
      // Script exhausted: behave like an idle stream.
      None => {
        std::future::pending::<()>().await;
        unreachable!()
      }
    }
  }

  fn position(&self) -> Position {
    self.position.lock().unwrap().clone()
  }

  fn set_position(&mut self, position: Position) {
    self.set_positions.lock().unwrap().push(position.clone());
    *self.position.lock().unwrap() = position;
  }

  fn add_watch_table(&mut self, _schema: &str, _table: &str) {}
  fn remove_watch_table(&mut self, _schema: &str, _table: &str) {}
  fn set_event_types(&mut self, _event_types: HashSet<EventType>) {}

  fn is_running(&self) -> bool {
    self.running.load(Ordering::SeqCst)
  }
}

#[derive(Default)]
struct RecordingHandler {
  seen: Mutex<Vec<String>>,
}

impl RecordingHandler {
  fn seen(&self) -> Vec<String> {
    self.seen.lock().unwrap().clone()
  }
}

#[async_trait]
impl EventHandler for RecordingHandler {
  fn name(&self) -> &str {
    "recording"
  }

  async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
    self.seen.lock().unwrap().push(event.id.clone());
    Ok(())
  }
}

async fn wait_for(mut check: impl FnMut() -> bool) {
  for _ in 0..1000 {
    if check() {
      return;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  panic!("condition not reached in time");
}

#[tokio::test(start_paused = true)]
async fn pump_delivers_events_and_flushes_position_on_stop() {
  let meta = Arc::new(MetaStore::open_in_memory().unwrap());
  let slave = ScriptedSlave::new(vec![
    Ok(vec![event(120, EventType::Insert)]),
    Ok(vec![event(240, EventType::Update), event(360, EventType::Delete)]),
  ]);
  let instance = CanalInstance::new("task-1", Box::new(slave), Arc::clone(&meta), 16, InstanceOptions::default());

  let handler = Arc::new(RecordingHandler::default());
  instance.subscribe("test", "users", handler.clone());

  instance.start().await.unwrap();
  wait_for(|| handler.seen().len() == 3).await;

  let status = instance.status();
  assert!(status.running);
  assert!(status.last_event.is_some());

  instance.stop().await;

  // The final flush persists the last delivered position.
  let saved = meta.load_position("task-1").unwrap();
  assert_eq!("mysql-bin.000001", saved.file);
  assert_eq!(360, saved.offset);
  assert!(!instance.status().running);
}

#[tokio::test(start_paused = true)]
async fn resumes_from_the_checkpointed_position() {
  let meta = Arc::new(MetaStore::open_in_memory().unwrap());
  let checkpoint = Position {
    file: "mysql-bin.000003".to_string(),
    offset: 49_000,
    gtid_set: None,
  };
  meta.save_position("task-1", &checkpoint).unwrap();

  let slave = ScriptedSlave::new(vec![]);
  let set_positions = slave.set_positions_handle();
  let instance = CanalInstance::new("task-1", Box::new(slave), meta, 16, InstanceOptions::default());

  instance.start().await.unwrap();
  assert_eq!(vec![checkpoint.clone()], *set_positions.lock().unwrap());
  assert_eq!(checkpoint, instance.status().position);

  instance.stop().await;
}

#[tokio::test(start_paused = true)]
async fn checkpoint_task_persists_position_periodically() {
  let meta = Arc::new(MetaStore::open_in_memory().unwrap());
  let slave = ScriptedSlave::new(vec![Ok(vec![event(120, EventType::Insert)])]);
  let instance = CanalInstance::new(
    "task-1",
    Box::new(slave),
    Arc::clone(&meta),
    16,
    InstanceOptions {
      checkpoint_interval: Duration::from_millis(100),
      ..InstanceOptions::default()
    },
  );
  let handler = Arc::new(RecordingHandler::default());
  instance.subscribe("test", "users", handler.clone());

  instance.start().await.unwrap();
  wait_for(|| handler.seen().len() == 1).await;
  wait_for(|| meta.load_position("task-1").unwrap().offset == 120).await;

  instance.stop().await;
}

#[tokio::test(start_paused = true)]
async fn reconnects_after_a_transport_error_and_resumes_delivery() {
  let meta = Arc::new(MetaStore::open_in_memory().unwrap());
  let slave = ScriptedSlave::new(vec![
    Ok(vec![event(120, EventType::Insert)]),
    Err(transport_error()),
    Ok(vec![event(240, EventType::Insert)]),
  ]);
  let starts = slave.starts_handle();
  let set_positions = slave.set_positions_handle();
  let instance = CanalInstance::new("task-1", Box::new(slave), meta, 16, InstanceOptions::default());

  let handler = Arc::new(RecordingHandler::default());
  instance.subscribe("test", "users", handler.clone());

  instance.start().await.unwrap();
  wait_for(|| handler.seen().len() == 2).await;

  // One initial start plus one reconnect, resuming from the delivered
  // position.
  assert_eq!(2, starts.load(Ordering::SeqCst));
  assert!(set_positions
    .lock()
    .unwrap()
    .iter()
    .any(|p| p.file == "mysql-bin.000001" && p.offset == 120));
  assert!(instance.status().running);

  instance.stop().await;
}

#[tokio::test(start_paused = true)]
async fn fails_after_exhausting_reconnect_attempts() {
  let meta = Arc::new(MetaStore::open_in_memory().unwrap());
  let slave = ScriptedSlave::new(vec![Err(transport_error())]).fail_restarts();
  let starts = slave.starts_handle();
  let instance = CanalInstance::new(
    "task-1",
    Box::new(slave),
    meta,
    16,
    InstanceOptions {
      reconnect_interval: Duration::from_millis(50),
      max_reconnect_attempts: 3,
      ..InstanceOptions::default()
    },
  );

  instance.start().await.unwrap();
  wait_for(|| !instance.status().running).await;

  let status = instance.status();
  assert!(status.error_msg.unwrap().contains("reconnect"));
  // Initial start + three failed reconnect attempts.
  assert_eq!(4, starts.load(Ordering::SeqCst));

  instance.stop().await;
}

#[tokio::test(start_paused = true)]
async fn event_type_filter_drops_unwanted_events() {
  let meta = Arc::new(MetaStore::open_in_memory().unwrap());
  let slave = ScriptedSlave::new(vec![
    Ok(vec![event(120, EventType::Update)]),
    Ok(vec![event(240, EventType::Insert)]),
  ]);
  let instance = CanalInstance::new("task-1", Box::new(slave), meta, 16, InstanceOptions::default());
  instance.set_event_types([EventType::Insert].into());

  let handler = Arc::new(RecordingHandler::default());
  instance.subscribe("test", "users", handler.clone());

  instance.start().await.unwrap();
  wait_for(|| handler.seen().len() == 1).await;
  assert_eq!(vec!["mysql-bin.000001:240:0"], handler.seen());

  instance.stop().await;
}

#[tokio::test(start_paused = true)]
async fn starting_twice_is_rejected() {
  let meta = Arc::new(MetaStore::open_in_memory().unwrap());
  let slave = ScriptedSlave::new(vec![]);
  let instance = CanalInstance::new("task-1", Box::new(slave), meta, 16, InstanceOptions::default());

  instance.start().await.unwrap();
  assert!(instance.start().await.is_err());
  instance.stop().await;
}
