use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{CanalError, Event, EventHandler};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

type HandlerMap = HashMap<(String, String), HashMap<String, Arc<dyn EventHandler>>>;

/// Multiplexes events to handlers registered per `(schema, table)`. One
/// consumer drains a bounded ingress queue and dispatches each event to all
/// matching handlers concurrently; a handler failure never affects its
/// peers or stream progress.
pub struct EventSink {
  capacity: usize,
  handlers: Arc<RwLock<HandlerMap>>,
  tx: Mutex<Option<mpsc::Sender<Event>>>,
  consumer: Mutex<Option<JoinHandle<()>>>,
  token: Mutex<CancellationToken>,
}

impl EventSink {
  pub fn new(capacity: usize) -> Self {
    Self {
      capacity: capacity.max(1),
      handlers: Arc::new(RwLock::new(HashMap::new())),
      tx: Mutex::new(None),
      consumer: Mutex::new(None),
      token: Mutex::new(CancellationToken::new()),
    }
  }

  pub fn start(&self) -> Result<(), CanalError> {
    let mut tx_slot = self.tx.lock().unwrap();
    if tx_slot.is_some() {
      return Err(CanalError::Failed("event sink already started".to_string()));
    }

    let (tx, mut rx) = mpsc::channel::<Event>(self.capacity);
    let token = CancellationToken::new();
    *self.token.lock().unwrap() = token.clone();

    let handlers = Arc::clone(&self.handlers);
    let consumer = tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = token.cancelled() => break,
          received = rx.recv() => match received {
            Some(event) => dispatch(&handlers, event).await,
            None => break,
          },
        }
      }
      debug!("event sink consumer stopped");
    });

    *tx_slot = Some(tx);
    *self.consumer.lock().unwrap() = Some(consumer);
    Ok(())
  }

  /// Signals the consumer to finish the in-flight event and exit. Safe to
  /// call multiple times.
  pub async fn stop(&self) {
    self.token.lock().unwrap().cancel();
    self.tx.lock().unwrap().take();
    let consumer = self.consumer.lock().unwrap().take();
    if let Some(consumer) = consumer {
      let _ = consumer.await;
    }
  }

  /// Enqueues an event, waiting up to the send timeout when the queue is
  /// full.
  pub async fn send(&self, event: Event) -> Result<(), CanalError> {
    let tx = self
      .tx
      .lock()
      .unwrap()
      .clone()
      .ok_or_else(|| CanalError::Failed("event sink is not running".to_string()))?;

    match tokio::time::timeout(SEND_TIMEOUT, tx.send(event)).await {
      Ok(Ok(())) => Ok(()),
      Ok(Err(_)) => Err(CanalError::Failed("event sink consumer is gone".to_string())),
      Err(_) => Err(CanalError::Backpressure(format!(
        "event queue full for {:?}",
        SEND_TIMEOUT
      ))),
    }
  }

  /// Registers `handler` under `(schema, table)`. Registering the same
  /// handler name twice replaces the previous registration.
  pub fn subscribe(&self, schema: &str, table: &str, handler: Arc<dyn EventHandler>) {
    let mut handlers = self.handlers.write().unwrap();
    let key = (schema.to_string(), table.to_string());
    let name = handler.name().to_string();
    handlers.entry(key).or_default().insert(name.clone(), handler);
    debug!(schema, table, handler = %name, "subscribed handler");
  }

  pub fn unsubscribe(&self, schema: &str, table: &str, handler_name: &str) {
    let mut handlers = self.handlers.write().unwrap();
    let key = (schema.to_string(), table.to_string());
    if let Some(set) = handlers.get_mut(&key) {
      set.remove(handler_name);
      if set.is_empty() {
        handlers.remove(&key);
      }
    }
    debug!(schema, table, handler = handler_name, "unsubscribed handler");
  }

  pub fn handler_count(&self, schema: &str, table: &str) -> usize {
    self
      .handlers
      .read()
      .unwrap()
      .get(&(schema.to_string(), table.to_string()))
      .map(|set| set.len())
      .unwrap_or(0)
  }
}

async fn dispatch(handlers: &RwLock<HandlerMap>, event: Event) {
  // Empty schema or table act as wildcards at subscription time.
  let keys = [
    (event.schema.clone(), event.table.clone()),
    (event.schema.clone(), String::new()),
    (String::new(), event.table.clone()),
    (String::new(), String::new()),
  ];

  let matching: Vec<(String, Arc<dyn EventHandler>)> = {
    let handlers = handlers.read().unwrap();
    let mut out: HashMap<String, Arc<dyn EventHandler>> = HashMap::new();
    for key in &keys {
      if let Some(set) = handlers.get(key) {
        for (name, handler) in set {
          out.entry(name.clone()).or_insert_with(|| Arc::clone(handler));
        }
      }
    }
    out.into_iter().collect()
  };

  if matching.is_empty() {
    return;
  }

  let event = Arc::new(event);
  let mut join_set = JoinSet::new();
  for (name, handler) in matching {
    let event = Arc::clone(&event);
    join_set.spawn(async move {
      match tokio::time::timeout(DISPATCH_TIMEOUT, handler.handle(&event)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(handler = %name, event = %event.id, %err, "handler failed"),
        Err(_) => warn!(handler = %name, event = %event.id, "handler timed out"),
      }
    });
  }
  while join_set.join_next().await.is_some() {}
}
