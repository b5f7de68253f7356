use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{CanalError, Event, EventHandler, EventType, HandlerError};

/// Identifier sent as the webhook `source` field and User-Agent.
pub const SERVICE_NAME: &str = concat!("rowhook/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct WebhookOptions {
  pub batch_size: usize,
  pub batch_timeout: Duration,
  pub max_retries: u32,
  pub retry_interval: Duration,
  pub request_timeout: Duration,
}

impl Default for WebhookOptions {
  fn default() -> Self {
    Self {
      batch_size: 10,
      batch_timeout: Duration::from_secs(5),
      max_retries: 3,
      retry_interval: Duration::from_secs(1),
      request_timeout: Duration::from_secs(30),
    }
  }
}

/// Delivers batches of events to a callback URL. Events buffer until either
/// `batch_size` is reached or `batch_timeout` elapses; sending happens on a
/// detached task so `handle` never waits on the network, and an in-flight
/// POST survives instance shutdown.
pub struct WebhookHandler {
  name: String,
  callback_url: String,
  client: reqwest::Client,
  options: WebhookOptions,
  buffer: Mutex<Vec<Event>>,
  flush_timer: Mutex<Option<JoinHandle<()>>>,
  success_count: AtomicU64,
  error_count: AtomicU64,
  weak: Weak<WebhookHandler>,
}

impl WebhookHandler {
  pub fn new(
    name: impl Into<String>,
    callback_url: impl Into<String>,
    options: WebhookOptions,
  ) -> Result<Arc<Self>, CanalError> {
    let client = reqwest::Client::builder()
      .timeout(options.request_timeout)
      .user_agent(SERVICE_NAME)
      .build()
      .map_err(|err| CanalError::Config(format!("failed to build webhook client: {}", err)))?;

    Ok(Arc::new_cyclic(|weak| Self {
      name: name.into(),
      callback_url: callback_url.into(),
      client,
      options,
      buffer: Mutex::new(Vec::new()),
      flush_timer: Mutex::new(None),
      success_count: AtomicU64::new(0),
      error_count: AtomicU64::new(0),
      weak: weak.clone(),
    }))
  }

  /// `(success_count, error_count, buffered)`.
  pub fn stats(&self) -> (u64, u64, usize) {
    (
      self.success_count.load(Ordering::Relaxed),
      self.error_count.load(Ordering::Relaxed),
      self.buffer.lock().unwrap().len(),
    )
  }

  /// Cancels the pending flush timer and delivers whatever is buffered.
  /// Called on instance teardown so buffered events are not stranded.
  pub fn shutdown(&self) {
    if let Some(timer) = self.flush_timer.lock().unwrap().take() {
      timer.abort();
    }
    self.flush();
  }

  /// Swaps the buffer for an empty one and sends the batch on a detached
  /// task.
  fn flush(&self) {
    let batch = {
      let mut buffer = self.buffer.lock().unwrap();
      std::mem::take(&mut *buffer)
    };
    if batch.is_empty() {
      return;
    }

    if let Some(timer) = self.flush_timer.lock().unwrap().take() {
      timer.abort();
    }

    if let Some(handler) = self.weak.upgrade() {
      tokio::spawn(async move {
        handler.send_with_retry(batch).await;
      });
    }
  }

  fn arm_flush_timer(&self) {
    let mut slot = self.flush_timer.lock().unwrap();
    if let Some(previous) = slot.take() {
      previous.abort();
    }
    let weak = self.weak.clone();
    let timeout = self.options.batch_timeout;
    *slot = Some(tokio::spawn(async move {
      tokio::time::sleep(timeout).await;
      if let Some(handler) = weak.upgrade() {
        debug!(handler = %handler.name, "batch timeout reached, flushing");
        handler.flush();
      }
    }));
  }

  async fn send_with_retry(&self, events: Vec<Event>) {
    let count = events.len() as u64;
    let payload = json!({
      "events": events,
      "timestamp": chrono::Utc::now().timestamp(),
      "source": SERVICE_NAME,
    });

    for attempt in 0..=self.options.max_retries {
      if attempt > 0 {
        // Linear backoff: attempt * retry_interval.
        tokio::time::sleep(self.options.retry_interval * attempt).await;
      }

      match self.send(&payload, count).await {
        Ok(()) => {
          self.success_count.fetch_add(count, Ordering::Relaxed);
          debug!(handler = %self.name, count, attempt, "webhook batch delivered");
          return;
        }
        Err(err) => {
          self.error_count.fetch_add(1, Ordering::Relaxed);
          warn!(handler = %self.name, url = %self.callback_url, attempt, %err, "webhook delivery failed");
        }
      }
    }

    // The durable event log is the replay path for batches dropped here.
    warn!(
      handler = %self.name,
      url = %self.callback_url,
      count,
      "dropping batch after {} attempts",
      self.options.max_retries + 1
    );
  }

  async fn send(&self, payload: &serde_json::Value, count: u64) -> Result<(), HandlerError> {
    let response = self
      .client
      .post(&self.callback_url)
      .header("X-Event-Count", count)
      .json(payload)
      .send()
      .await?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(HandlerError::Other(format!(
        "webhook returned status {}: {}",
        status, body
      )));
    }
    Ok(())
  }
}

#[async_trait]
impl EventHandler for WebhookHandler {
  fn name(&self) -> &str {
    &self.name
  }

  async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
    let should_flush = {
      let mut buffer = self.buffer.lock().unwrap();
      buffer.push(event.clone());
      buffer.len() >= self.options.batch_size
    };

    if should_flush {
      self.flush();
    } else {
      self.arm_flush_timer();
    }
    Ok(())
  }
}

/// Capability used by the database handler to append event log rows. The
/// task-management layer injects its own implementation.
#[async_trait]
pub trait EventLogSink: Send + Sync {
  #[allow(clippy::too_many_arguments)]
  async fn create_event_log(
    &self,
    task_id: u32,
    schema: &str,
    table: &str,
    event_type: &str,
    data_json: &str,
    status: &str,
    error_msg: &str,
  ) -> Result<(), HandlerError>;
}

/// Appends each event to the local event log through the injected sink.
/// Failures surface to the sink's dispatch logging; there are no retries.
pub struct DatabaseHandler {
  name: String,
  task_id: u32,
  sink: Arc<dyn EventLogSink>,
  enabled: bool,
  processed: AtomicU64,
}

impl DatabaseHandler {
  pub fn new(name: impl Into<String>, task_id: u32, sink: Arc<dyn EventLogSink>, enabled: bool) -> Self {
    Self {
      name: name.into(),
      task_id,
      sink,
      enabled,
      processed: AtomicU64::new(0),
    }
  }

  pub fn processed(&self) -> u64 {
    self.processed.load(Ordering::Relaxed)
  }
}

#[async_trait]
impl EventHandler for DatabaseHandler {
  fn name(&self) -> &str {
    &self.name
  }

  async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
    self.processed.fetch_add(1, Ordering::Relaxed);

    if !self.enabled {
      return Ok(());
    }

    // DELETE only carries a before image; everything else logs the after
    // image.
    let data = match event.event_type {
      EventType::Delete => event.before_data.as_ref(),
      _ => event.after_data.as_ref(),
    };
    let data_json = match data {
      Some(row) => serde_json::to_string(row).map_err(|err| HandlerError::Other(err.to_string()))?,
      None => String::new(),
    };

    self
      .sink
      .create_event_log(
        self.task_id,
        &event.schema,
        &event.table,
        &event.event_type.to_string(),
        &data_json,
        "success",
        "",
      )
      .await
  }
}
