use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{value_parser, Arg, Command};
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use rowhook::canal::handlers::EventLogSink;
use rowhook::canal::meta::MetaStore;
use rowhook::canal::HandlerError;
use rowhook::config::Config;
use rowhook::service::{CanalService, Task, TaskStatus};

/// Event-log sink for the standalone daemon: the task-management layer that
/// would normally persist these rows lives outside this binary, so they are
/// surfaced through the log instead.
struct LogEventSink;

#[async_trait]
impl EventLogSink for LogEventSink {
  async fn create_event_log(
    &self,
    task_id: u32,
    schema: &str,
    table: &str,
    event_type: &str,
    data_json: &str,
    status: &str,
    error_msg: &str,
  ) -> Result<(), HandlerError> {
    info!(task_id, schema, table, event_type, status, error_msg, data = data_json, "event log");
    Ok(())
  }
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let mut cmd = Command::new("rowhookd")
    .version(env!("CARGO_PKG_VERSION"))
    .about("Streams MySQL row changes to a webhook endpoint")
    .arg(Arg::new("url").required(true).short('u').long("url").value_parser(Url::parse))
    .arg(
      Arg::new("callback")
        .required(true)
        .short('c')
        .long("callback")
        .help("Webhook endpoint events are POSTed to"),
    )
    .arg(
      Arg::new("meta")
        .short('m')
        .long("meta")
        .default_value("./rowhook.db")
        .value_parser(value_parser!(PathBuf))
        .help("SQLite file holding replication positions and table metadata"),
    )
    .arg(Arg::new("database").short('d').long("database").default_value(""))
    .arg(Arg::new("table").short('t').long("table").default_value(""))
    .arg(
      Arg::new("server-id")
        .long("server-id")
        .default_value("1001")
        .value_parser(value_parser!(u32)),
    );

  let matches = cmd.get_matches_mut();
  let url = matches.get_one::<Url>("url").unwrap();
  let callback = matches.get_one::<String>("callback").unwrap();
  let meta_path = matches.get_one::<PathBuf>("meta").unwrap();
  let database = matches.get_one::<String>("database").unwrap();
  let table = matches.get_one::<String>("table").unwrap();
  let server_id = *matches.get_one::<u32>("server-id").unwrap();

  let mut config = Config::default();
  if let Some(host) = url.host_str() {
    config.canal.host = host.to_string();
  }
  config.canal.port = url.port().unwrap_or(3306);
  if !url.username().is_empty() {
    config.canal.username = url.username().to_string();
  }
  if let Some(password) = url.password() {
    config.canal.password = password.to_string();
  }
  config.canal.server_id = server_id;

  let meta = Arc::new(MetaStore::open(meta_path).expect("failed to open meta store"));
  let service = CanalService::new(config, meta, Arc::new(LogEventSink));
  service.start();

  let task = Task {
    id: 1,
    name: "rowhookd".to_string(),
    database: database.clone(),
    table: table.clone(),
    event_types: HashSet::new(),
    callback_url: callback.clone(),
    status: TaskStatus::Active,
  };

  if let Err(err) = service.create_task(task).await {
    eprintln!("failed to start replication: {}", err);
    std::process::exit(1);
  }

  info!("streaming; press ctrl-c to stop");
  tokio::signal::ctrl_c().await.ok();

  service.stop().await;
}
