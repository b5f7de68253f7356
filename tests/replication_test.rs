use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use rowhook::canal::slave::{BinlogSlave, DecodePolicy, MysqlBinlogSlave, MysqlConfig};
use rowhook::canal::{ColumnValue, EventType, Position};

// Binlog event type bytes used by the scripted primary.
const ROTATE_EVENT: u8 = 0x04;
const FORMAT_DESCRIPTION_EVENT: u8 = 0x0F;
const TABLE_MAP_EVENT: u8 = 0x13;
const XID_EVENT: u8 = 0x10;
const HEARTBEAT_EVENT: u8 = 0x1B;
const WRITE_ROWS_EVENTV2: u8 = 0x1E;
const UPDATE_ROWS_EVENTV2: u8 = 0x1F;

const MYSQL_TYPE_LONG: u8 = 0x03;
const MYSQL_TYPE_VARCHAR: u8 = 0x0F;

#[derive(Debug, Clone)]
struct DumpRequest {
  file: String,
  position: u32,
  server_id: u32,
}

#[derive(Default)]
struct PrimaryState {
  dump_requests: Mutex<Vec<DumpRequest>>,
}

/// A scripted MySQL primary: performs the replication handshake, answers the
/// preparation queries, and replays a canned binlog once the dump command
/// arrives.
async fn spawn_fake_primary(binlog: Vec<Vec<u8>>) -> (SocketAddr, Arc<PrimaryState>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let state = Arc::new(PrimaryState::default());

  let server_state = Arc::clone(&state);
  tokio::spawn(async move {
    loop {
      let Ok((socket, _)) = listener.accept().await else { break };
      let state = Arc::clone(&server_state);
      let binlog = binlog.clone();
      tokio::spawn(async move {
        let _ = serve_connection(socket, state, binlog).await;
      });
    }
  });

  (addr, state)
}

async fn write_packet(socket: &mut TcpStream, sequence_id: u8, payload: &[u8]) -> std::io::Result<()> {
  let mut frame = Vec::with_capacity(4 + payload.len());
  frame.extend_from_slice(&(payload.len() as u32).to_le_bytes()[..3]);
  frame.push(sequence_id);
  frame.extend_from_slice(payload);
  socket.write_all(&frame).await
}

async fn read_packet(socket: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
  let mut header = [0_u8; 4];
  socket.read_exact(&mut header).await?;
  let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
  let sequence_id = header[3];
  let mut payload = vec![0_u8; len];
  socket.read_exact(&mut payload).await?;
  Ok((sequence_id, payload))
}

fn ok_packet(header: u8) -> Vec<u8> {
  // header, affected rows, last insert id, status flags, warnings
  vec![header, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]
}

fn lenc_str(out: &mut Vec<u8>, s: &str) {
  out.push(s.len() as u8);
  out.extend_from_slice(s.as_bytes());
}

fn column_definition(name: &str) -> Vec<u8> {
  let mut out = Vec::new();
  lenc_str(&mut out, "def");
  lenc_str(&mut out, "");
  lenc_str(&mut out, "");
  lenc_str(&mut out, "");
  lenc_str(&mut out, name);
  lenc_str(&mut out, name);
  out.push(0x0C); // fixed length of the trailing block
  out.extend_from_slice(&0x21_u16.to_le_bytes()); // utf8
  out.extend_from_slice(&255_u32.to_le_bytes());
  out.push(0xFD); // VAR_STRING
  out.extend_from_slice(&0_u16.to_le_bytes());
  out.push(0);
  out.extend_from_slice(&[0, 0]); // filler
  out
}

async fn serve_connection(
  mut socket: TcpStream,
  state: Arc<PrimaryState>,
  binlog: Vec<Vec<u8>>,
) -> std::io::Result<()> {
  // Handshake V10 with mysql_native_password.
  let mut handshake = Vec::new();
  handshake.push(10);
  handshake.extend_from_slice(b"8.0.32\0");
  handshake.extend_from_slice(&7_u32.to_le_bytes()); // connection id
  handshake.extend_from_slice(b"abcdefgh"); // scramble part 1
  handshake.push(0);
  handshake.extend_from_slice(&0x8205_u16.to_le_bytes()); // caps low
  handshake.push(0x21); // charset
  handshake.extend_from_slice(&0x0002_u16.to_le_bytes()); // status
  handshake.extend_from_slice(&0x0128_u16.to_le_bytes()); // caps high
  handshake.push(21); // scramble length
  handshake.extend_from_slice(&[0; 10]);
  handshake.extend_from_slice(b"ijklmnopqrst"); // scramble part 2
  handshake.push(0);
  handshake.extend_from_slice(b"mysql_native_password\0");
  write_packet(&mut socket, 0, &handshake).await?;

  // Handshake response; credentials are not verified by the script.
  let (_, _response) = read_packet(&mut socket).await?;
  write_packet(&mut socket, 2, &ok_packet(0x00)).await?;

  loop {
    let Ok((_, command)) = read_packet(&mut socket).await else { return Ok(()) };
    match command.first() {
      // COM_QUERY
      Some(0x03) => {
        let sql = String::from_utf8_lossy(&command[1..]).to_ascii_uppercase();
        if sql.contains("SHOW MASTER STATUS") {
          write_packet(&mut socket, 1, &[0x02]).await?; // column count
          write_packet(&mut socket, 2, &column_definition("File")).await?;
          write_packet(&mut socket, 3, &column_definition("Position")).await?;
          let mut row = Vec::new();
          lenc_str(&mut row, "mysql-bin.000001");
          lenc_str(&mut row, "4321");
          write_packet(&mut socket, 4, &row).await?;
          write_packet(&mut socket, 5, &ok_packet(0xFE)).await?;
        } else {
          write_packet(&mut socket, 1, &ok_packet(0x00)).await?;
        }
      }
      // COM_REGISTER_SLAVE
      Some(0x15) => {
        write_packet(&mut socket, 1, &ok_packet(0x00)).await?;
      }
      // COM_BINLOG_DUMP
      Some(0x12) => {
        let position = u32::from_le_bytes([command[1], command[2], command[3], command[4]]);
        let server_id = u32::from_le_bytes([command[7], command[8], command[9], command[10]]);
        let file = String::from_utf8_lossy(&command[11..]).into_owned();
        state.dump_requests.lock().unwrap().push(DumpRequest {
          file,
          position,
          server_id,
        });

        let mut sequence_id = 1_u8;
        for event in &binlog {
          let mut payload = Vec::with_capacity(1 + event.len());
          payload.push(0x00);
          payload.extend_from_slice(event);
          write_packet(&mut socket, sequence_id, &payload).await?;
          sequence_id = sequence_id.wrapping_add(1);
        }
        // Idle like a real primary between transactions.
        tokio::time::sleep(Duration::from_secs(3600)).await;
      }
      // COM_QUIT or anything else ends the session.
      _ => return Ok(()),
    }
  }
}

fn binlog_event(event_type: u8, log_position: u32, body: &[u8]) -> Vec<u8> {
  let mut out = Vec::with_capacity(19 + body.len());
  out.extend_from_slice(&1_700_000_000_u32.to_le_bytes()); // timestamp
  out.push(event_type);
  out.extend_from_slice(&7_u32.to_le_bytes()); // server id
  out.extend_from_slice(&((19 + body.len()) as u32).to_le_bytes());
  out.extend_from_slice(&log_position.to_le_bytes());
  out.extend_from_slice(&0_u16.to_le_bytes()); // flags
  out.extend_from_slice(body);
  out
}

fn rotate_event(log_position: u32, next_position: u64, next_file: &str) -> Vec<u8> {
  let mut body = Vec::new();
  body.extend_from_slice(&next_position.to_le_bytes());
  body.extend_from_slice(next_file.as_bytes());
  binlog_event(ROTATE_EVENT, log_position, &body)
}

fn format_description_event(log_position: u32) -> Vec<u8> {
  let mut body = Vec::new();
  body.extend_from_slice(&4_u16.to_le_bytes());
  let mut version = [0_u8; 50];
  version[..6].copy_from_slice(b"8.0.32");
  body.extend_from_slice(&version);
  body.extend_from_slice(&0_u32.to_le_bytes()); // create timestamp
  body.push(19); // header length
  body.extend_from_slice(&[0_u8; 38]); // per-type header lengths
  body.push(0x00); // checksum algorithm: off
  body.extend_from_slice(&[0_u8; 4]);
  binlog_event(FORMAT_DESCRIPTION_EVENT, log_position, &body)
}

/// TableMap for a `(INT id, VARCHAR(400) name)` table with FULL row
/// metadata: signedness and column names.
fn table_map_event(log_position: u32, table_id: u64, schema: &str, table: &str) -> Vec<u8> {
  let mut body = Vec::new();
  body.extend_from_slice(&table_id.to_le_bytes()[..6]);
  body.extend_from_slice(&1_u16.to_le_bytes()); // flags
  body.push(schema.len() as u8);
  body.extend_from_slice(schema.as_bytes());
  body.push(0);
  body.push(table.len() as u8);
  body.extend_from_slice(table.as_bytes());
  body.push(0);
  body.push(2); // column count
  body.push(MYSQL_TYPE_LONG);
  body.push(MYSQL_TYPE_VARCHAR);
  body.push(2); // metadata length
  body.extend_from_slice(&400_u16.to_le_bytes()); // varchar max length
  body.push(0x02); // null bitmap: name is nullable
  // SIGNEDNESS block: the single numeric column is signed.
  body.push(0x01);
  body.push(0x01);
  body.push(0x00);
  // COLUMN_NAME block.
  body.push(0x04);
  body.push(8);
  body.push(2);
  body.extend_from_slice(b"id");
  body.push(4);
  body.extend_from_slice(b"name");
  binlog_event(TABLE_MAP_EVENT, log_position, &body)
}

fn rows_header(table_id: u64, column_count: u8) -> Vec<u8> {
  let mut body = Vec::new();
  body.extend_from_slice(&table_id.to_le_bytes()[..6]);
  body.extend_from_slice(&1_u16.to_le_bytes()); // flags
  body.extend_from_slice(&2_u16.to_le_bytes()); // v2 extras: empty
  body.push(column_count);
  body
}

fn row_image(id: u32, name: &str) -> Vec<u8> {
  let mut out = Vec::new();
  out.push(0x00); // null bitmap: nothing null
  out.extend_from_slice(&id.to_le_bytes());
  out.extend_from_slice(&(name.len() as u16).to_le_bytes());
  out.extend_from_slice(name.as_bytes());
  out
}

fn write_rows_event(log_position: u32, table_id: u64, id: u32, name: &str) -> Vec<u8> {
  let mut body = rows_header(table_id, 2);
  body.push(0x03); // present bitmap
  body.extend_from_slice(&row_image(id, name));
  binlog_event(WRITE_ROWS_EVENTV2, log_position, &body)
}

fn update_rows_event(log_position: u32, table_id: u64, id: u32, before: &str, after: &str) -> Vec<u8> {
  let mut body = rows_header(table_id, 2);
  body.push(0x03); // before present bitmap
  body.push(0x03); // after present bitmap
  body.extend_from_slice(&row_image(id, before));
  body.extend_from_slice(&row_image(id, after));
  binlog_event(UPDATE_ROWS_EVENTV2, log_position, &body)
}

fn xid_event(log_position: u32) -> Vec<u8> {
  binlog_event(XID_EVENT, log_position, &42_u64.to_le_bytes())
}

fn heartbeat_event() -> Vec<u8> {
  binlog_event(HEARTBEAT_EVENT, 0, b"mysql-bin.000001")
}

fn slave_config(addr: SocketAddr) -> MysqlConfig {
  MysqlConfig {
    host: addr.ip().to_string(),
    port: addr.port(),
    username: "tester".to_string(),
    password: String::new(),
    server_id: 4242,
    heartbeat_period: Duration::from_secs(30),
    read_timeout: Duration::from_secs(5),
    gtid_enabled: false,
    decode_policy: DecodePolicy::Drop,
  }
}

async fn wait_for_dump_request(state: &PrimaryState) -> DumpRequest {
  for _ in 0..400 {
    if let Some(request) = state.dump_requests.lock().unwrap().first().cloned() {
      return request;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  panic!("no dump request arrived in time");
}

fn scripted_binlog() -> Vec<Vec<u8>> {
  vec![
    // The artificial rotate a dump always opens with.
    rotate_event(0, 4321, "mysql-bin.000001"),
    format_description_event(126),
    heartbeat_event(),
    table_map_event(300, 42, "test", "users"),
    write_rows_event(400, 42, 1, "alice"),
    xid_event(500),
    // A table outside the watch filter never surfaces.
    table_map_event(550, 43, "other", "skip"),
    write_rows_event(580, 43, 9, "nope"),
    table_map_event(590, 42, "test", "users"),
    update_rows_event(600, 42, 1, "alice", "bob"),
    xid_event(620),
    // Log rotation: table ids reset with the new file.
    rotate_event(0, 4, "mysql-bin.000002"),
    table_map_event(200, 77, "test", "users"),
    write_rows_event(300, 77, 2, "carol"),
  ]
}

#[tokio::test]
async fn streams_and_decodes_row_events_end_to_end() {
  let (addr, state) = spawn_fake_primary(scripted_binlog()).await;

  let mut slave = MysqlBinlogSlave::new(slave_config(addr), None);
  slave.add_watch_table("test", "users");
  slave.start().await.unwrap();

  // The dump starts at the primary's head because no position was seeded.
  let request = wait_for_dump_request(&state).await;
  assert_eq!("mysql-bin.000001", request.file);
  assert_eq!(4321, request.position);
  assert_eq!(4242, request.server_id);

  // INSERT
  let batch = slave.recv().await.unwrap();
  assert_eq!(1, batch.len());
  let insert = &batch[0];
  assert_eq!(EventType::Insert, insert.event_type);
  assert_eq!("test", insert.schema);
  assert_eq!("users", insert.table);
  assert_eq!("mysql-bin.000001:400:0", insert.id);
  assert!(insert.before_data.is_none());
  let after = insert.after_data.as_ref().unwrap();
  assert_eq!("id", after.columns[0].name);
  assert_eq!("int", after.columns[0].column_type);
  assert_eq!(ColumnValue::Int(1), after.columns[0].value);
  assert!(!after.columns[0].is_null);
  assert_eq!("name", after.columns[1].name);
  assert_eq!(ColumnValue::Bytes(b"alice".to_vec()), after.columns[1].value);
  assert_eq!(
    Position {
      file: "mysql-bin.000001".to_string(),
      offset: 400,
      gtid_set: None
    },
    insert.position
  );

  // UPDATE pairs before and after images and flags the changed column. The
  // filtered table in between never surfaces.
  let batch = slave.recv().await.unwrap();
  assert_eq!(1, batch.len());
  let update = &batch[0];
  assert_eq!(EventType::Update, update.event_type);
  let before = update.before_data.as_ref().unwrap();
  let after = update.after_data.as_ref().unwrap();
  assert_eq!(before.columns.len(), after.columns.len());
  assert_eq!(ColumnValue::Bytes(b"alice".to_vec()), before.columns[1].value);
  assert_eq!(ColumnValue::Bytes(b"bob".to_vec()), after.columns[1].value);
  assert!(after.columns[1].updated);
  assert!(!after.columns[0].updated);
  assert_eq!(600, update.position.offset);

  // INSERT after rotation lands in the next file.
  let batch = slave.recv().await.unwrap();
  let insert = &batch[0];
  assert_eq!("mysql-bin.000002", insert.position.file);
  assert_eq!(300, insert.position.offset);
  assert_eq!(ColumnValue::Int(2), insert.after_data.as_ref().unwrap().columns[0].value);

  // Position advances monotonically across everything we consumed.
  let position = slave.position();
  assert_eq!("mysql-bin.000002", position.file);
  assert_eq!(300, position.offset);

  slave.stop().await;
}

#[tokio::test]
async fn resumes_the_dump_from_a_seeded_position() {
  let (addr, state) = spawn_fake_primary(vec![
    rotate_event(0, 49_000, "mysql-bin.000003"),
    format_description_event(126),
  ])
  .await;

  let mut slave = MysqlBinlogSlave::new(slave_config(addr), None);
  slave.set_position(Position {
    file: "mysql-bin.000003".to_string(),
    offset: 49_000,
    gtid_set: None,
  });
  slave.start().await.unwrap();

  let request = wait_for_dump_request(&state).await;
  assert_eq!("mysql-bin.000003", request.file);
  assert_eq!(49_000, request.position);

  slave.stop().await;
}

#[tokio::test]
async fn persists_table_metadata_on_table_map() {
  use rowhook::canal::meta::MetaStore;

  let (addr, _state) = spawn_fake_primary(scripted_binlog()).await;
  let meta = Arc::new(MetaStore::open_in_memory().unwrap());

  let mut slave = MysqlBinlogSlave::new(slave_config(addr), Some(Arc::clone(&meta)));
  slave.add_watch_table("test", "users");
  slave.start().await.unwrap();

  let _ = slave.recv().await.unwrap();

  let table_meta = meta.load_table_meta("test", "users").unwrap().unwrap();
  assert_eq!(vec!["id".to_string(), "name".to_string()], table_meta.columns);
  assert_eq!(vec!["int".to_string(), "varchar".to_string()], table_meta.types);

  slave.stop().await;
}
