use std::cmp::max;
use std::collections::BTreeMap;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;
use std::time::Duration;
use std::{fmt, io};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::{self, TcpStream};
use tracing::trace;
use url::Url;

use super::binlog::{BinlogChecksumAlg, BinlogEvent, BinlogEventHeader, BinlogEventPacket};
use super::buf_ext::{BufExt, BufMutExt};
use super::constants::{
  BinlogDumpFlags, CapabilityFlags, CharacterSet, Command, StatusFlags, CACHING_SHA2_PASSWORD_PLUGIN_NAME,
  MAX_PAYLOAD_LEN, MYSQL_NATIVE_PASSWORD_PLUGIN_NAME,
};
use super::query::{Column, QueryResults, RowValue};
use super::scramble;

/// How many payload bytes a packet trace renders before eliding the rest.
const PACKET_PREVIEW_LEN: usize = 64;

// Compact hex rendering for packet traces. Row events can carry megabytes;
// only a prefix is printed, with the total length when elided.
struct PacketPreview<'a>(&'a [u8]);

impl fmt::Debug for PacketPreview<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let shown = &self.0[..self.0.len().min(PACKET_PREVIEW_LEN)];
    for byte in shown {
      write!(f, "{:02x}", byte)?;
    }
    if self.0.len() > PACKET_PREVIEW_LEN {
      write!(f, "..+{}b", self.0.len() - PACKET_PREVIEW_LEN)?;
    }
    Ok(())
  }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
  pub user: String,
  pub password: Option<String>,
  pub database: Option<String>,
  pub connect_timeout: Option<Duration>,
  pub read_timeout: Option<Duration>,
  pub write_timeout: Option<Duration>,
}

impl Default for ConnectionOptions {
  fn default() -> Self {
    Self {
      user: "mysql".to_string(),
      password: None,
      database: None,
      connect_timeout: None,
      read_timeout: None,
      write_timeout: None,
    }
  }
}

impl TryFrom<&Url> for ConnectionOptions {
  type Error = io::Error;

  fn try_from(url: &Url) -> Result<Self, Self::Error> {
    let user = match url.username() {
      "" => "mysql".to_string(),
      user => user.to_string(),
    };
    let password = url.password().map(ToString::to_string);

    let query_pairs = url.query_pairs().collect::<BTreeMap<_, _>>();
    let database = query_pairs.get("database").map(|v| v.to_string());

    let connect_timeout = query_pairs
      .get("connect_timeout_ms")
      .and_then(|v| v.parse().ok())
      .map(Duration::from_millis);

    let read_timeout = query_pairs
      .get("read_timeout_ms")
      .and_then(|v| v.parse().ok())
      .map(Duration::from_millis);

    let write_timeout = query_pairs
      .get("write_timeout_ms")
      .and_then(|v| v.parse().ok())
      .map(Duration::from_millis);

    Ok(Self {
      user,
      password,
      database,
      connect_timeout,
      read_timeout,
      write_timeout,
    })
  }
}

/// Options controlling how a replication session is established on top of an
/// authenticated connection.
#[derive(Debug, Clone)]
pub struct ReplicationOptions {
  pub server_id: u32,
  /// Heartbeat interval the primary is asked to emit during idle periods.
  pub heartbeat_period: Option<Duration>,
  /// Dump by GTID set instead of file+offset when one is known.
  pub gtid_set: Option<String>,
}

impl Default for ReplicationOptions {
  fn default() -> Self {
    Self {
      server_id: 1,
      heartbeat_period: None,
      gtid_set: None,
    }
  }
}

#[derive(Debug)]
pub struct Connection {
  stream: BufStream<TcpStream>,
  capabilities: CapabilityFlags,
  status_flags: StatusFlags,
  server_character_set: Option<CharacterSet>,
  sequence_id: u8,
  last_command_id: u8,
  options: ConnectionOptions,
  max_packet_size: u32,
  warnings: u16,
  affected_rows: u64,
  last_inserted_id: u64,
  addrs: Vec<SocketAddr>,
}

impl Connection {
  pub async fn connect_from_url(url: &Url) -> io::Result<Self> {
    match url.scheme() {
      "tcp" | "mysql" => {
        let port = url.port().unwrap_or(3306);
        let addrs = match url.host() {
          Some(url::Host::Domain(domain)) => net::lookup_host(format!("{}:{}", domain, port))
            .await
            .map(|v| v.collect::<Vec<_>>())?,
          Some(url::Host::Ipv4(ip)) => vec![SocketAddrV4::new(ip, port).into()],
          Some(url::Host::Ipv6(ip)) => vec![SocketAddrV6::new(ip, port, 0, 0).into()],
          None => return Err(io::Error::new(io::ErrorKind::InvalidInput, "url has no host")),
        };
        let options = url.try_into()?;
        Self::connect_tcp(addrs, options).await
      }
      scheme => Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{} is not supported", scheme),
      )),
    }
  }

  pub async fn connect_tcp(addrs: impl Into<Vec<SocketAddr>>, options: ConnectionOptions) -> io::Result<Self> {
    let addrs = addrs.into();
    let connect = TcpStream::connect(addrs.as_slice());
    let stream = match options.connect_timeout {
      Some(limit) => tokio::time::timeout(limit, connect)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??,
      None => connect.await?,
    };
    Self::connect(BufStream::new(stream), addrs, options).await
  }

  async fn connect(
    stream: BufStream<TcpStream>,
    addrs: Vec<SocketAddr>,
    options: ConnectionOptions,
  ) -> io::Result<Self> {
    let mut connection = Self {
      stream,
      capabilities: CapabilityFlags::empty(),
      status_flags: StatusFlags::empty(),
      server_character_set: None,
      sequence_id: 0,
      last_command_id: 0,
      options,
      max_packet_size: 16_777_216, // 16MB
      warnings: 0,
      affected_rows: 0,
      last_inserted_id: 0,
      addrs,
    };

    connection.handshake().await?;

    Ok(connection)
  }

  /// Opens a second connection against the same endpoint with the same
  /// options. Replication takes over a connection wholesale, so callers that
  /// still need queries open a sibling.
  pub async fn duplicate(&self) -> io::Result<Self> {
    Self::connect_tcp(self.addrs.clone(), self.options.clone()).await
  }

  pub async fn close(mut self) -> io::Result<()> {
    self.write_command(Command::COM_QUIT, &[]).await?;
    let payload = self.read_payload().await;

    match payload {
      Ok(payload) => Err(self.parse_and_handle_server_error(payload)),
      // read_exact returns UnexpectedEof once the server hangs up.
      Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(()),
      Err(err) => Err(err),
    }
  }

  async fn handshake(&mut self) -> io::Result<()> {
    // https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_connection_phase.html
    let payload = self.read_payload().await?;

    match payload.first() {
      Some(0xFF) => Err(self.parse_and_handle_server_error(payload)),
      Some(_) => {
        let handshake = Handshake::parse(payload)?;
        self.handle_handshake(handshake).await
      }
      None => Err(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "Unexpected EOF while parsing handshake response",
      )),
    }
  }

  fn handle_server_error(&mut self, err: ServerError) -> io::Error {
    io::Error::new(
      io::ErrorKind::Other,
      format!("Server error {}: {}", err.error_code, err.error_message),
    )
  }

  async fn handle_handshake(&mut self, p: Handshake) -> io::Result<()> {
    if p.protocol_version != 10u8 {
      return Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("protocol version {} is not supported", p.protocol_version),
      ));
    }

    if !p.capabilities.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
      return Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "server does not support protocol 4.1",
      ));
    }

    // Intersection between what the server supports, and what our client supports.
    self.capabilities = p.capabilities & default_client_capabilities(&self.options);
    self.status_flags = p.status_flags;
    self.server_character_set = p.character_set;

    self
      .write_handshake_response(p.auth_plugin.as_str(), p.nonce().chunk())
      .await?;
    self.read_auth_response().await
  }

  async fn read_auth_response(&mut self) -> io::Result<()> {
    loop {
      let mut payload = self.read_payload().await?;

      match payload.first() {
        Some(0x00) => return self.parse_and_handle_server_ok(payload),
        // AuthMoreData
        Some(0x01) => {
          match payload.chunk() {
            // caching_sha2_password fast path succeeded; an OK packet follows.
            [0x01, 0x03] => continue,
            // Full authentication would require exchanging the cleartext
            // password, which is only safe over a secure channel.
            [0x01, 0x04] => {
              return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "caching_sha2_password full authentication requires a secure channel",
              ))
            }
            _ => {
              return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected AuthMoreData payload",
              ))
            }
          }
        }
        // AuthSwitch
        Some(0xFE) => {
          payload.advance(1);
          let auth_plugin = payload.mysql_get_null_terminated_string();
          let nonce = payload.mysql_get_null_terminated_string();
          self
            .write_auth_switch_response(auth_plugin.as_str(), nonce.as_bytes())
            .await?;
        }
        Some(0xFF) => return Err(self.parse_and_handle_server_error(payload)),
        Some(other) => {
          return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected auth response {:#04x}", other),
          ))
        }
        None => {
          return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "Unexpected EOF while parsing login response",
          ))
        }
      }
    }
  }

  /// Send a text query to MySQL and return the full result set.
  pub async fn query(&mut self, query: impl AsRef<str>) -> io::Result<QueryResults> {
    self
      .write_command(Command::COM_QUERY, query.as_ref().as_bytes())
      .await?;
    self.read_results().await
  }

  pub async fn ping(&mut self) -> io::Result<()> {
    self.write_command(Command::COM_PING, &[]).await?;

    let payload = self.read_payload().await?;
    match payload.first() {
      Some(0x00) => self.parse_and_handle_server_ok(payload),
      Some(0xFF) => Err(self.parse_and_handle_server_error(payload)),
      _ => Err(io::Error::new(io::ErrorKind::InvalidData, "unexpected ping response")),
    }
  }

  async fn write_command(&mut self, cmd: Command, payload: &[u8]) -> io::Result<()> {
    self.sequence_id = 0;
    self.last_command_id = cmd as u8;

    let mut b = BytesMut::with_capacity(1 + payload.len());
    b.put_u8(cmd as u8);
    b.put(payload);

    self.write_payload(b.into()).await
  }

  async fn write_payload(&mut self, payload: Bytes) -> io::Result<()> {
    let write_timeout = self.options.write_timeout;

    // Payloads are chunked to MAX_PAYLOAD_LEN; a payload of exactly that
    // size is terminated by an empty trailing frame on read.
    for chunk in payload.chunks(MAX_PAYLOAD_LEN) {
      let mut b = BytesMut::with_capacity(4 + chunk.len());
      b.put_uint_le(chunk.len() as u64, 3);
      b.put_u8(self.sequence_id);
      b.put(chunk);

      trace!(">> {:?}", PacketPreview(chunk));

      self.sequence_id = self.sequence_id.wrapping_add(1);
      let stream = &mut self.stream;
      let write = async {
        stream.write_all(&b[..]).await?;
        stream.flush().await
      };
      match write_timeout {
        Some(limit) => tokio::time::timeout(limit, write)
          .await
          .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))??,
        None => write.await?,
      }
    }

    Ok(())
  }

  async fn read_generic_response(&mut self) -> io::Result<()> {
    let payload = self.read_payload().await?;

    match payload.first() {
      Some(0x00) => self.parse_and_handle_server_ok(payload),
      Some(0xFF) => Err(self.parse_and_handle_server_error(payload)),
      Some(_) => Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "Invalid data while parsing generic response",
      )),
      None => Err(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "Unexpected EOF while parsing generic response",
      )),
    }
  }

  async fn read_results(&mut self) -> io::Result<QueryResults> {
    // https://dev.mysql.com/doc/internals/en/com-query-response.html
    let mut payload = self.read_payload().await?;

    match payload.first() {
      Some(0x00) => {
        self.parse_and_handle_server_ok(payload)?;
        Ok(QueryResults::default())
      }
      Some(0xFF) => Err(self.parse_and_handle_server_error(payload)),
      Some(0xFB) => Err(io::Error::new(io::ErrorKind::Unsupported, "LOCAL INFILE is not supported")),
      Some(_) => {
        let column_count = payload.mysql_get_lenc_uint().try_into().unwrap();
        let columns = self.read_columns(column_count).await?;
        let values = self.read_row_values(&columns).await?;
        Ok(QueryResults { columns, values })
      }
      None => Err(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "Unexpected EOF while parsing query result response",
      )),
    }
  }

  async fn read_columns(&mut self, column_count: usize) -> io::Result<Vec<Column>> {
    let mut columns = Vec::with_capacity(column_count);
    for _i in 0..column_count {
      let payload = self.read_payload().await?;
      match payload.first() {
        Some(0x00) => {
          self.parse_and_handle_server_ok(payload)?;
          break;
        }
        Some(_) => {
          let column = Column::parse(payload)?;
          columns.push(column);
        }
        None => {
          return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "Unexpected EOF while parsing query column response",
          ))
        }
      }
    }
    Ok(columns)
  }

  async fn read_row_values(&mut self, columns: &[Column]) -> io::Result<Vec<RowValue>> {
    let mut row_values = Vec::new();
    loop {
      let mut payload = self.read_payload().await?;

      match payload.first() {
        Some(0x00) | Some(0xFE) => {
          self.parse_and_handle_server_ok(payload)?;
          break;
        }
        Some(0xFF) => return Err(self.parse_and_handle_server_error(payload)),
        Some(_) => {
          for _i in 0..columns.len() {
            match payload.first() {
              Some(0xFB) => {
                payload.advance(1);
                row_values.push(None);
              }
              Some(_) => {
                let value = payload.mysql_get_lenc_string();
                row_values.push(Some(value));
              }
              None => {
                return Err(io::Error::new(
                  io::ErrorKind::UnexpectedEof,
                  "Unexpected EOF while parsing query row value",
                ))
              }
            }
          }
        }
        None => {
          return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "Unexpected EOF while parsing query row",
          ))
        }
      }
    }
    Ok(row_values)
  }

  fn handle_server_ok(&mut self, ok: ServerOk) {
    self.affected_rows = ok.affected_rows;
    self.last_inserted_id = ok.last_inserted_id;
    self.status_flags = ok.status_flags.unwrap_or(StatusFlags::empty());
    self.warnings = ok.warnings.unwrap_or(0);
  }

  async fn read_payload(&mut self) -> io::Result<Bytes> {
    let mut payload: Option<BytesMut> = None;
    loop {
      let (sequence_id, frame) = self.read_frame().await?;
      if self.sequence_id != sequence_id {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "Packet is out of sync"));
      }
      self.sequence_id = self.sequence_id.wrapping_add(1);

      let short_frame = frame.len() < MAX_PAYLOAD_LEN;
      match payload.as_mut() {
        // The common case: a payload small enough to fit a single frame.
        None if short_frame => {
          trace!("<< {:?}", PacketPreview(&frame));
          return Ok(frame.into());
        }
        None => {
          let mut b = BytesMut::with_capacity(frame.len() * 2);
          b.put(frame.as_slice());
          payload = Some(b);
        }
        Some(b) => {
          b.put(frame.as_slice());
          // A short frame terminates a multi-frame payload.
          if short_frame {
            let payload = payload.take().unwrap().freeze();
            trace!("<< {} byte multi-frame payload", payload.len());
            return Ok(payload);
          }
        }
      }
    }
  }

  fn scramble_password(&self, auth_plugin: &str, nonce: &[u8]) -> io::Result<Vec<u8>> {
    let password = self.options.password.as_ref().map(String::as_bytes).unwrap_or_default();

    if password.is_empty() {
      return Ok(Vec::new());
    }

    match auth_plugin {
      MYSQL_NATIVE_PASSWORD_PLUGIN_NAME => Ok(scramble::scramble_native(nonce, password).to_vec()),
      CACHING_SHA2_PASSWORD_PLUGIN_NAME => Ok(scramble::scramble_sha256(nonce, password).to_vec()),
      custom_auth_plugin => Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{} is not supported", custom_auth_plugin),
      )),
    }
  }

  async fn write_auth_switch_response(&mut self, auth_plugin: &str, nonce: &[u8]) -> io::Result<()> {
    let scrambled_data = self.scramble_password(auth_plugin, nonce)?;
    self.write_payload(scrambled_data.into()).await
  }

  async fn write_handshake_response(&mut self, auth_plugin: &str, nonce: &[u8]) -> io::Result<()> {
    let mut b = BytesMut::new();
    b.put_u32_le(self.capabilities.bits());
    b.put_u32_le(self.max_packet_size);
    b.put_u8(CharacterSet::UTF8MB4 as u8);
    b.put(&[0; 23][..]);
    b.put(self.options.user.as_bytes());
    b.put_u8(0);

    let scrambled_data = self.scramble_password(auth_plugin, nonce)?;
    b.mysql_put_lenc_uint(scrambled_data.len() as u64);
    b.put(scrambled_data.as_slice());

    if let Some(db_name) = self.options.database.as_ref() {
      b.put(db_name.as_bytes());
      b.put_u8(0);
    }

    b.put(auth_plugin.as_bytes());
    b.put_u8(0);

    self.write_payload(b.into()).await
  }

  async fn read_frame(&mut self) -> io::Result<(u8, Vec<u8>)> {
    let read_timeout = self.options.read_timeout;
    let stream = &mut self.stream;
    let read = async {
      let mut header = [0_u8; 4];
      stream.read_exact(&mut header).await?;

      let mut h = &header[..];
      let frame_len: usize = h.get_uint_le(3).try_into().unwrap();
      let sequence_id = h.get_u8();

      let mut frame = vec![0; frame_len];
      stream.read_exact(&mut frame).await?;
      io::Result::Ok((sequence_id, frame))
    };
    match read_timeout {
      Some(limit) => tokio::time::timeout(limit, read)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))?,
      None => read.await,
    }
  }

  /// The primary's current binlog head, from `SHOW MASTER STATUS`.
  pub async fn binlog_cursor(&mut self) -> io::Result<BinlogCursor> {
    let results = self.query("SHOW MASTER STATUS").await?;
    let row = results
      .rows()
      .and_then(|mut rows| rows.next())
      .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "binary logging is disabled on the server"))?;

    let log_file = row[0]
      .clone()
      .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing binlog file name"))?;
    let log_position = row[1]
      .as_deref()
      .and_then(|v| v.parse().ok())
      .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing binlog position"))?;
    Ok(BinlogCursor { log_file, log_position })
  }

  /// Turns this connection into a replication session and returns the stream
  /// of binlog events starting at `binlog_cursor`.
  pub async fn binlog_stream(
    mut self,
    replication_options: ReplicationOptions,
    binlog_cursor: impl Into<BinlogCursor>,
  ) -> io::Result<BinlogStream> {
    let binlog_cursor = binlog_cursor.into();
    self.prepare_replication(&replication_options).await?;
    self.register_as_replica(replication_options.server_id).await?;
    match replication_options.gtid_set.as_deref() {
      Some(gtid_set) if !gtid_set.is_empty() => {
        self
          .dump_binlog_gtid(replication_options.server_id, &binlog_cursor, gtid_set)
          .await?
      }
      _ => self.dump_binlog(replication_options.server_id, &binlog_cursor).await?,
    }
    Ok(BinlogStream { conn: self, checksum: None })
  }

  async fn prepare_replication(&mut self, replication_options: &ReplicationOptions) -> io::Result<()> {
    // Mirror whatever checksum algorithm the primary uses; the
    // FormatDescription event tells us which one is live.
    self
      .query("SET @master_binlog_checksum = @@global.binlog_checksum")
      .await?;

    if let Some(period) = replication_options.heartbeat_period {
      self
        .query(format!("SET @master_heartbeat_period = {}", period.as_nanos()))
        .await?;
    }

    Ok(())
  }

  async fn register_as_replica(&mut self, server_id: u32) -> io::Result<()> {
    let hostname = b"rowhook";
    let user = b"";
    let password = b"";
    let port = 0_u16;

    let payload_len = 4 + 1 + hostname.len() + 1 + user.len() + 1 + password.len() + 2 + 4 + 4;

    let mut b = BytesMut::with_capacity(payload_len);
    b.put_u32_le(server_id);
    b.put_u8(hostname.len() as u8);
    b.put(&hostname[..]);
    b.put_u8(user.len() as u8);
    b.put(&user[..]);
    b.put_u8(password.len() as u8);
    b.put(&password[..]);
    b.put_u16_le(port);
    b.put_u32(0); // replication rank, ignored.
    b.put_u32(0); // master id, usually 0.

    self.write_command(Command::COM_REGISTER_SLAVE, &b[..]).await?;
    self.read_generic_response().await
  }

  async fn dump_binlog(&mut self, server_id: u32, binlog_cursor: &BinlogCursor) -> io::Result<()> {
    let file = binlog_cursor.log_file.as_bytes();

    let mut b = BytesMut::with_capacity(4 + 2 + 4 + file.len());
    b.put_u32_le(binlog_cursor.log_position);
    b.put_u16_le(BinlogDumpFlags::empty().bits());
    b.put_u32_le(server_id);
    b.put(file);

    self.write_command(Command::COM_BINLOG_DUMP, &b[..]).await
  }

  async fn dump_binlog_gtid(
    &mut self,
    server_id: u32,
    binlog_cursor: &BinlogCursor,
    gtid_set: &str,
  ) -> io::Result<()> {
    let file = binlog_cursor.log_file.as_bytes();
    let encoded_gtid_set = encode_gtid_set(gtid_set)?;

    let mut b = BytesMut::new();
    b.put_u16_le(0); // flags
    b.put_u32_le(server_id);
    b.put_u32_le(file.len() as u32);
    b.put(file);
    b.put_u64_le(binlog_cursor.log_position.into());
    b.put_u32_le(encoded_gtid_set.len() as u32);
    b.put(encoded_gtid_set.as_slice());

    self.write_command(Command::COM_BINLOG_DUMP_GTID, &b[..]).await
  }

  async fn read_binlog_event_packet(
    &mut self,
    checksum: Option<BinlogChecksumAlg>,
  ) -> io::Result<(BinlogEventHeader, BinlogEvent)> {
    let payload = self.read_payload().await?;

    match payload.first() {
      Some(0x00) => BinlogEventPacket::parse(payload, checksum),
      Some(0xFF) => Err(self.parse_and_handle_server_error(payload)),
      Some(0xFE) => Err(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "binlog stream ended by the server",
      )),
      Some(_) => Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "Invalid data while parsing binlog event response",
      )),
      None => Err(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "Unexpected EOF while parsing binlog event response",
      )),
    }
  }

  fn parse_and_handle_server_ok(&mut self, payload: Bytes) -> io::Result<()> {
    ServerOk::parse(payload, self.capabilities).map(|ok| self.handle_server_ok(ok))
  }

  fn parse_and_handle_server_error(&mut self, payload: Bytes) -> io::Error {
    match ServerError::parse(payload, self.capabilities) {
      Ok(err) => self.handle_server_error(err),
      Err(err) => err,
    }
  }
}

// Defines the default capabilities our client supports.
fn default_client_capabilities(opts: &ConnectionOptions) -> CapabilityFlags {
  let mut capabilities = CapabilityFlags::CLIENT_PROTOCOL_41
    | CapabilityFlags::CLIENT_LONG_PASSWORD
    | CapabilityFlags::CLIENT_PLUGIN_AUTH
    | CapabilityFlags::CLIENT_LONG_FLAG
    | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
    | CapabilityFlags::CLIENT_RESERVED2
    | CapabilityFlags::CLIENT_DEPRECATE_EOF;

  if opts.database.as_ref().filter(|v| !v.is_empty()).is_some() {
    capabilities.insert(CapabilityFlags::CLIENT_CONNECT_WITH_DB);
  }

  capabilities
}

#[derive(Debug)]
pub struct Handshake {
  capabilities: CapabilityFlags,
  protocol_version: u8,
  scramble_1: Bytes,
  scramble_2: Option<Bytes>,
  auth_plugin: String,
  character_set: Option<CharacterSet>,
  status_flags: StatusFlags,
}

impl Handshake {
  fn parse(mut b: Bytes) -> io::Result<Self> {
    // https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_connection_phase_packets_protocol_handshake.html
    let protocol_version = b.get_u8();
    let _server_version = b.mysql_get_null_terminated_string();
    let _connection_id = b.get_u32_le();
    let scramble_1 = b.split_to(8);
    b.advance(1);
    let capabilities_1 = b.get_u16_le();
    let character_set = CharacterSet::try_from(b.get_u8()).ok();
    let status_flags = StatusFlags::from_bits_truncate(b.get_u16_le());
    let capabilities_2 = b.get_u16_le();

    let capabilities = CapabilityFlags::from_bits_truncate(capabilities_1 as u32 | ((capabilities_2 as u32) << 16));

    if !capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
      return Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "CLIENT_PLUGIN_AUTH flag is not set",
      ));
    }

    let scramble_len: i16 = b.get_u8().into();
    b.advance(10);

    let scramble_2_len = max(12, scramble_len - 9).try_into().unwrap();
    let scramble_2 = Some(b.split_to(scramble_2_len));
    b.advance(1);

    let auth_plugin = b.mysql_get_null_terminated_string();

    Ok(Self {
      capabilities,
      protocol_version,
      scramble_1,
      scramble_2,
      auth_plugin,
      status_flags,
      character_set,
    })
  }

  fn nonce(&self) -> Bytes {
    let mut out = BytesMut::new();
    out.extend_from_slice(self.scramble_1.chunk());

    if let Some(scramble_2) = self.scramble_2.as_ref().map(Bytes::chunk) {
      out.extend_from_slice(scramble_2);
    }

    out.freeze()
  }
}

// https://dev.mysql.com/doc/internals/en/packet-OK_Packet.html
#[derive(Debug)]
struct ServerOk {
  affected_rows: u64,
  last_inserted_id: u64,
  status_flags: Option<StatusFlags>,
  warnings: Option<u16>,
  info: String,
  session_state_changes: Option<String>,
}

impl ServerOk {
  fn parse(mut b: Bytes, capability_flags: CapabilityFlags) -> io::Result<Self> {
    let _header = b.get_u8();
    let affected_rows = b.mysql_get_lenc_uint();
    let last_inserted_id = b.mysql_get_lenc_uint();

    let mut status_flags = None;
    let mut warnings = None;
    if capability_flags.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
      status_flags = Some(StatusFlags::from_bits_truncate(b.get_u16_le()));
      warnings = Some(b.get_u16_le());
    } else if capability_flags.contains(CapabilityFlags::CLIENT_TRANSACTIONS) {
      status_flags = Some(StatusFlags::from_bits_truncate(b.get_u16_le()));
    }

    let (info, session_state_changes) = if capability_flags.contains(CapabilityFlags::CLIENT_SESSION_TRACK) {
      let info = b.mysql_get_lenc_string();

      let has_session_state_changes = status_flags
        .map(|f| f.contains(StatusFlags::SERVER_SESSION_STATE_CHANGED))
        .unwrap_or(false);

      let mut session_state_changes = None;
      if has_session_state_changes {
        session_state_changes = Some(b.mysql_get_lenc_string())
      }

      (info, session_state_changes)
    } else {
      let info = b.mysql_get_eof_string();
      (info, None)
    };

    Ok(Self {
      affected_rows,
      last_inserted_id,
      status_flags,
      warnings,
      info,
      session_state_changes,
    })
  }
}

// https://dev.mysql.com/doc/internals/en/packet-ERR_Packet.html
#[derive(Debug)]
pub struct ServerError {
  error_code: u16,
  state_marker: Option<String>,
  state: Option<String>,
  error_message: String,
}

impl ServerError {
  fn parse(mut b: Bytes, capability_flags: CapabilityFlags) -> io::Result<Self> {
    let _header = b.get_u8();
    let error_code = b.get_u16_le();

    let mut state_marker = None;
    let mut state = None;

    if capability_flags.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
      state_marker = Some(b.mysql_get_fixed_length_string(1));
      state = Some(b.mysql_get_fixed_length_string(5));
    }

    let error_message = b.mysql_get_eof_string();
    Ok(Self {
      error_code,
      state_marker,
      state,
      error_message,
    })
  }
}

/// A `(file, offset)` location in the primary's binlog.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct BinlogCursor {
  pub log_file: String,
  pub log_position: u32,
}

impl fmt::Display for BinlogCursor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.log_file, self.log_position)
  }
}

impl FromStr for BinlogCursor {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (log_file, log_position) = s
      .split_once('/')
      .ok_or_else(|| "Failed to parse binlog cursor. Expected format is <prefix>.<file>/<position>".to_string())?;
    let log_file = log_file.to_string();
    let log_position = log_position
      .parse()
      .map_err(|_| "Failed to parse binlog cursor position. Expected format is u32.".to_string())?;
    Ok(Self { log_file, log_position })
  }
}

// Binary form of a GTID set for COM_BINLOG_DUMP_GTID: sid count, then per
// sid the uuid bytes and its interval list.
fn encode_gtid_set(gtid_set: &str) -> io::Result<Vec<u8>> {
  let mut sids = Vec::new();
  for part in gtid_set.split(',').map(str::trim).filter(|p| !p.is_empty()) {
    let mut chunks = part.split(':');
    let uuid = chunks
      .next()
      .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty gtid"))?;
    let uuid_bytes = parse_uuid(uuid)?;

    let mut intervals = Vec::new();
    for interval in chunks {
      let (start, stop) = match interval.split_once('-') {
        Some((start, stop)) => (parse_gno(start)?, parse_gno(stop)?),
        None => {
          let v = parse_gno(interval)?;
          (v, v)
        }
      };
      // The wire format carries half-open intervals.
      intervals.push((start, stop + 1));
    }
    if intervals.is_empty() {
      return Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("gtid {} has no intervals", part),
      ));
    }
    sids.push((uuid_bytes, intervals));
  }

  let mut b = BytesMut::new();
  b.put_u64_le(sids.len() as u64);
  for (uuid, intervals) in sids {
    b.put(&uuid[..]);
    b.put_u64_le(intervals.len() as u64);
    for (start, stop) in intervals {
      b.put_u64_le(start);
      b.put_u64_le(stop);
    }
  }
  Ok(b.to_vec())
}

fn parse_gno(s: &str) -> io::Result<u64> {
  s.trim()
    .parse()
    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid gtid interval bound {}", s)))
}

fn parse_uuid(s: &str) -> io::Result<[u8; 16]> {
  let hex: String = s.chars().filter(|c| *c != '-').collect();
  if hex.len() != 32 {
    return Err(io::Error::new(
      io::ErrorKind::InvalidInput,
      format!("invalid gtid source id {}", s),
    ));
  }
  let mut out = [0_u8; 16];
  for (i, byte) in out.iter_mut().enumerate() {
    *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
      .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid gtid source id {}", s)))?;
  }
  Ok(out)
}

/// A replication session. Yields decoded binlog events in binlog order and
/// tracks the checksum algorithm advertised by the FormatDescription event.
#[derive(Debug)]
pub struct BinlogStream {
  conn: Connection,
  checksum: Option<BinlogChecksumAlg>,
}

impl BinlogStream {
  pub async fn close(mut self) -> io::Result<()> {
    // Force shutdown the underlying socket; the stream is no longer in
    // duplex command mode so COM_QUIT cannot be spoken.
    self.conn.stream.shutdown().await
  }

  pub async fn recv(&mut self) -> io::Result<(BinlogEventHeader, BinlogEvent)> {
    let checksum = match self.checksum {
      Some(BinlogChecksumAlg::Crc32) => Some(BinlogChecksumAlg::Crc32),
      _ => None,
    };
    let (header, event) = self.conn.read_binlog_event_packet(checksum).await?;
    if let BinlogEvent::Format(format) = &event {
      self.checksum = format.checksum_algorithm;
    }
    Ok((header, event))
  }
}
