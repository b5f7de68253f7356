use bitflags::bitflags;

pub const MYSQL_NATIVE_PASSWORD_PLUGIN_NAME: &str = "mysql_native_password";
pub const CACHING_SHA2_PASSWORD_PLUGIN_NAME: &str = "caching_sha2_password";
pub const MAX_PAYLOAD_LEN: usize = 16777215;

/// Length of the binlog event header that follows the ok byte: timestamp(4),
/// type(1), server_id(4), event_size(4), log_pos(4), flags(2).
pub const BINLOG_EVENT_HEADER_LEN: usize = 19;

// https://dev.mysql.com/doc/dev/mysql-server/latest/group__group__cs__column__definition__flags.html
bitflags! {
  #[derive(Debug, Clone, Copy)]
  pub struct ColumnFlags: u16 {
    const NOT_NULL = 0x0001;
    const PRIMARY_KEY = 0x0002;
    const UNIQUE_KEY = 0x0004;
    const MULTIPLE_KEY = 0x0008;
    const BLOB = 0x0010;
    const UNSIGNED = 0x0020;
    const ZEROFILL = 0x0040;
    const BINARY = 0x0080;
    const ENUM = 0x0100;
    const AUTO_INCREMENT = 0x0200;
    const TIMESTAMP = 0x0400;
    const SET = 0x0800;
    const NO_DEFAULT_VALUE = 0x1000;
    const ON_UPDATE_NOW = 0x2000;
  }
}

bitflags! {
  #[derive(Debug, Clone, Copy)]
  pub struct BinlogDumpFlags: u16 {
    const NON_BLOCK = 0x0001;
  }
}

// https://dev.mysql.com/doc/dev/mysql-server/latest/group__group__cs__capabilities__flags.html
bitflags! {
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct CapabilityFlags: u32 {
    const CLIENT_LONG_PASSWORD = 0x00000001;
    const CLIENT_FOUND_ROWS = 0x00000002;
    const CLIENT_LONG_FLAG = 0x00000004;
    const CLIENT_CONNECT_WITH_DB = 0x00000008;
    const CLIENT_NO_SCHEMA = 0x00000010;
    const CLIENT_COMPRESS = 0x00000020;
    const CLIENT_ODBC = 0x00000040;
    const CLIENT_LOCAL_FILES = 0x00000080;
    const CLIENT_IGNORE_SPACE = 0x00000100;
    const CLIENT_PROTOCOL_41 = 0x00000200;
    const CLIENT_INTERACTIVE = 0x00000400;
    const CLIENT_SSL = 0x00000800;
    const CLIENT_IGNORE_SIGPIPE = 0x00001000;
    const CLIENT_TRANSACTIONS = 0x00002000;
    const CLIENT_RESERVED = 0x00004000;
    const CLIENT_RESERVED2 = 0x00008000;
    const CLIENT_MULTI_STATEMENTS = 0x00010000;
    const CLIENT_MULTI_RESULTS = 0x00020000;
    const CLIENT_PS_MULTI_RESULTS = 0x00040000;
    const CLIENT_PLUGIN_AUTH = 0x00080000;
    const CLIENT_CONNECT_ATTRS = 0x00100000;
    const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA = 0x00200000;
    const CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS = 0x00400000;
    const CLIENT_SESSION_TRACK = 0x00800000;
    const CLIENT_DEPRECATE_EOF = 0x01000000;
    const CLIENT_PROGRESS_OBSOLETE = 0x20000000;
    const CLIENT_SSL_VERIFY_SERVER_CERT = 0x40000000;
    const CLIENT_REMEMBER_OPTIONS = 0x80000000;
  }
}

bitflags! {
  #[derive(Debug, Clone, Copy)]
  pub struct StatusFlags: u16 {
    const SERVER_STATUS_IN_TRANS = 0x0001;
    const SERVER_STATUS_AUTOCOMMIT = 0x0002;
    const SERVER_MORE_RESULTS_EXISTS = 0x0008;
    const SERVER_STATUS_NO_GOOD_INDEX_USED = 0x0010;
    const SERVER_STATUS_NO_INDEX_USED = 0x0020;
    const SERVER_STATUS_CURSOR_EXISTS = 0x0040;
    const SERVER_STATUS_LAST_ROW_SENT = 0x0080;
    const SERVER_STATUS_DB_DROPPED = 0x0100;
    const SERVER_STATUS_NO_BACKSLASH_ESCAPES = 0x0200;
    const SERVER_STATUS_METADATA_CHANGED = 0x0400;
    const SERVER_QUERY_WAS_SLOW = 0x0800;
    const SERVER_PS_OUT_PARAMS = 0x1000;
    const SERVER_STATUS_IN_TRANS_READONLY = 0x2000;
    const SERVER_SESSION_STATE_CHANGED = 0x4000;
  }
}

// https://dev.mysql.com/doc/internals/en/character-set.html
#[allow(non_camel_case_types)]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacterSet {
  LATIN1 = 0x08_u8,
  ASCII = 0x0B_u8,
  UTF8 = 0x21_u8,
  BINARY = 0x3F_u8,
  UTF8MB4 = 0xFF_u8,
}

impl TryFrom<u8> for CharacterSet {
  type Error = u8;

  fn try_from(v: u8) -> Result<Self, Self::Error> {
    match v {
      0x08_u8 => Ok(CharacterSet::LATIN1),
      0x0B_u8 => Ok(CharacterSet::ASCII),
      0x21_u8 => Ok(CharacterSet::UTF8),
      0x3F_u8 => Ok(CharacterSet::BINARY),
      0xFF_u8 => Ok(CharacterSet::UTF8MB4),
      unsupported => Err(unsupported),
    }
  }
}

#[allow(non_camel_case_types)]
#[derive(Clone, Eq, PartialEq, Copy, Debug)]
#[repr(u8)]
pub enum Command {
  COM_SLEEP = 0x00_u8,
  COM_QUIT = 0x01_u8,
  COM_INIT_DB = 0x02_u8,
  COM_QUERY = 0x03_u8,
  COM_FIELD_LIST = 0x04_u8,
  COM_PING = 0x0e_u8,
  COM_BINLOG_DUMP = 0x12_u8,
  COM_REGISTER_SLAVE = 0x15_u8,
  COM_BINLOG_DUMP_GTID = 0x1e_u8,
  COM_RESET_CONNECTION = 0x1f_u8,
}

/// Type of a MySQL column, as carried in column definitions and TableMap
/// events.
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum ColumnType {
  MYSQL_TYPE_DECIMAL = 0x00_u8,
  MYSQL_TYPE_TINY = 0x01_u8,
  MYSQL_TYPE_SHORT = 0x02_u8,
  MYSQL_TYPE_LONG = 0x03_u8,
  MYSQL_TYPE_FLOAT = 0x04_u8,
  MYSQL_TYPE_DOUBLE = 0x05_u8,
  MYSQL_TYPE_NULL = 0x06_u8,
  MYSQL_TYPE_TIMESTAMP = 0x07_u8,
  MYSQL_TYPE_LONGLONG = 0x08_u8,
  MYSQL_TYPE_INT24 = 0x09_u8,
  MYSQL_TYPE_DATE = 0x0a_u8,
  MYSQL_TYPE_TIME = 0x0b_u8,
  MYSQL_TYPE_DATETIME = 0x0c_u8,
  MYSQL_TYPE_YEAR = 0x0d_u8,
  MYSQL_TYPE_VARCHAR = 0x0f_u8,
  MYSQL_TYPE_BIT = 0x10_u8,
  MYSQL_TYPE_TIMESTAMP2 = 0x11_u8,
  MYSQL_TYPE_DATETIME2 = 0x12_u8,
  MYSQL_TYPE_TIME2 = 0x13_u8,
  MYSQL_TYPE_JSON = 0xf5_u8,
  MYSQL_TYPE_NEWDECIMAL = 0xf6_u8,
  MYSQL_TYPE_ENUM = 0xf7_u8,
  MYSQL_TYPE_SET = 0xf8_u8,
  MYSQL_TYPE_TINY_BLOB = 0xf9_u8,
  MYSQL_TYPE_MEDIUM_BLOB = 0xfa_u8,
  MYSQL_TYPE_LONG_BLOB = 0xfb_u8,
  MYSQL_TYPE_BLOB = 0xfc_u8,
  MYSQL_TYPE_VAR_STRING = 0xfd_u8,
  MYSQL_TYPE_STRING = 0xfe_u8,
  MYSQL_TYPE_GEOMETRY = 0xff_u8,
}

impl ColumnType {
  /// Human readable SQL-ish tag used in decoded events and persisted table
  /// metadata.
  pub fn sql_name(&self) -> &'static str {
    match self {
      ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => "decimal",
      ColumnType::MYSQL_TYPE_TINY => "tinyint",
      ColumnType::MYSQL_TYPE_SHORT => "smallint",
      ColumnType::MYSQL_TYPE_LONG => "int",
      ColumnType::MYSQL_TYPE_FLOAT => "float",
      ColumnType::MYSQL_TYPE_DOUBLE => "double",
      ColumnType::MYSQL_TYPE_NULL => "null",
      ColumnType::MYSQL_TYPE_TIMESTAMP | ColumnType::MYSQL_TYPE_TIMESTAMP2 => "timestamp",
      ColumnType::MYSQL_TYPE_LONGLONG => "bigint",
      ColumnType::MYSQL_TYPE_INT24 => "mediumint",
      ColumnType::MYSQL_TYPE_DATE => "date",
      ColumnType::MYSQL_TYPE_TIME | ColumnType::MYSQL_TYPE_TIME2 => "time",
      ColumnType::MYSQL_TYPE_DATETIME | ColumnType::MYSQL_TYPE_DATETIME2 => "datetime",
      ColumnType::MYSQL_TYPE_YEAR => "year",
      ColumnType::MYSQL_TYPE_VARCHAR | ColumnType::MYSQL_TYPE_VAR_STRING => "varchar",
      ColumnType::MYSQL_TYPE_BIT => "bit",
      ColumnType::MYSQL_TYPE_JSON => "json",
      ColumnType::MYSQL_TYPE_ENUM => "enum",
      ColumnType::MYSQL_TYPE_SET => "set",
      ColumnType::MYSQL_TYPE_TINY_BLOB
      | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
      | ColumnType::MYSQL_TYPE_LONG_BLOB
      | ColumnType::MYSQL_TYPE_BLOB => "blob",
      ColumnType::MYSQL_TYPE_STRING => "char",
      ColumnType::MYSQL_TYPE_GEOMETRY => "geometry",
    }
  }
}

impl TryFrom<u8> for ColumnType {
  type Error = u8;

  fn try_from(v: u8) -> Result<Self, Self::Error> {
    match v {
      0x00_u8 => Ok(ColumnType::MYSQL_TYPE_DECIMAL),
      0x01_u8 => Ok(ColumnType::MYSQL_TYPE_TINY),
      0x02_u8 => Ok(ColumnType::MYSQL_TYPE_SHORT),
      0x03_u8 => Ok(ColumnType::MYSQL_TYPE_LONG),
      0x04_u8 => Ok(ColumnType::MYSQL_TYPE_FLOAT),
      0x05_u8 => Ok(ColumnType::MYSQL_TYPE_DOUBLE),
      0x06_u8 => Ok(ColumnType::MYSQL_TYPE_NULL),
      0x07_u8 => Ok(ColumnType::MYSQL_TYPE_TIMESTAMP),
      0x08_u8 => Ok(ColumnType::MYSQL_TYPE_LONGLONG),
      0x09_u8 => Ok(ColumnType::MYSQL_TYPE_INT24),
      0x0a_u8 => Ok(ColumnType::MYSQL_TYPE_DATE),
      0x0b_u8 => Ok(ColumnType::MYSQL_TYPE_TIME),
      0x0c_u8 => Ok(ColumnType::MYSQL_TYPE_DATETIME),
      0x0d_u8 => Ok(ColumnType::MYSQL_TYPE_YEAR),
      0x0f_u8 => Ok(ColumnType::MYSQL_TYPE_VARCHAR),
      0x10_u8 => Ok(ColumnType::MYSQL_TYPE_BIT),
      0x11_u8 => Ok(ColumnType::MYSQL_TYPE_TIMESTAMP2),
      0x12_u8 => Ok(ColumnType::MYSQL_TYPE_DATETIME2),
      0x13_u8 => Ok(ColumnType::MYSQL_TYPE_TIME2),
      0xf5_u8 => Ok(ColumnType::MYSQL_TYPE_JSON),
      0xf6_u8 => Ok(ColumnType::MYSQL_TYPE_NEWDECIMAL),
      0xf7_u8 => Ok(ColumnType::MYSQL_TYPE_ENUM),
      0xf8_u8 => Ok(ColumnType::MYSQL_TYPE_SET),
      0xf9_u8 => Ok(ColumnType::MYSQL_TYPE_TINY_BLOB),
      0xfa_u8 => Ok(ColumnType::MYSQL_TYPE_MEDIUM_BLOB),
      0xfb_u8 => Ok(ColumnType::MYSQL_TYPE_LONG_BLOB),
      0xfc_u8 => Ok(ColumnType::MYSQL_TYPE_BLOB),
      0xfd_u8 => Ok(ColumnType::MYSQL_TYPE_VAR_STRING),
      0xfe_u8 => Ok(ColumnType::MYSQL_TYPE_STRING),
      0xff_u8 => Ok(ColumnType::MYSQL_TYPE_GEOMETRY),
      unsupported => Err(unsupported),
    }
  }
}

#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum BinlogEventType {
  UNKNOWN_EVENT,
  START_EVENT_V3,
  QUERY_EVENT,
  STOP_EVENT,
  ROTATE_EVENT,
  INTVAR_EVENT,
  LOAD_EVENT,
  SLAVE_EVENT,
  CREATE_FILE_EVENT,
  APPEND_BLOCK_EVENT,
  EXEC_LOAD_EVENT,
  DELETE_FILE_EVENT,
  NEW_LOAD_EVENT,
  RAND_EVENT,
  USER_VAR_EVENT,
  FORMAT_DESCRIPTION_EVENT,
  XID_EVENT,
  BEGIN_LOAD_QUERY_EVENT,
  EXECUTE_LOAD_QUERY_EVENT,
  TABLE_MAP_EVENT,
  WRITE_ROWS_EVENTV0,
  UPDATE_ROWS_EVENTV0,
  DELETE_ROWS_EVENTV0,
  WRITE_ROWS_EVENTV1,
  UPDATE_ROWS_EVENTV1,
  DELETE_ROWS_EVENTV1,
  INCIDENT_EVENT,
  HEARTBEAT_EVENT,
  IGNORABLE_EVENT,
  ROWS_QUERY_EVENT,
  WRITE_ROWS_EVENTV2,
  UPDATE_ROWS_EVENTV2,
  DELETE_ROWS_EVENTV2,
  GTID_EVENT,
  ANONYMOUS_GTID_EVENT,
  PREVIOUS_GTIDS_EVENT,
}

impl TryFrom<u8> for BinlogEventType {
  type Error = u8;

  fn try_from(v: u8) -> Result<Self, Self::Error> {
    match v {
      0x00_u8 => Ok(BinlogEventType::UNKNOWN_EVENT),
      0x01_u8 => Ok(BinlogEventType::START_EVENT_V3),
      0x02_u8 => Ok(BinlogEventType::QUERY_EVENT),
      0x03_u8 => Ok(BinlogEventType::STOP_EVENT),
      0x04_u8 => Ok(BinlogEventType::ROTATE_EVENT),
      0x05_u8 => Ok(BinlogEventType::INTVAR_EVENT),
      0x06_u8 => Ok(BinlogEventType::LOAD_EVENT),
      0x07_u8 => Ok(BinlogEventType::SLAVE_EVENT),
      0x08_u8 => Ok(BinlogEventType::CREATE_FILE_EVENT),
      0x09_u8 => Ok(BinlogEventType::APPEND_BLOCK_EVENT),
      0x0a_u8 => Ok(BinlogEventType::EXEC_LOAD_EVENT),
      0x0b_u8 => Ok(BinlogEventType::DELETE_FILE_EVENT),
      0x0c_u8 => Ok(BinlogEventType::NEW_LOAD_EVENT),
      0x0d_u8 => Ok(BinlogEventType::RAND_EVENT),
      0x0e_u8 => Ok(BinlogEventType::USER_VAR_EVENT),
      0x0f_u8 => Ok(BinlogEventType::FORMAT_DESCRIPTION_EVENT),
      0x10_u8 => Ok(BinlogEventType::XID_EVENT),
      0x11_u8 => Ok(BinlogEventType::BEGIN_LOAD_QUERY_EVENT),
      0x12_u8 => Ok(BinlogEventType::EXECUTE_LOAD_QUERY_EVENT),
      0x13_u8 => Ok(BinlogEventType::TABLE_MAP_EVENT),
      0x14_u8 => Ok(BinlogEventType::WRITE_ROWS_EVENTV0),
      0x15_u8 => Ok(BinlogEventType::UPDATE_ROWS_EVENTV0),
      0x16_u8 => Ok(BinlogEventType::DELETE_ROWS_EVENTV0),
      0x17_u8 => Ok(BinlogEventType::WRITE_ROWS_EVENTV1),
      0x18_u8 => Ok(BinlogEventType::UPDATE_ROWS_EVENTV1),
      0x19_u8 => Ok(BinlogEventType::DELETE_ROWS_EVENTV1),
      0x1a_u8 => Ok(BinlogEventType::INCIDENT_EVENT),
      0x1b_u8 => Ok(BinlogEventType::HEARTBEAT_EVENT),
      0x1c_u8 => Ok(BinlogEventType::IGNORABLE_EVENT),
      0x1d_u8 => Ok(BinlogEventType::ROWS_QUERY_EVENT),
      0x1e_u8 => Ok(BinlogEventType::WRITE_ROWS_EVENTV2),
      0x1f_u8 => Ok(BinlogEventType::UPDATE_ROWS_EVENTV2),
      0x20_u8 => Ok(BinlogEventType::DELETE_ROWS_EVENTV2),
      0x21_u8 => Ok(BinlogEventType::GTID_EVENT),
      0x22_u8 => Ok(BinlogEventType::ANONYMOUS_GTID_EVENT),
      0x23_u8 => Ok(BinlogEventType::PREVIOUS_GTIDS_EVENT),
      unsupported => Err(unsupported),
    }
  }
}
