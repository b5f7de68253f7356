#![allow(dead_code)]
pub mod binlog;
mod buf_ext;
mod conn;
pub mod constants;
mod query;
mod scramble;

pub use conn::{BinlogCursor, BinlogStream, Connection, ConnectionOptions, ReplicationOptions};
pub use query::{Column, QueryResults, RowValue};
