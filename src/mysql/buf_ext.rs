use std::io;

use bytes::{Buf, BufMut};

fn truncated(what: &str) -> io::Error {
  io::Error::new(io::ErrorKind::UnexpectedEof, format!("truncated {}", what))
}

pub trait BufExt: Buf {
  fn mysql_get_eof_string(&mut self) -> String {
    self.mysql_get_fixed_length_string(self.remaining())
  }

  // Returns a utf-8 encoded string terminated by \0.
  fn mysql_get_null_terminated_string(&mut self) -> String {
    match self.chunk().iter().position(|x| *x == 0x00) {
      Some(len) => {
        let s = self.mysql_get_fixed_length_string(len);
        self.advance(1);
        s
      }
      None => self.mysql_get_eof_string(),
    }
  }

  // Returns a utf-8 encoded string of length N, where N are in bytes.
  fn mysql_get_fixed_length_string(&mut self, len: usize) -> String {
    let mut bytes = vec![0; len];
    self.copy_to_slice(bytes.as_mut_slice());
    String::from_utf8_lossy(&bytes).into_owned()
  }

  // Returns a utf-8 encoded string of variable length. See `mysql_get_lenc_uint`.
  fn mysql_get_lenc_string(&mut self) -> String {
    let len = self.mysql_get_lenc_uint();
    let len = len.try_into().unwrap();
    self.mysql_get_fixed_length_string(len)
  }

  fn mysql_get_lenc_uint(&mut self) -> u64 {
    match self.get_u8() {
      0xfc => self.get_uint_le(2),
      0xfd => self.get_uint_le(3),
      0xfe => self.get_uint_le(8),
      0xff => panic!("invalid length-encoded integer value"),
      x => x.into(),
    }
  }

  /// Checked variant used by the binlog parser, where a truncated event must
  /// surface as an error instead of a panic.
  fn mysql_try_get_lenc_uint(&mut self) -> io::Result<u64> {
    if self.remaining() < 1 {
      return Err(truncated("length-encoded integer"));
    }
    let prefix = match self.get_u8() {
      0xfc => 2,
      0xfd => 3,
      0xfe => 8,
      0xff => {
        return Err(io::Error::new(
          io::ErrorKind::InvalidData,
          "invalid length-encoded integer value",
        ))
      }
      x => return Ok(x.into()),
    };
    if self.remaining() < prefix {
      return Err(truncated("length-encoded integer"));
    }
    Ok(self.get_uint_le(prefix))
  }

  fn mysql_try_get_fixed_length_bytes(&mut self, len: usize, what: &str) -> io::Result<Vec<u8>> {
    if self.remaining() < len {
      return Err(truncated(what));
    }
    let mut bytes = vec![0; len];
    self.copy_to_slice(bytes.as_mut_slice());
    Ok(bytes)
  }

  fn mysql_try_get_fixed_length_string(&mut self, len: usize, what: &str) -> io::Result<String> {
    self
      .mysql_try_get_fixed_length_bytes(len, what)
      .map(|b| String::from_utf8_lossy(&b).into_owned())
  }

  fn mysql_try_get_uint_le(&mut self, len: usize, what: &str) -> io::Result<u64> {
    if self.remaining() < len {
      return Err(truncated(what));
    }
    Ok(self.get_uint_le(len))
  }

  fn mysql_try_get_uint_be(&mut self, len: usize, what: &str) -> io::Result<u64> {
    if self.remaining() < len {
      return Err(truncated(what));
    }
    Ok(self.get_uint(len))
  }
}

pub trait BufMutExt: BufMut {
  fn mysql_put_lenc_uint(&mut self, v: u64) {
    if v < 251 {
      self.put_u8(v as u8);
      return;
    }

    if v < 2_u64.pow(16) {
      self.put_u8(0xFC);
      self.put_uint_le(v, 2);
      return;
    }

    if v < 2_u64.pow(24) {
      self.put_u8(0xFD);
      self.put_uint_le(v, 3);
      return;
    }

    self.put_u8(0xFE);
    self.put_uint_le(v, 8);
  }
}

// Blanket implementations
impl<T> BufExt for T where T: Buf {}
impl<T> BufMutExt for T where T: BufMut {}
