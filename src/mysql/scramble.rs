use sha1::{Digest, Sha1};
use sha2::Sha256;

// https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_connection_phase_authentication_methods_native_password_authentication.html
//
// SHA1(password) XOR SHA1(nonce + SHA1(SHA1(password)))
pub fn scramble_native(nonce: &[u8], password: &[u8]) -> [u8; 20] {
  let hashed = Sha1::digest(password);
  let double_hashed = Sha1::digest(hashed);

  let mut mask = Sha1::new();
  mask.update(nonce);
  mask.update(double_hashed);

  let mut out: [u8; 20] = hashed.into();
  for (b, m) in out.iter_mut().zip(mask.finalize()) {
    *b ^= m;
  }
  out
}

// https://dev.mysql.com/doc/dev/mysql-server/latest/page_caching_sha2_authentication_exchanges.html
//
// SHA256(password) XOR SHA256(SHA256(SHA256(password)) + nonce)
pub fn scramble_sha256(nonce: &[u8], password: &[u8]) -> [u8; 32] {
  let hashed = Sha256::digest(password);
  let double_hashed = Sha256::digest(hashed);

  let mut mask = Sha256::new();
  mask.update(double_hashed);
  mask.update(nonce);

  let mut out: [u8; 32] = hashed.into();
  for (b, m) in out.iter_mut().zip(mask.finalize()) {
    *b ^= m;
  }
  out
}

#[cfg(test)]
mod test {
  use super::{scramble_native, scramble_sha256};

  #[test]
  fn native_scramble_is_deterministic() {
    let nonce = b"abcdefghijklmnopqrst";
    let a = scramble_native(nonce, b"password");
    let b = scramble_native(nonce, b"password");
    assert_eq!(a, b);
    assert_ne!(a, scramble_native(b"tsrqponmlkjihgfedcba", b"password"));
    assert_ne!(a, scramble_native(nonce, b"other"));
  }

  #[test]
  fn sha256_scramble_is_deterministic() {
    let nonce = b"abcdefghijklmnopqrst";
    let a = scramble_sha256(nonce, b"password");
    assert_eq!(a, scramble_sha256(nonce, b"password"));
    assert_ne!(a, scramble_sha256(nonce, b"other"));
  }
}
