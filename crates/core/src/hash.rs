//! Streaming content hashing.
//!
//! Every identifier in the project model is a 40-character lowercase hex
//! SHA-1 digest. The sink inserts no delimiters of its own; callers that
//! hash structured data encode their delimiters explicitly.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use sha1::{Digest, Sha1};

/// Length of a rendered digest in hex characters.
pub const DIGEST_LEN: usize = 40;

/// A streaming hash sink: `new -> append* -> finish`.
///
/// `append` consumes raw bytes; `finish` renders the digest as lowercase
/// hex. There are no error paths.
#[derive(Default)]
pub struct Hasher {
  inner: Sha1,
}

impl Hasher {
  pub fn new() -> Self {
    Self { inner: Sha1::new() }
  }

  /// Feed raw bytes into the digest.
  pub fn append(&mut self, data: impl AsRef<[u8]>) -> &mut Self {
    self.inner.update(data.as_ref());
    self
  }

  /// Finish the digest and return it as a 40-character lowercase hex string.
  pub fn finish(self) -> String {
    hex::encode(self.inner.finalize())
  }
}

/// Hash the contents of a file.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
  let file = File::open(path)?;
  let mut reader = BufReader::new(file);
  let mut hasher = Hasher::new();

  let mut buffer = [0u8; 8192];
  loop {
    let n = reader.read(&mut buffer)?;
    if n == 0 {
      break;
    }
    hasher.append(&buffer[..n]);
  }

  Ok(hasher.finish())
}

/// Hash a byte slice in one step.
pub fn hash_bytes(data: &[u8]) -> String {
  let mut hasher = Hasher::new();
  hasher.append(data);
  hasher.finish()
}

/// Check that a string has the shape of a rendered digest.
pub fn is_hash(s: &str) -> bool {
  s.len() == DIGEST_LEN && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}
