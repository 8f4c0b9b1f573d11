//! URL-addressed remote I/O.
//!
//! One uniform operation set over `{scheme, host, path}` URLs:
//! `fetch`, `push`, `mkdir`, `exists`. Local filesystem and HTTP(S) are
//! handled in-process; rsync and scp delegate to the external tools the
//! remote side speaks. Downloads land in a temp file first and are renamed
//! into place, so a partial failure never leaves a visible target.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::process::Command;

use thiserror::Error;
use tracing::debug;
use url::Url;

use e2build_core::location::remove_trailing_slashes;

#[derive(Debug, Error)]
pub enum TransportError {
  #[error("{url}: remote unreachable: {detail}")]
  Unreachable { url: String, detail: String },

  #[error("{url}: not authorized")]
  Unauthorized { url: String },

  #[error("{url}: not found")]
  NotFound { url: String },

  #[error("{url}: i/o error")]
  Io {
    url: String,
    #[source]
    source: io::Error,
  },

  #[error("{url}: unsupported scheme {scheme:?}")]
  UnsupportedScheme { url: String, scheme: String },

  #[error("transport for scheme {scheme:?} is read-only")]
  ReadOnly { scheme: String },

  #[error("invalid url {url:?}")]
  InvalidUrl {
    url: String,
    #[source]
    source: url::ParseError,
  },
}

/// Compose a server base URL and a relative location into one URL.
pub fn join_url(base: &str, location: &str) -> Result<Url, TransportError> {
  let joined = format!("{}/{}", remove_trailing_slashes(base), location);
  Url::parse(&joined).map_err(|source| TransportError::InvalidUrl { url: joined, source })
}

/// Uniform operations over remote locations.
///
/// The cache talks to remotes exclusively through this trait, so tests can
/// substitute an instrumented implementation.
pub trait Transport: Send + Sync {
  fn fetch(&self, url: &Url, local: &Path) -> Result<(), TransportError>;
  fn push(&self, local: &Path, url: &Url) -> Result<(), TransportError>;
  fn mkdir(&self, url: &Url) -> Result<(), TransportError>;
  fn exists(&self, url: &Url) -> Result<bool, TransportError>;
}

/// The production transport, dispatching on the URL scheme.
pub struct StdTransport {
  ssh_command: String,
}

impl StdTransport {
  pub fn new(ssh_command: Option<String>) -> Self {
    Self {
      ssh_command: ssh_command.unwrap_or_else(|| "ssh".to_string()),
    }
  }
}

impl Default for StdTransport {
  fn default() -> Self {
    Self::new(None)
  }
}

fn io_err(url: &Url, source: io::Error) -> TransportError {
  TransportError::Io {
    url: url.to_string(),
    source,
  }
}

fn unsupported(url: &Url) -> TransportError {
  TransportError::UnsupportedScheme {
    url: url.to_string(),
    scheme: url.scheme().to_string(),
  }
}

/// `user@host` target for ssh-style tools.
fn ssh_target(url: &Url) -> Result<String, TransportError> {
  let host = url.host_str().ok_or_else(|| TransportError::Unreachable {
    url: url.to_string(),
    detail: "url has no host".to_string(),
  })?;
  if url.username().is_empty() {
    Ok(host.to_string())
  } else {
    Ok(format!("{}@{}", url.username(), host))
  }
}

fn file_path(url: &Url) -> Result<std::path::PathBuf, TransportError> {
  url.to_file_path().map_err(|_| TransportError::Unreachable {
    url: url.to_string(),
    detail: "not a usable file path".to_string(),
  })
}

/// Write `bytes` to `target` atomically via a temp file in the same
/// directory.
fn write_atomic(target: &Path, bytes: &[u8], url: &Url) -> Result<(), TransportError> {
  let parent = target.parent().ok_or_else(|| TransportError::Unreachable {
    url: url.to_string(),
    detail: "target path has no parent directory".to_string(),
  })?;
  fs::create_dir_all(parent).map_err(|e| io_err(url, e))?;

  let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| io_err(url, e))?;
  tmp.write_all(bytes).map_err(|e| io_err(url, e))?;
  tmp.persist(target).map_err(|e| io_err(url, e.error))?;
  Ok(())
}

/// Copy `src` to `target` atomically.
fn copy_atomic(src: &Path, target: &Path, url: &Url) -> Result<(), TransportError> {
  let bytes = fs::read(src).map_err(|e| io_err(url, e))?;
  write_atomic(target, &bytes, url)
}

/// Run an external transport tool, mapping failure onto the error taxonomy.
fn run_tool(mut cmd: Command, url: &Url) -> Result<(), TransportError> {
  debug!(tool = ?cmd.get_program(), url = %url, "invoking transport tool");
  let output = cmd.output().map_err(|e| io_err(url, e))?;
  if output.status.success() {
    Ok(())
  } else {
    Err(TransportError::Unreachable {
      url: url.to_string(),
      detail: format!("{:?} exited with {}", cmd.get_program(), output.status),
    })
  }
}

impl Transport for StdTransport {
  fn fetch(&self, url: &Url, local: &Path) -> Result<(), TransportError> {
    debug!(url = %url, local = %local.display(), "fetch");
    match url.scheme() {
      "file" => copy_atomic(&file_path(url)?, local, url),
      "http" | "https" => {
        let response = reqwest::blocking::get(url.clone()).map_err(|e| TransportError::Unreachable {
          url: url.to_string(),
          detail: e.to_string(),
        })?;
        match response.status().as_u16() {
          404 => return Err(TransportError::NotFound { url: url.to_string() }),
          401 | 403 => return Err(TransportError::Unauthorized { url: url.to_string() }),
          _ => {}
        }
        if !response.status().is_success() {
          return Err(TransportError::Unreachable {
            url: url.to_string(),
            detail: format!("http status {}", response.status()),
          });
        }
        let bytes = response.bytes().map_err(|e| TransportError::Unreachable {
          url: url.to_string(),
          detail: e.to_string(),
        })?;
        write_atomic(local, &bytes, url)
      }
      "rsync" | "rsync+ssh" => {
        if let Some(parent) = local.parent() {
          fs::create_dir_all(parent).map_err(|e| io_err(url, e))?;
        }
        let mut cmd = Command::new("rsync");
        cmd.arg("-a");
        if url.scheme() == "rsync+ssh" {
          cmd.arg("-e").arg(&self.ssh_command);
          cmd.arg(format!("{}:{}", ssh_target(url)?, url.path()));
        } else {
          cmd.arg(url.as_str());
        }
        cmd.arg(local);
        run_tool(cmd, url)
      }
      "ssh" | "scp" => {
        if let Some(parent) = local.parent() {
          fs::create_dir_all(parent).map_err(|e| io_err(url, e))?;
        }
        let mut cmd = Command::new("scp");
        cmd.arg("-q");
        cmd.arg(format!("{}:{}", ssh_target(url)?, url.path()));
        cmd.arg(local);
        run_tool(cmd, url)
      }
      _ => Err(unsupported(url)),
    }
  }

  fn push(&self, local: &Path, url: &Url) -> Result<(), TransportError> {
    debug!(url = %url, local = %local.display(), "push");
    match url.scheme() {
      "file" => copy_atomic(local, &file_path(url)?, url),
      "http" | "https" => Err(TransportError::ReadOnly {
        scheme: url.scheme().to_string(),
      }),
      "rsync" | "rsync+ssh" => {
        let mut cmd = Command::new("rsync");
        cmd.arg("-a");
        cmd.arg(local);
        if url.scheme() == "rsync+ssh" {
          cmd.arg("-e").arg(&self.ssh_command);
          cmd.arg(format!("{}:{}", ssh_target(url)?, url.path()));
        } else {
          cmd.arg(url.as_str());
        }
        run_tool(cmd, url)
      }
      "ssh" | "scp" => {
        let mut cmd = Command::new("scp");
        cmd.arg("-q");
        cmd.arg(local);
        cmd.arg(format!("{}:{}", ssh_target(url)?, url.path()));
        run_tool(cmd, url)
      }
      _ => Err(unsupported(url)),
    }
  }

  fn mkdir(&self, url: &Url) -> Result<(), TransportError> {
    match url.scheme() {
      "file" => fs::create_dir_all(file_path(url)?).map_err(|e| io_err(url, e)),
      "ssh" | "scp" | "rsync+ssh" => {
        let mut cmd = Command::new(&self.ssh_command);
        cmd.arg(ssh_target(url)?);
        cmd.arg("mkdir").arg("-p").arg(url.path());
        run_tool(cmd, url)
      }
      "http" | "https" => Err(TransportError::ReadOnly {
        scheme: url.scheme().to_string(),
      }),
      _ => Err(unsupported(url)),
    }
  }

  fn exists(&self, url: &Url) -> Result<bool, TransportError> {
    match url.scheme() {
      "file" => Ok(file_path(url)?.exists()),
      "http" | "https" => {
        let client = reqwest::blocking::Client::new();
        let response = client.head(url.clone()).send().map_err(|e| TransportError::Unreachable {
          url: url.to_string(),
          detail: e.to_string(),
        })?;
        Ok(response.status().is_success())
      }
      "ssh" | "scp" | "rsync+ssh" => {
        let mut cmd = Command::new(&self.ssh_command);
        cmd.arg(ssh_target(url)?);
        cmd.arg("test").arg("-e").arg(url.path());
        let output = cmd.output().map_err(|e| io_err(url, e))?;
        match output.status.code() {
          Some(0) => Ok(true),
          Some(1) => Ok(false),
          _ => Err(TransportError::Unreachable {
            url: url.to_string(),
            detail: format!("remote test exited with {}", output.status),
          }),
        }
      }
      _ => Err(unsupported(url)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn file_url(path: &Path) -> Url {
    Url::from_file_path(path).unwrap()
  }

  #[test]
  fn join_url_normalizes_trailing_slashes() {
    let url = join_url("http://host/base///", "sub/file.tar.gz").unwrap();
    assert_eq!(url.as_str(), "http://host/base/sub/file.tar.gz");
  }

  #[test]
  fn file_fetch_copies_contents() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src.txt");
    fs::write(&src, b"payload").unwrap();

    let dest = dir.path().join("sub/dest.txt");
    let transport = StdTransport::default();
    transport.fetch(&file_url(&src), &dest).unwrap();

    assert_eq!(fs::read(&dest).unwrap(), b"payload");
  }

  #[test]
  fn file_fetch_missing_source_leaves_no_target() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("absent.txt");
    let dest = dir.path().join("dest.txt");

    let transport = StdTransport::default();
    assert!(transport.fetch(&file_url(&src), &dest).is_err());
    assert!(!dest.exists());
  }

  #[test]
  fn file_push_and_exists() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src.txt");
    fs::write(&src, b"x").unwrap();
    let remote = dir.path().join("remote/file.txt");

    let transport = StdTransport::default();
    assert!(!transport.exists(&file_url(&remote)).unwrap());
    transport.push(&src, &file_url(&remote)).unwrap();
    assert!(transport.exists(&file_url(&remote)).unwrap());
  }

  #[test]
  fn file_mkdir_creates_directories() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("a/b/c");

    StdTransport::default().mkdir(&file_url(&target)).unwrap();
    assert!(target.is_dir());
  }

  #[test]
  fn http_push_is_read_only() {
    let url = Url::parse("https://host/file").unwrap();
    let err = StdTransport::default().push(Path::new("/dev/null"), &url).unwrap_err();
    assert!(matches!(err, TransportError::ReadOnly { .. }));
  }

  #[test]
  fn git_urls_are_not_transportable() {
    let url = Url::parse("git+ssh://host/repo.git").unwrap();
    let dir = TempDir::new().unwrap();
    let err = StdTransport::default()
      .fetch(&url, &dir.path().join("x"))
      .unwrap_err();
    assert!(matches!(err, TransportError::UnsupportedScheme { .. }));
  }
}
