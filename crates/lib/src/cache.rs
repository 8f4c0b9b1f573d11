//! The content mirror over the transport layer.
//!
//! Each configured server gets a mirror directory derived from a URL
//! template (`file:///.../cache/%u`, `%u` expanding to the server name).
//! Reads of the same `(server, location)` key coalesce onto a single
//! in-flight fetch; writes honour the per-server writeback and push
//! policies.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;
use url::Url;

use e2build_core::location::{validate_location, LocationError};

use crate::project::Server;
use crate::transport::{join_url, Transport, TransportError};

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("no such server: {0}")]
  UnknownServer(String),

  #[error("invalid cache template {0:?}: expected a file:// url containing %u")]
  Template(String),

  #[error(transparent)]
  Location(#[from] LocationError),

  #[error(transparent)]
  Transport(#[from] TransportError),

  #[error("pushing to server {server:?} denied: no push permissions configured")]
  PushDenied { server: String },

  #[error("cache i/o on {path}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

fn io_err(path: &Path, source: io::Error) -> CacheError {
  CacheError::Io {
    path: path.to_path_buf(),
    source,
  }
}

struct Entry {
  server: Server,
  cache_dir: PathBuf,
  writeback: AtomicBool,
}

/// Pre-initialization cache configuration.
///
/// Writeback toggles requested before the cache exists are queued here and
/// applied once `build` runs.
pub struct CacheSetup {
  template: String,
  queued_writeback: Vec<(String, bool)>,
}

impl CacheSetup {
  pub fn new(template: impl Into<String>) -> Self {
    Self {
      template: template.into(),
      queued_writeback: Vec::new(),
    }
  }

  /// Record a writeback toggle to apply at initialization.
  pub fn queue_writeback(&mut self, server: impl Into<String>, enabled: bool) {
    self.queued_writeback.push((server.into(), enabled));
  }

  pub fn build(
    self,
    servers: &BTreeMap<String, Server>,
    transport: Arc<dyn Transport>,
  ) -> Result<Cache, CacheError> {
    let mut entries = BTreeMap::new();
    for (name, server) in servers {
      let expanded = self.template.replace("%u", name);
      let url = Url::parse(&expanded).map_err(|_| CacheError::Template(self.template.clone()))?;
      let cache_dir = url
        .to_file_path()
        .map_err(|_| CacheError::Template(self.template.clone()))?;

      entries.insert(
        name.clone(),
        Entry {
          writeback: AtomicBool::new(server.writeback),
          server: server.clone(),
          cache_dir,
        },
      );
    }

    let cache = Cache {
      transport,
      entries,
      inflight: Mutex::new(HashMap::new()),
    };
    for (server, enabled) in self.queued_writeback {
      cache.set_writeback(&server, enabled)?;
    }
    Ok(cache)
  }
}

/// The initialized content mirror.
pub struct Cache {
  transport: Arc<dyn Transport>,
  entries: BTreeMap<String, Entry>,
  inflight: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl Cache {
  fn entry(&self, server: &str) -> Result<&Entry, CacheError> {
    self
      .entries
      .get(server)
      .ok_or_else(|| CacheError::UnknownServer(server.to_string()))
  }

  /// The remote URL a `(server, location)` pair addresses.
  pub fn remote_url(&self, server: &str, location: &str) -> Result<Url, CacheError> {
    validate_location(location)?;
    let entry = self.entry(server)?;
    Ok(join_url(&entry.server.url, location)?)
  }

  /// Configured server names, sorted.
  pub fn servers(&self) -> Vec<String> {
    self.entries.keys().cloned().collect()
  }

  /// The mirror path a location caches at.
  pub fn cache_path(&self, server: &str, location: &str) -> Result<PathBuf, CacheError> {
    validate_location(location)?;
    Ok(self.entry(server)?.cache_dir.join(location))
  }

  /// Toggle writeback for one server at runtime.
  pub fn set_writeback(&self, server: &str, enabled: bool) -> Result<(), CacheError> {
    debug!(server, enabled, "set writeback");
    self.entry(server)?.writeback.store(enabled, Ordering::SeqCst);
    Ok(())
  }

  pub fn writeback(&self, server: &str) -> Result<bool, CacheError> {
    Ok(self.entry(server)?.writeback.load(Ordering::SeqCst))
  }

  fn key_lock(&self, server: &str, location: &str) -> Arc<Mutex<()>> {
    let mut inflight = self.inflight.lock().expect("cache key map poisoned");
    inflight
      .entry((server.to_string(), location.to_string()))
      .or_default()
      .clone()
  }

  /// Make a remote file available locally and return its path.
  ///
  /// Local servers are read in place. Cachable servers are mirrored once
  /// and served from the mirror afterwards; a per-key lock guarantees a
  /// single in-flight fetch per `(server, location)`.
  pub fn fetch_file(&self, server: &str, location: &str) -> Result<PathBuf, CacheError> {
    validate_location(location)?;
    let entry = self.entry(server)?;
    let remote = join_url(&entry.server.url, location)?;

    if entry.server.islocal {
      let path = remote.to_file_path().map_err(|_| TransportError::UnsupportedScheme {
        url: remote.to_string(),
        scheme: remote.scheme().to_string(),
      })?;
      return Ok(path);
    }

    let local = entry.cache_dir.join(location);
    let lock = self.key_lock(server, location);
    let _guard = lock.lock().expect("cache key lock poisoned");

    if entry.server.cachable && entry.server.cache && local.exists() {
      debug!(server, location, "cache hit");
      return Ok(local);
    }

    debug!(server, location, "cache miss, fetching");
    self.transport.fetch(&remote, &local)?;
    Ok(local)
  }

  /// Whether a location exists, checking the local mirror before the
  /// remote.
  pub fn file_exists(&self, server: &str, location: &str) -> Result<bool, CacheError> {
    validate_location(location)?;
    let entry = self.entry(server)?;

    if !entry.server.islocal && entry.server.cachable && entry.cache_dir.join(location).exists() {
      return Ok(true);
    }
    let remote = join_url(&entry.server.url, location)?;
    Ok(self.transport.exists(&remote)?)
  }

  /// Write a file towards a server.
  ///
  /// The local mirror is always updated for cachable servers. The remote
  /// is only written when writeback is enabled, and only servers with
  /// push permissions accept it; with writeback disabled the push
  /// succeeds into the local cache alone.
  pub fn push_file(&self, local: &Path, server: &str, location: &str) -> Result<(), CacheError> {
    validate_location(location)?;
    let entry = self.entry(server)?;
    let remote = join_url(&entry.server.url, location)?;

    let lock = self.key_lock(server, location);
    let _guard = lock.lock().expect("cache key lock poisoned");

    if entry.server.islocal {
      let path = remote.to_file_path().map_err(|_| TransportError::UnsupportedScheme {
        url: remote.to_string(),
        scheme: remote.scheme().to_string(),
      })?;
      if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
      }
      fs::copy(local, &path).map_err(|e| io_err(&path, e))?;
      return Ok(());
    }

    if entry.server.cachable {
      let mirror = entry.cache_dir.join(location);
      if let Some(parent) = mirror.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
      }
      fs::copy(local, &mirror).map_err(|e| io_err(&mirror, e))?;
    }

    if !entry.writeback.load(Ordering::SeqCst) {
      debug!(server, location, "writeback disabled, keeping local copy only");
      return Ok(());
    }
    if entry.server.push_permissions.is_none() {
      return Err(CacheError::PushDenied {
        server: server.to_string(),
      });
    }

    if let Some((dir, _)) = location.rsplit_once('/') {
      let dir_url = join_url(&entry.server.url, dir)?;
      self.transport.mkdir(&dir_url)?;
    }
    self.transport.push(local, &remote)?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;
  use std::thread;
  use std::time::Duration;
  use tempfile::TempDir;

  /// Transport fake that counts fetches and serves fixed bytes slowly, so
  /// overlapping callers would be visible as a fetch count above one.
  struct CountingTransport {
    fetches: AtomicUsize,
    pushes: AtomicUsize,
  }

  impl CountingTransport {
    fn new() -> Self {
      Self {
        fetches: AtomicUsize::new(0),
        pushes: AtomicUsize::new(0),
      }
    }
  }

  impl Transport for CountingTransport {
    fn fetch(&self, _url: &Url, local: &Path) -> Result<(), TransportError> {
      self.fetches.fetch_add(1, Ordering::SeqCst);
      thread::sleep(Duration::from_millis(50));
      fs::create_dir_all(local.parent().unwrap()).unwrap();
      fs::write(local, b"remote bytes").unwrap();
      Ok(())
    }

    fn push(&self, _local: &Path, _url: &Url) -> Result<(), TransportError> {
      self.pushes.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }

    fn mkdir(&self, _url: &Url) -> Result<(), TransportError> {
      Ok(())
    }

    fn exists(&self, _url: &Url) -> Result<bool, TransportError> {
      Ok(false)
    }
  }

  fn server(name: &str, url: &str) -> Server {
    Server {
      name: name.to_string(),
      url: url.to_string(),
      cachable: true,
      cache: true,
      islocal: false,
      writeback: false,
      push_permissions: Some("ug+rw".to_string()),
      flags: Vec::new(),
    }
  }

  fn build_cache(dir: &TempDir, servers: Vec<Server>, transport: Arc<dyn Transport>) -> Cache {
    let template = format!("file://{}/cache/%u", dir.path().display());
    let map: BTreeMap<String, Server> = servers.into_iter().map(|s| (s.name.clone(), s)).collect();
    CacheSetup::new(template).build(&map, transport).unwrap()
  }

  #[test]
  fn concurrent_fetches_coalesce_to_one_network_fetch() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(CountingTransport::new());
    let cache = build_cache(&dir, vec![server("upstream", "http://host/files")], transport.clone());

    let paths: Vec<PathBuf> = thread::scope(|scope| {
      let handles: Vec<_> = (0..2)
        .map(|_| scope.spawn(|| cache.fetch_file("upstream", "pkg/foo.tar.gz").unwrap()))
        .collect();
      handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(transport.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(paths[0], paths[1]);
    assert_eq!(fs::read(&paths[0]).unwrap(), b"remote bytes");
  }

  #[test]
  fn second_fetch_is_served_from_the_mirror() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(CountingTransport::new());
    let cache = build_cache(&dir, vec![server("upstream", "http://host/files")], transport.clone());

    cache.fetch_file("upstream", "a.txt").unwrap();
    cache.fetch_file("upstream", "a.txt").unwrap();
    assert_eq!(transport.fetches.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn local_servers_are_read_in_place() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("data");
    fs::create_dir_all(&data).unwrap();
    fs::write(data.join("f.txt"), b"local").unwrap();

    let mut srv = server("local", &format!("file://{}", data.display()));
    srv.islocal = true;
    let transport = Arc::new(CountingTransport::new());
    let cache = build_cache(&dir, vec![srv], transport.clone());

    let path = cache.fetch_file("local", "f.txt").unwrap();
    assert_eq!(path, data.join("f.txt"));
    assert_eq!(transport.fetches.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn push_with_writeback_disabled_stays_local() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(CountingTransport::new());
    let cache = build_cache(&dir, vec![server("out", "http://host/out")], transport.clone());

    let payload = dir.path().join("artifact");
    fs::write(&payload, b"bits").unwrap();
    cache.push_file(&payload, "out", "results/r1/artifact").unwrap();

    assert_eq!(transport.pushes.load(Ordering::SeqCst), 0);
    assert!(cache.cache_path("out", "results/r1/artifact").unwrap().exists());
  }

  #[test]
  fn push_with_writeback_writes_through() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(CountingTransport::new());
    let cache = build_cache(&dir, vec![server("out", "http://host/out")], transport.clone());
    cache.set_writeback("out", true).unwrap();

    let payload = dir.path().join("artifact");
    fs::write(&payload, b"bits").unwrap();
    cache.push_file(&payload, "out", "results/r1/artifact").unwrap();

    assert_eq!(transport.pushes.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn push_without_permissions_is_denied() {
    let dir = TempDir::new().unwrap();
    let mut srv = server("out", "http://host/out");
    srv.push_permissions = None;
    let transport = Arc::new(CountingTransport::new());
    let cache = build_cache(&dir, vec![srv], transport);
    cache.set_writeback("out", true).unwrap();

    let payload = dir.path().join("artifact");
    fs::write(&payload, b"bits").unwrap();
    let err = cache.push_file(&payload, "out", "r/a").unwrap_err();
    assert!(matches!(err, CacheError::PushDenied { .. }));
  }

  #[test]
  fn queued_writeback_applies_at_build_time() {
    let dir = TempDir::new().unwrap();
    let mut setup = CacheSetup::new(format!("file://{}/cache/%u", dir.path().display()));
    setup.queue_writeback("out", true);

    let map: BTreeMap<String, Server> = [("out".to_string(), server("out", "http://host/out"))].into();
    let cache = setup.build(&map, Arc::new(CountingTransport::new())).unwrap();
    assert!(cache.writeback("out").unwrap());
  }

  #[test]
  fn unknown_server_is_rejected() {
    let dir = TempDir::new().unwrap();
    let cache = build_cache(&dir, vec![], Arc::new(CountingTransport::new()));
    assert!(matches!(
      cache.fetch_file("nope", "f"),
      Err(CacheError::UnknownServer(_))
    ));
  }

  #[test]
  fn escaping_locations_are_rejected() {
    let dir = TempDir::new().unwrap();
    let cache = build_cache(&dir, vec![server("s", "http://h/p")], Arc::new(CountingTransport::new()));
    assert!(matches!(cache.fetch_file("s", "../etc"), Err(CacheError::Location(_))));
    assert!(matches!(cache.fetch_file("s", "/abs"), Err(CacheError::Location(_))));
  }

  #[test]
  fn remote_url_joins_server_and_location() {
    let dir = TempDir::new().unwrap();
    let cache = build_cache(
      &dir,
      vec![server("upstream", "http://host/base/")],
      Arc::new(CountingTransport::new()),
    );
    let url = cache.remote_url("upstream", "pkg/a.tar.gz").unwrap();
    assert_eq!(url.as_str(), "http://host/base/pkg/a.tar.gz");
  }

  #[test]
  fn server_listing_is_sorted() {
    let dir = TempDir::new().unwrap();
    let cache = build_cache(
      &dir,
      vec![server("zeta", "http://h/z"), server("alpha", "http://h/a")],
      Arc::new(CountingTransport::new()),
    );
    assert_eq!(cache.servers(), vec!["alpha".to_string(), "zeta".to_string()]);
  }
}
