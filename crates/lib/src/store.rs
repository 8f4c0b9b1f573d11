//! The content-addressed result store.
//!
//! Artifacts live at `results/<buildid>/result.tar.gz` on the configured
//! result server, mirrored through the cache. A `working-copy` buildid is
//! never looked up and never stored.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::archive::{self, ArchiveError};
use crate::cache::{Cache, CacheError};
use crate::project::{TarType, WORKING_COPY_ID};

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("working-copy builds are not cachable")]
  NotCachable,

  #[error("store i/o on {path}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  Archive(#[from] ArchiveError),

  #[error(transparent)]
  Cache(#[from] CacheError),
}

/// Handle on the result store of one server.
pub struct ResultStore<'a> {
  cache: &'a Cache,
  server: String,
}

impl<'a> ResultStore<'a> {
  pub fn new(cache: &'a Cache, server: impl Into<String>) -> Self {
    Self {
      cache,
      server: server.into(),
    }
  }

  fn location(buildid: &str) -> String {
    format!("results/{}/result.tar.gz", buildid)
  }

  /// Whether an artifact for `buildid` exists locally or remotely.
  /// The sentinel never hits.
  pub fn contains(&self, buildid: &str) -> Result<bool, StoreError> {
    if buildid == WORKING_COPY_ID {
      return Ok(false);
    }
    let hit = self.cache.file_exists(&self.server, &Self::location(buildid))?;
    debug!(buildid, hit, "result store lookup");
    Ok(hit)
  }

  /// Store the contents of `artifact_dir` under `buildid`.
  ///
  /// The archive is assembled in `scratch` and moved through the cache,
  /// so a failed pack never leaves a partial artifact behind.
  pub fn put(&self, buildid: &str, artifact_dir: &Path, scratch: &Path) -> Result<(), StoreError> {
    if buildid == WORKING_COPY_ID {
      return Err(StoreError::NotCachable);
    }

    let archive_path = scratch.join("result.tar.gz");
    archive::create_tar_gz(artifact_dir, &archive_path)?;
    self.cache.push_file(&archive_path, &self.server, &Self::location(buildid))?;
    info!(buildid, "artifact stored");
    Ok(())
  }

  /// Unpack the artifact for `buildid` into `dest`.
  pub fn get(&self, buildid: &str, dest: &Path) -> Result<(), StoreError> {
    if buildid == WORKING_COPY_ID {
      return Err(StoreError::NotCachable);
    }
    let local = self.cache.fetch_file(&self.server, &Self::location(buildid))?;
    archive::extract(&local, TarType::TarGz, dest)?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSetup;
  use crate::project::Server;
  use crate::transport::StdTransport;
  use std::collections::BTreeMap;
  use std::fs;
  use std::sync::Arc;
  use tempfile::TempDir;

  fn result_server(dir: &Path) -> Server {
    Server {
      name: "results".to_string(),
      url: format!("file://{}", dir.display()),
      cachable: true,
      cache: true,
      islocal: false,
      writeback: true,
      push_permissions: Some("ug+rw".to_string()),
      flags: Vec::new(),
    }
  }

  fn build_cache(base: &TempDir) -> Cache {
    let remote = base.path().join("remote");
    fs::create_dir_all(&remote).unwrap();
    let servers: BTreeMap<String, Server> =
      [("results".to_string(), result_server(&remote))].into();
    CacheSetup::new(format!("file://{}/cache/%u", base.path().display()))
      .build(&servers, Arc::new(StdTransport::default()))
      .unwrap()
  }

  #[test]
  fn put_then_contains_then_get() {
    let base = TempDir::new().unwrap();
    let cache = build_cache(&base);
    let store = ResultStore::new(&cache, "results");

    let artifact = base.path().join("artifact");
    fs::create_dir_all(&artifact).unwrap();
    fs::write(artifact.join("image.bin"), b"\x7fELF...").unwrap();

    let buildid = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    assert!(!store.contains(buildid).unwrap());

    let scratch = base.path().join("scratch");
    fs::create_dir_all(&scratch).unwrap();
    store.put(buildid, &artifact, &scratch).unwrap();
    assert!(store.contains(buildid).unwrap());

    let dest = base.path().join("unpacked");
    store.get(buildid, &dest).unwrap();
    assert_eq!(fs::read(dest.join("image.bin")).unwrap(), b"\x7fELF...");
  }

  #[test]
  fn working_copy_builds_never_hit() {
    let base = TempDir::new().unwrap();
    let cache = build_cache(&base);
    let store = ResultStore::new(&cache, "results");

    assert!(!store.contains(WORKING_COPY_ID).unwrap());
    let artifact = base.path().join("artifact");
    fs::create_dir_all(&artifact).unwrap();
    assert!(matches!(
      store.put(WORKING_COPY_ID, &artifact, base.path()),
      Err(StoreError::NotCachable)
    ));
  }
}
