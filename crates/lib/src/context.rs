//! The per-invocation run context.
//!
//! Everything that would otherwise be process-global state is carried by an
//! explicit `Context` record: the loaded project, the cache, consumed
//! environment variables, the temp-dir registry, the chroot-lock registry
//! and the interrupt flag. Teardown happens on drop, on every exit path.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::project::{Project, Source};
use crate::warn::Warnings;

#[derive(Debug, Error)]
pub enum ContextError {
  #[error("required environment variable {0} is not set")]
  MissingEnv(&'static str),

  #[error("failed to create temp directory")]
  TempDir(#[source] io::Error),

  #[error("failed to install signal handler")]
  Signal(#[source] nix::Error),
}

/// Environment variables the tool consumes. `HOME` and `USER` are
/// required; the rest default.
#[derive(Debug, Clone)]
pub struct EnvVars {
  pub home: PathBuf,
  pub user: String,
  pub tmpdir: Option<PathBuf>,
  pub e2_tmpdir: Option<PathBuf>,
  pub e2_config: Option<PathBuf>,
  pub e2_ssh: Option<String>,
  pub local_branch: Option<String>,
  pub local_tag: Option<String>,
  pub columns: Option<usize>,
}

impl EnvVars {
  pub fn from_env() -> Result<Self, ContextError> {
    let var = |name| std::env::var(name).ok().filter(|v: &String| !v.is_empty());

    Ok(Self {
      home: var("HOME").map(PathBuf::from).ok_or(ContextError::MissingEnv("HOME"))?,
      user: var("USER").ok_or(ContextError::MissingEnv("USER"))?,
      tmpdir: var("TMPDIR").map(PathBuf::from),
      e2_tmpdir: var("E2TMPDIR").map(PathBuf::from),
      e2_config: var("E2_CONFIG").map(PathBuf::from),
      e2_ssh: var("E2_SSH"),
      local_branch: var("E2_LOCAL_BRANCH"),
      local_tag: var("E2_LOCAL_TAG"),
      columns: var("COLUMNS").and_then(|v| v.parse().ok()),
    })
  }

  /// The temp root to use: `E2TMPDIR` beats `TMPDIR` beats the system
  /// default.
  pub fn temp_root(&self) -> Option<&Path> {
    self.e2_tmpdir.as_deref().or(self.tmpdir.as_deref())
  }
}

/// Registry of held chroot locks, drained on teardown.
#[derive(Debug, Clone, Default)]
pub struct LockRegistry {
  held: Arc<Mutex<BTreeSet<PathBuf>>>,
}

impl LockRegistry {
  pub fn register(&self, path: &Path) {
    self.held.lock().expect("lock registry poisoned").insert(path.to_path_buf());
  }

  pub fn unregister(&self, path: &Path) {
    self.held.lock().expect("lock registry poisoned").remove(path);
  }

  pub fn held(&self) -> Vec<PathBuf> {
    self.held.lock().expect("lock registry poisoned").iter().cloned().collect()
  }

  /// Remove every lock directory still registered.
  pub fn drain(&self) {
    let mut held = self.held.lock().expect("lock registry poisoned");
    for path in std::mem::take(&mut *held) {
      debug!(path = %path.display(), "releasing surviving lock");
      if let Err(err) = std::fs::remove_dir(&path) {
        warn!(path = %path.display(), error = %err, "could not remove lock directory");
      }
    }
  }
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_: nix::libc::c_int) {
  if INTERRUPTED.swap(true, Ordering::SeqCst) {
    // Second SIGINT: leave immediately, skipping cleanup.
    unsafe { nix::libc::_exit(130) };
  }
}

/// Install the SIGINT protocol: first signal raises the interrupt flag,
/// second exits with status 130 at once.
pub fn install_interrupt_handler() -> Result<(), ContextError> {
  use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

  let action = SigAction::new(SigHandler::Handler(handle_sigint), SaFlags::empty(), SigSet::empty());
  unsafe { sigaction(Signal::SIGINT, &action) }.map_err(ContextError::Signal)?;
  Ok(())
}

/// Whether SIGINT was received. Also queryable via
/// [`Context::interrupted`].
pub fn interrupted() -> bool {
  INTERRUPTED.load(Ordering::SeqCst)
}

#[cfg(test)]
pub(crate) fn set_interrupt_flag(value: bool) {
  INTERRUPTED.store(value, Ordering::SeqCst);
}

/// Options that shape a run context.
#[derive(Debug, Default)]
pub struct ContextOptions {
  /// Verify remote tags against local ones during sourceid computation.
  pub check_remote: bool,
  /// Privileged chroot helper; direct filesystem access when unset.
  pub su_helper: Option<PathBuf>,
}

/// Memoization key: `(entity key, source-set name)`.
pub(crate) type MemoKey = (String, &'static str);

/// The explicit record passed through the call graph.
pub struct Context {
  pub project: Project,
  pub cache: Cache,
  pub env: EnvVars,
  pub warnings: Warnings,
  pub locks: LockRegistry,
  pub check_remote: bool,
  pub su_helper: Option<PathBuf>,
  pub(crate) memo: Mutex<HashMap<MemoKey, String>>,
  /// Base directory chroots are assembled under.
  pub build_base: PathBuf,
  tmp: TempDir,
}

impl Context {
  pub fn new(project: Project, cache: Cache, env: EnvVars, options: ContextOptions) -> Result<Self, ContextError> {
    let tmp = match env.temp_root() {
      Some(root) => {
        std::fs::create_dir_all(root).map_err(ContextError::TempDir)?;
        tempfile::Builder::new()
          .prefix("e2build-")
          .tempdir_in(root)
          .map_err(ContextError::TempDir)?
      }
      None => tempfile::Builder::new()
        .prefix("e2build-")
        .tempdir()
        .map_err(ContextError::TempDir)?,
    };
    let build_base = tmp.path().join("build");
    std::fs::create_dir_all(&build_base).map_err(ContextError::TempDir)?;

    Ok(Self {
      project,
      cache,
      env,
      warnings: Warnings::default(),
      locks: LockRegistry::default(),
      check_remote: options.check_remote,
      su_helper: options.su_helper,
      memo: Mutex::new(HashMap::new()),
      build_base,
      tmp,
    })
  }

  pub fn interrupted(&self) -> bool {
    interrupted()
  }

  /// A fresh scratch directory below the context temp root.
  pub fn scratch_dir(&self, prefix: &str) -> io::Result<PathBuf> {
    let dir = tempfile::Builder::new()
      .prefix(prefix)
      .tempdir_in(self.tmp.path())?
      .keep();
    Ok(dir)
  }

  /// Absolute working-copy path of a source.
  pub fn working_dir(&self, source: &Source) -> PathBuf {
    self.project.info.root.join(&source.working)
  }
}

impl Drop for Context {
  fn drop(&mut self) {
    self.locks.drain();
    // The temp tree is removed by TempDir.
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;

  #[test]
  #[serial]
  fn missing_home_is_an_error() {
    temp_env::with_vars([("HOME", None::<&str>), ("USER", Some("tester"))], || {
      assert!(matches!(EnvVars::from_env(), Err(ContextError::MissingEnv("HOME"))));
    });
  }

  #[test]
  #[serial]
  fn e2tmpdir_beats_tmpdir() {
    temp_env::with_vars(
      [
        ("HOME", Some("/home/tester")),
        ("USER", Some("tester")),
        ("TMPDIR", Some("/tmp/plain")),
        ("E2TMPDIR", Some("/tmp/e2")),
      ],
      || {
        let env = EnvVars::from_env().unwrap();
        assert_eq!(env.temp_root(), Some(Path::new("/tmp/e2")));
      },
    );
  }

  #[test]
  fn lock_registry_drains_surviving_locks() {
    let dir = tempfile::TempDir::new().unwrap();
    let lock_path = dir.path().join("r1.lock");
    std::fs::create_dir(&lock_path).unwrap();

    let registry = LockRegistry::default();
    registry.register(&lock_path);
    registry.drain();

    assert!(!lock_path.exists());
    assert!(registry.held().is_empty());
  }

  #[test]
  fn unregistered_locks_are_not_touched() {
    let dir = tempfile::TempDir::new().unwrap();
    let lock_path = dir.path().join("r1.lock");
    std::fs::create_dir(&lock_path).unwrap();

    let registry = LockRegistry::default();
    registry.register(&lock_path);
    registry.unregister(&lock_path);
    registry.drain();

    assert!(lock_path.exists());
  }
}
