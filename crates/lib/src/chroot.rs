//! Build-root provisioning.
//!
//! Each result builds inside an exclusive directory guarded by a
//! filesystem lock: a sibling directory created with `mkdir` and removed
//! with `rmdir`. Held locks are registered with the run context so they
//! are drained on every exit path. Privileged operations go through the
//! configured helper; without one the manager works on the filesystem
//! directly, which is what tests and unprivileged runs use.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::{debug, info};

use e2build_core::hash::hash_file;

use crate::archive::{self, ArchiveError};
use crate::cache::CacheError;
use crate::context::{Context, LockRegistry};
use crate::project::ResultDef;

#[derive(Debug, Error)]
pub enum ChrootError {
  #[error("build directory {path} is busy (locked by another build)")]
  Busy { path: PathBuf },

  #[error("chroot i/o on {path}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("no such chroot group: {0}")]
  UnknownGroup(String),

  #[error("chroot archive {location} hash mismatch: expected {expected}, got {actual}")]
  HashMismatch {
    location: String,
    expected: String,
    actual: String,
  },

  #[error("chroot helper {helper} failed with {status}")]
  Helper { helper: String, status: String },

  #[error(transparent)]
  Archive(#[from] ArchiveError),

  #[error(transparent)]
  Cache(#[from] CacheError),
}

fn io_err(path: &Path, source: io::Error) -> ChrootError {
  ChrootError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// An exclusive hold on a build directory.
///
/// Acquired with `mkdir`, released with `rmdir`; a concurrent holder makes
/// the `mkdir` fail and the acquisition observes `Busy` without touching
/// the build directory.
#[derive(Debug)]
pub struct ChrootLock {
  lock_path: PathBuf,
  registry: LockRegistry,
  released: bool,
}

impl ChrootLock {
  pub fn acquire(registry: &LockRegistry, build_dir: &Path) -> Result<Self, ChrootError> {
    let lock_path = lock_path_for(build_dir);
    if let Some(parent) = lock_path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }

    match std::fs::create_dir(&lock_path) {
      Ok(()) => {}
      Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
        return Err(ChrootError::Busy {
          path: build_dir.to_path_buf(),
        });
      }
      Err(err) => return Err(io_err(&lock_path, err)),
    }

    registry.register(&lock_path);
    debug!(path = %lock_path.display(), "chroot lock acquired");
    Ok(Self {
      lock_path,
      registry: registry.clone(),
      released: false,
    })
  }

  pub fn release(mut self) -> Result<(), ChrootError> {
    let path = self.lock_path.clone();
    self.do_release().map_err(|e| io_err(&path, e))
  }

  fn do_release(&mut self) -> io::Result<()> {
    if self.released {
      return Ok(());
    }
    self.released = true;
    self.registry.unregister(&self.lock_path);
    std::fs::remove_dir(&self.lock_path)?;
    debug!(path = %self.lock_path.display(), "chroot lock released");
    Ok(())
  }
}

impl Drop for ChrootLock {
  fn drop(&mut self) {
    let _ = self.do_release();
  }
}

fn lock_path_for(build_dir: &Path) -> PathBuf {
  let mut name = build_dir
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_default();
  name.push_str(".lock");
  build_dir.with_file_name(name)
}

fn run_helper(helper: &Path, args: &[&str]) -> Result<(), ChrootError> {
  debug!(helper = %helper.display(), ?args, "invoking chroot helper");
  let status = Command::new(helper).args(args).status().map_err(|e| io_err(helper, e))?;
  if status.success() {
    Ok(())
  } else {
    Err(ChrootError::Helper {
      helper: helper.display().to_string(),
      status: status.to_string(),
    })
  }
}

/// Assemble the build root for a result: every archive of every referenced
/// chroot group, extracted in declared order.
pub fn setup(ctx: &Context, result: &ResultDef, root: &Path) -> Result<(), ChrootError> {
  std::fs::create_dir_all(root).map_err(|e| io_err(root, e))?;

  for group_name in &result.chroot_groups {
    let group = ctx
      .project
      .chroot_groups
      .get(group_name)
      .ok_or_else(|| ChrootError::UnknownGroup(group_name.clone()))?;

    info!(result = %result.name, group = %group.name, "installing chroot group");
    for file in &group.files {
      let local = ctx.cache.fetch_file(&file.server, &file.location)?;
      let actual = hash_file(&local).map_err(|e| io_err(&local, e))?;
      if actual != file.sha1 {
        return Err(ChrootError::HashMismatch {
          location: file.location.clone(),
          expected: file.sha1.clone(),
          actual,
        });
      }

      match &ctx.su_helper {
        Some(helper) => run_helper(
          helper,
          &[
            "extract_tar",
            file.tartype.name(),
            &local.to_string_lossy(),
            &root.to_string_lossy(),
          ],
        )?,
        None => archive::extract(&local, file.tartype, root)?,
      }
    }
  }
  Ok(())
}

/// Run the staged build script inside a root.
///
/// With a helper configured the script runs chrooted at
/// `/tmp/e2build/script`; without one it runs directly in the staged
/// work directory against a cleared environment, which keeps unprivileged
/// runs and tests honest about what the script may see.
pub fn run_script(
  ctx: &Context,
  root: &Path,
  env: &e2build_core::Environment,
) -> Result<std::process::ExitStatus, ChrootError> {
  let mut cmd = match &ctx.su_helper {
    Some(helper) => {
      let mut cmd = Command::new(helper);
      cmd.arg("chroot").arg(root).arg("/bin/sh").arg("/tmp/e2build/script");
      cmd
    }
    None => {
      let work = root.join("tmp/e2build");
      let mut cmd = Command::new("/bin/sh");
      cmd.arg(work.join("script"));
      cmd.current_dir(&work);
      cmd
    }
  };

  cmd.env_clear();
  cmd.env("PATH", "/usr/sbin:/usr/bin:/sbin:/bin");
  for (name, value) in env.iter() {
    cmd.env(name, value);
  }

  cmd.status().map_err(|e| io_err(root, e))
}

/// Dismantle a build root.
pub fn remove(ctx: &Context, root: &Path) -> Result<(), ChrootError> {
  if !root.exists() {
    return Ok(());
  }
  match &ctx.su_helper {
    Some(helper) => run_helper(helper, &["remove_chroot", &root.to_string_lossy()]),
    None => std::fs::remove_dir_all(root).map_err(|e| io_err(root, e)),
  }
}
