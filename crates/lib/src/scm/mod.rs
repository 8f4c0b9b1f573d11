//! SCM plug-ins.
//!
//! Sources are polymorphic over one capability set; the pipeline never
//! looks past it. Implementations are registered in a compile-time
//! dispatch table keyed on the source type tag.

mod files;
mod git;
mod svn;

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use thiserror::Error;
use tracing::debug;

use crate::cache::CacheError;
use crate::context::Context;
use crate::ident::IdentError;
use crate::project::{Source, SourceKind, SourceSet};
use crate::transport::TransportError;

pub use files::FilesScm;
pub use git::{git_url, GitScm};
pub use svn::SvnScm;

#[derive(Debug, Error)]
pub enum ScmError {
  #[error("source {name}: working copy {path} is not available")]
  WorkingCopyMissing { name: String, path: PathBuf },

  #[error("source {name}: {rev} not found")]
  RefNotFound { name: String, rev: String },

  #[error("source {name}: tag {tag} is {local} locally but {remote} on the remote")]
  TagMismatch {
    name: String,
    tag: String,
    local: String,
    remote: String,
  },

  #[error("source {name}: branch {branch} does not exist in the working copy")]
  BranchMissing { name: String, branch: String },

  #[error("source {name}: no remote configured for branch {branch}")]
  NoRemote { name: String, branch: String },

  #[error("source {name}: working copy remote is {actual:?}, expected {expected:?}")]
  RemoteMismatch {
    name: String,
    expected: String,
    actual: String,
  },

  #[error("source {name}: {location} hash mismatch: expected {expected}, got {actual}")]
  HashMismatch {
    name: String,
    location: String,
    expected: String,
    actual: String,
  },

  #[error("source {name}: archive did not unpack to {expected:?}")]
  UnpackMismatch { name: String, expected: String },

  #[error("source {name}: {location} is not a supported archive")]
  UnsupportedArchive { name: String, location: String },

  #[error(transparent)]
  Archive(#[from] crate::archive::ArchiveError),

  #[error("{tool} {args:?} failed with {status}")]
  Tool {
    tool: String,
    args: Vec<String>,
    status: String,
  },

  #[error("i/o error on {path}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("invalid url {url:?} for source {name}")]
  InvalidUrl { name: String, url: String },

  #[error("source {name}: no such server: {server}")]
  UnknownServer { name: String, server: String },

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error(transparent)]
  Transport(#[from] TransportError),

  #[error("identity computation failed")]
  Ident(#[source] Box<IdentError>),
}

impl From<IdentError> for ScmError {
  fn from(err: IdentError) -> Self {
    ScmError::Ident(Box::new(err))
  }
}

pub(crate) fn io_err(path: &Path, source: io::Error) -> ScmError {
  ScmError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// The capability set every SCM implements.
pub trait Scm: Sync {
  /// The source id under a source set.
  fn source_id(&self, ctx: &Context, src: &Source, set: SourceSet) -> Result<String, ScmError>;

  /// Make the source available locally (clone / download).
  fn fetch(&self, ctx: &Context, src: &Source) -> Result<(), ScmError>;

  /// Bring an existing working copy up to date.
  fn update(&self, ctx: &Context, src: &Source) -> Result<(), ScmError>;

  /// Materialize the source into `build_path` under the given source set.
  fn prepare(&self, ctx: &Context, src: &Source, set: SourceSet, build_path: &Path) -> Result<(), ScmError>;

  /// Whether a usable working copy is present on disk.
  fn working_copy_available(&self, ctx: &Context, src: &Source) -> bool;

  /// Whether this source type has a working copy at all.
  fn has_working_copy(&self, src: &Source) -> bool;

  /// Verify the working copy matches the source configuration.
  fn check_working_copy(&self, ctx: &Context, src: &Source) -> Result<(), ScmError>;

  /// One-line human description.
  fn display(&self, src: &Source) -> String;

  /// Materialize the source as a stand-alone buildable unit in `dir`:
  /// the prepared tree under `source/` plus its licence list.
  fn to_result(&self, ctx: &Context, src: &Source, set: SourceSet, dir: &Path) -> Result<(), ScmError> {
    self.prepare(ctx, src, set, dir)?;
    std::fs::rename(dir.join(&src.name), dir.join("source")).map_err(|e| io_err(dir, e))?;

    let mut licences = src.licences.clone();
    licences.sort();
    let mut out = licences.join("\n");
    if !out.is_empty() {
      out.push('\n');
    }
    std::fs::write(dir.join("licences"), out).map_err(|e| io_err(dir, e))?;
    Ok(())
  }
}

static GIT: GitScm = GitScm;
static SVN: SvnScm = SvnScm;
static FILES: FilesScm = FilesScm;

/// Look up the plug-in for a source type.
pub fn scm_for(kind: &SourceKind) -> &'static dyn Scm {
  match kind {
    SourceKind::Git { .. } => &GIT,
    SourceKind::Svn { .. } => &SVN,
    SourceKind::Files { .. } => &FILES,
  }
}

/// Run an external tool and capture its output. Spawn failures map to
/// `Io`.
pub(crate) fn tool_output(dir: Option<&Path>, tool: &str, args: &[&str]) -> Result<Output, ScmError> {
  debug!(tool, ?args, cwd = ?dir, "running tool");
  let mut cmd = Command::new(tool);
  cmd.args(args);
  if let Some(dir) = dir {
    cmd.current_dir(dir);
  }
  cmd
    .output()
    .map_err(|e| io_err(dir.unwrap_or_else(|| Path::new(".")), e))
}

/// Run an external tool, requiring success, and return trimmed stdout.
pub(crate) fn run_tool(dir: Option<&Path>, tool: &str, args: &[&str]) -> Result<String, ScmError> {
  let output = tool_output(dir, tool, args)?;
  if !output.status.success() {
    return Err(ScmError::Tool {
      tool: tool.to_string(),
      args: args.iter().map(|a| a.to_string()).collect(),
      status: output.status.to_string(),
    });
  }
  Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run an external tool and report bare success/failure.
pub(crate) fn tool_succeeds(dir: Option<&Path>, tool: &str, args: &[&str]) -> Result<bool, ScmError> {
  Ok(tool_output(dir, tool, args)?.status.success())
}

/// Copy a directory tree, skipping any top-level entry named in
/// `exclude`.
pub(crate) fn copy_tree(src: &Path, dest: &Path, exclude: &[&str]) -> Result<(), ScmError> {
  std::fs::create_dir_all(dest).map_err(|e| io_err(dest, e))?;
  for entry in walkdir::WalkDir::new(src).min_depth(1) {
    let entry = entry.map_err(|e| ScmError::Io {
      path: src.to_path_buf(),
      source: io::Error::other(e),
    })?;
    let rel = entry
      .path()
      .strip_prefix(src)
      .expect("walkdir yields paths below its root");
    if let Some(first) = rel.components().next() {
      let first = first.as_os_str().to_string_lossy();
      if exclude.iter().any(|x| *x == first) {
        continue;
      }
    }

    let target = dest.join(rel);
    if entry.file_type().is_dir() {
      std::fs::create_dir_all(&target).map_err(|e| io_err(&target, e))?;
    } else if entry.file_type().is_symlink() {
      let link = std::fs::read_link(entry.path()).map_err(|e| io_err(entry.path(), e))?;
      #[cfg(unix)]
      std::os::unix::fs::symlink(&link, &target).map_err(|e| io_err(&target, e))?;
    } else {
      if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
      }
      std::fs::copy(entry.path(), &target).map_err(|e| io_err(&target, e))?;
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn copy_tree_excludes_top_level_entries() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    std::fs::create_dir_all(src.join(".git")).unwrap();
    std::fs::create_dir_all(src.join("sub/.git")).unwrap();
    std::fs::write(src.join("file.c"), b"int x;").unwrap();
    std::fs::write(src.join(".git/config"), b"nope").unwrap();
    std::fs::write(src.join("sub/.git/keep"), b"kept").unwrap();

    let dest = dir.path().join("dest");
    copy_tree(&src, &dest, &[".git"]).unwrap();

    assert!(dest.join("file.c").exists());
    assert!(!dest.join(".git").exists());
    // Only the top level is excluded.
    assert!(dest.join("sub/.git/keep").exists());
  }

  #[test]
  fn run_tool_captures_stdout() {
    let out = run_tool(None, "echo", &["hello"]).unwrap();
    assert_eq!(out, "hello");
  }

  #[test]
  fn tool_succeeds_reports_status() {
    assert!(tool_succeeds(None, "true", &[]).unwrap());
    assert!(!tool_succeeds(None, "false", &[]).unwrap());
  }
}
