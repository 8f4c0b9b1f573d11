//! The svn plug-in.
//!
//! Tag and branch selection map onto repository subdirectories
//! (`tagdir`/`branchdir`); revisions come from `svn info` structured
//! output.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use e2build_core::location::remove_trailing_slashes;
use e2build_core::Hasher;

use crate::context::Context;
use crate::ident;
use crate::project::{Source, SourceKind, SourceSet, WORKING_COPY_ID};

use super::{copy_tree, io_err, run_tool, tool_succeeds, Scm, ScmError};

pub struct SvnScm;

fn svn_attrs(src: &Source) -> (&str, &str, &str) {
  match &src.kind {
    SourceKind::Svn {
      location,
      branchdir,
      tagdir,
    } => (location, branchdir, tagdir),
    _ => unreachable!("svn plug-in dispatched on a non-svn source"),
  }
}

fn repo_url(ctx: &Context, src: &Source) -> Result<String, ScmError> {
  let (location, _, _) = svn_attrs(src);
  let server = ctx
    .project
    .servers
    .get(&src.server)
    .ok_or_else(|| ScmError::UnknownServer {
      name: src.name.clone(),
      server: src.server.clone(),
    })?;
  Ok(format!("{}/{}", remove_trailing_slashes(&server.url), location))
}

/// The repository subdirectory a source set selects. Svn has no pseudo
/// tag, so lazytag degenerates to tag.
fn select_dir(src: &Source, set: SourceSet) -> &str {
  let (_, branchdir, tagdir) = svn_attrs(src);
  match set.resolve("") {
    SourceSet::Branch => branchdir,
    _ => tagdir,
  }
}

fn work_tree(ctx: &Context, src: &Source) -> PathBuf {
  ctx.working_dir(src)
}

impl Scm for SvnScm {
  fn source_id(&self, ctx: &Context, src: &Source, set: SourceSet) -> Result<String, ScmError> {
    let (location, _, _) = svn_attrs(src);
    let set = set.resolve("");
    if set == SourceSet::WorkingCopy {
      return Ok(WORKING_COPY_ID.to_string());
    }

    let dir = select_dir(src, set);
    let url = format!("{}/{}", repo_url(ctx, src)?, dir);
    let revision = run_tool(None, "svn", &["info", "--show-item", "last-changed-revision", &url])?;

    let mut hasher = Hasher::new();
    hasher.append(&src.name).append("svn").append(ident::environment_id(&src.env));
    for licence_id in ident::sorted_licence_ids(ctx, &src.licences)? {
      hasher.append(licence_id);
    }
    hasher
      .append(&src.server)
      .append(location)
      .append(dir)
      .append(&revision);
    Ok(hasher.finish())
  }

  fn fetch(&self, ctx: &Context, src: &Source) -> Result<(), ScmError> {
    let wc = work_tree(ctx, src);
    if wc.join(".svn").exists() {
      debug!(source = %src.name, "working copy already present");
      return Ok(());
    }
    let url = repo_url(ctx, src)?;
    info!(source = %src.name, url = %url, "checking out");
    if let Some(parent) = wc.parent() {
      std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    run_tool(None, "svn", &["checkout", "--quiet", &url, &wc.to_string_lossy()])?;
    Ok(())
  }

  fn update(&self, ctx: &Context, src: &Source) -> Result<(), ScmError> {
    let wc = work_tree(ctx, src);
    if !wc.join(".svn").exists() {
      return Err(ScmError::WorkingCopyMissing {
        name: src.name.clone(),
        path: wc,
      });
    }
    run_tool(Some(&wc), "svn", &["update", "--quiet"])?;
    Ok(())
  }

  fn prepare(&self, ctx: &Context, src: &Source, set: SourceSet, build_path: &Path) -> Result<(), ScmError> {
    let set = set.resolve("");
    let dest = build_path.join(&src.name);

    if set == SourceSet::WorkingCopy {
      let wc = work_tree(ctx, src);
      if !wc.join(".svn").exists() {
        return Err(ScmError::WorkingCopyMissing {
          name: src.name.clone(),
          path: wc,
        });
      }
      return copy_tree(&wc, &dest, &[".svn"]);
    }

    let dir = select_dir(src, set);
    let url = format!("{}/{}", repo_url(ctx, src)?, dir);
    run_tool(None, "svn", &["export", "--quiet", &url, &dest.to_string_lossy()])?;
    Ok(())
  }

  fn working_copy_available(&self, ctx: &Context, src: &Source) -> bool {
    work_tree(ctx, src).join(".svn").exists()
  }

  fn has_working_copy(&self, _src: &Source) -> bool {
    true
  }

  fn check_working_copy(&self, ctx: &Context, src: &Source) -> Result<(), ScmError> {
    let wc = work_tree(ctx, src);
    if !wc.join(".svn").exists() {
      return Err(ScmError::WorkingCopyMissing {
        name: src.name.clone(),
        path: wc,
      });
    }
    if !tool_succeeds(Some(&wc), "svn", &["info", "--show-item", "url"])? {
      return Err(ScmError::WorkingCopyMissing {
        name: src.name.clone(),
        path: wc,
      });
    }
    Ok(())
  }

  fn display(&self, src: &Source) -> String {
    let (location, branchdir, tagdir) = svn_attrs(src);
    format!(
      "svn {}:{} [branchdir {}, tagdir {}]",
      src.server, location, branchdir, tagdir
    )
  }
}
