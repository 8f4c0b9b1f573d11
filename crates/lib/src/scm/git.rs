//! The git plug-in.
//!
//! Identity work always goes through explicit refs (`refs/heads/<b>`,
//! `refs/tags/<t>`), never through symbolic `HEAD`, and only structured
//! one-line tool outputs are parsed.

use std::path::{Path, PathBuf};

use tracing::{debug, info};
use url::Url;

use e2build_core::location::remove_trailing_slashes;
use e2build_core::Hasher;

use crate::context::Context;
use crate::ident;
use crate::project::{Source, SourceKind, SourceSet, WORKING_COPY_ID};
use crate::warn::WarnCategory;

use super::{copy_tree, io_err, run_tool, tool_output, tool_succeeds, Scm, ScmError};

pub struct GitScm;

fn git_attrs(src: &Source) -> (&str, &str, &str) {
  match &src.kind {
    SourceKind::Git { location, branch, tag } => (location, branch, tag),
    _ => unreachable!("git plug-in dispatched on a non-git source"),
  }
}

/// Project a server URL plus location onto the URL git speaks.
///
/// ssh-style schemes become `git+ssh`, `file` becomes a plain path,
/// `http(s)` and `git` pass through.
pub fn git_url(server_url: &str, location: &str) -> Result<String, ScmError> {
  let full = format!("{}/{}", remove_trailing_slashes(server_url), location);
  let url = Url::parse(&full).map_err(|_| ScmError::InvalidUrl {
    name: String::new(),
    url: full.clone(),
  })?;

  match url.scheme() {
    "ssh" | "scp" | "rsync+ssh" => {
      let host = url.host_str().ok_or(ScmError::InvalidUrl {
        name: String::new(),
        url: full.clone(),
      })?;
      let user = if url.username().is_empty() {
        String::new()
      } else {
        format!("{}@", url.username())
      };
      Ok(format!("git+ssh://{}{}{}", user, host, url.path()))
    }
    "file" => Ok(url.path().to_string()),
    "http" | "https" | "git" | "git+ssh" => Ok(full),
    _ => Err(ScmError::InvalidUrl {
      name: String::new(),
      url: full,
    }),
  }
}

fn repo_url(ctx: &Context, src: &Source) -> Result<String, ScmError> {
  let (location, _, _) = git_attrs(src);
  let server = ctx
    .project
    .servers
    .get(&src.server)
    .ok_or_else(|| ScmError::UnknownServer {
      name: src.name.clone(),
      server: src.server.clone(),
    })?;
  git_url(&server.url, location)
}

fn work_tree(ctx: &Context, src: &Source) -> PathBuf {
  ctx.working_dir(src)
}

fn require_work_tree(ctx: &Context, src: &Source) -> Result<PathBuf, ScmError> {
  let wc = work_tree(ctx, src);
  if wc.join(".git").exists() {
    Ok(wc)
  } else {
    Err(ScmError::WorkingCopyMissing {
      name: src.name.clone(),
      path: wc,
    })
  }
}

/// Resolve a fully qualified ref to the commit it points at.
fn rev_parse(src: &Source, wc: &Path, refname: &str) -> Result<String, ScmError> {
  let spec = format!("{}^{{commit}}", refname);
  run_tool(Some(wc), "git", &["rev-parse", "--verify", "--quiet", &spec]).map_err(|_| ScmError::RefNotFound {
    name: src.name.clone(),
    rev: refname.to_string(),
  })
}

/// Pick the peeled commit of a tag out of `git ls-remote` output.
///
/// The output is `<id>\t<ref>` pairs; an annotated tag additionally lists
/// the peeled `<ref>^{}` line, which wins.
pub(crate) fn parse_ls_remote(output: &str, tag: &str) -> Option<String> {
  let plain_ref = format!("refs/tags/{}", tag);
  let peeled_ref = format!("refs/tags/{}^{{}}", tag);

  let mut plain = None;
  let mut peeled = None;
  for line in output.lines() {
    let mut fields = line.split_whitespace();
    let (Some(id), Some(refname)) = (fields.next(), fields.next()) else {
      continue;
    };
    if refname == peeled_ref {
      peeled = Some(id.to_string());
    } else if refname == plain_ref {
      plain = Some(id.to_string());
    }
  }
  peeled.or(plain)
}

fn remote_tag_commit(src: &Source, url: &str, tag: &str) -> Result<String, ScmError> {
  let plain = format!("refs/tags/{}", tag);
  let peeled = format!("refs/tags/{}^{{}}", tag);
  let output = run_tool(None, "git", &["ls-remote", url, &plain, &peeled])?;
  parse_ls_remote(&output, tag).ok_or_else(|| ScmError::RefNotFound {
    name: src.name.clone(),
    rev: plain,
  })
}

/// The commit a source set binds, straight from the working copy refs.
fn resolve_commit(ctx: &Context, src: &Source, set: SourceSet) -> Result<String, ScmError> {
  let (_, branch, tag) = git_attrs(src);
  let wc = require_work_tree(ctx, src)?;

  match set {
    SourceSet::Tag => {
      let local = rev_parse(src, &wc, &format!("refs/tags/{}", tag))?;
      if ctx.check_remote {
        let url = repo_url(ctx, src)?;
        let remote = remote_tag_commit(src, &url, tag)?;
        if remote != local {
          return Err(ScmError::TagMismatch {
            name: src.name.clone(),
            tag: tag.to_string(),
            local,
            remote,
          });
        }
      }
      Ok(local)
    }
    SourceSet::Branch => rev_parse(src, &wc, &format!("refs/heads/{}", branch)),
    SourceSet::WorkingCopy | SourceSet::Lazytag => {
      unreachable!("callers resolve the source set before asking for a commit")
    }
  }
}

impl Scm for GitScm {
  fn source_id(&self, ctx: &Context, src: &Source, set: SourceSet) -> Result<String, ScmError> {
    let (location, _, tag) = git_attrs(src);
    let set = set.resolve(tag);
    if set == SourceSet::WorkingCopy {
      return Ok(WORKING_COPY_ID.to_string());
    }

    let commit = resolve_commit(ctx, src, set)?;

    let mut hasher = Hasher::new();
    hasher.append(&src.name).append("git").append(ident::environment_id(&src.env));
    for licence_id in ident::sorted_licence_ids(ctx, &src.licences)? {
      hasher.append(licence_id);
    }
    hasher
      .append(&src.server)
      .append(location)
      .append(src.working.to_string_lossy().as_bytes())
      .append(&commit);
    Ok(hasher.finish())
  }

  fn fetch(&self, ctx: &Context, src: &Source) -> Result<(), ScmError> {
    let wc = work_tree(ctx, src);
    if wc.join(".git").exists() {
      debug!(source = %src.name, "working copy already present");
      return Ok(());
    }
    let url = repo_url(ctx, src)?;
    info!(source = %src.name, url = %url, "cloning");
    if let Some(parent) = wc.parent() {
      std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    run_tool(None, "git", &["clone", "--quiet", &url, &wc.to_string_lossy()])?;
    Ok(())
  }

  fn update(&self, ctx: &Context, src: &Source) -> Result<(), ScmError> {
    let (_, branch, _) = git_attrs(src);
    let wc = require_work_tree(ctx, src)?;

    // One fetch covers heads and tags.
    run_tool(Some(&wc), "git", &["fetch", "--quiet", "--tags", "origin"])?;

    let head = tool_output(Some(&wc), "git", &["symbolic-ref", "--quiet", "HEAD"])?;
    if !head.status.success() {
      ctx.warnings.warn(
        WarnCategory::Other,
        &format!("source {}: detached HEAD, skipping merge", src.name),
      );
      return Ok(());
    }
    let head_ref = String::from_utf8_lossy(&head.stdout).trim().to_string();
    let current = head_ref.strip_prefix("refs/heads/").unwrap_or(&head_ref);
    if current != branch {
      ctx.warnings.warn(
        WarnCategory::Other,
        &format!(
          "source {}: working copy is on branch {current}, not {branch}, skipping merge",
          src.name
        ),
      );
      return Ok(());
    }

    let remote = tool_output(Some(&wc), "git", &["config", &format!("branch.{}.remote", branch)])?;
    if !remote.status.success() {
      ctx.warnings.warn(
        WarnCategory::Other,
        &format!("source {}: no remote configured for branch {branch}, skipping merge", src.name),
      );
      return Ok(());
    }

    run_tool(
      Some(&wc),
      "git",
      &["merge", "--quiet", "--ff-only", &format!("origin/{}", branch)],
    )?;
    Ok(())
  }

  fn prepare(&self, ctx: &Context, src: &Source, set: SourceSet, build_path: &Path) -> Result<(), ScmError> {
    let (_, _, tag) = git_attrs(src);
    let set = set.resolve(tag);
    let dest = build_path.join(&src.name);

    if set == SourceSet::WorkingCopy {
      let wc = require_work_tree(ctx, src)?;
      return copy_tree(&wc, &dest, &[".git"]);
    }

    let wc = require_work_tree(ctx, src)?;
    let commit = resolve_commit(ctx, src, set)?;
    debug!(source = %src.name, commit = %commit, "exporting via git archive");

    let output = tool_output(Some(&wc), "git", &["archive", "--format=tar", &commit])?;
    if !output.status.success() {
      return Err(ScmError::Tool {
        tool: "git".to_string(),
        args: vec!["archive".to_string(), commit],
        status: output.status.to_string(),
      });
    }
    std::fs::create_dir_all(&dest).map_err(|e| io_err(&dest, e))?;
    tar::Archive::new(output.stdout.as_slice())
      .unpack(&dest)
      .map_err(|e| io_err(&dest, e))?;
    Ok(())
  }

  fn working_copy_available(&self, ctx: &Context, src: &Source) -> bool {
    work_tree(ctx, src).join(".git").exists()
  }

  fn has_working_copy(&self, _src: &Source) -> bool {
    true
  }

  fn check_working_copy(&self, ctx: &Context, src: &Source) -> Result<(), ScmError> {
    let (_, branch, _) = git_attrs(src);
    let wc = require_work_tree(ctx, src)?;

    if !tool_succeeds(
      Some(&wc),
      "git",
      &["show-ref", "--verify", "--quiet", &format!("refs/heads/{}", branch)],
    )? {
      return Err(ScmError::BranchMissing {
        name: src.name.clone(),
        branch: branch.to_string(),
      });
    }

    let remote = tool_output(Some(&wc), "git", &["config", &format!("branch.{}.remote", branch)])?;
    if !remote.status.success() {
      return Err(ScmError::NoRemote {
        name: src.name.clone(),
        branch: branch.to_string(),
      });
    }
    let remote = String::from_utf8_lossy(&remote.stdout).trim().to_string();
    if remote != "origin" {
      return Err(ScmError::RemoteMismatch {
        name: src.name.clone(),
        expected: "origin".to_string(),
        actual: remote,
      });
    }

    let configured = run_tool(Some(&wc), "git", &["config", "remote.origin.url"])?;
    let expected = repo_url(ctx, src)?;
    if remove_trailing_slashes(&configured) != remove_trailing_slashes(&expected) {
      return Err(ScmError::RemoteMismatch {
        name: src.name.clone(),
        expected,
        actual: configured,
      });
    }
    Ok(())
  }

  fn display(&self, src: &Source) -> String {
    let (location, branch, tag) = git_attrs(src);
    format!("git {}:{} [branch {}, tag {}]", src.server, location, branch, tag)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ssh_like_schemes_project_to_git_ssh() {
    assert_eq!(
      git_url("ssh://host/base", "proj.git").unwrap(),
      "git+ssh://host/base/proj.git"
    );
    assert_eq!(
      git_url("rsync+ssh://user@host/base/", "proj.git").unwrap(),
      "git+ssh://user@host/base/proj.git"
    );
    assert_eq!(
      git_url("scp://host/base", "proj.git").unwrap(),
      "git+ssh://host/base/proj.git"
    );
  }

  #[test]
  fn file_scheme_projects_to_plain_path() {
    assert_eq!(git_url("file:///srv/git", "proj.git").unwrap(), "/srv/git/proj.git");
  }

  #[test]
  fn http_and_git_pass_through() {
    assert_eq!(
      git_url("https://host/base", "proj.git").unwrap(),
      "https://host/base/proj.git"
    );
    assert_eq!(git_url("git://host/base", "proj.git").unwrap(), "git://host/base/proj.git");
  }

  #[test]
  fn ls_remote_prefers_the_peeled_tag() {
    let output = "\
abcd000000000000000000000000000000000000\trefs/tags/v1\n\
ef01000000000000000000000000000000000000\trefs/tags/v1^{}\n";
    assert_eq!(
      parse_ls_remote(output, "v1").unwrap(),
      "ef01000000000000000000000000000000000000"
    );
  }

  #[test]
  fn ls_remote_falls_back_to_the_plain_tag() {
    let output = "abcd000000000000000000000000000000000000\trefs/tags/v1\n";
    assert_eq!(
      parse_ls_remote(output, "v1").unwrap(),
      "abcd000000000000000000000000000000000000"
    );
  }

  #[test]
  fn ls_remote_misses_unknown_tags() {
    let output = "abcd000000000000000000000000000000000000\trefs/tags/v2\n";
    assert_eq!(parse_ls_remote(output, "v1"), None);
  }

  mod fixture_tests {
    use crate::ident;
    use crate::project::testutil::{add_git_source, fixture_context, git, write_project_skeleton};
    use crate::project::{SourceSet, WORKING_COPY_ID};
    use crate::scm::{GitScm, Scm, ScmError};
    use tempfile::TempDir;

    #[test]
    fn tag_and_branch_sets_bind_the_same_commit_here() {
      let dir = TempDir::new().unwrap();
      write_project_skeleton(dir.path());
      add_git_source(dir.path(), "gs");
      let ctx = fixture_context(dir.path());
      let src = ctx.project.sources.get("gs").unwrap();

      let by_tag = GitScm.source_id(&ctx, src, SourceSet::Tag).unwrap();
      let by_branch = GitScm.source_id(&ctx, src, SourceSet::Branch).unwrap();
      assert_eq!(by_tag, by_branch);
      assert_ne!(by_tag, WORKING_COPY_ID);
    }

    #[test]
    fn a_moved_branch_changes_the_sourceid() {
      let dir = TempDir::new().unwrap();
      write_project_skeleton(dir.path());
      add_git_source(dir.path(), "gs");

      let before = {
        let ctx = fixture_context(dir.path());
        let src = ctx.project.sources.get("gs").unwrap();
        GitScm.source_id(&ctx, src, SourceSet::Branch).unwrap()
      };

      let wc = dir.path().join("in/gs");
      std::fs::write(wc.join("extra.c"), "int y;\n").unwrap();
      git(&wc, &["add", "extra.c"]);
      git(&wc, &["commit", "--quiet", "-m", "more"]);

      let ctx = fixture_context(dir.path());
      let src = ctx.project.sources.get("gs").unwrap();
      let after = GitScm.source_id(&ctx, src, SourceSet::Branch).unwrap();
      assert_ne!(before, after);
      // The tag did not move.
      assert_ne!(after, GitScm.source_id(&ctx, src, SourceSet::Tag).unwrap());
    }

    #[test]
    fn check_remote_detects_a_diverged_tag() {
      let dir = TempDir::new().unwrap();
      write_project_skeleton(dir.path());
      add_git_source(dir.path(), "gs");

      // A "remote" under the upstream server whose v1 points elsewhere.
      let remote = dir.path().join("servers/upstream/gs.git");
      git(
        dir.path(),
        &[
          "clone",
          "--quiet",
          &dir.path().join("in/gs").to_string_lossy(),
          &remote.to_string_lossy(),
        ],
      );
      git(&remote, &["config", "user.email", "tester@example.com"]);
      git(&remote, &["config", "user.name", "Tester"]);
      git(&remote, &["tag", "-d", "v1"]);
      std::fs::write(remote.join("divergent.c"), "int z;\n").unwrap();
      git(&remote, &["add", "divergent.c"]);
      git(&remote, &["commit", "--quiet", "-m", "diverge"]);
      git(&remote, &["tag", "v1"]);

      let mut ctx = fixture_context(dir.path());
      ctx.check_remote = true;
      {
        let src = ctx.project.sources.get("gs").unwrap();
        let err = GitScm.source_id(&ctx, src, SourceSet::Tag).unwrap_err();
        assert!(matches!(err, ScmError::TagMismatch { .. }), "got {err:?}");
      }

      // Without the remote check the local tag wins.
      ctx.check_remote = false;
      let src = ctx.project.sources.get("gs").unwrap();
      assert!(GitScm.source_id(&ctx, src, SourceSet::Tag).is_ok());
    }

    #[test]
    fn prepare_exports_the_tagged_tree_without_git_metadata() {
      let dir = TempDir::new().unwrap();
      write_project_skeleton(dir.path());
      add_git_source(dir.path(), "gs");
      let ctx = fixture_context(dir.path());
      let src = ctx.project.sources.get("gs").unwrap();

      let build_path = dir.path().join("buildtree");
      GitScm.prepare(&ctx, src, SourceSet::Tag, &build_path).unwrap();
      assert!(build_path.join("gs/main.c").exists());
      assert!(!build_path.join("gs/.git").exists());
    }

    #[test]
    fn prepare_working_copy_excludes_dot_git() {
      let dir = TempDir::new().unwrap();
      write_project_skeleton(dir.path());
      add_git_source(dir.path(), "gs");
      // An uncommitted change is part of the working copy export.
      std::fs::write(dir.path().join("in/gs/wip.c"), "int wip;\n").unwrap();

      let ctx = fixture_context(dir.path());
      let src = ctx.project.sources.get("gs").unwrap();

      let build_path = dir.path().join("buildtree");
      GitScm.prepare(&ctx, src, SourceSet::WorkingCopy, &build_path).unwrap();
      assert!(build_path.join("gs/main.c").exists());
      assert!(build_path.join("gs/wip.c").exists());
      assert!(!build_path.join("gs/.git").exists());
    }

    #[test]
    fn check_working_copy_wants_origin_and_the_canonical_url() {
      let dir = TempDir::new().unwrap();
      write_project_skeleton(dir.path());
      add_git_source(dir.path(), "gs");

      // Turn the fixture into a proper clone of the configured location.
      let origin = dir.path().join("servers/upstream/gs.git");
      git(
        dir.path(),
        &[
          "clone",
          "--quiet",
          &dir.path().join("in/gs").to_string_lossy(),
          &origin.to_string_lossy(),
        ],
      );
      std::fs::remove_dir_all(dir.path().join("in/gs")).unwrap();
      git(
        dir.path(),
        &[
          "clone",
          "--quiet",
          &origin.to_string_lossy(),
          &dir.path().join("in/gs").to_string_lossy(),
        ],
      );

      let ctx = fixture_context(dir.path());
      let src = ctx.project.sources.get("gs").unwrap();
      GitScm.check_working_copy(&ctx, src).unwrap();

      // A rewritten origin URL no longer matches.
      let wc = dir.path().join("in/gs");
      git(&wc, &["remote", "set-url", "origin", "https://example.com/elsewhere.git"]);
      let err = GitScm.check_working_copy(&ctx, src).unwrap_err();
      assert!(matches!(err, ScmError::RemoteMismatch { .. }), "got {err:?}");
    }

    #[test]
    fn update_skips_a_detached_head_with_a_warning() {
      let dir = TempDir::new().unwrap();
      write_project_skeleton(dir.path());
      add_git_source(dir.path(), "gs");
      let wc = dir.path().join("in/gs");
      // Detach, but keep a remote so the fetch has somewhere to go.
      let origin = dir.path().join("servers/upstream/gs.git");
      git(
        dir.path(),
        &["clone", "--quiet", "--bare", &wc.to_string_lossy(), &origin.to_string_lossy()],
      );
      git(&wc, &["remote", "add", "origin", &origin.to_string_lossy()]);
      let head = git(&wc, &["rev-parse", "HEAD"]);
      git(&wc, &["checkout", "--quiet", &head]);

      let ctx = fixture_context(dir.path());
      let src = ctx.project.sources.get("gs").unwrap();
      // Skipped, not failed.
      GitScm.update(&ctx, src).unwrap();
    }

    #[test]
    fn missing_working_copy_is_reported() {
      let dir = TempDir::new().unwrap();
      write_project_skeleton(dir.path());
      add_git_source(dir.path(), "gs");
      std::fs::remove_dir_all(dir.path().join("in/gs")).unwrap();

      let ctx = fixture_context(dir.path());
      let src = ctx.project.sources.get("gs").unwrap();
      let err = ident::source_id(&ctx, "gs", SourceSet::Tag).unwrap_err();
      let rendered = crate::error::format_chain(&err);
      assert!(rendered.contains("working copy"), "chain was: {rendered}");
      assert!(GitScm.source_id(&ctx, src, SourceSet::WorkingCopy).is_ok());
    }
  }
}
