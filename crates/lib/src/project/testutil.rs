//! Test fixtures: a small but complete on-disk project.
//!
//! The skeleton carries one files source, one licence, one chroot group
//! (a real tar.gz archive) and a two-result dependency chain, all served
//! from `file://` servers inside the fixture root, so tests run without
//! network access or privileges.

use std::path::{Path, PathBuf};

use e2build_core::hash::hash_file;

use crate::archive::create_tar_gz;
use crate::context::EnvVars;

fn write(path: PathBuf, content: &str) {
  std::fs::create_dir_all(path.parent().unwrap()).unwrap();
  std::fs::write(path, content).unwrap();
}

/// Load, validate and wrap the fixture project into a run context. The
/// cache mirror lives under `<root>/cache/<server>`.
pub fn fixture_context(root: &Path) -> crate::context::Context {
  let project = crate::project::load::load_project(root, &minimal_env_vars()).unwrap();
  crate::project::validate::validate(&project).unwrap();
  let cache = crate::cache::CacheSetup::new(format!("file://{}/cache/%u", root.display()))
    .build(&project.servers, std::sync::Arc::new(crate::transport::StdTransport::default()))
    .unwrap();
  crate::context::Context::new(project, cache, minimal_env_vars(), Default::default()).unwrap()
}

/// Run git in `dir`, asserting success.
pub fn git(dir: &Path, args: &[&str]) -> String {
  let output = std::process::Command::new("git")
    .args(args)
    .current_dir(dir)
    .output()
    .expect("git not runnable");
  assert!(
    output.status.success(),
    "git {:?} failed: {}",
    args,
    String::from_utf8_lossy(&output.stderr)
  );
  String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Create a git working copy at `in/<name>` below the project root, with
/// one commit on `master` tagged `v1`. Also writes a matching source
/// config and a result `<name>-res` using it. Returns the commit id.
pub fn add_git_source(root: &Path, name: &str) -> String {
  let wc = root.join("in").join(name);
  std::fs::create_dir_all(&wc).unwrap();
  git(&wc, &["init", "--quiet", "-b", "master"]);
  git(&wc, &["config", "user.email", "tester@example.com"]);
  git(&wc, &["config", "user.name", "Tester"]);
  std::fs::write(wc.join("main.c"), "int main(void) { return 0; }\n").unwrap();
  git(&wc, &["add", "main.c"]);
  git(&wc, &["commit", "--quiet", "-m", "initial"]);
  git(&wc, &["tag", "v1"]);
  let commit = git(&wc, &["rev-parse", "HEAD"]);

  write(
    root.join(format!("src/{name}/config")),
    &format!(
      "e2source {{\n  type = \"git\",\n  server = \"upstream\",\n  location = \"{name}.git\",\n  branch = \"master\",\n  tag = \"v1\",\n}}\n",
    ),
  );
  write(
    root.join(format!("res/{name}-res/config")),
    &format!("e2result {{\n  sources = {{ \"{name}\" }},\n  chroot = {{ \"base\" }},\n}}\n"),
  );
  write(
    root.join(format!("res/{name}-res/build-script")),
    "#!/bin/sh\nset -e\ncp \"$E2_BUILD\"/*/main.c \"$E2_OUT/\"\n",
  );
  commit
}

/// Environment variables sufficient for loading and running a fixture
/// project.
pub fn minimal_env_vars() -> EnvVars {
  EnvVars {
    home: PathBuf::from("/home/tester"),
    user: "tester".to_string(),
    tmpdir: None,
    e2_tmpdir: None,
    e2_config: None,
    e2_ssh: None,
    local_branch: None,
    local_tag: None,
    columns: None,
  }
}

/// Populate `root` with a loadable project. Declared sha1 values are
/// computed from the fixture files themselves.
pub fn write_project_skeleton(root: &Path) {
  let upstream = root.join("servers/upstream");
  std::fs::create_dir_all(&upstream).unwrap();
  std::fs::create_dir_all(root.join("servers/results")).unwrap();

  // Upstream payload files.
  write(upstream.join("base.txt"), "hello base\n");
  write(upstream.join("COPYING.MIT"), "permission is hereby granted\n");
  let base_sha1 = hash_file(&upstream.join("base.txt")).unwrap();
  let licence_sha1 = hash_file(&upstream.join("COPYING.MIT")).unwrap();

  // A real chroot archive with a marker file inside.
  let stage = root.join("stage-chroot");
  write(stage.join("etc/os-release"), "NAME=fixture\n");
  create_tar_gz(&stage, &upstream.join("chroot-base.tar.gz")).unwrap();
  std::fs::remove_dir_all(&stage).unwrap();
  let chroot_sha1 = hash_file(&upstream.join("chroot-base.tar.gz")).unwrap();

  write(root.join(".e2/e2version"), "master v1\n");
  write(
    root.join(".e2/e2config"),
    "e2config {\n  name = \"demo\",\n  default_results = { \"app\" },\n  result_server = \"results\",\n}\n",
  );

  write(
    root.join("proj/servers.lua"),
    &format!(
      "e2server {{\n  name = \"upstream\",\n  url = \"file://{upstream}\",\n  cachable = true,\n}}\n\
       e2server {{\n  name = \"results\",\n  url = \"file://{results}\",\n  writeback = true,\n  push_permissions = \"ug+rw\",\n}}\n",
      upstream = upstream.display(),
      results = root.join("servers/results").display(),
    ),
  );
  write(root.join("proj/env.lua"), "e2env { PROJECT_FLAG = \"on\" }\n");

  write(
    root.join("src/base/config"),
    &format!(
      "e2source {{\n  type = \"files\",\n  licences = {{ \"mit\" }},\n  file = {{\n    {{ server = \"upstream\", location = \"base.txt\", sha1 = \"{base_sha1}\" }},\n  }},\n}}\n",
    ),
  );

  write(
    root.join("licences/mit/config"),
    &format!(
      "e2licence {{\n  server = \"upstream\",\n  files = {{\n    {{ location = \"COPYING.MIT\", sha1 = \"{licence_sha1}\" }},\n  }},\n}}\n",
    ),
  );

  write(
    root.join("chroot/base/config"),
    &format!(
      "e2chroot {{\n  server = \"upstream\",\n  files = {{\n    {{ location = \"chroot-base.tar.gz\", sha1 = \"{chroot_sha1}\" }},\n  }},\n}}\n",
    ),
  );

  write(
    root.join("res/core/config"),
    "e2result {\n  sources = { \"base\" },\n  chroot = { \"base\" },\n  env = { RES = \"core\" },\n}\n",
  );
  write(
    root.join("res/core/build-script"),
    "#!/bin/sh\nset -e\necho \"$E2_RESULT\" > \"$E2_OUT/built.txt\"\n",
  );

  write(
    root.join("res/app/config"),
    "e2result {\n  sources = {},\n  depends = { \"core\" },\n  chroot = { \"base\" },\n}\n",
  );
  write(
    root.join("res/app/build-script"),
    "#!/bin/sh\nset -e\necho \"app built with $PROJECT_FLAG\" > \"$E2_OUT/built.txt\"\n",
  );
}
