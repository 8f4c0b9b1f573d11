pub mod build;
pub mod dsort;
pub mod fetch;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};

use e2build_lib::cache::CacheSetup;
use e2build_lib::context::{Context, ContextOptions, EnvVars};
use e2build_lib::project::load::load_project;
use e2build_lib::project::validate::validate;
use e2build_lib::project::Project;
use e2build_lib::transport::StdTransport;

/// Load and validate the project at `root`.
pub fn load_validated(root: &Path, env: &EnvVars) -> Result<Project> {
  let project = load_project(root, env).context("loading the project failed")?;
  validate(&project).context("the project model is invalid")?;
  Ok(project)
}

/// Assemble the full run context: project, cache, environment.
///
/// Writeback toggles requested on the command line are queued into the
/// cache setup and applied at initialization.
pub fn make_context(
  root: &Path,
  check_remote: bool,
  disable_writeback: &[String],
  enable_writeback: &[String],
) -> Result<Context> {
  let env = EnvVars::from_env()?;
  let project = load_validated(root, &env)?;

  let mut setup = CacheSetup::new(format!("file://{}/.e2build/cache/%u", env.home.display()));
  for server in disable_writeback {
    setup.queue_writeback(server, false);
  }
  for server in enable_writeback {
    setup.queue_writeback(server, true);
  }
  let transport = Arc::new(StdTransport::new(env.e2_ssh.clone()));
  let cache = setup
    .build(&project.servers, transport)
    .context("cache initialization failed")?;

  let options = ContextOptions {
    check_remote,
    su_helper: None,
  };
  Ok(Context::new(project, cache, env, options)?)
}
