//! Implementation of the `e2build dsort` command.

use std::path::Path;

use anyhow::Result;

use e2build_lib::context::EnvVars;
use e2build_lib::dag::DepGraph;

use super::load_validated;

/// Print every result in dependency order, one per line.
pub fn cmd_dsort(root: &Path) -> Result<()> {
  let env = EnvVars::from_env()?;
  let project = load_validated(root, &env)?;
  let dag = DepGraph::from_project(&project)?;
  for name in dag.dsort() {
    println!("{name}");
  }
  Ok(())
}
