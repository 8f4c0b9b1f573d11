//! Implementation of the `e2build fetch-sources` command.

use std::path::Path;

use anyhow::{Context as _, Result};
use owo_colors::OwoColorize;

use e2build_lib::scm::scm_for;

use super::make_context;

/// Fetch every source of the project; with `update` set, also merge
/// upstream changes into existing working copies.
pub fn cmd_fetch_sources(root: &Path, update: bool) -> Result<()> {
  let ctx = make_context(root, false, &[], &[])?;

  for (name, source) in &ctx.project.sources {
    let scm = scm_for(&source.kind);
    if scm.working_copy_available(&ctx, source) {
      println!("  {} {}", "present".dimmed(), scm.display(source));
    } else {
      println!("  {} {}", "fetching".green(), scm.display(source));
      scm
        .fetch(&ctx, source)
        .with_context(|| format!("fetching source {name} failed"))?;
    }
    if update && scm.has_working_copy(source) {
      println!("  {} {}", "updating".cyan(), name);
      scm
        .update(&ctx, source)
        .with_context(|| format!("updating source {name} failed"))?;
    }
  }
  Ok(())
}
