//! Implementation of the `e2build build` command.

use std::path::Path;

use anyhow::Result;
use clap::{ArgGroup, Args};
use owo_colors::OwoColorize;

use e2build_lib::error::{EXIT_FAILURE, EXIT_INTERRUPT, EXIT_OK};
use e2build_lib::pipeline::{Pipeline, PipelineOptions, Status};
use e2build_lib::project::{BuildMode, WORKING_COPY_ID};

use super::make_context;

#[derive(Args)]
#[command(group = ArgGroup::new("mode").args(["tag_mode", "branch_mode", "wc_mode", "release"]))]
pub struct BuildArgs {
  /// Results to build (default results of the project when empty)
  pub results: Vec<String>,

  /// Build every result of the project
  #[arg(long)]
  pub all: bool,

  /// Build from tagged revisions (the default)
  #[arg(long)]
  pub tag_mode: bool,

  /// Build from branch heads
  #[arg(long)]
  pub branch_mode: bool,

  /// Build from working copies; never cached
  #[arg(long)]
  pub wc_mode: bool,

  /// Release build: tagged revisions, signed, deployed
  #[arg(long)]
  pub release: bool,

  /// Rebuild even when the artifact is already in the store
  #[arg(long)]
  pub force_rebuild: bool,

  /// Keep the build root after the build
  #[arg(long)]
  pub keep_chroot: bool,

  /// Stop after preparing the build root and leave it in place
  #[arg(long)]
  pub playground: bool,

  /// Number of results to build concurrently
  #[arg(long, short, default_value_t = 1)]
  pub jobs: usize,

  /// Do not verify tags against the remote repository
  #[arg(long)]
  pub no_check_remote: bool,

  /// Disable writeback for a server for this run
  #[arg(long, value_name = "SERVER")]
  pub disable_writeback: Vec<String>,

  /// Enable writeback for a server for this run
  #[arg(long, value_name = "SERVER")]
  pub enable_writeback: Vec<String>,
}

impl BuildArgs {
  fn mode(&self) -> BuildMode {
    if self.release {
      BuildMode::release()
    } else if self.branch_mode {
      BuildMode::branch()
    } else if self.wc_mode {
      BuildMode::working_copy()
    } else {
      BuildMode::tag()
    }
  }
}

pub fn cmd_build(root: &Path, args: BuildArgs) -> Result<u8> {
  let ctx = make_context(
    root,
    !args.no_check_remote,
    &args.disable_writeback,
    &args.enable_writeback,
  )?;

  let options = PipelineOptions {
    mode: args.mode(),
    force_rebuild: args.force_rebuild,
    keep_chroot: args.keep_chroot,
    playground: args.playground,
    jobs: args.jobs,
  };
  let pipeline = Pipeline::new(&ctx, options)?;
  let selection = pipeline.select(&args.results, args.all)?;

  println!(
    "{} {} result(s) in {} mode",
    "Building".green().bold(),
    selection.order.len(),
    args.mode().name
  );
  let report = pipeline.run(&selection)?;

  for name in &report.order {
    let state = &report.states[name];
    let id = if state.build_id == WORKING_COPY_ID {
      state.build_id.clone()
    } else {
      state.build_id[..12].to_string()
    };
    let status = match &state.status {
      Status::Done => format!("{}", "built".green()),
      Status::Skipped => format!("{}", "cached".cyan()),
      Status::Prepared => format!("{}", "prepared".cyan()),
      Status::New => format!("{}", "not needed".dimmed()),
      Status::Failed(reason) => format!("{}: {}", "failed".red().bold(), reason),
      other => format!("{other:?}"),
    };
    println!("  {id}  {name}  {status}");
  }

  if report.interrupted() {
    eprintln!("{}", "Interrupted.".red().bold());
    return Ok(EXIT_INTERRUPT);
  }
  if !report.success() {
    for (name, reason) in report.failures() {
      eprintln!("{}: {}", name.red(), reason);
    }
    eprintln!("{}", "Build failed.".red().bold());
    return Ok(EXIT_FAILURE);
  }
  println!("{}", "Build complete.".green().bold());
  Ok(EXIT_OK)
}
