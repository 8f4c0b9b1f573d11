//! e2build: command-line front-end.
//!
//! Subcommands:
//! - `e2build build [RESULT...]` - drive results to artifacts
//! - `e2build dsort` - print the full topological result order
//! - `e2build fetch-sources` - make all sources available locally

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use e2build_lib::context::{install_interrupt_handler, interrupted};
use e2build_lib::error::{format_chain, InternalError, EXIT_FAILURE, EXIT_INTERNAL, EXIT_INTERRUPT, EXIT_OK};
use e2build_lib::project::load::find_project_root;

mod cmd;

#[derive(Parser)]
#[command(name = "e2build", version, about = "Reproducible embedded-systems build tool")]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Project root (discovered from the working directory by default)
  #[arg(long, global = true, value_name = "DIR")]
  project: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build results into stored artifacts
  Build(cmd::build::BuildArgs),

  /// Print all results in dependency order
  Dsort,

  /// Fetch (and optionally update) all sources
  FetchSources {
    /// Also merge upstream changes into existing working copies
    #[arg(long)]
    update: bool,
  },
}

fn main() -> ExitCode {
  let cli = Cli::parse();

  let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
  FmtSubscriber::builder()
    .with_max_level(level)
    .with_target(false)
    .without_time()
    .with_writer(std::io::stderr)
    .init();

  match run(cli) {
    Ok(code) => ExitCode::from(code),
    Err(err) => {
      eprintln!("{}", format_chain(err.as_ref()));
      if interrupted() {
        ExitCode::from(EXIT_INTERRUPT)
      } else if err.chain().any(|cause| cause.is::<InternalError>()) {
        ExitCode::from(EXIT_INTERNAL)
      } else {
        ExitCode::from(EXIT_FAILURE)
      }
    }
  }
}

fn run(cli: Cli) -> Result<u8> {
  install_interrupt_handler()?;

  let root = match cli.project {
    Some(root) => root,
    None => {
      let cwd = std::env::current_dir()?;
      find_project_root(&cwd).ok_or_else(|| anyhow!("not inside an e2build project (no .e2 directory found)"))?
    }
  };

  match cli.command {
    Commands::Build(args) => cmd::build::cmd_build(&root, args),
    Commands::Dsort => cmd::dsort::cmd_dsort(&root).map(|()| EXIT_OK),
    Commands::FetchSources { update } => cmd::fetch::cmd_fetch_sources(&root, update).map(|()| EXIT_OK),
  }
}
