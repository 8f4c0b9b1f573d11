//! The build pipeline: the per-result state machine and its driver.
//!
//! ```text
//!         +-- skipped ---------------+
//!   new --+-- scheduled -- prepared --+-- built ----- stored --- done
//!         +-- failed (terminal)
//! ```
//!
//! Build-ids are computed in a pre-pass, so a result whose artifact is
//! already in the store is skipped together with the dependency subtree
//! that only existed to materialize it. Execution walks the topological
//! order; with more than one job configured, independent results of the
//! same dependency wave run on scoped threads. A failed result fails all
//! of its dependents.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;

use thiserror::Error;
use tracing::{debug, error, info};

use crate::chroot::{self, ChrootError, ChrootLock};
use crate::context::Context;
use crate::dag::{DagError, DepGraph};
use crate::error::{format_chain, InternalError};
use crate::ident::{self, IdentError};
use crate::project::{BuildMode, ResultDef, SourceSet, StorePolicy, WORKING_COPY_ID};
use crate::scm::{scm_for, ScmError};
use crate::store::{ResultStore, StoreError};

/// Why a result ended up in the `failed` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
  DependencyFailed(String),
  Interrupted,
  Script { status: i32 },
  Error(String),
}

impl fmt::Display for FailReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      FailReason::DependencyFailed(dep) => write!(f, "dependency {dep} failed"),
      FailReason::Interrupted => write!(f, "interrupted"),
      FailReason::Script { status } => write!(f, "build script failed with status {status}"),
      FailReason::Error(message) => f.write_str(message),
    }
  }
}

/// Result states. `Failed` is terminal; `Skipped`, `Prepared` (playground)
/// and `Done` are the successful terminals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
  New,
  Scheduled,
  Skipped,
  Prepared,
  Built,
  Stored,
  Done,
  Failed(FailReason),
}

impl Status {
  pub fn is_failed(&self) -> bool {
    matches!(self, Status::Failed(_))
  }
}

#[derive(Debug, Clone)]
pub struct ResultState {
  pub status: Status,
  pub build_id: String,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
  pub mode: BuildMode,
  pub force_rebuild: bool,
  pub keep_chroot: bool,
  pub playground: bool,
  pub jobs: usize,
}

impl Default for PipelineOptions {
  fn default() -> Self {
    Self {
      mode: BuildMode::default(),
      force_rebuild: false,
      keep_chroot: false,
      playground: false,
      jobs: 1,
    }
  }
}

#[derive(Debug, Error)]
pub enum PipelineError {
  #[error("--all cannot be combined with explicit result names")]
  AllWithNames,

  #[error("no results selected")]
  EmptySelection,

  #[error("working-copy mode requires explicitly selected results")]
  WcModeNeedsResults,

  #[error("playground mode needs exactly one selected result")]
  PlaygroundSelection,

  #[error("playground mode is not available with release builds")]
  PlaygroundRelease,

  #[error("release mode requires a tagged project version; the pseudo tag '^' is not releasable")]
  ReleaseGuard,

  #[error("i/o error on {path}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  Dag(#[from] DagError),

  #[error(transparent)]
  Ident(#[from] IdentError),

  #[error(transparent)]
  Chroot(#[from] ChrootError),

  #[error(transparent)]
  Scm(#[from] ScmError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("internal error")]
  Internal(#[from] InternalError),
}

fn io_err(path: &Path, source: io::Error) -> PipelineError {
  PipelineError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// A validated result selection: the requested seeds plus their ordered
/// dependency closure.
#[derive(Debug, Clone)]
pub struct Selection {
  pub seeds: Vec<String>,
  pub order: Vec<String>,
}

/// Outcome of a pipeline run.
#[derive(Debug)]
pub struct BuildReport {
  pub order: Vec<String>,
  pub states: BTreeMap<String, ResultState>,
}

impl BuildReport {
  pub fn success(&self) -> bool {
    self.states.values().all(|state| !state.status.is_failed())
  }

  pub fn interrupted(&self) -> bool {
    self
      .states
      .values()
      .any(|state| state.status == Status::Failed(FailReason::Interrupted))
  }

  pub fn failures(&self) -> Vec<(&str, &FailReason)> {
    self
      .states
      .iter()
      .filter_map(|(name, state)| match &state.status {
        Status::Failed(reason) => Some((name.as_str(), reason)),
        _ => None,
      })
      .collect()
  }
}

pub struct Pipeline<'c> {
  ctx: &'c Context,
  opts: PipelineOptions,
  dag: DepGraph,
}

impl<'c> Pipeline<'c> {
  pub fn new(ctx: &'c Context, opts: PipelineOptions) -> Result<Self, PipelineError> {
    if opts.mode.name == "release" {
      if ctx.project.info.is_pseudo_tag() {
        return Err(PipelineError::ReleaseGuard);
      }
      if opts.playground {
        return Err(PipelineError::PlaygroundRelease);
      }
    }
    let dag = DepGraph::from_project(&ctx.project)?;
    Ok(Self { ctx, opts, dag })
  }

  /// Resolve the requested results into an ordered dependency closure.
  pub fn select(&self, names: &[String], all: bool) -> Result<Selection, PipelineError> {
    if all && !names.is_empty() {
      return Err(PipelineError::AllWithNames);
    }

    let seeds: Vec<String> = if all {
      self.ctx.project.results.keys().cloned().collect()
    } else if !names.is_empty() {
      names.to_vec()
    } else {
      if self.opts.mode.source_set == SourceSet::WorkingCopy {
        return Err(PipelineError::WcModeNeedsResults);
      }
      self.ctx.project.info.default_results.clone()
    };

    if seeds.is_empty() {
      return Err(PipelineError::EmptySelection);
    }
    if self.opts.playground {
      if seeds.len() != 1 {
        return Err(PipelineError::PlaygroundSelection);
      }
      // The playground prepares the selected result only; nothing else
      // is scheduled.
      self.dag.dlist(&seeds[0])?;
      return Ok(Selection {
        order: seeds.clone(),
        seeds,
      });
    }

    let order = self.dag.dlist_recursive(&seeds)?;
    Ok(Selection { seeds, order })
  }

  /// Drive every selected result to a terminal state.
  pub fn run(&self, selection: &Selection) -> Result<BuildReport, PipelineError> {
    let set = self.opts.mode.source_set;
    let store = ResultStore::new(&self.ctx.cache, self.ctx.project.info.result_server.clone());

    // Pre-pass: buildids for the whole closure, dependencies first.
    let mut states: BTreeMap<String, ResultState> = BTreeMap::new();
    for name in &selection.order {
      let build_id = ident::build_id(self.ctx, name, set)?;
      states.insert(
        name.clone(),
        ResultState {
          status: Status::New,
          build_id,
        },
      );
    }

    // Plan from the seeds down: a store hit skips the result and leaves
    // its dependency subtree untouched.
    for seed in &selection.seeds {
      self.plan(seed, &mut states, &store)?;
    }

    let scheduled: BTreeSet<String> = states
      .iter()
      .filter(|(_, state)| state.status == Status::Scheduled)
      .map(|(name, _)| name.clone())
      .collect();

    for wave in self.dag.waves(&scheduled) {
      if self.ctx.interrupted() {
        info!("interrupt observed, not launching further results");
        for name in states
          .iter()
          .filter(|(_, state)| state.status == Status::Scheduled)
          .map(|(name, _)| name.clone())
          .collect::<Vec<_>>()
        {
          self.transition(&mut states, &name, Status::Failed(FailReason::Interrupted));
        }
        break;
      }

      // Results whose dependencies failed fail without running.
      let mut ready = Vec::new();
      for name in wave {
        let failed_dep = self
          .dag
          .dlist(&name)?
          .into_iter()
          .find(|dep| states.get(dep).map_or(false, |s| s.status.is_failed()));
        match failed_dep {
          Some(dep) => self.transition(&mut states, &name, Status::Failed(FailReason::DependencyFailed(dep))),
          None => ready.push(name),
        }
      }

      for chunk in ready.chunks(self.opts.jobs.max(1)) {
        let outcomes: Vec<(String, Status)> = if chunk.len() == 1 {
          let name = &chunk[0];
          vec![(name.clone(), self.build_one(name, &states[name].build_id, &store))]
        } else {
          thread::scope(|scope| {
            let handles: Vec<_> = chunk
              .iter()
              .map(|name| {
                let build_id = states[name].build_id.clone();
                let store = &store;
                scope.spawn(move || (name.clone(), self.build_one(name, &build_id, store)))
              })
              .collect();
            handles.into_iter().map(|h| h.join().expect("build thread panicked")).collect()
          })
        };
        for (name, status) in outcomes {
          self.transition(&mut states, &name, status);
        }
      }
    }

    let report = BuildReport {
      order: selection.order.clone(),
      states,
    };
    Ok(report)
  }

  fn transition(&self, states: &mut BTreeMap<String, ResultState>, name: &str, status: Status) {
    if let Some(state) = states.get_mut(name) {
      debug!(result = name, from = ?state.status, to = ?status, "state transition");
      state.status = status;
    }
  }

  fn plan(
    &self,
    name: &str,
    states: &mut BTreeMap<String, ResultState>,
    store: &ResultStore<'_>,
  ) -> Result<(), PipelineError> {
    match states.get(name).map(|state| state.status.clone()) {
      Some(Status::New) => {}
      Some(_) => return Ok(()),
      None => {
        return Err(
          InternalError(format!("planning {name}, which is outside the selected closure")).into(),
        );
      }
    }

    if self.opts.playground {
      // Prepared unconditionally, the store is not consulted.
      self.transition(states, name, Status::Scheduled);
      return Ok(());
    }

    let build_id = states[name].build_id.clone();
    let cachable = build_id != WORKING_COPY_ID && self.opts.mode.store != StorePolicy::Discard;
    if cachable && !self.opts.force_rebuild && store.contains(&build_id)? {
      info!(result = name, buildid = %build_id, "artifact present, skipping");
      self.transition(states, name, Status::Skipped);
      return Ok(());
    }

    self.transition(states, name, Status::Scheduled);
    for dep in self.dag.dlist(name)? {
      self.plan(&dep, states, store)?;
    }
    Ok(())
  }

  fn build_one(&self, name: &str, build_id: &str, store: &ResultStore<'_>) -> Status {
    match self.try_build(name, build_id, store) {
      Ok(status) => status,
      Err(err) => {
        error!(result = name, "build failed:\n{}", format_chain(&err));
        Status::Failed(FailReason::Error(format_chain(&err)))
      }
    }
  }

  fn try_build(&self, name: &str, build_id: &str, store: &ResultStore<'_>) -> Result<Status, PipelineError> {
    if self.ctx.interrupted() {
      return Ok(Status::Failed(FailReason::Interrupted));
    }

    let result = self
      .ctx
      .project
      .results
      .get(name)
      .ok_or_else(|| InternalError(format!("result {name} vanished from the model")))?;

    info!(result = name, buildid = %build_id, "building");
    let root = self.ctx.build_base.join(name);
    let lock = ChrootLock::acquire(&self.ctx.locks, &root)?;

    let outcome = self.build_in_root(result, build_id, store, &root);

    let keep_root = self.opts.keep_chroot || matches!(outcome, Ok(Status::Prepared));
    if !keep_root {
      if let Err(err) = chroot::remove(self.ctx, &root) {
        error!(result = name, "could not remove build root:\n{}", format_chain(&err));
      }
    }
    lock.release()?;

    // Releasing the root completes `built`/`stored` into `done`.
    match outcome {
      Ok(Status::Built) | Ok(Status::Stored) => Ok(Status::Done),
      other => other,
    }
  }

  fn source(&self, name: &str) -> Result<&crate::project::Source, PipelineError> {
    self
      .ctx
      .project
      .sources
      .get(name)
      .ok_or_else(|| InternalError(format!("source {name} vanished from the model")).into())
  }

  fn build_in_root(
    &self,
    result: &ResultDef,
    build_id: &str,
    store: &ResultStore<'_>,
    root: &Path,
  ) -> Result<Status, PipelineError> {
    chroot::setup(self.ctx, result, root)?;

    let work = root.join("tmp/e2build");
    let build_dir = work.join("build");
    let out_dir = work.join("out");
    let tmp_dir = work.join("tmp");
    for dir in [&build_dir, &out_dir, &tmp_dir] {
      std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }

    let set = self.opts.mode.source_set;

    // Sources: fetch everything first, then prepare everything, in
    // declared order. Working-copy builds verify the copies before use.
    for source_name in &result.sources {
      let source = self.source(source_name)?;
      let scm = scm_for(&source.kind);
      scm.fetch(self.ctx, source)?;
      if set == SourceSet::WorkingCopy && scm.has_working_copy(source) {
        scm.check_working_copy(self.ctx, source)?;
      }
    }
    for source_name in &result.sources {
      let source = self.source(source_name)?;
      scm_for(&source.kind).prepare(self.ctx, source, set, &build_dir)?;
    }

    // Collect-project results additionally stage every source of the
    // collected dependency closure as a stand-alone unit.
    if let Some(collect) = &result.collect {
      let project_dir = build_dir.join("project");
      for collected in self.dag.dlist_recursive(&[collect.default_result.clone()])? {
        let collected = self
          .ctx
          .project
          .results
          .get(&collected)
          .ok_or_else(|| InternalError(format!("result {collected} vanished from the model")))?;
        for source_name in &collected.sources {
          let source = self.source(source_name)?;
          let scm = scm_for(&source.kind);
          scm.fetch(self.ctx, source)?;
          scm.to_result(self.ctx, source, set, &project_dir.join(source_name))?;
        }
      }
    }

    // Environment: project settings, result overrides, then the build
    // interface variables.
    let chrooted = self.ctx.su_helper.is_some();
    let mut env = self.ctx.project.env.clone();
    env.merge(&result.env, true);
    env.set("E2_RESULT", &result.name).set("E2_BUILDID", build_id);
    if chrooted {
      env
        .set("E2_BUILD", "/tmp/e2build/build")
        .set("E2_OUT", "/tmp/e2build/out")
        .set("TMPDIR", "/tmp/e2build/tmp");
    } else {
      env
        .set("E2_BUILD", build_dir.to_string_lossy())
        .set("E2_OUT", out_dir.to_string_lossy())
        .set("TMPDIR", tmp_dir.to_string_lossy());
    }

    let env_file = work.join("env");
    std::fs::write(&env_file, env.to_lines()).map_err(|e| io_err(&env_file, e))?;

    let script = work.join("script");
    std::fs::copy(&result.script, &script).map_err(|e| io_err(&script, e))?;
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).map_err(|e| io_err(&script, e))?;
    }

    debug!(result = %result.name, "prepared");
    if self.opts.playground {
      info!(result = %result.name, root = %root.display(), "playground ready");
      return Ok(Status::Prepared);
    }

    let status = chroot::run_script(self.ctx, root, &env)?;
    if !status.success() {
      return Ok(Status::Failed(FailReason::Script {
        status: status.code().unwrap_or(-1),
      }));
    }
    debug!(result = %result.name, "built");

    if self.opts.mode.store == StorePolicy::Discard || build_id == WORKING_COPY_ID {
      debug!(result = %result.name, "artifact not stored (working-copy build)");
      return Ok(Status::Built);
    }

    let scratch = self
      .ctx
      .scratch_dir("artifact-")
      .map_err(|e| io_err(&self.ctx.build_base, e))?;
    store.put(build_id, &out_dir, &scratch)?;
    debug!(result = %result.name, "stored");

    Ok(Status::Stored)
  }
}
