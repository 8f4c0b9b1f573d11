//! The cross-reference validator.
//!
//! Runs once over the freshly loaded model. Every failure carries the
//! offending name; the first failure wins, checks run in a fixed order so
//! reported errors are deterministic.

use std::path::PathBuf;

use thiserror::Error;

use crate::dag::{DagError, DepGraph};

use super::types::{Project, SourceKind};

#[derive(Debug, Error)]
pub enum ValidateError {
  #[error("{referrer}: no such server: {server}")]
  MissingServer { referrer: String, server: String },

  #[error("{referrer}: no such licence: {licence}")]
  MissingLicence { referrer: String, licence: String },

  #[error("result {result}: no such source: {source_name}")]
  MissingSource { result: String, source_name: String },

  #[error("result {result}: no such chroot group: {group}")]
  MissingChrootGroup { result: String, group: String },

  #[error("result {result}: build script {path} does not exist")]
  MissingScript { result: String, path: PathBuf },

  #[error("result {result}: no such collect-project default result: {default}")]
  MissingCollectDefault { result: String, default: String },

  #[error("project: no such default result: {0}")]
  MissingDefaultResult(String),

  #[error("project: no such result server: {0}")]
  MissingResultServer(String),

  #[error(transparent)]
  Dag(#[from] DagError),
}

/// Validate every cross-reference in the model.
pub fn validate(project: &Project) -> Result<(), ValidateError> {
  let server_exists = |referrer: &str, server: &str| -> Result<(), ValidateError> {
    if project.servers.contains_key(server) {
      Ok(())
    } else {
      Err(ValidateError::MissingServer {
        referrer: referrer.to_string(),
        server: server.to_string(),
      })
    }
  };

  for (name, source) in &project.sources {
    let referrer = format!("source {name}");
    match &source.kind {
      SourceKind::Files { files } => {
        for file in files {
          server_exists(&referrer, &file.server)?;
        }
      }
      _ => server_exists(&referrer, &source.server)?,
    }
    for licence in &source.licences {
      if !project.licences.contains_key(licence) {
        return Err(ValidateError::MissingLicence {
          referrer: referrer.clone(),
          licence: licence.clone(),
        });
      }
    }
  }

  for (name, licence) in &project.licences {
    for file in &licence.files {
      server_exists(&format!("licence {name}"), &file.server)?;
    }
  }

  for (name, group) in &project.chroot_groups {
    for file in &group.files {
      server_exists(&format!("chroot group {name}"), &file.server)?;
    }
  }

  for (name, result) in &project.results {
    for source in &result.sources {
      if !project.sources.contains_key(source) {
        return Err(ValidateError::MissingSource {
          result: name.clone(),
          source_name: source.clone(),
        });
      }
    }
    for group in &result.chroot_groups {
      if !project.chroot_groups.contains_key(group) {
        return Err(ValidateError::MissingChrootGroup {
          result: name.clone(),
          group: group.clone(),
        });
      }
    }
    for dependency in &result.depends {
      if !project.results.contains_key(dependency) {
        return Err(ValidateError::Dag(DagError::UnknownResult(dependency.clone())));
      }
    }
    if !result.script.is_file() {
      return Err(ValidateError::MissingScript {
        result: name.clone(),
        path: result.script.clone(),
      });
    }
    if let Some(collect) = &result.collect {
      if !project.results.contains_key(&collect.default_result) {
        return Err(ValidateError::MissingCollectDefault {
          result: name.clone(),
          default: collect.default_result.clone(),
        });
      }
    }
  }

  // The depends relation must be acyclic.
  DepGraph::from_project(project)?;

  for default in &project.info.default_results {
    if !project.results.contains_key(default) {
      return Err(ValidateError::MissingDefaultResult(default.clone()));
    }
  }
  if !project.servers.contains_key(&project.info.result_server) {
    return Err(ValidateError::MissingResultServer(project.info.result_server.clone()));
  }

  Ok(())
}
