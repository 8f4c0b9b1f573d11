//! The identity engine.
//!
//! Every id is the hash of a canonical byte stream:
//!
//! | id | bytes, in order |
//! |----|-----------------|
//! | environmentid | `k=v` per key, lexicographic |
//! | licenceid | name, then each file's sha1 |
//! | chrootgroupid | name, then per file: server, location, sha1, tartype |
//! | sourceid | per-SCM schema |
//! | resultid | name, envid, sorted sourceids, sorted groupids, sorted licenceids, script hash |
//! | buildid | resultid, sorted dependency buildids |
//!
//! Results are memoized per `(entity, source set)` on the run context.
//! The `working-copy` sentinel short-circuits and propagates: a result
//! whose transitive sources include a working-copy source gets the
//! sentinel as its buildid and is never cached.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

use e2build_core::hash::hash_file;
use e2build_core::Environment;
use e2build_core::Hasher;

use crate::context::Context;
use crate::project::{SourceSet, WORKING_COPY_ID};
use crate::scm::{scm_for, ScmError};

#[derive(Debug, Error)]
pub enum IdentError {
  #[error("no such {class}: {name}")]
  Missing { class: &'static str, name: String },

  #[error("cannot hash {path}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("sourceid of {name} failed")]
  Scm {
    name: String,
    #[source]
    source: Box<ScmError>,
  },
}

pub fn environment_id(env: &Environment) -> String {
  env.id()
}

fn memo_get(ctx: &Context, key: &(String, &'static str)) -> Option<String> {
  ctx.memo.lock().expect("identity memo poisoned").get(key).cloned()
}

fn memo_put(ctx: &Context, key: (String, &'static str), id: String) -> String {
  ctx.memo.lock().expect("identity memo poisoned").insert(key, id.clone());
  id
}

/// The id of a licence: its name, then each file's declared sha1 in list
/// order.
pub fn licence_id(ctx: &Context, name: &str) -> Result<String, IdentError> {
  let key = (format!("licence/{}", name), "-");
  if let Some(id) = memo_get(ctx, &key) {
    return Ok(id);
  }

  let licence = ctx.project.licences.get(name).ok_or(IdentError::Missing {
    class: "licence",
    name: name.to_string(),
  })?;

  let mut hasher = Hasher::new();
  hasher.append(&licence.name);
  for file in &licence.files {
    hasher.append(&file.sha1);
  }
  Ok(memo_put(ctx, key, hasher.finish()))
}

/// Licence ids for a set of licence names, sorted.
pub fn sorted_licence_ids(ctx: &Context, names: &[String]) -> Result<Vec<String>, IdentError> {
  let mut ids = names
    .iter()
    .map(|name| licence_id(ctx, name))
    .collect::<Result<Vec<_>, _>>()?;
  ids.sort();
  Ok(ids)
}

/// The id of a chroot group. An explicit `groupid` override wins over the
/// computed hash.
pub fn chroot_group_id(ctx: &Context, name: &str) -> Result<String, IdentError> {
  let key = (format!("chroot/{}", name), "-");
  if let Some(id) = memo_get(ctx, &key) {
    return Ok(id);
  }

  let group = ctx.project.chroot_groups.get(name).ok_or(IdentError::Missing {
    class: "chroot group",
    name: name.to_string(),
  })?;

  if let Some(groupid) = &group.groupid {
    return Ok(memo_put(ctx, key, groupid.clone()));
  }

  let mut hasher = Hasher::new();
  hasher.append(&group.name);
  for file in &group.files {
    hasher
      .append(&file.server)
      .append(&file.location)
      .append(&file.sha1)
      .append(file.tartype.name());
  }
  Ok(memo_put(ctx, key, hasher.finish()))
}

/// The id of a source under a source set, delegated to its SCM plug-in.
pub fn source_id(ctx: &Context, name: &str, set: SourceSet) -> Result<String, IdentError> {
  let key = (format!("source/{}", name), set.name());
  if let Some(id) = memo_get(ctx, &key) {
    return Ok(id);
  }

  let source = ctx.project.sources.get(name).ok_or(IdentError::Missing {
    class: "source",
    name: name.to_string(),
  })?;

  let id = scm_for(&source.kind)
    .source_id(ctx, source, set)
    .map_err(|e| IdentError::Scm {
      name: name.to_string(),
      source: Box::new(e),
    })?;
  debug!(source = name, set = set.name(), id = %id, "sourceid");
  Ok(memo_put(ctx, key, id))
}

/// The id of a result under a source set.
pub fn result_id(ctx: &Context, name: &str, set: SourceSet) -> Result<String, IdentError> {
  let key = (format!("result/{}", name), set.name());
  if let Some(id) = memo_get(ctx, &key) {
    return Ok(id);
  }

  let result = ctx.project.results.get(name).ok_or(IdentError::Missing {
    class: "result",
    name: name.to_string(),
  })?;

  let mut source_ids = Vec::with_capacity(result.sources.len());
  let mut licence_names = Vec::new();
  for source_name in &result.sources {
    source_ids.push(source_id(ctx, source_name, set)?);
    let source = ctx.project.sources.get(source_name).ok_or(IdentError::Missing {
      class: "source",
      name: source_name.clone(),
    })?;
    licence_names.extend(source.licences.iter().cloned());
  }

  if source_ids.iter().any(|id| id == WORKING_COPY_ID) {
    return Ok(memo_put(ctx, key, WORKING_COPY_ID.to_string()));
  }
  source_ids.sort();

  let mut group_ids = result
    .chroot_groups
    .iter()
    .map(|group| chroot_group_id(ctx, group))
    .collect::<Result<Vec<_>, _>>()?;
  group_ids.sort();

  licence_names.sort();
  licence_names.dedup();
  let licence_ids = sorted_licence_ids(ctx, &licence_names)?;

  let script_hash = hash_file(&result.script).map_err(|e| IdentError::Io {
    path: result.script.clone(),
    source: e,
  })?;

  let mut hasher = Hasher::new();
  hasher.append(&result.name).append(result.env.id());
  for id in &source_ids {
    hasher.append(id);
  }
  for id in &group_ids {
    hasher.append(id);
  }
  for id in &licence_ids {
    hasher.append(id);
  }
  hasher.append(&script_hash);
  Ok(memo_put(ctx, key, hasher.finish()))
}

/// The id of a build: the resultid plus the sorted buildids of the direct
/// dependencies. The sentinel propagates upwards.
pub fn build_id(ctx: &Context, name: &str, set: SourceSet) -> Result<String, IdentError> {
  let key = (format!("build/{}", name), set.name());
  if let Some(id) = memo_get(ctx, &key) {
    return Ok(id);
  }

  let rid = result_id(ctx, name, set)?;
  if rid == WORKING_COPY_ID {
    return Ok(memo_put(ctx, key, rid));
  }

  let result = ctx.project.results.get(name).ok_or(IdentError::Missing {
    class: "result",
    name: name.to_string(),
  })?;

  let mut dep_ids = Vec::with_capacity(result.depends.len());
  for dep in &result.depends {
    let dep_id = build_id(ctx, dep, set)?;
    if dep_id == WORKING_COPY_ID {
      return Ok(memo_put(ctx, key, dep_id));
    }
    dep_ids.push(dep_id);
  }
  dep_ids.sort();

  let mut hasher = Hasher::new();
  hasher.append(&rid);
  for id in &dep_ids {
    hasher.append(id);
  }
  let id = hasher.finish();
  debug!(result = name, set = set.name(), buildid = %id, "buildid");
  Ok(memo_put(ctx, key, id))
}
