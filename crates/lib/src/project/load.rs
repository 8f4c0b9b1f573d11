//! The project loader.
//!
//! A project is described in Lua. Every config file is executed in a fresh
//! sandboxed interpreter where only the matching declaration function is
//! visible (`e2source{}`, `e2result{}`, `e2chroot{}`, `e2licence{}`,
//! `e2env{}`, `e2server{}`, `e2config{}`); the function converts its table
//! into a typed record on the spot, so the rest of the tool never sees a
//! Lua value.
//!
//! # Layout
//!
//! ```text
//! .e2/e2version          "<branch> <tag>"
//! .e2/e2config           e2config { name = ..., default_results = {...} }
//! .e2/extensions         optional, one extension name per line
//! proj/servers.lua       e2server { ... } per server
//! proj/env.lua           e2env { KEY = "value", ... }
//! src/<name>/config      e2source { ... }
//! res/<name>/config      e2result { ... }  (+ sibling build-script)
//! chroot/<name>/config   e2chroot { ... }
//! licences/<name>/config e2licence { ... }
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use mlua::prelude::*;

use e2build_core::version::VersionError;
use e2build_core::{Environment, ProjectVersion};

use crate::context::EnvVars;

use super::types::{
  ChrootFile, ChrootGroup, CollectExtras, Licence, Project, ProjectInfo, ResultDef, Server, Source, SourceFile,
  SourceKind, TarType,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
  #[error("{0} is not a project root (missing .e2 directory)")]
  NotAProject(PathBuf),

  #[error("cannot read {path}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  Version(#[from] VersionError),

  #[error("{file}: configuration error")]
  Lua {
    file: PathBuf,
    #[source]
    source: mlua::Error,
  },

  #[error("{file}: expected exactly one {decl} declaration, found {count}")]
  DeclCount {
    file: PathBuf,
    decl: &'static str,
    count: usize,
  },

  #[error("duplicate {class} name: {name}")]
  Duplicate { class: &'static str, name: String },
}

fn io_err(path: &Path, source: io::Error) -> LoadError {
  LoadError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// Run one config file in a fresh interpreter with a single declaration
/// function registered. Returns the converted declarations in call order.
fn eval_decl_file<T, F>(path: &Path, decl: &'static str, convert: F) -> Result<Vec<T>, LoadError>
where
  T: 'static,
  F: Fn(LuaTable) -> LuaResult<T> + 'static,
{
  let code = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;

  let lua = Lua::new();
  let collected: Rc<RefCell<Vec<T>>> = Rc::new(RefCell::new(Vec::new()));
  let sink = collected.clone();
  let declare = lua
    .create_function(move |_, table: LuaTable| {
      sink.borrow_mut().push(convert(table)?);
      Ok(())
    })
    .map_err(|e| LoadError::Lua {
      file: path.to_path_buf(),
      source: e,
    })?;
  lua.globals().set(decl, declare).map_err(|e| LoadError::Lua {
    file: path.to_path_buf(),
    source: e,
  })?;

  lua
    .load(&code)
    .set_name(path.to_string_lossy())
    .exec()
    .map_err(|e| LoadError::Lua {
      file: path.to_path_buf(),
      source: e,
    })?;

  drop(lua);
  Ok(Rc::try_unwrap(collected).ok().expect("interpreter dropped").into_inner())
}

/// Like [`eval_decl_file`] but requiring exactly one declaration.
fn eval_single_decl<T, F>(path: &Path, decl: &'static str, convert: F) -> Result<T, LoadError>
where
  T: 'static,
  F: Fn(LuaTable) -> LuaResult<T> + 'static,
{
  let mut decls = eval_decl_file(path, decl, convert)?;
  if decls.len() != 1 {
    return Err(LoadError::DeclCount {
      file: path.to_path_buf(),
      decl,
      count: decls.len(),
    });
  }
  Ok(decls.pop().expect("length checked above"))
}

fn check_keys(table: &LuaTable, allowed: &[&str]) -> LuaResult<()> {
  for pair in table.clone().pairs::<LuaValue, LuaValue>() {
    let (key, _) = pair?;
    match key {
      LuaValue::String(s) => {
        let name = s.to_string_lossy().to_string();
        if !allowed.contains(&name.as_str()) {
          return Err(LuaError::external(format!("unknown key {name:?}")));
        }
      }
      other => {
        return Err(LuaError::external(format!(
          "unexpected {} key in declaration table",
          other.type_name()
        )));
      }
    }
  }
  Ok(())
}

fn req_string(table: &LuaTable, key: &str) -> LuaResult<String> {
  table
    .get::<Option<String>>(key)?
    .filter(|v| !v.is_empty())
    .ok_or_else(|| LuaError::external(format!("missing key {key:?}")))
}

fn opt_string(table: &LuaTable, key: &str) -> LuaResult<Option<String>> {
  table.get::<Option<String>>(key)
}

fn opt_bool(table: &LuaTable, key: &str, default: bool) -> LuaResult<bool> {
  Ok(table.get::<Option<bool>>(key)?.unwrap_or(default))
}

fn string_list(table: &LuaTable, key: &str) -> LuaResult<Vec<String>> {
  match table.get::<Option<LuaTable>>(key)? {
    Some(list) => list.sequence_values::<String>().collect(),
    None => Ok(Vec::new()),
  }
}

fn env_table(table: &LuaTable, key: &str) -> LuaResult<Environment> {
  let mut env = Environment::new();
  if let Some(pairs) = table.get::<Option<LuaTable>>(key)? {
    for pair in pairs.pairs::<String, String>() {
      let (name, value) = pair?;
      env.set(name, value);
    }
  }
  Ok(env)
}

fn source_file(table: &LuaTable, default_server: Option<&str>) -> LuaResult<SourceFile> {
  check_keys(table, &["server", "location", "sha1", "unpack", "patch"])?;
  let server = match opt_string(table, "server")? {
    Some(server) => server,
    None => default_server
      .map(str::to_string)
      .ok_or_else(|| LuaError::external("missing key \"server\""))?,
  };
  let unpack = opt_string(table, "unpack")?;
  let patch = opt_string(table, "patch")?;
  if unpack.is_some() && patch.is_some() {
    return Err(LuaError::external("a file cannot be both unpack and patch"));
  }
  Ok(SourceFile {
    server,
    location: req_string(table, "location")?,
    sha1: req_string(table, "sha1")?,
    unpack,
    patch,
  })
}

fn convert_source(name: String, table: LuaTable) -> LuaResult<Source> {
  let kind_name = opt_string(&table, "type")?.unwrap_or_else(|| "git".to_string());

  let kind = match kind_name.as_str() {
    "git" => {
      check_keys(
        &table,
        &["type", "server", "licences", "env", "working", "location", "branch", "tag"],
      )?;
      SourceKind::Git {
        location: req_string(&table, "location")?,
        branch: req_string(&table, "branch")?,
        tag: req_string(&table, "tag")?,
      }
    }
    "svn" => {
      check_keys(
        &table,
        &[
          "type", "server", "licences", "env", "working", "location", "branchdir", "tagdir",
        ],
      )?;
      SourceKind::Svn {
        location: req_string(&table, "location")?,
        branchdir: opt_string(&table, "branchdir")?.unwrap_or_else(|| "branches".to_string()),
        tagdir: opt_string(&table, "tagdir")?.unwrap_or_else(|| "tags".to_string()),
      }
    }
    "files" => {
      check_keys(&table, &["type", "server", "licences", "env", "file"])?;
      let default_server = opt_string(&table, "server")?;
      let list: LuaTable = table
        .get::<Option<LuaTable>>("file")?
        .ok_or_else(|| LuaError::external("missing key \"file\""))?;
      let mut files = Vec::new();
      for entry in list.sequence_values::<LuaTable>() {
        files.push(source_file(&entry?, default_server.as_deref())?);
      }
      if files.is_empty() {
        return Err(LuaError::external("a files source needs at least one file"));
      }
      SourceKind::Files { files }
    }
    other => return Err(LuaError::external(format!("unknown source type {other:?}"))),
  };

  let server = match &kind {
    SourceKind::Files { .. } => opt_string(&table, "server")?.unwrap_or_default(),
    _ => req_string(&table, "server")?,
  };
  let working = opt_string(&table, "working")?
    .map(PathBuf::from)
    .unwrap_or_else(|| Path::new("in").join(&name));

  Ok(Source {
    name,
    kind,
    server,
    licences: string_list(&table, "licences")?,
    env: env_table(&table, "env")?,
    working,
  })
}

fn convert_result(name: String, script: PathBuf, table: LuaTable) -> LuaResult<ResultDef> {
  check_keys(
    &table,
    &[
      "sources",
      "depends",
      "chroot",
      "env",
      "collect_project",
      "collect_project_default_result",
    ],
  )?;

  let collect = if opt_bool(&table, "collect_project", false)? {
    Some(CollectExtras {
      default_result: req_string(&table, "collect_project_default_result")?,
    })
  } else {
    None
  };

  Ok(ResultDef {
    name,
    sources: string_list(&table, "sources")?,
    depends: string_list(&table, "depends")?,
    chroot_groups: string_list(&table, "chroot")?,
    env: env_table(&table, "env")?,
    script,
    collect,
  })
}

fn convert_chroot(name: String, table: LuaTable) -> LuaResult<ChrootGroup> {
  check_keys(&table, &["server", "files", "groupid"])?;
  let default_server = opt_string(&table, "server")?;
  let list: LuaTable = table
    .get::<Option<LuaTable>>("files")?
    .ok_or_else(|| LuaError::external("missing key \"files\""))?;

  let mut files = Vec::new();
  for entry in list.sequence_values::<LuaTable>() {
    let entry = entry?;
    check_keys(&entry, &["server", "location", "sha1", "tartype"])?;
    let location = req_string(&entry, "location")?;
    let tartype = match opt_string(&entry, "tartype")? {
      Some(t) => match t.as_str() {
        "tar" => TarType::Tar,
        "tar.gz" | "tgz" => TarType::TarGz,
        "tar.bz2" => TarType::TarBz2,
        other => return Err(LuaError::external(format!("unknown tartype {other:?}"))),
      },
      None => TarType::from_location(&location)
        .ok_or_else(|| LuaError::external(format!("cannot derive tartype of {location:?}")))?,
    };
    let server = match opt_string(&entry, "server")? {
      Some(server) => server,
      None => default_server
        .clone()
        .ok_or_else(|| LuaError::external("missing key \"server\""))?,
    };
    files.push(ChrootFile {
      server,
      location,
      sha1: req_string(&entry, "sha1")?,
      tartype,
    });
  }
  if files.is_empty() {
    return Err(LuaError::external("a chroot group needs at least one file"));
  }

  Ok(ChrootGroup {
    name,
    files,
    groupid: opt_string(&table, "groupid")?,
  })
}

fn convert_licence(name: String, table: LuaTable) -> LuaResult<Licence> {
  check_keys(&table, &["server", "files"])?;
  let default_server = opt_string(&table, "server")?;
  let list: LuaTable = table
    .get::<Option<LuaTable>>("files")?
    .ok_or_else(|| LuaError::external("missing key \"files\""))?;

  let mut files = Vec::new();
  for entry in list.sequence_values::<LuaTable>() {
    files.push(source_file(&entry?, default_server.as_deref())?);
  }
  Ok(Licence { name, files })
}

fn convert_server(table: LuaTable) -> LuaResult<Server> {
  check_keys(
    &table,
    &[
      "name",
      "url",
      "cachable",
      "cache",
      "islocal",
      "writeback",
      "push_permissions",
      "flags",
    ],
  )?;
  Ok(Server {
    name: req_string(&table, "name")?,
    url: req_string(&table, "url")?,
    cachable: opt_bool(&table, "cachable", true)?,
    cache: opt_bool(&table, "cache", true)?,
    islocal: opt_bool(&table, "islocal", false)?,
    writeback: opt_bool(&table, "writeback", false)?,
    push_permissions: opt_string(&table, "push_permissions")?,
    flags: string_list(&table, "flags")?,
  })
}

struct ProjectConfig {
  name: String,
  default_results: Vec<String>,
  result_server: String,
}

fn convert_config(table: LuaTable) -> LuaResult<ProjectConfig> {
  check_keys(&table, &["name", "default_results", "result_server"])?;
  Ok(ProjectConfig {
    name: req_string(&table, "name")?,
    default_results: string_list(&table, "default_results")?,
    result_server: opt_string(&table, "result_server")?.unwrap_or_else(|| "results".to_string()),
  })
}

/// Subdirectories of `base` that carry a `config` file, sorted by name.
fn entity_dirs(base: &Path) -> Result<Vec<(String, PathBuf)>, LoadError> {
  if !base.is_dir() {
    return Ok(Vec::new());
  }
  let mut dirs = Vec::new();
  for entry in std::fs::read_dir(base).map_err(|e| io_err(base, e))? {
    let entry = entry.map_err(|e| io_err(base, e))?;
    let path = entry.path();
    if path.is_dir() && path.join("config").is_file() {
      dirs.push((entry.file_name().to_string_lossy().to_string(), path));
    }
  }
  dirs.sort();
  Ok(dirs)
}

fn insert_unique<T>(
  map: &mut BTreeMap<String, T>,
  class: &'static str,
  name: String,
  value: T,
) -> Result<(), LoadError> {
  if map.contains_key(&name) {
    return Err(LoadError::Duplicate { class, name });
  }
  map.insert(name, value);
  Ok(())
}

/// Walk upwards from `start` to the nearest directory containing `.e2`.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
  let mut cursor = Some(start);
  while let Some(dir) = cursor {
    if dir.join(".e2").is_dir() {
      return Some(dir.to_path_buf());
    }
    cursor = dir.parent();
  }
  None
}

/// Load and type a project from its root directory.
///
/// `E2_LOCAL_BRANCH` / `E2_LOCAL_TAG` override the `e2version` tokens;
/// `E2_CONFIG` overrides the server configuration file.
pub fn load_project(root: &Path, env_vars: &EnvVars) -> Result<Project, LoadError> {
  let e2_dir = root.join(".e2");
  if !e2_dir.is_dir() {
    return Err(LoadError::NotAProject(root.to_path_buf()));
  }

  // Version, with local overrides.
  let version_path = e2_dir.join("e2version");
  let version_text = std::fs::read_to_string(&version_path).map_err(|e| io_err(&version_path, e))?;
  let mut version = ProjectVersion::parse(&version_text)?;
  if let Some(branch) = &env_vars.local_branch {
    version.branch = branch.clone();
  }
  if let Some(tag) = &env_vars.local_tag {
    version.tag = tag.clone();
  }

  // Extensions are declared but not loaded here.
  let extensions_path = e2_dir.join("extensions");
  if let Ok(text) = std::fs::read_to_string(&extensions_path) {
    for extension in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
      tracing::warn!(extension, "project requests an extension, which this tool does not load");
    }
  }

  let config = eval_single_decl(&e2_dir.join("e2config"), "e2config", convert_config)?;

  // Server list, overridable via E2_CONFIG.
  let servers_path = env_vars
    .e2_config
    .clone()
    .unwrap_or_else(|| root.join("proj").join("servers.lua"));
  let mut servers = BTreeMap::new();
  for server in eval_decl_file(&servers_path, "e2server", convert_server)? {
    insert_unique(&mut servers, "server", server.name.clone(), server)?;
  }

  // Project-global environment; later declarations override earlier ones.
  let env_path = root.join("proj").join("env.lua");
  let mut project_env = Environment::new();
  if env_path.is_file() {
    let env_decl = |table: LuaTable| -> LuaResult<Environment> {
      let mut env = Environment::new();
      for pair in table.pairs::<String, String>() {
        let (name, value) = pair?;
        env.set(name, value);
      }
      Ok(env)
    };
    for declared in eval_decl_file(&env_path, "e2env", env_decl)? {
      project_env.merge(&declared, true);
    }
  }

  let mut sources = BTreeMap::new();
  for (name, dir) in entity_dirs(&root.join("src"))? {
    let decl_name = name.clone();
    let source = eval_single_decl(&dir.join("config"), "e2source", move |t| {
      convert_source(decl_name.clone(), t)
    })?;
    insert_unique(&mut sources, "source", name, source)?;
  }

  let mut results = BTreeMap::new();
  for (name, dir) in entity_dirs(&root.join("res"))? {
    let decl_name = name.clone();
    let script = dir.join("build-script");
    let result = eval_single_decl(&dir.join("config"), "e2result", move |t| {
      convert_result(decl_name.clone(), script.clone(), t)
    })?;
    insert_unique(&mut results, "result", name, result)?;
  }

  let mut chroot_groups = BTreeMap::new();
  for (name, dir) in entity_dirs(&root.join("chroot"))? {
    let decl_name = name.clone();
    let group = eval_single_decl(&dir.join("config"), "e2chroot", move |t| {
      convert_chroot(decl_name.clone(), t)
    })?;
    insert_unique(&mut chroot_groups, "chroot group", name, group)?;
  }

  let mut licences = BTreeMap::new();
  for (name, dir) in entity_dirs(&root.join("licences"))? {
    let decl_name = name.clone();
    let licence = eval_single_decl(&dir.join("config"), "e2licence", move |t| {
      convert_licence(decl_name.clone(), t)
    })?;
    insert_unique(&mut licences, "licence", name, licence)?;
  }

  Ok(Project {
    info: ProjectInfo {
      name: config.name,
      root: root.to_path_buf(),
      branch: version.branch,
      tag: version.tag,
      default_results: config.default_results,
      result_server: config.result_server,
    },
    env: project_env,
    servers,
    sources,
    results,
    chroot_groups,
    licences,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::project::testutil::{minimal_env_vars, write_project_skeleton};
  use tempfile::TempDir;

  #[test]
  fn loads_a_minimal_project() {
    let dir = TempDir::new().unwrap();
    write_project_skeleton(dir.path());

    let project = load_project(dir.path(), &minimal_env_vars()).unwrap();

    assert_eq!(project.info.name, "demo");
    assert_eq!(project.info.branch, "master");
    assert_eq!(project.info.tag, "v1");
    assert_eq!(project.info.default_results, vec!["app"]);
    assert!(project.servers.contains_key("upstream"));
    assert!(project.servers.contains_key("results"));
    assert_eq!(project.sources.len(), 1);
    assert_eq!(project.results.len(), 2);
    assert_eq!(project.env.get("PROJECT_FLAG"), Some("on"));

    let base = project.sources.get("base").unwrap();
    assert!(matches!(base.kind, SourceKind::Files { .. }));
    assert_eq!(base.working, Path::new("in").join("base"));

    let app = project.results.get("app").unwrap();
    assert_eq!(app.depends, vec!["core"]);
    assert_eq!(app.chroot_groups, vec!["base"]);
  }

  #[test]
  fn rejects_unknown_keys() {
    let dir = TempDir::new().unwrap();
    write_project_skeleton(dir.path());
    std::fs::write(
      dir.path().join("src/base/config"),
      "e2source { type = \"files\", bogus = 1, file = { { server = \"upstream\", location = \"f\", sha1 = \"0000000000000000000000000000000000000000\" } } }\n",
    )
    .unwrap();

    let err = load_project(dir.path(), &minimal_env_vars()).unwrap_err();
    assert!(matches!(err, LoadError::Lua { .. }), "got {err:?}");
  }

  #[test]
  fn rejects_two_declarations_in_one_file() {
    let dir = TempDir::new().unwrap();
    write_project_skeleton(dir.path());
    let config = std::fs::read_to_string(dir.path().join("src/base/config")).unwrap();
    std::fs::write(dir.path().join("src/base/config"), format!("{config}\n{config}")).unwrap();

    let err = load_project(dir.path(), &minimal_env_vars()).unwrap_err();
    assert!(matches!(err, LoadError::DeclCount { count: 2, .. }), "got {err:?}");
  }

  #[test]
  fn version_overrides_apply() {
    let dir = TempDir::new().unwrap();
    write_project_skeleton(dir.path());

    let mut env = minimal_env_vars();
    env.local_branch = Some("feature".to_string());
    env.local_tag = Some("^".to_string());

    let project = load_project(dir.path(), &env).unwrap();
    assert_eq!(project.info.branch, "feature");
    assert_eq!(project.info.tag, "^");
    assert!(project.info.is_pseudo_tag());
  }

  #[test]
  fn missing_e2_dir_is_not_a_project() {
    let dir = TempDir::new().unwrap();
    let err = load_project(dir.path(), &minimal_env_vars()).unwrap_err();
    assert!(matches!(err, LoadError::NotAProject(_)));
  }

  #[test]
  fn bad_version_file_is_a_parse_error() {
    let dir = TempDir::new().unwrap();
    write_project_skeleton(dir.path());
    std::fs::write(dir.path().join(".e2/e2version"), "only-branch\n").unwrap();

    let err = load_project(dir.path(), &minimal_env_vars()).unwrap_err();
    assert!(matches!(err, LoadError::Version(_)));
  }

  #[test]
  fn lua_can_compute_declaration_values() {
    let dir = TempDir::new().unwrap();
    write_project_skeleton(dir.path());
    std::fs::write(
      dir.path().join("proj/env.lua"),
      "local flags = { \"a\", \"b\" }\ne2env { JOINED = table.concat(flags, \",\") }\n",
    )
    .unwrap();

    let project = load_project(dir.path(), &minimal_env_vars()).unwrap();
    assert_eq!(project.env.get("JOINED"), Some("a,b"));
  }
}

