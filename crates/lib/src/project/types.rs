//! Typed project records.
//!
//! These are the records the loader produces and the rest of the tool
//! consumes. All maps are `BTreeMap` so that every iteration over the model
//! is deterministic.

use std::collections::BTreeMap;
use std::path::PathBuf;

use e2build_core::version::PSEUDO_TAG;
use e2build_core::Environment;
use serde::{Deserialize, Serialize};

/// Sentinel id of anything derived from a mutable working copy. Builds
/// carrying this id are never cached.
pub const WORKING_COPY_ID: &str = "working-copy";

/// Selects which revision class of a source an id computation binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceSet {
  Tag,
  Branch,
  WorkingCopy,
  Lazytag,
}

impl SourceSet {
  /// Resolve `Lazytag` against a concrete tag value. This is the only
  /// resolution site; every caller goes through it.
  pub fn resolve(self, tag: &str) -> SourceSet {
    match self {
      SourceSet::Lazytag => {
        if tag == PSEUDO_TAG {
          SourceSet::Branch
        } else {
          SourceSet::Tag
        }
      }
      other => other,
    }
  }

  pub fn name(self) -> &'static str {
    match self {
      SourceSet::Tag => "tag",
      SourceSet::Branch => "branch",
      SourceSet::WorkingCopy => "working-copy",
      SourceSet::Lazytag => "lazytag",
    }
  }
}

/// What happens to a finished artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorePolicy {
  /// Store locally and push to result servers with writeback enabled.
  Push,
  /// Keep the artifact in the local store only.
  Keep,
  /// Never touch the result store (working-copy builds).
  Discard,
}

/// A named bundle of source-set selector and result policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildMode {
  pub name: &'static str,
  pub source_set: SourceSet,
  pub store: StorePolicy,
  pub deploy: bool,
  pub sign: bool,
}

impl BuildMode {
  pub fn release() -> Self {
    Self {
      name: "release",
      source_set: SourceSet::Tag,
      store: StorePolicy::Push,
      deploy: true,
      sign: true,
    }
  }

  /// The default mode: tagged revisions, with the pseudo tag `"^"`
  /// falling back to the branch head per source.
  pub fn tag() -> Self {
    Self {
      name: "tag",
      source_set: SourceSet::Lazytag,
      store: StorePolicy::Push,
      deploy: false,
      sign: false,
    }
  }

  pub fn branch() -> Self {
    Self {
      name: "branch",
      source_set: SourceSet::Branch,
      store: StorePolicy::Push,
      deploy: false,
      sign: false,
    }
  }

  pub fn working_copy() -> Self {
    Self {
      name: "working-copy",
      source_set: SourceSet::WorkingCopy,
      store: StorePolicy::Discard,
      deploy: false,
      sign: false,
    }
  }
}

impl Default for BuildMode {
  fn default() -> Self {
    Self::tag()
  }
}

/// Archive flavour of a chroot-group file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TarType {
  Tar,
  TarGz,
  TarBz2,
}

impl TarType {
  /// Derive the flavour from a file name.
  pub fn from_location(location: &str) -> Option<TarType> {
    if location.ends_with(".tar.gz") || location.ends_with(".tgz") {
      Some(TarType::TarGz)
    } else if location.ends_with(".tar.bz2") || location.ends_with(".tbz2") {
      Some(TarType::TarBz2)
    } else if location.ends_with(".tar") {
      Some(TarType::Tar)
    } else {
      None
    }
  }

  pub fn name(self) -> &'static str {
    match self {
      TarType::Tar => "tar",
      TarType::TarGz => "tar.gz",
      TarType::TarBz2 => "tar.bz2",
    }
  }
}

/// A remote file belonging to a `files` source or a licence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
  pub server: String,
  pub location: String,
  pub sha1: String,
  /// Name of the directory the archive unpacks to, when it should be
  /// unpacked into the build tree.
  pub unpack: Option<String>,
  /// Strip level when the file is a patch to apply, e.g. `"1"` for `-p1`.
  pub patch: Option<String>,
}

/// One archive of a chroot group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChrootFile {
  pub server: String,
  pub location: String,
  pub sha1: String,
  pub tartype: TarType,
}

/// Type-specific part of a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
  Git {
    location: String,
    branch: String,
    tag: String,
  },
  Svn {
    location: String,
    branchdir: String,
    tagdir: String,
  },
  Files {
    files: Vec<SourceFile>,
  },
}

impl SourceKind {
  pub fn type_name(&self) -> &'static str {
    match self {
      SourceKind::Git { .. } => "git",
      SourceKind::Svn { .. } => "svn",
      SourceKind::Files { .. } => "files",
    }
  }
}

/// A versioned source under a defined environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
  pub name: String,
  pub kind: SourceKind,
  /// Server the repository lives on. Unused by `files` sources, whose
  /// files carry their own server references.
  pub server: String,
  pub licences: Vec<String>,
  pub env: Environment,
  /// Working-copy path relative to the project root.
  pub working: PathBuf,
}

/// A node in the build DAG, producing one artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultDef {
  pub name: String,
  pub sources: Vec<String>,
  pub depends: Vec<String>,
  pub chroot_groups: Vec<String>,
  pub env: Environment,
  /// Absolute path of the build script payload.
  pub script: PathBuf,
  /// Extras carried by collect-project results.
  pub collect: Option<CollectExtras>,
}

/// Composition record replacing the collect-project result subclass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectExtras {
  /// The result whose dependency closure is collected into the artifact.
  pub default_result: String,
}

/// An ordered set of archives composing a build root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChrootGroup {
  pub name: String,
  pub files: Vec<ChrootFile>,
  /// Explicit id override; skips the computed group id when set.
  pub groupid: Option<String>,
}

/// A named licence with its text files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Licence {
  pub name: String,
  pub files: Vec<SourceFile>,
}

/// A configured server entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
  pub name: String,
  pub url: String,
  pub cachable: bool,
  pub cache: bool,
  pub islocal: bool,
  pub writeback: bool,
  pub push_permissions: Option<String>,
  pub flags: Vec<String>,
}

/// Per-project metadata from `.e2/`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectInfo {
  pub name: String,
  pub root: PathBuf,
  pub branch: String,
  pub tag: String,
  pub default_results: Vec<String>,
  /// Server results are stored on.
  pub result_server: String,
}

impl ProjectInfo {
  pub fn is_pseudo_tag(&self) -> bool {
    self.tag == PSEUDO_TAG
  }
}

/// The frozen project model.
#[derive(Debug, Clone, PartialEq)]
pub struct Project {
  pub info: ProjectInfo,
  pub env: Environment,
  pub servers: BTreeMap<String, Server>,
  pub sources: BTreeMap<String, Source>,
  pub results: BTreeMap<String, ResultDef>,
  pub chroot_groups: BTreeMap<String, ChrootGroup>,
  pub licences: BTreeMap<String, Licence>,
}

impl Project {
  pub fn source(&self, name: &str) -> Option<&Source> {
    self.sources.get(name)
  }

  pub fn result(&self, name: &str) -> Option<&ResultDef> {
    self.results.get(name)
  }
}
