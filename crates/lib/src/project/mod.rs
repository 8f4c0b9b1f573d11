//! The project model: typed records, the Lua loader and the validator.
//!
//! A project is loaded once per invocation and frozen; everything mutable
//! during a run lives on the pipeline, not here.

pub mod load;
#[cfg(test)]
pub mod testutil;
pub mod types;
pub mod validate;

pub use load::{load_project, LoadError};
pub use types::{
  BuildMode, ChrootFile, ChrootGroup, Licence, Project, ProjectInfo, ResultDef, Server, Source, SourceFile,
  SourceKind, SourceSet, StorePolicy, TarType, WORKING_COPY_ID,
};
pub use validate::{validate, ValidateError};
