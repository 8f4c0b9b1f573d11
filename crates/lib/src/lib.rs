//! e2build-lib: the build-dependency engine and deterministic-build pipeline
//!
//! The library is organized leaves-first:
//! - `project`: typed project model, Lua loader and cross-reference validator
//! - `ident`: sourceid / buildid / chrootid / environmentid computation
//! - `dag`: dependency ordering over the result graph
//! - `transport` / `cache`: URL-addressed remote I/O and the local mirror
//! - `scm`: source repository plug-ins (git, svn, files)
//! - `chroot`: build-root provisioning and locking
//! - `store`: the content-addressed result store
//! - `pipeline`: the per-result state machine and driver
//! - `context`: the per-invocation record tying the above together

pub mod archive;
pub mod cache;
pub mod chroot;
pub mod context;
pub mod dag;
pub mod error;
pub mod ident;
pub mod pipeline;
pub mod project;
pub mod scm;
pub mod store;
pub mod transport;
pub mod warn;

pub use context::Context;
pub use project::Project;
