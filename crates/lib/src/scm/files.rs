//! The files plug-in: sources made of versioned remote files.
//!
//! Every file carries a declared sha1 that is verified after download.
//! Files are materialized into the build tree in declared order: archives
//! marked `unpack` are extracted, `patch` entries are applied to the tree
//! built so far, anything else is copied verbatim.

use std::path::Path;

use tracing::debug;

use e2build_core::hash::hash_file;
use e2build_core::Hasher;

use crate::archive;
use crate::context::Context;
use crate::ident;
use crate::project::{Source, SourceFile, SourceKind, SourceSet, TarType};

use super::{io_err, run_tool, Scm, ScmError};

pub struct FilesScm;

fn file_list(src: &Source) -> &[SourceFile] {
  match &src.kind {
    SourceKind::Files { files } => files,
    _ => unreachable!("files plug-in dispatched on a non-files source"),
  }
}

/// Download one file through the cache and verify its declared sha1.
fn fetch_verified(ctx: &Context, src: &Source, file: &SourceFile) -> Result<std::path::PathBuf, ScmError> {
  let local = ctx.cache.fetch_file(&file.server, &file.location)?;
  let actual = hash_file(&local).map_err(|e| io_err(&local, e))?;
  if actual != file.sha1 {
    return Err(ScmError::HashMismatch {
      name: src.name.clone(),
      location: file.location.clone(),
      expected: file.sha1.clone(),
      actual,
    });
  }
  Ok(local)
}

impl Scm for FilesScm {
  /// The id hashes the declared file list, not downloaded bytes, so it is
  /// computable offline. The same id holds under every source set: there
  /// is no working copy to deviate.
  fn source_id(&self, ctx: &Context, src: &Source, _set: SourceSet) -> Result<String, ScmError> {
    let mut hasher = Hasher::new();
    hasher.append(&src.name).append("files").append(ident::environment_id(&src.env));
    for licence_id in ident::sorted_licence_ids(ctx, &src.licences)? {
      hasher.append(licence_id);
    }
    for file in file_list(src) {
      hasher
        .append(&file.server)
        .append(&file.location)
        .append(&file.sha1)
        .append(file.unpack.as_deref().unwrap_or(""))
        .append(file.patch.as_deref().unwrap_or(""));
    }
    Ok(hasher.finish())
  }

  fn fetch(&self, ctx: &Context, src: &Source) -> Result<(), ScmError> {
    for file in file_list(src) {
      fetch_verified(ctx, src, file)?;
    }
    Ok(())
  }

  fn update(&self, _ctx: &Context, _src: &Source) -> Result<(), ScmError> {
    // Pinned by sha1, nothing to update.
    Ok(())
  }

  fn prepare(&self, ctx: &Context, src: &Source, _set: SourceSet, build_path: &Path) -> Result<(), ScmError> {
    let dest = build_path.join(&src.name);
    std::fs::create_dir_all(&dest).map_err(|e| io_err(&dest, e))?;

    for file in file_list(src) {
      let local = fetch_verified(ctx, src, file)?;

      if let Some(unpack) = &file.unpack {
        let tartype = TarType::from_location(&file.location).ok_or_else(|| ScmError::UnsupportedArchive {
          name: src.name.clone(),
          location: file.location.clone(),
        })?;
        archive::extract(&local, tartype, &dest)?;
        if !dest.join(unpack).exists() {
          return Err(ScmError::UnpackMismatch {
            name: src.name.clone(),
            expected: unpack.clone(),
          });
        }
      } else if let Some(level) = &file.patch {
        debug!(source = %src.name, patch = %file.location, "applying patch");
        run_tool(
          Some(&dest),
          "patch",
          &["-p", level, "-i", &local.to_string_lossy()],
        )?;
      } else {
        let file_name = Path::new(&file.location)
          .file_name()
          .ok_or_else(|| ScmError::InvalidUrl {
            name: src.name.clone(),
            url: file.location.clone(),
          })?;
        std::fs::copy(&local, dest.join(file_name)).map_err(|e| io_err(&dest, e))?;
      }
    }
    Ok(())
  }

  fn working_copy_available(&self, _ctx: &Context, _src: &Source) -> bool {
    false
  }

  fn has_working_copy(&self, _src: &Source) -> bool {
    false
  }

  fn check_working_copy(&self, _ctx: &Context, _src: &Source) -> Result<(), ScmError> {
    Ok(())
  }

  fn display(&self, src: &Source) -> String {
    format!("files [{} files]", file_list(src).len())
  }
}
