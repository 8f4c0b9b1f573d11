//! Tar archive extraction and creation.
//!
//! tar and tar.gz are handled in-process; tar.bz2 is delegated to the
//! external `tar` tool.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::Path;
use std::process::Command;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;
use tracing::debug;

use crate::project::TarType;

#[derive(Debug, Error)]
pub enum ArchiveError {
  #[error("archive i/o on {path}")]
  Io {
    path: std::path::PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("tar exited with {status} unpacking {path}")]
  Tool { path: std::path::PathBuf, status: String },
}

fn io_err(path: &Path, source: io::Error) -> ArchiveError {
  ArchiveError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// Extract an archive into `dest`, creating it as needed. Entries keep
/// their archive-relative paths.
pub fn extract(archive: &Path, tartype: TarType, dest: &Path) -> Result<(), ArchiveError> {
  debug!(archive = %archive.display(), dest = %dest.display(), "extracting");
  fs::create_dir_all(dest).map_err(|e| io_err(dest, e))?;

  match tartype {
    TarType::Tar => {
      let file = File::open(archive).map_err(|e| io_err(archive, e))?;
      tar::Archive::new(BufReader::new(file))
        .unpack(dest)
        .map_err(|e| io_err(archive, e))
    }
    TarType::TarGz => {
      let file = File::open(archive).map_err(|e| io_err(archive, e))?;
      tar::Archive::new(GzDecoder::new(BufReader::new(file)))
        .unpack(dest)
        .map_err(|e| io_err(archive, e))
    }
    TarType::TarBz2 => {
      let output = Command::new("tar")
        .arg("-xjf")
        .arg(archive)
        .arg("-C")
        .arg(dest)
        .output()
        .map_err(|e| io_err(archive, e))?;
      if output.status.success() {
        Ok(())
      } else {
        Err(ArchiveError::Tool {
          path: archive.to_path_buf(),
          status: output.status.to_string(),
        })
      }
    }
  }
}

/// Pack the contents of `dir` into a tar.gz archive at `target`.
pub fn create_tar_gz(dir: &Path, target: &Path) -> Result<(), ArchiveError> {
  let file = File::create(target).map_err(|e| io_err(target, e))?;
  let encoder = GzEncoder::new(file, Compression::default());
  let mut builder = tar::Builder::new(encoder);
  builder.append_dir_all(".", dir).map_err(|e| io_err(dir, e))?;
  let encoder = builder.into_inner().map_err(|e| io_err(target, e))?;
  encoder.finish().map_err(|e| io_err(target, e))?;
  Ok(())
}
