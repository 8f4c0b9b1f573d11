//! Error presentation and process exit codes.

use thiserror::Error;

/// Full success of all selected results.
pub const EXIT_OK: u8 = 0;
/// Any build, validation or I/O failure.
pub const EXIT_FAILURE: u8 = 1;
/// Internal invariant violation.
pub const EXIT_INTERNAL: u8 = 32;
/// Interrupted by SIGINT.
pub const EXIT_INTERRUPT: u8 = 130;

/// An invariant the tool relies on was violated. Mapped to exit code 32.
#[derive(Debug, Error)]
#[error("internal invariant violated: {0}")]
pub struct InternalError(pub String);

/// Render an error chain innermost-first, one cause per line.
pub fn format_chain(err: &dyn std::error::Error) -> String {
  let mut chain = Vec::new();
  chain.push(err.to_string());
  let mut cursor = err.source();
  while let Some(cause) = cursor {
    chain.push(cause.to_string());
    cursor = cause.source();
  }
  chain.reverse();
  chain.join("\n")
}
