//! Server/location reference strings.
//!
//! Remote files are referenced as `<server>:<location>` where `server`
//! names a configured server and `location` is a relative path below it.
//! Locations must not escape the server root, so `..` components and
//! leading slashes are rejected.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LocationError {
  #[error("invalid server/location reference {0:?}: expected '<server>:<location>'")]
  Malformed(String),

  #[error("invalid location {0:?}: absolute paths are not allowed")]
  Absolute(String),

  #[error("invalid location {0:?}: '..' components are not allowed")]
  ParentEscape(String),
}

/// Strip trailing slashes. Idempotent.
pub fn remove_trailing_slashes(s: &str) -> &str {
  s.trim_end_matches('/')
}

/// Render a `(server, location)` pair as `server:location`.
pub fn format_server_location(server: &str, location: &str) -> String {
  format!("{}:{}", server, location)
}

/// Check a location path for traversal escapes.
pub fn validate_location(location: &str) -> Result<(), LocationError> {
  if location.starts_with('/') {
    return Err(LocationError::Absolute(location.to_string()));
  }
  if location.split('/').any(|component| component == "..") {
    return Err(LocationError::ParentEscape(location.to_string()));
  }
  Ok(())
}

/// Parse a `server:location` reference. The inverse of
/// [`format_server_location`] for all valid inputs.
pub fn parse_server_location(input: &str) -> Result<(String, String), LocationError> {
  let (server, location) = input
    .split_once(':')
    .ok_or_else(|| LocationError::Malformed(input.to_string()))?;

  if server.is_empty() || location.is_empty() {
    return Err(LocationError::Malformed(input.to_string()));
  }
  validate_location(location)?;

  Ok((server.to_string(), location.to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn format_then_parse_round_trips() {
    let cases = [("upstream", "pkg/foo-1.0.tar.gz"), ("results", "a/b/c"), ("s", "l")];
    for (server, location) in cases {
      let rendered = format_server_location(server, location);
      assert_eq!(
        parse_server_location(&rendered).unwrap(),
        (server.to_string(), location.to_string())
      );
    }
  }

  #[test]
  fn parse_rejects_missing_colon() {
    assert_eq!(
      parse_server_location("no-colon-here"),
      Err(LocationError::Malformed("no-colon-here".to_string()))
    );
  }

  #[test]
  fn parse_rejects_empty_parts() {
    assert!(parse_server_location(":loc").is_err());
    assert!(parse_server_location("srv:").is_err());
  }

  #[test]
  fn parse_rejects_absolute_location() {
    assert_eq!(
      parse_server_location("srv:/etc/passwd"),
      Err(LocationError::Absolute("/etc/passwd".to_string()))
    );
  }

  #[test]
  fn parse_rejects_parent_escape() {
    assert_eq!(
      parse_server_location("srv:a/../../b"),
      Err(LocationError::ParentEscape("a/../../b".to_string()))
    );
    assert_eq!(
      parse_server_location("srv:.."),
      Err(LocationError::ParentEscape("..".to_string()))
    );
  }

  #[test]
  fn dotted_names_are_not_escapes() {
    assert!(parse_server_location("srv:a/..b/c..").is_ok());
  }

  #[test]
  fn remove_trailing_slashes_is_idempotent() {
    for input in ["http://host/path///", "http://host/path", "", "///"] {
      let once = remove_trailing_slashes(input);
      assert_eq!(remove_trailing_slashes(once), once);
      assert!(!once.ends_with('/') || once.is_empty());
    }
  }
}
