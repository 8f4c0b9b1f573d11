//! The `e2version` file grammar.
//!
//! One line, two whitespace-delimited tokens: `<branch> <tag>`. The tag
//! `"^"` is the pseudo tag meaning "no tagged release, follow the branch".

use std::fmt;

use thiserror::Error;

/// The pseudo tag marking an untagged project state.
pub const PSEUDO_TAG: &str = "^";

#[derive(Debug, Error)]
pub enum VersionError {
  #[error("e2version: expected '<branch> <tag>', got {0:?}")]
  Parse(String),
}

/// Parsed contents of a project's `e2version` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectVersion {
  pub branch: String,
  pub tag: String,
}

impl ProjectVersion {
  pub fn parse(input: &str) -> Result<Self, VersionError> {
    let line = input.lines().next().unwrap_or("");
    let mut tokens = line.split_whitespace();

    let branch = tokens.next().ok_or_else(|| VersionError::Parse(input.to_string()))?;
    let tag = tokens.next().ok_or_else(|| VersionError::Parse(input.to_string()))?;
    if tokens.next().is_some() {
      return Err(VersionError::Parse(input.to_string()));
    }

    Ok(Self {
      branch: branch.to_string(),
      tag: tag.to_string(),
    })
  }

  /// Whether the tag is the pseudo tag `"^"`.
  pub fn is_pseudo_tag(&self) -> bool {
    self.tag == PSEUDO_TAG
  }
}

impl fmt::Display for ProjectVersion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.branch, self.tag)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_two_tokens() {
    let v = ProjectVersion::parse("master v1.2\n").unwrap();
    assert_eq!(v.branch, "master");
    assert_eq!(v.tag, "v1.2");
    assert!(!v.is_pseudo_tag());
  }

  #[test]
  fn parse_pseudo_tag() {
    let v = ProjectVersion::parse("devel ^").unwrap();
    assert!(v.is_pseudo_tag());
  }

  #[test]
  fn serialize_then_parse_round_trips() {
    let v = ProjectVersion {
      branch: "next".to_string(),
      tag: "v7".to_string(),
    };
    assert_eq!(ProjectVersion::parse(&v.to_string()).unwrap(), v);
  }

  #[test]
  fn missing_tag_is_a_parse_error() {
    assert!(matches!(ProjectVersion::parse("master"), Err(VersionError::Parse(_))));
    assert!(matches!(ProjectVersion::parse(""), Err(VersionError::Parse(_))));
  }

  #[test]
  fn trailing_tokens_are_rejected() {
    assert!(matches!(
      ProjectVersion::parse("master v1 extra"),
      Err(VersionError::Parse(_))
    ));
  }
}
