//! Environment records.
//!
//! An environment is a name/value mapping whose identity is the hash over
//! its sorted `name=value` pairs. Two environments holding the same pairs
//! have the same id regardless of insertion order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::hash::Hasher;

/// An ordered name/value environment.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
  values: BTreeMap<String, String>,
}

impl Environment {
  pub fn new() -> Self {
    Self::default()
  }

  /// Set a variable, replacing any previous value. Returns `self` so calls
  /// can be chained.
  pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
    self.values.insert(name.into(), value.into());
    self
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self.values.get(name).map(String::as_str)
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  pub fn len(&self) -> usize {
    self.values.len()
  }

  /// Merge `other` into `self`.
  ///
  /// With `override_existing` set, values from `other` replace values
  /// already present; otherwise existing keys keep their value and only
  /// missing keys are added.
  pub fn merge(&mut self, other: &Environment, override_existing: bool) -> &mut Self {
    for (name, value) in &other.values {
      if override_existing || !self.values.contains_key(name) {
        self.values.insert(name.clone(), value.clone());
      }
    }
    self
  }

  /// Iterate pairs in sorted key order.
  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  /// The environment id: hash over `name=value` for each key in
  /// lexicographic order, concatenated without separators.
  pub fn id(&self) -> String {
    let mut hasher = Hasher::new();
    for (name, value) in &self.values {
      hasher.append(name).append("=").append(value);
    }
    hasher.finish()
  }

  /// Render as sorted `name=value` lines, one per pair. This is the form
  /// staged into build trees.
  pub fn to_lines(&self) -> String {
    let mut out = String::new();
    for (name, value) in &self.values {
      out.push_str(name);
      out.push('=');
      out.push_str(value);
      out.push('\n');
    }
    out
  }
}

impl FromIterator<(String, String)> for Environment {
  fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
    Self {
      values: iter.into_iter().collect(),
    }
  }
}
