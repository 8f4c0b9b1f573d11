//! Warning categories.
//!
//! Warnings are grouped into independently toggled categories. They go out
//! through `tracing` and never influence the exit status.

use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WarnCategory {
  /// Default warnings, on unless silenced.
  Default,
  /// Deprecated constructs.
  Deprecated,
  /// Other warnings.
  Other,
  /// Policy violations that do not stop the build.
  Policy,
  /// Hints.
  Hint,
}

impl WarnCategory {
  pub fn name(self) -> &'static str {
    match self {
      WarnCategory::Default => "WDEFAULT",
      WarnCategory::Deprecated => "WDEPRECATED",
      WarnCategory::Other => "WOTHER",
      WarnCategory::Policy => "WPOLICY",
      WarnCategory::Hint => "WHINT",
    }
  }
}

/// The set of enabled warning categories.
#[derive(Debug, Clone)]
pub struct Warnings {
  enabled: BTreeSet<WarnCategory>,
}

impl Default for Warnings {
  fn default() -> Self {
    Self {
      enabled: [WarnCategory::Default, WarnCategory::Other, WarnCategory::Policy].into(),
    }
  }
}

impl Warnings {
  pub fn enable(&mut self, category: WarnCategory) {
    self.enabled.insert(category);
  }

  pub fn disable(&mut self, category: WarnCategory) {
    self.enabled.remove(&category);
  }

  pub fn is_enabled(&self, category: WarnCategory) -> bool {
    self.enabled.contains(&category)
  }

  pub fn warn(&self, category: WarnCategory, message: &str) {
    if self.is_enabled(category) {
      tracing::warn!(category = category.name(), "{message}");
    }
  }
}
