//! # Ruleset Bindings
//!
//! Snapshot of an approved ruleset version bound to a release, taken when the
//! release is created. Bindings are immutable afterwards.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::identity::{ReleaseKey, RulesetVersionKey};

/// How a failing rule in a bound ruleset affects the release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingMode {
    /// A failing rule rejects the release.
    Enforcing,
    /// A failing rule is recorded and otherwise ignored.
    Permissive,
}

impl BindingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enforcing => "enforcing",
            Self::Permissive => "permissive",
        }
    }
}

impl std::fmt::Display for BindingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BindingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enforcing" => Ok(Self::Enforcing),
            "permissive" => Ok(Self::Permissive),
            other => Err(format!("unknown binding mode {other:?}")),
        }
    }
}

/// A ruleset version bound to one release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesetBinding {
    pub release: ReleaseKey,
    pub ruleset_id: String,
    pub version: RulesetVersionKey,
    pub mode: BindingMode,
}

/// Binding input supplied at release creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRulesetBinding {
    pub ruleset_id: String,
    pub version: RulesetVersionKey,
    pub mode: BindingMode,
}

impl NewRulesetBinding {
    pub fn new(ruleset_id: impl Into<String>, version: RulesetVersionKey, mode: BindingMode) -> Self {
        Self {
            ruleset_id: ruleset_id.into(),
            version,
            mode,
        }
    }

    pub fn bind_to(self, release: ReleaseKey) -> RulesetBinding {
        RulesetBinding {
            release,
            ruleset_id: self.ruleset_id,
            version: self.version,
            mode: self.mode,
        }
    }
}
