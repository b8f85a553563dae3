//! # Identifiers
//!
//! Newtype wrappers for the identifiers the engine passes around. A release
//! is addressed by its organization, its application and a numeric id; the
//! three together form a [`ReleaseKey`], which is also the primary key of the
//! release's background job.

use serde::{Deserialize, Serialize};

/// Organization (tenant) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrganizationId(pub String);

/// Application identifier, unique within an organization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApplicationId(pub String);

/// Approval rule identifier. Rules of different types never share an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(pub i64);

/// Release event identifier, assigned by the store on append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub i64);

impl OrganizationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ApplicationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OrganizationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rule:{}", self.0)
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "event:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ReleaseKey
// ---------------------------------------------------------------------------

/// Fully qualified address of a release.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReleaseKey {
    pub organization_id: OrganizationId,
    pub application_id: ApplicationId,
    pub release_id: i64,
}

impl ReleaseKey {
    pub fn new(
        organization_id: impl Into<String>,
        application_id: impl Into<String>,
        release_id: i64,
    ) -> Self {
        Self {
            organization_id: OrganizationId::new(organization_id),
            application_id: ApplicationId::new(application_id),
            release_id,
        }
    }
}

impl std::fmt::Display for ReleaseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}#{}",
            self.organization_id, self.application_id, self.release_id
        )
    }
}

// ---------------------------------------------------------------------------
// RulesetVersionKey
// ---------------------------------------------------------------------------

/// Identifies one approved version (major version + adjustment) of a ruleset.
///
/// Rules belong to exactly one version key. Bindings snapshot the version key
/// at release creation, so later adjustments never change what a release is
/// evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RulesetVersionKey {
    pub major_version_id: i64,
    pub minor_version_number: i32,
}

impl RulesetVersionKey {
    pub fn new(major_version_id: i64, minor_version_number: i32) -> Self {
        Self {
            major_version_id,
            minor_version_number,
        }
    }
}

impl std::fmt::Display for RulesetVersionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}.{}", self.major_version_id, self.minor_version_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_key_display_includes_all_parts() {
        let key = ReleaseKey::new("acme", "billing", 42);
        assert_eq!(key.to_string(), "acme/billing#42");
    }

    #[test]
    fn release_keys_order_by_org_then_app_then_id() {
        let mut keys = vec![
            ReleaseKey::new("b", "x", 1),
            ReleaseKey::new("a", "y", 2),
            ReleaseKey::new("a", "y", 1),
        ];
        keys.sort();
        assert_eq!(keys[0], ReleaseKey::new("a", "y", 1));
        assert_eq!(keys[2], ReleaseKey::new("b", "x", 1));
    }
}
