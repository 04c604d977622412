/// Project-scoped access control
///
/// Each (project, account) pair has at most one membership role. The role maps
/// to an ordered access level that resource handlers check before acting.

mod access;

pub use access::ProjectAccessControl;

use crate::error::{GateError, GateResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Membership role within a single project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipRole {
    Owner,
    Member,
    Viewer,
}

impl MembershipRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipRole::Owner => "owner",
            MembershipRole::Member => "member",
            MembershipRole::Viewer => "viewer",
        }
    }

    pub fn parse(s: &str) -> GateResult<Self> {
        match s {
            "owner" => Ok(MembershipRole::Owner),
            "member" => Ok(MembershipRole::Member),
            "viewer" => Ok(MembershipRole::Viewer),
            _ => Err(GateError::Validation(format!("Invalid membership role: {}", s))),
        }
    }

    pub fn access_level(&self) -> AccessLevel {
        match self {
            MembershipRole::Owner => AccessLevel::Admin,
            MembershipRole::Member => AccessLevel::Write,
            MembershipRole::Viewer => AccessLevel::Read,
        }
    }
}

/// Ordered access level: Read < Write < Admin
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Read,
    Write,
    Admin,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Read => "read",
            AccessLevel::Write => "write",
            AccessLevel::Admin => "admin",
        }
    }

    /// Check if this level satisfies a required minimum
    pub fn satisfies(&self, required: AccessLevel) -> bool {
        *self >= required
    }
}

/// Resolve the access level for an optional membership (None means no access)
pub fn access_level(role: Option<MembershipRole>) -> Option<AccessLevel> {
    role.map(|r| r.access_level())
}

/// Project membership record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub project_id: String,
    pub account_id: String,
    pub role: MembershipRole,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_level_mapping() {
        assert_eq!(access_level(Some(MembershipRole::Owner)), Some(AccessLevel::Admin));
        assert_eq!(access_level(Some(MembershipRole::Member)), Some(AccessLevel::Write));
        assert_eq!(access_level(Some(MembershipRole::Viewer)), Some(AccessLevel::Read));
        assert_eq!(access_level(None), None);
    }

    #[test]
    fn test_access_level_ordering() {
        assert!(AccessLevel::Admin > AccessLevel::Write);
        assert!(AccessLevel::Write > AccessLevel::Read);

        assert!(AccessLevel::Admin.satisfies(AccessLevel::Read));
        assert!(AccessLevel::Write.satisfies(AccessLevel::Write));
        assert!(!AccessLevel::Write.satisfies(AccessLevel::Admin));
        assert!(!AccessLevel::Read.satisfies(AccessLevel::Write));
    }

    #[test]
    fn test_membership_role_parse() {
        assert_eq!(MembershipRole::parse("owner").unwrap(), MembershipRole::Owner);
        assert_eq!(MembershipRole::Viewer.as_str(), "viewer");
        assert!(MembershipRole::parse("Owner").is_err());
    }
}
