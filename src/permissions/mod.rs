/// Global role-based permissions
///
/// Roles are named sets of permission tags. An account's effective permission
/// set is the union of the permissions of every role assigned to it, resolved
/// fresh for each authorization decision.

mod engine;

pub use engine::PermissionEngine;

use crate::error::{GateError, GateResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Closed set of global permission tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Permission {
    UsersView,
    UsersManage,
    RolesView,
    RolesManage,
    ProjectsView,
    ProjectsCreate,
    ProjectsManage,
    TasksView,
    TasksCreate,
    TasksEdit,
    TasksDelete,
    /// The administrative permission guarded by the last-admin invariant
    SystemAdmin,
}

impl Permission {
    pub const ALL: [Permission; 12] = [
        Permission::UsersView,
        Permission::UsersManage,
        Permission::RolesView,
        Permission::RolesManage,
        Permission::ProjectsView,
        Permission::ProjectsCreate,
        Permission::ProjectsManage,
        Permission::TasksView,
        Permission::TasksCreate,
        Permission::TasksEdit,
        Permission::TasksDelete,
        Permission::SystemAdmin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::UsersView => "users:view",
            Permission::UsersManage => "users:manage",
            Permission::RolesView => "roles:view",
            Permission::RolesManage => "roles:manage",
            Permission::ProjectsView => "projects:view",
            Permission::ProjectsCreate => "projects:create",
            Permission::ProjectsManage => "projects:manage",
            Permission::TasksView => "tasks:view",
            Permission::TasksCreate => "tasks:create",
            Permission::TasksEdit => "tasks:edit",
            Permission::TasksDelete => "tasks:delete",
            Permission::SystemAdmin => "system:admin",
        }
    }

    /// Parse a permission tag, rejecting anything outside the closed set
    pub fn parse(s: &str) -> GateResult<Self> {
        Permission::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| GateError::Validation(format!("Unknown permission: {}", s)))
    }

    pub fn is_administrative(&self) -> bool {
        matches!(self, Permission::SystemAdmin)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Permission {
    type Error = GateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Permission::parse(&value)
    }
}

impl From<Permission> for String {
    fn from(p: Permission) -> Self {
        p.as_str().to_string()
    }
}

/// Parse a list of raw permission strings into a de-duplicated set
pub fn parse_permissions<S: AsRef<str>>(raw: &[S]) -> GateResult<BTreeSet<Permission>> {
    raw.iter().map(|s| Permission::parse(s.as_ref())).collect()
}

/// Role definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: String,
    pub name: String,
    pub description: String,
    /// System roles are immutable and undeletable
    pub is_system: bool,
    pub permissions: BTreeSet<Permission>,
    pub created_at: DateTime<Utc>,
}

/// Built-in role names
pub const ADMINISTRATOR_ROLE: &str = "Administrator";
pub const TEAM_MEMBER_ROLE: &str = "TeamMember";
pub const VIEWER_ROLE: &str = "Viewer";

/// System roles created at bootstrap: (name, description, permissions)
pub fn system_roles() -> Vec<(&'static str, &'static str, BTreeSet<Permission>)> {
    use Permission::*;

    vec![
        (
            ADMINISTRATOR_ROLE,
            "Full administrative access",
            Permission::ALL.into_iter().collect(),
        ),
        (
            TEAM_MEMBER_ROLE,
            "Create projects and work on tasks",
            [ProjectsView, ProjectsCreate, TasksView, TasksCreate, TasksEdit]
                .into_iter()
                .collect(),
        ),
        (
            VIEWER_ROLE,
            "Read-only access",
            [ProjectsView, TasksView].into_iter().collect(),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_parse() {
        assert_eq!(Permission::parse("tasks:edit").unwrap(), Permission::TasksEdit);
        assert_eq!(Permission::parse("system:admin").unwrap(), Permission::SystemAdmin);
        assert!(matches!(
            Permission::parse("tasks:editt"),
            Err(GateError::Validation(_))
        ));
        assert!(Permission::parse("TASKS:EDIT").is_err());
    }

    #[test]
    fn test_every_tag_parses_back() {
        for p in Permission::ALL {
            assert_eq!(Permission::parse(p.as_str()).unwrap(), p);
        }
    }

    #[test]
    fn test_parse_permissions_dedups_and_rejects() {
        let set = parse_permissions(&["tasks:view", "tasks:view", "projects:view"]).unwrap();
        assert_eq!(set.len(), 2);

        assert!(parse_permissions(&["tasks:view", "bogus"]).is_err());
    }

    #[test]
    fn test_permission_serde() {
        let json = serde_json::to_string(&Permission::RolesManage).unwrap();
        assert_eq!(json, "\"roles:manage\"");

        let parsed: Permission = serde_json::from_str("\"users:view\"").unwrap();
        assert_eq!(parsed, Permission::UsersView);

        assert!(serde_json::from_str::<Permission>("\"users:fly\"").is_err());
    }

    #[test]
    fn test_system_roles() {
        let roles = system_roles();
        let admin = &roles[0];
        assert_eq!(admin.0, ADMINISTRATOR_ROLE);
        assert!(admin.2.contains(&Permission::SystemAdmin));

        let member = roles.iter().find(|r| r.0 == TEAM_MEMBER_ROLE).unwrap();
        assert!(member.2.contains(&Permission::TasksEdit));
        assert!(!member.2.contains(&Permission::SystemAdmin));
    }
}
