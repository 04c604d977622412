/// Role definitions, assignments and effective-permission resolution
use super::{parse_permissions, system_roles, Permission, Role};
use crate::{
    error::{GateError, GateResult},
    store::{AccountStore, RoleStore},
};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Permission engine
///
/// Nothing is cached: every call reads the current role and assignment state.
pub struct PermissionEngine {
    roles: Arc<dyn RoleStore>,
    accounts: Arc<dyn AccountStore>,
}

impl PermissionEngine {
    pub fn new(roles: Arc<dyn RoleStore>, accounts: Arc<dyn AccountStore>) -> Self {
        Self { roles, accounts }
    }

    /// Union of the permissions of every role assigned to the account
    pub async fn effective_permissions(&self, account_id: &str) -> GateResult<BTreeSet<Permission>> {
        let raw = self.roles.permissions_for_account(account_id).await?;

        let mut permissions = BTreeSet::new();
        for tag in raw {
            match Permission::parse(&tag) {
                Ok(p) => {
                    permissions.insert(p);
                }
                Err(_) => warn!(account_id = %account_id, permission = %tag, "Ignoring unknown stored permission"),
            }
        }

        Ok(permissions)
    }

    pub async fn has_permission(&self, account_id: &str, permission: Permission) -> GateResult<bool> {
        Ok(self.effective_permissions(account_id).await?.contains(&permission))
    }

    pub async fn list_roles(&self) -> GateResult<Vec<Role>> {
        self.roles.list_roles().await
    }

    pub async fn get_role(&self, id: &str) -> GateResult<Role> {
        self.roles
            .get_role(id)
            .await?
            .ok_or_else(|| GateError::NotFound("Role not found".to_string()))
    }

    pub async fn roles_for_account(&self, account_id: &str) -> GateResult<Vec<Role>> {
        self.roles.roles_for_account(account_id).await
    }

    /// Create a custom role; unknown permission tags are rejected
    pub async fn create_role<S: AsRef<str>>(
        &self,
        name: &str,
        description: &str,
        permissions: &[S],
    ) -> GateResult<Role> {
        let name = name.trim();
        if name.is_empty() {
            return Err(GateError::Validation("Role name cannot be empty".to_string()));
        }

        let role = Role {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            is_system: false,
            permissions: parse_permissions(permissions)?,
            created_at: Utc::now(),
        };

        self.roles.insert_role(&role).await?;

        info!(role_id = %role.id, role = %role.name, "Role created");
        Ok(role)
    }

    /// Replace a custom role's description and permission set
    pub async fn update_role<S: AsRef<str>>(
        &self,
        id: &str,
        description: &str,
        permissions: &[S],
    ) -> GateResult<Role> {
        let permissions = parse_permissions(permissions)?;
        let existing = self.get_role(id).await?;

        if existing.is_system {
            return Err(GateError::ImmutableRole);
        }

        self.roles.update_role(id, description, &permissions).await.map_err(|e| {
            if matches!(e, GateError::LastAdminViolation) {
                warn!(role_id = %id, "Role update rejected: last administrator");
            }
            e
        })?;

        info!(role_id = %id, role = %existing.name, "Role updated");

        Ok(Role {
            description: description.to_string(),
            permissions,
            ..existing
        })
    }

    /// Delete a custom role; its assignments go with it
    pub async fn delete_role(&self, id: &str) -> GateResult<()> {
        let existing = self.get_role(id).await?;

        if existing.is_system {
            return Err(GateError::ImmutableRole);
        }

        self.roles.delete_role(id).await.map_err(|e| {
            if matches!(e, GateError::LastAdminViolation) {
                warn!(role_id = %id, "Role deletion rejected: last administrator");
            }
            e
        })?;

        info!(role_id = %id, role = %existing.name, "Role deleted");
        Ok(())
    }

    /// Assign a role; assigning an already-held role is a no-op
    pub async fn assign_role(&self, account_id: &str, role_id: &str) -> GateResult<()> {
        if self.accounts.get_account(account_id).await?.is_none() {
            return Err(GateError::NotFound("Account not found".to_string()));
        }
        let role = self.get_role(role_id).await?;

        if self.roles.assign_role(account_id, role_id, Utc::now()).await? {
            info!(account_id = %account_id, role = %role.name, "Role assigned");
        } else {
            debug!(account_id = %account_id, role = %role.name, "Role already assigned");
        }

        Ok(())
    }

    /// Remove a role assignment; removing an absent assignment is a no-op
    pub async fn unassign_role(&self, account_id: &str, role_id: &str) -> GateResult<()> {
        let role = self.get_role(role_id).await?;

        let removed = self.roles.unassign_role(account_id, role_id).await.map_err(|e| {
            if matches!(e, GateError::LastAdminViolation) {
                warn!(account_id = %account_id, role = %role.name, "Unassignment rejected: last administrator");
            }
            e
        })?;

        if removed {
            info!(account_id = %account_id, role = %role.name, "Role unassigned");
        }

        Ok(())
    }

    /// Create any missing system role; existing ones are left untouched
    pub async fn bootstrap_system_roles(&self) -> GateResult<usize> {
        let mut created = 0;

        for (name, description, permissions) in system_roles() {
            if self.roles.get_role_by_name(name).await?.is_some() {
                continue;
            }

            let role = Role {
                id: Uuid::new_v4().to_string(),
                name: name.to_string(),
                description: description.to_string(),
                is_system: true,
                permissions,
                created_at: Utc::now(),
            };

            match self.roles.insert_role(&role).await {
                Ok(()) => {
                    info!(role = %name, "System role created");
                    created += 1;
                }
                // Another instance bootstrapped it first
                Err(GateError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(created)
    }

    /// Look up a role by name
    pub async fn role_by_name(&self, name: &str) -> GateResult<Role> {
        self.roles
            .get_role_by_name(name)
            .await?
            .ok_or_else(|| GateError::NotFound(format!("Role not found: {}", name)))
    }

    /// Whether at least one active account holds the administrative permission
    pub async fn has_active_admin(&self) -> GateResult<bool> {
        Ok(!self.roles.active_admin_ids().await?.is_empty())
    }
}
