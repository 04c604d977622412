/// Membership resolution and owner-gated membership management
use super::{AccessLevel, Membership, MembershipRole};
use crate::{
    error::{GateError, GateResult},
    store::{AccountStore, MembershipStore},
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// Project access control
pub struct ProjectAccessControl {
    memberships: Arc<dyn MembershipStore>,
    accounts: Arc<dyn AccountStore>,
}

impl ProjectAccessControl {
    pub fn new(memberships: Arc<dyn MembershipStore>, accounts: Arc<dyn AccountStore>) -> Self {
        Self {
            memberships,
            accounts,
        }
    }

    pub async fn membership_role(
        &self,
        project_id: &str,
        account_id: &str,
    ) -> GateResult<Option<MembershipRole>> {
        self.memberships.membership_role(project_id, account_id).await
    }

    /// Access level of an account on a project (None means no access)
    pub async fn access_level(&self, project_id: &str, account_id: &str) -> GateResult<Option<AccessLevel>> {
        Ok(super::access_level(
            self.membership_role(project_id, account_id).await?,
        ))
    }

    /// Fail with `AccessDenied` unless the account holds at least `minimum`
    pub async fn require_access(
        &self,
        project_id: &str,
        account_id: &str,
        minimum: AccessLevel,
    ) -> GateResult<AccessLevel> {
        match self.access_level(project_id, account_id).await? {
            Some(level) if level.satisfies(minimum) => Ok(level),
            _ => Err(GateError::AccessDenied),
        }
    }

    /// Record the creator of a new project as its first owner
    pub async fn initialize_project(&self, project_id: &str, creator_id: &str) -> GateResult<Membership> {
        self.ensure_account(creator_id).await?;

        let membership = Membership {
            project_id: project_id.to_string(),
            account_id: creator_id.to_string(),
            role: MembershipRole::Owner,
            created_at: Utc::now(),
        };
        self.memberships.insert_first_owner(&membership).await?;

        info!(project_id = %project_id, owner = %creator_id, "Project initialized");
        Ok(membership)
    }

    pub async fn list_members(&self, project_id: &str, actor_id: &str) -> GateResult<Vec<Membership>> {
        self.ensure_project(project_id).await?;
        self.require_access(project_id, actor_id, AccessLevel::Read).await?;
        self.memberships.list_memberships(project_id).await
    }

    /// Add a member; owners only
    pub async fn add_member(
        &self,
        project_id: &str,
        actor_id: &str,
        account_id: &str,
        role: MembershipRole,
    ) -> GateResult<Membership> {
        self.ensure_project(project_id).await?;
        self.require_access(project_id, actor_id, AccessLevel::Admin).await?;
        self.ensure_account(account_id).await?;

        let membership = Membership {
            project_id: project_id.to_string(),
            account_id: account_id.to_string(),
            role,
            created_at: Utc::now(),
        };
        self.memberships.insert_membership(&membership).await?;

        info!(project_id = %project_id, account_id = %account_id, role = role.as_str(), by = %actor_id, "Member added");
        Ok(membership)
    }

    /// Change a member's role; owners only, and never away from the last owner
    pub async fn change_member_role(
        &self,
        project_id: &str,
        actor_id: &str,
        account_id: &str,
        role: MembershipRole,
    ) -> GateResult<()> {
        self.ensure_project(project_id).await?;
        self.require_access(project_id, actor_id, AccessLevel::Admin).await?;

        self.memberships
            .update_membership_role(project_id, account_id, role)
            .await
            .map_err(|e| log_owner_violation(e, project_id, account_id))?;

        info!(project_id = %project_id, account_id = %account_id, role = role.as_str(), by = %actor_id, "Member role changed");
        Ok(())
    }

    /// Remove a member
    ///
    /// Owners may remove anyone; any member may remove themselves. The last
    /// owner can do neither.
    pub async fn remove_member(&self, project_id: &str, actor_id: &str, account_id: &str) -> GateResult<()> {
        self.ensure_project(project_id).await?;
        if actor_id != account_id {
            self.require_access(project_id, actor_id, AccessLevel::Admin).await?;
        }

        self.memberships
            .delete_membership(project_id, account_id)
            .await
            .map_err(|e| log_owner_violation(e, project_id, account_id))?;

        info!(project_id = %project_id, account_id = %account_id, by = %actor_id, "Member removed");
        Ok(())
    }

    async fn ensure_project(&self, project_id: &str) -> GateResult<()> {
        if self.memberships.list_memberships(project_id).await?.is_empty() {
            return Err(GateError::NotFound("Project not found".to_string()));
        }
        Ok(())
    }

    async fn ensure_account(&self, account_id: &str) -> GateResult<()> {
        match self.accounts.get_account(account_id).await? {
            Some(account) if account.active => Ok(()),
            _ => Err(GateError::NotFound("Account not found".to_string())),
        }
    }
}

fn log_owner_violation(e: GateError, project_id: &str, account_id: &str) -> GateError {
    if matches!(e, GateError::LastOwnerViolation) {
        warn!(project_id = %project_id, account_id = %account_id, "Rejected: project would lose its last owner");
    }
    e
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{self, models::Account},
        store::SqliteStore,
    };

    async fn setup() -> (ProjectAccessControl, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::new(db::test_pool().await));

        for id in ["a", "b", "c", "d"] {
            store
                .insert_account(
                    &Account {
                        id: id.to_string(),
                        email: format!("{}@example.com", id),
                        display_name: id.to_string(),
                        password_hash: "hash".to_string(),
                        active: true,
                        second_factor_secret: None,
                        second_factor_enabled: false,
                        last_authenticated_at: None,
                        created_at: Utc::now(),
                        deactivated_at: None,
                    },
                    &[],
                )
                .await
                .unwrap();
        }

        (ProjectAccessControl::new(store.clone(), store.clone()), store)
    }

    #[tokio::test]
    async fn test_require_access_levels() {
        let (access, _store) = setup().await;
        access.initialize_project("p", "b").await.unwrap();
        access.add_member("p", "b", "a", MembershipRole::Member).await.unwrap();
        access.add_member("p", "b", "c", MembershipRole::Viewer).await.unwrap();

        assert_eq!(
            access.require_access("p", "a", AccessLevel::Write).await.unwrap(),
            AccessLevel::Write
        );
        assert!(matches!(
            access.require_access("p", "a", AccessLevel::Admin).await,
            Err(GateError::AccessDenied)
        ));
        assert!(matches!(
            access.require_access("p", "c", AccessLevel::Write).await,
            Err(GateError::AccessDenied)
        ));
        assert!(matches!(
            access.require_access("p", "d", AccessLevel::Read).await,
            Err(GateError::AccessDenied)
        ));
        assert_eq!(access.access_level("p", "d").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_only_owners_manage_members() {
        let (access, _store) = setup().await;
        access.initialize_project("p", "b").await.unwrap();
        access.add_member("p", "b", "a", MembershipRole::Member).await.unwrap();

        assert!(matches!(
            access.add_member("p", "a", "c", MembershipRole::Viewer).await,
            Err(GateError::AccessDenied)
        ));
        assert!(matches!(
            access.change_member_role("p", "a", "a", MembershipRole::Owner).await,
            Err(GateError::AccessDenied)
        ));
        assert!(matches!(
            access.remove_member("p", "a", "b").await,
            Err(GateError::AccessDenied)
        ));
        assert!(matches!(
            access.add_member("p", "b", "a", MembershipRole::Viewer).await,
            Err(GateError::Conflict(_))
        ));

        // Any member may leave
        access.remove_member("p", "a", "a").await.unwrap();
        assert_eq!(access.membership_role("p", "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_non_owner_may_leave_but_not_remove_others() {
        let (access, store) = setup().await;
        access.initialize_project("p", "b").await.unwrap();
        access.add_member("p", "b", "a", MembershipRole::Member).await.unwrap();
        access.add_member("p", "b", "c", MembershipRole::Viewer).await.unwrap();

        for (actor, target) in [("a", "c"), ("c", "a"), ("c", "b"), ("a", "b")] {
            assert!(matches!(
                access.remove_member("p", actor, target).await,
                Err(GateError::AccessDenied)
            ));
        }
        assert_eq!(store.list_memberships("p").await.unwrap().len(), 3);

        access.remove_member("p", "c", "c").await.unwrap();
        access.remove_member("p", "a", "a").await.unwrap();

        let members = store.list_memberships("p").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].account_id, "b");
    }

    #[tokio::test]
    async fn test_outsider_cannot_leave_or_remove() {
        let (access, _store) = setup().await;
        access.initialize_project("p", "b").await.unwrap();

        assert!(matches!(
            access.remove_member("p", "d", "b").await,
            Err(GateError::AccessDenied)
        ));
    }

    #[tokio::test]
    async fn test_sole_owner_cannot_leave_until_replaced() {
        let (access, store) = setup().await;
        access.initialize_project("p", "b").await.unwrap();

        assert!(matches!(
            access.remove_member("p", "b", "b").await,
            Err(GateError::LastOwnerViolation)
        ));
        assert!(matches!(
            access.change_member_role("p", "b", "b", MembershipRole::Member).await,
            Err(GateError::LastOwnerViolation)
        ));
        assert_eq!(store.list_memberships("p").await.unwrap().len(), 1);

        access.add_member("p", "b", "c", MembershipRole::Owner).await.unwrap();
        access.remove_member("p", "b", "b").await.unwrap();

        let members = access.list_members("p", "c").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].account_id, "c");
        assert_eq!(members[0].role, MembershipRole::Owner);
    }

    #[tokio::test]
    async fn test_unknown_project_and_double_init() {
        let (access, _store) = setup().await;

        assert!(matches!(
            access.add_member("nope", "b", "a", MembershipRole::Member).await,
            Err(GateError::NotFound(_))
        ));
        assert!(matches!(
            access.list_members("nope", "b").await,
            Err(GateError::NotFound(_))
        ));

        access.initialize_project("p", "b").await.unwrap();
        assert!(matches!(
            access.initialize_project("p", "c").await,
            Err(GateError::Conflict(_))
        ));
        assert!(matches!(
            access.add_member("p", "b", "ghost", MembershipRole::Member).await,
            Err(GateError::NotFound(_))
        ));
    }
}
