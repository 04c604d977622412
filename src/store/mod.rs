/// Persistence interfaces for the authentication core
///
/// Services receive these as `Arc<dyn ...>` handles instead of reaching for a
/// shared database connection. `SqliteStore` implements all of them; tests run
/// the same implementation against an in-memory database.

pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::{
    db::models::{Account, Credential, CredentialKind, RotationOutcome},
    error::GateResult,
    permissions::{Permission, Role},
    projects::{Membership, MembershipRole},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Account persistence
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Insert a new account with its initial roles as one transaction
    ///
    /// Fails with `Conflict` if the email is taken and `NotFound` for an
    /// unknown role; either way nothing is written.
    async fn insert_account(&self, account: &Account, role_ids: &[&str]) -> GateResult<()>;

    async fn get_account(&self, id: &str) -> GateResult<Option<Account>>;

    async fn get_account_by_email(&self, email: &str) -> GateResult<Option<Account>>;

    async fn update_password_hash(&self, id: &str, password_hash: &str) -> GateResult<()>;

    async fn update_display_name(&self, id: &str, display_name: &str) -> GateResult<()>;

    /// Store (or clear) the TOTP secret and the enabled flag together
    async fn set_second_factor(&self, id: &str, secret: Option<&str>, enabled: bool) -> GateResult<()>;

    async fn record_authentication(&self, id: &str, at: DateTime<Utc>) -> GateResult<()>;

    /// Soft-deactivate; fails with `LastAdminViolation` for the last active administrator
    async fn deactivate_account(&self, id: &str, at: DateTime<Utc>) -> GateResult<()>;

    async fn reactivate_account(&self, id: &str) -> GateResult<()>;

    async fn list_accounts(&self, limit: i64, offset: i64) -> GateResult<Vec<Account>>;
}

/// Opaque credential persistence (refresh and reset tokens, stored as digests)
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn insert_credential(&self, credential: &Credential) -> GateResult<()>;

    async fn find_credential(
        &self,
        token_hash: &str,
        kind: CredentialKind,
    ) -> GateResult<Option<Credential>>;

    /// Revoke a refresh credential and store its replacement as one transaction
    ///
    /// The revoke is a compare-and-swap on the unrevoked state, so of several
    /// concurrent callers presenting the same credential exactly one observes
    /// `Rotated`.
    async fn rotate_refresh(
        &self,
        token_hash: &str,
        replacement_hash: &str,
        replacement_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> GateResult<RotationOutcome>;

    /// Single-use consumption of a reset credential, returning its account id
    async fn consume_reset(&self, token_hash: &str, now: DateTime<Utc>) -> GateResult<Option<String>>;

    async fn revoke_family(&self, family_id: &str, now: DateTime<Utc>) -> GateResult<u64>;

    async fn revoke_all_for_account(&self, account_id: &str, now: DateTime<Utc>) -> GateResult<u64>;

    /// Delete credentials that expired before the given instant
    async fn purge_expired(&self, before: DateTime<Utc>) -> GateResult<u64>;
}

/// Role and role-assignment persistence
#[async_trait]
pub trait RoleStore: Send + Sync {
    /// Insert a role with its permissions; fails with `Conflict` on a duplicate name
    async fn insert_role(&self, role: &Role) -> GateResult<()>;

    async fn get_role(&self, id: &str) -> GateResult<Option<Role>>;

    async fn get_role_by_name(&self, name: &str) -> GateResult<Option<Role>>;

    async fn list_roles(&self) -> GateResult<Vec<Role>>;

    /// Replace description and permissions; fails with `LastAdminViolation`
    /// if dropping the administrative permission would leave no administrator
    async fn update_role(
        &self,
        id: &str,
        description: &str,
        permissions: &BTreeSet<Permission>,
    ) -> GateResult<()>;

    /// Delete a role and cascade its assignments, guarded like `update_role`
    async fn delete_role(&self, id: &str) -> GateResult<()>;

    /// Returns false if the assignment already existed
    async fn assign_role(&self, account_id: &str, role_id: &str, at: DateTime<Utc>) -> GateResult<bool>;

    /// Returns false if there was nothing to remove; guarded like `update_role`
    async fn unassign_role(&self, account_id: &str, role_id: &str) -> GateResult<bool>;

    async fn roles_for_account(&self, account_id: &str) -> GateResult<Vec<Role>>;

    /// Raw permission tags granted through every assigned role
    async fn permissions_for_account(&self, account_id: &str) -> GateResult<Vec<String>>;

    /// Ids of active accounts holding the administrative permission
    async fn active_admin_ids(&self) -> GateResult<Vec<String>>;
}

/// Project membership persistence
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Insert the first owner of a project; fails with `Conflict` if it has members
    async fn insert_first_owner(&self, membership: &Membership) -> GateResult<()>;

    /// Fails with `Conflict` if the pair already has a membership
    async fn insert_membership(&self, membership: &Membership) -> GateResult<()>;

    async fn membership_role(
        &self,
        project_id: &str,
        account_id: &str,
    ) -> GateResult<Option<MembershipRole>>;

    async fn list_memberships(&self, project_id: &str) -> GateResult<Vec<Membership>>;

    /// Change a member's role; fails with `LastOwnerViolation` when demoting the last owner
    async fn update_membership_role(
        &self,
        project_id: &str,
        account_id: &str,
        role: MembershipRole,
    ) -> GateResult<()>;

    /// Remove a member; fails with `LastOwnerViolation` for the last owner
    async fn delete_membership(&self, project_id: &str, account_id: &str) -> GateResult<()>;
}
