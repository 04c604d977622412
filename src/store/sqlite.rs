/// SQLite implementation of the store interfaces
///
/// Invariant-guarded mutations (last administrator, last project owner) run
/// inside `BEGIN IMMEDIATE` transactions so the check and the write observe
/// the same state.
use crate::{
    db::models::{Account, Credential, CredentialKind, RotationOutcome},
    error::{GateError, GateResult},
    permissions::{Permission, Role},
    projects::{Membership, MembershipRole},
    store::{AccountStore, CredentialStore, MembershipStore, RoleStore},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

const ACCOUNT_COLUMNS: &str = "id, email, display_name, password_hash, active, second_factor_secret, \
     second_factor_enabled, last_authenticated_at, created_at, deactivated_at";

const CREDENTIAL_COLUMNS: &str =
    "id, account_id, token_hash, kind, family_id, expires_at, revoked, revoked_at, created_at";

/// Base query counting active accounts that hold the administrative permission
const ACTIVE_ADMINS: &str = "SELECT DISTINCT a.id FROM accounts a \
     JOIN account_roles ar ON ar.account_id = a.id \
     JOIN role_permissions rp ON rp.role_id = ar.role_id \
     WHERE a.active = 1 AND rp.permission = 'system:admin'";

/// Part of the model a pending mutation takes away from the admin set
enum AdminExclusion<'a> {
    Account(&'a str),
    Assignment { account_id: &'a str, role_id: &'a str },
    Role(&'a str),
}

/// SQLite-backed store
#[derive(Clone)]
pub struct SqliteStore {
    db: SqlitePool,
}

impl SqliteStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Transaction holding the database write lock from its first statement
    async fn write_tx(&self) -> GateResult<Transaction<'static, Sqlite>> {
        Ok(self.db.begin_with("BEGIN IMMEDIATE").await?)
    }

    /// Fail with `LastAdminViolation` if the exclusion would leave no active administrator
    async fn ensure_admin_survives(
        conn: &mut SqliteConnection,
        exclusion: AdminExclusion<'_>,
    ) -> GateResult<()> {
        let before: Vec<String> = sqlx::query_scalar(ACTIVE_ADMINS)
            .fetch_all(&mut *conn)
            .await?;

        if before.is_empty() {
            return Ok(());
        }

        let remaining: Vec<String> = match exclusion {
            AdminExclusion::Account(account_id) => {
                sqlx::query_scalar(&format!("{} AND a.id <> ?1", ACTIVE_ADMINS))
                    .bind(account_id)
                    .fetch_all(&mut *conn)
                    .await?
            }
            AdminExclusion::Assignment { account_id, role_id } => {
                sqlx::query_scalar(&format!(
                    "{} AND NOT (ar.account_id = ?1 AND ar.role_id = ?2)",
                    ACTIVE_ADMINS
                ))
                .bind(account_id)
                .bind(role_id)
                .fetch_all(&mut *conn)
                .await?
            }
            AdminExclusion::Role(role_id) => {
                sqlx::query_scalar(&format!("{} AND ar.role_id <> ?1", ACTIVE_ADMINS))
                    .bind(role_id)
                    .fetch_all(&mut *conn)
                    .await?
            }
        };

        if remaining.is_empty() {
            return Err(GateError::LastAdminViolation);
        }

        Ok(())
    }

    /// Fail with `LastOwnerViolation` if the account is the project's only owner
    async fn ensure_owner_survives(
        conn: &mut SqliteConnection,
        project_id: &str,
        account_id: &str,
    ) -> GateResult<()> {
        let other_owners: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM project_memberships
             WHERE project_id = ?1 AND role = 'owner' AND account_id <> ?2",
        )
        .bind(project_id)
        .bind(account_id)
        .fetch_one(&mut *conn)
        .await?;

        if other_owners == 0 {
            return Err(GateError::LastOwnerViolation);
        }

        Ok(())
    }

    async fn load_permissions(
        conn: &mut SqliteConnection,
        role_id: &str,
    ) -> GateResult<BTreeSet<Permission>> {
        let raw: Vec<String> =
            sqlx::query_scalar("SELECT permission FROM role_permissions WHERE role_id = ?1")
                .bind(role_id)
                .fetch_all(&mut *conn)
                .await?;

        raw.iter()
            .map(|p| Permission::parse(p).map_err(|_| stored_permission_error(p)))
            .collect()
    }

    async fn replace_permissions(
        conn: &mut SqliteConnection,
        role_id: &str,
        permissions: &BTreeSet<Permission>,
    ) -> GateResult<()> {
        sqlx::query("DELETE FROM role_permissions WHERE role_id = ?1")
            .bind(role_id)
            .execute(&mut *conn)
            .await?;

        for permission in permissions {
            sqlx::query("INSERT INTO role_permissions (role_id, permission) VALUES (?1, ?2)")
                .bind(role_id)
                .bind(permission.as_str())
                .execute(&mut *conn)
                .await?;
        }

        Ok(())
    }

    async fn fetch_role(&self, filter: &str, value: &str) -> GateResult<Option<Role>> {
        let mut conn = self.db.acquire().await?;

        let row = sqlx::query(&format!(
            "SELECT id, name, description, is_system, created_at FROM roles WHERE {} = ?1",
            filter
        ))
        .bind(value)
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => {
                let id: String = row.try_get("id")?;
                let permissions = Self::load_permissions(&mut conn, &id).await?;
                Ok(Some(role_from_row(&row, permissions)?))
            }
            None => Ok(None),
        }
    }

    /// Attach permissions to a batch of role rows
    async fn roles_from_rows(&self, rows: Vec<SqliteRow>) -> GateResult<Vec<Role>> {
        let grants = sqlx::query("SELECT role_id, permission FROM role_permissions")
            .fetch_all(&self.db)
            .await?;

        let mut by_role: HashMap<String, BTreeSet<Permission>> = HashMap::new();
        for grant in grants {
            let role_id: String = grant.try_get("role_id")?;
            let raw: String = grant.try_get("permission")?;
            let permission = Permission::parse(&raw).map_err(|_| stored_permission_error(&raw))?;
            by_role.entry(role_id).or_default().insert(permission);
        }

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                role_from_row(row, by_role.remove(&id).unwrap_or_default())
            })
            .collect()
    }
}

fn stored_permission_error(raw: &str) -> GateError {
    GateError::Internal(format!("Unknown permission stored in database: {}", raw))
}

fn conflict_on_unique(err: sqlx::Error, message: &str) -> GateError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            GateError::Conflict(message.to_string())
        }
        _ => GateError::Database(err),
    }
}

async fn insert_account_row(conn: &mut SqliteConnection, account: &Account) -> GateResult<()> {
    sqlx::query(
        "INSERT INTO accounts (id, email, display_name, password_hash, active,
                               second_factor_secret, second_factor_enabled,
                               last_authenticated_at, created_at, deactivated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )
    .bind(&account.id)
    .bind(&account.email)
    .bind(&account.display_name)
    .bind(&account.password_hash)
    .bind(account.active)
    .bind(&account.second_factor_secret)
    .bind(account.second_factor_enabled)
    .bind(account.last_authenticated_at)
    .bind(account.created_at)
    .bind(account.deactivated_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| conflict_on_unique(e, "Email already registered"))?;

    Ok(())
}

fn credential_from_row(row: &SqliteRow) -> GateResult<Credential> {
    let kind: String = row.try_get("kind")?;

    Ok(Credential {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        token_hash: row.try_get("token_hash")?,
        kind: CredentialKind::parse(&kind)?,
        family_id: row.try_get("family_id")?,
        expires_at: row.try_get("expires_at")?,
        revoked: row.try_get("revoked")?,
        revoked_at: row.try_get("revoked_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn role_from_row(row: &SqliteRow, permissions: BTreeSet<Permission>) -> GateResult<Role> {
    Ok(Role {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        is_system: row.try_get("is_system")?,
        permissions,
        created_at: row.try_get("created_at")?,
    })
}

fn membership_from_row(row: &SqliteRow) -> GateResult<Membership> {
    let role: String = row.try_get("role")?;

    Ok(Membership {
        project_id: row.try_get("project_id")?,
        account_id: row.try_get("account_id")?,
        role: MembershipRole::parse(&role)?,
        created_at: row.try_get("created_at")?,
    })
}

// ============================================================================
// Accounts
// ============================================================================

#[async_trait]
impl AccountStore for SqliteStore {
    async fn insert_account(&self, account: &Account, role_ids: &[&str]) -> GateResult<()> {
        let mut tx = self.write_tx().await?;

        insert_account_row(&mut tx, account).await?;

        for role_id in role_ids {
            let role_exists: Option<String> = sqlx::query_scalar("SELECT id FROM roles WHERE id = ?1")
                .bind(*role_id)
                .fetch_optional(&mut *tx)
                .await?;
            if role_exists.is_none() {
                return Err(GateError::NotFound("Role not found".to_string()));
            }

            sqlx::query(
                "INSERT OR IGNORE INTO account_roles (account_id, role_id, assigned_at) VALUES (?1, ?2, ?3)",
            )
            .bind(&account.id)
            .bind(*role_id)
            .bind(account.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_account(&self, id: &str) -> GateResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE id = ?1",
            ACCOUNT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        Ok(account)
    }

    async fn get_account_by_email(&self, email: &str) -> GateResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE email = ?1",
            ACCOUNT_COLUMNS
        ))
        .bind(email)
        .fetch_optional(&self.db)
        .await?;

        Ok(account)
    }

    async fn update_password_hash(&self, id: &str, password_hash: &str) -> GateResult<()> {
        let result = sqlx::query("UPDATE accounts SET password_hash = ?1 WHERE id = ?2")
            .bind(password_hash)
            .bind(id)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(GateError::NotFound("Account not found".to_string()));
        }

        Ok(())
    }

    async fn update_display_name(&self, id: &str, display_name: &str) -> GateResult<()> {
        let result = sqlx::query("UPDATE accounts SET display_name = ?1 WHERE id = ?2")
            .bind(display_name)
            .bind(id)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(GateError::NotFound("Account not found".to_string()));
        }

        Ok(())
    }

    async fn set_second_factor(&self, id: &str, secret: Option<&str>, enabled: bool) -> GateResult<()> {
        let result = sqlx::query(
            "UPDATE accounts SET second_factor_secret = ?1, second_factor_enabled = ?2 WHERE id = ?3",
        )
        .bind(secret)
        .bind(enabled)
        .bind(id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(GateError::NotFound("Account not found".to_string()));
        }

        Ok(())
    }

    async fn record_authentication(&self, id: &str, at: DateTime<Utc>) -> GateResult<()> {
        sqlx::query("UPDATE accounts SET last_authenticated_at = ?1 WHERE id = ?2")
            .bind(at)
            .bind(id)
            .execute(&self.db)
            .await?;

        Ok(())
    }

    async fn deactivate_account(&self, id: &str, at: DateTime<Utc>) -> GateResult<()> {
        let mut tx = self.write_tx().await?;

        let active: Option<bool> = sqlx::query_scalar("SELECT active FROM accounts WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        match active {
            None => return Err(GateError::NotFound("Account not found".to_string())),
            Some(false) => return Ok(()),
            Some(true) => {}
        }

        Self::ensure_admin_survives(&mut tx, AdminExclusion::Account(id)).await?;

        sqlx::query("UPDATE accounts SET active = 0, deactivated_at = ?1 WHERE id = ?2")
            .bind(at)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn reactivate_account(&self, id: &str) -> GateResult<()> {
        let result = sqlx::query("UPDATE accounts SET active = 1, deactivated_at = NULL WHERE id = ?1")
            .bind(id)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(GateError::NotFound("Account not found".to_string()));
        }

        Ok(())
    }

    async fn list_accounts(&self, limit: i64, offset: i64) -> GateResult<Vec<Account>> {
        let accounts = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts ORDER BY created_at ASC, id ASC LIMIT ?1 OFFSET ?2",
            ACCOUNT_COLUMNS
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db)
        .await?;

        Ok(accounts)
    }
}

// ============================================================================
// Credentials
// ============================================================================

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn insert_credential(&self, credential: &Credential) -> GateResult<()> {
        sqlx::query(
            "INSERT INTO credentials (id, account_id, token_hash, kind, family_id,
                                      expires_at, revoked, revoked_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&credential.id)
        .bind(&credential.account_id)
        .bind(&credential.token_hash)
        .bind(credential.kind.as_str())
        .bind(&credential.family_id)
        .bind(credential.expires_at)
        .bind(credential.revoked)
        .bind(credential.revoked_at)
        .bind(credential.created_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn find_credential(
        &self,
        token_hash: &str,
        kind: CredentialKind,
    ) -> GateResult<Option<Credential>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM credentials WHERE token_hash = ?1 AND kind = ?2",
            CREDENTIAL_COLUMNS
        ))
        .bind(token_hash)
        .bind(kind.as_str())
        .fetch_optional(&self.db)
        .await?;

        row.as_ref().map(credential_from_row).transpose()
    }

    async fn rotate_refresh(
        &self,
        token_hash: &str,
        replacement_hash: &str,
        replacement_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> GateResult<RotationOutcome> {
        // Classify before taking the write lock: a credential already revoked
        // here is a replay, one revoked underneath us below is a lost race.
        let Some(current) = self.find_credential(token_hash, CredentialKind::Refresh).await? else {
            return Ok(RotationOutcome::Unknown);
        };

        if current.revoked {
            let revoked = self.revoke_family(&current.family_id, now).await?;
            return Ok(RotationOutcome::Replayed {
                family_id: current.family_id,
                revoked,
            });
        }

        if current.expires_at <= now {
            return Ok(RotationOutcome::Expired);
        }

        let mut tx = self.write_tx().await?;

        let swapped = sqlx::query(
            "UPDATE credentials SET revoked = 1, revoked_at = ?1 WHERE id = ?2 AND revoked = 0",
        )
        .bind(now)
        .bind(&current.id)
        .execute(&mut *tx)
        .await?;

        if swapped.rows_affected() == 0 {
            return Ok(RotationOutcome::LostRace);
        }

        sqlx::query(
            "INSERT INTO credentials (id, account_id, token_hash, kind, family_id,
                                      expires_at, revoked, revoked_at, created_at)
             VALUES (?1, ?2, ?3, 'refresh', ?4, ?5, 0, NULL, ?6)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&current.account_id)
        .bind(replacement_hash)
        .bind(&current.family_id)
        .bind(replacement_expires_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(RotationOutcome::Rotated {
            account_id: current.account_id,
            family_id: current.family_id,
        })
    }

    async fn consume_reset(&self, token_hash: &str, now: DateTime<Utc>) -> GateResult<Option<String>> {
        let account_id: Option<String> = sqlx::query_scalar(
            "UPDATE credentials SET revoked = 1, revoked_at = ?1
             WHERE token_hash = ?2 AND kind = 'reset' AND revoked = 0 AND expires_at > ?1
             RETURNING account_id",
        )
        .bind(now)
        .bind(token_hash)
        .fetch_optional(&self.db)
        .await?;

        Ok(account_id)
    }

    async fn revoke_family(&self, family_id: &str, now: DateTime<Utc>) -> GateResult<u64> {
        let result = sqlx::query(
            "UPDATE credentials SET revoked = 1, revoked_at = ?1 WHERE family_id = ?2 AND revoked = 0",
        )
        .bind(now)
        .bind(family_id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    async fn revoke_all_for_account(&self, account_id: &str, now: DateTime<Utc>) -> GateResult<u64> {
        let result = sqlx::query(
            "UPDATE credentials SET revoked = 1, revoked_at = ?1 WHERE account_id = ?2 AND revoked = 0",
        )
        .bind(now)
        .bind(account_id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    async fn purge_expired(&self, before: DateTime<Utc>) -> GateResult<u64> {
        let result = sqlx::query("DELETE FROM credentials WHERE expires_at < ?1")
            .bind(before)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected())
    }
}

// ============================================================================
// Roles
// ============================================================================

#[async_trait]
impl RoleStore for SqliteStore {
    async fn insert_role(&self, role: &Role) -> GateResult<()> {
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "INSERT INTO roles (id, name, description, is_system, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&role.id)
        .bind(&role.name)
        .bind(&role.description)
        .bind(role.is_system)
        .bind(role.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| conflict_on_unique(e, "Role name already exists"))?;

        Self::replace_permissions(&mut tx, &role.id, &role.permissions).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_role(&self, id: &str) -> GateResult<Option<Role>> {
        self.fetch_role("id", id).await
    }

    async fn get_role_by_name(&self, name: &str) -> GateResult<Option<Role>> {
        self.fetch_role("name", name).await
    }

    async fn list_roles(&self) -> GateResult<Vec<Role>> {
        let rows = sqlx::query(
            "SELECT id, name, description, is_system, created_at FROM roles
             ORDER BY is_system DESC, name ASC",
        )
        .fetch_all(&self.db)
        .await?;

        self.roles_from_rows(rows).await
    }

    async fn update_role(
        &self,
        id: &str,
        description: &str,
        permissions: &BTreeSet<Permission>,
    ) -> GateResult<()> {
        let mut tx = self.write_tx().await?;

        let result = sqlx::query("UPDATE roles SET description = ?1 WHERE id = ?2")
            .bind(description)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(GateError::NotFound("Role not found".to_string()));
        }

        if !permissions.iter().any(Permission::is_administrative) {
            Self::ensure_admin_survives(&mut tx, AdminExclusion::Role(id)).await?;
        }

        Self::replace_permissions(&mut tx, id, permissions).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_role(&self, id: &str) -> GateResult<()> {
        let mut tx = self.write_tx().await?;

        Self::ensure_admin_survives(&mut tx, AdminExclusion::Role(id)).await?;

        sqlx::query("DELETE FROM account_roles WHERE role_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM role_permissions WHERE role_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM roles WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(GateError::NotFound("Role not found".to_string()));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn assign_role(&self, account_id: &str, role_id: &str, at: DateTime<Utc>) -> GateResult<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO account_roles (account_id, role_id, assigned_at) VALUES (?1, ?2, ?3)",
        )
        .bind(account_id)
        .bind(role_id)
        .bind(at)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn unassign_role(&self, account_id: &str, role_id: &str) -> GateResult<bool> {
        let mut tx = self.write_tx().await?;

        Self::ensure_admin_survives(&mut tx, AdminExclusion::Assignment { account_id, role_id })
            .await?;

        let result = sqlx::query("DELETE FROM account_roles WHERE account_id = ?1 AND role_id = ?2")
            .bind(account_id)
            .bind(role_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn roles_for_account(&self, account_id: &str) -> GateResult<Vec<Role>> {
        let rows = sqlx::query(
            "SELECT r.id, r.name, r.description, r.is_system, r.created_at
             FROM roles r JOIN account_roles ar ON ar.role_id = r.id
             WHERE ar.account_id = ?1
             ORDER BY r.name ASC",
        )
        .bind(account_id)
        .fetch_all(&self.db)
        .await?;

        self.roles_from_rows(rows).await
    }

    async fn permissions_for_account(&self, account_id: &str) -> GateResult<Vec<String>> {
        let permissions = sqlx::query_scalar(
            "SELECT DISTINCT rp.permission
             FROM account_roles ar JOIN role_permissions rp ON rp.role_id = ar.role_id
             WHERE ar.account_id = ?1",
        )
        .bind(account_id)
        .fetch_all(&self.db)
        .await?;

        Ok(permissions)
    }

    async fn active_admin_ids(&self) -> GateResult<Vec<String>> {
        let ids = sqlx::query_scalar(ACTIVE_ADMINS).fetch_all(&self.db).await?;
        Ok(ids)
    }
}

// ============================================================================
// Project memberships
// ============================================================================

#[async_trait]
impl MembershipStore for SqliteStore {
    async fn insert_first_owner(&self, membership: &Membership) -> GateResult<()> {
        let mut tx = self.write_tx().await?;

        let existing: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM project_memberships WHERE project_id = ?1")
                .bind(&membership.project_id)
                .fetch_one(&mut *tx)
                .await?;

        if existing > 0 {
            return Err(GateError::Conflict("Project already initialized".to_string()));
        }

        sqlx::query(
            "INSERT INTO project_memberships (project_id, account_id, role, created_at)
             VALUES (?1, ?2, 'owner', ?3)",
        )
        .bind(&membership.project_id)
        .bind(&membership.account_id)
        .bind(membership.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_membership(&self, membership: &Membership) -> GateResult<()> {
        sqlx::query(
            "INSERT INTO project_memberships (project_id, account_id, role, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&membership.project_id)
        .bind(&membership.account_id)
        .bind(membership.role.as_str())
        .bind(membership.created_at)
        .execute(&self.db)
        .await
        .map_err(|e| conflict_on_unique(e, "Account is already a project member"))?;

        Ok(())
    }

    async fn membership_role(
        &self,
        project_id: &str,
        account_id: &str,
    ) -> GateResult<Option<MembershipRole>> {
        let role: Option<String> = sqlx::query_scalar(
            "SELECT role FROM project_memberships WHERE project_id = ?1 AND account_id = ?2",
        )
        .bind(project_id)
        .bind(account_id)
        .fetch_optional(&self.db)
        .await?;

        role.as_deref().map(MembershipRole::parse).transpose()
    }

    async fn list_memberships(&self, project_id: &str) -> GateResult<Vec<Membership>> {
        let rows = sqlx::query(
            "SELECT project_id, account_id, role, created_at FROM project_memberships
             WHERE project_id = ?1
             ORDER BY created_at ASC, account_id ASC",
        )
        .bind(project_id)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(membership_from_row).collect()
    }

    async fn update_membership_role(
        &self,
        project_id: &str,
        account_id: &str,
        role: MembershipRole,
    ) -> GateResult<()> {
        let mut tx = self.write_tx().await?;

        let current: Option<String> = sqlx::query_scalar(
            "SELECT role FROM project_memberships WHERE project_id = ?1 AND account_id = ?2",
        )
        .bind(project_id)
        .bind(account_id)
        .fetch_optional(&mut *tx)
        .await?;

        let current = match current {
            Some(raw) => MembershipRole::parse(&raw)?,
            None => return Err(GateError::NotFound("Membership not found".to_string())),
        };

        if current == MembershipRole::Owner && role != MembershipRole::Owner {
            Self::ensure_owner_survives(&mut tx, project_id, account_id).await?;
        }

        sqlx::query(
            "UPDATE project_memberships SET role = ?1 WHERE project_id = ?2 AND account_id = ?3",
        )
        .bind(role.as_str())
        .bind(project_id)
        .bind(account_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_membership(&self, project_id: &str, account_id: &str) -> GateResult<()> {
        let mut tx = self.write_tx().await?;

        let current: Option<String> = sqlx::query_scalar(
            "SELECT role FROM project_memberships WHERE project_id = ?1 AND account_id = ?2",
        )
        .bind(project_id)
        .bind(account_id)
        .fetch_optional(&mut *tx)
        .await?;

        match current.as_deref().map(MembershipRole::parse).transpose()? {
            None => return Err(GateError::NotFound("Membership not found".to_string())),
            Some(MembershipRole::Owner) => {
                Self::ensure_owner_survives(&mut tx, project_id, account_id).await?;
            }
            Some(_) => {}
        }

        sqlx::query("DELETE FROM project_memberships WHERE project_id = ?1 AND account_id = ?2")
            .bind(project_id)
            .bind(account_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use chrono::Duration;

    async fn setup() -> SqliteStore {
        SqliteStore::new(db::test_pool().await)
    }

    fn account(id: &str) -> Account {
        Account {
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
        }
    }

    fn refresh(account_id: &str, hash: &str, expires_at: DateTime<Utc>) -> Credential {
        Credential {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            token_hash: hash.to_string(),
            kind: CredentialKind::Refresh,
            family_id: "family-1".to_string(),
            expires_at,
            revoked: false,
            revoked_at: None,
            created_at: Utc::now(),
        }
    }

    fn role(name: &str, permissions: &[Permission]) -> Role {
        Role {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: String::new(),
            is_system: false,
            permissions: permissions.iter().copied().collect(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_email_is_conflict() {
        let store = setup().await;
        store.insert_account(&account("alice"), &[]).await.unwrap();

        let mut dup = account("alice2");
        dup.email = "alice@example.com".to_string();
        assert!(matches!(store.insert_account(&dup, &[]).await, Err(GateError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_rotate_refresh_classifies_outcomes() {
        let store = setup().await;
        store.insert_account(&account("alice"), &[]).await.unwrap();
        let now = Utc::now();

        store
            .insert_credential(&refresh("alice", "live", now + Duration::days(1)))
            .await
            .unwrap();
        let mut stale = refresh("alice", "stale", now - Duration::seconds(1));
        stale.family_id = "family-2".to_string();
        store.insert_credential(&stale).await.unwrap();

        assert_eq!(
            store.rotate_refresh("missing", "x", now, now).await.unwrap(),
            RotationOutcome::Unknown
        );
        assert_eq!(
            store.rotate_refresh("stale", "y", now, now).await.unwrap(),
            RotationOutcome::Expired
        );

        let outcome = store
            .rotate_refresh("live", "next", now + Duration::days(1), now)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RotationOutcome::Rotated {
                account_id: "alice".to_string(),
                family_id: "family-1".to_string(),
            }
        );

        let next = store
            .find_credential("next", CredentialKind::Refresh)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.family_id, "family-1");
        assert!(!next.revoked);

        // Replaying the consumed credential revokes the whole family
        let replay = store.rotate_refresh("live", "z", now, now).await.unwrap();
        assert!(matches!(replay, RotationOutcome::Replayed { revoked: 1, .. }));

        let next = store
            .find_credential("next", CredentialKind::Refresh)
            .await
            .unwrap()
            .unwrap();
        assert!(next.revoked);
    }

    #[tokio::test]
    async fn test_consume_reset_is_single_use() {
        let store = setup().await;
        store.insert_account(&account("alice"), &[]).await.unwrap();
        let now = Utc::now();

        let mut reset = refresh("alice", "reset-hash", now + Duration::hours(1));
        reset.kind = CredentialKind::Reset;
        store.insert_credential(&reset).await.unwrap();

        // A reset token is not a refresh token
        assert_eq!(
            store.rotate_refresh("reset-hash", "x", now, now).await.unwrap(),
            RotationOutcome::Unknown
        );

        assert_eq!(
            store.consume_reset("reset-hash", now).await.unwrap(),
            Some("alice".to_string())
        );
        assert_eq!(store.consume_reset("reset-hash", now).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = setup().await;
        store.insert_account(&account("alice"), &[]).await.unwrap();
        let now = Utc::now();

        store
            .insert_credential(&refresh("alice", "old", now - Duration::days(2)))
            .await
            .unwrap();
        store
            .insert_credential(&refresh("alice", "new", now + Duration::days(2)))
            .await
            .unwrap();

        assert_eq!(store.purge_expired(now).await.unwrap(), 1);
        assert!(store
            .find_credential("new", CredentialKind::Refresh)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_last_admin_guard_on_every_path() {
        let store = setup().await;
        store.insert_account(&account("root"), &[]).await.unwrap();

        let admin = role("Admins", &[Permission::SystemAdmin, Permission::RolesManage]);
        store.insert_role(&admin).await.unwrap();
        store.assign_role("root", &admin.id, Utc::now()).await.unwrap();

        assert!(matches!(
            store.deactivate_account("root", Utc::now()).await,
            Err(GateError::LastAdminViolation)
        ));
        assert!(matches!(
            store.unassign_role("root", &admin.id).await,
            Err(GateError::LastAdminViolation)
        ));
        assert!(matches!(
            store.delete_role(&admin.id).await,
            Err(GateError::LastAdminViolation)
        ));
        let stripped: BTreeSet<Permission> = [Permission::RolesManage].into_iter().collect();
        assert!(matches!(
            store.update_role(&admin.id, "", &stripped).await,
            Err(GateError::LastAdminViolation)
        ));

        // Nothing changed
        assert_eq!(store.active_admin_ids().await.unwrap(), vec!["root".to_string()]);
        let reloaded = store.get_role(&admin.id).await.unwrap().unwrap();
        assert!(reloaded.permissions.contains(&Permission::SystemAdmin));

        // A second admin unblocks the first
        store.insert_account(&account("deputy"), &[]).await.unwrap();
        store.assign_role("deputy", &admin.id, Utc::now()).await.unwrap();
        store.deactivate_account("root", Utc::now()).await.unwrap();
        assert_eq!(store.active_admin_ids().await.unwrap(), vec!["deputy".to_string()]);
    }

    #[tokio::test]
    async fn test_insert_account_is_all_or_nothing() {
        let store = setup().await;
        let members = role("Members", &[Permission::TasksView]);
        store.insert_role(&members).await.unwrap();

        assert!(matches!(
            store.insert_account(&account("alice"), &["missing-role"]).await,
            Err(GateError::NotFound(_))
        ));
        assert!(store.get_account_by_email("alice@example.com").await.unwrap().is_none());

        store.insert_account(&account("alice"), &[members.id.as_str()]).await.unwrap();
        let roles = store.roles_for_account("alice").await.unwrap();
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].id, members.id);

        let mut dup = account("alice2");
        dup.email = "alice@example.com".to_string();
        assert!(matches!(
            store.insert_account(&dup, &[members.id.as_str()]).await,
            Err(GateError::Conflict(_))
        ));
        assert!(store.roles_for_account("alice2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_role_permissions_round_trip() {
        let store = setup().await;
        let editors = role("Editors", &[Permission::TasksEdit, Permission::TasksView]);
        store.insert_role(&editors).await.unwrap();

        let loaded = store.get_role_by_name("Editors").await.unwrap().unwrap();
        assert_eq!(loaded.permissions, editors.permissions);

        let listed = store.list_roles().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].permissions.len(), 2);

        assert!(matches!(
            store.insert_role(&role("Editors", &[])).await,
            Err(GateError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_last_owner_guard() {
        let store = setup().await;
        store.insert_account(&account("b"), &[]).await.unwrap();
        store.insert_account(&account("c"), &[]).await.unwrap();

        let owner = Membership {
            project_id: "p".to_string(),
            account_id: "b".to_string(),
            role: MembershipRole::Owner,
            created_at: Utc::now(),
        };
        store.insert_first_owner(&owner).await.unwrap();
        assert!(matches!(
            store.insert_first_owner(&owner).await,
            Err(GateError::Conflict(_))
        ));

        assert!(matches!(
            store.delete_membership("p", "b").await,
            Err(GateError::LastOwnerViolation)
        ));
        assert!(matches!(
            store.update_membership_role("p", "b", MembershipRole::Member).await,
            Err(GateError::LastOwnerViolation)
        ));
        assert_eq!(
            store.membership_role("p", "b").await.unwrap(),
            Some(MembershipRole::Owner)
        );

        store
            .insert_membership(&Membership {
                project_id: "p".to_string(),
                account_id: "c".to_string(),
                role: MembershipRole::Owner,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store.delete_membership("p", "b").await.unwrap();

        let members = store.list_memberships("p").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].account_id, "c");
    }
}
