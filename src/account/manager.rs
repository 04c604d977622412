/// Account lifecycle and the login state machine
use crate::{
    db::models::Account,
    error::{GateError, GateResult},
    permissions::{PermissionEngine, ADMINISTRATOR_ROLE, TEAM_MEMBER_ROLE},
    second_factor::SecondFactorService,
    store::AccountStore,
    token::{Session, TokenService},
};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::Utc;
use std::sync::{Arc, OnceLock};
use tokio::task;
use tracing::{info, warn};
use uuid::Uuid;

const MIN_PASSWORD_LEN: usize = 8;
const MAX_PASSWORD_LEN: usize = 128;

/// Verified against when the login identifier matches no account
static DUMMY_HASH: OnceLock<String> = OnceLock::new();
const DUMMY_PASSWORD: &str = "taskgate-unknown-account";

/// Hash a password with Argon2id and a random salt
pub fn hash_password(password: &str) -> GateResult<String> {
    let salt = SaltString::generate(&mut OsRng);

    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| GateError::Internal(format!("Failed to hash password: {}", e)))
}

/// Check a password against a stored PHC hash string
pub fn verify_password(password: &str, password_hash: &str) -> GateResult<bool> {
    let parsed = PasswordHash::new(password_hash)
        .map_err(|e| GateError::Internal(format!("Invalid password hash format: {}", e)))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn check_password_policy(password: &str) -> GateResult<()> {
    let len = password.chars().count();
    if !(MIN_PASSWORD_LEN..=MAX_PASSWORD_LEN).contains(&len) {
        return Err(GateError::Validation(format!(
            "Password must be between {} and {} characters",
            MIN_PASSWORD_LEN, MAX_PASSWORD_LEN
        )));
    }
    Ok(())
}

/// Account manager service
pub struct AccountManager {
    accounts: Arc<dyn AccountStore>,
    tokens: Arc<TokenService>,
    second_factor: Arc<SecondFactorService>,
    permissions: Arc<PermissionEngine>,
}

impl AccountManager {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        tokens: Arc<TokenService>,
        second_factor: Arc<SecondFactorService>,
        permissions: Arc<PermissionEngine>,
    ) -> Self {
        Self {
            accounts,
            tokens,
            second_factor,
            permissions,
        }
    }

    /// Register a new account; it starts with the TeamMember role
    pub async fn create_account(&self, email: &str, display_name: &str, password: &str) -> GateResult<Account> {
        let email = normalize_email(email);
        if email.is_empty() || !email.contains('@') {
            return Err(GateError::Validation("Invalid email address".to_string()));
        }
        check_password_policy(password)?;
        let default_role = self.permissions.role_by_name(TEAM_MEMBER_ROLE).await?;

        let display_name = display_name.trim();
        let account = Account {
            id: Uuid::new_v4().to_string(),
            display_name: if display_name.is_empty() {
                email.clone()
            } else {
                display_name.to_string()
            },
            email,
            password_hash: hash_blocking(password).await?,
            active: true,
            second_factor_secret: None,
            second_factor_enabled: false,
            last_authenticated_at: None,
            created_at: Utc::now(),
            deactivated_at: None,
        };

        self.accounts
            .insert_account(&account, &[default_role.id.as_str()])
            .await?;

        info!(account_id = %account.id, "Account created");
        Ok(account)
    }

    /// Authenticate with password and, when enabled, a second-factor code
    ///
    /// Unknown email, wrong password and deactivated account are all
    /// `InvalidCredential`. With the factor enabled and no code supplied the
    /// result is `SecondFactorRequired`; a wrong code is `SecondFactorInvalid`.
    pub async fn login(&self, identifier: &str, password: &str, code: Option<&str>) -> GateResult<(Account, Session)> {
        let account = self
            .accounts
            .get_account_by_email(&normalize_email(identifier))
            .await?;

        let Some(account) = account else {
            // Same Argon2 cost as a wrong password
            verify_dummy_blocking(password).await;
            return Err(GateError::InvalidCredential);
        };

        if !verify_blocking(password, &account.password_hash).await? {
            warn!(account_id = %account.id, "Login failed: bad password");
            return Err(GateError::InvalidCredential);
        }

        if !account.active {
            warn!(account_id = %account.id, "Login failed: account deactivated");
            return Err(GateError::InvalidCredential);
        }

        if account.second_factor_enabled {
            let code = code.filter(|c| !c.trim().is_empty()).ok_or(GateError::SecondFactorRequired)?;

            if !self.second_factor.verify(&account, code)? {
                warn!(account_id = %account.id, "Login failed: bad second factor code");
                return Err(GateError::SecondFactorInvalid);
            }
        }

        let now = Utc::now();
        self.accounts.record_authentication(&account.id, now).await?;
        let session = self.tokens.issue_session(&account).await?;

        info!(account_id = %account.id, "Login succeeded");
        Ok((
            Account {
                last_authenticated_at: Some(now),
                ..account
            },
            session,
        ))
    }

    pub async fn get_account(&self, id: &str) -> GateResult<Account> {
        self.accounts
            .get_account(id)
            .await?
            .ok_or_else(|| GateError::NotFound("Account not found".to_string()))
    }

    pub async fn list_accounts(&self, limit: i64, offset: i64) -> GateResult<Vec<Account>> {
        self.accounts.list_accounts(limit.clamp(1, 500), offset.max(0)).await
    }

    pub async fn update_profile(&self, id: &str, display_name: &str) -> GateResult<Account> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(GateError::Validation("Display name cannot be empty".to_string()));
        }

        self.accounts.update_display_name(id, display_name).await?;
        self.get_account(id).await
    }

    /// Change password after re-checking the current one; every credential is revoked
    pub async fn change_password(&self, id: &str, current: &str, new_password: &str) -> GateResult<()> {
        let account = self.get_account(id).await?;

        if !verify_blocking(current, &account.password_hash).await? {
            return Err(GateError::InvalidCredential);
        }
        check_password_policy(new_password)?;

        self.accounts
            .update_password_hash(id, &hash_blocking(new_password).await?)
            .await?;
        self.tokens.revoke_all(id).await?;

        info!(account_id = %id, "Password changed");
        Ok(())
    }

    /// Mint a reset token for an active account, or None without revealing why
    pub async fn request_password_reset(&self, email: &str) -> GateResult<Option<(Account, String)>> {
        let Some(account) = self.accounts.get_account_by_email(&normalize_email(email)).await? else {
            return Ok(None);
        };

        if !account.active {
            return Ok(None);
        }

        let token = self.tokens.issue_reset(&account.id).await?;
        info!(account_id = %account.id, "Password reset requested");

        Ok(Some((account, token)))
    }

    /// Consume a reset token and set a new password; every credential is revoked
    pub async fn reset_password(&self, token: &str, new_password: &str) -> GateResult<()> {
        check_password_policy(new_password)?;
        let account_id = self.tokens.consume_reset(token).await?;

        self.accounts
            .update_password_hash(&account_id, &hash_blocking(new_password).await?)
            .await?;
        self.tokens.revoke_all(&account_id).await?;

        info!(account_id = %account_id, "Password reset completed");
        Ok(())
    }

    /// Soft-deactivate an account and revoke its credentials
    pub async fn deactivate(&self, id: &str) -> GateResult<()> {
        self.accounts
            .deactivate_account(id, Utc::now())
            .await
            .map_err(|e| {
                if matches!(e, GateError::LastAdminViolation) {
                    warn!(account_id = %id, "Deactivation rejected: last administrator");
                }
                e
            })?;
        self.tokens.revoke_all(id).await?;

        info!(account_id = %id, "Account deactivated");
        Ok(())
    }

    pub async fn reactivate(&self, id: &str) -> GateResult<()> {
        self.accounts.reactivate_account(id).await?;

        info!(account_id = %id, "Account reactivated");
        Ok(())
    }

    /// Make sure an administrator exists, provisioning the given account if none does
    pub async fn bootstrap_admin(&self, email: &str, password: &str) -> GateResult<Option<Account>> {
        if self.permissions.has_active_admin().await? {
            return Ok(None);
        }

        let account = match self.accounts.get_account_by_email(&normalize_email(email)).await? {
            Some(existing) => {
                if !existing.active {
                    self.accounts.reactivate_account(&existing.id).await?;
                }
                existing
            }
            None => self.create_account(email, "Administrator", password).await?,
        };

        let admin_role = self.permissions.role_by_name(ADMINISTRATOR_ROLE).await?;
        self.permissions.assign_role(&account.id, &admin_role.id).await?;

        info!(account_id = %account.id, "Bootstrap administrator provisioned");
        Ok(Some(account))
    }
}

/// Argon2 is CPU-heavy; keep it off the async workers
async fn hash_blocking(password: &str) -> GateResult<String> {
    let password = password.to_string();
    task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| GateError::Internal(format!("Password hashing task failed: {}", e)))?
}

async fn verify_dummy_blocking(password: &str) {
    let password = password.to_string();
    let _ = task::spawn_blocking(move || {
        let hash = DUMMY_HASH.get_or_init(|| hash_password(DUMMY_PASSWORD).unwrap_or_default());
        let _ = verify_password(&password, hash);
    })
    .await;
}

async fn verify_blocking(password: &str, password_hash: &str) -> GateResult<bool> {
    let password = password.to_string();
    let password_hash = password_hash.to_string();
    task::spawn_blocking(move || verify_password(&password, &password_hash))
        .await
        .map_err(|e| GateError::Internal(format!("Password verification task failed: {}", e)))?
}
