/// Access and refresh token issuance
///
/// Access tokens are HS256 JWTs verified without touching the store. Refresh
/// and reset tokens are opaque random strings; only their SHA-256 digest is
/// persisted, and every lookup goes through the credential store.
use crate::{
    config::ServerConfig,
    db::models::{Account, Credential, CredentialKind, RotationOutcome},
    error::{GateError, GateResult},
    store::{AccountStore, CredentialStore},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const ACCESS_TOKEN_TYPE: &str = "access";

/// Claims embedded in an access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Account id
    pub sub: String,
    /// Session (refresh family) id
    pub sid: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    pub typ: String,
}

/// Token set returned to a client after login or refresh
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    /// Double-submit value; also set as a cookie by the HTTP layer
    pub csrf_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

/// Generate a random URL-safe opaque token (256 bits)
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Digest under which an opaque token is persisted
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Token service
pub struct TokenService {
    credentials: Arc<dyn CredentialStore>,
    accounts: Arc<dyn AccountStore>,
    config: Arc<ServerConfig>,
}

impl TokenService {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        accounts: Arc<dyn AccountStore>,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            credentials,
            accounts,
            config,
        }
    }

    /// Start a new session (and refresh family) for an authenticated account
    pub async fn issue_session(&self, account: &Account) -> GateResult<Session> {
        let now = Utc::now();
        let family_id = Uuid::new_v4().to_string();
        let refresh_token = generate_token();
        let refresh_expires_at = now + Duration::seconds(self.config.authentication.refresh_token_ttl);

        self.credentials
            .insert_credential(&Credential {
                id: Uuid::new_v4().to_string(),
                account_id: account.id.clone(),
                token_hash: hash_token(&refresh_token),
                kind: CredentialKind::Refresh,
                family_id: family_id.clone(),
                expires_at: refresh_expires_at,
                revoked: false,
                revoked_at: None,
                created_at: now,
            })
            .await?;

        let (access_token, access_expires_at) = self.mint_access_token(&account.id, &family_id, now)?;

        info!(account_id = %account.id, session_id = %family_id, "Session issued");

        Ok(Session {
            access_token,
            refresh_token,
            csrf_token: generate_token(),
            access_expires_at,
            refresh_expires_at,
        })
    }

    /// Rotate a refresh token into a fresh session
    ///
    /// Unknown, expired, revoked and lost-race tokens all fail with the same
    /// `InvalidCredential`.
    pub async fn refresh(&self, refresh_token: &str) -> GateResult<Session> {
        let now = Utc::now();
        let replacement = generate_token();
        let refresh_expires_at = now + Duration::seconds(self.config.authentication.refresh_token_ttl);

        let outcome = self
            .credentials
            .rotate_refresh(
                &hash_token(refresh_token),
                &hash_token(&replacement),
                refresh_expires_at,
                now,
            )
            .await?;

        let (account_id, family_id) = match outcome {
            RotationOutcome::Rotated {
                account_id,
                family_id,
            } => (account_id, family_id),
            RotationOutcome::Replayed { family_id, revoked } => {
                warn!(
                    session_id = %family_id,
                    revoked_credentials = revoked,
                    "Revoked refresh token replayed, session family revoked"
                );
                return Err(GateError::InvalidCredential);
            }
            RotationOutcome::LostRace => {
                debug!("Refresh token rotated by a concurrent request");
                return Err(GateError::InvalidCredential);
            }
            RotationOutcome::Unknown | RotationOutcome::Expired => {
                return Err(GateError::InvalidCredential);
            }
        };

        let active = self
            .accounts
            .get_account(&account_id)
            .await?
            .map(|a| a.active)
            .unwrap_or(false);

        if !active {
            self.credentials.revoke_family(&family_id, now).await?;
            warn!(account_id = %account_id, "Refresh attempted for inactive account");
            return Err(GateError::InvalidCredential);
        }

        let (access_token, access_expires_at) = self.mint_access_token(&account_id, &family_id, now)?;

        debug!(account_id = %account_id, session_id = %family_id, "Refresh token rotated");

        Ok(Session {
            access_token,
            refresh_token: replacement,
            csrf_token: generate_token(),
            access_expires_at,
            refresh_expires_at,
        })
    }

    /// Revoke one refresh token and the session it belongs to (logout)
    ///
    /// Returns false for unknown tokens; logout is idempotent either way.
    pub async fn revoke(&self, refresh_token: &str) -> GateResult<bool> {
        let now = Utc::now();
        let Some(credential) = self
            .credentials
            .find_credential(&hash_token(refresh_token), CredentialKind::Refresh)
            .await?
        else {
            return Ok(false);
        };

        let revoked = self.credentials.revoke_family(&credential.family_id, now).await?;
        info!(account_id = %credential.account_id, session_id = %credential.family_id, "Session revoked");

        Ok(revoked > 0)
    }

    /// Revoke every credential held by an account
    pub async fn revoke_all(&self, account_id: &str) -> GateResult<u64> {
        let revoked = self
            .credentials
            .revoke_all_for_account(account_id, Utc::now())
            .await?;

        info!(account_id = %account_id, revoked, "All credentials revoked");
        Ok(revoked)
    }

    /// Verify an access token: signature, type and expiry only
    pub fn verify_access_token(&self, token: &str) -> GateResult<AccessClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let data = decode::<AccessClaims>(
            token,
            &DecodingKey::from_secret(self.config.authentication.jwt_secret.as_bytes()),
            &validation,
        )
        .map_err(|_| GateError::Unauthorized)?;

        if data.claims.typ != ACCESS_TOKEN_TYPE {
            return Err(GateError::Unauthorized);
        }

        Ok(data.claims)
    }

    /// Mint a single-use password-reset token for an account
    pub async fn issue_reset(&self, account_id: &str) -> GateResult<String> {
        let now = Utc::now();
        let token = generate_token();

        self.credentials
            .insert_credential(&Credential {
                id: Uuid::new_v4().to_string(),
                account_id: account_id.to_string(),
                token_hash: hash_token(&token),
                kind: CredentialKind::Reset,
                family_id: Uuid::new_v4().to_string(),
                expires_at: now + Duration::seconds(self.config.authentication.reset_token_ttl),
                revoked: false,
                revoked_at: None,
                created_at: now,
            })
            .await?;

        Ok(token)
    }

    /// Consume a reset token, returning the account it was issued for
    pub async fn consume_reset(&self, token: &str) -> GateResult<String> {
        self.credentials
            .consume_reset(&hash_token(token), Utc::now())
            .await?
            .ok_or(GateError::InvalidCredential)
    }

    /// Delete credentials that expired more than `grace` ago
    pub async fn purge_expired(&self, grace: Duration) -> GateResult<u64> {
        self.credentials.purge_expired(Utc::now() - grace).await
    }

    fn mint_access_token(
        &self,
        account_id: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> GateResult<(String, DateTime<Utc>)> {
        let expires_at = now + Duration::seconds(self.config.authentication.access_token_ttl);
        let claims = AccessClaims {
            sub: account_id.to_string(),
            sid: session_id.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
            typ: ACCESS_TOKEN_TYPE.to_string(),
        };

        Ok((self.sign(&claims)?, expires_at))
    }

    fn sign(&self, claims: &AccessClaims) -> GateResult<String> {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(self.config.authentication.jwt_secret.as_bytes()),
        )
        .map_err(|e| GateError::Jwt(format!("Failed to generate token: {}", e)))
    }
}
