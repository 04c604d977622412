/// Database models shared by the stores and services
use crate::error::{GateError, GateResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Account record in the database
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub email: String,
    pub display_name: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub active: bool,
    /// Pending or confirmed TOTP secret (base32)
    #[serde(skip_serializing, default)]
    pub second_factor_secret: Option<String>,
    pub second_factor_enabled: bool,
    pub last_authenticated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
}

/// Kind of persisted opaque credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    Refresh,
    Reset,
}

impl CredentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::Refresh => "refresh",
            CredentialKind::Reset => "reset",
        }
    }

    pub fn parse(s: &str) -> GateResult<Self> {
        match s {
            "refresh" => Ok(CredentialKind::Refresh),
            "reset" => Ok(CredentialKind::Reset),
            _ => Err(GateError::Internal(format!("Unknown credential kind: {}", s))),
        }
    }
}

/// Refresh or password-reset credential record
///
/// Only the SHA-256 digest of the opaque token is persisted.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub account_id: String,
    pub token_hash: String,
    pub kind: CredentialKind,
    /// Login chain this credential belongs to; rotation keeps it
    pub family_id: String,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Credential {
    /// Usable right now: not revoked and not past expiry
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.expires_at > now
    }
}

/// Outcome of an attempted refresh-credential rotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// Old credential revoked and the new one stored, in one transaction
    Rotated { account_id: String, family_id: String },
    /// No refresh credential with that value
    Unknown,
    /// Credential exists but has expired
    Expired,
    /// Credential was already revoked; the rest of its family was revoked too
    Replayed { family_id: String, revoked: u64 },
    /// Credential was live when read but another caller rotated it first
    LostRace,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_credential_kind_round_trip() {
        assert_eq!(CredentialKind::parse("refresh").unwrap(), CredentialKind::Refresh);
        assert_eq!(CredentialKind::Reset.as_str(), "reset");
        assert!(CredentialKind::parse("session").is_err());
    }

    #[test]
    fn test_credential_liveness() {
        let now = Utc::now();
        let mut credential = Credential {
            id: "c1".to_string(),
            account_id: "a1".to_string(),
            token_hash: "h".to_string(),
            kind: CredentialKind::Refresh,
            family_id: "f1".to_string(),
            expires_at: now + Duration::minutes(5),
            revoked: false,
            revoked_at: None,
            created_at: now,
        };
        assert!(credential.is_live(now));

        credential.expires_at = now - Duration::seconds(1);
        assert!(!credential.is_live(now));

        credential.expires_at = now + Duration::minutes(5);
        credential.revoked = true;
        assert!(!credential.is_live(now));
    }

    #[test]
    fn test_account_serialization_hides_secrets() {
        let account = Account {
            id: "a1".to_string(),
            email: "a@example.com".to_string(),
            display_name: "A".to_string(),
            password_hash: "$argon2id$secret".to_string(),
            active: true,
            second_factor_secret: Some("JBSWY3DPEHPK3PXP".to_string()),
            second_factor_enabled: true,
            last_authenticated_at: None,
            created_at: Utc::now(),
            deactivated_at: None,
        };

        let json = serde_json::to_string(&account).unwrap();
        assert!(!json.contains("argon2"));
        assert!(!json.contains("JBSWY3DPEHPK3PXP"));
        assert!(json.contains("secondFactorEnabled"));
    }
}
