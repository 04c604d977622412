/// Time-based one-time password second factor (RFC 6238, HMAC-SHA1)
///
/// Enrollment stores the secret as pending; the enabled flag flips only after
/// the first code verifies. Codes are accepted within `skew` steps either side
/// of the server's current step.
use crate::{
    config::SecondFactorConfig,
    db::models::Account,
    error::{GateError, GateResult},
    store::AccountStore,
};
use base32::Alphabet;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::Serialize;
use sha1::Sha1;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

const SECRET_ALPHABET: Alphabet = Alphabet::Rfc4648 { padding: false };
const SECRET_BYTES: usize = 20;

/// Secret and provisioning URI handed to the client during enrollment
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub secret: String,
    pub provisioning_uri: String,
}

/// Compare two strings in constant time with respect to their contents
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Second-factor service
pub struct SecondFactorService {
    accounts: Arc<dyn AccountStore>,
    config: SecondFactorConfig,
}

impl SecondFactorService {
    pub fn new(accounts: Arc<dyn AccountStore>, config: SecondFactorConfig) -> Self {
        Self { accounts, config }
    }

    /// Generate and persist a pending secret
    ///
    /// Calling this again before confirmation replaces the pending secret.
    pub async fn begin_enrollment(&self, account_id: &str) -> GateResult<Enrollment> {
        let account = self.load(account_id).await?;

        if account.second_factor_enabled {
            return Err(GateError::Conflict("Second factor already enabled".to_string()));
        }

        let mut secret_bytes = [0u8; SECRET_BYTES];
        rand::thread_rng().fill_bytes(&mut secret_bytes);
        let secret = base32::encode(SECRET_ALPHABET, &secret_bytes);

        self.accounts
            .set_second_factor(&account.id, Some(&secret), false)
            .await?;

        info!(account_id = %account.id, "Second factor enrollment started");

        Ok(Enrollment {
            provisioning_uri: self.provisioning_uri(&secret, &account.email),
            secret,
        })
    }

    /// Verify a code against the pending secret and enable the factor on success
    ///
    /// A wrong code leaves the pending secret in place for another attempt.
    pub async fn confirm_enrollment(&self, account_id: &str, code: &str) -> GateResult<bool> {
        let account = self.load(account_id).await?;

        if account.second_factor_enabled {
            return Err(GateError::Conflict("Second factor already enabled".to_string()));
        }

        let Some(secret) = account.second_factor_secret.as_deref() else {
            return Err(GateError::Validation("No pending second factor enrollment".to_string()));
        };

        if !self.verify_at(secret, code, Utc::now().timestamp())? {
            warn!(account_id = %account.id, "Second factor confirmation failed");
            return Ok(false);
        }

        self.accounts
            .set_second_factor(&account.id, Some(secret), true)
            .await?;

        info!(account_id = %account.id, "Second factor enabled");
        Ok(true)
    }

    /// Verify a code for an account with the factor enabled
    pub fn verify(&self, account: &Account, code: &str) -> GateResult<bool> {
        match (&account.second_factor_secret, account.second_factor_enabled) {
            (Some(secret), true) => self.verify_at(secret, code, Utc::now().timestamp()),
            _ => Ok(false),
        }
    }

    /// Turn the factor off after re-proving possession
    pub async fn disable(&self, account_id: &str, code: &str) -> GateResult<()> {
        let account = self.load(account_id).await?;

        if !account.second_factor_enabled {
            return Err(GateError::Validation("Second factor is not enabled".to_string()));
        }

        if !self.verify(&account, code)? {
            warn!(account_id = %account.id, "Second factor disable rejected");
            return Err(GateError::SecondFactorInvalid);
        }

        self.accounts.set_second_factor(&account.id, None, false).await?;

        info!(account_id = %account.id, "Second factor disabled");
        Ok(())
    }

    /// Verify a code at a given unix time
    pub fn verify_at(&self, secret: &str, code: &str, unix_time: i64) -> GateResult<bool> {
        let code = code.trim();
        if code.len() != self.config.digits as usize || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(false);
        }

        let secret_bytes = decode_secret(secret)?;
        let counter = (unix_time.max(0) as u64) / self.config.step;

        let mut matched = false;
        for offset in 0..=self.config.skew {
            let candidates = [counter.checked_sub(offset), counter.checked_add(offset)];
            for candidate in candidates.into_iter().flatten() {
                let expected = self.code_for_counter(&secret_bytes, candidate)?;
                // No early exit: every window slot is checked
                matched |= constant_time_eq(code, &expected);
            }
        }

        Ok(matched)
    }

    /// Code for a given unix time
    pub fn generate_code_at(&self, secret: &str, unix_time: i64) -> GateResult<String> {
        let secret_bytes = decode_secret(secret)?;
        self.code_for_counter(&secret_bytes, (unix_time.max(0) as u64) / self.config.step)
    }

    /// otpauth:// URI understood by authenticator apps
    pub fn provisioning_uri(&self, secret: &str, account_name: &str) -> String {
        let issuer = urlencoding::encode(&self.config.issuer);

        format!(
            "otpauth://totp/{}:{}?secret={}&issuer={}&algorithm=SHA1&digits={}&period={}",
            issuer,
            urlencoding::encode(account_name),
            secret,
            issuer,
            self.config.digits,
            self.config.step,
        )
    }

    fn code_for_counter(&self, secret: &[u8], counter: u64) -> GateResult<String> {
        let mut mac = Hmac::<Sha1>::new_from_slice(secret)
            .map_err(|_| GateError::Internal("Invalid TOTP key".to_string()))?;
        mac.update(&counter.to_be_bytes());
        let hash = mac.finalize().into_bytes();

        // Dynamic truncation
        let offset = (hash[hash.len() - 1] & 0x0f) as usize;
        let binary = ((hash[offset] as u32 & 0x7f) << 24)
            | ((hash[offset + 1] as u32) << 16)
            | ((hash[offset + 2] as u32) << 8)
            | (hash[offset + 3] as u32);

        let modulus = 10u32.pow(self.config.digits);
        Ok(format!(
            "{:0width$}",
            binary % modulus,
            width = self.config.digits as usize
        ))
    }

    async fn load(&self, account_id: &str) -> GateResult<Account> {
        self.accounts
            .get_account(account_id)
            .await?
            .ok_or_else(|| GateError::NotFound("Account not found".to_string()))
    }
}

fn decode_secret(secret: &str) -> GateResult<Vec<u8>> {
    base32::decode(SECRET_ALPHABET, secret)
        .ok_or_else(|| GateError::Internal("Invalid TOTP secret".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, store::SqliteStore};

    // RFC 6238 appendix B seed for SHA1
    const RFC_SEED: &[u8] = b"12345678901234567890";

    fn service(store: Arc<SqliteStore>) -> SecondFactorService {
        SecondFactorService::new(store, SecondFactorConfig::default())
    }

    /// A well-formed code that does not verify right now
    fn wrong_code(svc: &SecondFactorService, secret: &str) -> String {
        let now = Utc::now().timestamp();
        (0..10u32)
            .map(|d| d.to_string().repeat(6))
            .find(|c| !svc.verify_at(secret, c, now).unwrap())
            .unwrap()
    }

    async fn setup() -> (SecondFactorService, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::new(db::test_pool().await));
        store
            .insert_account(
                &Account {
                    id: "acct-1".to_string(),
                    email: "alice@example.com".to_string(),
                    display_name: "Alice".to_string(),
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

        (service(store.clone()), store)
    }

    #[tokio::test]
    async fn test_rfc6238_vectors() {
        let (svc, _store) = setup().await;
        let secret = base32::encode(SECRET_ALPHABET, RFC_SEED);

        assert_eq!(svc.generate_code_at(&secret, 59).unwrap(), "287082");
        assert_eq!(svc.generate_code_at(&secret, 1111111109).unwrap(), "081804");
        assert_eq!(svc.generate_code_at(&secret, 1234567890).unwrap(), "005924");
    }

    #[tokio::test]
    async fn test_tolerance_window() {
        let (svc, _store) = setup().await;
        let secret = base32::encode(SECRET_ALPHABET, RFC_SEED);
        let t = 1_700_000_000 - (1_700_000_000 % 30);
        let code = svc.generate_code_at(&secret, t).unwrap();

        for delta in [-60, -30, 0, 30, 60, 89] {
            assert!(svc.verify_at(&secret, &code, t + delta).unwrap(), "delta {}", delta);
        }
        for delta in [-61, -90, 90, 120] {
            assert!(!svc.verify_at(&secret, &code, t + delta).unwrap(), "delta {}", delta);
        }
    }

    #[tokio::test]
    async fn test_malformed_codes_rejected() {
        let (svc, _store) = setup().await;
        let secret = base32::encode(SECRET_ALPHABET, RFC_SEED);

        assert!(!svc.verify_at(&secret, "", 59).unwrap());
        assert!(!svc.verify_at(&secret, "28708", 59).unwrap());
        assert!(!svc.verify_at(&secret, "28708a", 59).unwrap());
        assert!(svc.verify_at(&secret, " 287082 ", 59).unwrap());
    }

    #[tokio::test]
    async fn test_enrollment_flow() {
        let (svc, store) = setup().await;

        let enrollment = svc.begin_enrollment("acct-1").await.unwrap();
        assert!(enrollment
            .provisioning_uri
            .starts_with("otpauth://totp/Taskgate:alice%40example.com?secret="));
        assert!(enrollment.provisioning_uri.contains("&period=30"));

        // Wrong code keeps the pending secret
        let wrong = wrong_code(&svc, &enrollment.secret);
        assert!(!svc.confirm_enrollment("acct-1", &wrong).await.unwrap());
        let pending = store.get_account("acct-1").await.unwrap().unwrap();
        assert_eq!(pending.second_factor_secret.as_deref(), Some(enrollment.secret.as_str()));

        let code = svc
            .generate_code_at(&enrollment.secret, Utc::now().timestamp())
            .unwrap();
        assert!(svc.confirm_enrollment("acct-1", &code).await.unwrap());

        let enabled = store.get_account("acct-1").await.unwrap().unwrap();
        assert!(enabled.second_factor_enabled);
        assert!(svc.verify(&enabled, &code).unwrap());

        assert!(matches!(
            svc.begin_enrollment("acct-1").await,
            Err(GateError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_disable_requires_valid_code() {
        let (svc, store) = setup().await;
        let enrollment = svc.begin_enrollment("acct-1").await.unwrap();
        let code = svc
            .generate_code_at(&enrollment.secret, Utc::now().timestamp())
            .unwrap();
        svc.confirm_enrollment("acct-1", &code).await.unwrap();

        let wrong = wrong_code(&svc, &enrollment.secret);
        assert!(matches!(
            svc.disable("acct-1", &wrong).await,
            Err(GateError::SecondFactorInvalid)
        ));

        svc.disable("acct-1", &code).await.unwrap();
        let account = store.get_account("acct-1").await.unwrap().unwrap();
        assert!(!account.second_factor_enabled);
        assert!(account.second_factor_secret.is_none());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
    }
}
