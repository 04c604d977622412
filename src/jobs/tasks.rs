/// Background task implementations
use crate::{context::AppContext, error::GateResult};

/// Delete credentials that expired longer ago than the configured grace period
pub async fn sweep_expired_credentials(ctx: &AppContext) -> GateResult<u64> {
    let grace = chrono::Duration::seconds(ctx.config.jobs.credential_sweep_grace);
    ctx.tokens.purge_expired(grace).await
}

/// Health check - verify the database answers
pub async fn health_check(ctx: &AppContext) -> GateResult<()> {
    sqlx::query("SELECT 1").fetch_one(&ctx.db).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ServerConfig,
        db::{
            self,
            models::{Account, Credential, CredentialKind},
        },
        store::{AccountStore, CredentialStore, SqliteStore},
    };
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let pool = db::test_pool().await;
        let ctx = AppContext::with_pool(ServerConfig::for_tests(), pool.clone());
        let store = SqliteStore::new(pool);
        let now = Utc::now();

        store
            .insert_account(
                &Account {
                    id: "a".to_string(),
                    email: "a@example.com".to_string(),
                    display_name: "A".to_string(),
                    password_hash: "hash".to_string(),
                    active: true,
                    second_factor_secret: None,
                    second_factor_enabled: false,
                    last_authenticated_at: None,
                    created_at: now,
                    deactivated_at: None,
                },
                &[],
            )
            .await
            .unwrap();

        for (hash, expires_at) in [("old", now - Duration::hours(1)), ("fresh", now + Duration::hours(1))] {
            store
                .insert_credential(&Credential {
                    id: hash.to_string(),
                    account_id: "a".to_string(),
                    token_hash: hash.to_string(),
                    kind: CredentialKind::Refresh,
                    family_id: "f".to_string(),
                    expires_at,
                    revoked: false,
                    revoked_at: None,
                    created_at: now,
                })
                .await
                .unwrap();
        }

        assert_eq!(sweep_expired_credentials(&ctx).await.unwrap(), 1);
        assert_eq!(sweep_expired_credentials(&ctx).await.unwrap(), 0);
        assert!(store
            .find_credential("fresh", CredentialKind::Refresh)
            .await
            .unwrap()
            .is_some());

        health_check(&ctx).await.unwrap();
    }
}
