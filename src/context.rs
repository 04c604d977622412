/// Application context and dependency injection
use crate::{
    account::AccountManager,
    config::ServerConfig,
    db,
    error::GateResult,
    guard::RequestGuard,
    permissions::PermissionEngine,
    projects::ProjectAccessControl,
    second_factor::SecondFactorService,
    store::SqliteStore,
    token::TokenService,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub db: SqlitePool,
    pub account_manager: Arc<AccountManager>,
    pub tokens: Arc<TokenService>,
    pub second_factor: Arc<SecondFactorService>,
    pub permissions: Arc<PermissionEngine>,
    pub projects: Arc<ProjectAccessControl>,
    pub guard: Arc<RequestGuard>,
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: ServerConfig) -> GateResult<Self> {
        config.validate()?;

        if !config.storage.data_directory.exists() {
            tokio::fs::create_dir_all(&config.storage.data_directory).await?;
        }

        let db = db::create_pool(&config.storage.database, db::DatabaseOptions::default()).await?;
        db::run_migrations(&db).await?;
        db::test_connection(&db).await?;

        Ok(Self::with_pool(config, db))
    }

    /// Wire every service over an already-migrated pool
    pub fn with_pool(config: ServerConfig, db: SqlitePool) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(SqliteStore::new(db.clone()));

        let tokens = Arc::new(TokenService::new(store.clone(), store.clone(), config.clone()));
        let second_factor = Arc::new(SecondFactorService::new(
            store.clone(),
            config.second_factor.clone(),
        ));
        let permissions = Arc::new(PermissionEngine::new(store.clone(), store.clone()));
        let projects = Arc::new(ProjectAccessControl::new(store.clone(), store.clone()));
        let guard = Arc::new(RequestGuard::new(
            tokens.clone(),
            permissions.clone(),
            projects.clone(),
            store.clone(),
        ));
        let account_manager = Arc::new(AccountManager::new(
            store,
            tokens.clone(),
            second_factor.clone(),
            permissions.clone(),
        ));

        Self {
            config,
            db,
            account_manager,
            tokens,
            second_factor,
            permissions,
            projects,
            guard,
        }
    }

    /// Create system roles and, if configured, the first administrator
    pub async fn bootstrap(&self) -> GateResult<()> {
        let created = self.permissions.bootstrap_system_roles().await?;
        if created > 0 {
            info!("Created {} system roles", created);
        }

        if let (Some(email), Some(password)) = (
            &self.config.bootstrap.admin_email,
            &self.config.bootstrap.admin_password,
        ) {
            self.account_manager.bootstrap_admin(email, password).await?;
        }

        Ok(())
    }
}
