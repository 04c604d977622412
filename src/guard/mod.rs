/// Per-request authentication and authorization pipeline
///
/// Order of checks, first failure wins:
/// 1. bearer access token (`Unauthorized`)
/// 2. CSRF double-submit on state-changing methods (`Forbidden`)
/// 3. global permissions (`Forbidden`)
/// 4. project access level (`AccessDenied`)
///
/// The guard only reads. Idempotent store reads are retried once on a
/// transient failure.
use crate::{
    error::{GateError, GateResult},
    permissions::{Permission, PermissionEngine},
    projects::{AccessLevel, ProjectAccessControl},
    second_factor::constant_time_eq,
    store::AccountStore,
    token::TokenService,
};
use axum::http::Method;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Credentials carried by an inbound call, already pulled out of the transport
#[derive(Debug, Clone, Copy)]
pub struct GuardRequest<'a> {
    pub method: &'a Method,
    pub bearer_token: Option<&'a str>,
    pub csrf_header: Option<&'a str>,
    pub csrf_cookie: Option<&'a str>,
}

/// Caller identity established by steps 1 and 2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub account_id: String,
    pub session_id: String,
}

/// Something a route needs before its handler may run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Permission(Permission),
    ProjectAccess { project_id: String, level: AccessLevel },
}

impl Requirement {
    pub fn project(project_id: impl Into<String>, level: AccessLevel) -> Self {
        Requirement::ProjectAccess {
            project_id: project_id.into(),
            level,
        }
    }
}

/// Authorized caller handed to a handler
#[derive(Debug, Clone)]
pub struct Principal {
    pub account_id: String,
    pub session_id: String,
    pub permissions: BTreeSet<Permission>,
    /// Level on the project named by the requirements, if any
    pub project_access: Option<AccessLevel>,
}

impl Principal {
    pub fn can(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

/// Safe methods skip the CSRF check
pub fn is_safe_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE)
}

/// Request guard
pub struct RequestGuard {
    tokens: Arc<TokenService>,
    permissions: Arc<PermissionEngine>,
    projects: Arc<ProjectAccessControl>,
    accounts: Arc<dyn AccountStore>,
}

impl RequestGuard {
    pub fn new(
        tokens: Arc<TokenService>,
        permissions: Arc<PermissionEngine>,
        projects: Arc<ProjectAccessControl>,
        accounts: Arc<dyn AccountStore>,
    ) -> Self {
        Self {
            tokens,
            permissions,
            projects,
            accounts,
        }
    }

    /// Run the whole pipeline
    pub async fn check(&self, request: GuardRequest<'_>, requirements: &[Requirement]) -> GateResult<Principal> {
        let identity = self.authenticate(request)?;
        self.authorize(&identity, requirements).await
    }

    /// Steps 1 and 2: access token, then CSRF for unsafe methods
    pub fn authenticate(&self, request: GuardRequest<'_>) -> GateResult<Identity> {
        let token = request.bearer_token.ok_or(GateError::Unauthorized)?;
        let claims = self.tokens.verify_access_token(token)?;

        if !is_safe_method(request.method) {
            let matched = match (request.csrf_header, request.csrf_cookie) {
                (Some(header), Some(cookie)) if !header.is_empty() => constant_time_eq(header, cookie),
                _ => false,
            };

            if !matched {
                warn!(account_id = %claims.sub, method = %request.method, "CSRF check failed");
                return Err(GateError::Forbidden);
            }
        }

        Ok(Identity {
            account_id: claims.sub,
            session_id: claims.sid,
        })
    }

    /// Steps 3 and 4: permissions and project access, resolved fresh
    pub async fn authorize(&self, identity: &Identity, requirements: &[Requirement]) -> GateResult<Principal> {
        let account_id = identity.account_id.as_str();

        let active = retry_read(|| self.accounts.get_account(account_id))
            .await?
            .map(|a| a.active)
            .unwrap_or(false);
        if !active {
            return Err(GateError::Unauthorized);
        }

        let permissions = retry_read(|| self.permissions.effective_permissions(account_id)).await?;
        let mut project_access = None;

        for requirement in requirements {
            match requirement {
                Requirement::Permission(permission) => {
                    if !permissions.contains(permission) {
                        debug!(account_id = %account_id, permission = %permission, "Missing permission");
                        return Err(GateError::Forbidden);
                    }
                }
                Requirement::ProjectAccess { project_id, level } => {
                    let granted =
                        retry_read(|| self.projects.access_level(project_id, account_id)).await?;

                    match granted {
                        Some(granted) if granted.satisfies(*level) => project_access = Some(granted),
                        _ => {
                            debug!(
                                account_id = %account_id,
                                project_id = %project_id,
                                required = level.as_str(),
                                "Project access denied"
                            );
                            return Err(GateError::AccessDenied);
                        }
                    }
                }
            }
        }

        Ok(Principal {
            account_id: identity.account_id.clone(),
            session_id: identity.session_id.clone(),
            permissions,
            project_access,
        })
    }
}

/// Run an idempotent read, retrying once if the first attempt failed transiently
async fn retry_read<T, F, Fut>(read: F) -> GateResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = GateResult<T>>,
{
    match read().await {
        Err(e) if e.is_transient() => {
            warn!(error = %e, "Transient store failure, retrying read once");
            read().await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ServerConfig,
        db::{self, models::Account},
        permissions::TEAM_MEMBER_ROLE,
        projects::MembershipRole,
        store::SqliteStore,
        token::{AccessClaims, Session},
    };
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        guard: RequestGuard,
        tokens: Arc<TokenService>,
        engine: Arc<PermissionEngine>,
        projects: Arc<ProjectAccessControl>,
        store: Arc<SqliteStore>,
    }

    async fn setup() -> Fixture {
        let store = Arc::new(SqliteStore::new(db::test_pool().await));
        let config = Arc::new(ServerConfig::for_tests());
        let tokens = Arc::new(TokenService::new(store.clone(), store.clone(), config));
        let engine = Arc::new(PermissionEngine::new(store.clone(), store.clone()));
        let projects = Arc::new(ProjectAccessControl::new(store.clone(), store.clone()));
        engine.bootstrap_system_roles().await.unwrap();

        Fixture {
            guard: RequestGuard::new(tokens.clone(), engine.clone(), projects.clone(), store.clone()),
            tokens,
            engine,
            projects,
            store,
        }
    }

    async fn login(fx: &Fixture, id: &str) -> (Account, Session) {
        let account = Account {
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
        };
        fx.store.insert_account(&account, &[]).await.unwrap();
        let session = fx.tokens.issue_session(&account).await.unwrap();
        (account, session)
    }

    fn request<'a>(method: &'a Method, session: &'a Session) -> GuardRequest<'a> {
        GuardRequest {
            method,
            bearer_token: Some(&session.access_token),
            csrf_header: Some(&session.csrf_token),
            csrf_cookie: Some(&session.csrf_token),
        }
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let fx = setup().await;
        let req = GuardRequest {
            method: &Method::GET,
            bearer_token: None,
            csrf_header: None,
            csrf_cookie: None,
        };
        assert!(matches!(fx.guard.check(req, &[]).await, Err(GateError::Unauthorized)));
    }

    #[tokio::test]
    async fn test_expired_token_with_valid_csrf_is_unauthorized() {
        let fx = setup().await;
        let (account, session) = login(&fx, "a").await;
        let now = Utc::now().timestamp();

        let expired = encode(
            &Header::default(),
            &AccessClaims {
                sub: account.id.clone(),
                sid: "s".to_string(),
                iat: now - 3600,
                exp: now - 1800,
                jti: "j".to_string(),
                typ: "access".to_string(),
            },
            &EncodingKey::from_secret(ServerConfig::for_tests().authentication.jwt_secret.as_bytes()),
        )
        .unwrap();

        let req = GuardRequest {
            method: &Method::POST,
            bearer_token: Some(&expired),
            csrf_header: Some(&session.csrf_token),
            csrf_cookie: Some(&session.csrf_token),
        };
        assert!(matches!(fx.guard.check(req, &[]).await, Err(GateError::Unauthorized)));
    }

    #[tokio::test]
    async fn test_csrf_enforced_on_unsafe_methods_only() {
        let fx = setup().await;
        let (_account, session) = login(&fx, "a").await;

        let get = Method::GET;
        let bare = GuardRequest {
            method: &get,
            bearer_token: Some(&session.access_token),
            csrf_header: None,
            csrf_cookie: None,
        };
        assert!(fx.guard.check(bare, &[]).await.is_ok());

        let post = Method::POST;
        let missing = GuardRequest { method: &post, ..bare };
        assert!(matches!(fx.guard.check(missing, &[]).await, Err(GateError::Forbidden)));

        let mismatch = GuardRequest {
            csrf_header: Some("other"),
            csrf_cookie: Some(&session.csrf_token),
            ..missing
        };
        assert!(matches!(fx.guard.check(mismatch, &[]).await, Err(GateError::Forbidden)));

        assert!(fx.guard.check(request(&post, &session), &[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_team_member_cannot_delete_project() {
        let fx = setup().await;
        let (_owner, _) = login(&fx, "owner").await;
        let (member, session) = login(&fx, "a").await;

        let team_member = fx.engine.role_by_name(TEAM_MEMBER_ROLE).await.unwrap();
        fx.engine.assign_role(&member.id, &team_member.id).await.unwrap();

        fx.projects.initialize_project("p", "owner").await.unwrap();
        fx.projects
            .add_member("p", "owner", &member.id, MembershipRole::Member)
            .await
            .unwrap();

        let delete = Method::DELETE;
        let result = fx
            .guard
            .check(
                request(&delete, &session),
                &[
                    Requirement::Permission(Permission::TasksEdit),
                    Requirement::project("p", AccessLevel::Admin),
                ],
            )
            .await;
        assert!(matches!(result, Err(GateError::AccessDenied)));

        let edit = fx
            .guard
            .check(
                request(&delete, &session),
                &[
                    Requirement::Permission(Permission::TasksEdit),
                    Requirement::project("p", AccessLevel::Write),
                ],
            )
            .await
            .unwrap();
        assert_eq!(edit.project_access, Some(AccessLevel::Write));
        assert!(edit.can(Permission::TasksCreate));
    }

    #[tokio::test]
    async fn test_missing_permission_is_forbidden_and_edits_apply_immediately() {
        let fx = setup().await;
        let (account, session) = login(&fx, "a").await;
        let get = Method::GET;
        let needs = [Requirement::Permission(Permission::RolesView)];

        assert!(matches!(
            fx.guard.check(request(&get, &session), &needs).await,
            Err(GateError::Forbidden)
        ));

        let viewers = fx.engine.create_role("RoleViewers", "", &["roles:view"]).await.unwrap();
        fx.engine.assign_role(&account.id, &viewers.id).await.unwrap();
        assert!(fx.guard.check(request(&get, &session), &needs).await.is_ok());

        fx.engine.unassign_role(&account.id, &viewers.id).await.unwrap();
        assert!(fx.guard.check(request(&get, &session), &needs).await.is_err());
    }

    #[tokio::test]
    async fn test_deactivated_account_is_unauthorized() {
        let fx = setup().await;
        let (account, session) = login(&fx, "a").await;
        fx.store.deactivate_account(&account.id, Utc::now()).await.unwrap();

        let get = Method::GET;
        assert!(matches!(
            fx.guard.check(request(&get, &session), &[]).await,
            Err(GateError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_retry_read_retries_transient_once() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: GateResult<u32> = retry_read(|| async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(GateError::Database(sqlx::Error::PoolTimedOut))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: GateResult<u32> = retry_read(|| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(GateError::AccessDenied)
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
