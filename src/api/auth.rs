/// /auth/* endpoints: registration, sessions, passwords and second factor
use crate::{
    account::{
        ChangePasswordRequest, LoginRequest, PasswordResetConfirm, PasswordResetRequest,
        RefreshRequest, RegisterRequest, SecondFactorChallenge, SecondFactorCodeRequest,
        SessionResponse, UpdateProfileRequest,
    },
    api::middleware::ValidatedJson,
    auth::{clear_csrf_cookie, set_csrf_cookie, AuthContext},
    context::AppContext,
    db::models::Account,
    error::{GateError, GateResult},
    permissions::{Permission, Role},
    second_factor::Enrollment,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::cookie::CookieJar;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use tracing::debug;

/// Build auth routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/auth/me", get(me).put(update_profile))
        .route("/auth/password", post(change_password))
        .route("/auth/password-reset/request", post(request_password_reset))
        .route("/auth/password-reset/confirm", post(confirm_password_reset))
        .route("/auth/2fa/enroll", post(enroll_second_factor))
        .route("/auth/2fa/confirm", post(confirm_second_factor))
        .route("/auth/2fa/disable", post(disable_second_factor))
}

/// Current account with its roles and effective permissions
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MeResponse {
    account: Account,
    roles: Vec<Role>,
    permissions: BTreeSet<Permission>,
}

async fn register(
    State(ctx): State<AppContext>,
    ValidatedJson(req): ValidatedJson<RegisterRequest>,
) -> GateResult<(StatusCode, Json<Account>)> {
    let account = ctx
        .account_manager
        .create_account(&req.email, &req.display_name, &req.password)
        .await?;

    Ok((StatusCode::CREATED, Json(account)))
}

async fn login(
    State(ctx): State<AppContext>,
    jar: CookieJar,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> GateResult<Response> {
    let result = ctx
        .account_manager
        .login(&req.identifier, &req.password, req.code.as_deref())
        .await;

    match result {
        Ok((account, session)) => {
            let jar = set_csrf_cookie(jar, &ctx, session.csrf_token.clone());
            let body = SessionResponse {
                account: Some(account),
                session,
            };
            Ok((jar, Json(body)).into_response())
        }
        Err(GateError::SecondFactorRequired) => Ok(Json(SecondFactorChallenge {
            requires_second_factor: true,
        })
        .into_response()),
        Err(e) => Err(e),
    }
}

async fn refresh(
    State(ctx): State<AppContext>,
    jar: CookieJar,
    ValidatedJson(req): ValidatedJson<RefreshRequest>,
) -> GateResult<(CookieJar, Json<SessionResponse>)> {
    let session = ctx.tokens.refresh(&req.refresh_token).await?;
    let jar = set_csrf_cookie(jar, &ctx, session.csrf_token.clone());

    Ok((
        jar,
        Json(SessionResponse {
            account: None,
            session,
        }),
    ))
}

/// Logout works with an expired access token; the refresh token is the proof
async fn logout(
    State(ctx): State<AppContext>,
    jar: CookieJar,
    ValidatedJson(req): ValidatedJson<RefreshRequest>,
) -> GateResult<(CookieJar, StatusCode)> {
    ctx.tokens.revoke(&req.refresh_token).await?;

    Ok((clear_csrf_cookie(jar, &ctx), StatusCode::NO_CONTENT))
}

async fn me(State(ctx): State<AppContext>, auth: AuthContext) -> GateResult<Json<MeResponse>> {
    let principal = auth.require(&ctx, &[]).await?;
    let account = ctx.account_manager.get_account(&principal.account_id).await?;
    let roles = ctx.permissions.roles_for_account(&principal.account_id).await?;

    Ok(Json(MeResponse {
        account,
        roles,
        permissions: principal.permissions,
    }))
}

async fn update_profile(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    ValidatedJson(req): ValidatedJson<UpdateProfileRequest>,
) -> GateResult<Json<Account>> {
    let principal = auth.require(&ctx, &[]).await?;
    let account = ctx
        .account_manager
        .update_profile(&principal.account_id, &req.display_name)
        .await?;

    Ok(Json(account))
}

async fn change_password(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    jar: CookieJar,
    ValidatedJson(req): ValidatedJson<ChangePasswordRequest>,
) -> GateResult<(CookieJar, StatusCode)> {
    let principal = auth.require(&ctx, &[]).await?;
    ctx.account_manager
        .change_password(&principal.account_id, &req.current_password, &req.new_password)
        .await?;

    Ok((clear_csrf_cookie(jar, &ctx), StatusCode::NO_CONTENT))
}

/// Always 202: the response never reveals whether the email is registered
async fn request_password_reset(
    State(ctx): State<AppContext>,
    ValidatedJson(req): ValidatedJson<PasswordResetRequest>,
) -> GateResult<StatusCode> {
    if let Some((account, _token)) = ctx.account_manager.request_password_reset(&req.email).await? {
        // Delivery belongs to the mail collaborator
        debug!(account_id = %account.id, "Password reset token ready for delivery");
    }

    Ok(StatusCode::ACCEPTED)
}

async fn confirm_password_reset(
    State(ctx): State<AppContext>,
    ValidatedJson(req): ValidatedJson<PasswordResetConfirm>,
) -> GateResult<StatusCode> {
    ctx.account_manager
        .reset_password(&req.token, &req.new_password)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

async fn enroll_second_factor(
    State(ctx): State<AppContext>,
    auth: AuthContext,
) -> GateResult<Json<Enrollment>> {
    let principal = auth.require(&ctx, &[]).await?;
    let enrollment = ctx.second_factor.begin_enrollment(&principal.account_id).await?;

    Ok(Json(enrollment))
}

async fn confirm_second_factor(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    ValidatedJson(req): ValidatedJson<SecondFactorCodeRequest>,
) -> GateResult<Json<serde_json::Value>> {
    let principal = auth.require(&ctx, &[]).await?;
    let enabled = ctx
        .second_factor
        .confirm_enrollment(&principal.account_id, &req.code)
        .await?;

    Ok(Json(json!({ "enabled": enabled })))
}

async fn disable_second_factor(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    ValidatedJson(req): ValidatedJson<SecondFactorCodeRequest>,
) -> GateResult<StatusCode> {
    let principal = auth.require(&ctx, &[]).await?;
    ctx.second_factor
        .disable(&principal.account_id, &req.code)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}
