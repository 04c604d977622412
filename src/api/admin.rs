/// Administration endpoints: roles, role assignment, account status
use crate::{
    api::middleware::ValidatedJson,
    auth::AuthContext,
    context::AppContext,
    db::models::Account,
    error::GateResult,
    guard::Requirement,
    permissions::{Permission, Role},
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use tracing::info;
use validator::Validate;

/// Build admin routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/admin/roles", get(list_roles).post(create_role))
        .route("/admin/roles/:id", put(update_role).delete(delete_role))
        .route("/admin/accounts", get(list_accounts))
        .route(
            "/admin/accounts/:id/roles/:role_id",
            post(assign_role).delete(unassign_role),
        )
        .route("/admin/accounts/:id/deactivate", post(deactivate_account))
        .route("/admin/accounts/:id/reactivate", post(reactivate_account))
        .route("/admin/accounts/:id/sessions", delete(revoke_sessions))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct CreateRoleRequest {
    #[validate(length(min = 1, max = 64, message = "Role name must be 1 to 64 characters"))]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    permissions: Vec<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct UpdateRoleRequest {
    #[serde(default)]
    description: String,
    permissions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ListAccountsQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_roles(State(ctx): State<AppContext>, auth: AuthContext) -> GateResult<Json<Vec<Role>>> {
    auth.require(&ctx, &[Requirement::Permission(Permission::RolesView)])
        .await?;

    Ok(Json(ctx.permissions.list_roles().await?))
}

async fn create_role(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    ValidatedJson(req): ValidatedJson<CreateRoleRequest>,
) -> GateResult<(StatusCode, Json<Role>)> {
    auth.require(&ctx, &[Requirement::Permission(Permission::RolesManage)])
        .await?;

    let role = ctx
        .permissions
        .create_role(&req.name, &req.description, &req.permissions)
        .await?;

    Ok((StatusCode::CREATED, Json(role)))
}

async fn update_role(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Path(id): Path<String>,
    ValidatedJson(req): ValidatedJson<UpdateRoleRequest>,
) -> GateResult<Json<Role>> {
    auth.require(&ctx, &[Requirement::Permission(Permission::RolesManage)])
        .await?;

    let role = ctx
        .permissions
        .update_role(&id, &req.description, &req.permissions)
        .await?;

    Ok(Json(role))
}

async fn delete_role(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> GateResult<StatusCode> {
    auth.require(&ctx, &[Requirement::Permission(Permission::RolesManage)])
        .await?;

    ctx.permissions.delete_role(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_accounts(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Query(query): Query<ListAccountsQuery>,
) -> GateResult<Json<Vec<Account>>> {
    auth.require(&ctx, &[Requirement::Permission(Permission::UsersView)])
        .await?;

    let accounts = ctx
        .account_manager
        .list_accounts(query.limit.unwrap_or(50), query.offset.unwrap_or(0))
        .await?;

    Ok(Json(accounts))
}

async fn assign_role(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Path((account_id, role_id)): Path<(String, String)>,
) -> GateResult<StatusCode> {
    auth.require(&ctx, &[Requirement::Permission(Permission::RolesManage)])
        .await?;

    ctx.permissions.assign_role(&account_id, &role_id).await?;
    info!(account_id = %account_id, role_id = %role_id, by = %auth.account_id(), "Role assigned");

    Ok(StatusCode::NO_CONTENT)
}

async fn unassign_role(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Path((account_id, role_id)): Path<(String, String)>,
) -> GateResult<StatusCode> {
    auth.require(&ctx, &[Requirement::Permission(Permission::RolesManage)])
        .await?;

    ctx.permissions.unassign_role(&account_id, &role_id).await?;
    info!(account_id = %account_id, role_id = %role_id, by = %auth.account_id(), "Role unassigned");

    Ok(StatusCode::NO_CONTENT)
}

async fn deactivate_account(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> GateResult<StatusCode> {
    auth.require(&ctx, &[Requirement::Permission(Permission::UsersManage)])
        .await?;

    ctx.account_manager.deactivate(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reactivate_account(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> GateResult<StatusCode> {
    auth.require(&ctx, &[Requirement::Permission(Permission::UsersManage)])
        .await?;

    ctx.account_manager.reactivate(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Force logout everywhere
async fn revoke_sessions(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> GateResult<Json<serde_json::Value>> {
    auth.require(&ctx, &[Requirement::Permission(Permission::UsersManage)])
        .await?;

    ctx.account_manager.get_account(&id).await?;
    let revoked = ctx.tokens.revoke_all(&id).await?;

    Ok(Json(serde_json::json!({ "revoked": revoked })))
}
