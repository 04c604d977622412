/// Project membership endpoints
use crate::{
    api::middleware::ValidatedJson,
    auth::AuthContext,
    context::AppContext,
    error::GateResult,
    guard::Requirement,
    permissions::Permission,
    projects::{AccessLevel, Membership, MembershipRole},
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Build project routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/projects/:id/init", post(initialize_project))
        .route("/projects/:id/access", get(get_access))
        .route("/projects/:id/members", get(list_members).post(add_member))
        .route(
            "/projects/:id/members/:account_id",
            put(change_member_role).delete(remove_member),
        )
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct AddMemberRequest {
    #[validate(length(min = 1, message = "Account id is required"))]
    account_id: String,
    role: MembershipRole,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct ChangeRoleRequest {
    role: MembershipRole,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AccessResponse {
    project_id: String,
    role: Option<MembershipRole>,
    level: Option<AccessLevel>,
}

/// The task layer calls this right after it creates the project row
async fn initialize_project(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Path(project_id): Path<String>,
) -> GateResult<(StatusCode, Json<Membership>)> {
    auth.require(&ctx, &[Requirement::Permission(Permission::ProjectsCreate)])
        .await?;

    let membership = ctx
        .projects
        .initialize_project(&project_id, auth.account_id())
        .await?;

    Ok((StatusCode::CREATED, Json(membership)))
}

async fn get_access(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Path(project_id): Path<String>,
) -> GateResult<Json<AccessResponse>> {
    auth.require(&ctx, &[]).await?;

    let role = ctx
        .projects
        .membership_role(&project_id, auth.account_id())
        .await?;

    Ok(Json(AccessResponse {
        project_id,
        role,
        level: role.map(|r| r.access_level()),
    }))
}

async fn list_members(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Path(project_id): Path<String>,
) -> GateResult<Json<Vec<Membership>>> {
    auth.require(&ctx, &[Requirement::Permission(Permission::ProjectsView)])
        .await?;

    let members = ctx
        .projects
        .list_members(&project_id, auth.account_id())
        .await?;

    Ok(Json(members))
}

async fn add_member(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Path(project_id): Path<String>,
    ValidatedJson(req): ValidatedJson<AddMemberRequest>,
) -> GateResult<(StatusCode, Json<Membership>)> {
    auth.require(&ctx, &[Requirement::Permission(Permission::ProjectsView)])
        .await?;

    let membership = ctx
        .projects
        .add_member(&project_id, auth.account_id(), &req.account_id, req.role)
        .await?;

    Ok((StatusCode::CREATED, Json(membership)))
}

async fn change_member_role(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Path((project_id, account_id)): Path<(String, String)>,
    ValidatedJson(req): ValidatedJson<ChangeRoleRequest>,
) -> GateResult<StatusCode> {
    auth.require(&ctx, &[Requirement::Permission(Permission::ProjectsView)])
        .await?;

    ctx.projects
        .change_member_role(&project_id, auth.account_id(), &account_id, req.role)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

async fn remove_member(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    Path((project_id, account_id)): Path<(String, String)>,
) -> GateResult<StatusCode> {
    auth.require(&ctx, &[]).await?;

    ctx.projects
        .remove_member(&project_id, auth.account_id(), &account_id)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}
