/// Authentication extractor and CSRF cookie helpers
use crate::{
    api::middleware::extract_bearer_token,
    context::AppContext,
    error::{GateError, GateResult},
    guard::{GuardRequest, Identity, Principal, Requirement},
};
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};

/// Authenticated caller: bearer token verified, CSRF checked for unsafe methods
///
/// Permission and project checks run later through [`AuthContext::require`],
/// once the handler knows which resource it is touching.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub identity: Identity,
}

impl AuthContext {
    pub fn account_id(&self) -> &str {
        &self.identity.account_id
    }

    /// Resolve permissions and project access for this caller
    pub async fn require(&self, ctx: &AppContext, requirements: &[Requirement]) -> GateResult<Principal> {
        ctx.guard.authorize(&self.identity, requirements).await
    }
}

#[async_trait]
impl FromRequestParts<AppContext> for AuthContext {
    type Rejection = GateError;

    async fn from_request_parts(parts: &mut Parts, state: &AppContext) -> Result<Self, Self::Rejection> {
        let token = extract_bearer_token(&parts.headers);
        let jar = CookieJar::from_headers(&parts.headers);

        let csrf_header = parts
            .headers
            .get(state.config.csrf.header_name.as_str())
            .and_then(|v| v.to_str().ok());
        let csrf_cookie = jar.get(&state.config.csrf.cookie_name).map(|c| c.value());

        let identity = state.guard.authenticate(GuardRequest {
            method: &parts.method,
            bearer_token: token.as_deref(),
            csrf_header,
            csrf_cookie,
        })?;

        Ok(AuthContext { identity })
    }
}

/// Set the double-submit cookie; it is readable by scripts so they can echo it back
pub fn set_csrf_cookie(jar: CookieJar, ctx: &AppContext, value: String) -> CookieJar {
    let cookie = Cookie::build((ctx.config.csrf.cookie_name.clone(), value))
        .path("/")
        .http_only(false)
        .secure(ctx.config.csrf.secure_cookie)
        .same_site(SameSite::Strict);

    jar.add(cookie)
}

pub fn clear_csrf_cookie(jar: CookieJar, ctx: &AppContext) -> CookieJar {
    jar.remove(Cookie::build(ctx.config.csrf.cookie_name.clone()).path("/"))
}
