//! Authentication and authorization middlewares.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, header};
use axum::middleware::Next;
use axum::response::Response;

use crate::error::{Result, ServerError};
use crate::token::TokenPayload;
use crate::user::RoleName;
use crate::AppState;

const BEARER: &str = "Bearer ";

/// Token carried by a well-formed `Authorization: Bearer <token>` header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|header| header.strip_prefix(BEARER))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn reject(reason: &'static str, err: ServerError) -> ServerError {
    tracing::debug!(reason, "request rejected by auth gate");
    metrics::counter!("auth_rejections_total", "reason" => reason).increment(1);
    err
}

/// Require a valid access token and attach its [`TokenPayload`].
pub async fn authenticate(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response> {
    let token = bearer_token(req.headers())
        .ok_or_else(|| reject("missing_header", ServerError::MissingAuthorization))?;

    let payload = state
        .token
        .verify_access_token(token)
        .ok_or_else(|| reject("invalid_token", ServerError::InvalidToken))?;

    req.extensions_mut().insert(payload);
    Ok(next.run(req).await)
}

/// Attach a [`TokenPayload`] when a valid access token is sent, never reject.
pub async fn optional_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let payload = bearer_token(req.headers())
        .and_then(|token| state.token.verify_access_token(token));

    if let Some(payload) = payload {
        req.extensions_mut().insert(payload);
    }

    next.run(req).await
}

/// Roles allowed through [`require_role`].
#[derive(Clone, Debug)]
pub struct AllowedRoles(Arc<HashSet<RoleName>>);

impl AllowedRoles {
    pub fn new(roles: impl IntoIterator<Item = RoleName>) -> Self {
        Self(Arc::new(roles.into_iter().collect()))
    }

    pub fn contains(&self, role: RoleName) -> bool {
        self.0.contains(&role)
    }
}

/// Reject identities whose role is not allowed.
/// Must run after [`authenticate`].
pub async fn require_role(
    State(allowed): State<AllowedRoles>,
    req: Request,
    next: Next,
) -> Result<Response> {
    let Some(payload) = req.extensions().get::<TokenPayload>() else {
        return Err(reject("no_identity", ServerError::AuthenticationRequired));
    };

    if !allowed.contains(payload.role_name) {
        return Err(reject("forbidden_role", ServerError::Forbidden));
    }

    Ok(next.run(req).await)
}

/// Identity attached by [`authenticate`].
#[derive(Clone, Debug)]
pub struct Identity(pub TokenPayload);

impl<S: Send + Sync> FromRequestParts<S> for Identity {
    type Rejection = ServerError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<TokenPayload>()
            .cloned()
            .map(Identity)
            .ok_or(ServerError::AuthenticationRequired)
    }
}

/// Identity attached by [`optional_auth`], if any.
#[derive(Clone, Debug)]
pub struct MaybeIdentity(pub Option<TokenPayload>);

impl<S: Send + Sync> FromRequestParts<S> for MaybeIdentity {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        Ok(MaybeIdentity(parts.extensions.get::<TokenPayload>().cloned()))
    }
}
