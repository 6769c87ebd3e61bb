//! Login, token refresh and session routes.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::crypto;
use crate::error::Result;
use crate::middleware::{Identity, MaybeIdentity};
use crate::router::Valid;
use crate::token::{AuthTokens, TokenPayload};
use crate::user::User;
use crate::{AppState, ServerError};

#[derive(Debug, Validate, Serialize, Deserialize)]
pub struct LoginBody {
    #[validate(email(message = "Email must be formatted."))]
    pub email: String,
    #[validate(length(min = 1, max = 255, message = "Password is required."))]
    pub password: String,
}

#[derive(Debug, Validate, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshBody {
    #[validate(length(min = 1, message = "Refresh token is required."))]
    pub refresh_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    #[serde(flatten)]
    pub tokens: AuthTokens,
    pub user: User,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub authenticated: bool,
    pub user: Option<TokenPayload>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Exchange credentials for a token pair.
pub async fn login(
    State(state): State<AppState>,
    Valid(body): Valid<LoginBody>,
) -> Result<Json<LoginResponse>> {
    let Some(user) = state.users.find_by_email(&body.email).await else {
        tokio::task::spawn_blocking(move || crypto::dummy_verify(body.password))
            .await
            .map_err(|err| ServerError::Internal {
                details: "password verification task failed".into(),
                source: Some(Box::new(err)),
            })?;
        return Err(ServerError::InvalidCredentials);
    };

    let hash = user.password_hash.clone();
    let matches = tokio::task::spawn_blocking(move || {
        crypto::verify_password(&hash, body.password)
    })
    .await
    .map_err(|err| ServerError::Internal {
        details: "password verification task failed".into(),
        source: Some(Box::new(err)),
    })?;

    if !matches {
        tracing::info!(user_id = %user.id, "login rejected, wrong password");
        return Err(ServerError::InvalidCredentials);
    }

    let tokens = state.token.generate_tokens(&user)?;
    tracing::info!(user_id = %user.id, role = %user.role.name, "user logged in");

    Ok(Json(LoginResponse { tokens, user }))
}

/// Exchange a refresh token for a new token pair.
pub async fn refresh(
    State(state): State<AppState>,
    Valid(body): Valid<RefreshBody>,
) -> Result<Json<AuthTokens>> {
    let payload = state
        .token
        .verify_refresh_token(&body.refresh_token)
        .ok_or(ServerError::InvalidRefreshToken)?;

    // Role changes and deletions apply on the next refresh.
    let Some(user) = state.users.find_by_id(&payload.user_id).await else {
        tracing::warn!(user_id = %payload.user_id, "refresh token of an unknown user");
        return Err(ServerError::InvalidRefreshToken);
    };

    let tokens = state.token.generate_tokens(&user)?;
    tracing::debug!(user_id = %user.id, "token pair refreshed");

    Ok(Json(tokens))
}

/// Tokens are stateless: nothing to revoke server-side.
pub async fn logout(Identity(payload): Identity) -> Json<MessageResponse> {
    tracing::info!(user_id = %payload.user_id, "user logged out");

    Json(MessageResponse {
        message: "Logged out".into(),
    })
}

/// Identity of the caller.
pub async fn me(Identity(payload): Identity) -> Json<TokenPayload> {
    Json(payload)
}

/// Identity of the caller, if any.
pub async fn session(MaybeIdentity(payload): MaybeIdentity) -> Json<SessionResponse> {
    Json(SessionResponse {
        authenticated: payload.is_some(),
        user: payload,
    })
}

pub fn router(state: AppState) -> Router<AppState> {
    let authenticated = Router::new()
        // `GET /api/auth/me`. Authorization required.
        .route("/me", get(me))
        // `POST /api/auth/logout`. Authorization required.
        .route("/logout", post(logout))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::authenticate,
        ));

    let optional = Router::new()
        .route("/session", get(session))
        .route_layer(middleware::from_fn_with_state(
            state,
            crate::middleware::optional_auth,
        ));

    Router::new()
        .route("/login", post(login))
        .route("/refresh", post(refresh))
        .merge(authenticated)
        .merge(optional)
}
