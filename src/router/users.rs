//! Users-related HTTP API.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router, middleware};

use crate::AppState;
use crate::middleware::{AllowedRoles, Identity};
use crate::user::{RoleName, User};

/// List every user. Restricted to administrators.
pub async fn list(
    State(state): State<AppState>,
    Identity(caller): Identity,
) -> Json<Vec<User>> {
    tracing::debug!(user_id = %caller.user_id, "listing users");
    Json(state.users.list().await)
}

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        // `GET /api/users`. Admins only.
        .route("/api/users", get(list))
        .route_layer(middleware::from_fn_with_state(
            AllowedRoles::new([RoleName::Admin, RoleName::Superadmin]),
            crate::middleware::require_role,
        ))
        .route_layer(middleware::from_fn_with_state(
            state,
            crate::middleware::authenticate,
        ))
}
