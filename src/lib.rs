//! lms-auth issues and checks the tokens of the LMS API, and ships the
//! client which keeps them fresh.

#![forbid(unsafe_code)]
#![deny(unused_mut)]

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod middleware;
mod router;
pub mod telemetry;
pub mod token;
pub mod user;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{Method, StatusCode, header};
use axum::routing::get;
use axum::{Router, middleware as AxumMiddleware};
use error::ServerError;
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};

pub use token::{AuthTokens, TokenIssuer, TokenPayload};
pub use user::{Role, RoleName, User};

/// MUST NEVER be used in production.
#[cfg(test)]
pub async fn make_request(
    app: Router,
    method: Method,
    path: &str,
    token: Option<&str>,
    body: String,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use tower::util::ServiceExt;

    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    app.oneshot(request.body(axum::body::Body::from(body)).unwrap())
        .await
        .unwrap()
}

#[cfg(test)]
pub(crate) const TEST_USER_ID: &str = "2";
#[cfg(test)]
pub(crate) const TEST_USER_EMAIL: &str = "student@lms.test";
#[cfg(test)]
pub(crate) const TEST_PASSWORD: &str = "P$soW%920$n&";

#[cfg(test)]
static TEST_PASSWORD_HASH: std::sync::LazyLock<String> = std::sync::LazyLock::new(|| {
    crypto::hash_password(TEST_PASSWORD).expect("cannot hash test password")
});

/// User sharing [`TEST_USER_ID`] with the seeded student, with any role.
#[cfg(test)]
pub(crate) fn test_user(role: RoleName) -> User {
    let id = match role {
        RoleName::Student => 1,
        RoleName::Tutor => 2,
        RoleName::Admin => 3,
        RoleName::Superadmin => 4,
    };

    User {
        id: TEST_USER_ID.into(),
        email: TEST_USER_EMAIL.into(),
        name: "Student".into(),
        password_hash: TEST_PASSWORD_HASH.clone(),
        role: Role { id, name: role },
    }
}

/// State seeded with an admin and a student.
#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    let admin = User {
        id: "1".into(),
        email: "admin@lms.test".into(),
        name: "Admin".into(),
        password_hash: TEST_PASSWORD_HASH.clone(),
        role: Role {
            id: 3,
            name: RoleName::Admin,
        },
    };

    let mut config = config::Configuration::default();
    config.token = config::Token {
        access_secret: "test-access-secret".into(),
        refresh_secret: "test-refresh-secret".into(),
    };
    config.users = vec![admin, test_user(RoleName::Student)];

    initialize_state(Arc::new(config)).expect("cannot create test state")
}

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Configuration>,
    pub token: Arc<TokenIssuer>,
    pub users: Arc<dyn user::UserDirectory>,
    pub metrics: Option<PrometheusHandle>,
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(DefaultMakeSpan::new().include_headers(true).level(tracing::Level::INFO))
                .on_request(DefaultOnRequest::new())
                .on_response(DefaultOnResponse::new().include_headers(true).latency_unit(LatencyUnit::Micros)),
        )
        // Set a timeout.
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(10)))
        // Remove senstive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION, header::COOKIE]))
        // Add CORS preflight support.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers(Any)
                .vary([header::AUTHORIZATION]),
        );

    Router::new()
        // `GET /status.json` goes to `status`.
        .route("/status.json", get(router::status::status))
        // `GET /metrics` goes to Prometheus exposition.
        .route("/metrics", get(router::status::metrics))
        .nest("/api/auth", router::auth::router(state.clone()))
        .merge(router::users::router(state.clone()))
        .with_state(state)
        .route_layer(AxumMiddleware::from_fn(telemetry::track))
        .layer(middleware)
}

/// Initialize the application state.
///
/// Fails when a token secret is missing: the process must not start.
pub fn initialize_state(config: Arc<config::Configuration>) -> Result<AppState, ServerError> {
    let token = TokenIssuer::new(
        &config.url,
        &config.token.access_secret,
        &config.token.refresh_secret,
    )?;

    if config.users.is_empty() {
        tracing::warn!("no `users` entry on configuration, nobody can sign in");
    }
    let users: user::MemoryDirectory = config.users.iter().cloned().collect();

    Ok(AppState {
        config,
        token: Arc::new(token),
        users: Arc::new(users),
        metrics: None,
    })
}
