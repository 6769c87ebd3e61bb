use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode as HttpStatus, header};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::sync::Barrier;
use tokio::task::JoinSet;

use super::*;
use crate::client::storage::{ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
use crate::user::RoleName;

const STALE_ACCESS: &str = "stale-access";
const OLD_REFRESH: &str = "old-refresh";
const FRESH_ACCESS: &str = "fresh-access";
const FRESH_REFRESH: &str = "fresh-refresh";

/// Fake API: `/api/data` only accepts the fresh access token.
struct Mock {
    refresh_calls: AtomicUsize,
    refresh_status: HttpStatus,
    // Holds the first 401s until they are all in flight.
    burst: Barrier,
    replayed_with: Mutex<Vec<String>>,
    logged_out_with: Mutex<Vec<String>>,
}

impl Mock {
    fn new(burst: usize, refresh_status: HttpStatus) -> Arc<Self> {
        Arc::new(Self {
            refresh_calls: AtomicUsize::new(0),
            refresh_status,
            burst: Barrier::new(burst),
            replayed_with: Mutex::new(Vec::new()),
            logged_out_with: Mutex::new(Vec::new()),
        })
    }

    fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

fn bearer(headers: &HeaderMap) -> String {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned()
}

async fn data(State(mock): State<Arc<Mock>>, headers: HeaderMap) -> (HttpStatus, Json<Value>) {
    let auth = bearer(&headers);
    if auth == format!("Bearer {FRESH_ACCESS}") {
        mock.replayed_with.lock().unwrap().push(auth);
        return (HttpStatus::OK, Json(json!({ "ok": true })));
    }

    mock.burst.wait().await;
    (
        HttpStatus::UNAUTHORIZED,
        Json(json!({ "error": "Unauthorized", "message": "Invalid or expired token" })),
    )
}

async fn locked() -> HttpStatus {
    HttpStatus::UNAUTHORIZED
}

async fn refresh(State(mock): State<Arc<Mock>>, Json(body): Json<Value>) -> (HttpStatus, Json<Value>) {
    mock.refresh_calls.fetch_add(1, Ordering::SeqCst);
    // Keep the refresh in flight while the burst queues up.
    tokio::time::sleep(Duration::from_millis(150)).await;

    if mock.refresh_status.is_success() && body["refreshToken"] == OLD_REFRESH {
        (
            HttpStatus::OK,
            Json(json!({ "accessToken": FRESH_ACCESS, "refreshToken": FRESH_REFRESH })),
        )
    } else {
        (
            mock.refresh_status,
            Json(json!({ "error": "Bad Request", "message": "refresh token rejected" })),
        )
    }
}

async fn logout(State(mock): State<Arc<Mock>>, headers: HeaderMap) -> Json<Value> {
    mock.logged_out_with.lock().unwrap().push(bearer(&headers));
    Json(json!({ "message": "Logged out" }))
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{address}/")
}

async fn serve_mock(mock: Arc<Mock>) -> String {
    serve(
        Router::new()
            .route("/api/data", get(data))
            .route("/api/locked", get(locked))
            .route("/api/auth/refresh", post(refresh))
            .route("/api/auth/logout", post(logout))
            .with_state(mock),
    )
    .await
}

fn stale_pair() -> AuthTokens {
    AuthTokens {
        access_token: STALE_ACCESS.into(),
        refresh_token: OLD_REFRESH.into(),
    }
}

/// Client whose session-end notifications are counted.
fn client_for(base: &str, session: Arc<Session>) -> (ApiClient, Arc<Mutex<Vec<SessionEnd>>>) {
    let ended = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&ended);
    let client = ApiClient::builder(base)
        .session(session)
        .on_session_end(move |reason| sink.lock().unwrap().push(reason))
        .build()
        .unwrap();
    (client, ended)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_unauthorized_share_one_refresh() {
    let mock = Mock::new(5, HttpStatus::OK);
    let base = serve_mock(Arc::clone(&mock)).await;
    let storage = Arc::new(MemoryStorage::new());
    let session = Arc::new(Session::new(storage.clone()));
    session.store(&stale_pair()).await;
    let (client, ended) = client_for(&base, Arc::clone(&session));

    let mut tasks = JoinSet::new();
    for _ in 0..5 {
        let client = client.clone();
        tasks.spawn(async move { client.get_json::<Value>("/api/data").await });
    }
    while let Some(result) = tasks.join_next().await {
        assert_eq!(result.unwrap().unwrap()["ok"], true);
    }

    assert_eq!(mock.refresh_calls(), 1);
    assert_eq!(
        *mock.replayed_with.lock().unwrap(),
        vec![format!("Bearer {FRESH_ACCESS}"); 5]
    );
    assert_eq!(session.access_token().await.as_deref(), Some(FRESH_ACCESS));
    assert_eq!(session.refresh_token().await.as_deref(), Some(FRESH_REFRESH));
    assert_eq!(storage.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some(FRESH_ACCESS));
    assert_eq!(storage.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some(FRESH_REFRESH));
    assert!(ended.lock().unwrap().is_empty());
    assert!(!session.is_refreshing());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_unauthorized_share_one_failure() {
    let mock = Mock::new(5, HttpStatus::BAD_REQUEST);
    let base = serve_mock(Arc::clone(&mock)).await;
    let storage = Arc::new(MemoryStorage::new());
    let session = Arc::new(Session::new(storage.clone()));
    session.store(&stale_pair()).await;
    let (client, ended) = client_for(&base, Arc::clone(&session));

    let mut tasks = JoinSet::new();
    for _ in 0..5 {
        let client = client.clone();
        tasks.spawn(async move { client.get_json::<Value>("/api/data").await });
    }

    let mut failures = Vec::new();
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Err(ClientError::RefreshFailed(failure)) => failures.push(failure),
            other => panic!("expected a refresh failure, got {other:?}"),
        }
    }

    assert_eq!(failures.len(), 5);
    assert!(matches!(failures[0], RefreshFailure::Rejected { status: 400, .. }));
    assert!(failures.iter().all(|failure| *failure == failures[0]));

    assert_eq!(mock.refresh_calls(), 1);
    assert!(mock.replayed_with.lock().unwrap().is_empty());
    assert_eq!(session.access_token().await, None);
    assert_eq!(session.refresh_token().await, None);
    assert_eq!(storage.get(ACCESS_TOKEN_KEY).unwrap(), None);
    assert_eq!(storage.get(REFRESH_TOKEN_KEY).unwrap(), None);
    assert_eq!(*ended.lock().unwrap(), vec![SessionEnd::RefreshRejected]);
    assert!(!session.is_refreshing());
}

#[tokio::test]
async fn test_missing_refresh_token_ends_session_without_network() {
    let mock = Mock::new(1, HttpStatus::OK);
    let base = serve_mock(Arc::clone(&mock)).await;
    let storage = Arc::new(MemoryStorage::new());
    storage.set(ACCESS_TOKEN_KEY, STALE_ACCESS).unwrap();
    let session = Arc::new(Session::new(storage.clone()));
    session.restore().await.unwrap();
    let (client, ended) = client_for(&base, Arc::clone(&session));

    let result = client.get_json::<Value>("/api/data").await;
    assert!(matches!(
        result,
        Err(ClientError::RefreshFailed(RefreshFailure::MissingRefreshToken))
    ));

    assert_eq!(mock.refresh_calls(), 0);
    assert_eq!(storage.get(ACCESS_TOKEN_KEY).unwrap(), None);
    assert_eq!(*ended.lock().unwrap(), vec![SessionEnd::MissingRefreshToken]);
}

#[tokio::test]
async fn test_replay_is_not_retried_twice() {
    let mock = Mock::new(1, HttpStatus::OK);
    let base = serve_mock(Arc::clone(&mock)).await;
    let session = Arc::new(Session::default());
    session.store(&stale_pair()).await;
    let (client, ended) = client_for(&base, Arc::clone(&session));

    let result = client.get_json::<Value>("/api/locked").await;
    assert!(matches!(result, Err(ClientError::Unauthorized)));

    assert_eq!(mock.refresh_calls(), 1);
    // Refresh itself succeeded: the session is kept.
    assert_eq!(session.access_token().await.as_deref(), Some(FRESH_ACCESS));
    assert!(ended.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_already_rotated_token_skips_refresh() {
    let mock = Mock::new(1, HttpStatus::OK);
    let base = serve_mock(Arc::clone(&mock)).await;
    let session = Arc::new(Session::default());
    session
        .store(&AuthTokens {
            access_token: FRESH_ACCESS.into(),
            refresh_token: FRESH_REFRESH.into(),
        })
        .await;
    let (client, _) = client_for(&base, session);

    let token = client.renew(Some(STALE_ACCESS)).await.unwrap();
    assert_eq!(token, FRESH_ACCESS);
    assert_eq!(mock.refresh_calls(), 0);
}

#[tokio::test]
async fn test_held_access_token_is_sent_on_first_request() {
    let mock = Mock::new(1, HttpStatus::OK);
    let base = serve_mock(Arc::clone(&mock)).await;
    let session = Arc::new(Session::default());
    session
        .store(&AuthTokens {
            access_token: FRESH_ACCESS.into(),
            refresh_token: FRESH_REFRESH.into(),
        })
        .await;
    let (client, ended) = client_for(&base, session);

    let body = client.get_json::<Value>("/api/data").await.unwrap();
    assert_eq!(body["ok"], true);

    assert_eq!(mock.refresh_calls(), 0);
    assert_eq!(
        *mock.replayed_with.lock().unwrap(),
        vec![format!("Bearer {FRESH_ACCESS}")]
    );
    assert!(ended.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_late_unauthorized_after_failed_refresh_does_not_end_twice() {
    let mock = Mock::new(1, HttpStatus::BAD_REQUEST);
    let base = serve_mock(Arc::clone(&mock)).await;
    let session = Arc::new(Session::default());
    session.store(&stale_pair()).await;
    let (client, ended) = client_for(&base, Arc::clone(&session));

    let first = client.get_json::<Value>("/api/data").await;
    assert!(matches!(
        first,
        Err(ClientError::RefreshFailed(RefreshFailure::Rejected { status: 400, .. }))
    ));

    // A request sent with the stale token whose 401 lands after teardown.
    let late = client.renew(Some(STALE_ACCESS)).await;
    assert!(matches!(
        late,
        Err(ClientError::RefreshFailed(RefreshFailure::MissingRefreshToken))
    ));

    assert_eq!(mock.refresh_calls(), 1);
    assert_eq!(*ended.lock().unwrap(), vec![SessionEnd::RefreshRejected]);
    assert!(!session.is_refreshing());
}

#[tokio::test]
async fn test_logout_clears_storage() {
    let mock = Mock::new(1, HttpStatus::OK);
    let base = serve_mock(Arc::clone(&mock)).await;
    let storage = Arc::new(MemoryStorage::new());
    let client = ApiClient::builder(&base)
        .storage(storage.clone())
        .build()
        .unwrap();
    client.session().store(&stale_pair()).await;

    client.logout().await.unwrap();

    assert_eq!(
        *mock.logged_out_with.lock().unwrap(),
        vec![format!("Bearer {STALE_ACCESS}")]
    );

    assert_eq!(client.session().access_token().await, None);
    assert_eq!(storage.get(ACCESS_TOKEN_KEY).unwrap(), None);
    assert_eq!(storage.get(REFRESH_TOKEN_KEY).unwrap(), None);
}

#[tokio::test]
async fn test_independent_clients_do_not_share_state() {
    let first = ApiClient::new("http://127.0.0.1:1/").unwrap();
    let second = ApiClient::new("http://127.0.0.1:1/").unwrap();

    first.session().store(&stale_pair()).await;
    assert_eq!(second.session().access_token().await, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_end_to_end_against_api() {
    let state = crate::test_state();
    let base = serve(crate::app(state.clone())).await;
    let client = ApiClient::new(&base).unwrap();

    let user = client
        .login(crate::TEST_USER_EMAIL, crate::TEST_PASSWORD)
        .await
        .unwrap();
    assert_eq!(user.id, crate::TEST_USER_ID);

    let me: Value = client.get_json("/api/auth/me").await.unwrap();
    assert_eq!(me["userId"], crate::TEST_USER_ID);
    assert_eq!(me["roleName"], "student");

    // Students are not allowed to list users, refreshing does not help.
    let forbidden = client.get_json::<Value>("/api/users").await;
    assert!(matches!(forbidden, Err(ClientError::Status { status: 403, .. })));

    // Access token no longer valid: refreshed transparently.
    let refresh_token = client.session().refresh_token().await.unwrap();
    client
        .session()
        .store(&AuthTokens {
            access_token: "expired".into(),
            refresh_token,
        })
        .await;
    let me: Value = client.get_json("/api/auth/me").await.unwrap();
    assert_eq!(me["roleName"], RoleName::Student.as_str());
    let access = client.session().access_token().await.unwrap();
    assert!(state.token.verify_access_token(&access).is_some());

    // Refresh token no longer valid: session torn down.
    client
        .session()
        .store(&AuthTokens {
            access_token: "expired".into(),
            refresh_token: "revoked".into(),
        })
        .await;
    let result = client.get_json::<Value>("/api/auth/me").await;
    assert!(matches!(
        result,
        Err(ClientError::RefreshFailed(RefreshFailure::Rejected { status: 401, .. }))
    ));
    assert_eq!(client.session().access_token().await, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_file_storage_session_survives_restart() {
    let base = serve(crate::app(crate::test_state())).await;
    let path = std::env::temp_dir()
        .join(format!("lms-auth-client-{}", std::process::id()))
        .join("session.json");
    let _ = std::fs::remove_file(&path);

    let client = ApiClient::builder(&base)
        .storage(Arc::new(FileStorage::new(&path)))
        .build()
        .unwrap();
    client
        .login(crate::TEST_USER_EMAIL, crate::TEST_PASSWORD)
        .await
        .unwrap();

    let restarted = ApiClient::builder(&base)
        .storage(Arc::new(FileStorage::new(&path)))
        .build()
        .unwrap();
    restarted.session().restore().await.unwrap();
    let me: Value = restarted.get_json("/api/auth/me").await.unwrap();
    assert_eq!(me["userId"], crate::TEST_USER_ID);

    restarted.logout().await.unwrap();
    assert_eq!(FileStorage::new(&path).get(ACCESS_TOKEN_KEY).unwrap(), None);

    let _ = std::fs::remove_file(&path);
}
