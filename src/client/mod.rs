//! HTTP client of the LMS API.
//!
//! [`ApiClient`] sends the access token of its [`Session`] with every
//! request. A request answered with 401 triggers a token refresh, shared by
//! every request failing at the same time, then is replayed once with the
//! new access token.

mod session;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, HeaderValue};
use reqwest::{Method, Request, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

pub use session::{RefreshOutcome, Session};
use session::Entry;
pub use storage::{FileStorage, MemoryStorage, StorageError, TokenStorage};

use crate::token::AuthTokens;
use crate::user::User;

const LOGIN_PATH: &str = "/api/auth/login";
const REFRESH_PATH: &str = "/api/auth/refresh";
const LOGOUT_PATH: &str = "/api/auth/logout";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub type Result<T> = std::result::Result<T, ClientError>;

/// Why a token refresh did not produce a new access token.
/// Every request waiting on the same refresh receives the same value.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RefreshFailure {
    #[error("no refresh token held")]
    MissingRefreshToken,
    #[error("refresh rejected with status {status}")]
    Rejected { status: u16, body: String },
    #[error("refresh request failed: {0}")]
    Transport(String),
    #[error("refresh abandoned before completion")]
    Abandoned,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("access token cannot be sent as a header")]
    InvalidToken,
    #[error("request is unauthorized")]
    Unauthorized,
    #[error(transparent)]
    RefreshFailed(#[from] RefreshFailure),
    #[error("server responded with status {status}")]
    Status { status: u16, body: String },
}

/// Why the session was torn down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// A 401 arrived but no refresh token was held.
    MissingRefreshToken,
    /// The refresh endpoint refused or could not be reached.
    RefreshRejected,
}

/// Notified when the session is torn down and the user must sign in again.
pub trait SessionHook: Send + Sync {
    fn session_ended(&self, reason: SessionEnd);
}

impl<F> SessionHook for F
where
    F: Fn(SessionEnd) + Send + Sync,
{
    fn session_ended(&self, reason: SessionEnd) {
        self(reason)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginReply {
    #[serde(flatten)]
    tokens: AuthTokens,
    user: User,
}

/// Builder of [`ApiClient`].
pub struct ApiClientBuilder {
    base_url: String,
    session: Option<Arc<Session>>,
    hook: Option<Arc<dyn SessionHook>>,
    timeout: Duration,
}

impl ApiClientBuilder {
    /// Share an existing session.
    pub fn session(mut self, session: Arc<Session>) -> Self {
        self.session = Some(session);
        self
    }

    /// Persist tokens in `storage` instead of memory.
    pub fn storage(mut self, storage: Arc<dyn TokenStorage>) -> Self {
        self.session = Some(Arc::new(Session::new(storage)));
        self
    }

    /// Called when the session is torn down.
    pub fn on_session_end(mut self, hook: impl SessionHook + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Timeout of every request, refresh included.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ApiClient> {
        let http = reqwest::Client::builder().timeout(self.timeout).build()?;
        let hook: Arc<dyn SessionHook> = match self.hook {
            Some(hook) => hook,
            None => Arc::new(|_: SessionEnd| {}),
        };

        Ok(ApiClient {
            http,
            base_url: Url::parse(&self.base_url)?,
            session: self.session.unwrap_or_default(),
            hook,
        })
    }
}

/// Client of the LMS API refreshing its tokens transparently.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    session: Arc<Session>,
    hook: Arc<dyn SessionHook>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn builder(base_url: impl Into<String>) -> ApiClientBuilder {
        ApiClientBuilder {
            base_url: base_url.into(),
            session: None,
            hook: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Client with an in-memory session.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::builder(base_url).build()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    /// Start a request on `path`; send it with [`ApiClient::send`].
    pub fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        Ok(self.http.request(method, self.url(path)?))
    }

    /// Sign in and keep the issued token pair.
    pub async fn login(&self, email: &str, password: &str) -> Result<User> {
        let response = self
            .http
            .post(self.url(LOGIN_PATH)?)
            .json(&LoginRequest { email, password })
            .send()
            .await?;
        let reply: LoginReply = read_json(response).await?;

        self.session.store(&reply.tokens).await;
        tracing::info!(user_id = %reply.user.id, "signed in");
        Ok(reply.user)
    }

    /// Forget the session. The server is told on a best-effort basis.
    pub async fn logout(&self) -> Result<()> {
        if let Some(token) = self.session.access_token().await {
            let notified = async {
                let request = self.http.post(self.url(LOGOUT_PATH)?).build()?;
                self.http.execute(authorize(request, Some(&token))?).await?;
                Ok::<_, ClientError>(())
            }
            .await;
            if let Err(err) = notified {
                tracing::debug!(error = %err, "logout not acknowledged by server");
            }
        }

        self.session.clear().await;
        Ok(())
    }

    /// `GET path`, decoding a JSON response.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(self.request(Method::GET, path)?).await?;
        read_json(response).await
    }

    /// `POST path` with a JSON body, decoding a JSON response.
    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .send(self.request(Method::POST, path)?.json(body))
            .await?;
        read_json(response).await
    }

    pub async fn send(&self, request: RequestBuilder) -> Result<Response> {
        self.execute(request.build()?).await
    }

    /// Send `request` with the current access token.
    ///
    /// On 401 the token pair is refreshed and the request replayed once.
    /// A replay answered with 401 again, or a request whose body cannot be
    /// replayed, returns [`ClientError::Unauthorized`].
    pub async fn execute(&self, request: Request) -> Result<Response> {
        let replay = request.try_clone();
        let sent_with = self.session.access_token().await;

        let response = self
            .http
            .execute(authorize(request, sent_with.as_deref())?)
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(replay) = replay else {
            tracing::debug!("401 on a streaming request, cannot replay");
            return Err(ClientError::Unauthorized);
        };

        let token = self.renew(sent_with.as_deref()).await?;
        let response = self.http.execute(authorize(replay, Some(&token))?).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthorized);
        }

        Ok(response)
    }

    /// Obtain an access token newer than `stale`.
    async fn renew(&self, stale: Option<&str>) -> Result<String> {
        let guard = match self.session.enter() {
            Entry::Follower(outcome) => {
                return match outcome.await {
                    Ok(outcome) => outcome.map_err(ClientError::from),
                    Err(_) => Err(RefreshFailure::Abandoned.into()),
                };
            },
            Entry::Leader(guard) => guard,
        };

        match self.session.access_token().await {
            // Rotated by a refresh that settled before this 401 came back.
            Some(current) if Some(current.as_str()) != stale => {
                guard.settle(&Ok(current.clone()));
                return Ok(current);
            },
            // Torn down by a refresh that failed before this 401 came back:
            // the hook already fired for it.
            None if stale.is_some() => {
                tracing::debug!("session already ended, not refreshing");
                let outcome = Err(RefreshFailure::MissingRefreshToken);
                guard.settle(&outcome);
                return outcome.map_err(ClientError::from);
            },
            _ => {},
        }

        let outcome = self.refresh_tokens().await;
        if let Err(failure) = &outcome {
            let reason = match failure {
                RefreshFailure::MissingRefreshToken => SessionEnd::MissingRefreshToken,
                _ => SessionEnd::RefreshRejected,
            };
            tracing::warn!(?reason, error = %failure, "session ended, sign in required");

            self.session.clear().await;
            self.hook.session_ended(reason);
        }

        guard.settle(&outcome);
        outcome.map_err(ClientError::from)
    }

    /// Exchange the held refresh token for a new pair.
    async fn refresh_tokens(&self) -> RefreshOutcome {
        let Some(refresh_token) = self.session.refresh_token().await else {
            return Err(RefreshFailure::MissingRefreshToken);
        };

        let url = self
            .url(REFRESH_PATH)
            .map_err(|err| RefreshFailure::Transport(err.to_string()))?;
        let response = self
            .http
            .post(url)
            .json(&RefreshRequest {
                refresh_token: &refresh_token,
            })
            .send()
            .await
            .map_err(|err| RefreshFailure::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RefreshFailure::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let tokens: AuthTokens = response
            .json()
            .await
            .map_err(|err| RefreshFailure::Transport(err.to_string()))?;
        self.session.store(&tokens).await;
        tracing::debug!("token pair refreshed");

        Ok(tokens.access_token)
    }
}

fn authorize(mut request: Request, token: Option<&str>) -> Result<Request> {
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| ClientError::InvalidToken)?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(request)
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::Status {
            status: status.as_u16(),
            body,
        });
    }

    Ok(response.json().await?)
}

#[cfg(test)]
mod tests;
