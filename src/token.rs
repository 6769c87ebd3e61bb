//! Manage json web tokens.
//!
//! Access and refresh tokens carry the same [`TokenPayload`] but are signed
//! with two independent secrets, so one can never be accepted as the other.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ServerError};
use crate::user::{RoleName, User};

const ALGORITHM: Algorithm = Algorithm::HS256;
pub const ACCESS_TOKEN_EXPIRATION: u64 = 60 * 15; // 15 minutes.
pub const REFRESH_TOKEN_EXPIRATION: u64 = 60 * 60 * 24 * 7; // 7 days.

/// Source of the current time, in seconds since Unix epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// System clock using the OS time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }
}

/// Clock frozen on a timestamp.
#[derive(Debug)]
pub struct FixedClock(pub u64);

impl Clock for FixedClock {
    fn now(&self) -> u64 {
        self.0
    }
}

/// Identity signed inside every token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPayload {
    pub user_id: String,
    pub email: String,
    pub role_id: i32,
    pub role_name: RoleName,
}

impl From<&User> for TokenPayload {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.id.clone(),
            email: user.email.clone(),
            role_id: user.role.id,
            role_name: user.role.name,
        }
    }
}

/// Pair of freshly issued tokens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    #[serde(flatten)]
    payload: TokenPayload,
    /// Organization that issued the JWT.
    iss: String,
    /// Time at which the JWT was issued.
    iat: u64,
    /// Expiration time on or after which the JWT must not be accepted.
    exp: u64,
}

struct Secret {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl Secret {
    fn new(kind: &'static str, secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(ServerError::MissingSecret(kind));
        }

        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        })
    }
}

/// Sign and verify access and refresh tokens.
pub struct TokenIssuer {
    issuer: String,
    access: Secret,
    refresh: Secret,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    /// Create a new [`TokenIssuer`].
    ///
    /// Both secrets must be set and differ from each other.
    pub fn new(
        issuer: impl Into<String>,
        access_secret: &str,
        refresh_secret: &str,
    ) -> Result<Self> {
        let access = Secret::new("access", access_secret)?;
        let refresh = Secret::new("refresh", refresh_secret)?;

        if access_secret == refresh_secret {
            return Err(ServerError::Config(
                "access and refresh token secrets must differ".into(),
            ));
        }

        Ok(Self {
            issuer: issuer.into(),
            access,
            refresh,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the clock used to stamp `iat` and `exp`.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    fn sign(&self, secret: &Secret, user: &User, ttl: u64) -> Result<String> {
        let now = self.clock.now();
        let claims = Claims {
            payload: TokenPayload::from(user),
            iss: self.issuer.clone(),
            iat: now,
            exp: now + ttl,
        };

        Ok(encode(&Header::new(ALGORITHM), &claims, &secret.encoding)?)
    }

    fn verify(&self, secret: &Secret, token: &str) -> Option<TokenPayload> {
        let mut validation = Validation::new(ALGORITHM);
        validation.leeway = 0;
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "iss"]);

        match decode::<Claims>(token, &secret.decoding, &validation) {
            Ok(data) => Some(data.claims.payload),
            Err(err) => {
                tracing::debug!(error = %err, "token verification failed");
                None
            },
        }
    }

    /// Sign a 15 minutes access token for `user`.
    pub fn generate_access_token(&self, user: &User) -> Result<String> {
        self.sign(&self.access, user, ACCESS_TOKEN_EXPIRATION)
    }

    /// Sign a 7 days refresh token for `user`.
    pub fn generate_refresh_token(&self, user: &User) -> Result<String> {
        self.sign(&self.refresh, user, REFRESH_TOKEN_EXPIRATION)
    }

    /// Sign both tokens.
    pub fn generate_tokens(&self, user: &User) -> Result<AuthTokens> {
        Ok(AuthTokens {
            access_token: self.generate_access_token(user)?,
            refresh_token: self.generate_refresh_token(user)?,
        })
    }

    /// Check signature, issuer and expiry of an access token.
    pub fn verify_access_token(&self, token: &str) -> Option<TokenPayload> {
        self.verify(&self.access, token)
    }

    /// Check signature, issuer and expiry of a refresh token.
    pub fn verify_refresh_token(&self, token: &str) -> Option<TokenPayload> {
        self.verify(&self.refresh, token)
    }

    /// Read the payload without checking signature nor expiry.
    /// MUST NEVER be used to trust a token.
    pub fn decode_token(token: &str) -> Option<TokenPayload> {
        let mut validation = Validation::new(ALGORITHM);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
            .ok()
            .map(|data| data.claims.payload)
    }
}
