//! Error handler for lms-auth.

use axum::extract::rejection::JsonRejection;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::ValidationErrors;

pub type Result<T> = std::result::Result<T, ServerError>;

/// Enum representing server-side errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Missing or invalid authorization header")]
    MissingAuthorization,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("Insufficient permissions")]
    Forbidden,

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Invalid or expired refresh token")]
    InvalidRefreshToken,

    #[error("validation error occurred")]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Json(#[from] JsonRejection),

    #[error("missing `{0}` token secret")]
    MissingSecret(&'static str),

    #[error("invalid configuration, {0}")]
    Config(String),

    #[error("token signing failed: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("internal server error, {details}")]
    Internal {
        details: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Body of every error response.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub error: String,
    pub message: String,
}

impl ResponseError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            error: status
                .canonical_reason()
                .unwrap_or("Internal Server Error")
                .to_owned(),
            message: message.into(),
        }
    }
}

impl ServerError {
    /// HTTP status matching the error.
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::MissingAuthorization
            | ServerError::InvalidToken
            | ServerError::AuthenticationRequired
            | ServerError::InvalidCredentials
            | ServerError::InvalidRefreshToken => StatusCode::UNAUTHORIZED,
            ServerError::Forbidden => StatusCode::FORBIDDEN,
            ServerError::Validation(_) | ServerError::Json(_) => {
                StatusCode::BAD_REQUEST
            },
            ServerError::MissingSecret(_)
            | ServerError::Config(_)
            | ServerError::Token(_)
            | ServerError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();

        let message = match &self {
            ServerError::Validation(errors) => parse_validation_errors(errors),
            ServerError::Json(rejection) => rejection.body_text(),
            ServerError::Internal { details, source } => {
                tracing::error!(err = ?source, %details, "server returned 500 status");
                "Internal server error".to_owned()
            },
            ServerError::MissingSecret(_)
            | ServerError::Config(_)
            | ServerError::Token(_) => {
                tracing::error!(error = %self, "server returned 500 status");
                "Internal server error".to_owned()
            },
            _ => self.to_string(),
        };

        let body = ResponseError::new(status, message);
        match serde_json::to_string(&body) {
            Ok(body) => Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.into())
                .unwrap_or_else(|_| internal_server_error()),
            Err(_) => internal_server_error(),
        }
    }
}

fn parse_validation_errors(errors: &ValidationErrors) -> String {
    errors
        .field_errors()
        .iter()
        .flat_map(|(field, issues)| {
            issues.iter().map(move |issue| match &issue.message {
                Some(message) => format!("{field}: {message}"),
                None => format!("{field}: {}", issue.code),
            })
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn internal_server_error() -> Response {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(
            serde_json::json!({
                "error": "Internal Server Error",
                "message": "Internal server error",
            })
            .to_string()
            .into(),
        )
        .unwrap_or_else(|_| Response::new("Internal server error".into()))
}
