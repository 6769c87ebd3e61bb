//! Configuration manager for lms-auth.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::FromRef;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::AppState;
use crate::user::User;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const DEFAULT_ADDRESS: &str = "0.0.0.0:8080";
const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Environment variable overriding the configuration file path.
pub const CONFIG_PATH_ENV: &str = "LMS_CONFIG";
/// Environment variable overriding `token.access_secret`.
pub const ACCESS_SECRET_ENV: &str = "LMS_ACCESS_TOKEN_SECRET";
/// Environment variable overriding `token.refresh_secret`.
pub const REFRESH_SECRET_ENV: &str = "LMS_REFRESH_TOKEN_SECRET";

fn default_address() -> String {
    DEFAULT_ADDRESS.to_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Instance name.
    pub name: String,
    /// Public URL of the instance, used as token issuer.
    pub url: String,
    /// Socket address to bind.
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default)]
    version: String,
    #[serde(skip)]
    path: PathBuf,
    /// Token signing secrets.
    #[serde(default, skip_serializing)]
    pub token: Token,
    /// Users seeding the in-memory directory.
    #[serde(default, skip_serializing)]
    pub users: Vec<User>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            name: env!("CARGO_CRATE_NAME").to_owned(),
            url: "http://localhost:8080/".to_owned(),
            address: default_address(),
            version: VERSION.to_owned(),
            path: PathBuf::default(),
            token: Token::default(),
            users: Vec::new(),
        }
    }
}

/// Json Web Token secrets.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Token {
    #[serde(default)]
    pub access_secret: String,
    #[serde(default)]
    pub refresh_secret: String,
}

impl FromRef<AppState> for Arc<Configuration> {
    fn from_ref(state: &AppState) -> Arc<Configuration> {
        Arc::clone(&state.config)
    }
}

impl Configuration {
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// Application version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Normalizes a URL string by ensuring it starts with a valid scheme
    /// (`http` or `https`).
    fn normalize_url(url: &str) -> Result<String, url::ParseError> {
        let url_with_scheme =
            if url.starts_with("http://") || url.starts_with("https://") {
                url.to_string()
            } else {
                format!("https://{url}")
            };

        let parsed_url = Url::parse(&url_with_scheme)?;
        Ok(parsed_url.to_string())
    }

    /// Reads the configuration file from the specified path, `LMS_CONFIG`
    /// or the default location, then applies secret overrides from the
    /// environment.
    pub fn read(self) -> Result<Arc<Self>, url::ParseError> {
        let file_path = if self.path.is_file() {
            self.path.clone()
        } else if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            PathBuf::from(path)
        } else {
            PathBuf::from(DEFAULT_CONFIG_PATH)
        };

        let mut config = match File::open(&file_path) {
            Ok(file) => match serde_yaml::from_reader::<_, Configuration>(file) {
                Ok(config) => config,
                Err(err) => self.error(err),
            },
            Err(err) => self.error(err),
        };

        // set app version.
        config.version = VERSION.to_owned();
        config.path = file_path;
        config.url = Self::normalize_url(&config.url)?;
        config.apply_env(|key| std::env::var(key).ok());

        Ok(Arc::new(config))
    }

    /// Override secrets with non-empty values returned by `lookup`.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(secret) = lookup(ACCESS_SECRET_ENV).filter(|s| !s.is_empty()) {
            self.token.access_secret = secret;
        }
        if let Some(secret) = lookup(REFRESH_SECRET_ENV).filter(|s| !s.is_empty()) {
            self.token.refresh_secret = secret;
        }
    }

    /// Return a default configuration as fallback.
    fn error(&self, err: impl std::error::Error) -> Self {
        tracing::error!(error = %err, "configuration file not found or invalid");
        Self::default()
    }
}
