//! Users and roles known by the API.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Role names granted to users.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleName {
    Student,
    Tutor,
    Admin,
    Superadmin,
}

impl RoleName {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleName::Student => "student",
            RoleName::Tutor => "tutor",
            RoleName::Admin => "admin",
            RoleName::Superadmin => "superadmin",
        }
    }
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown role `{0}`")]
pub struct UnknownRole(String);

impl FromStr for RoleName {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "student" => Ok(RoleName::Student),
            "tutor" => Ok(RoleName::Tutor),
            "admin" => Ok(RoleName::Admin),
            "superadmin" => Ok(RoleName::Superadmin),
            _ => Err(UnknownRole(s.to_owned())),
        }
    }
}

/// Role attached to a user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: i32,
    pub name: RoleName,
}

/// User representation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    /// Argon2 PHC string.
    #[serde(default, skip_serializing)]
    pub password_hash: String,
    pub role: Role,
}

/// Lookup of users, backed by whatever store the deployment provides.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Find a user by its ID.
    async fn find_by_id(&self, id: &str) -> Option<User>;

    /// Find a user by its email, case-insensitive.
    async fn find_by_email(&self, email: &str) -> Option<User>;

    /// List every user, sorted by ID.
    async fn list(&self) -> Vec<User>;
}

/// In-memory [`UserDirectory`].
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    users: DashMap<String, User>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a user.
    pub fn insert(&self, user: User) {
        self.users.insert(user.id.clone(), user);
    }
}

impl FromIterator<User> for MemoryDirectory {
    fn from_iter<I: IntoIterator<Item = User>>(iter: I) -> Self {
        let directory = Self::new();
        for user in iter {
            directory.insert(user);
        }
        directory
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn find_by_id(&self, id: &str) -> Option<User> {
        self.users.get(id).map(|user| user.value().clone())
    }

    async fn find_by_email(&self, email: &str) -> Option<User> {
        self.users
            .iter()
            .find(|user| user.email.eq_ignore_ascii_case(email))
            .map(|user| user.value().clone())
    }

    async fn list(&self) -> Vec<User> {
        let mut users: Vec<User> =
            self.users.iter().map(|user| user.value().clone()).collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        users
    }
}
