//! Password hashing with Argon2.

use std::sync::LazyLock;

use argon2::Argon2;
use argon2::password_hash::{
    PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use rand::rngs::OsRng;

type Result<T> = std::result::Result<T, CryptoError>;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("argon2 error: {0}")]
    Argon2(String),
}

// Verified against when the email is unknown, so both paths cost one hash.
static DUMMY_HASH: LazyLock<Option<String>> =
    LazyLock::new(|| hash_password("lms-auth-dummy-password").ok());

/// Hash a password into a PHC string.
pub fn hash_password(password: impl AsRef<[u8]>) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);

    Argon2::default()
        .hash_password(password.as_ref(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| CryptoError::Argon2(err.to_string()))
}

/// Check `password` against a PHC string.
/// Unparsable hashes never match.
pub fn verify_password(phc: &str, password: impl AsRef<[u8]>) -> bool {
    match PasswordHash::new(phc) {
        Ok(hash) => Argon2::default()
            .verify_password(password.as_ref(), &hash)
            .is_ok(),
        Err(err) => {
            tracing::warn!(error = %err, "stored password hash is not a valid PHC string");
            false
        },
    }
}

/// Burn the same amount of work as a real verification.
pub fn dummy_verify(password: impl AsRef<[u8]>) {
    if let Some(hash) = DUMMY_HASH.as_deref() {
        let _ = verify_password(hash, password);
    }
}
