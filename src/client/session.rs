//! Client token state and the refresh gate.
//!
//! A [`Session`] owns the token pair of one client and serializes token
//! refreshes: the first caller hitting a 401 becomes the leader of a refresh,
//! every caller arriving while it runs waits for its outcome.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{RwLock, oneshot};

use super::RefreshFailure;
use super::storage::{
    ACCESS_TOKEN_KEY, MemoryStorage, REFRESH_TOKEN_KEY, StorageError, TokenStorage,
};
use crate::token::AuthTokens;

/// New access token, or why none could be obtained.
pub type RefreshOutcome = Result<String, RefreshFailure>;

#[derive(Debug, Default)]
struct Tokens {
    access: Option<String>,
    refresh: Option<String>,
}

#[derive(Debug, Default)]
enum RefreshState {
    #[default]
    Idle,
    /// Waiters in arrival order.
    Refreshing(Vec<oneshot::Sender<RefreshOutcome>>),
}

/// Position of a caller entering the refresh gate.
pub(crate) enum Entry<'a> {
    /// Performs the refresh and must settle the guard.
    Leader(RefreshGuard<'a>),
    /// Receives the outcome of the leader's refresh.
    Follower(oneshot::Receiver<RefreshOutcome>),
}

/// Token state of a client.
pub struct Session {
    tokens: RwLock<Tokens>,
    refresh: Mutex<RefreshState>,
    storage: Arc<dyn TokenStorage>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }
}

impl Session {
    /// Create an empty session persisting tokens into `storage`.
    pub fn new(storage: Arc<dyn TokenStorage>) -> Self {
        Self {
            tokens: RwLock::new(Tokens::default()),
            refresh: Mutex::new(RefreshState::Idle),
            storage,
        }
    }

    /// Load persisted tokens into memory.
    pub async fn restore(&self) -> Result<(), StorageError> {
        let access = self.storage.get(ACCESS_TOKEN_KEY)?;
        let refresh = self.storage.get(REFRESH_TOKEN_KEY)?;

        let mut tokens = self.tokens.write().await;
        tokens.access = access;
        tokens.refresh = refresh;
        Ok(())
    }

    pub async fn access_token(&self) -> Option<String> {
        self.tokens.read().await.access.clone()
    }

    pub async fn refresh_token(&self) -> Option<String> {
        self.tokens.read().await.refresh.clone()
    }

    /// Keep a freshly issued pair, in memory and in storage.
    pub async fn store(&self, pair: &AuthTokens) {
        {
            let mut tokens = self.tokens.write().await;
            tokens.access = Some(pair.access_token.clone());
            tokens.refresh = Some(pair.refresh_token.clone());
        }

        let persisted = self
            .storage
            .set(ACCESS_TOKEN_KEY, &pair.access_token)
            .and_then(|_| self.storage.set(REFRESH_TOKEN_KEY, &pair.refresh_token));
        if let Err(err) = persisted {
            tracing::warn!(error = %err, "cannot persist tokens");
        }
    }

    /// Forget both tokens, in memory and in storage.
    pub async fn clear(&self) {
        *self.tokens.write().await = Tokens::default();

        let removed = self
            .storage
            .remove(ACCESS_TOKEN_KEY)
            .and_then(|_| self.storage.remove(REFRESH_TOKEN_KEY));
        if let Err(err) = removed {
            tracing::warn!(error = %err, "cannot remove persisted tokens");
        }
    }

    /// Whether a refresh is currently running.
    pub fn is_refreshing(&self) -> bool {
        matches!(*self.state(), RefreshState::Refreshing(_))
    }

    fn state(&self) -> MutexGuard<'_, RefreshState> {
        self.refresh.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enter the refresh gate.
    pub(crate) fn enter(&self) -> Entry<'_> {
        let mut state = self.state();
        if let RefreshState::Refreshing(waiters) = &mut *state {
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            return Entry::Follower(rx);
        }

        *state = RefreshState::Refreshing(Vec::new());
        Entry::Leader(RefreshGuard {
            session: self,
            released: false,
        })
    }
}

/// Leadership over the running refresh.
///
/// The gate goes back to idle when the guard is settled or dropped; waiters
/// of a dropped guard see their channel closed.
pub(crate) struct RefreshGuard<'a> {
    session: &'a Session,
    released: bool,
}

impl RefreshGuard<'_> {
    /// Hand `outcome` to every waiter and reopen the gate.
    pub(crate) fn settle(mut self, outcome: &RefreshOutcome) {
        self.release(Some(outcome));
    }

    fn release(&mut self, outcome: Option<&RefreshOutcome>) {
        if self.released {
            return;
        }
        self.released = true;

        let state = std::mem::take(&mut *self.session.state());
        let RefreshState::Refreshing(waiters) = state else {
            return;
        };

        tracing::debug!(waiters = waiters.len(), "token refresh settled");
        if let Some(outcome) = outcome {
            for waiter in waiters {
                // Receiver gone means the waiting request was cancelled.
                let _ = waiter.send(outcome.clone());
            }
        }
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.release(None);
    }
}
