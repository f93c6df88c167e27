//! Client-side credential bookkeeping
//!
//! The auth backend issues an opaque bearer token with no refresh mechanism.
//! The client stores the token together with the time it was issued and
//! treats it as expired after a flat 24 hours.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::{KeyValueStore, StoreError};

pub const TOKEN_KEY: &str = "token";
pub const TIMESTAMP_KEY: &str = "authTimestamp";
pub const USERNAME_KEY: &str = "username";

/// How long a token is trusted after login
pub fn session_lifetime() -> Duration {
    Duration::hours(24)
}

/// A bearer token and the time it was obtained
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub username: Option<String>,
}

impl Credentials {
    pub fn new(token: impl Into<String>, issued_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            issued_at,
            username: None,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.issued_at > session_lifetime()
    }
}

/// Writes the token, its timestamp and the username to the store
pub fn store_credentials(
    store: &mut dyn KeyValueStore,
    credentials: &Credentials,
) -> Result<(), StoreError> {
    store.set(TOKEN_KEY, credentials.token.clone())?;
    store.set(TIMESTAMP_KEY, credentials.issued_at.to_rfc3339())?;
    match &credentials.username {
        Some(username) => store.set(USERNAME_KEY, username.clone()),
        None => store.remove(USERNAME_KEY),
    }
}

/// Reads stored credentials; a missing or unreadable timestamp counts as no credentials
pub fn load_credentials(store: &dyn KeyValueStore) -> Result<Option<Credentials>, StoreError> {
    let Some(token) = store.get(TOKEN_KEY)? else {
        return Ok(None);
    };
    let Some(raw_timestamp) = store.get(TIMESTAMP_KEY)? else {
        return Ok(None);
    };
    let Ok(issued_at) = DateTime::parse_from_rfc3339(&raw_timestamp) else {
        tracing::warn!("Ignoring unreadable auth timestamp '{}'", raw_timestamp);
        return Ok(None);
    };

    Ok(Some(Credentials {
        token,
        issued_at: issued_at.with_timezone(&Utc),
        username: store.get(USERNAME_KEY)?,
    }))
}

/// Removes every stored credential
pub fn clear_credentials(store: &mut dyn KeyValueStore) -> Result<(), StoreError> {
    store.remove(TOKEN_KEY)?;
    store.remove(TIMESTAMP_KEY)?;
    store.remove(USERNAME_KEY)
}

/// Returns the stored credentials if they are still valid.
///
/// Missing, unreadable or expired credentials are cleared from the store.
pub fn active_credentials(
    store: &mut dyn KeyValueStore,
    now: DateTime<Utc>,
) -> Result<Option<Credentials>, StoreError> {
    match load_credentials(store)? {
        Some(credentials) if !credentials.is_expired(now) => Ok(Some(credentials)),
        Some(_) => {
            tracing::info!("Stored session expired; clearing credentials");
            clear_credentials(store)?;
            Ok(None)
        }
        None => {
            clear_credentials(store)?;
            Ok(None)
        }
    }
}

/// Whether a non-expired token is stored
pub fn is_authenticated(
    store: &mut dyn KeyValueStore,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    Ok(active_credentials(store, now)?.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn test_fresh_token_is_authenticated() {
        let mut store = MemoryStore::new();
        let now = Utc::now();
        store_credentials(&mut store, &Credentials::new("tok", now).with_username("ada")).unwrap();

        assert!(is_authenticated(&mut store, now + Duration::hours(23)).unwrap());
        let creds = load_credentials(&store).unwrap().unwrap();
        assert_eq!(creds.username.as_deref(), Some("ada"));
    }

    #[test]
    fn test_expired_token_is_cleared() {
        let mut store = MemoryStore::new();
        let issued = Utc::now() - Duration::hours(25);
        store_credentials(&mut store, &Credentials::new("tok", issued)).unwrap();

        assert!(!is_authenticated(&mut store, Utc::now()).unwrap());
        assert_eq!(store.get(TOKEN_KEY).unwrap(), None);
        assert_eq!(store.get(TIMESTAMP_KEY).unwrap(), None);
    }

    #[test]
    fn test_token_without_timestamp_is_not_authenticated() {
        let mut store = MemoryStore::new();
        store.set(TOKEN_KEY, "tok".to_string()).unwrap();
        assert!(!is_authenticated(&mut store, Utc::now()).unwrap());
        assert_eq!(store.get(TOKEN_KEY).unwrap(), None);
    }

    #[test]
    fn test_garbage_timestamp_is_ignored() {
        let mut store = MemoryStore::new();
        store.set(TOKEN_KEY, "tok".to_string()).unwrap();
        store.set(TIMESTAMP_KEY, "yesterday".to_string()).unwrap();
        assert_eq!(load_credentials(&store).unwrap(), None);
    }
}
