use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;

use crate::storage::{KeyValueStore, StorageError};

pub const CREDENTIALS_STORAGE_KEY: &str = "cc-auth";

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("stored credentials are unreadable: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("server url must not be empty")]
    MissingServer,
}

/// The server a client is paired with and the token it authenticates with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredentials {
    pub server_url: String,
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub saved_at: OffsetDateTime,
}

impl StoredCredentials {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            refresh_token: None,
            saved_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    /// Token with all but the last four characters hidden.
    pub fn masked_token(&self) -> String {
        let visible: String = self
            .token
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        if self.token.chars().count() <= 4 {
            "*".repeat(self.token.chars().count())
        } else {
            format!("****{visible}")
        }
    }

    pub fn load(store: &dyn KeyValueStore) -> Result<Option<Self>, CredentialsError> {
        match store.get(CREDENTIALS_STORAGE_KEY)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn save(&self, store: &dyn KeyValueStore) -> Result<(), CredentialsError> {
        if self.server_url.trim().is_empty() {
            return Err(CredentialsError::MissingServer);
        }
        let raw = serde_json::to_string(self)?;
        store.set(CREDENTIALS_STORAGE_KEY, &raw)?;
        debug!(target: "clawchat::store", server = %self.server_url, "credentials saved");
        Ok(())
    }

    pub fn clear(store: &dyn KeyValueStore) -> Result<(), CredentialsError> {
        store.remove(CREDENTIALS_STORAGE_KEY)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileStore, MemoryStore};

    #[test]
    fn save_load_clear() {
        let store = MemoryStore::new();
        assert!(StoredCredentials::load(&store).unwrap().is_none());

        let creds = StoredCredentials::new("https://chat.example.com/", "secret-token")
            .with_refresh_token("refresh");
        creds.save(&store).unwrap();
        let loaded = StoredCredentials::load(&store).unwrap().unwrap();
        assert_eq!(loaded.server_url, "https://chat.example.com");
        assert_eq!(loaded, creds);

        StoredCredentials::clear(&store).unwrap();
        assert!(StoredCredentials::load(&store).unwrap().is_none());
    }

    #[test]
    fn survives_restart_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        StoredCredentials::new("http://10.0.0.2:8000", "tok")
            .save(&FileStore::new(dir.path()))
            .unwrap();
        let loaded = StoredCredentials::load(&FileStore::new(dir.path()))
            .unwrap()
            .unwrap();
        assert_eq!(loaded.token, "tok");
    }

    #[test]
    fn corrupt_record_is_an_error() {
        let store = MemoryStore::new();
        store.set(CREDENTIALS_STORAGE_KEY, "{not json").unwrap();
        assert!(matches!(
            StoredCredentials::load(&store),
            Err(CredentialsError::Corrupt(_))
        ));
    }

    #[test]
    fn empty_server_is_rejected() {
        let store = MemoryStore::new();
        let err = StoredCredentials::new("  ", "tok").save(&store).unwrap_err();
        assert!(matches!(err, CredentialsError::MissingServer));
    }

    #[test]
    fn token_is_masked() {
        assert_eq!(StoredCredentials::new("http://s", "abcdefgh").masked_token(), "****efgh");
        assert_eq!(StoredCredentials::new("http://s", "abc").masked_token(), "***");
    }
}
