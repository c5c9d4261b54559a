use std::sync::Arc;

use crate::models::{AuthToken, UserProfile};
use crate::storage::{KeyValueStore, StorageError};

/// Storage key for the serialized user profile. Must stay stable across
/// releases or existing sessions will not restore.
pub const USER_STORAGE_KEY: &str = "@marketspace:user";

/// Storage key for the serialized token record.
pub const AUTH_TOKEN_STORAGE_KEY: &str = "@marketspace:token";

/// Persists the signed-in user's profile and token under two fixed keys.
///
/// The two keys are written independently. Callers that need both to agree
/// must handle a failure between the two writes themselves.
#[derive(Clone)]
pub struct CredentialStore {
    store: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Store the user profile
    pub async fn save_profile(&self, profile: &UserProfile) -> Result<(), StorageError> {
        let json = serde_json::to_string(profile)?;
        self.store.set(USER_STORAGE_KEY, &json).await
    }

    /// Retrieve the stored user profile, if any
    pub async fn get_profile(&self) -> Result<Option<UserProfile>, StorageError> {
        match self.store.get(USER_STORAGE_KEY).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn remove_profile(&self) -> Result<(), StorageError> {
        self.store.remove(USER_STORAGE_KEY).await
    }

    /// Store the token record
    pub async fn save_token(&self, token: &AuthToken) -> Result<(), StorageError> {
        let json = serde_json::to_string(token)?;
        self.store.set(AUTH_TOKEN_STORAGE_KEY, &json).await
    }

    /// Retrieve the stored token record, if any
    pub async fn get_token(&self) -> Result<Option<AuthToken>, StorageError> {
        match self.store.get(AUTH_TOKEN_STORAGE_KEY).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn remove_token(&self) -> Result<(), StorageError> {
        self.store.remove(AUTH_TOKEN_STORAGE_KEY).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn test_profile_and_token_are_independent() {
        let backend = Arc::new(MemoryStore::new());
        let creds = CredentialStore::new(backend.clone());

        let profile = UserProfile {
            id: "u1".to_string(),
            name: "Ana".to_string(),
            ..Default::default()
        };
        creds.save_profile(&profile).await.unwrap();
        assert_eq!(creds.get_profile().await.unwrap(), Some(profile));
        assert_eq!(creds.get_token().await.unwrap(), None);

        let token = AuthToken::new("tok-A", Some("ref-A".to_string()));
        creds.save_token(&token).await.unwrap();
        assert_eq!(creds.get_token().await.unwrap(), Some(token));

        creds.remove_profile().await.unwrap();
        assert!(!backend.contains(USER_STORAGE_KEY));
        assert!(backend.contains(AUTH_TOKEN_STORAGE_KEY));

        creds.remove_token().await.unwrap();
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_profile_is_an_error() {
        let backend = Arc::new(MemoryStore::new());
        backend.set(USER_STORAGE_KEY, "{not json").await.unwrap();

        let creds = CredentialStore::new(backend);
        assert!(matches!(
            creds.get_profile().await,
            Err(StorageError::Serialization(_))
        ));
    }
}
