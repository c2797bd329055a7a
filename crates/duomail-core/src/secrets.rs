//! Byte-oriented secret storage. Only the credential manager touches it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

pub const DEFAULT_SECRET_SERVICE: &str = "io.duomail";

#[derive(Debug, Clone, Error)]
pub enum SecretError {
    #[error("keychain error: {0}")]
    Backend(String),
    #[error("stored value changed underneath key {0}")]
    Conflict(String),
    #[error("failed to spawn blocking task: {0}")]
    TaskFailed(String),
}

impl SecretError {
    pub fn code(&self) -> &'static str {
        match self {
            SecretError::Backend(_) => "secret.backend",
            SecretError::Conflict(_) => "secret.conflict",
            SecretError::TaskFailed(_) => "secret.task_failed",
        }
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SecretError::Conflict(_))
    }
}

impl From<keyring::Error> for SecretError {
    fn from(err: keyring::Error) -> Self {
        SecretError::Backend(err.to_string())
    }
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), SecretError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SecretError>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), SecretError>;

    /// Writes `value` only if the stored bytes still equal `expected` (`None` = absent).
    async fn replace(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> Result<(), SecretError>;
}

pub fn oauth_tokens_key(account_id: &str) -> String {
    format!("oauth.tokens.{account_id}")
}

#[derive(Debug, Clone, Default)]
pub struct MemorySecretStore {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), SecretError> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SecretError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), SecretError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn replace(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> Result<(), SecretError> {
        let mut entries = self.entries.lock().await;
        if entries.get(key).map(Vec::as_slice) != expected {
            return Err(SecretError::Conflict(key.to_string()));
        }
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

/// OS keychain backed store. Keychain calls block, so each runs on the blocking pool; the
/// compare-and-swap in `replace` is serialized in-process.
#[derive(Debug, Clone)]
pub struct KeyringSecretStore {
    service_name: String,
    replace_lock: Arc<Mutex<()>>,
}

impl KeyringSecretStore {
    pub fn new() -> Self {
        Self::with_service(DEFAULT_SECRET_SERVICE)
    }

    pub fn with_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            replace_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    async fn blocking<T, F>(&self, key: &str, op: F) -> Result<T, SecretError>
    where
        T: Send + 'static,
        F: FnOnce(keyring::Entry) -> Result<T, SecretError> + Send + 'static,
    {
        let service = self.service_name.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let entry = keyring::Entry::new(&service, &key)?;
            op(entry)
        })
        .await
        .map_err(|e| SecretError::TaskFailed(e.to_string()))?
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, SecretError> {
        self.blocking(key, |entry| match entry.get_secret() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<(), SecretError> {
        let value = value.to_vec();
        self.blocking(key, move |entry| Ok(entry.set_secret(&value)?))
            .await
    }
}

impl Default for KeyringSecretStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretStore for KeyringSecretStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), SecretError> {
        let _guard = self.replace_lock.lock().await;
        self.write(key, value).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SecretError> {
        self.read(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), SecretError> {
        let _guard = self.replace_lock.lock().await;
        self.blocking(key, |entry| match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn replace(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> Result<(), SecretError> {
        let _guard = self.replace_lock.lock().await;
        let current = self.read(key).await?;
        if current.as_deref() != expected {
            return Err(SecretError::Conflict(key.to_string()));
        }
        self.write(key, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_put_get_delete() {
        let store = MemorySecretStore::new();
        assert_eq!(store.get("k").await.expect("get"), None);

        store.put("k", b"v1").await.expect("put");
        assert_eq!(store.get("k").await.expect("get"), Some(b"v1".to_vec()));

        store.delete("k").await.expect("delete");
        store.delete("k").await.expect("delete missing is fine");
        assert_eq!(store.get("k").await.expect("get"), None);
    }

    #[tokio::test]
    async fn replace_detects_concurrent_writers() {
        let store = MemorySecretStore::new();
        store.replace("k", None, b"first").await.expect("create");

        let err = store
            .replace("k", None, b"second")
            .await
            .expect_err("value exists");
        assert!(matches!(err, SecretError::Conflict(_)));

        store
            .replace("k", Some(b"first"), b"second")
            .await
            .expect("matching expectation");
        assert_eq!(store.get("k").await.expect("get"), Some(b"second".to_vec()));

        store.delete("k").await.expect("delete");
        let err = store
            .replace("k", Some(b"second"), b"third")
            .await
            .expect_err("deleted underneath");
        assert!(matches!(err, SecretError::Conflict(_)));
    }

    #[test]
    fn token_key_format() {
        assert_eq!(oauth_tokens_key("acc-1"), "oauth.tokens.acc-1");
    }

    #[test]
    fn keyring_store_uses_service_name() {
        assert_eq!(KeyringSecretStore::new().service_name(), DEFAULT_SECRET_SERVICE);
        assert_eq!(
            KeyringSecretStore::with_service("test.service").service_name(),
            "test.service"
        );
    }

    #[cfg(feature = "keychain-integration-tests")]
    mod integration {
        use super::*;

        #[tokio::test]
        #[ignore = "requires OS keychain access"]
        async fn keyring_round_trip() {
            let store = KeyringSecretStore::with_service("io.duomail.test");
            store.put("duomail-selftest", b"secret").await.expect("put");
            assert_eq!(store.get("duomail-selftest").await.expect("get"), Some(b"secret".to_vec()));
            store.delete("duomail-selftest").await.expect("delete");
            assert_eq!(store.get("duomail-selftest").await.expect("get"), None);
        }
    }
}
