// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Config service and storage port.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Storage port for raw config blobs, keyed by logical name.
pub trait ConfigStore {
    /// Load a raw blob. Returns `NotFound` when missing.
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError>;
    /// Persist a raw blob.
    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError>;
}

/// Error type for config operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Key not present in store.
    #[error("not found")]
    NotFound,
    /// I/O error while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization/deserialization failure.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    /// Catch-all (unresolvable config dir, invalid key).
    #[error("other: {0}")]
    Other(String),
}

/// Keys become file names; only `[A-Za-z0-9_.-]` is accepted.
pub(crate) fn validate_key(key: &str) -> Result<(), ConfigError> {
    let ok = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if ok {
        Ok(())
    } else {
        Err(ConfigError::Other(format!("invalid config key {key:?}")))
    }
}

/// Serializes config values as JSON over a [`ConfigStore`].
#[derive(Debug)]
pub struct ConfigService<S> {
    store: S,
}

impl<S> ConfigService<S> {
    /// Service over `store`.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Consume the service and return the inner store.
    pub fn into_inner(self) -> S {
        self.store
    }
}

impl<S> ConfigService<S>
where
    S: ConfigStore,
{
    /// Load and deserialize `key`. `Ok(None)` if missing or empty.
    pub fn load<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: DeserializeOwned,
    {
        match self.store.load_raw(key) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(None),
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(ConfigError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Like [`load`](Self::load), falling back to `T::default()` when missing.
    pub fn load_or_default<T>(&self, key: &str) -> Result<T, ConfigError>
    where
        T: DeserializeOwned + Default,
    {
        Ok(self.load(key)?.unwrap_or_default())
    }

    /// Serialize (pretty JSON) and persist `value` under `key`.
    pub fn save<T>(&self, key: &str, value: &T) -> Result<(), ConfigError>
    where
        T: Serialize,
    {
        let data = serde_json::to_vec_pretty(value)?;
        self.store.save_raw(key, &data)
    }
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryConfigStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
        validate_key(key)?;
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or(ConfigError::NotFound)
    }

    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
        validate_key(key)?;
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Prefs {
        url: String,
        retries: u32,
    }

    #[test]
    fn missing_and_blank_values_load_as_none() {
        let svc = ConfigService::new(MemoryConfigStore::new());
        assert_eq!(svc.load::<Prefs>("absent").unwrap(), None);
        svc.store().save_raw("blank", b"  \n").unwrap();
        assert_eq!(svc.load::<Prefs>("blank").unwrap(), None);
        assert_eq!(svc.load_or_default::<Prefs>("absent").unwrap(), Prefs::default());
    }

    #[test]
    fn save_then_load() {
        let svc = ConfigService::new(MemoryConfigStore::new());
        let prefs = Prefs {
            url: "http://x/graphql".into(),
            retries: 2,
        };
        svc.save("prefs", &prefs).unwrap();
        assert_eq!(svc.load::<Prefs>("prefs").unwrap(), Some(prefs));
    }

    #[test]
    fn corrupt_blob_is_a_serde_error() {
        let svc = ConfigService::new(MemoryConfigStore::new());
        svc.store().save_raw("prefs", b"{not json").unwrap();
        assert!(matches!(
            svc.load::<Prefs>("prefs"),
            Err(ConfigError::Serde(_))
        ));
    }

    #[test]
    fn keys_cannot_escape_the_store() {
        for key in ["", "../etc/passwd", "a/b", ".hidden"] {
            assert!(matches!(validate_key(key), Err(ConfigError::Other(_))), "{key}");
        }
        assert!(validate_key("replay_network").is_ok());
        assert!(validate_key("v1.2-x").is_ok());
    }
}
