//! Directory of trusted public keys, indexed by identity name.
//!
//! The server consults the directory on every inbound datagram to find the
//! key that must have produced the envelope's signature.  The client never
//! uses a directory — it verifies responses against a single pinned server
//! key handed to it out-of-band.
//!
//! # Concurrency
//!
//! Insertions happen during setup, before the server starts; lookups happen
//! on the receive thread for every datagram.  The map sits behind an
//! `RwLock` so any number of verifications can read concurrently, and
//! [`KeyDirectory::get`] clones the key out so no lock is held while the
//! (comparatively slow) RSA verification runs.

use std::collections::HashMap;
use std::sync::RwLock;

use rsa::RsaPublicKey;
use thiserror::Error;

/// Errors from [`KeyDirectory`] mutations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyDirectoryError {
    /// The identity name was empty.  Every envelope names its sender, so a
    /// key filed under "" could never be looked up.
    #[error("identity name must not be empty")]
    EmptyName,
}

/// Maps identity names to the RSA public keys trusted for them.
///
/// # Examples
///
/// ```rust,ignore
/// let keys = KeyDirectory::new();
/// keys.put("master", master_public_key)?;
/// assert!(keys.get("master").is_some());
/// assert!(keys.get("stranger").is_none());
/// ```
#[derive(Debug, Default)]
pub struct KeyDirectory {
    inner: RwLock<HashMap<String, RsaPublicKey>>,
}

impl KeyDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a key for `name`, replacing any previous entry.
    pub fn put(&self, name: &str, key: RsaPublicKey) -> Result<(), KeyDirectoryError> {
        if name.is_empty() {
            return Err(KeyDirectoryError::EmptyName);
        }
        let mut map = self.inner.write().expect("key directory lock poisoned");
        map.insert(name.to_string(), key);
        Ok(())
    }

    /// Returns a copy of the key filed under `name`, if any.
    pub fn get(&self, name: &str) -> Option<RsaPublicKey> {
        let map = self.inner.read().expect("key directory lock poisoned");
        map.get(name).cloned()
    }

    /// Number of entries.  Used by setup code to sanity-check provisioning.
    pub fn len(&self) -> usize {
        self.inner.read().expect("key directory lock poisoned").len()
    }

    /// True when the directory holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
