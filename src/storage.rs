//! Bearer token access for sync passes.
//!
//! The production token lives in the OS credential store (DPAPI on Windows,
//! Keychain on macOS, Secret Service on Linux) via the `keyring` crate. The
//! token is read fresh at the start of every sync pass so a refresh between
//! passes is honored.

use keyring::Entry;
use std::sync::RwLock;
use tracing::warn;
use zeroize::Zeroizing;

const SERVICE_NAME: &str = "the-small-pos";

/// Credential key of the session bearer token.
pub const KEY_SESSION_TOKEN: &str = "session_token";

/// Source of the bearer token used for backend calls.
pub trait TokenStore: Send + Sync {
    /// Current token, or `None` when the terminal has no session.
    fn token(&self) -> Option<Zeroizing<String>>;
}

// ---------------------------------------------------------------------------
// OS keyring
// ---------------------------------------------------------------------------

/// Token read from the OS keyring on every call.
pub struct KeyringTokenStore {
    key: String,
}

impl KeyringTokenStore {
    pub fn new() -> Self {
        Self::with_key(KEY_SESSION_TOKEN)
    }

    pub fn with_key(key: &str) -> Self {
        Self {
            key: key.to_string(),
        }
    }
}

impl Default for KeyringTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore for KeyringTokenStore {
    fn token(&self) -> Option<Zeroizing<String>> {
        get_credential(&self.key).map(Zeroizing::new)
    }
}

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) if !pw.trim().is_empty() => Some(pw),
        Ok(_) => None,
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Token held in memory, for hosts that manage the session themselves.
#[derive(Default)]
pub struct StaticTokenStore {
    token: RwLock<Option<Zeroizing<String>>>,
}

impl StaticTokenStore {
    pub fn new(token: Option<&str>) -> Self {
        Self {
            token: RwLock::new(token.map(|t| Zeroizing::new(t.to_string()))),
        }
    }

    /// Replace the token; the next sync pass picks it up.
    pub fn set(&self, token: Option<&str>) {
        if let Ok(mut guard) = self.token.write() {
            *guard = token.map(|t| Zeroizing::new(t.to_string()));
        }
    }
}

impl TokenStore for StaticTokenStore {
    fn token(&self) -> Option<Zeroizing<String>> {
        self.token.read().ok().and_then(|g| g.clone())
    }
}
