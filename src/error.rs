//! Error types for the local store, the queue, and the sales backend.

use thiserror::Error;

/// Failures of the local SQLite-backed persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialize queue: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("database lock poisoned")]
    LockPoisoned,
}

/// Failures talking to the sales backend.
///
/// The `Display` text is what ends up in a record's `syncError`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("Cannot reach backend at {url}")]
    Unreachable { url: String },
    #[error("Connection to {url} timed out")]
    Timeout { url: String },
    #[error("Network error communicating with {url}: {message}")]
    Network { url: String, message: String },
    #[error("{detail} (HTTP {status})")]
    Status { status: u16, detail: String },
    #[error("Invalid response from backend: {0}")]
    InvalidResponse(String),
}

/// Failures opening the sync engine at startup.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("offline store: {0}")]
    Store(#[from] StoreError),
    #[error("sales backend: {0}")]
    Backend(#[from] ApiError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_display_is_sync_error_text() {
        let err = ApiError::Status {
            status: 422,
            detail: "Product 7 no longer exists".into(),
        };
        assert_eq!(err.to_string(), "Product 7 no longer exists (HTTP 422)");

        let err = ApiError::Timeout {
            url: "https://pos.example.com".into(),
        };
        assert_eq!(
            err.to_string(),
            "Connection to https://pos.example.com timed out"
        );
    }
}
