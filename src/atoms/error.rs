// ── VaultStream Atoms: Error Types ─────────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (I/O, DB, Network, Validation…).
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • `kind()` maps every variant onto the logical taxonomy the API layer
//     translates into HTTP status codes (400/401/404/409/5xx).
//   • No variant carries secret material (bot tokens, API keys) in its message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Bad input from a caller. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing or invalid credentials (API token, adapter cookies, bot token).
    #[error("Auth error: {0}")]
    Auth(String),

    /// The referenced entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unique-constraint conflict; internally handled as an idempotent no-op.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Transient upstream failure (timeout, 5xx, 429). Retryable.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Platform transport (Telegram / OneBot) failure.
    #[error("Transport error: {platform}: {message}")]
    Transport { platform: String, message: String, retryable: bool },

    /// Adapter-level parse failure that is permanently non-retryable.
    #[error("Adapter error: {adapter}: {message}")]
    Adapter { adapter: String, message: String },

    /// Blob storage backend failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Engine configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Other(String),
}

// ── Logical error kinds ────────────────────────────────────────────────────

/// The logical kind of an error, independent of its concrete variant.
/// Workers use this to decide between retry and terminal failure; the API
/// layer maps it onto an HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Auth,
    NotFound,
    Conflict,
    Transient,
    Fatal,
}

impl ErrorKind {
    /// Stable string recorded into `last_error_type` columns.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Auth => "auth",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::Auth(_) => ErrorKind::Auth,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::Transient(_) => ErrorKind::Transient,
            EngineError::Io(_) | EngineError::Network(_) | EngineError::Storage(_) => {
                ErrorKind::Transient
            }
            EngineError::Transport { retryable, .. } => {
                if *retryable { ErrorKind::Transient } else { ErrorKind::Fatal }
            }
            EngineError::Adapter { .. } => ErrorKind::Fatal,
            EngineError::Database(_) | EngineError::Config(_) => ErrorKind::Fatal,
            EngineError::Serialization(_) => ErrorKind::Validation,
            EngineError::Other(_) => ErrorKind::Fatal,
        }
    }

    /// True when the failure is worth another attempt under backoff.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Create a transport error with platform, message and retry class.
    pub fn transport(platform: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self::Transport { platform: platform.into(), message: message.into(), retryable }
    }

    /// Create an adapter error with name and message.
    pub fn adapter(adapter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Adapter { adapter: adapter.into(), message: message.into() }
    }
}

// ── Migration bridge: String → EngineError ─────────────────────────────────
// Allows `?` on helpers that return `Result<T, String>` inside functions
// that return `EngineResult<T>`.

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations should return this type.
pub type EngineResult<T> = Result<T, EngineError>;
