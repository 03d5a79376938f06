use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Lock already exists for key: {key}")]
    LockHeld { key: String },

    #[error("No active session - log in or register a worker first")]
    NoSession,

    #[error("Already logged in as {current} - run `roomy logout` first")]
    SessionExists { current: String },

    #[error("Could not retrieve credentials")]
    CredentialRetrieval(#[source] anyhow::Error),

    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    #[error("Invalid worker: {0}")]
    InvalidWorker(String),

    #[error("OAuth error: {0}")]
    OAuth(#[source] anyhow::Error),

    #[error("Keychain error: {0}")]
    Keychain(#[from] keyring::Error),

    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AuthError {
    /// Whether retrying after the lock staleness window may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::LockHeld { .. })
    }

    /// Whether the user can fix this by logging in again
    pub fn needs_login(&self) -> bool {
        matches!(self, AuthError::NoSession)
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
