//! Authentication module for managing CLI sessions and credentials.
//!
//! This module provides:
//! - `SessionManager`: login, logout and worker registration
//! - `CredentialStore`: OS keychain storage with a file vault fallback
//! - `OAuthStores`: token sets and pending authorizations for the OAuth client
//!
//! At most one session is current. Secrets never appear in the session index.

pub mod credentials;
pub mod manager;
pub mod oauth;
pub mod session;

pub use credentials::{CredentialStore, CredentialVault};
pub use manager::SessionManager;
pub use oauth::{Agent, AuthorizedSession, OAuthClient, OAuthStores, StoredSessionClient, TokenSet};
pub use session::{
    CliSession, SessionIndexEntry, SessionKind, SyncCredentials, WorkerCredential, WorkerProfile,
};
