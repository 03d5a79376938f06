//! Roomy CLI core - local session and credential persistence.
//!
//! Everything the CLI keeps between runs lives in one config directory:
//! the current session, OAuth token sets, pending authorizations, worker
//! profiles and (without a keychain) the secrets themselves. Writers
//! coordinate through lock marker files in the same directory.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod store;

pub use auth::{CliSession, SessionManager};
pub use config::Config;
pub use error::{AuthError, Result};
