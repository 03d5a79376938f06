//! HTTP client module for the Roomy keyserver.
//!
//! The keyserver exchanges an OAuth access token for the passphrase that
//! opens the user's sync account. Requests use bearer token authentication.

pub mod error;
pub mod keyserver;

pub use error::ApiError;
pub use keyserver::{Keyserver, KeyserverClient};
