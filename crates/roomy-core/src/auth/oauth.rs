//! Storage the OAuth client plugs into, and the interface the session
//! manager uses to drive it.
//!
//! The authorization-code exchange itself belongs to the AT Protocol OAuth
//! client. This module owns what that client persists between CLI runs:
//! - `oauth-sessions.json`: token sets per subject DID
//! - `oauth-states.json`: pending authorizations (CSRF state and PKCE
//!   verifier), expiring after `Config::state_ttl`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AuthError, Result};
use crate::store::{ExpiringRecordStore, RecordStore};

const SESSIONS_FILE: &str = "oauth-sessions.json";
const STATES_FILE: &str = "oauth-states.json";

/// Length of generated state keys
const STATE_KEY_LEN: usize = 32;

/// PKCE verifiers must be 43-128 characters (RFC 7636)
const CODE_VERIFIER_LEN: usize = 64;

fn default_token_type() -> String {
    "DPoP".to_string()
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenSet {
    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Utc::now() >= at).unwrap_or(false)
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("expires_at", &self.expires_at)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish()
    }
}

/// OAuth material for one subject, as written to `oauth-sessions.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub subject_id: String,
    pub token_set: TokenSet,
    #[serde(default)]
    pub issuer: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a completed authorization
#[derive(Debug, Clone)]
pub struct AuthorizedSession {
    pub subject_id: String,
    pub token_set: TokenSet,
}

/// Handle for authenticated requests on behalf of a subject
#[derive(Debug, Clone)]
pub struct Agent {
    pub subject_id: String,
    pub token_set: TokenSet,
}

impl Agent {
    /// Value for the `Authorization` header
    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_set.token_type, self.token_set.access_token)
    }
}

/// The OAuth client as seen by the session manager
#[async_trait]
pub trait OAuthClient: Send + Sync {
    /// Run the authorization flow for `handle` and persist the resulting session
    async fn authorize(&self, handle: &str) -> anyhow::Result<AuthorizedSession>;

    /// Load the subject's session, refreshing tokens if needed
    async fn restore(&self, subject_id: &str) -> anyhow::Result<Agent>;

    /// Forget the subject's token set
    async fn revoke(&self, subject_id: &str) -> anyhow::Result<()>;
}

/// CSRF state kept between starting an authorization and its callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAuthorization {
    pub handle: String,
    pub code_verifier: String,
    pub redirect_uri: String,
    pub created_at: DateTime<Utc>,
}

/// Query parameters delivered to the redirect URI
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub iss: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl CallbackParams {
    pub fn from_url(url: &Url) -> Self {
        let mut params = Self::default();
        for (name, value) in url.query_pairs() {
            let value = Some(value.into_owned());
            match name.as_ref() {
                "code" => params.code = value,
                "state" => params.state = value,
                "iss" => params.iss = value,
                "error" => params.error = value,
                "error_description" => params.error_description = value,
                _ => {}
            }
        }
        params
    }
}

/// A completed callback: the verified pending state plus the code to exchange
#[derive(Debug, Clone)]
pub struct VerifiedCallback {
    pub pending: PendingAuthorization,
    pub code: String,
    pub issuer: Option<String>,
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[derive(Debug, Clone)]
pub struct OAuthStores {
    sessions: RecordStore<SessionRecord>,
    states: ExpiringRecordStore<PendingAuthorization>,
}

impl OAuthStores {
    pub fn new(config: &Config) -> Self {
        Self {
            sessions: RecordStore::in_config(config, SESSIONS_FILE),
            states: ExpiringRecordStore::in_config(config, STATES_FILE),
        }
    }

    // ===== Sessions =====

    pub fn save_session(&self, record: SessionRecord) -> Result<()> {
        let subject_id = record.subject_id.clone();
        self.sessions.set(&subject_id, record)?;
        debug!(subject = %subject_id, "OAuth session saved");
        Ok(())
    }

    pub fn get_session(&self, subject_id: &str) -> Option<SessionRecord> {
        self.sessions.get(subject_id)
    }

    pub fn delete_session(&self, subject_id: &str) -> Result<bool> {
        self.sessions.del(subject_id)
    }

    pub fn session_subjects(&self) -> Vec<String> {
        self.sessions.keys()
    }

    // ===== Pending authorizations =====

    /// Record a new authorization attempt, returning the state key to send
    /// with the authorization request
    pub fn begin_authorization(
        &self,
        handle: &str,
        redirect_uri: &str,
    ) -> Result<(String, PendingAuthorization)> {
        let state_key = random_token(STATE_KEY_LEN);
        let pending = PendingAuthorization {
            handle: handle.to_string(),
            code_verifier: random_token(CODE_VERIFIER_LEN),
            redirect_uri: redirect_uri.to_string(),
            created_at: Utc::now(),
        };

        self.states.set(&state_key, pending.clone())?;
        debug!(handle, "Authorization started");
        Ok((state_key, pending))
    }

    /// Check a callback against its pending state. The state is consumed
    /// whether or not the callback succeeds, so it cannot be replayed.
    pub fn complete_authorization(&self, params: &CallbackParams) -> Result<VerifiedCallback> {
        let state_key = params
            .state
            .as_deref()
            .ok_or_else(|| AuthError::OAuth(anyhow::anyhow!("Missing state parameter")))?;

        let pending = self.states.take(state_key)?.ok_or_else(|| {
            warn!("Callback with unknown or expired state");
            AuthError::OAuth(anyhow::anyhow!("Unknown or expired authorization state"))
        })?;

        if let Some(ref error) = params.error {
            let description = params.error_description.as_deref().unwrap_or("no description");
            return Err(AuthError::OAuth(anyhow::anyhow!(
                "Authorization denied: {} ({})",
                error,
                description
            )));
        }

        let code = params
            .code
            .clone()
            .ok_or_else(|| AuthError::OAuth(anyhow::anyhow!("Missing authorization code")))?;

        info!(handle = %pending.handle, "Authorization callback verified");
        Ok(VerifiedCallback {
            pending,
            code,
            issuer: params.iss.clone(),
        })
    }

    /// Drop every pending authorization
    pub fn clear_pending(&self) -> Result<()> {
        self.states.clear()
    }
}

/// `OAuthClient` over sessions a previous authorization left on disk.
///
/// Restores and revokes sessions from `oauth-sessions.json`. It cannot start a
/// new authorization or refresh an expired token; both need the network flow.
#[derive(Debug, Clone)]
pub struct StoredSessionClient {
    stores: OAuthStores,
}

impl StoredSessionClient {
    pub fn new(config: &Config) -> Self {
        Self {
            stores: OAuthStores::new(config),
        }
    }

    pub fn stores(&self) -> &OAuthStores {
        &self.stores
    }
}

#[async_trait]
impl OAuthClient for StoredSessionClient {
    async fn authorize(&self, handle: &str) -> anyhow::Result<AuthorizedSession> {
        Err(anyhow::anyhow!(
            "Cannot authorize {}: no interactive OAuth flow is configured",
            handle
        ))
    }

    async fn restore(&self, subject_id: &str) -> anyhow::Result<Agent> {
        let record = self
            .stores
            .get_session(subject_id)
            .ok_or_else(|| anyhow::anyhow!("No OAuth session stored for {}", subject_id))?;

        if record.token_set.is_expired() {
            return Err(anyhow::anyhow!(
                "OAuth session for {} has expired - log in again",
                subject_id
            ));
        }

        Ok(Agent {
            subject_id: record.subject_id,
            token_set: record.token_set,
        })
    }

    async fn revoke(&self, subject_id: &str) -> anyhow::Result<()> {
        self.stores.delete_session(subject_id)?;
        Ok(())
    }
}
