use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix for the session key of a worker session
const WORKER_KEY_PREFIX: &str = "worker:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    #[serde(rename = "oauth")]
    OAuth,
    Worker,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::OAuth => write!(f, "oauth"),
            SessionKind::Worker => write!(f, "worker"),
        }
    }
}

/// One record of `cli-session.json`.
///
/// Holds no secrets; those are looked up in the `CredentialStore` when the
/// session is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "session_kind", rename_all = "snake_case")]
pub enum SessionIndexEntry {
    #[serde(rename = "oauth")]
    OAuth {
        subject_id: String,
        handle: String,
        created_at: DateTime<Utc>,
    },
    Worker {
        worker_id: String,
        public_name: String,
    },
}

impl SessionIndexEntry {
    pub fn kind(&self) -> SessionKind {
        match self {
            SessionIndexEntry::OAuth { .. } => SessionKind::OAuth,
            SessionIndexEntry::Worker { .. } => SessionKind::Worker,
        }
    }

    /// Key of this record in the session index
    pub fn session_key(&self) -> String {
        match self {
            SessionIndexEntry::OAuth { subject_id, .. } => subject_id.clone(),
            SessionIndexEntry::Worker { worker_id, .. } => worker_session_key(worker_id),
        }
    }

    pub fn display_handle(&self) -> &str {
        match self {
            SessionIndexEntry::OAuth { handle, .. } => handle,
            SessionIndexEntry::Worker { public_name, .. } => public_name,
        }
    }
}

pub fn worker_session_key(worker_id: &str) -> String {
    format!("{}{}", WORKER_KEY_PREFIX, worker_id)
}

/// Secret-free worker metadata, stored in `workers.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerProfile {
    pub worker_id: String,
    pub public_name: String,
    pub created_at: DateTime<Utc>,
}

/// A headless identity usable without interactive login. Never expires.
#[derive(Clone, PartialEq)]
pub struct WorkerCredential {
    pub worker_id: String,
    pub public_name: String,
    pub secret: String,
    pub created_at: DateTime<Utc>,
}

impl WorkerCredential {
    pub fn from_profile(profile: WorkerProfile, secret: String) -> Self {
        Self {
            worker_id: profile.worker_id,
            public_name: profile.public_name,
            secret,
            created_at: profile.created_at,
        }
    }

    pub fn profile(&self) -> WorkerProfile {
        WorkerProfile {
            worker_id: self.worker_id.clone(),
            public_name: self.public_name.clone(),
            created_at: self.created_at,
        }
    }
}

impl fmt::Debug for WorkerCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerCredential")
            .field("worker_id", &self.worker_id)
            .field("public_name", &self.public_name)
            .field("secret", &"[redacted]")
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// The current session as the rest of the CLI sees it, secrets included
#[derive(Clone, PartialEq)]
pub enum CliSession {
    OAuth {
        subject_id: String,
        handle: String,
        /// Passphrase issued by the keyserver for this subject
        derived_secret: String,
    },
    Worker(WorkerCredential),
}

impl CliSession {
    pub fn kind(&self) -> SessionKind {
        match self {
            CliSession::OAuth { .. } => SessionKind::OAuth,
            CliSession::Worker(_) => SessionKind::Worker,
        }
    }

    pub fn session_key(&self) -> String {
        match self {
            CliSession::OAuth { subject_id, .. } => subject_id.clone(),
            CliSession::Worker(worker) => worker_session_key(&worker.worker_id),
        }
    }

    pub fn display_handle(&self) -> &str {
        match self {
            CliSession::OAuth { handle, .. } => handle,
            CliSession::Worker(worker) => &worker.public_name,
        }
    }

    /// OAuth subject, if this session has one
    pub fn subject_id(&self) -> Option<&str> {
        match self {
            CliSession::OAuth { subject_id, .. } => Some(subject_id),
            CliSession::Worker(_) => None,
        }
    }

    pub fn worker(&self) -> Option<&WorkerCredential> {
        match self {
            CliSession::Worker(worker) => Some(worker),
            CliSession::OAuth { .. } => None,
        }
    }

    /// Account and secret to open the sync client with
    pub fn sync_credentials(&self) -> SyncCredentials {
        match self {
            CliSession::OAuth {
                subject_id,
                derived_secret,
                ..
            } => SyncCredentials {
                account_id: subject_id.clone(),
                secret: derived_secret.clone(),
            },
            CliSession::Worker(worker) => SyncCredentials {
                account_id: worker.worker_id.clone(),
                secret: worker.secret.clone(),
            },
        }
    }

    pub(crate) fn index_entry(&self, created_at: DateTime<Utc>) -> SessionIndexEntry {
        match self {
            CliSession::OAuth {
                subject_id, handle, ..
            } => SessionIndexEntry::OAuth {
                subject_id: subject_id.clone(),
                handle: handle.clone(),
                created_at,
            },
            CliSession::Worker(worker) => SessionIndexEntry::Worker {
                worker_id: worker.worker_id.clone(),
                public_name: worker.public_name.clone(),
            },
        }
    }
}

impl fmt::Debug for CliSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliSession::OAuth {
                subject_id, handle, ..
            } => f
                .debug_struct("OAuth")
                .field("subject_id", subject_id)
                .field("handle", handle)
                .field("derived_secret", &"[redacted]")
                .finish(),
            CliSession::Worker(worker) => f.debug_tuple("Worker").field(worker).finish(),
        }
    }
}

/// What the sync client needs to connect
#[derive(Clone, PartialEq)]
pub struct SyncCredentials {
    pub account_id: String,
    pub secret: String,
}

impl fmt::Debug for SyncCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCredentials")
            .field("account_id", &self.account_id)
            .field("secret", &"[redacted]")
            .finish()
    }
}
