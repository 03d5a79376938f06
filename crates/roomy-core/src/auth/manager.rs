use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::credentials::{CredentialStore, SESSION_SERVICE, WORKER_SERVICE};
use super::oauth::{Agent, AuthorizedSession, OAuthClient};
use super::session::{
    worker_session_key, CliSession, SessionIndexEntry, SyncCredentials, WorkerCredential,
    WorkerProfile,
};
use crate::api::Keyserver;
use crate::config::Config;
use crate::error::{AuthError, Result};
use crate::store::{RecordStore, RuntimeLock};

/// Session index file name in the config directory
const SESSION_INDEX_FILE: &str = "cli-session.json";

/// Worker profile file name in the config directory
const WORKERS_FILE: &str = "workers.json";

/// Lock key guarding session index writes
const SESSION_LOCK_KEY: &str = "session";

/// Owns the lifecycle of the current session.
///
/// States: logged out, an OAuth session for one subject, or a worker session.
/// Exactly one session is current at a time. Secrets stay in the
/// `CredentialStore`; the session index only names whose they are.
pub struct SessionManager {
    config: Config,
    index: RecordStore<SessionIndexEntry>,
    workers: RecordStore<WorkerProfile>,
    credentials: CredentialStore,
    lock: RuntimeLock,
    oauth: Arc<dyn OAuthClient>,
    keyserver: Arc<dyn Keyserver>,
}

impl SessionManager {
    pub fn new(config: Config, oauth: Arc<dyn OAuthClient>, keyserver: Arc<dyn Keyserver>) -> Self {
        Self {
            index: RecordStore::in_config(&config, SESSION_INDEX_FILE),
            workers: RecordStore::in_config(&config, WORKERS_FILE),
            credentials: CredentialStore::new(&config),
            lock: RuntimeLock::from_config(&config),
            config,
            oauth,
            keyserver,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ===== Login =====

    /// Log in through the OAuth client and fetch the derived passphrase.
    ///
    /// Logging in again as the current user replaces the session. Any other
    /// current session must be cleared first.
    pub async fn login(&self, handle: &str) -> Result<CliSession> {
        self.check_can_login(handle, None)?;

        info!(handle, "Starting OAuth login");
        let authorized = self
            .oauth
            .authorize(handle)
            .await
            .map_err(AuthError::OAuth)?;
        debug!(subject = %authorized.subject_id, "OAuth authorization complete");

        let derived_secret = self.fetch_derived_secret(&authorized).await?;

        let session = CliSession::OAuth {
            subject_id: authorized.subject_id.clone(),
            handle: handle.to_string(),
            derived_secret,
        };

        let persisted = self.lock.with_lock(SESSION_LOCK_KEY, || {
            // Another process may have logged in while we were authorizing
            self.check_can_login(handle, Some(&authorized.subject_id))?;
            self.persist(&session)
        });

        match persisted {
            Ok(replaced) => self.retire_all(replaced).await,
            Err(e) => {
                if matches!(e, AuthError::SessionExists { .. }) {
                    if let Err(revoke_err) = self.oauth.revoke(&authorized.subject_id).await {
                        warn!(error = %revoke_err, "Failed to drop unused OAuth session");
                    }
                }
                return Err(e);
            }
        }

        info!(handle, subject = %authorized.subject_id, "Login complete");
        Ok(session)
    }

    fn check_can_login(&self, handle: &str, subject_id: Option<&str>) -> Result<()> {
        match self.current_entry() {
            None => Ok(()),
            Some(SessionIndexEntry::OAuth {
                subject_id: current_subject,
                handle: current_handle,
                ..
            }) if current_handle == handle || Some(current_subject.as_str()) == subject_id => Ok(()),
            Some(current) => Err(AuthError::SessionExists {
                current: current.display_handle().to_string(),
            }),
        }
    }

    async fn fetch_derived_secret(&self, authorized: &AuthorizedSession) -> Result<String> {
        let passphrase = self
            .keyserver
            .fetch_passphrase(&authorized.token_set.access_token)
            .await
            .map_err(|e| {
                warn!(subject = %authorized.subject_id, error = %e, "Keyserver request failed");
                AuthError::CredentialRetrieval(e)
            })?;

        if passphrase.is_empty() {
            return Err(AuthError::CredentialRetrieval(anyhow::anyhow!(
                "No passphrase found"
            )));
        }
        Ok(passphrase)
    }

    // ===== Workers =====

    /// Store a worker credential and make it the current session
    pub async fn register_worker(
        &self,
        worker_id: &str,
        public_name: &str,
        secret: &str,
    ) -> Result<CliSession> {
        if worker_id.trim().is_empty() {
            return Err(AuthError::InvalidWorker("worker ID is empty".to_string()));
        }
        if secret.is_empty() {
            return Err(AuthError::InvalidWorker("worker secret is empty".to_string()));
        }

        let session = CliSession::Worker(WorkerCredential {
            worker_id: worker_id.to_string(),
            public_name: public_name.to_string(),
            secret: secret.to_string(),
            created_at: Utc::now(),
        });

        let replaced = self
            .lock
            .with_lock(SESSION_LOCK_KEY, || self.persist(&session))?;
        self.retire_all(replaced).await;

        info!(worker_id, public_name, "Worker registered");
        Ok(session)
    }

    pub fn list_workers(&self) -> Vec<WorkerProfile> {
        self.workers
            .entries()
            .into_iter()
            .map(|(_, profile)| profile)
            .collect()
    }

    /// Look up a worker by ID, or failing that by public name
    pub fn get_worker(&self, id_or_name: &str) -> Option<WorkerCredential> {
        let profile = self.workers.get(id_or_name).or_else(|| {
            self.list_workers()
                .into_iter()
                .find(|profile| profile.public_name == id_or_name)
        })?;
        self.hydrate_worker(profile)
    }

    /// Delete a worker's credential, ending its session if it is current
    pub fn remove_worker(&self, worker_id: &str) -> Result<()> {
        self.lock.with_lock(SESSION_LOCK_KEY, || {
            let had_profile = self.workers.del(worker_id)?;
            let had_secret = self.credentials.has_credentials(WORKER_SERVICE, worker_id);
            if !had_profile && !had_secret {
                return Err(AuthError::UnknownWorker(worker_id.to_string()));
            }

            self.credentials.delete(WORKER_SERVICE, worker_id)?;
            if self.index.del(&worker_session_key(worker_id))? {
                info!(worker_id, "Current worker session ended");
            }
            info!(worker_id, "Worker removed");
            Ok(())
        })
    }

    fn hydrate_worker(&self, profile: WorkerProfile) -> Option<WorkerCredential> {
        match self
            .credentials
            .get_password(WORKER_SERVICE, &profile.worker_id)
        {
            Some(secret) => Some(WorkerCredential::from_profile(profile, secret)),
            None => {
                warn!(worker_id = %profile.worker_id, "Worker secret missing");
                None
            }
        }
    }

    // ===== Current session =====

    fn current_entry(&self) -> Option<SessionIndexEntry> {
        let entries = self.index.entries();
        if entries.len() > 1 {
            warn!(count = entries.len(), "Multiple sessions in index, using the first");
        }
        entries.into_iter().next().map(|(_, entry)| entry)
    }

    /// The current session with its secrets, or `None` when logged out or
    /// when the stored data is incomplete. Reads only.
    pub fn load_session(&self) -> Option<CliSession> {
        let entry = self.current_entry()?;

        match entry {
            SessionIndexEntry::OAuth {
                subject_id, handle, ..
            } => match self.credentials.get_password(SESSION_SERVICE, &subject_id) {
                Some(derived_secret) => Some(CliSession::OAuth {
                    subject_id,
                    handle,
                    derived_secret,
                }),
                None => {
                    warn!(subject = %subject_id, "Passphrase missing for stored session");
                    None
                }
            },
            SessionIndexEntry::Worker { worker_id, .. } => {
                let Some(profile) = self.workers.get(&worker_id) else {
                    warn!(%worker_id, "Worker profile missing for stored session");
                    return None;
                };
                self.hydrate_worker(profile).map(CliSession::Worker)
            }
        }
    }

    /// Like `load_session`, but a missing session is an error
    pub fn require_session(&self) -> Result<CliSession> {
        self.load_session().ok_or(AuthError::NoSession)
    }

    /// Make `session` the current session, replacing any other
    pub async fn save_session(&self, session: &CliSession) -> Result<()> {
        let replaced = self
            .lock
            .with_lock(SESSION_LOCK_KEY, || self.persist(session))?;
        self.retire_all(replaced).await;
        Ok(())
    }

    /// Log out. Returns `false` if there was no session to clear.
    /// Worker credentials survive; use `remove_worker` to delete them.
    pub async fn clear_session(&self) -> Result<bool> {
        let cleared = self
            .lock
            .with_lock(SESSION_LOCK_KEY, || -> Result<Vec<SessionIndexEntry>> {
                let entries = self.index.entries();
                if !entries.is_empty() {
                    self.index.clear()?;
                }
                Ok(entries.into_iter().map(|(_, entry)| entry).collect())
            })?;

        if cleared.is_empty() {
            info!("No active session found");
            return Ok(false);
        }

        for entry in &cleared {
            info!(handle = entry.display_handle(), kind = %entry.kind(), "Session cleared");
        }
        self.retire_all(cleared).await;
        Ok(true)
    }

    /// OAuth agent for the current session; the OAuth client refreshes tokens
    pub async fn get_agent(&self) -> Result<Agent> {
        match self.current_entry() {
            Some(SessionIndexEntry::OAuth { subject_id, .. }) => self
                .oauth
                .restore(&subject_id)
                .await
                .map_err(AuthError::OAuth),
            Some(SessionIndexEntry::Worker { .. }) | None => Err(AuthError::NoSession),
        }
    }

    /// Account and secret for the sync client
    pub fn sync_credentials(&self) -> Result<SyncCredentials> {
        Ok(self.require_session()?.sync_credentials())
    }

    /// Write secrets and index entry. Must run under the session lock.
    /// Returns every entry this one displaced.
    fn persist(&self, session: &CliSession) -> Result<Vec<SessionIndexEntry>> {
        match session {
            CliSession::OAuth {
                subject_id,
                derived_secret,
                ..
            } => {
                self.credentials
                    .store(SESSION_SERVICE, subject_id, derived_secret)?;
            }
            CliSession::Worker(worker) => {
                self.credentials
                    .store(WORKER_SERVICE, &worker.worker_id, &worker.secret)?;
                self.workers.set(&worker.worker_id, worker.profile())?;
            }
        }

        let entry = session.index_entry(Utc::now());
        let key = entry.session_key();
        let mut replaced = Vec::new();

        self.index.update(|entries| {
            replaced = std::mem::take(entries)
                .into_iter()
                .filter(|(existing, _)| *existing != key)
                .map(|(_, previous)| previous)
                .collect();
            entries.insert(key.clone(), entry);
        })?;

        debug!(session = %key, "Session persisted");
        Ok(replaced)
    }

    async fn retire_all(&self, entries: Vec<SessionIndexEntry>) {
        for entry in entries {
            self.retire(entry).await;
        }
    }

    /// Drop what a replaced or cleared session leaves behind
    async fn retire(&self, entry: SessionIndexEntry) {
        if let SessionIndexEntry::OAuth { subject_id, .. } = entry {
            if let Err(e) = self.credentials.delete(SESSION_SERVICE, &subject_id) {
                warn!(subject = %subject_id, error = %e, "Failed to delete passphrase");
            }
            if let Err(e) = self.oauth.revoke(&subject_id).await {
                warn!(subject = %subject_id, error = %e, "Failed to drop OAuth session");
            }
        }
    }
}
