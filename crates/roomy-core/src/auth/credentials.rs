use std::collections::BTreeMap;

use keyring::Entry;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::Result;
use crate::store::RecordStore;

/// Vault file name in the config directory
const VAULT_FILE: &str = ".credentials";

/// Service under which derived passphrases are stored, keyed by subject DID
pub const SESSION_SERVICE: &str = "roomy-cli";

/// Service under which worker secrets are stored, keyed by worker ID
pub const WORKER_SERVICE: &str = "roomy-cli-worker";

/// Whether the platform keychain backend persists secrets on its own.
/// On Linux the backend is the kernel keyutils store.
const KEYCHAIN_SURVIVES_REBOOT: bool = !cfg!(target_os = "linux");

/// File-backed secret storage used when no platform keychain is available.
///
/// Stored as `{service: {account: secret}}` with owner-only permissions.
#[derive(Debug, Clone)]
pub struct CredentialVault {
    store: RecordStore<BTreeMap<String, String>>,
}

impl CredentialVault {
    pub fn new(config: &Config) -> Self {
        Self {
            store: RecordStore::in_config(config, VAULT_FILE),
        }
    }

    pub fn set_password(&self, service: &str, account: &str, secret: &str) -> Result<()> {
        let mut accounts = self.store.get(service).unwrap_or_default();
        accounts.insert(account.to_string(), secret.to_string());
        self.store.set(service, accounts)
    }

    pub fn get_password(&self, service: &str, account: &str) -> Option<String> {
        self.store
            .get(service)
            .and_then(|mut accounts| accounts.remove(account))
    }

    /// Delete one secret. A service left with no accounts is removed entirely.
    pub fn delete_password(&self, service: &str, account: &str) -> Result<bool> {
        let Some(mut accounts) = self.store.get(service) else {
            return Ok(false);
        };

        if accounts.remove(account).is_none() {
            return Ok(false);
        }

        if accounts.is_empty() {
            self.store.del(service)?;
        } else {
            self.store.set(service, accounts)?;
        }
        Ok(true)
    }

    pub fn accounts(&self, service: &str) -> Vec<String> {
        self.store
            .get(service)
            .map(|accounts| accounts.into_keys().collect())
            .unwrap_or_default()
    }
}

/// Secret storage backed by the OS keychain, with `CredentialVault` as the
/// fallback when the keychain is disabled or unusable.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    use_keychain: bool,
    vault: CredentialVault,
}

impl CredentialStore {
    pub fn new(config: &Config) -> Self {
        Self {
            use_keychain: config.use_keychain,
            vault: CredentialVault::new(config),
        }
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    /// Store a secret, in the keychain when possible
    pub fn store(&self, service: &str, account: &str, secret: &str) -> Result<()> {
        if self.use_keychain {
            match Self::keychain_store(service, account, secret) {
                Ok(()) if KEYCHAIN_SURVIVES_REBOOT => {
                    self.vault.delete_password(service, account)?;
                    debug!(service, account, "Secret stored in keychain");
                    return Ok(());
                }
                Ok(()) => {
                    // Kernel keyutils drops secrets on reboot and is per login
                    // session, so the vault keeps the durable copy
                    self.vault.set_password(service, account, secret)?;
                    debug!(service, account, "Secret stored in keychain and credentials file");
                    return Ok(());
                }
                Err(e) => {
                    warn!(service, account, error = %e, "Keychain unavailable, using credentials file");
                }
            }
        }

        self.vault.set_password(service, account, secret)?;
        debug!(service, account, "Secret stored in credentials file");
        Ok(())
    }

    /// Retrieve a secret from the keychain, then the vault
    pub fn get_password(&self, service: &str, account: &str) -> Option<String> {
        if self.use_keychain {
            match Entry::new(service, account).and_then(|entry| entry.get_password()) {
                Ok(secret) => return Some(secret),
                Err(keyring::Error::NoEntry) => {}
                Err(e) => debug!(service, account, error = %e, "Keychain read failed"),
            }
        }
        self.vault.get_password(service, account)
    }

    /// Delete a secret from both backends
    pub fn delete(&self, service: &str, account: &str) -> Result<()> {
        if self.use_keychain {
            match Entry::new(service, account).and_then(|entry| entry.delete_credential()) {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(e) => debug!(service, account, error = %e, "Keychain delete failed"),
            }
        }
        self.vault.delete_password(service, account)?;
        Ok(())
    }

    /// Check if a secret exists for an account
    pub fn has_credentials(&self, service: &str, account: &str) -> bool {
        self.get_password(service, account).is_some()
    }

    /// Write to the keychain and read it back through a fresh entry, so a
    /// backend that silently drops secrets counts as unavailable.
    fn keychain_store(service: &str, account: &str, secret: &str) -> keyring::Result<()> {
        Entry::new(service, account)?.set_password(secret)?;
        let stored = Entry::new(service, account)?.get_password()?;
        if stored == secret {
            Ok(())
        } else {
            Err(keyring::Error::NoEntry)
        }
    }
}
