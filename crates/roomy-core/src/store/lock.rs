use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::file::{self, Loaded};
use crate::config::Config;
use crate::error::{AuthError, Result};

/// Contents of a `lock-<key>.json` marker file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockMarker {
    pub acquired_at: DateTime<Utc>,
    pub pid: u32,
}

impl LockMarker {
    fn now() -> Self {
        Self {
            acquired_at: Utc::now(),
            pid: std::process::id(),
        }
    }

    pub fn age(&self) -> Duration {
        Utc::now() - self.acquired_at
    }

    pub fn is_stale(&self, stale_after: Duration) -> bool {
        is_stale_age(self.age(), stale_after)
    }
}

/// How far in the future a marker may be dated before the clock is
/// assumed to have jumped backwards since it was written
const MAX_FUTURE_SKEW_SECS: i64 = 5;

fn is_stale_age(age: Duration, stale_after: Duration) -> bool {
    age >= stale_after || age < -Duration::seconds(MAX_FUTURE_SKEW_SECS)
}

/// Advisory lock shared between processes through marker files.
///
/// Each CLI invocation is its own process, so the lock lives on the
/// filesystem. A marker older than `stale_after` is assumed to belong to a
/// process that died and is taken over.
#[derive(Debug, Clone)]
pub struct RuntimeLock {
    dir: PathBuf,
    stale_after: Duration,
}

impl RuntimeLock {
    pub fn new(dir: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            dir: dir.into(),
            stale_after,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.dir(), config.lock_stale_after)
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    pub fn marker_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("lock-{}.json", sanitize_key(key)))
    }

    /// Take the lock for `key`. It is released when the guard is dropped.
    pub fn acquire(&self, key: &str) -> Result<LockGuard> {
        let path = self.marker_path(key);

        match file::read_json::<LockMarker>(&path) {
            Loaded::Found(marker) if !marker.is_stale(self.stale_after) => {
                debug!(key, pid = marker.pid, acquired_at = %marker.acquired_at, "Lock held");
                return Err(lock_held(key));
            }
            Loaded::Found(marker) => {
                info!(key, pid = marker.pid, acquired_at = %marker.acquired_at, "Reclaiming stale lock");
                self.reclaim(key, &path, Some(&marker))?;
            }
            Loaded::Unreadable => {
                // Markers are never published half-written, but another
                // writer may be mid-way through something else; judge by mtime
                if !self.file_is_stale(&path) {
                    debug!(key, "Unreadable lock marker is recent, treating as held");
                    return Err(lock_held(key));
                }
                debug!(key, "Replacing stale unreadable lock marker");
                self.reclaim(key, &path, None)?;
            }
            Loaded::Missing => {}
        }

        let marker = LockMarker::now();
        match file::publish_json_private(&path, &marker) {
            Ok(()) => {}
            Err(AuthError::Io(e)) if e.kind() == io::ErrorKind::AlreadyExists => {
                // Another process won the race between our check and publish
                return Err(lock_held(key));
            }
            Err(e) => return Err(e),
        }

        debug!(key, "Lock acquired");
        Ok(LockGuard {
            key: key.to_string(),
            path,
            marker,
        })
    }

    fn file_is_stale(&self, path: &Path) -> bool {
        match fs::metadata(path).and_then(|meta| meta.modified()) {
            Ok(modified) => {
                let age = Utc::now() - DateTime::<Utc>::from(modified);
                is_stale_age(age, self.stale_after)
            }
            // Gone since we read it; publishing will settle who gets it
            Err(_) => true,
        }
    }

    /// Move a stale marker out of the way.
    ///
    /// The marker is renamed aside before it is checked, so two processes
    /// reclaiming the same marker cannot delete each other's fresh one. If
    /// what we moved is no longer the marker we judged stale (`expected`, or
    /// an unreadable file when `None`), it is put back and the lock is held.
    fn reclaim(&self, key: &str, path: &Path, expected: Option<&LockMarker>) -> Result<()> {
        let aside = file::unique_sibling(path, "stale");
        match fs::rename(path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let still_stale = match (file::read_json::<LockMarker>(&aside), expected) {
            (Loaded::Found(found), Some(expected)) => &found == expected,
            (Loaded::Unreadable, None) => true,
            _ => false,
        };

        if !still_stale {
            warn!(key, "Lock marker changed while reclaiming, restoring it");
            match fs::hard_link(&aside, path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => debug!(key, error = %e, "Failed to restore lock marker"),
            }
        }

        if let Err(e) = file::remove_if_exists(&aside) {
            debug!(key, error = %e, "Failed to remove reclaimed lock marker");
        }

        if still_stale {
            Ok(())
        } else {
            Err(lock_held(key))
        }
    }

    /// Run `f` while holding the lock for `key`
    pub fn with_lock<T, E, F>(&self, key: &str, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> std::result::Result<T, E>,
        E: From<AuthError>,
    {
        let _guard = self.acquire(key)?;
        f()
    }

    /// Async form of `with_lock`. The marker is also removed if the returned
    /// future is dropped before it completes.
    pub async fn with_lock_async<T, E, F, Fut>(&self, key: &str, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<AuthError>,
    {
        let _guard = self.acquire(key)?;
        f().await
    }
}

/// Held lock. Dropping it deletes the marker file.
#[derive(Debug)]
pub struct LockGuard {
    key: String,
    path: PathBuf,
    marker: LockMarker,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn marker_path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // After our marker went stale another process may have replaced it
        if let Loaded::Found(current) = file::read_json::<LockMarker>(&self.path) {
            if current != self.marker {
                warn!(key = %self.key, pid = current.pid, "Lock was taken over, leaving marker in place");
                return;
            }
        }

        match file::remove_if_exists(&self.path) {
            Ok(_) => debug!(key = %self.key, "Lock released"),
            Err(e) => debug!(key = %self.key, error = %e, "Failed to remove lock marker"),
        }
    }
}

fn lock_held(key: &str) -> AuthError {
    AuthError::LockHeld {
        key: key.to_string(),
    }
}

/// Keep keys usable as a file name component
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
