use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use rand::{distributions::Alphanumeric, Rng};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::error::Result;

/// Result of reading a JSON document from disk
pub(crate) enum Loaded<T> {
    Found(T),
    Missing,
    /// The file exists but could not be read or decoded
    Unreadable,
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Loaded<T> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Loaded::Missing,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Failed to read store file");
            return Loaded::Unreadable;
        }
    };

    match serde_json::from_str(&contents) {
        Ok(value) => Loaded::Found(value),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Failed to parse store file");
            Loaded::Unreadable
        }
    }
}

/// Create the directory (owner-only on unix) if it does not exist yet
pub(crate) fn ensure_dir(dir: &Path) -> io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }

    Ok(())
}

fn private_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.write(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    options
}

/// Sibling of `path` no other writer will pick, for staging and setting files aside
pub(crate) fn unique_sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    path.with_file_name(format!(".{}.{}.{}.{}", name, std::process::id(), token, suffix))
}

/// Replace `path` with the pretty-printed JSON of `value`.
///
/// The document is written to a sibling temp file and renamed into place, so
/// readers see either the old or the new contents, never a partial write.
pub(crate) fn write_json_private<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    let contents = serde_json::to_string_pretty(value)?;
    let tmp = unique_sibling(path, "tmp");

    let written = (|| -> io::Result<()> {
        let mut file = private_options().create(true).truncate(true).open(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;

        // mode() only applies on creation; a leftover temp file keeps its old bits
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }

        fs::rename(&tmp, path)
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }

    Ok(())
}

/// Publish `value` at `path` only if nothing is there yet.
///
/// The document is fully written to a private sibling first and then hard
/// linked into place, so `path` never exists with partial contents. Fails with
/// `AlreadyExists` when `path` is taken.
pub(crate) fn publish_json_private<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    let contents = serde_json::to_string_pretty(value)?;
    let staged = unique_sibling(path, "tmp");

    let published = (|| -> io::Result<()> {
        let mut file = private_options().create_new(true).open(&staged)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        fs::hard_link(&staged, path)
    })();

    let _ = fs::remove_file(&staged);
    published?;
    Ok(())
}

/// Remove a file, returning whether it existed
pub(crate) fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_creates_missing_dir() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("doc.json");

        write_json_private(&path, &vec![1, 2, 3]).unwrap();

        let loaded: Vec<i32> = match read_json(&path) {
            Loaded::Found(v) => v,
            _ => panic!("expected document"),
        };
        assert_eq!(loaded, vec![1, 2, 3]);
    }

    #[test]
    fn test_write_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");

        write_json_private(&path, "hello").unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["doc.json".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_write_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secret.json");
        write_json_private(&path, "s3cret").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_read_distinguishes_missing_and_unreadable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");

        assert!(matches!(read_json::<Vec<i32>>(&path), Loaded::Missing));

        fs::write(&path, b"{not json").unwrap();
        assert!(matches!(read_json::<Vec<i32>>(&path), Loaded::Unreadable));
    }

    #[test]
    fn test_publish_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lock.json");

        publish_json_private(&path, "first").unwrap();
        let err = publish_json_private(&path, "second").unwrap_err();
        match err {
            crate::AuthError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::AlreadyExists),
            other => panic!("unexpected error: {other}"),
        }

        // The loser neither overwrote the winner nor left its staging file behind
        assert_eq!(fs::read_to_string(&path).unwrap(), "\"first\"");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_unique_siblings_differ() {
        let path = Path::new("/tmp/lock-job.json");
        let a = unique_sibling(path, "stale");
        let b = unique_sibling(path, "stale");
        assert_ne!(a, b);
        assert_eq!(a.parent(), path.parent());
        assert!(a.to_string_lossy().ends_with(".stale"));
    }

    #[test]
    fn test_remove_if_exists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.json");

        assert!(!remove_if_exists(&path).unwrap());
        fs::write(&path, b"{}").unwrap();
        assert!(remove_if_exists(&path).unwrap());
        assert!(!path.exists());
    }
}
