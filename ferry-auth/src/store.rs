use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

/// An error returned when the credential file cannot be read.
#[derive(Debug, thiserror::Error)]
#[error("could not read auth file {}", .path.display())]
pub struct AuthFileError {
    path: PathBuf,
    #[source]
    source: io::Error,
}

impl AuthFileError {
    /// The path of the credential file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// An immutable snapshot of all known credentials.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    secrets: HashMap<String, String>,
}

impl Credentials {
    /// Parses the flat credential format.
    ///
    /// Every line holds one `username: secret` pair. Blank lines and lines starting with `#` are
    /// ignored, as are lines without a separator.
    pub fn parse(content: &str) -> Self {
        let mut secrets = HashMap::new();

        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match line.split_once(':') {
                Some((username, secret)) if !username.trim().is_empty() => {
                    secrets.insert(username.trim().to_owned(), secret.trim().to_owned());
                }
                _ => ferry_log::warn!(line = index + 1, "skipping malformed auth file entry"),
            }
        }

        Self { secrets }
    }

    /// Returns the shared secret of the given user.
    pub fn get(&self, username: &str) -> Option<&str> {
        self.secrets.get(username).map(String::as_str)
    }

    /// The number of known users.
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    /// Returns `true` if no users are known.
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

/// Identifies a version of the credential file on disk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

impl FileStamp {
    fn of(metadata: &fs::Metadata) -> Self {
        Self {
            modified: metadata.modified().ok(),
            len: metadata.len(),
        }
    }
}

/// Username to shared secret mapping backed by a flat file.
///
/// Readers always see a complete snapshot of the file. A reload swaps the snapshot atomically,
/// so a verification that races a reload uses either the old or the new credentials.
#[derive(Debug)]
pub struct AuthStore {
    path: PathBuf,
    credentials: ArcSwap<Credentials>,
    stamp: Mutex<Option<FileStamp>>,
}

impl AuthStore {
    /// Loads the credential file at the given path.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AuthFileError> {
        let store = Self {
            path: path.into(),
            credentials: ArcSwap::default(),
            stamp: Mutex::new(None),
        };

        store.reload_if_changed()?;
        Ok(store)
    }

    /// Creates a store from in-memory credentials that is never reloaded.
    pub fn from_credentials(credentials: Credentials) -> Self {
        Self {
            path: PathBuf::new(),
            credentials: ArcSwap::from_pointee(credentials),
            stamp: Mutex::new(None),
        }
    }

    /// The path of the credential file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current snapshot of credentials.
    pub fn credentials(&self) -> Arc<Credentials> {
        self.credentials.load_full()
    }

    /// Reloads the file if its modification time or size changed since the last load.
    ///
    /// Returns `true` if the credentials were reloaded. On error, the previous credentials are
    /// kept.
    pub fn reload_if_changed(&self) -> Result<bool, AuthFileError> {
        if self.path.as_os_str().is_empty() {
            return Ok(false);
        }

        let map_err = |source| AuthFileError {
            path: self.path.clone(),
            source,
        };

        let mut stamp = self.stamp.lock();
        let current = FileStamp::of(&fs::metadata(&self.path).map_err(map_err)?);
        if *stamp == Some(current) {
            return Ok(false);
        }

        let content = fs::read_to_string(&self.path).map_err(map_err)?;
        let credentials = Credentials::parse(&content);
        ferry_log::info!(
            users = credentials.len(),
            "loaded credentials from {}",
            self.path.display()
        );

        self.credentials.store(Arc::new(credentials));
        *stamp = Some(current);
        Ok(true)
    }

    /// Polls the credential file for changes on the given interval.
    ///
    /// This future never completes. Spawn it next to the consumer of this store and abort it when
    /// the consumer shuts down.
    pub async fn watch(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(error) = self.reload_if_changed() {
                ferry_log::warn!(
                    error = &error as &dyn std::error::Error,
                    "failed to reload credentials"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_credentials() {
        let credentials = Credentials::parse(
            "# collectd users\n\
             alice: s3cret\n\
             \n\
             bob:hunter2:with:colons\n\
             broken line\n",
        );

        assert_eq!(credentials.len(), 2);
        assert_eq!(credentials.get("alice"), Some("s3cret"));
        assert_eq!(credentials.get("bob"), Some("hunter2:with:colons"));
        assert_eq!(credentials.get("broken line"), None);
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let error = AuthStore::open(dir.path().join("passwd")).unwrap_err();
        assert!(error.path().ends_with("passwd"));
    }

    #[test]
    fn test_reload_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passwd");
        fs::write(&path, "alice: one\n").unwrap();

        let store = AuthStore::open(&path).unwrap();
        assert!(!store.reload_if_changed().unwrap());
        let before = store.credentials();

        fs::write(&path, "alice: one\nbob: two\n").unwrap();
        assert!(store.reload_if_changed().unwrap());

        assert_eq!(before.get("bob"), None);
        assert_eq!(store.credentials().get("bob"), Some("two"));
    }

    #[test]
    fn test_failed_reload_keeps_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passwd");
        fs::write(&path, "alice: one\n").unwrap();

        let store = AuthStore::open(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert!(store.reload_if_changed().is_err());
        assert_eq!(store.credentials().get("alice"), Some("one"));
    }
}
