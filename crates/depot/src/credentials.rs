use futures::channel::mpsc;
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use steward_core::{Result, StewardError};

/// File name of the token inside the cache directory.
pub const TOKEN_FILE: &str = ".hf_token";

/// Durable single-slot store for the hub access token.
///
/// Readers are served from memory; writers persist through a temporary
/// sibling file and a rename, then swap the in-memory value, so a reader
/// sees either the old token or the new one.
pub struct CredentialStore {
    path: PathBuf,
    value: RwLock<Option<String>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Option<String>>>>,
}

impl CredentialStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let value = read_token(&path)?;
        Ok(Self {
            path,
            value: RwLock::new(value),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn in_dir(dir: &Path) -> Result<Self> {
        Self::open(dir.join(TOKEN_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> Option<String> {
        self.value
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_set(&self) -> bool {
        self.get().is_some()
    }

    /// Store a new token. `None` or a blank string clears the slot.
    pub fn set(&self, token: Option<String>) -> Result<()> {
        let token = token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        let mut slot = self
            .value
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *slot == token {
            return Ok(());
        }

        match &token {
            Some(value) => write_atomically(&self.path, value)?,
            None => match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StewardError::Storage(e.to_string())),
            },
        }
        *slot = token.clone();
        drop(slot);

        info!(
            "Access token {}",
            if token.is_some() { "updated" } else { "cleared" }
        );
        self.notify(token);
        Ok(())
    }

    /// Receive every subsequent change. Dropped receivers are pruned on the
    /// next write.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Option<String>> {
        let (tx, rx) = mpsc::unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    fn notify(&self, token: Option<String>) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|tx| tx.unbounded_send(token.clone()).is_ok());
    }
}

fn read_token(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => {
            let trimmed = content.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StewardError::Storage(format!(
            "cannot read {}: {}",
            path.display(),
            e
        ))),
    }
}

fn write_atomically(path: &Path, value: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, value)?;
    restrict_permissions(&tmp);
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(StewardError::Storage(format!(
            "cannot persist token to {}: {}",
            path.display(),
            e
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        warn!("Could not restrict permissions on {}: {}", path.display(), e);
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn round_trip_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::in_dir(tmp.path()).unwrap();
        assert_eq!(store.get(), None);

        store.set(Some("hf_secret".into())).unwrap();
        assert_eq!(store.get().as_deref(), Some("hf_secret"));

        let reopened = CredentialStore::in_dir(tmp.path()).unwrap();
        assert_eq!(reopened.get().as_deref(), Some("hf_secret"));

        reopened.set(None).unwrap();
        assert_eq!(reopened.get(), None);
        assert!(!tmp.path().join(TOKEN_FILE).exists());

        let again = CredentialStore::in_dir(tmp.path()).unwrap();
        assert_eq!(again.get(), None);
    }

    #[test]
    fn blank_tokens_clear_the_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::in_dir(tmp.path()).unwrap();
        store.set(Some("  padded \n".into())).unwrap();
        assert_eq!(store.get().as_deref(), Some("padded"));
        store.set(Some("   ".into())).unwrap();
        assert!(!store.is_set());
    }

    #[async_std::test]
    async fn subscribers_see_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::in_dir(tmp.path()).unwrap();
        let mut changes = store.subscribe();

        store.set(Some("first".into())).unwrap();
        store.set(Some("first".into())).unwrap();
        store.set(None).unwrap();

        assert_eq!(changes.next().await, Some(Some("first".to_string())));
        assert_eq!(changes.next().await, Some(None));
    }
}
