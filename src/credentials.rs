//! Credential storage
//!
//! Holds the bearer token used for every backend call except login, persists
//! it to disk when a path is configured, and broadcasts authentication
//! changes to whoever subscribed.

use log::{debug, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Failed to read credential file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("Failed to write credential file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    Changed { authenticated: bool },
}

pub struct CredentialStore {
    token: RwLock<Option<String>>,
    path: Option<PathBuf>,
    events: broadcast::Sender<AuthEvent>,
}

impl CredentialStore {
    /// Store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::build(None, None)
    }

    /// Store backed by a file. An existing token in the file is loaded.
    pub fn with_file(path: impl Into<PathBuf>) -> Result<Self, CredentialError> {
        let path = path.into();
        let token = match fs::read_to_string(&path) {
            Ok(contents) => {
                let trimmed = contents.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(source) => return Err(CredentialError::Read { path, source }),
        };
        debug!(
            "Loaded credential store from {} (token present: {})",
            path.display(),
            token.is_some()
        );
        Ok(Self::build(token, Some(path)))
    }

    fn build(token: Option<String>, path: Option<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            token: RwLock::new(token),
            path,
            events,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.token().is_some()
    }

    /// Replaces the token. It is usable right away even if writing the file fails.
    pub fn set_token(&self, token: impl Into<String>) -> Result<(), CredentialError> {
        let token = token.into();
        *self
            .token
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(token.clone());
        self.notify(true);

        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| CredentialError::Write {
                path: path.clone(),
                source,
            })?;
        }
        fs::write(path, &token).map_err(|source| CredentialError::Write {
            path: path.clone(),
            source,
        })
    }

    /// Removes the stored token. Returns false when there was nothing to clear.
    pub fn clear(&self) -> bool {
        let removed = self
            .token
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .is_some();
        if removed {
            self.remove_file();
            self.notify(false);
        }
        removed
    }

    /// Clears the token only if it is still the one a failed request carried,
    /// so a fresh login is not thrown away by a late 401 for the old token.
    pub fn clear_if_current(&self, attached: &str) -> bool {
        let mut guard = self
            .token
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.as_deref() != Some(attached) {
            return false;
        }
        *guard = None;
        drop(guard);
        self.remove_file();
        self.notify(false);
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    fn remove_file(&self) {
        if let Some(path) = &self.path {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove credential file {}: {}", path.display(), e);
                }
            }
        }
    }

    fn notify(&self, authenticated: bool) {
        // No subscribers is fine
        let _ = self.events.send(AuthEvent::Changed { authenticated });
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("authenticated", &self.is_authenticated())
            .field("path", &self.path)
            .finish()
    }
}
