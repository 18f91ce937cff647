//! Signaling identities and the small amount of state persisted between runs:
//! the identity the user logged in with and a bounded list of recent contacts.
//!
//! Persistence goes through the [`Storage`] trait, a plain key -> string map.
//! Storage failures are never fatal: they are logged and the operation becomes
//! a no-op.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::error::ValidationError;

const IDENTITY_KEY: &str = "peer_call.identity";
const CONTACTS_KEY: &str = "peer_call.recent_contacts";

/// An email-shaped identifier naming a signaling endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// trims `raw` and checks that it looks like `local@domain.tld`
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let candidate = raw.trim();
        if candidate.is_empty() {
            return Err(ValidationError::Empty);
        }
        if !is_email_shaped(candidate) {
            return Err(ValidationError::Malformed);
        }
        Ok(Self(candidate.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// no whitespace, exactly one '@', a non-empty local part and a domain with an
// inner '.'
fn is_email_shaped(s: &str) -> bool {
    if s.chars().any(char::is_whitespace) {
        return false;
    }
    let (local, domain) = match s.split_once('@') {
        Some(parts) => parts,
        None => return false,
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    domain
        .char_indices()
        .any(|(i, c)| c == '.' && i > 0 && i + 1 < domain.len())
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identity {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Identity::parse(s)
    }
}

impl TryFrom<String> for Identity {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Identity::parse(&value)
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> Self {
        id.0
    }
}

/// Most-recent-first list of distinct identities, bounded by `limit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactHistory {
    entries: Vec<Identity>,
    limit: usize,
}

impl ContactHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Vec::new(),
            limit,
        }
    }

    /// rebuilds a history from a possibly untrusted list, keeping the first
    /// occurrence of each entry
    pub fn from_entries(entries: impl IntoIterator<Item = Identity>, limit: usize) -> Self {
        let mut history = Self::new(limit);
        for id in entries {
            if history.entries.len() == limit {
                break;
            }
            if !history.entries.contains(&id) {
                history.entries.push(id);
            }
        }
        history
    }

    /// moves `id` to the front, inserting it if needed
    pub fn record(&mut self, id: Identity) {
        self.entries.retain(|existing| existing != &id);
        self.entries.insert(0, id);
        self.entries.truncate(self.limit);
    }

    pub fn entries(&self) -> &[Identity] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<Identity> {
        self.entries
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt storage: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// key -> string persistence
pub trait Storage: Send {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&mut self, key: &str) -> Result<(), StorageError>;
}

/// In-memory storage. Clones share the same map, which lets a caller keep a
/// handle for inspection after giving one to the client.
#[derive(Clone)]
pub struct MemoryStorage {
    values: Arc<Mutex<HashMap<String, String>>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self {
            values: Arc::new(Mutex::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// simulates the backing store going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("memory storage disabled".into()))
        }
    }

    fn values(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check()?;
        Ok(self.values().get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check()?;
        self.values().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        self.check()?;
        self.values().remove(key);
        Ok(())
    }
}

/// Storage backed by a single JSON object on disk. A missing file reads as
/// empty.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn read_all(&self) -> Result<HashMap<String, String>, StorageError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(HashMap::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(StorageError::Unavailable(format!(
                "{}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn write_all(&self, values: &HashMap<String, String>) -> Result<(), StorageError> {
        let contents = serde_json::to_string_pretty(values)?;
        std::fs::write(&self.path, contents)
            .map_err(|e| StorageError::Unavailable(format!("{}: {}", self.path.display(), e)))
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.read_all()?.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut values = self.read_all()?;
        values.insert(key.to_owned(), value.to_owned());
        self.write_all(&values)
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        let mut values = self.read_all()?;
        if values.remove(key).is_some() {
            self.write_all(&values)?;
        }
        Ok(())
    }
}

/// Persists the logged-in identity and the recent contacts.
pub struct IdentityStore {
    storage: Box<dyn Storage>,
    history_limit: usize,
}

impl IdentityStore {
    pub fn new(storage: Box<dyn Storage>, history_limit: usize) -> Self {
        Self {
            storage,
            history_limit,
        }
    }

    /// the saved identity, if there is one and it still validates
    pub fn load(&self) -> Option<Identity> {
        match self.storage.get(IDENTITY_KEY) {
            Ok(Some(raw)) => match Identity::parse(&raw) {
                Ok(id) => Some(id),
                Err(e) => {
                    log::warn!("ignoring persisted identity {:?}: {}", raw, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                log::warn!("failed to load identity: {}", e);
                None
            }
        }
    }

    pub fn save(&mut self, id: &Identity) {
        if let Err(e) = self.storage.set(IDENTITY_KEY, id.as_str()) {
            log::warn!("failed to save identity {}: {}", id, e);
        }
    }

    pub fn clear(&mut self) {
        if let Err(e) = self.storage.remove(IDENTITY_KEY) {
            log::warn!("failed to clear identity: {}", e);
        }
    }

    /// moves `id` to the front of the recent contacts and returns the new list
    pub fn record_contact(&mut self, id: &Identity) -> Vec<Identity> {
        let mut history = self.history();
        history.record(id.clone());
        match serde_json::to_string(history.entries()) {
            Ok(json) => {
                if let Err(e) = self.storage.set(CONTACTS_KEY, &json) {
                    log::warn!("failed to save recent contacts: {}", e);
                }
            }
            Err(e) => log::warn!("failed to encode recent contacts: {}", e),
        }
        history.into_entries()
    }

    pub fn list_contacts(&self) -> Vec<Identity> {
        self.history().into_entries()
    }

    fn history(&self) -> ContactHistory {
        let raw = match self.storage.get(CONTACTS_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return ContactHistory::new(self.history_limit),
            Err(e) => {
                log::warn!("failed to load recent contacts: {}", e);
                return ContactHistory::new(self.history_limit);
            }
        };
        // entries that no longer validate are dropped rather than failing the whole list
        let entries: Vec<String> = match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("discarding corrupt recent contacts: {}", e);
                Vec::new()
            }
        };
        ContactHistory::from_entries(
            entries.iter().filter_map(|s| Identity::parse(s).ok()),
            self.history_limit,
        )
    }
}
