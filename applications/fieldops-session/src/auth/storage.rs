//! Session persistence: a pluggable key/value backend and the typed token store on top

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use super::role::Role;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Stored role is not recognized: {0}")]
    InvalidRole(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Keys persisted for the authenticated session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKey {
    AccessToken,
    RefreshToken,
    Role,
    Profile,
    IsAuthenticated,
}

impl SessionKey {
    pub const ALL: [SessionKey; 5] = [
        SessionKey::AccessToken,
        SessionKey::RefreshToken,
        SessionKey::Role,
        SessionKey::Profile,
        SessionKey::IsAuthenticated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKey::AccessToken => "access_token",
            SessionKey::RefreshToken => "refresh_token",
            SessionKey::Role => "user_role",
            SessionKey::Profile => "user_data",
            SessionKey::IsAuthenticated => "isAuthenticated",
        }
    }
}

/// A single pending write; `None` removes the key.
pub type StorageWrite = (SessionKey, Option<String>);

/// Durable key/value storage backing the token store
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Apply every write as one unit.
    fn apply(&self, writes: &[StorageWrite]) -> StoreResult<()>;
}

/// Process-local storage, lost on exit
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn apply(&self, writes: &[StorageWrite]) -> StoreResult<()> {
        let mut entries = lock(&self.entries);
        apply_writes(&mut entries, writes);
        Ok(())
    }
}

/// JSON file storage that survives restarts.
///
/// Every batch rewrites the whole file through a temporary sibling and a rename, so a
/// reader never sees half of a batch.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStorage {
    /// Open the storage file, starting empty when it does not exist yet
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();

        let entries = match std::fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn apply(&self, writes: &[StorageWrite]) -> StoreResult<()> {
        let mut entries = lock(&self.entries);
        let mut next = entries.clone();
        apply_writes(&mut next, writes);
        self.persist(&next)?;
        *entries = next;
        Ok(())
    }
}

fn apply_writes(entries: &mut BTreeMap<String, String>, writes: &[StorageWrite]) {
    for (key, value) in writes {
        match value {
            Some(value) => {
                entries.insert(key.as_str().to_string(), value.clone());
            }
            None => {
                entries.remove(key.as_str());
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Display data for the signed-in user. Not used for authorization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, alias = "firstName")]
    pub first_name: Option<String>,
    #[serde(default, alias = "lastName")]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl UserProfile {
    pub fn display_name(&self) -> Option<String> {
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => Some(format!("{} {}", first, last)),
            (Some(first), None) => Some(first.clone()),
            _ => self.username.clone(),
        }
    }
}

/// Everything written by a successful login or validation
#[derive(Debug, Clone, PartialEq)]
pub struct SessionData {
    pub access_token: String,
    pub role: Role,
    pub profile: Option<UserProfile>,
    pub refresh_token: Option<String>,
}

/// Consistent snapshot of an authenticated session
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub role: Role,
    pub profile: Option<UserProfile>,
}

/// Typed access to the persisted session.
///
/// Clones share the backend and the write lock, so multi-key operations stay atomic
/// across every component holding a copy.
#[derive(Clone)]
pub struct TokenStore {
    backend: Arc<dyn Storage>,
    guard: Arc<Mutex<()>>,
}

impl TokenStore {
    pub fn new(backend: Arc<dyn Storage>) -> Self {
        Self {
            backend,
            guard: Arc::new(Mutex::new(())),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    pub fn get(&self, key: SessionKey) -> StoreResult<Option<String>> {
        let _guard = lock(&self.guard);
        self.backend.get(key.as_str())
    }

    pub fn set(&self, key: SessionKey, value: &str) -> StoreResult<()> {
        let _guard = lock(&self.guard);
        self.backend.apply(&[(key, Some(value.to_string()))])
    }

    /// Remove every auth key
    pub fn clear(&self) -> StoreResult<()> {
        let _guard = lock(&self.guard);
        let writes: Vec<StorageWrite> = SessionKey::ALL.iter().map(|k| (*k, None)).collect();
        self.backend.apply(&writes)
    }

    /// Write a complete session in one step. Absent optional values erase stale ones.
    pub fn set_session_data(&self, data: &SessionData) -> StoreResult<()> {
        let profile = data
            .profile
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let writes = [
            (SessionKey::AccessToken, Some(data.access_token.clone())),
            (SessionKey::Role, Some(data.role.as_str().to_string())),
            (SessionKey::Profile, profile),
            (SessionKey::RefreshToken, data.refresh_token.clone()),
            (SessionKey::IsAuthenticated, Some("true".to_string())),
        ];

        let _guard = lock(&self.guard);
        self.backend.apply(&writes)
    }

    /// Replace the tokens of a live session, leaving role and profile alone.
    ///
    /// Returns `false` without writing when the session was cleared in the meantime.
    pub fn rotate_tokens(&self, access_token: &str, refresh_token: Option<&str>) -> StoreResult<bool> {
        let _guard = lock(&self.guard);

        if self.backend.get(SessionKey::RefreshToken.as_str())?.is_none() {
            return Ok(false);
        }

        let mut writes = vec![(SessionKey::AccessToken, Some(access_token.to_string()))];
        if let Some(refresh) = refresh_token {
            writes.push((SessionKey::RefreshToken, Some(refresh.to_string())));
        }

        self.backend.apply(&writes)?;
        Ok(true)
    }

    /// Re-sync role and profile of a live session, keeping its tokens.
    ///
    /// Returns `false` without writing when no access token is stored.
    pub fn update_identity(&self, role: Role, profile: Option<&UserProfile>) -> StoreResult<bool> {
        let profile = profile.map(serde_json::to_string).transpose()?;

        let _guard = lock(&self.guard);

        if self.backend.get(SessionKey::AccessToken.as_str())?.is_none() {
            return Ok(false);
        }

        self.backend.apply(&[
            (SessionKey::Role, Some(role.as_str().to_string())),
            (SessionKey::Profile, profile),
            (SessionKey::IsAuthenticated, Some("true".to_string())),
        ])?;
        Ok(true)
    }

    pub fn access_token(&self) -> StoreResult<Option<String>> {
        self.get(SessionKey::AccessToken)
    }

    pub fn refresh_token(&self) -> StoreResult<Option<String>> {
        self.get(SessionKey::RefreshToken)
    }

    pub fn role(&self) -> StoreResult<Option<Role>> {
        match self.get(SessionKey::Role)? {
            Some(raw) => Role::parse(&raw)
                .map(Some)
                .ok_or(StoreError::InvalidRole(raw)),
            None => Ok(None),
        }
    }

    pub fn profile(&self) -> StoreResult<Option<UserProfile>> {
        match self.get(SessionKey::Profile)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn is_authenticated(&self) -> StoreResult<bool> {
        Ok(self.get(SessionKey::IsAuthenticated)?.as_deref() == Some("true"))
    }

    /// Snapshot of the session, present only when both token and role are stored
    pub fn session(&self) -> StoreResult<Option<Session>> {
        let _guard = lock(&self.guard);

        let access_token = self.backend.get(SessionKey::AccessToken.as_str())?;
        let role = self.backend.get(SessionKey::Role.as_str())?;

        let (access_token, role) = match (access_token, role) {
            (Some(token), Some(role)) => (token, role),
            _ => return Ok(None),
        };

        let role = Role::parse(&role).ok_or(StoreError::InvalidRole(role))?;
        let refresh_token = self.backend.get(SessionKey::RefreshToken.as_str())?;
        let profile = self
            .backend
            .get(SessionKey::Profile.as_str())?
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?;

        Ok(Some(Session {
            access_token,
            refresh_token,
            role,
            profile,
        }))
    }
}
