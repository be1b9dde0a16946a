use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::error::CaptureError;
use crate::hands::ExecutorError;

/// One browser cookie, in CDP field naming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    #[serde(default)]
    pub expires: Option<f64>,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub same_site: Option<String>,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

/// `localStorage` contents of one origin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OriginStorage {
    pub origin: String,
    pub entries: Vec<(String, String)>,
}

/// Authentication state captured from a browser after login.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub cookies: Vec<StoredCookie>,
    #[serde(default)]
    pub origins: Vec<OriginStorage>,
    /// Page the browser was on when the login completed.
    #[serde(default)]
    pub home_url: Option<String>,
    #[serde(default)]
    pub saved_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl SessionState {
    pub fn is_valid(&self) -> bool {
        self.cookies.iter().any(|c| !c.name.is_empty() && !c.domain.is_empty())
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice::<SessionState>(bytes).ok().filter(SessionState::is_valid)
    }
}

#[derive(Error, Debug)]
pub enum SessionStoreError {
    #[error("invalid session key '{0}'")]
    InvalidKey(String),
    #[error("session storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Minimal key-value storage for serialized sessions.
pub trait SessionStore: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, SessionStoreError>;
    /// Replace the value for `key` without ever exposing a partial write.
    fn write_atomic(&self, key: &str, bytes: &[u8]) -> Result<(), SessionStoreError>;
}

/// Accepts plain file names only: no separators, no parent references.
pub fn validate_session_key(key: &str) -> Result<(), SessionStoreError> {
    let ok = !key.is_empty()
        && key.len() <= 128
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok { Ok(()) } else { Err(SessionStoreError::InvalidKey(key.to_string())) }
}

/// Sessions as files in one directory.
pub struct FileSessionStore {
    root: PathBuf,
}

impl FileSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, SessionStoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, SessionStoreError> {
        validate_session_key(key)?;
        Ok(self.root.join(key))
    }
}

impl SessionStore for FileSessionStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, SessionStoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_atomic(&self, key: &str, bytes: &[u8]) -> Result<(), SessionStoreError> {
        let path = self.path_for(key)?;
        // Same directory as the target so the rename never crosses filesystems.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| SessionStoreError::Io(e.error))?;
        Ok(())
    }
}

/// Opens an interactive browser for a human to log in.
#[async_trait]
pub trait LoginDriver: Send + Sync {
    async fn open(&self, login_url: &str) -> Result<Box<dyn LoginWindow>, ExecutorError>;
}

#[async_trait]
pub trait LoginWindow: Send {
    /// `Some(state)` once the login-success signal is observed.
    async fn poll(&mut self) -> Result<Option<SessionState>, ExecutorError>;
    async fn close(&mut self);
}

/// Stored once after an interactive login under the caller's key, then reused
/// read-only. Only the login write path is serialized, per key.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    login: Arc<dyn LoginDriver>,
    login_window: Duration,
    poll_interval: Duration,
    write_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        login: Arc<dyn LoginDriver>,
        login_window: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            login,
            login_window,
            poll_interval,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Load the stored session for `session_path`, or run the one-time
    /// interactive login at `login_url` and persist its result.
    pub async fn acquire_session(
        &self,
        session_path: &str,
        login_url: Option<&str>,
    ) -> Result<SessionState, CaptureError> {
        if let Some(state) = self.load(session_path)? {
            info!(session_path, "reusing stored session");
            return Ok(state);
        }

        let Some(login_url) = login_url.map(str::trim).filter(|u| !u.is_empty()) else {
            return Err(CaptureError::MissingSession { session_path: session_path.to_string() });
        };

        let lock = self.write_lock(session_path);
        let result = self.login_and_store(session_path, login_url, &lock).await;
        self.release_write_lock(session_path, &lock);
        result
    }

    async fn login_and_store(
        &self,
        session_path: &str,
        login_url: &str,
        lock: &tokio::sync::Mutex<()>,
    ) -> Result<SessionState, CaptureError> {
        let _guard = lock.lock().await;

        // Another task may have finished the login while we waited.
        if let Some(state) = self.load(session_path)? {
            info!(session_path, "session created by a concurrent login, reusing it");
            return Ok(state);
        }

        let state = self.interactive_login(login_url).await?;
        let bytes = serde_json::to_vec_pretty(&state)
            .map_err(|e| CaptureError::Internal(format!("failed to serialize session: {e}")))?;
        self.store
            .write_atomic(session_path, &bytes)
            .map_err(|e| CaptureError::Internal(e.to_string()))?;
        info!(session_path, cookies = state.cookies.len(), "session saved");
        Ok(state)
    }

    fn load(&self, session_path: &str) -> Result<Option<SessionState>, CaptureError> {
        let bytes = match self.store.read(session_path) {
            Ok(bytes) => bytes,
            Err(SessionStoreError::InvalidKey(key)) => {
                return Err(CaptureError::Validation(format!("invalid session_path '{key}'")));
            }
            Err(e) => return Err(CaptureError::Internal(e.to_string())),
        };
        Ok(bytes.and_then(|b| {
            let state = SessionState::from_bytes(&b);
            if state.is_none() {
                warn!(session_path, "stored session is not structurally valid, ignoring it");
            }
            state
        }))
    }

    fn write_lock(&self, session_path: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.write_locks
            .lock()
            .entry(session_path.to_string())
            .or_default()
            .clone()
    }

    /// Drop the key's lock once nobody else holds or waits on it.
    fn release_write_lock(&self, session_path: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.write_locks.lock();
        let ours = locks.get(session_path).is_some_and(|l| Arc::ptr_eq(l, lock));
        // The table and `lock` are the only owners left.
        if ours && Arc::strong_count(lock) == 2 {
            locks.remove(session_path);
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.write_locks.lock().len()
    }

    async fn interactive_login(&self, login_url: &str) -> Result<SessionState, CaptureError> {
        info!(
            login_url,
            window_secs = self.login_window.as_secs(),
            "no stored session, waiting for manual login"
        );
        let mut window = self
            .login
            .open(login_url)
            .await
            .map_err(|e| CaptureError::Internal(format!("could not open login browser: {e}")))?;

        let deadline = Instant::now() + self.login_window;
        let outcome = loop {
            match window.poll().await {
                Ok(Some(state)) if state.is_valid() => break Ok(state),
                Ok(_) => {}
                Err(e) => debug!("login poll failed: {}", e),
            }
            let now = Instant::now();
            if now >= deadline {
                break Err(CaptureError::LoginTimeout { seconds: self.login_window.as_secs() });
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        };
        window.close().await;
        outcome.map(|mut state| {
            state.saved_at = Some(chrono::Utc::now());
            state
        })
    }
}
