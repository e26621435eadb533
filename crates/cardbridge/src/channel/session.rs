use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::BridgeSection;
use crate::error::Error;

/// Per-conversation tracking state.
struct ContextState {
    session_handle: Option<String>,
    workspace: Option<PathBuf>,
    last_active: Instant,
    created_at: DateTime<Utc>,
}

/// Point-in-time copy of a conversation's context.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextInfo {
    pub session_handle: Option<String>,
    pub workspace: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

impl From<&ContextState> for ContextInfo {
    fn from(state: &ContextState) -> Self {
        Self {
            session_handle: state.session_handle.clone(),
            workspace: state.workspace.clone(),
            created_at: state.created_at,
        }
    }
}

/// Maps conversation keys to their workspace and resumable agent session.
///
/// Contexts are created lazily on first access and refreshed on every
/// access. A background sweep evicts contexts idle longer than the TTL.
/// Uses `std::sync::RwLock` (never held across `.await`).
pub struct SessionManager {
    map: RwLock<HashMap<String, ContextState>>,
    default_workspace: Option<PathBuf>,
    ttl: Duration,
    sweep_interval: Duration,
    sweep: Mutex<Option<CancellationToken>>,
}

impl SessionManager {
    pub fn new(default_workspace: Option<PathBuf>, ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            default_workspace,
            ttl,
            sweep_interval,
            sweep: Mutex::new(None),
        }
    }

    pub fn from_config(config: &BridgeSection) -> Self {
        Self::new(
            config.default_workspace.clone(),
            config.session_ttl(),
            config.sweep_interval(),
        )
    }

    /// Get the context for `key`, creating it with the default workspace.
    pub fn get_or_create(&self, key: &str) -> Result<ContextInfo, Error> {
        self.with_context(key, |state| ContextInfo::from(&*state))
    }

    /// Record the backend session handle reported for `key`.
    pub fn set_session_handle(&self, key: &str, handle: impl Into<String>) -> Result<(), Error> {
        let handle = handle.into();
        self.with_context(key, |state| state.session_handle = Some(handle))
    }

    /// Point `key` at a new workspace.
    ///
    /// A resumed session is bound to the directory it started in, so moving
    /// to a different path drops the handle. Returns whether it was dropped.
    pub fn set_workspace(&self, key: &str, path: impl Into<PathBuf>) -> Result<bool, Error> {
        let path = path.into();
        self.with_context(key, |state| {
            let changed = state.workspace.as_deref() != Some(path.as_path());
            let cleared = changed && state.session_handle.take().is_some();
            state.workspace = Some(path);
            cleared
        })
    }

    /// Forget the backend session but keep the workspace.
    pub fn reset_session(&self, key: &str) -> Result<(), Error> {
        self.with_context(key, |state| state.session_handle = None)
    }

    pub fn has_workspace(&self, key: &str) -> Result<bool, Error> {
        self.with_context(key, |state| state.workspace.is_some())
    }

    pub fn workspace(&self, key: &str) -> Result<Option<PathBuf>, Error> {
        self.with_context(key, |state| state.workspace.clone())
    }

    pub fn session_handle(&self, key: &str) -> Result<Option<String>, Error> {
        self.with_context(key, |state| state.session_handle.clone())
    }

    /// Store `handle` only if `key` still points at `workspace`.
    ///
    /// Guards against a `/cd` that landed while the task was running: the
    /// handle belongs to the old directory and must not be resumed in the new one.
    pub fn set_session_handle_if_workspace(
        &self,
        key: &str,
        workspace: &Path,
        handle: &str,
    ) -> Result<bool, Error> {
        self.with_context(key, |state| {
            if state.workspace.as_deref() != Some(workspace) {
                return false;
            }
            if state.session_handle.as_deref() != Some(handle) {
                state.session_handle = Some(handle.to_string());
            }
            true
        })
    }

    /// Remove every context idle for at least the TTL. Returns the evicted keys.
    pub fn evict_expired(&self) -> Vec<String> {
        let mut map = match self.map.write() {
            Ok(m) => m,
            Err(_) => return Vec::new(),
        };
        let now = Instant::now();
        let expired: Vec<String> = map
            .iter()
            .filter(|(_, state)| now.duration_since(state.last_active) >= self.ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            map.remove(key);
        }
        expired
    }

    /// Spawn the periodic eviction sweep. No-op if one is already running.
    pub fn start_sweep(self: &Arc<Self>) {
        let cancel = {
            let mut sweep = match self.sweep.lock() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            if sweep.is_some() {
                return;
            }
            let token = CancellationToken::new();
            *sweep = Some(token.clone());
            token
        };

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.sweep_loop(cancel).await;
        });
    }

    async fn sweep_loop(&self, cancel: CancellationToken) {
        let start = Instant::now() + self.sweep_interval;
        let mut interval = tokio::time::interval_at(start, self.sweep_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = cancel.cancelled() => {
                    tracing::debug!("session sweep shutting down");
                    return;
                }
            }

            let evicted = self.evict_expired();
            if !evicted.is_empty() {
                tracing::info!(count = evicted.len(), "evicted idle contexts");
            }
        }
    }

    /// Stop the sweep. Safe to call more than once.
    pub fn destroy(&self) {
        let token = match self.sweep.lock() {
            Ok(mut s) => s.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(token) = token {
            token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.map.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map
            .read()
            .map(|m| m.contains_key(key))
            .unwrap_or(false)
    }

    fn with_context<R>(&self, key: &str, f: impl FnOnce(&mut ContextState) -> R) -> Result<R, Error> {
        let mut map = self.write()?;
        let state = map.entry(key.to_string()).or_insert_with(|| ContextState {
            session_handle: None,
            workspace: self.default_workspace.clone(),
            last_active: Instant::now(),
            created_at: Utc::now(),
        });
        state.last_active = Instant::now();
        Ok(f(state))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, ContextState>>, Error> {
        self.map
            .write()
            .map_err(|e| Error::Channel(format!("lock poisoned: {e}")))
    }
}
