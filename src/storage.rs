//! Pluggable session persistence backends
//!
//! `SessionStorage` is the seam: in-memory for tests and ephemeral agents,
//! file-per-session JSON for local persistence. Checkpoint support is
//! optional; backends that do not implement it return
//! `ContextError::CheckpointsUnsupported` from the default methods.

use crate::error::{ContextError, Result};
use crate::session::{SerializedSession, SessionCheckpoint};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Persist a session snapshot, replacing any previous one for its id
    async fn save(&self, session: &SerializedSession) -> Result<()>;

    /// Load a session by id, `None` if absent
    async fn load(&self, session_id: &str) -> Result<Option<SerializedSession>>;

    /// Remove a session and any checkpoints attached to it
    async fn delete(&self, session_id: &str) -> Result<()>;

    /// Ids of all stored sessions
    async fn list(&self) -> Result<Vec<String>>;

    async fn exists(&self, session_id: &str) -> Result<bool> {
        Ok(self.load(session_id).await?.is_some())
    }

    async fn save_checkpoint(&self, _checkpoint: &SessionCheckpoint) -> Result<()> {
        Err(ContextError::CheckpointsUnsupported)
    }

    /// Checkpoints for a session created after `since` (all when `None`),
    /// oldest first
    async fn load_checkpoints(
        &self,
        _session_id: &str,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SessionCheckpoint>> {
        Err(ContextError::CheckpointsUnsupported)
    }
}

/// Non-persistent backend for tests and short-lived agents
#[derive(Default)]
pub struct MemoryStorage {
    sessions: RwLock<HashMap<String, SerializedSession>>,
    checkpoints: RwLock<HashMap<String, Vec<SessionCheckpoint>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStorage for MemoryStorage {
    async fn save(&self, session: &SerializedSession) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<SerializedSession>> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        self.sessions.write().await.remove(session_id);
        self.checkpoints.write().await.remove(session_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.sessions.read().await.keys().cloned().collect())
    }

    async fn exists(&self, session_id: &str) -> Result<bool> {
        Ok(self.sessions.read().await.contains_key(session_id))
    }

    async fn save_checkpoint(&self, checkpoint: &SessionCheckpoint) -> Result<()> {
        self.checkpoints
            .write()
            .await
            .entry(checkpoint.session_id.clone())
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn load_checkpoints(
        &self,
        session_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SessionCheckpoint>> {
        let mut checkpoints: Vec<SessionCheckpoint> = self
            .checkpoints
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|c| since.map_or(true, |s| c.created_at > s))
            .collect();
        checkpoints.sort_by_key(|c| c.created_at);
        Ok(checkpoints)
    }
}

/// File-per-session JSON under a root directory.
///
/// Layout: `<root>/<id>.json` for snapshots, `<root>/<id>.checkpoints/` with
/// one timestamped file per checkpoint. Session ids containing path
/// separators or parent references are rejected.
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn validate_id(session_id: &str) -> Result<()> {
        if session_id.is_empty()
            || session_id.contains(['/', '\\'])
            || session_id.contains("..")
        {
            return Err(ContextError::InvalidOperation(format!(
                "invalid session id: {session_id:?}"
            )));
        }
        Ok(())
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{session_id}.json"))
    }

    fn checkpoint_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{session_id}.checkpoints"))
    }

    async fn ensure_dir(path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStorage for FileStorage {
    async fn save(&self, session: &SerializedSession) -> Result<()> {
        Self::validate_id(&session.session_id)?;
        Self::ensure_dir(&self.root).await?;
        let path = self.session_path(&session.session_id);
        let json = serde_json::to_vec_pretty(session)?;
        // write-then-rename so a crash never leaves a truncated snapshot
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(session_id = %session.session_id, path = %path.display(), "session saved");
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<SerializedSession>> {
        Self::validate_id(session_id)?;
        let path = self.session_path(session_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        Self::validate_id(session_id)?;
        match tokio::fs::remove_file(self.session_path(session_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match tokio::fs::remove_dir_all(self.checkpoint_dir(session_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        Ok(ids)
    }

    async fn exists(&self, session_id: &str) -> Result<bool> {
        Self::validate_id(session_id)?;
        Ok(tokio::fs::try_exists(self.session_path(session_id)).await?)
    }

    async fn save_checkpoint(&self, checkpoint: &SessionCheckpoint) -> Result<()> {
        Self::validate_id(&checkpoint.session_id)?;
        let dir = self.checkpoint_dir(&checkpoint.session_id);
        Self::ensure_dir(&dir).await?;
        let name = format!(
            "{}.json",
            checkpoint.created_at.format("%Y%m%dT%H%M%S%.3f")
        );
        let json = serde_json::to_vec_pretty(checkpoint)?;
        tokio::fs::write(dir.join(name), &json).await?;
        Ok(())
    }

    async fn load_checkpoints(
        &self,
        session_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SessionCheckpoint>> {
        Self::validate_id(session_id)?;
        let dir = self.checkpoint_dir(session_id);
        let mut checkpoints = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(checkpoints),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let bytes = tokio::fs::read(entry.path()).await?;
            match serde_json::from_slice::<SessionCheckpoint>(&bytes) {
                Ok(checkpoint) => {
                    if since.map_or(true, |s| checkpoint.created_at > s) {
                        checkpoints.push(checkpoint);
                    }
                }
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "unreadable checkpoint skipped");
                }
            }
        }
        checkpoints.sort_by_key(|c| c.created_at);
        Ok(checkpoints)
    }
}

/// Wraps any backend to log every call with its outcome
pub struct InstrumentedStorage<S> {
    inner: S,
}

impl<S: SessionStorage> InstrumentedStorage<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: SessionStorage> SessionStorage for InstrumentedStorage<S> {
    #[instrument(skip_all, fields(session_id = %session.session_id))]
    async fn save(&self, session: &SerializedSession) -> Result<()> {
        let result = self.inner.save(session).await;
        if let Err(e) = &result {
            warn!(error = %e, "session save failed");
        }
        result
    }

    #[instrument(skip(self))]
    async fn load(&self, session_id: &str) -> Result<Option<SerializedSession>> {
        let result = self.inner.load(session_id).await;
        match &result {
            Ok(Some(_)) => debug!("session loaded"),
            Ok(None) => debug!("session not found"),
            Err(e) => warn!(error = %e, "session load failed"),
        }
        result
    }

    #[instrument(skip(self))]
    async fn delete(&self, session_id: &str) -> Result<()> {
        let result = self.inner.delete(session_id).await;
        if let Err(e) = &result {
            warn!(error = %e, "session delete failed");
        }
        result
    }

    async fn list(&self) -> Result<Vec<String>> {
        self.inner.list().await
    }

    async fn exists(&self, session_id: &str) -> Result<bool> {
        self.inner.exists(session_id).await
    }

    #[instrument(skip_all, fields(session_id = %checkpoint.session_id))]
    async fn save_checkpoint(&self, checkpoint: &SessionCheckpoint) -> Result<()> {
        self.inner.save_checkpoint(checkpoint).await
    }

    #[instrument(skip(self))]
    async fn load_checkpoints(
        &self,
        session_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SessionCheckpoint>> {
        self.inner.load_checkpoints(session_id, since).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::manager::ContextManager;
    use crate::session::{SerializeOptions, SessionSerializer};

    async fn sample_session() -> SerializedSession {
        let mut manager = ContextManager::new(ContextConfig::for_window(50_000)).unwrap();
        manager.add_system_message("rules").await.unwrap();
        manager.add_user_message("hello").await.unwrap();
        SessionSerializer::serialize(&manager, &SerializeOptions::default()).unwrap()
    }

    #[tokio::test]
    async fn test_memory_storage_round_trip() {
        let storage = MemoryStorage::new();
        let session = sample_session().await;
        let id = session.session_id.clone();

        storage.save(&session).await.unwrap();
        assert!(storage.exists(&id).await.unwrap());
        let loaded = storage.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.session_id, id);
        assert_eq!(storage.list().await.unwrap(), vec![id.clone()]);

        storage.delete(&id).await.unwrap();
        assert!(!storage.exists(&id).await.unwrap());
        assert!(storage.load(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let session = sample_session().await;
        let id = session.session_id.clone();

        storage.save(&session).await.unwrap();
        let loaded = storage.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.session_id, id);
        assert_eq!(loaded.tiers.len(), session.tiers.len());

        let ids = storage.list().await.unwrap();
        assert!(ids.contains(&id));

        storage.delete(&id).await.unwrap();
        assert!(storage.load(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_storage_missing_root_lists_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("nested").join("missing"));
        assert!(storage.list().await.unwrap().is_empty());
        assert!(storage.load("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_storage_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        assert!(storage.load("../escape").await.is_err());
        assert!(storage.load("a/b").await.is_err());
        assert!(storage.delete("").await.is_err());
    }

    #[tokio::test]
    async fn test_checkpoints_persist_per_session() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let mut manager = ContextManager::new(ContextConfig::for_window(50_000)).unwrap();
        manager.add_user_message("one").await.unwrap();
        let since = Utc::now() - chrono::Duration::hours(1);
        let baseline = crate::budget::BudgetBreakdown::default();
        let checkpoint =
            SessionSerializer::create_checkpoint(&manager, since, &baseline).unwrap();

        storage.save_checkpoint(&checkpoint).await.unwrap();
        let loaded = storage
            .load_checkpoints(manager.session_id(), None)
            .await
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].messages.len(), 1);

        // the since filter excludes checkpoints at or before the cutoff
        let later = storage
            .load_checkpoints(manager.session_id(), Some(checkpoint.created_at))
            .await
            .unwrap();
        assert!(later.is_empty());
        let earlier = storage
            .load_checkpoints(manager.session_id(), Some(since))
            .await
            .unwrap();
        assert_eq!(earlier.len(), 1);
    }

    #[tokio::test]
    async fn test_default_checkpoint_methods_unsupported() {
        struct Bare;
        #[async_trait]
        impl SessionStorage for Bare {
            async fn save(&self, _: &SerializedSession) -> Result<()> {
                Ok(())
            }
            async fn load(&self, _: &str) -> Result<Option<SerializedSession>> {
                Ok(None)
            }
            async fn delete(&self, _: &str) -> Result<()> {
                Ok(())
            }
            async fn list(&self) -> Result<Vec<String>> {
                Ok(Vec::new())
            }
        }
        let err = Bare.load_checkpoints("x", None).await;
        assert!(matches!(err, Err(ContextError::CheckpointsUnsupported)));
    }

    #[tokio::test]
    async fn test_instrumented_passthrough() {
        let storage = InstrumentedStorage::new(MemoryStorage::new());
        let session = sample_session().await;
        storage.save(&session).await.unwrap();
        assert!(storage.exists(&session.session_id).await.unwrap());
    }
}
