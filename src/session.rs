//! Session records and the admission controller.
//!
//! The store is the single source of truth for session existence. The
//! active-session counter is advisory: `reconcile_count` recomputes it from
//! a key scan on a fixed interval to bound drift.

use std::path::Path;
use std::sync::Arc;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{SessionConfig, WorkspaceConfig, INITIAL_TEMPLATE, SOURCE_FILE_NAME};
use crate::error::{Error, Result};
use crate::store::SessionStore;

pub const SESSION_KEY_PREFIX: &str = "lsp:session:";
pub const ACTIVE_COUNT_KEY: &str = "session:active:count";

pub fn session_key(session_id: &str) -> String {
    format!("{}{}", SESSION_KEY_PREFIX, session_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Ready,
    Terminated,
}

/// Session record as stored (JSON text under `lsp:session:<id>`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub workspace_root: String,
    #[serde(default)]
    pub uploaded_files: Vec<String>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
}

/// Returned by `create_session`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSession {
    pub session_id: String,
}

/// Admission control and record maintenance for sessions.
pub struct SessionService {
    store: Arc<dyn SessionStore>,
    config: SessionConfig,
    workspace: WorkspaceConfig,
}

impl SessionService {
    pub fn new(store: Arc<dyn SessionStore>, config: SessionConfig, workspace: WorkspaceConfig) -> Self {
        Self {
            store,
            config,
            workspace,
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn workspace(&self) -> &WorkspaceConfig {
        &self.workspace
    }

    pub async fn active_count(&self) -> Result<i64> {
        let count = self.store.get(ACTIVE_COUNT_KEY).await?;
        Ok(count.and_then(|c| c.parse().ok()).unwrap_or(0))
    }

    /// Admit a new session for `user_id`, or refuse with `Capacity`.
    pub async fn create_session(&self, user_id: &str) -> Result<CreatedSession> {
        let active = self.active_count().await?;
        if active >= self.config.max_sessions {
            return Err(Error::Capacity(format!(
                "Maximum concurrent sessions ({}) reached. Please try again later.",
                self.config.max_sessions
            )));
        }

        let session_id = uuid::Uuid::now_v7().simple().to_string();

        let session_dir = self.workspace.session_dir(&session_id);
        tokio::fs::create_dir_all(&session_dir).await?;
        tokio::fs::write(session_dir.join(SOURCE_FILE_NAME), INITIAL_TEMPLATE).await?;

        let now = Utc::now();
        let session = Session {
            session_id: session_id.clone(),
            user_id: user_id.to_string(),
            created_at: now,
            last_activity: now,
            workspace_root: self.workspace.container_root(&session_id),
            uploaded_files: vec![SOURCE_FILE_NAME.to_string()],
            status: SessionStatus::Pending,
            container_id: None,
            container_name: None,
        };
        self.store
            .set_ex(&session_key(&session_id), &serde_json::to_string(&session)?, self.config.ttl)
            .await?;
        self.store.incr(ACTIVE_COUNT_KEY).await?;

        info!(session_id = %session_id, user_id = %user_id, "Created session");
        Ok(CreatedSession { session_id })
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        match self.store.get(&session_key(session_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Like `get`, but a closed session that has not expired yet reads as absent.
    pub async fn get_active(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self
            .get(session_id)
            .await?
            .filter(|s| s.status != SessionStatus::Terminated))
    }

    /// Fetch an open session and check it belongs to `user_id`.
    pub async fn get_owned(&self, session_id: &str, user_id: &str) -> Result<Session> {
        let session = self
            .get_active(session_id)
            .await?
            .ok_or_else(|| Error::not_found("Session not found"))?;
        if session.user_id != user_id {
            return Err(Error::forbidden("Session does not belong to user"));
        }
        Ok(session)
    }

    pub async fn exists(&self, session_id: &str) -> Result<bool> {
        Ok(self.store.exists(&session_key(session_id)).await?)
    }

    /// Ids of all live sessions.
    pub async fn list_ids(&self) -> Result<Vec<String>> {
        let keys = self.store.keys(SESSION_KEY_PREFIX).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(SESSION_KEY_PREFIX).map(str::to_string))
            .collect())
    }

    pub async fn renew_session(&self, session_id: &str, user_id: &str) -> Result<()> {
        let mut session = self.get_owned(session_id, user_id).await?;
        session.last_activity = Utc::now();
        self.store
            .set_ex(&session_key(session_id), &serde_json::to_string(&session)?, self.config.ttl)
            .await?;
        Ok(())
    }

    /// Mark the session terminated and let it expire almost immediately;
    /// the lifecycle manager then sees the same "entry vanished" signal as
    /// for natural expiry. A second close finds nothing and leaves the
    /// counter alone.
    pub async fn close_session(&self, session_id: &str, user_id: &str) -> Result<()> {
        let mut session = self.get_owned(session_id, user_id).await?;
        session.status = SessionStatus::Terminated;
        self.store
            .set_ex(
                &session_key(session_id),
                &serde_json::to_string(&session)?,
                self.config.close_ttl,
            )
            .await?;
        self.store.decr(ACTIVE_COUNT_KEY).await?;
        info!(session_id = %session_id, "Closed session");
        Ok(())
    }

    /// Refresh last activity and the TTL. Absent and closed sessions are ignored.
    pub async fn touch(&self, session_id: &str) -> Result<()> {
        let Some(mut session) = self.get_active(session_id).await? else {
            return Ok(());
        };
        session.last_activity = Utc::now();
        self.store
            .set_ex(&session_key(session_id), &serde_json::to_string(&session)?, self.config.ttl)
            .await?;
        Ok(())
    }

    /// Record the workspace container of a session without touching its expiry.
    /// Returns false when the session no longer exists.
    pub async fn attach_container(
        &self,
        session_id: &str,
        container_id: &str,
        container_name: &str,
        workspace_root: &str,
    ) -> Result<bool> {
        let Some(mut session) = self.get(session_id).await? else {
            return Ok(false);
        };
        session.container_id = Some(container_id.to_string());
        session.container_name = Some(container_name.to_string());
        session.workspace_root = workspace_root.to_string();
        if session.status == SessionStatus::Pending {
            session.status = SessionStatus::Ready;
        }
        Ok(self
            .store
            .set_keep_ttl(&session_key(session_id), &serde_json::to_string(&session)?)
            .await?)
    }

    /// Forget the container of a session, keeping its expiry.
    pub async fn detach_container(&self, session_id: &str) -> Result<bool> {
        let Some(mut session) = self.get(session_id).await? else {
            return Ok(false);
        };
        session.container_id = None;
        session.container_name = None;
        if session.status == SessionStatus::Ready {
            session.status = SessionStatus::Pending;
        }
        Ok(self
            .store
            .set_keep_ttl(&session_key(session_id), &serde_json::to_string(&session)?)
            .await?)
    }

    /// Replace the session's source file with base64-encoded content.
    /// Returns the file path as seen from inside containers.
    pub async fn update_file_from_base64(
        &self,
        session_id: &str,
        user_id: &str,
        content: &str,
    ) -> Result<String> {
        if content.is_empty() {
            return Err(Error::validation("Content is required"));
        }
        self.get_owned(session_id, user_id).await?;

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(content.trim())
            .map_err(|_| Error::validation("Invalid base64 content"))?;
        if bytes.len() > self.config.max_upload_bytes {
            return Err(Error::validation("File size must be less than 1MB"));
        }
        let text = String::from_utf8(bytes)
            .map_err(|_| Error::validation("File content must be UTF-8 text"))?;

        write_source(&self.workspace.source_file(session_id), &text).await?;
        self.touch(session_id).await?;

        Ok(format!(
            "{}/{}",
            self.workspace.container_root(session_id),
            SOURCE_FILE_NAME
        ))
    }

    /// Recompute the active counter from the authoritative key scan.
    pub async fn reconcile_count(&self) -> Result<i64> {
        let actual = self.store.keys(SESSION_KEY_PREFIX).await?.len() as i64;
        self.store.set(ACTIVE_COUNT_KEY, &actual.to_string()).await?;
        Ok(actual)
    }

    /// Run `reconcile_count` on the configured interval until cancelled.
    pub fn spawn_count_reconciler(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.config.count_reconcile_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = service.reconcile_count().await {
                            error!(error = %e, "Failed to reconcile session count");
                        }
                    }
                }
            }
        })
    }
}

async fn write_source(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, text).await?;
    Ok(())
}
