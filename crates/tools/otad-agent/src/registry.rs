//! Process-wide registry enforcing the single-session invariant.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::session::{Snapshot, Stage, UpdateSession};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("another update session is already in progress")]
    Conflict,
    #[error("no update session matches the provided token")]
    NotFound,
    #[error("update session is in stage {stage}, expected {expected}")]
    WrongStage { stage: Stage, expected: Stage },
    #[error("unable to prepare session storage")]
    Storage(#[from] io::Error),
}

/// A live session together with its pipeline task.
struct ActiveUpdate {
    session: Arc<UpdateSession>,
    task: Option<JoinHandle<()>>,
}

/// Registry holding at most one update session.
///
/// The registry owns the only long-lived reference to the session and its
/// pipeline task; superseding or shutting down therefore requests
/// cancellation and waits for the task before releasing anything.
pub struct SessionRegistry {
    inner: Mutex<Option<ActiveUpdate>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Begin a new session.
    ///
    /// Fails with [`RegistryError::Conflict`] while a non-terminal session
    /// exists; a terminal predecessor is torn down first.
    pub async fn begin(&self, download_dir: &Path) -> Result<Arc<UpdateSession>, RegistryError> {
        let mut inner = self.inner.lock().await;
        if let Some(active) = inner.take() {
            if !active.session.stage().is_terminal() {
                *inner = Some(active);
                return Err(RegistryError::Conflict);
            }
            tear_down(active).await;
        }
        let session = Arc::new(UpdateSession::new(download_dir));
        fs::create_dir_all(session.bundle_dir())?;
        *inner = Some(ActiveUpdate {
            session: session.clone(),
            task: None,
        });
        Ok(session)
    }

    /// Fetch the session matching the token.
    pub async fn get(&self, token: &str) -> Result<Arc<UpdateSession>, RegistryError> {
        match &*self.inner.lock().await {
            Some(active) if active.session.token() == token => Ok(active.session.clone()),
            _ => Err(RegistryError::NotFound),
        }
    }

    /// Attach the pipeline task driving the session.
    pub async fn attach_task(&self, token: &str, task: JoinHandle<()>) {
        let mut inner = self.inner.lock().await;
        match inner.as_mut() {
            Some(active) if active.session.token() == token => active.task = Some(task),
            _ => {
                // The session is gone; nothing will ever join the task.
                warn!("no session {token} to attach the pipeline task to");
                task.abort();
            }
        }
    }

    /// Request cancellation of the session matching the token.
    ///
    /// Idempotent: without a matching session this is a no-op.
    pub async fn cancel(&self, token: &str) {
        let mut inner = self.inner.lock().await;
        let Some(active) = inner.as_mut() else {
            return;
        };
        if active.session.token() != token {
            return;
        }
        active.session.request_cancel();
        if active.task.is_none() {
            // No pipeline will ever observe the request; apply it directly.
            if active.session.mark_cancelled() {
                active.session.remove_bundle();
            }
        }
    }

    /// Confirm a completed session and tear it down.
    pub async fn finish(&self, token: &str) -> Result<Snapshot, RegistryError> {
        let mut inner = self.inner.lock().await;
        match inner.as_ref() {
            Some(active) if active.session.token() == token => {
                let stage = active.session.stage();
                if stage != Stage::Done {
                    return Err(RegistryError::WrongStage {
                        stage,
                        expected: Stage::Done,
                    });
                }
            }
            _ => return Err(RegistryError::NotFound),
        }
        let active = inner.take().expect("session checked above");
        let snapshot = active.session.snapshot();
        tear_down(active).await;
        Ok(snapshot)
    }

    /// Tear down any remaining session on process shutdown.
    pub async fn shutdown(&self) {
        if let Some(active) = self.inner.lock().await.take() {
            active.session.request_cancel();
            tear_down(active).await;
        }
    }
}

/// Join the pipeline task and clean the session's scratch files.
async fn tear_down(active: ActiveUpdate) {
    if let Some(task) = active.task {
        if let Err(error) = task.await {
            warn!("update pipeline task failed: {error}");
        }
    }
    active.session.remove_bundle();
}
