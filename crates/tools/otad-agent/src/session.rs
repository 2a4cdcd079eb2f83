//! Update sessions and their stage state machine.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Stage of an update session.
///
/// Stages only ever advance forward, or jump into one of the terminal
/// stages `Done`, `Error`, and `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    AwaitingFile,
    Validating,
    Writing,
    Done,
    Error,
    Cancelled,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::AwaitingFile => "awaiting-file",
            Stage::Validating => "validating",
            Stage::Writing => "writing",
            Stage::Done => "done",
            Stage::Error => "error",
            Stage::Cancelled => "cancelled",
        }
    }

    /// Indicates whether the stage is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Error | Stage::Cancelled)
    }

    /// Indicates whether the state machine may advance from `self` to `next`.
    fn can_advance(self, next: Stage) -> bool {
        matches!(
            (self, next),
            (Stage::AwaitingFile, Stage::Validating)
                | (Stage::Validating, Stage::Writing)
                | (Stage::Writing, Stage::Done)
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured cause stored when a session fails.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorInfo {
    /// Machine-readable error kind.
    pub error: &'static str,
    /// Human-readable message.
    pub message: String,
}

/// Snapshot of a session's externally visible state.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub stage: Stage,
    pub progress: f64,
    #[serde(flatten)]
    pub error: Option<ErrorInfo>,
}

/// Mutable state shared between the pipeline and status polls.
#[derive(Debug)]
struct SessionState {
    stage: Stage,
    progress: f64,
    error: Option<ErrorInfo>,
}

/// A single update attempt.
///
/// The mutex is only ever held for the moment it takes to update or copy the
/// state, never across I/O.
#[derive(Debug)]
pub struct UpdateSession {
    token: String,
    bundle_dir: PathBuf,
    state: Mutex<SessionState>,
    cancel_requested: AtomicBool,
}

impl UpdateSession {
    /// Create a fresh session rooted at the given download directory.
    pub fn new(download_dir: &Path) -> Self {
        let token = Uuid::new_v4().simple().to_string();
        let bundle_dir = download_dir.join(&token);
        Self {
            token,
            bundle_dir,
            state: Mutex::new(SessionState {
                stage: Stage::AwaitingFile,
                progress: 0.0,
                error: None,
            }),
            cancel_requested: AtomicBool::new(false),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn bundle_dir(&self) -> &Path {
        &self.bundle_dir
    }

    /// Path of the uploaded root filesystem image.
    pub fn bundle_path(&self) -> PathBuf {
        self.bundle_dir.join("rootfs.img")
    }

    pub fn stage(&self) -> Stage {
        self.state.lock().unwrap().stage
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.lock().unwrap();
        Snapshot {
            stage: state.stage,
            progress: state.progress,
            error: state.error.clone(),
        }
    }

    /// Advance to the next stage, resetting progress.
    ///
    /// Returns whether the transition was applied; transitions not in the
    /// state machine are ignored.
    pub fn advance(&self, next: Stage) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.stage.can_advance(next) {
            return false;
        }
        info!("update session {}: {} -> {}", self.token, state.stage, next);
        state.stage = next;
        state.progress = 0.0;
        true
    }

    /// Update progress within the current stage.
    ///
    /// Progress is clamped to `[0.0, 1.0]` and never decreases.
    pub fn update_progress(&self, progress: f64) {
        let mut state = self.state.lock().unwrap();
        state.progress = state.progress.max(progress.clamp(0.0, 1.0));
    }

    /// Route the session into the error stage with a structured cause.
    pub fn fail(&self, kind: &'static str, message: String) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.stage.is_terminal() {
            return false;
        }
        error!("update session {} failed in stage {}: {message}", self.token, state.stage);
        state.stage = Stage::Error;
        state.error = Some(ErrorInfo {
            error: kind,
            message,
        });
        true
    }

    /// Request cooperative cancellation.
    ///
    /// The pipeline observes the request at its next step boundary; sessions
    /// without a running pipeline are cancelled directly by the registry.
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::Relaxed);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Relaxed)
    }

    /// Transition a non-terminal session into the cancelled stage.
    pub fn mark_cancelled(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.stage.is_terminal() {
            return false;
        }
        info!("update session {}: {} -> cancelled", self.token, state.stage);
        state.stage = Stage::Cancelled;
        true
    }

    /// Remove the session's bundle directory from disk.
    pub fn remove_bundle(&self) {
        if let Err(error) = fs::remove_dir_all(&self.bundle_dir) {
            if error.kind() != io::ErrorKind::NotFound {
                warn!(
                    "unable to remove bundle directory {:?}: {error}",
                    self.bundle_dir
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session() -> UpdateSession {
        UpdateSession::new(Path::new("/tmp/otad-tests"))
    }

    #[test]
    fn test_forward_transitions_only() {
        let session = test_session();
        assert!(!session.advance(Stage::Writing));
        assert!(session.advance(Stage::Validating));
        assert!(!session.advance(Stage::Done));
        assert!(session.advance(Stage::Writing));
        assert!(session.advance(Stage::Done));
        // Terminal stages never advance.
        assert!(!session.advance(Stage::Validating));
        assert!(!session.mark_cancelled());
        assert!(!session.fail("write-failure", "too late".into()));
    }

    #[test]
    fn test_progress_is_monotone_and_clamped() {
        let session = test_session();
        session.advance(Stage::Validating);
        session.update_progress(0.5);
        session.update_progress(0.25);
        assert_eq!(session.snapshot().progress, 0.5);
        session.update_progress(1.5);
        assert_eq!(session.snapshot().progress, 1.0);
    }

    #[test]
    fn test_progress_resets_on_stage_entry() {
        let session = test_session();
        session.advance(Stage::Validating);
        session.update_progress(1.0);
        session.advance(Stage::Writing);
        assert_eq!(session.snapshot().progress, 0.0);
    }

    #[test]
    fn test_fail_records_cause() {
        let session = test_session();
        session.advance(Stage::Validating);
        assert!(session.fail("digest-mismatch", "boom".into()));
        let snapshot = session.snapshot();
        assert_eq!(snapshot.stage, Stage::Error);
        let error = snapshot.error.unwrap();
        assert_eq!(error.error, "digest-mismatch");
        assert_eq!(error.message, "boom");
    }

    #[test]
    fn test_cancel_flag() {
        let session = test_session();
        assert!(!session.cancel_requested());
        session.request_cancel();
        assert!(session.cancel_requested());
        assert!(session.mark_cancelled());
        assert_eq!(session.stage(), Stage::Cancelled);
    }

    #[test]
    fn test_snapshot_wire_format() {
        let session = test_session();
        let value = serde_json::to_value(session.snapshot()).unwrap();
        assert_eq!(value["stage"], "awaiting-file");
        assert_eq!(value["progress"], 0.0);
        assert!(value.get("error").is_none());

        session.advance(Stage::Validating);
        session.fail("size-mismatch", "expected 2, found 1".into());
        let value = serde_json::to_value(session.snapshot()).unwrap();
        assert_eq!(value["stage"], "error");
        assert_eq!(value["error"], "size-mismatch");
        assert_eq!(value["message"], "expected 2, found 1");
    }
}
