//! The background pipeline driving a session to completion.
//!
//! One pipeline runs per session, on a blocking thread, and is the only
//! writer of the session's stage once validation starts. All failures are
//! captured into the session; nothing escapes the pipeline task. The target
//! partition is always derived from [`PartitionManager::find_unused_partition`],
//! so the running system is never written to.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use otad_common::manager::{MountGuard, PartitionManager};
use otad_common::partitions::Partition;

use crate::session::{Stage, UpdateSession};
use crate::validate::{self, ExpectedImage, ValidateError};

/// Chunk size for raw image writes.
const CHUNK_SIZE: usize = 64 * 1024;

/// Failure of an update pipeline step.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Validation(#[from] ValidateError),
    #[error("no unused partition available: {reason}")]
    NoUnusedPartition { reason: String },
    #[error("unable to write image to {device:?}: {reason}")]
    WriteFailure { device: PathBuf, reason: String },
    #[error("unable to resize target filesystem: {reason}")]
    ResizeFailure { reason: String },
    #[error("unable to switch boot target: {reason}")]
    SwitchFailure { reason: String },
}

impl UpdateError {
    /// Machine-readable kind, stable across the HTTP surface.
    pub fn kind(&self) -> &'static str {
        match self {
            UpdateError::Validation(ValidateError::FileMissing { .. }) => "file-missing",
            UpdateError::Validation(ValidateError::SizeMismatch { .. }) => "size-mismatch",
            UpdateError::Validation(ValidateError::DigestMismatch { .. }) => "digest-mismatch",
            UpdateError::Validation(ValidateError::Io(_)) => "io-error",
            UpdateError::NoUnusedPartition { .. } => "no-unused-partition",
            UpdateError::WriteFailure { .. } => "write-failure",
            UpdateError::ResizeFailure { .. } => "resize-failure",
            UpdateError::SwitchFailure { .. } => "switch-failure",
        }
    }
}

/// Drive the session through the update pipeline.
///
/// Must run on a blocking thread; every step may block on I/O.
pub fn run(
    session: Arc<UpdateSession>,
    manager: Arc<dyn PartitionManager>,
    expected: ExpectedImage,
    marker_file: PathBuf,
) {
    if cancelled(&session) {
        return;
    }
    if let Err(error) = run_steps(&session, &*manager, &expected, &marker_file) {
        session.fail(error.kind(), error_chain(&error));
    }
}

fn run_steps(
    session: &UpdateSession,
    manager: &dyn PartitionManager,
    expected: &ExpectedImage,
    marker_file: &Path,
) -> Result<(), UpdateError> {
    // The session enters `Validating` when the upload completes.
    let result = validate::validate(&session.bundle_path(), expected, |progress| {
        session.update_progress(progress)
    })?;
    debug!(
        "bundle validated: {} bytes, sha256:{}",
        result.observed_size,
        hex::encode(&result.observed_digest)
    );
    if cancelled(session) {
        return Ok(());
    }

    let target = manager
        .find_unused_partition()
        .map_err(|error| UpdateError::NoUnusedPartition {
            reason: error_chain(&error),
        })?;
    // The target may still be mounted from an earlier inspection; a failure
    // here just means it was not.
    manager.umount_fs(&target).ok();

    session.advance(Stage::Writing);
    write_image(session, &session.bundle_path(), &target, expected.size)?;
    if cancelled(session) {
        return Ok(());
    }

    manager
        .resize_partition(&target)
        .map_err(|error| UpdateError::ResizeFailure {
            reason: error_chain(&error),
        })?;
    if cancelled(session) {
        return Ok(());
    }

    verify_target(manager, &target, marker_file)?;
    if cancelled(session) {
        return Ok(());
    }

    // The switch is the last step; everything before it only ever touched
    // the unused partition.
    let selected = manager
        .switch_partition(&target)
        .map_err(|error| UpdateError::SwitchFailure {
            reason: error_chain(&error),
        })?;
    if selected.set != target.set {
        return Err(UpdateError::SwitchFailure {
            reason: format!(
                "boot selection names system {} instead of system {}",
                selected.set.as_str(),
                target.set.as_str()
            ),
        });
    }

    session.advance(Stage::Done);
    info!(
        "update installed to system {}, boot selection switched",
        target.set.as_str()
    );
    Ok(())
}

/// Check for a cancellation request at a step boundary.
///
/// The device-mutating steps themselves are non-interruptible units; a
/// cancelled session keeps whatever partial state the unused partition has
/// reached, while the active partition and the boot selection stay untouched.
fn cancelled(session: &UpdateSession) -> bool {
    if !session.cancel_requested() {
        return false;
    }
    if session.mark_cancelled() {
        session.remove_bundle();
    }
    true
}

/// Copy the validated image onto the target device in chunks.
fn write_image(
    session: &UpdateSession,
    bundle: &Path,
    target: &Partition,
    expected_size: u64,
) -> Result<(), UpdateError> {
    let write_error = |reason: String| UpdateError::WriteFailure {
        device: target.device.clone(),
        reason,
    };
    let mut image = File::open(bundle).map_err(|error| write_error(error.to_string()))?;
    let mut device = File::create(&target.device).map_err(|error| write_error(error.to_string()))?;
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut written: u64 = 0;
    loop {
        let read = image
            .read(&mut buffer)
            .map_err(|error| write_error(error.to_string()))?;
        if read == 0 {
            break;
        }
        device
            .write_all(&buffer[..read])
            .map_err(|error| write_error(error.to_string()))?;
        written += read as u64;
        if expected_size > 0 {
            session.update_progress((written as f64 / expected_size as f64).min(1.0));
        }
    }
    device
        .sync_all()
        .map_err(|error| write_error(error.to_string()))?;
    session.update_progress(1.0);
    Ok(())
}

/// Mount the freshly written filesystem read-only and check its plausibility.
fn verify_target(
    manager: &dyn PartitionManager,
    target: &Partition,
    marker_file: &Path,
) -> Result<(), UpdateError> {
    let guard = MountGuard::mount(manager, target, true).map_err(|error| {
        UpdateError::WriteFailure {
            device: target.device.clone(),
            reason: error_chain(&error),
        }
    })?;
    let marker = guard.path().join(marker_file);
    if !marker.exists() {
        return Err(UpdateError::WriteFailure {
            device: target.device.clone(),
            reason: format!("marker file {marker:?} is missing from the written filesystem"),
        });
    }
    Ok(())
}

/// Render an error including its chain of sources.
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
