//! Partition management behind a trait seam.
//!
//! The update pipeline only ever talks to [`PartitionManager`]; the
//! [`LinuxPartitionManager`] implementation operates on real block devices
//! and the bootloader's selection environment, while tests substitute a
//! file-backed double.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};
use xscript::{run, Run};

use crate::boot_env::{BootEnv, BootEnvError};
use crate::partitions::{Partition, PartitionSet, Partitions};

/// Key naming the default root partition in the selection environment.
const BOOTPART_KEY: &str = "bootpart";
/// `bootpart` value selecting system A.
const BOOTPART_A: &str = "2";
/// `bootpart` value selecting system B.
const BOOTPART_B: &str = "3";

/// The `e2fsck` executable.
const E2FSCK: &str = "/usr/sbin/e2fsck";
/// The `resize2fs` executable.
const RESIZE2FS: &str = "/usr/sbin/resize2fs";

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("unable to read boot selection from {path:?}")]
    BootSelection {
        path: PathBuf,
        #[source]
        source: BootEnvError,
    },
    #[error("boot selection {value:?} does not name a known partition")]
    InvalidBootSelection { value: String },
    #[error("partition configuration is inconsistent: {reason}")]
    NoUnusedPartition { reason: String },
    #[error("unable to mount {device:?} at {mount_point:?}: {reason}")]
    Mount {
        device: PathBuf,
        mount_point: PathBuf,
        reason: String,
    },
    #[error("unable to unmount {mount_point:?}: {reason}")]
    Unmount { mount_point: PathBuf, reason: String },
    #[error("unable to resize filesystem on {device:?}: {reason}")]
    Resize { device: PathBuf, reason: String },
    #[error("unable to switch boot selection to system {}", .target.as_str())]
    Switch {
        target: PartitionSet,
        #[source]
        source: BootEnvError,
    },
}

/// Capability to inspect and manipulate the two root partitions.
pub trait PartitionManager: Send + Sync {
    /// Partition the bootloader will select on the next boot.
    fn active_partition(&self) -> Result<Partition, PartitionError>;

    /// Partition the bootloader will not select, i.e., the update target.
    fn find_unused_partition(&self) -> Result<Partition, PartitionError>;

    /// Mount the partition's filesystem at its scratch mount point.
    fn mount_fs(&self, partition: &Partition, read_only: bool) -> Result<PathBuf, PartitionError>;

    /// Unmount the partition's filesystem.
    fn umount_fs(&self, partition: &Partition) -> Result<(), PartitionError>;

    /// Grow the filesystem to fill the partition's block range.
    fn resize_partition(&self, partition: &Partition) -> Result<(), PartitionError>;

    /// Atomically make the bootloader select the given partition.
    ///
    /// Returns the partition the selection names afterwards.
    fn switch_partition(&self, partition: &Partition) -> Result<Partition, PartitionError>;
}

/// Scoped mount which is unmounted when dropped.
///
/// Callers inspecting a partition go through this guard so the unmount runs
/// on every exit path.
pub struct MountGuard<'m> {
    manager: &'m dyn PartitionManager,
    partition: Partition,
    path: PathBuf,
}

impl<'m> MountGuard<'m> {
    pub fn mount(
        manager: &'m dyn PartitionManager,
        partition: &Partition,
        read_only: bool,
    ) -> Result<Self, PartitionError> {
        let path = manager.mount_fs(partition, read_only)?;
        Ok(Self {
            manager,
            partition: partition.clone(),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if let Err(error) = self.manager.umount_fs(&self.partition) {
            warn!("unable to unmount {:?}: {error}", self.path);
        }
    }
}

/// [`PartitionManager`] operating on real block devices.
pub struct LinuxPartitionManager {
    partitions: Partitions,
    boot_env_path: PathBuf,
}

impl LinuxPartitionManager {
    pub fn new(partitions: Partitions, boot_env_path: impl Into<PathBuf>) -> Self {
        Self {
            partitions,
            boot_env_path: boot_env_path.into(),
        }
    }

    /// Read the current root partition selection from the boot environment.
    fn read_selection(&self) -> Result<PartitionSet, PartitionError> {
        let env =
            BootEnv::load(&self.boot_env_path).map_err(|source| PartitionError::BootSelection {
                path: self.boot_env_path.clone(),
                source,
            })?;
        match env.get(BOOTPART_KEY) {
            Some(BOOTPART_A) => Ok(PartitionSet::A),
            Some(BOOTPART_B) => Ok(PartitionSet::B),
            other => Err(PartitionError::InvalidBootSelection {
                value: other.unwrap_or_default().to_owned(),
            }),
        }
    }
}

impl PartitionManager for LinuxPartitionManager {
    fn active_partition(&self) -> Result<Partition, PartitionError> {
        Ok(self.partitions.get(self.read_selection()?).clone())
    }

    fn find_unused_partition(&self) -> Result<Partition, PartitionError> {
        if self.partitions.system_a.device == self.partitions.system_b.device {
            return Err(PartitionError::NoUnusedPartition {
                reason: format!(
                    "both root partitions resolve to {:?}",
                    self.partitions.system_a.device
                ),
            });
        }
        Ok(self.partitions.get(self.read_selection()?.flipped()).clone())
    }

    fn mount_fs(&self, partition: &Partition, read_only: bool) -> Result<PathBuf, PartitionError> {
        let mount_error = |reason: String| PartitionError::Mount {
            device: partition.device.clone(),
            mount_point: partition.mount_point.clone(),
            reason,
        };
        fs::create_dir_all(&partition.mount_point).map_err(|error| mount_error(error.to_string()))?;
        let result = if read_only {
            run!(["mount", "-o", "ro", &partition.device, &partition.mount_point])
        } else {
            run!(["mount", &partition.device, &partition.mount_point])
        };
        result.map_err(|error| mount_error(error.to_string()))?;
        Ok(partition.mount_point.clone())
    }

    fn umount_fs(&self, partition: &Partition) -> Result<(), PartitionError> {
        run!(["umount", &partition.mount_point]).map_err(|error| PartitionError::Unmount {
            mount_point: partition.mount_point.clone(),
            reason: error.to_string(),
        })?;
        Ok(())
    }

    fn resize_partition(&self, partition: &Partition) -> Result<(), PartitionError> {
        let resize_error = |reason: String| PartitionError::Resize {
            device: partition.device.clone(),
            reason,
        };
        // `resize2fs` refuses to touch a filesystem that has not been checked.
        run!([E2FSCK, "-fp", &partition.device])
            .map_err(|error| resize_error(error.to_string()))?;
        run!([RESIZE2FS, &partition.device]).map_err(|error| resize_error(error.to_string()))?;
        Ok(())
    }

    fn switch_partition(&self, partition: &Partition) -> Result<Partition, PartitionError> {
        // Everything written to the target must be on disk before the
        // selection names it.
        nix::unistd::sync();
        let mut env = match BootEnv::load(&self.boot_env_path) {
            Ok(env) => env,
            Err(BootEnvError::Io(error)) if error.kind() == io::ErrorKind::NotFound => {
                BootEnv::new()
            }
            Err(source) => {
                return Err(PartitionError::Switch {
                    target: partition.set,
                    source,
                })
            }
        };
        env.set(
            BOOTPART_KEY,
            match partition.set {
                PartitionSet::A => BOOTPART_A,
                PartitionSet::B => BOOTPART_B,
            },
        );
        env.save(&self.boot_env_path)
            .map_err(|source| PartitionError::Switch {
                target: partition.set,
                source,
            })?;
        info!("boot selection switched to system {}", partition.set.as_str());
        self.active_partition()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager(dir: &Path) -> LinuxPartitionManager {
        let partitions = Partitions::new(
            dir.join("system-a.img"),
            dir.join("system-b.img"),
            dir.join("mounts"),
        );
        LinuxPartitionManager::new(partitions, dir.join("bootpart.default.env"))
    }

    #[test]
    fn test_selection_resolution() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bootpart.default.env"), "bootpart=2\n").unwrap();
        let manager = test_manager(dir.path());
        assert_eq!(manager.active_partition().unwrap().set, PartitionSet::A);
        assert_eq!(
            manager.find_unused_partition().unwrap().set,
            PartitionSet::B
        );
    }

    #[test]
    fn test_invalid_selection() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bootpart.default.env"), "bootpart=7\n").unwrap();
        let manager = test_manager(dir.path());
        assert!(matches!(
            manager.active_partition(),
            Err(PartitionError::InvalidBootSelection { .. })
        ));
    }

    #[test]
    fn test_same_device_is_inconsistent() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bootpart.default.env"), "bootpart=2\n").unwrap();
        let partitions = Partitions::new(
            dir.path().join("system.img"),
            dir.path().join("system.img"),
            dir.path().join("mounts"),
        );
        let manager =
            LinuxPartitionManager::new(partitions, dir.path().join("bootpart.default.env"));
        assert!(matches!(
            manager.find_unused_partition(),
            Err(PartitionError::NoUnusedPartition { .. })
        ));
    }

    #[test]
    fn test_switch_flips_selection() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("bootpart.default.env");
        fs::write(&env_path, "bootpart=2\n").unwrap();
        let manager = test_manager(dir.path());

        let target = manager.find_unused_partition().unwrap();
        let selected = manager.switch_partition(&target).unwrap();

        assert_eq!(selected.set, PartitionSet::B);
        assert_eq!(manager.active_partition().unwrap().set, PartitionSet::B);
        assert_eq!(fs::read_to_string(&env_path).unwrap(), "bootpart=3\n");
        // The temporary file of the atomic replace must be gone.
        assert!(!dir.path().join("bootpart.default.env.new").exists());
    }

    #[test]
    fn test_crash_before_switch_leaves_selection() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("bootpart.default.env");
        fs::write(&env_path, "bootpart=2\n").unwrap();
        // A crash before the switch may leave a partially written `.new`
        // file behind; the selection itself must be untouched.
        fs::write(dir.path().join("bootpart.default.env.new"), "bootp").unwrap();
        let manager = test_manager(dir.path());
        assert_eq!(manager.active_partition().unwrap().set, PartitionSet::A);

        // Recovery: the next switch replaces the stale temporary file.
        let target = manager.find_unused_partition().unwrap();
        manager.switch_partition(&target).unwrap();
        assert_eq!(manager.active_partition().unwrap().set, PartitionSet::B);
        assert!(!dir.path().join("bootpart.default.env.new").exists());
    }
}
