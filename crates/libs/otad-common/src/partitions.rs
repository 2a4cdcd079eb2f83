//! Knowledge about the two root partitions of an A/B system.

use std::os::unix::prelude::FileTypeExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use xscript::{read_str, Run};

/// The `findmnt` executable.
const FINDMNT: &str = "/usr/bin/findmnt";
/// The `lsblk` executable.
const LSBLK: &str = "/usr/bin/lsblk";

/// Identifier of one of the two root partition sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionSet {
    A,
    B,
}

impl PartitionSet {
    pub fn as_str(self) -> &'static str {
        match self {
            PartitionSet::A => "a",
            PartitionSet::B => "b",
        }
    }

    /// The respective other partition set.
    pub fn flipped(self) -> Self {
        match self {
            PartitionSet::A => Self::B,
            PartitionSet::B => Self::A,
        }
    }
}

/// One of the two root partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Partition set this partition belongs to.
    pub set: PartitionSet,
    /// Block device node of the partition.
    pub device: PathBuf,
    /// Scratch path where the partition is mounted for inspection.
    pub mount_point: PathBuf,
}

/// The root partitions managed by Otad.
#[derive(Debug, Clone)]
pub struct Partitions {
    pub system_a: Partition,
    pub system_b: Partition,
}

impl Partitions {
    /// Create partitions from explicit device paths.
    pub fn new(
        system_a: impl Into<PathBuf>,
        system_b: impl Into<PathBuf>,
        mount_root: impl AsRef<Path>,
    ) -> Self {
        let mount_root = mount_root.as_ref();
        Self {
            system_a: Partition {
                set: PartitionSet::A,
                device: system_a.into(),
                mount_point: mount_root.join("system-a"),
            },
            system_b: Partition {
                set: PartitionSet::B,
                device: system_b.into(),
                mount_point: mount_root.join("system-b"),
            },
        }
    }

    /// Load the root partitions based on the given configuration.
    ///
    /// Devices not named in the configuration are derived from the disk the
    /// system has been booted from, assuming the usual layout where the root
    /// partitions are the second and third partition of that disk.
    pub fn from_config(
        config: &PartitionsConfig,
        mount_root: impl AsRef<Path>,
    ) -> Result<Self, PartitionsError> {
        let (system_a, system_b) = match (&config.system_a, &config.system_b) {
            (Some(system_a), Some(system_b)) => (system_a.clone(), system_b.clone()),
            _ => derive_root_partitions()?,
        };
        for device in [&system_a, &system_b] {
            if !is_block_dev(device) {
                return Err(PartitionsError::NotABlockDevice(device.clone()));
            }
        }
        Ok(Self::new(system_a, system_b, mount_root))
    }

    pub fn get(&self, set: PartitionSet) -> &Partition {
        match set {
            PartitionSet::A => &self.system_a,
            PartitionSet::B => &self.system_b,
        }
    }
}

/// Configuration of the root partition devices.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PartitionsConfig {
    /// Block device of system partition A.
    pub system_a: Option<PathBuf>,
    /// Block device of system partition B.
    pub system_b: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum PartitionsError {
    #[error("unable to determine the booted system device: {reason}")]
    NoSystemDevice { reason: String },
    #[error("device {0:?} is not a block device")]
    NotABlockDevice(PathBuf),
}

/// Derive the root partition devices from the booted disk.
fn derive_root_partitions() -> Result<(PathBuf, PathBuf), PartitionsError> {
    let system_dev = find_dev("/")?;
    if !is_block_dev(&system_dev) {
        return Err(PartitionsError::NotABlockDevice(system_dev));
    }
    let parent_dev_name = read_str!([LSBLK, "-no", "PKNAME", &system_dev]).map_err(|error| {
        PartitionsError::NoSystemDevice {
            reason: error.to_string(),
        }
    })?;
    let mut partition_dev_name = parent_dev_name.clone();
    if parent_dev_name.ends_with(|c: char| c.is_ascii_digit()) {
        partition_dev_name.push('p');
    }
    Ok((
        PathBuf::from(format!("/dev/{partition_dev_name}2")),
        PathBuf::from(format!("/dev/{partition_dev_name}3")),
    ))
}

pub fn is_block_dev(dev: impl AsRef<Path>) -> bool {
    let dev = dev.as_ref();
    dev.metadata()
        .map(|metadata| metadata.file_type().is_block_device())
        .unwrap_or(false)
}

/// Find the block device mounted at the given path.
pub fn find_dev(path: impl AsRef<Path>) -> Result<PathBuf, PartitionsError> {
    read_str!([FINDMNT, "-n", "-o", "SOURCE", "--target", path.as_ref()])
        .map(PathBuf::from)
        .map_err(|error| PartitionsError::NoSystemDevice {
            reason: error.to_string(),
        })
}
