//! Plain-text boot environment files.
//!
//! The bootloader reads its root partition selection from a small file of
//! `key=value` entries on the config partition. Updates to this file must be
//! atomic: the file is written to a `.new` sibling, synced, and renamed over
//! the old file, so a crash leaves either the old or the new selection in
//! place, never a torn one.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use thiserror::Error;

/// A boot environment consisting of `key=value` entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootEnv {
    entries: Vec<(String, String)>,
}

#[derive(Debug, Error)]
pub enum BootEnvError {
    #[error("invalid entry without `=`")]
    InvalidEntry,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl BootEnv {
    /// Create an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load an environment from the given path.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BootEnvError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    /// Parse an environment from its textual representation.
    pub fn parse(text: &str) -> Result<Self, BootEnvError> {
        let mut entries = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((name, value)) = line.split_once('=') else {
                return Err(BootEnvError::InvalidEntry);
            };
            entries.push((name.to_owned(), value.to_owned()));
        }
        Ok(Self { entries })
    }

    /// Get the value of an entry.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(entry_name, _)| entry_name == name)
            .map(|(_, value)| value.as_str())
    }

    /// Set the value of an entry, preserving the position of existing entries.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(entry_name, _)| *entry_name == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Save the environment, atomically replacing any previous file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), BootEnvError> {
        let path = path.as_ref();
        let Some(file_name) = path.file_name() else {
            return Err(BootEnvError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "path has no file name",
            )));
        };
        let new_path = path.with_file_name(format!("{}.new", file_name.to_string_lossy()));
        let mut new_file = File::create(&new_path)?;
        for (name, value) in &self.entries {
            writeln!(new_file, "{name}={value}")?;
        }
        new_file.flush()?;
        new_file.sync_all()?;
        drop(new_file);
        fs::rename(&new_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_get() {
        let env = BootEnv::parse("bootpart=2\n\n# comment\nupgrade_available=0\n").unwrap();
        assert_eq!(env.get("bootpart"), Some("2"));
        assert_eq!(env.get("upgrade_available"), Some("0"));
        assert_eq!(env.get("missing"), None);
    }

    #[test]
    fn test_parse_rejects_invalid_entries() {
        assert!(matches!(
            BootEnv::parse("bootpart"),
            Err(BootEnvError::InvalidEntry)
        ));
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut env = BootEnv::parse("bootpart=2\nupgrade_available=0\n").unwrap();
        env.set("bootpart", "3");
        assert_eq!(env.get("bootpart"), Some("3"));
        assert_eq!(env.entries[0].0, "bootpart");
    }

    #[test]
    fn test_save_is_atomic_replace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bootpart.default.env");
        fs::write(&path, "bootpart=2\n").unwrap();
        // A stale temporary file from an interrupted save must not matter.
        fs::write(dir.path().join("bootpart.default.env.new"), "garbage").unwrap();

        let mut env = BootEnv::load(&path).unwrap();
        env.set("bootpart", "3");
        env.save(&path).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "bootpart=3\n");
        assert!(!dir.path().join("bootpart.default.env.new").exists());
    }

    #[test]
    fn test_roundtrip_preserves_unknown_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env");
        let mut env = BootEnv::parse("bootpart=2\ncustom=value\n").unwrap();
        env.set("bootpart", "3");
        env.save(&path).unwrap();
        let reloaded = BootEnv::load(&path).unwrap();
        assert_eq!(reloaded.get("custom"), Some("value"));
        assert_eq!(reloaded.get("bootpart"), Some("3"));
    }
}
