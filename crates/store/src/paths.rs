//! Path resolution for the store's data files.
//!
//! Resolved once by the host from: explicit path > `CHAMBER_DATA_DIR` env >
//! `~/.chamber`. The resulting [`DataPaths`] value is passed to whatever
//! needs a location; nothing reads a global.

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    /// Resolve the data directory. Returns `None` when neither an explicit
    /// path, the env var, nor a home directory is available.
    pub fn resolve(explicit: Option<&Path>) -> Option<Self> {
        let root = if let Some(p) = explicit {
            p.to_path_buf()
        } else if let Ok(env_val) = std::env::var("CHAMBER_DATA_DIR") {
            PathBuf::from(env_val)
        } else {
            dirs::home_dir()?.join(".chamber")
        };
        Some(Self { root })
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("chamber.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Create all required subdirectories under the data dir.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.log_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path_wins() {
        let paths = DataPaths::resolve(Some(Path::new("/tmp/chamber-test"))).unwrap();
        assert_eq!(paths.root(), Path::new("/tmp/chamber-test"));
        assert_eq!(paths.db_path(), PathBuf::from("/tmp/chamber-test/chamber.db"));
        assert_eq!(paths.log_dir(), PathBuf::from("/tmp/chamber-test/logs"));
    }

    #[test]
    fn ensure_dirs_creates_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::at(dir.path().join("nested"));
        paths.ensure_dirs().unwrap();
        assert!(paths.log_dir().is_dir());
    }
}
