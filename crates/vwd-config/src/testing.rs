//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - A temporary state root with the standard store file layout
//! - A scratch working directory for test files
//!
//! # Usage
//!
//! ```ignore
//! use vwd_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     // env.state_root and env.work_dir are isolated per test
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::{Config, StateConfig};

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Isolated store root directory
    pub state_root: PathBuf,
    /// Scratch working directory for test files
    pub work_dir: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let state_root = root.join(".vwd").join("state");
        let work_dir = root.join("work");

        std::fs::create_dir_all(&state_root)?;
        std::fs::create_dir_all(&work_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            state_root,
            work_dir,
            test_id,
        })
    }

    /// Config pointed at this environment's store root
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.state.root = self.state_root.clone();
        config
    }

    pub fn state(&self) -> StateConfig {
        self.config().state
    }

    /// Create a test file with content
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.work_dir.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.state_root.exists());
        assert!(env.work_dir.exists());
    }

    #[test]
    fn test_environments_are_isolated() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();
        assert_ne!(env1.state_root, env2.state_root);
    }

    #[test]
    fn test_config_points_at_state_root() {
        let env = TestEnvironment::new().unwrap();
        let state = env.state();
        assert!(state.placeholder_path().starts_with(&env.state_root));
        assert!(state.operations_path().starts_with(&env.state_root));
    }

    #[test]
    fn test_create_file() {
        let env = TestEnvironment::new().unwrap();
        let path = env.create_file("src/main.rs", b"fn main() {}").unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::read(&path).unwrap(), b"fn main() {}");
    }
}
