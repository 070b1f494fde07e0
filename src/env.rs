//! Per-test environment allocation.
//!
//! Free ports and repo directories are handed out by an explicit [`TestEnv`]
//! value rather than ambient globals, so tests running in parallel cannot
//! collide on either.

use std::net::TcpListener;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::fixtures;

/// Allocator for the per-node resources a test needs: localhost ports and
/// throwaway repository directories. Construction validates that the node
/// binary exists, so a missing build fails the test before any process work.
#[derive(Debug)]
pub struct TestEnv {
    binary: PathBuf,
}

impl TestEnv {
    /// Creates an environment, locating and validating the `ledgerd` binary.
    pub fn new() -> Result<Self> {
        let binary = fixtures::node_binary()?;
        Ok(Self { binary })
    }

    /// Creates an environment around an explicit binary path, for tests that
    /// bring their own.
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Path to the node binary under test.
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Asks the kernel for a free localhost port.
    pub fn free_port(&self) -> Result<u16> {
        let listener =
            TcpListener::bind("127.0.0.1:0").context("failed to bind an ephemeral port")?;
        Ok(listener.local_addr()?.port())
    }

    /// Allocates a fresh repository directory. The directory is exclusively
    /// owned by one node and deleted by its shutdown, not by drop.
    pub fn repo_dir(&self) -> Result<PathBuf> {
        let dir = tempfile::Builder::new()
            .prefix("ledgerd-test-")
            .tempdir()
            .context("failed to create repo directory")?;
        Ok(dir.keep())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_are_distinct_across_calls() {
        let env = TestEnv::with_binary("/bin/true");
        let first = env.free_port().unwrap();
        let second = env.free_port().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn repo_dirs_are_distinct_and_exist() {
        let env = TestEnv::with_binary("/bin/true");
        let first = env.repo_dir().unwrap();
        let second = env.repo_dir().unwrap();
        assert_ne!(first, second);
        assert!(first.is_dir());
        assert!(second.is_dir());

        std::fs::remove_dir_all(&first).unwrap();
        std::fs::remove_dir_all(&second).unwrap();
    }
}
