//! Test fixtures: binary lookup and default genesis/key material.
//!
//! Fixture files are opaque to the harness; they are only ever passed to the
//! node as paths.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

/// Number of default key-pair fixtures imported on a node's first start.
pub const DEFAULT_KEY_COUNT: usize = 5;

/// Locations of committed test data and of the `ledgerd` binary under test.
pub struct TestFixtures {
    project_root: PathBuf,
}

impl TestFixtures {
    /// Creates a new fixtures instance rooted at this crate.
    pub fn new() -> Self {
        Self {
            project_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")),
        }
    }

    /// Returns the project root path.
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Returns the committed fixtures directory.
    pub fn fixtures_dir(&self) -> PathBuf {
        self.project_root.join("fixtures")
    }

    /// Default genesis fixture. Includes all test addresses.
    pub fn genesis_file(&self) -> PathBuf {
        self.fixtures_dir().join("genesis.json")
    }

    /// Default key-pair fixtures imported on first run.
    pub fn key_files(&self) -> Vec<PathBuf> {
        (0..DEFAULT_KEY_COUNT)
            .map(|i| self.fixtures_dir().join(format!("keys/testkey{i}.json")))
            .collect()
    }
}

impl Default for TestFixtures {
    fn default() -> Self {
        Self::new()
    }
}

/// Locates the `ledgerd` binary under test.
///
/// `LEDGERD_BIN` wins when set; otherwise the workspace `target/debug` and
/// `target/release` outputs are tried in that order.
pub fn node_binary() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("LEDGERD_BIN") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        bail!("LEDGERD_BIN points at {} but nothing is there", path.display());
    }

    let root = TestFixtures::new().project_root().to_path_buf();
    for profile in ["debug", "release"] {
        let candidate = root.join("target").join(profile).join("ledgerd");
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "ledgerd binary not found under {}. Build it first or set LEDGERD_BIN.",
        root.join("target").display()
    )
}

/// Command lines shared across scenarios and tests.
pub mod commands {
    /// Mine a single block.
    pub const MINE_ONCE: &[&str] = &["mining", "once"];
    /// List connected peers.
    pub const SWARM_PEERS: &[&str] = &["swarm", "peers"];
    /// List the chain, newest tipset first, one JSON array per line.
    pub const CHAIN_LS_JSON: &[&str] = &["chain", "ls", "--enc=json"];
    /// Add a new wallet address.
    pub const WALLET_NEW_ADDR: &[&str] = &["wallet", "addrs", "new"];
}
