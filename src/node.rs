//! Supervision of a single `ledgerd` daemon process.
//!
//! A [`TestNode`] owns exactly one daemon for the lifetime of one test:
//! configuration, optional one-time init, process start, liveness wait,
//! first-run key import, command execution, and teardown with repository
//! deletion. A daemon that dies mid-test is a test failure; there is no
//! retry-on-crash policy.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::command::{drain, run_node_command, CommandResult};
use crate::env::TestEnv;
use crate::fixtures::TestFixtures;
use crate::probe;

/// Default time budget for a single CLI invocation.
pub const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_secs(60);

/// Stderr content a clean daemon shutdown must not have produced.
const DAEMON_STDERR_MARKERS: &[&str] = &["CRITICAL", "ERROR", "WARNING"];

/// Configuration for one managed node.
///
/// Fields are plain and public: build the defaults with
/// [`NodeConfig::generate`] and override what the test needs
/// (`NodeConfig { mock_mine: false, ..config }`).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Path to the `ledgerd` binary under test.
    pub binary: PathBuf,
    /// Control-API address (`host:port`) the daemon listens on.
    pub cmd_addr: String,
    /// Peer-listen multiaddr the daemon advertises.
    pub swarm_addr: String,
    /// Repository directory, exclusively owned by this node and deleted on
    /// shutdown.
    pub repo_dir: PathBuf,
    /// Wallet file handed to `init`. Opaque to the harness. Empty for none.
    pub wallet_file: String,
    /// Wallet address handed to `init`. Empty for none.
    pub wallet_addr: String,
    /// Genesis file handed to `init`. Opaque to the harness.
    pub genesis_file: PathBuf,
    /// Key files imported one by one on the node's first start.
    pub key_files: Vec<PathBuf>,
    /// Mine without a valid storage market in chain state. Default true.
    pub mock_mine: bool,
    /// Run `ledgerd init` once before the daemon starts. Default true.
    pub should_init: bool,
    /// Time budget per CLI invocation. Default one minute.
    pub cmd_timeout: Duration,
}

impl NodeConfig {
    /// Allocates a fresh config from `env`: free control and swarm ports, a
    /// throwaway repo directory, and the default genesis/key fixtures.
    pub fn generate(env: &TestEnv) -> Result<Self> {
        let fixtures = TestFixtures::new();
        let cmd_port = env.free_port()?;
        let swarm_port = env.free_port()?;
        Ok(Self {
            binary: env.binary().to_path_buf(),
            cmd_addr: format!("127.0.0.1:{cmd_port}"),
            swarm_addr: format!("/ip4/127.0.0.1/tcp/{swarm_port}"),
            repo_dir: env.repo_dir()?,
            wallet_file: String::new(),
            wallet_addr: String::new(),
            genesis_file: fixtures.genesis_file(),
            key_files: fixtures.key_files(),
            mock_mine: true,
            should_init: true,
            cmd_timeout: DEFAULT_CMD_TIMEOUT,
        })
    }
}

/// One managed `ledgerd` node instance.
pub struct TestNode {
    config: NodeConfig,
    label: String,
    process: Option<Child>,
    first_run: bool,
    // Tests read these while the background drain tasks append to them.
    daemon_stdout: Arc<Mutex<Vec<u8>>>,
    daemon_stderr: Arc<Mutex<Vec<u8>>>,
}

impl TestNode {
    /// Creates an unstarted node from `config`.
    pub fn new(config: NodeConfig) -> Self {
        let label = format!("node-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        Self {
            config,
            label,
            process: None,
            first_run: true,
            daemon_stdout: Arc::new(Mutex::new(Vec::new())),
            daemon_stderr: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Allocates a default config from `env` and returns an unstarted node.
    pub fn with_env(env: &TestEnv) -> Result<Self> {
        Ok(Self::new(NodeConfig::generate(env)?))
    }

    /// This node's configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Short label identifying this node in logs and failure messages.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The node's repository directory.
    pub fn repo_dir(&self) -> &Path {
        &self.config.repo_dir
    }

    /// The node's control-API address.
    pub fn cmd_addr(&self) -> &str {
        &self.config.cmd_addr
    }

    /// The node's peer-listen address.
    pub fn swarm_addr(&self) -> &str {
        &self.config.swarm_addr
    }

    /// Starts the daemon, waits for its control API to come up, and performs
    /// the first-run key import. Starting an already-started node is an
    /// error. Any failure here is fatal to test setup.
    pub async fn start(&mut self) -> Result<()> {
        if self.process.is_some() {
            bail!("{} is already running", self.label);
        }

        if self.config.should_init {
            self.run_init()
                .await
                .with_context(|| format!("{} init failed", self.label))?;
        }

        let c = &self.config;
        let mut cmd = Command::new(&c.binary);
        cmd.arg("daemon")
            .arg(format!("--repodir={}", c.repo_dir.display()))
            .arg(format!("--cmdapiaddr={}", c.cmd_addr))
            .arg(format!("--swarmlisten={}", c.swarm_addr));
        if c.mock_mine {
            cmd.arg("--mock-mine");
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to start daemon {}", self.label))?;

        let stdout = child.stdout.take().expect("daemon stdout is piped");
        let stderr = child.stderr.take().expect("daemon stderr is piped");
        tokio::spawn(drain(stdout, Arc::clone(&self.daemon_stdout)));
        tokio::spawn(drain(stderr, Arc::clone(&self.daemon_stderr)));

        self.process = Some(child);
        tracing::info!("{} starting on {}", self.label, c.cmd_addr);

        probe::wait_for_api(&self.config.cmd_addr)
            .await
            .with_context(|| format!("{} failed to start", self.label))?;

        if self.first_run {
            for key_file in self.config.key_files.clone() {
                let path = key_file.display().to_string();
                self.run_success(&["wallet", "import", path.as_str()]).await;
            }
            self.first_run = false;
        }

        tracing::info!("{} ready", self.label);
        Ok(())
    }

    /// Runs `ledgerd init` synchronously, before the daemon exists.
    async fn run_init(&self) -> Result<()> {
        let c = &self.config;
        let args = [
            "init".to_string(),
            format!("--repodir={}", c.repo_dir.display()),
            format!("--cmdapiaddr={}", c.cmd_addr),
            format!("--walletfile={}", c.wallet_file),
            format!("--walletaddr={}", c.wallet_addr),
            format!("--testgenesis={}", !c.wallet_file.is_empty()),
            format!("--genesisfile={}", c.genesis_file.display()),
        ];
        tracing::debug!("run: {} {}", c.binary.display(), args.join(" "));

        let output = Command::new(&c.binary)
            .args(&args)
            .output()
            .await
            .context("failed to spawn init command")?;
        if !output.status.success() {
            bail!(
                "init exited with {}:\n{}{}",
                output.status,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    /// Executes a CLI command against this node. A single-element `args` is
    /// split on whitespace, so `run(&["chain ls"])` works.
    pub async fn run(&self, args: &[&str]) -> CommandResult {
        self.run_with_stdin(None, args).await
    }

    /// Like [`TestNode::run`], with `stdin` piped to the command.
    pub async fn run_with_stdin(&self, stdin: Option<&[u8]>, args: &[&str]) -> CommandResult {
        run_node_command(
            &self.config.binary,
            args,
            &self.config.repo_dir,
            &self.config.cmd_addr,
            self.config.cmd_timeout,
            stdin,
        )
        .await
    }

    /// Runs a command and asserts it succeeded.
    pub async fn run_success(&self, args: &[&str]) -> CommandResult {
        let result = self.run(args).await;
        result.assert_success();
        result
    }

    /// Runs a command and asserts it failed with `expected` on stderr.
    pub async fn run_fail(&self, expected: &str, args: &[&str]) -> CommandResult {
        let result = self.run(args).await;
        result.assert_fail(expected);
        result
    }

    /// Runs a command, asserts success, and returns the stdout lines.
    pub async fn run_success_lines(&self, args: &[&str]) -> Vec<String> {
        self.run_success(args).await.stdout_lines()
    }

    /// Runs a command, asserts success, and returns the first stdout line.
    pub async fn run_success_first_line(&self, args: &[&str]) -> String {
        self.run_success_lines(args)
            .await
            .into_iter()
            .next()
            .unwrap_or_default()
    }

    /// Everything the daemon itself has written to stdout so far.
    pub async fn read_stdout(&self) -> String {
        String::from_utf8_lossy(&self.daemon_stdout.lock().await).to_string()
    }

    /// Everything the daemon itself has written to stderr so far.
    pub async fn read_stderr(&self) -> String {
        String::from_utf8_lossy(&self.daemon_stderr.lock().await).to_string()
    }

    /// Reads the node's `config.toml` as an opaque TOML document.
    pub fn config_toml(&self) -> Result<toml::Value> {
        let path = self.config.repo_dir.join("config.toml");
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&raw).context("undecodable config.toml")
    }

    /// Terminates the daemon with SIGTERM and deletes the repository
    /// directory. The common teardown path.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.assert_repo_dir_configured();
        if let Err(err) = self.signal(Signal::SIGTERM) {
            tracing::error!(
                "{} daemon stderr:\n{}",
                self.label,
                self.read_stderr().await
            );
            return Err(err).with_context(|| format!("failed to kill daemon {}", self.label));
        }
        self.reap().await;
        self.remove_repo_dir();
        Ok(())
    }

    /// SIGTERM teardown that additionally asserts the daemon's stderr stayed
    /// clean of severity markers.
    pub async fn shutdown_success(&mut self) {
        self.assert_repo_dir_configured();
        self.signal(Signal::SIGTERM)
            .unwrap_or_else(|err| panic!("failed to kill daemon {}: {err}", self.label));
        self.reap().await;

        let stderr = self.read_stderr().await;
        for marker in DAEMON_STDERR_MARKERS {
            assert!(
                !stderr.contains(marker),
                "{} daemon wrote {marker} to stderr:\n{stderr}",
                self.label
            );
        }
        self.remove_repo_dir();
    }

    /// Interrupts the daemon with SIGINT instead of SIGTERM, for tests that
    /// want to observe graceful-exit behavior.
    pub async fn shutdown_easy(&mut self) {
        self.assert_repo_dir_configured();
        self.signal(Signal::SIGINT)
            .unwrap_or_else(|err| panic!("failed to interrupt daemon {}: {err}", self.label));
        self.reap().await;
        self.remove_repo_dir();
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        let child = self
            .process
            .as_ref()
            .with_context(|| format!("{} is not running", self.label))?;
        let pid = child
            .id()
            .with_context(|| format!("{} has already exited", self.label))?;
        kill(Pid::from_raw(pid as i32), signal)
            .with_context(|| format!("failed to signal {}", self.label))?;
        Ok(())
    }

    async fn reap(&mut self) {
        if let Some(mut child) = self.process.take() {
            let _ = child.wait().await;
        }
    }

    /// Shutting down a node that never had a repo directory configured is a
    /// programming error; deleting nothing quietly would hide it.
    fn assert_repo_dir_configured(&self) {
        assert!(
            !self.config.repo_dir.as_os_str().is_empty(),
            "{} has no repo directory configured",
            self.label
        );
    }

    fn remove_repo_dir(&mut self) {
        let _ = std::fs::remove_dir_all(&self.config.repo_dir);
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        // Best effort: a test that panicked before shutdown must not leak a
        // running daemon.
        if let Some(child) = self.process.as_ref() {
            if let Some(pid) = child.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::TestEnv;

    fn stub_config() -> NodeConfig {
        NodeConfig {
            binary: PathBuf::from("/bin/true"),
            cmd_addr: "127.0.0.1:0".to_string(),
            swarm_addr: "/ip4/127.0.0.1/tcp/0".to_string(),
            repo_dir: PathBuf::new(),
            wallet_file: String::new(),
            wallet_addr: String::new(),
            genesis_file: PathBuf::new(),
            key_files: Vec::new(),
            mock_mine: true,
            should_init: false,
            cmd_timeout: DEFAULT_CMD_TIMEOUT,
        }
    }

    #[test]
    fn generated_config_has_documented_defaults() {
        let env = TestEnv::with_binary("/bin/true");
        let config = NodeConfig::generate(&env).unwrap();

        assert!(config.mock_mine);
        assert!(config.should_init);
        assert_eq!(config.cmd_timeout, DEFAULT_CMD_TIMEOUT);
        assert!(config.cmd_addr.starts_with("127.0.0.1:"));
        assert!(config.swarm_addr.starts_with("/ip4/127.0.0.1/tcp/"));
        assert_eq!(config.key_files.len(), crate::fixtures::DEFAULT_KEY_COUNT);
        assert!(config.repo_dir.is_dir());

        std::fs::remove_dir_all(&config.repo_dir).unwrap();
    }

    #[test]
    fn generated_configs_never_share_a_repo_dir() {
        let env = TestEnv::with_binary("/bin/true");
        let first = NodeConfig::generate(&env).unwrap();
        let second = NodeConfig::generate(&env).unwrap();

        assert_ne!(first.repo_dir, second.repo_dir);

        std::fs::remove_dir_all(&first.repo_dir).unwrap();
        std::fs::remove_dir_all(&second.repo_dir).unwrap();
    }

    #[tokio::test]
    #[should_panic(expected = "has no repo directory configured")]
    async fn shutdown_without_repo_dir_fails_loudly() {
        let mut node = TestNode::new(stub_config());
        let _ = node.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_of_unstarted_node_errors() {
        let mut config = stub_config();
        config.repo_dir = std::env::temp_dir().join("ledgerd-test-unstarted");
        std::fs::create_dir_all(&config.repo_dir).unwrap();

        let mut node = TestNode::new(config);
        let err = node.shutdown().await.unwrap_err();
        assert!(err.to_string().contains("failed to kill daemon"));

        let _ = std::fs::remove_dir_all(std::env::temp_dir().join("ledgerd-test-unstarted"));
    }
}
