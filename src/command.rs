//! Running `ledgerd` CLI commands against a node.
//!
//! A command is one child-process invocation with the node's `--repodir` and
//! `--cmdapiaddr` flags appended, a deadline, and both output streams fully
//! captured. Nothing here touches shared harness state: the result is a pure
//! function of (binary, args, timeout).

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Stderr content that fails [`CommandResult::assert_success`] even when the
/// exit code is 0.
pub const FORBIDDEN_STDERR_MARKERS: &[&str] = &["CRITICAL", "ERROR", "WARNING", "Error:"];

/// Error raised by the invocation itself. Distinct from a non-zero exit code:
/// the process may never have run, or may have been cut off by the deadline.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The binary could not be spawned.
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The deadline elapsed before the process exited. Output captured up to
    /// that point is preserved on the result.
    #[error("deadline exceeded after {elapsed:?} for command: {command}")]
    DeadlineExceeded { command: String, elapsed: Duration },

    /// Waiting on the process failed.
    #[error("failed waiting for {command}: {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of one CLI invocation. Immutable once constructed, so concurrent
/// readers need no further synchronization.
#[derive(Debug)]
pub struct CommandResult {
    /// The raw input line as given by the caller.
    pub input: String,
    /// Tokenized arguments, before node flags are appended.
    pub args: Vec<String>,
    /// Unix-style exit code, normalized to 0 (success) or 1 (failure).
    pub code: i32,
    /// Invocation-level error, if any. `code == 0` implies this is `None`.
    pub error: Option<CommandError>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl CommandResult {
    /// Returns true if the command exited successfully.
    pub fn success(&self) -> bool {
        self.code == 0 && self.error.is_none()
    }

    /// Captured stdout as a (lossy) string.
    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// Captured stderr as a (lossy) string.
    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    /// Stdout with trailing line breaks removed.
    pub fn stdout_trimmed(&self) -> String {
        self.stdout().trim_matches('\n').to_string()
    }

    /// Stdout split into lines, trailing line breaks removed first.
    pub fn stdout_lines(&self) -> Vec<String> {
        self.stdout_trimmed().lines().map(str::to_string).collect()
    }

    /// Asserts a successful execution: exit code 0, no invocation error, and
    /// stderr free of severity markers. Panics with both streams otherwise.
    pub fn assert_success(&self) -> &Self {
        if let Some(err) = &self.error {
            panic!(
                "command {:?} failed to run: {err}\nstdout: {}\nstderr: {}",
                self.input,
                self.stdout(),
                self.stderr()
            );
        }
        assert_eq!(
            self.code,
            0,
            "command {:?} exited with code {}\nstdout: {}\nstderr: {}",
            self.input,
            self.code,
            self.stdout(),
            self.stderr()
        );
        let stderr = self.stderr();
        for marker in FORBIDDEN_STDERR_MARKERS {
            assert!(
                !stderr.contains(marker),
                "command {:?} wrote {marker} to stderr\nstdout: {}\nstderr: {stderr}",
                self.input,
                self.stdout()
            );
        }
        self
    }

    /// Asserts a failed execution: exit code 1, empty stdout (failing
    /// commands report through stderr only), and stderr containing
    /// `expected`.
    pub fn assert_fail(&self, expected: &str) -> &Self {
        assert!(
            self.error.is_none(),
            "command {:?} had an invocation error: {:?}",
            self.input,
            self.error
        );
        assert_eq!(
            self.code,
            1,
            "command {:?} exited with code {}, expected 1\nstderr: {}",
            self.input,
            self.code,
            self.stderr()
        );
        assert!(
            self.stdout().is_empty(),
            "command {:?} wrote to stdout despite failing: {}",
            self.input,
            self.stdout()
        );
        let stderr = self.stderr();
        assert!(
            stderr.contains(expected),
            "command {:?} stderr does not contain {expected:?}: {stderr}",
            self.input
        );
        self
    }
}

/// Tokenizes caller input. A single element is treated as a whole command
/// line and split on whitespace, so `run(&["chain ls"])` and
/// `run(&["chain", "ls"])` are equivalent.
pub(crate) fn tokenize(args: &[&str]) -> Vec<String> {
    if args.len() == 1 {
        args[0].split_whitespace().map(str::to_string).collect()
    } else {
        args.iter().map(|s| s.to_string()).collect()
    }
}

/// Copies everything `pipe` produces into `buf`, chunk by chunk, so partial
/// output survives a killed process.
pub(crate) async fn drain(
    mut pipe: impl tokio::io::AsyncRead + Unpin,
    buf: Arc<Mutex<Vec<u8>>>,
) {
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.lock().await.extend_from_slice(&chunk[..n]),
        }
    }
}

/// Runs one `ledgerd` command against the node reachable at `cmd_addr`, with
/// `--repodir` and `--cmdapiaddr` appended, bounded by `timeout`.
///
/// On deadline the child is killed, whatever output was captured so far is
/// preserved, the invocation error is set and the exit code reads 1. A
/// non-zero exit is always normalized to 1; the OS-specific code is not
/// recovered.
pub async fn run_node_command(
    binary: &Path,
    args: &[&str],
    repo_dir: &Path,
    cmd_addr: &str,
    timeout: Duration,
    stdin: Option<&[u8]>,
) -> CommandResult {
    let input = args.join(" ");
    let args = tokenize(args);

    let mut full_args = args.clone();
    full_args.push(format!("--repodir={}", repo_dir.display()));
    full_args.push(format!("--cmdapiaddr={cmd_addr}"));

    let command_line = format!("{} {}", binary.display(), full_args.join(" "));
    tracing::debug!("run: {command_line}");

    let mut cmd = Command::new(binary);
    cmd.args(&full_args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            return CommandResult {
                input,
                args,
                code: 1,
                error: Some(CommandError::Spawn {
                    command: command_line,
                    source: err,
                }),
                stdout: Vec::new(),
                stderr: Vec::new(),
            }
        }
    };

    if let Some(bytes) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            // Best effort: a command that exits before reading its input
            // reports that through its own exit code.
            let _ = pipe.write_all(bytes).await;
        }
    }

    let stdout_buf = Arc::new(Mutex::new(Vec::new()));
    let stderr_buf = Arc::new(Mutex::new(Vec::new()));
    let stdout_pipe = child.stdout.take().expect("stdout is piped");
    let stderr_pipe = child.stderr.take().expect("stderr is piped");
    let stdout_task = tokio::spawn(drain(stdout_pipe, Arc::clone(&stdout_buf)));
    let stderr_task = tokio::spawn(drain(stderr_pipe, Arc::clone(&stderr_buf)));

    let started = Instant::now();
    let (code, error) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            join_readers(stdout_task, stderr_task, Duration::from_secs(5)).await;
            (if status.success() { 0 } else { 1 }, None)
        }
        Ok(Err(err)) => {
            join_readers(stdout_task, stderr_task, Duration::from_secs(5)).await;
            (
                1,
                Some(CommandError::Wait {
                    command: command_line,
                    source: err,
                }),
            )
        }
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            // A grandchild may still hold the pipes; take what is buffered.
            join_readers(stdout_task, stderr_task, Duration::from_millis(100)).await;
            (
                1,
                Some(CommandError::DeadlineExceeded {
                    command: command_line,
                    elapsed: started.elapsed(),
                }),
            )
        }
    };

    let stdout = stdout_buf.lock().await.clone();
    let stderr = stderr_buf.lock().await.clone();

    CommandResult {
        input,
        args,
        code,
        error,
        stdout,
        stderr,
    }
}

async fn join_readers(stdout: JoinHandle<()>, stderr: JoinHandle<()>, grace: Duration) {
    let _ = tokio::time::timeout(grace, async {
        let _ = stdout.await;
        let _ = stderr.await;
    })
    .await;
}
