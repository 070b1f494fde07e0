//! Node lifecycle integration tests.
//!
//! These drive a real `ledgerd` binary: start, readiness, command execution,
//! and teardown. They are skipped unless the binary is available.

use std::time::Duration;

use ledgerd_e2e::{fixtures, NodeConfig, TestEnv, TestNode};

/// Skip test if the ledgerd binary is not available.
fn skip_if_missing_binary() -> bool {
    if let Err(err) = fixtures::node_binary() {
        eprintln!("Skipping test: {err}");
        return true;
    }
    false
}

fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}

// ============================================================================
// Startup / Shutdown
// ============================================================================

#[tokio::test]
#[ignore = "requires ledgerd binary"]
async fn test_start_and_shutdown() {
    if skip_if_missing_binary() {
        return;
    }
    init_tracing();

    let env = TestEnv::new().expect("failed to create test env");
    let mut node = TestNode::with_env(&env).expect("failed to configure node");

    node.start().await.expect("node failed to start");

    let id = node.get_id().await.expect("failed to read node id");
    assert!(!id.is_empty(), "node reported an empty peer id");

    let repo = node.repo_dir().to_path_buf();
    assert!(repo.is_dir(), "repo dir should exist while running");

    node.shutdown().await.expect("failed to shut node down");
    assert!(!repo.exists(), "repo dir should be deleted on shutdown");
}

#[tokio::test]
#[ignore = "requires ledgerd binary"]
async fn test_double_start_is_rejected() {
    if skip_if_missing_binary() {
        return;
    }
    init_tracing();

    let env = TestEnv::new().expect("failed to create test env");
    let mut node = TestNode::with_env(&env).expect("failed to configure node");

    node.start().await.expect("node failed to start");

    let err = node.start().await.expect_err("second start should fail");
    assert!(
        err.to_string().contains("already running"),
        "unexpected error: {err}"
    );

    node.shutdown().await.expect("failed to shut node down");
}

#[tokio::test]
#[ignore = "requires ledgerd binary"]
async fn test_shutdown_success_checks_daemon_stderr() {
    if skip_if_missing_binary() {
        return;
    }
    init_tracing();

    let env = TestEnv::new().expect("failed to create test env");
    let mut node = TestNode::with_env(&env).expect("failed to configure node");

    node.start().await.expect("node failed to start");
    node.shutdown_success().await;
}

#[tokio::test]
#[ignore = "requires ledgerd binary"]
async fn test_start_without_init_fails_fast() {
    if skip_if_missing_binary() {
        return;
    }
    init_tracing();

    let env = TestEnv::new().expect("failed to create test env");
    let config = NodeConfig {
        should_init: false,
        ..NodeConfig::generate(&env).expect("failed to configure node")
    };
    let repo = config.repo_dir.clone();

    // A daemon pointed at an uninitialized repo never becomes ready.
    let mut node = TestNode::new(config);
    assert!(node.start().await.is_err());

    let _ = std::fs::remove_dir_all(repo);
}

// ============================================================================
// Command execution
// ============================================================================

#[tokio::test]
#[ignore = "requires ledgerd binary"]
async fn test_id_output_shape() {
    if skip_if_missing_binary() {
        return;
    }
    init_tracing();

    let env = TestEnv::new().expect("failed to create test env");
    let mut node = TestNode::with_env(&env).expect("failed to configure node");
    node.start().await.expect("node failed to start");

    let identity = node.identity().await.expect("failed to parse id output");
    assert!(!identity.id.is_empty());
    assert!(
        !identity.addresses.is_empty(),
        "node advertises no addresses"
    );

    node.shutdown().await.expect("failed to shut node down");
}

#[tokio::test]
#[ignore = "requires ledgerd binary"]
async fn test_unknown_command_fails_with_stderr() {
    if skip_if_missing_binary() {
        return;
    }
    init_tracing();

    let env = TestEnv::new().expect("failed to create test env");
    let mut node = TestNode::with_env(&env).expect("failed to configure node");
    node.start().await.expect("node failed to start");

    let result = node.run(&["no-such-command"]).await;
    assert_eq!(result.code, 1);
    assert!(result.stdout().is_empty());

    node.shutdown().await.expect("failed to shut node down");
}

#[tokio::test]
#[ignore = "requires ledgerd binary"]
async fn test_short_command_timeout_is_reported() {
    if skip_if_missing_binary() {
        return;
    }
    init_tracing();

    let env = TestEnv::new().expect("failed to create test env");
    let config = NodeConfig {
        cmd_timeout: Duration::from_millis(1),
        key_files: Vec::new(),
        ..NodeConfig::generate(&env).expect("failed to configure node")
    };
    let mut node = TestNode::new(config);
    node.start().await.expect("node failed to start");

    let result = node.run(&["chain", "ls", "--enc=json"]).await;
    assert_eq!(result.code, 1);
    assert!(matches!(
        result.error,
        Some(ledgerd_e2e::CommandError::DeadlineExceeded { .. })
    ));

    node.shutdown().await.expect("failed to shut node down");
}

// ============================================================================
// Wallet scenarios
// ============================================================================

#[tokio::test]
#[ignore = "requires ledgerd binary"]
async fn test_create_wallet_addr_is_distinct_across_calls() {
    if skip_if_missing_binary() {
        return;
    }
    init_tracing();

    let env = TestEnv::new().expect("failed to create test env");
    let mut node = TestNode::with_env(&env).expect("failed to configure node");
    node.start().await.expect("node failed to start");

    let first = node.create_wallet_addr().await;
    let second = node.create_wallet_addr().await;
    assert!(!first.is_empty());
    assert_ne!(first, second, "wallet addresses should be fresh");

    node.shutdown().await.expect("failed to shut node down");
}
