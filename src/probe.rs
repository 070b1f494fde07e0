//! Control-API liveness probing.
//!
//! A node is considered ready once `GET /api/id` on its control address
//! answers with a decodable JSON object carrying an `ID` field. Individual
//! probe failures (connection refused, malformed body, missing field) are
//! swallowed and retried; only an exhausted budget surfaces as an error.

use std::time::Duration;

use anyhow::{bail, Result};

/// Default number of probe attempts.
pub const DEFAULT_PROBE_ATTEMPTS: u32 = 100;

/// Default spacing between probe attempts. With [`DEFAULT_PROBE_ATTEMPTS`]
/// the startup budget is roughly ten seconds.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Blocks until the control API at `cmd_addr` reports a well-formed identity,
/// or the default budget is exhausted.
pub async fn wait_for_api(cmd_addr: &str) -> Result<()> {
    wait_for_api_with(cmd_addr, DEFAULT_PROBE_ATTEMPTS, DEFAULT_PROBE_INTERVAL).await
}

/// [`wait_for_api`] with an explicit attempt budget and spacing.
pub async fn wait_for_api_with(cmd_addr: &str, attempts: u32, interval: Duration) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!("http://{cmd_addr}/api/id");

    for _ in 0..attempts {
        match try_api_check(&client, &url).await {
            Ok(()) => return Ok(()),
            Err(err) => tracing::trace!("liveness probe of {url}: {err}"),
        }
        tokio::time::sleep(interval).await;
    }

    bail!(
        "node at {cmd_addr} failed to come online within {:?}",
        interval * attempts
    )
}

async fn try_api_check(client: &reqwest::Client, url: &str) -> Result<()> {
    let response = client.get(url).send().await?;
    let body: serde_json::Value = response.json().await?;
    if body.get("ID").is_none() {
        bail!("liveness check failed: ID field not present");
    }
    Ok(())
}
