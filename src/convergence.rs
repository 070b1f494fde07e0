//! Chain-head state and cross-node convergence.
//!
//! A node's head is the set of block CIDs in its current head tipset; two
//! heads agree when the sets are equal, regardless of order. The convergence
//! coordinator polls every peer concurrently until all of them report the
//! reference head or a deadline elapses.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::future::try_join_all;
use serde::Deserialize;

use crate::fixtures::commands::CHAIN_LS_JSON;
use crate::node::TestNode;

/// How often each peer is re-polled while waiting for convergence.
pub const CONVERGENCE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Identity of a node's current chain head: the set of block CIDs in the
/// head tipset. Equality is set equality; block order within a tipset never
/// matters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeadState(BTreeSet<String>);

impl HeadState {
    /// Builds the head state for a tipset's blocks.
    pub fn from_blocks(blocks: &[Block]) -> Self {
        blocks.iter().map(|block| block.cid.clone()).collect()
    }

    /// Adds a block CID to the set.
    pub fn insert(&mut self, cid: impl Into<String>) {
        self.0.insert(cid.into());
    }

    /// Returns true if `cid` is part of this head.
    pub fn contains(&self, cid: &str) -> bool {
        self.0.contains(cid)
    }

    /// Number of blocks in the head tipset.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the head holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<String> for HeadState {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Minimal view of a block object as printed by `chain ls --enc=json`. Only
/// the identifier matters to the harness; everything else is passed over.
#[derive(Debug, Clone, Deserialize)]
pub struct Block {
    /// Content identifier of the block.
    pub cid: String,
}

/// Parses `chain ls --enc=json` output: newline-delimited JSON arrays, one
/// tipset per line, newest first.
pub fn parse_chain(output: &str) -> Result<Vec<Vec<Block>>> {
    let mut tipsets = Vec::new();
    for line in output.trim_matches('\n').lines() {
        let blocks: Vec<Block> = serde_json::from_str(line)
            .with_context(|| format!("undecodable tipset line: {line}"))?;
        tipsets.push(blocks);
    }
    Ok(tipsets)
}

/// Concurrently polls every peer until each reports a head equal to
/// `expected`, or `wait` elapses.
///
/// Peers are polled independently at [`CONVERGENCE_POLL_INTERVAL`]; no
/// ordering is implied between them. The expected head is whatever the
/// caller snapshotted before the first poll and is never refreshed, so a
/// reference node that keeps mining during the wait can leave peers
/// converging toward a stale target. On deadline the in-flight polls are
/// simply abandoned.
pub async fn await_convergence<F, Fut>(
    expected: &HeadState,
    pollers: Vec<F>,
    wait: Duration,
) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<HeadState>>,
{
    let waits = pollers.iter().map(|poll| async move {
        loop {
            if poll().await? == *expected {
                return Ok::<(), anyhow::Error>(());
            }
            tokio::time::sleep(CONVERGENCE_POLL_INTERVAL).await;
        }
    });

    match tokio::time::timeout(wait, try_join_all(waits)).await {
        Ok(result) => {
            result?;
            Ok(())
        }
        Err(_) => bail!("timeout waiting for chains to sync"),
    }
}

impl TestNode {
    /// Returns the blocks of this node's current head tipset.
    pub async fn chain_head(&self) -> Result<Vec<Block>> {
        let out = self.run_success(CHAIN_LS_JSON).await;
        parse_chain(&out.stdout())?
            .into_iter()
            .next()
            .context("chain ls printed no tipsets")
    }

    /// This node's current head as a [`HeadState`].
    pub async fn head_state(&self) -> Result<HeadState> {
        Ok(HeadState::from_blocks(&self.chain_head().await?))
    }

    /// Blocks until every peer reports the same chain head as this node, or
    /// panics once `wait` elapses.
    ///
    /// The reference head is read once up front and never refreshed; see
    /// [`await_convergence`] for the sharp edge that implies.
    pub async fn must_have_chain_head_by(&self, wait: Duration, peers: &[&TestNode]) {
        let expected = self
            .head_state()
            .await
            .expect("failed to read the reference chain head");

        let pollers: Vec<_> = peers
            .iter()
            .map(|peer| {
                let peer = *peer;
                move || peer.head_state()
            })
            .collect();

        if let Err(err) = await_convergence(&expected, pollers, wait).await {
            panic!("{err}");
        }
    }
}
