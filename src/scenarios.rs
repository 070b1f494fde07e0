//! Multi-step flows composed from the node, command, and convergence
//! primitives: funding by mining, miner registration, ask/bid placement,
//! data import, and the full two-node deal flow. These are consumers of the
//! harness core, not part of it.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

use crate::command::CommandResult;
use crate::fixtures::commands::{MINE_ONCE, SWARM_PEERS, WALLET_NEW_ADDR};
use crate::node::TestNode;

/// Identity reported by the `id` command.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeIdentity {
    /// Peer ID of the node.
    #[serde(rename = "ID")]
    pub id: String,
    /// Addresses the node advertises, in the order the node reports them.
    #[serde(rename = "Addresses", default)]
    pub addresses: Vec<String>,
}

/// Receipt printed by `message wait --receipt=true --message=false`.
#[derive(Debug, Clone, Deserialize)]
struct MessageReceipt {
    #[serde(rename = "ExitCode")]
    exit_code: i64,
}

impl TestNode {
    /// This node's identity as reported by `id`.
    pub async fn identity(&self) -> Result<NodeIdentity> {
        let out = self.run_success(&["id"]).await;
        serde_json::from_str(&out.stdout()).context("undecodable id output")
    }

    /// Peer ID of this node.
    pub async fn get_id(&self) -> Result<String> {
        Ok(self.identity().await?.id)
    }

    /// First advertised address of this node.
    pub async fn get_address(&self) -> Result<String> {
        self.identity()
            .await?
            .addresses
            .into_iter()
            .next()
            .context("id reported no addresses")
    }

    /// Connects this node to `remote` and asserts both peer lists reference
    /// the other side.
    pub async fn connect_success(&self, remote: &TestNode) -> Result<CommandResult> {
        let remote_addr = remote.get_address().await?;
        let out = self
            .run_success(&["swarm", "connect", remote_addr.as_str()])
            .await;

        let peers_here = self.run_success(SWARM_PEERS).await;
        let peers_there = remote.run_success(SWARM_PEERS).await;

        let remote_id = remote.get_id().await?;
        assert!(
            peers_here.stdout().contains(&remote_id),
            "{} does not list {} as a peer:\n{}",
            self.label(),
            remote.label(),
            peers_here.stdout()
        );

        let local_id = self.get_id().await?;
        assert!(
            peers_there.stdout().contains(&local_id),
            "{} does not list {} as a peer:\n{}",
            remote.label(),
            self.label(),
            peers_there.stdout()
        );

        Ok(out)
    }

    /// First address in the node's wallet. With the default config this is
    /// one of the imported key fixtures, funded by the test genesis.
    pub async fn wallet_default_addr(&self) -> Result<String> {
        let addr = self
            .run_success_first_line(&["wallet", "addrs", "ls"])
            .await;
        ensure!(!addr.is_empty(), "wallet holds no addresses");
        Ok(addr)
    }

    /// Adds a new address to the node's wallet and returns it.
    pub async fn create_wallet_addr(&self) -> String {
        let out = self.run_success(WALLET_NEW_ADDR).await;
        let addr = out.stdout_trimmed();
        assert!(!addr.is_empty(), "wallet addrs new returned an empty address");
        addr
    }

    /// Registers a new miner funded from `from_addr` and returns the miner
    /// address.
    ///
    /// The creation command and the mine that flushes it out of the message
    /// pool run concurrently. `mpool --wait-for-count=1` is the barrier: the
    /// mine only fires once the pool has acknowledged the pending creation
    /// message, never on the strength of task scheduling order.
    pub async fn create_miner_addr(&self, from_addr: &str) -> String {
        // Creation costs money.
        self.run_success(MINE_ONCE).await;

        let create = async {
            let out = self
                .run_success(&["miner", "create", "--from", from_addr, "1000000", "1000"])
                .await;
            let addr = out.stdout_trimmed();
            assert!(!addr.is_empty(), "miner create returned an empty address");
            addr
        };
        let flush = async {
            self.run_success(&["mpool", "--wait-for-count=1"]).await;
            self.run_success(MINE_ONCE).await;
        };

        let (miner_addr, ()) = tokio::join!(create, flush);
        miner_addr
    }

    /// Blocks until the message `msg_cid` is included in a block, then
    /// checks its receipt for a zero exit code.
    pub async fn wait_for_message_success(&self, msg_cid: &str) -> Result<()> {
        let out = self
            .run_success(&[
                "message",
                "wait",
                msg_cid,
                "--receipt=true",
                "--message=false",
            ])
            .await;
        let receipt: MessageReceipt =
            serde_json::from_str(&out.stdout_trimmed()).context("undecodable message receipt")?;
        ensure!(
            receipt.exit_code == 0,
            "message {msg_cid} landed with exit code {}",
            receipt.exit_code
        );
        Ok(())
    }

    /// Mines one block and waits up to `wait` for it to reach every peer.
    pub async fn mine_and_propagate(&self, wait: Duration, peers: &[&TestNode]) {
        self.run_success(MINE_ONCE).await;
        if peers.is_empty() {
            return;
        }
        self.must_have_chain_head_by(wait, peers).await;
    }

    /// Mines `rewards` blocks, propagating each to `peers` before the next.
    pub async fn make_money(&self, rewards: u32, peers: &[&TestNode]) {
        for _ in 0..rewards {
            self.mine_and_propagate(Duration::from_secs(1), peers).await;
        }
    }

    /// Makes a deal with `miner` over `deal_data` and returns the data CID:
    /// fund both sides, register the miner, place ask and bid, import the
    /// data over stdin, propose the deal, and confirm it with `query-deal`.
    pub async fn make_deal(
        &self,
        deal_data: &str,
        miner: &TestNode,
        from_addr: &str,
    ) -> Result<String> {
        // Both sides need funds before they can place orders.
        self.make_money(2, &[]).await;
        miner.make_money(2, &[]).await;

        // How long miner blocks get to reach the other node.
        let prop_wait = Duration::from_secs(3);

        let miner_addr = miner.create_miner_addr(from_addr).await;

        let ask = miner
            .run_success(&[
                "miner",
                "add-ask",
                "--from",
                from_addr,
                miner_addr.as_str(),
                "1200",
                "1",
            ])
            .await;
        miner.mine_and_propagate(prop_wait, &[self]).await;
        let ask_cid = ask.stdout_trimmed();
        miner
            .run_success(&["message", "wait", "--return", ask_cid.as_str()])
            .await;

        self.run_success(&["client", "add-bid", "--from", from_addr, "500", "1"])
            .await;
        self.mine_and_propagate(prop_wait, &[miner]).await;

        let import = self
            .run_with_stdin(Some(deal_data.as_bytes()), &["client", "import"])
            .await;
        import.assert_success();
        let data_cid = import.stdout_trimmed();

        let proposal = self
            .run_success(&[
                "client",
                "propose-deal",
                "--ask=0",
                "--bid=0",
                data_cid.as_str(),
            ])
            .await;
        miner.mine_and_propagate(prop_wait, &[self]).await;

        let negotiation_id = proposal
            .stdout_lines()
            .get(1)
            .and_then(|line| line.split_whitespace().nth(1))
            .context("propose-deal output missing a negotiation id")?
            .to_string();
        self.run_success(&["client", "query-deal", negotiation_id.as_str()])
            .await;

        Ok(data_cid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_json_decodes() {
        let identity: NodeIdentity = serde_json::from_str(
            r#"{"ID":"zb2rPeer","Addresses":["/ip4/127.0.0.1/tcp/9000","/ip6/::1/tcp/9000"]}"#,
        )
        .unwrap();
        assert_eq!(identity.id, "zb2rPeer");
        assert_eq!(identity.addresses.len(), 2);
    }

    #[test]
    fn identity_without_addresses_decodes() {
        let identity: NodeIdentity = serde_json::from_str(r#"{"ID":"zb2rPeer"}"#).unwrap();
        assert!(identity.addresses.is_empty());
    }

    #[test]
    fn receipt_exit_code_decodes() {
        let receipt: MessageReceipt =
            serde_json::from_str(r#"{"ExitCode":0,"Return":null}"#).unwrap();
        assert_eq!(receipt.exit_code, 0);
    }
}
