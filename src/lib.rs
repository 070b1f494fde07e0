//! Integration-test harness for the `ledgerd` node.
//!
//! This crate drives one or more independently running `ledgerd` daemons
//! through their command-line interface and verifies observable behavior:
//! process liveness, command output, and cross-node chain convergence under
//! time bounds. Test authors get "start N nodes, connect them, have one mine,
//! assert the others converge" without managing process lifecycle, readiness
//! detection, or synchronization primitives directly.
//!
//! ## Layers
//!
//! 1. **Command execution** - one bounded CLI invocation ([`command`])
//! 2. **Liveness probing** - control-API readiness ([`probe`])
//! 3. **Node supervision** - daemon lifecycle ([`node`])
//! 4. **Convergence** - cross-node chain-head agreement ([`convergence`])
//! 5. **Scenarios** - composed multi-step flows ([`scenarios`])

pub mod assertions;
pub mod command;
pub mod convergence;
pub mod env;
pub mod fixtures;
pub mod node;
pub mod probe;
pub mod scenarios;

pub use command::{CommandError, CommandResult};
pub use convergence::{await_convergence, Block, HeadState};
pub use env::TestEnv;
pub use fixtures::TestFixtures;
pub use node::{NodeConfig, TestNode};
pub use scenarios::NodeIdentity;
