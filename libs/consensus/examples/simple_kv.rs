//! Simple replicated key-value store using Raft consensus
//!
//! Three nodes share one in-process network. Every node feeds its apply
//! channel into its own `KvStore`, so once a command commits all three
//! stores agree.
//!
//! Run with: cargo run --example simple_kv

use anyhow::{bail, Context};
use parking_lot::RwLock;
use raftkv_consensus::{
    drive_state_machine, InProcessNetwork, LogIndex, NodeId, RaftConfig, RaftError, RaftNode,
    StateMachine,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Simple key-value state machine
#[derive(Debug, Default)]
struct KvStore {
    data: HashMap<String, String>,
    applied: LogIndex,
}

#[derive(Debug, Serialize, Deserialize)]
enum Command {
    Set { key: String, value: String },
    Delete { key: String },
}

impl StateMachine for KvStore {
    fn apply(&mut self, index: LogIndex, command: &[u8]) {
        self.applied = index;
        match serde_json::from_slice::<Command>(command) {
            Ok(Command::Set { key, value }) => {
                println!("  [SM] SET {} = {}", key, value);
                self.data.insert(key, value);
            }
            Ok(Command::Delete { key }) => {
                println!("  [SM] DELETE {}", key);
                self.data.remove(&key);
            }
            Err(e) => println!("  [SM] skipping malformed command at {}: {}", index, e),
        }
    }
}

/// Send a command to whichever node currently leads, following redirects
async fn submit(network: &InProcessNetwork, command: &Command) -> anyhow::Result<LogIndex> {
    let payload = serde_json::to_vec(command)?;
    let mut target = network.node_ids()[0];

    for _ in 0..20 {
        let node = network.node(target).context("unknown node")?;
        match node.propose(payload.clone()).await {
            Ok(proposal) => return Ok(proposal.index),
            Err(RaftError::NotLeader(Some(leader))) => target = leader,
            Err(RaftError::NotLeader(None)) => {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }

    bail!("no leader accepted the command")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "raftkv_consensus=info".into()),
        )
        .init();

    println!("=== RaftKV Consensus Demo ===\n");
    println!("This example shows a 3-node Raft cluster with a KV store.\n");

    let node_ids = vec![NodeId(1), NodeId(2), NodeId(3)];
    let config = RaftConfig::default();
    let network = InProcessNetwork::new();
    let mut stores = Vec::new();

    println!("Starting 3-node Raft cluster...");
    for &id in &node_ids {
        let (apply_tx, apply_rx) = mpsc::channel(config.apply_channel_capacity);
        let node = RaftNode::new(
            id,
            node_ids.clone(),
            config.clone(),
            network.transport(id),
            apply_tx,
        )
        .await?;
        network.register(node);

        let store = Arc::new(RwLock::new(KvStore::default()));
        tokio::spawn(drive_state_machine(apply_rx, Arc::clone(&store)));
        stores.push(store);
        println!("  ✓ {} started", id);
    }

    println!("\nWaiting for leader election...");
    let leader = loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Some(status) = node_ids
            .iter()
            .filter_map(|&id| network.node(id))
            .map(|node| node.status())
            .find(|status| status.is_leader())
        {
            break status;
        }
    };
    println!("  ✓ {} leads in {}\n", leader.id, leader.term);

    println!("Proposing commands to the cluster...\n");
    let commands = [
        Command::Set {
            key: "username".to_string(),
            value: "alice".to_string(),
        },
        Command::Set {
            key: "role".to_string(),
            value: "admin".to_string(),
        },
        Command::Delete {
            key: "username".to_string(),
        },
    ];

    let mut last = LogIndex::ZERO;
    for command in &commands {
        last = submit(&network, command).await?;
        println!("  ✓ {:?} accepted at {}", command, last);
    }

    // Every store catches up to the last accepted command
    while stores.iter().any(|store| store.read().applied < last) {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    println!("\n=== Replicated state ===");
    for (id, store) in node_ids.iter().zip(&stores) {
        let store = store.read();
        let mut keys: Vec<_> = store.data.iter().collect();
        keys.sort();
        println!("  {}: {:?}", id, keys);
    }

    println!("\nShutting down cluster...");
    for id in network.node_ids() {
        if let Some(node) = network.node(id) {
            node.shutdown();
        }
    }
    println!("  ✓ All nodes stopped\n");

    Ok(())
}
