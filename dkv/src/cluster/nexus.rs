use std::collections::HashMap;
use std::sync::Mutex;

use serde_derive::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::{CResult, Error};

/// A consensus member's state. Transitional states (elections) map to an
/// INACTIVE region externally.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
pub enum RaftRole {
    Leader,
    Follower,
    Candidate,
}

/// Identifies a consensus member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: u64,
    pub nexus_url: String,
}

/// The membership surface of the embedded consensus module. Consensus itself
/// (log replication, elections) is an external collaborator; this crate only
/// consumes its configuration-change protocol, which serializes membership
/// changes one at a time through the replicated log.
pub trait Nexus: Send + Sync {
    /// This node's member id.
    fn node_id(&self) -> u64;

    /// This node's current consensus state.
    fn role(&self) -> RaftRole;

    /// The current leader's id, 0 when unknown.
    fn leader(&self) -> u64;

    /// Proposes adding a member. Returns the assigned node id; idempotent
    /// for an already-present url.
    fn add_node(&self, nexus_url: &str) -> CResult<u64>;

    /// Proposes removing a member. No-op if absent.
    fn remove_node(&self, nexus_url: &str) -> CResult<()>;

    /// The current membership: the leader id and all members.
    fn list_nodes(&self) -> CResult<(u64, HashMap<u64, NodeInfo>)>;
}

struct Membership {
    next_id: u64,
    nodes: HashMap<u64, NodeInfo>,
}

impl Membership {
    fn find_by_url(&self, nexus_url: &str) -> Option<u64> {
        self.nodes
            .values()
            .find(|n| n.nexus_url == nexus_url)
            .map(|n| n.node_id)
    }

    /// The deterministic leader: the lowest live member id. Stands in for an
    /// elected leader in the in-process nexus.
    fn leader(&self) -> u64 {
        self.nodes.keys().min().copied().unwrap_or(0)
    }
}

/// An in-process nexus: a membership table behind a mutex, so configuration
/// changes serialize exactly like log-ordered ones. Used for single-node
/// deployments and tests; a production shard swaps in the real consensus
/// binding behind the same trait.
pub struct LocalNexus {
    node_id: u64,
    inner: Mutex<Membership>,
}

impl LocalNexus {
    /// Bootstraps membership from a comma-separated peer url list, assigning
    /// ids in list order starting at 1. This node is identified by node_id.
    pub fn bootstrap(node_id: u64, cluster_url: &str) -> Self {
        let mut nodes = HashMap::new();
        let mut next_id = 1;
        for url in cluster_url.split(',').map(str::trim).filter(|u| !u.is_empty()) {
            nodes.insert(next_id, NodeInfo { node_id: next_id, nexus_url: url.to_string() });
            next_id += 1;
        }
        if nodes.is_empty() {
            // No configured peers: a single-member group led by this node.
            nodes.insert(node_id, NodeInfo { node_id, nexus_url: String::new() });
            next_id = node_id + 1;
        }
        LocalNexus { node_id, inner: Mutex::new(Membership { next_id, nodes }) }
    }
}

impl Nexus for LocalNexus {
    fn node_id(&self) -> u64 {
        self.node_id
    }

    fn role(&self) -> RaftRole {
        let inner = self.inner.lock().expect("membership poisoned");
        if !inner.nodes.contains_key(&self.node_id) {
            // Not (or no longer) a member: transitional.
            return RaftRole::Candidate;
        }
        if inner.leader() == self.node_id {
            RaftRole::Leader
        } else {
            RaftRole::Follower
        }
    }

    fn leader(&self) -> u64 {
        self.inner.lock().expect("membership poisoned").leader()
    }

    fn add_node(&self, nexus_url: &str) -> CResult<u64> {
        if nexus_url.is_empty() {
            return Err(Error::InvalidRequest("empty node url".to_string()));
        }
        let mut inner = self.inner.lock().expect("membership poisoned");
        if let Some(existing) = inner.find_by_url(nexus_url) {
            return Ok(existing);
        }
        let node_id = inner.next_id;
        inner.next_id += 1;
        inner.nodes.insert(node_id, NodeInfo { node_id, nexus_url: nexus_url.to_string() });
        log::info!("Added node {} as member {}", nexus_url, node_id);
        Ok(node_id)
    }

    fn remove_node(&self, nexus_url: &str) -> CResult<()> {
        let mut inner = self.inner.lock().expect("membership poisoned");
        if let Some(node_id) = inner.find_by_url(nexus_url) {
            inner.nodes.remove(&node_id);
            log::info!("Removed member {} ({})", node_id, nexus_url);
        }
        Ok(())
    }

    fn list_nodes(&self) -> CResult<(u64, HashMap<u64, NodeInfo>)> {
        let inner = self.inner.lock().expect("membership poisoned");
        Ok((inner.leader(), inner.nodes.clone()))
    }
}
