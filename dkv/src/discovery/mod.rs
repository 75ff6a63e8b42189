pub mod heartbeat;
pub mod registry;

use serde_derive::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// The externally visible status of a region, i.e. one node's presence in a
/// (dcID, database, vBucket) shard.
///
/// Raft members move between INACTIVE and the three member roles; async
/// slaves move between INACTIVE and ACTIVE_SLAVE. Nodes report their own
/// status; the discovery service only caches what it is told.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum RegionStatus {
    #[strum(serialize = "INACTIVE")]
    Inactive,

    #[strum(serialize = "LEADER")]
    Leader,

    /// The DC-local follower designated to serve sequentially consistent
    /// reads. At most one per (shard, dcID).
    #[strum(serialize = "PRIMARY_FOLLOWER")]
    PrimaryFollower,

    #[strum(serialize = "SECONDARY_FOLLOWER")]
    SecondaryFollower,

    /// An async slave whose lag against its master is within the configured
    /// bound.
    #[strum(serialize = "ACTIVE_SLAVE")]
    ActiveSlave,
}

impl RegionStatus {
    /// Whether this status marks a Raft member (as opposed to an async slave
    /// or an inactive node).
    pub fn is_member(&self) -> bool {
        matches!(
            self,
            RegionStatus::Leader | RegionStatus::PrimaryFollower | RegionStatus::SecondaryFollower
        )
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, RegionStatus::PrimaryFollower | RegionStatus::SecondaryFollower)
    }
}

/// One node's presence in a shard, as reported by the node itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegionInfo {
    pub dc_id: String,

    /// The node's RPC address, the routing target.
    pub node_address: String,

    pub database: String,
    pub vbucket: u32,
    pub status: RegionStatus,

    /// For slaves: the master currently being tailed.
    pub master_host: Option<String>,

    /// For Raft members: the consensus peer set.
    pub nexus_cluster_url: Option<String>,

    /// The member's nexus node id, 0 for async slaves and discovery-only
    /// nodes. Lets followers elect the per-DC primary follower
    /// deterministically (lowest id wins).
    pub node_id: u64,
}

impl RegionInfo {
    pub fn new(dc_id: &str, node_address: &str, database: &str, vbucket: u32) -> Self {
        RegionInfo {
            dc_id: dc_id.to_string(),
            node_address: node_address.to_string(),
            database: database.to_string(),
            vbucket,
            status: RegionStatus::Inactive,
            master_host: None,
            nexus_cluster_url: None,
            node_id: 0,
        }
    }
}

/// The current wall clock as epoch milliseconds, used for heartbeat
/// timestamps.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
