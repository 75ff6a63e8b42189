use std::collections::HashMap;
use std::sync::Arc;

use crate::cluster::nexus::{Nexus, NodeInfo, RaftRole};
use crate::discovery::{RegionInfo, RegionStatus};
use crate::error::{CResult, Error};

/// Wraps the consensus membership surface with the leadership gate and the
/// external status mapping. Membership calls on a non-leader return the
/// leader id as a redirect hint instead of being forwarded.
pub struct ClusterController {
    nexus: Arc<dyn Nexus>,
}

impl ClusterController {
    pub fn new(nexus: Arc<dyn Nexus>) -> Self {
        ClusterController { nexus }
    }

    pub fn node_id(&self) -> u64 {
        self.nexus.node_id()
    }

    pub fn role(&self) -> RaftRole {
        self.nexus.role()
    }

    pub fn is_leader(&self) -> bool {
        self.nexus.role() == RaftRole::Leader
    }

    pub fn leader(&self) -> u64 {
        self.nexus.leader()
    }

    fn require_leader(&self) -> CResult<()> {
        if self.nexus.role() != RaftRole::Leader {
            return Err(Error::NotLeader { leader: self.nexus.leader() });
        }
        Ok(())
    }

    pub fn add_node(&self, node_url: &str) -> CResult<u64> {
        if node_url.is_empty() {
            return Err(Error::InvalidRequest("empty node url".to_string()));
        }
        self.require_leader()?;
        self.nexus.add_node(node_url)
    }

    pub fn remove_node(&self, node_url: &str) -> CResult<()> {
        if node_url.is_empty() {
            return Err(Error::InvalidRequest("empty node url".to_string()));
        }
        self.require_leader()?;
        self.nexus.remove_node(node_url)
    }

    /// Membership is readable from any member.
    pub fn list_nodes(&self) -> CResult<(u64, HashMap<u64, NodeInfo>)> {
        self.nexus.list_nodes()
    }

    /// Maps this member's consensus state to its external region status.
    ///
    /// A follower becomes the PRIMARY_FOLLOWER of its DC iff it has the
    /// lowest node id among the follower members reported there, so the
    /// choice is deterministic from discovery data alone. shard_peers is the
    /// discovery view of the shard; it may or may not include this node's
    /// own last report.
    pub fn derive_status(&self, dc_id: &str, shard_peers: &[RegionInfo]) -> RegionStatus {
        match self.nexus.role() {
            RaftRole::Leader => RegionStatus::Leader,
            RaftRole::Candidate => RegionStatus::Inactive,
            RaftRole::Follower => {
                let my_id = self.nexus.node_id();
                let lowest = shard_peers
                    .iter()
                    .filter(|p| p.dc_id == dc_id && p.node_id != 0 && p.status.is_follower())
                    .map(|p| p.node_id)
                    .chain(std::iter::once(my_id))
                    .min()
                    .unwrap_or(my_id);
                if my_id == lowest {
                    RegionStatus::PrimaryFollower
                } else {
                    RegionStatus::SecondaryFollower
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::nexus::LocalNexus;

    fn follower_peer(dc: &str, addr: &str, node_id: u64) -> RegionInfo {
        let mut r = RegionInfo::new(dc, addr, "D", 0);
        r.status = RegionStatus::SecondaryFollower;
        r.node_id = node_id;
        r
    }

    #[test]
    fn membership_requires_leader() -> CResult<()> {
        let leader = ClusterController::new(Arc::new(LocalNexus::bootstrap(
            1,
            "http://n1:9020,http://n2:9020",
        )));
        let follower = ClusterController::new(Arc::new(LocalNexus::bootstrap(
            2,
            "http://n1:9020,http://n2:9020",
        )));

        assert_eq!(follower.add_node("http://n3:9020"), Err(Error::NotLeader { leader: 1 }));
        assert_eq!(follower.remove_node("http://n2:9020"), Err(Error::NotLeader { leader: 1 }));

        assert_eq!(leader.add_node("http://n3:9020")?, 3);
        let (leader_id, nodes) = follower.list_nodes()?;
        assert_eq!(leader_id, 1);
        // Each controller wraps its own nexus instance, so the follower's
        // view still has the bootstrap membership.
        assert_eq!(nodes.len(), 2);
        Ok(())
    }

    #[test]
    fn empty_url_rejected() {
        let c = ClusterController::new(Arc::new(LocalNexus::bootstrap(1, "http://n1:9020")));
        assert!(matches!(c.add_node(""), Err(Error::InvalidRequest(_))));
        assert!(matches!(c.remove_node(""), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn status_derivation() {
        let urls = "http://n1:9020,http://n2:9020,http://n3:9020";
        let leader = ClusterController::new(Arc::new(LocalNexus::bootstrap(1, urls)));
        let f2 = ClusterController::new(Arc::new(LocalNexus::bootstrap(2, urls)));
        let f3 = ClusterController::new(Arc::new(LocalNexus::bootstrap(3, urls)));

        assert_eq!(leader.derive_status("A", &[]), RegionStatus::Leader);

        // Node 2 sees follower 3 in its DC: 2 is the lowest, so primary.
        let peers = vec![follower_peer("A", "n3:2891", 3)];
        assert_eq!(f2.derive_status("A", &peers), RegionStatus::PrimaryFollower);

        // Node 3 sees follower 2 in its DC: not the lowest, so secondary.
        let peers = vec![follower_peer("A", "n2:2891", 2)];
        assert_eq!(f3.derive_status("A", &peers), RegionStatus::SecondaryFollower);

        // Followers in other DCs don't compete.
        let peers = vec![follower_peer("B", "n2:2891", 2)];
        assert_eq!(f3.derive_status("A", &peers), RegionStatus::PrimaryFollower);

        // Slaves (node_id 0) don't compete either.
        let mut slave = follower_peer("A", "s1:2891", 0);
        slave.status = RegionStatus::ActiveSlave;
        assert_eq!(f2.derive_status("A", &[slave]), RegionStatus::PrimaryFollower);
    }

    #[test]
    fn removed_member_is_inactive() -> CResult<()> {
        let nexus = Arc::new(LocalNexus::bootstrap(2, "http://n1:9020,http://n2:9020"));
        let c = ClusterController::new(nexus.clone());
        nexus.remove_node("http://n2:9020")?;
        assert_eq!(c.derive_status("A", &[]), RegionStatus::Inactive);
        Ok(())
    }
}
