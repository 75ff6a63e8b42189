use std::time::Duration;

use rand::seq::SliceRandom;
use strum_macros::{Display, EnumString};

use crate::discovery::{RegionInfo, RegionStatus};
use crate::error::{CResult, Error};
use crate::server::client::Client;
use crate::server::protocol::{Request, Response};

/// The consistency level a client requests for a read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
pub enum ConsistencyLevel {
    /// Served by the shard leader.
    #[strum(serialize = "LINEARIZABLE")]
    Linearizable,

    /// Served by the client DC's primary follower, falling back to the
    /// leader.
    #[strum(serialize = "SEQUENTIAL")]
    Sequential,

    /// Served by any active slave or secondary follower, preferring the
    /// client's DC.
    #[strum(serialize = "EVENTUAL")]
    Eventual,
}

/// Picks the read target for a consistency level from a discovery snapshot.
/// Returns None when the snapshot holds no suitable node.
pub fn pick_read<'a>(
    regions: &'a [RegionInfo],
    level: ConsistencyLevel,
    dc_id: &str,
) -> Option<&'a RegionInfo> {
    let leader = |regions: &'a [RegionInfo]| {
        let leaders: Vec<&RegionInfo> =
            regions.iter().filter(|r| r.status == RegionStatus::Leader).collect();
        // Conflicting leader reports are transient; prefer the local DC.
        leaders
            .iter()
            .find(|r| r.dc_id == dc_id)
            .copied()
            .or_else(|| leaders.first().copied())
    };

    match level {
        ConsistencyLevel::Linearizable => leader(regions),
        ConsistencyLevel::Sequential => regions
            .iter()
            .find(|r| r.status == RegionStatus::PrimaryFollower && r.dc_id == dc_id)
            .or_else(|| leader(regions)),
        ConsistencyLevel::Eventual => {
            let eligible: Vec<&RegionInfo> = regions
                .iter()
                .filter(|r| {
                    matches!(
                        r.status,
                        RegionStatus::ActiveSlave | RegionStatus::SecondaryFollower
                    )
                })
                .collect();
            let local: Vec<&RegionInfo> =
                eligible.iter().filter(|r| r.dc_id == dc_id).copied().collect();
            let pool = if local.is_empty() { &eligible } else { &local };
            pool.choose(&mut rand::thread_rng()).copied()
        }
    }
}

/// Picks the write target: the leader, nothing else.
pub fn pick_write(regions: &[RegionInfo]) -> Option<&RegionInfo> {
    regions.iter().find(|r| r.status == RegionStatus::Leader)
}

/// Routes requests for one shard using the discovery service, re-resolving
/// the leader on NotLeader redirects with a bounded number of retries.
pub struct Router {
    discovery_endpoints: Vec<String>,
    dc_id: String,
    database: String,
    vbucket: u32,
    timeout: Duration,
    max_retries: u32,
}

impl Router {
    pub fn new(
        discovery_endpoints: Vec<String>,
        dc_id: &str,
        database: &str,
        vbucket: u32,
        timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Router {
            discovery_endpoints,
            dc_id: dc_id.to_string(),
            database: database.to_string(),
            vbucket,
            timeout,
            max_retries,
        }
    }

    /// The discovery snapshot for this shard, from the first endpoint that
    /// answers.
    pub async fn regions(&self) -> CResult<Vec<RegionInfo>> {
        let mut last_err = Error::Unreachable("no discovery endpoints".to_string());
        for endpoint in &self.discovery_endpoints {
            match Client::connect(endpoint, self.timeout).await {
                Ok(mut client) => {
                    match client
                        .get_cluster_info(
                            None,
                            Some(self.database.clone()),
                            Some(self.vbucket),
                        )
                        .await
                    {
                        Ok(regions) => return Ok(regions),
                        Err(err) => last_err = err,
                    }
                }
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    /// Executes a read at the given consistency level.
    pub async fn read(&self, level: ConsistencyLevel, request: Request) -> CResult<Response> {
        let regions = self.regions().await?;
        let target = pick_read(&regions, level, &self.dc_id)
            .ok_or_else(|| Error::Unreachable(format!("no {} target for shard", level)))?;
        let mut client = Client::connect(&target.node_address, self.timeout).await?;
        client.call(request).await
    }

    /// Executes a write against the leader. On a NotLeader redirect the
    /// discovery view is refreshed and the hinted leader tried, a bounded
    /// number of times.
    pub async fn write(&self, request: Request) -> CResult<Response> {
        let mut regions = self.regions().await?;
        let mut hint = 0u64;

        for attempt in 0..=self.max_retries {
            let target = regions
                .iter()
                .find(|r| hint != 0 && r.node_id == hint)
                .or_else(|| pick_write(&regions))
                .ok_or_else(|| Error::Unreachable("no leader for shard".to_string()))?;

            let mut client = Client::connect(&target.node_address, self.timeout).await?;
            match client.call(request.clone()).await {
                Err(Error::NotLeader { leader }) if attempt < self.max_retries => {
                    log::debug!(
                        "{} is not leader (hint {}), refreshing discovery",
                        target.node_address,
                        leader
                    );
                    hint = leader;
                    regions = self.regions().await?;
                }
                other => return other,
            }
        }
        Err(Error::NotLeader { leader: hint })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(dc: &str, addr: &str, status: RegionStatus, node_id: u64) -> RegionInfo {
        let mut r = RegionInfo::new(dc, addr, "D", 0);
        r.status = status;
        r.node_id = node_id;
        r
    }

    fn shard() -> Vec<RegionInfo> {
        vec![
            region("A", "leader:1", RegionStatus::Leader, 1),
            region("A", "pf-a:1", RegionStatus::PrimaryFollower, 2),
            region("B", "pf-b:1", RegionStatus::PrimaryFollower, 3),
            region("B", "sf-b:1", RegionStatus::SecondaryFollower, 4),
            region("A", "slave-a:1", RegionStatus::ActiveSlave, 0),
            region("B", "slave-b:1", RegionStatus::ActiveSlave, 0),
            region("A", "dead:1", RegionStatus::Inactive, 0),
        ]
    }

    #[test]
    fn linearizable_targets_leader() {
        let regions = shard();
        let target = pick_read(&regions, ConsistencyLevel::Linearizable, "B").unwrap();
        assert_eq!(target.node_address, "leader:1");
    }

    #[test]
    fn sequential_prefers_local_primary_follower() {
        let regions = shard();
        let target = pick_read(&regions, ConsistencyLevel::Sequential, "B").unwrap();
        assert_eq!(target.node_address, "pf-b:1");

        // Without a local primary follower, fall back to the leader.
        let regions: Vec<RegionInfo> =
            shard().into_iter().filter(|r| r.node_address != "pf-b:1").collect();
        let target = pick_read(&regions, ConsistencyLevel::Sequential, "B").unwrap();
        assert_eq!(target.node_address, "leader:1");
    }

    #[test]
    fn eventual_prefers_local_slaves() {
        let regions = shard();
        for _ in 0..16 {
            let target = pick_read(&regions, ConsistencyLevel::Eventual, "B").unwrap();
            assert!(["slave-b:1", "sf-b:1"].contains(&target.node_address.as_str()));
        }

        // A DC with no eligible node falls through to any of them.
        let target = pick_read(&regions, ConsistencyLevel::Eventual, "C").unwrap();
        assert!(matches!(
            target.status,
            RegionStatus::ActiveSlave | RegionStatus::SecondaryFollower
        ));
    }

    #[test]
    fn eventual_never_targets_inactive() {
        let regions = vec![
            region("A", "dead:1", RegionStatus::Inactive, 0),
            region("A", "leader:1", RegionStatus::Leader, 1),
        ];
        assert!(pick_read(&regions, ConsistencyLevel::Eventual, "A").is_none());
    }

    #[test]
    fn writes_target_leader_only() {
        let regions = shard();
        assert_eq!(pick_write(&regions).unwrap().node_address, "leader:1");

        let no_leader: Vec<RegionInfo> =
            shard().into_iter().filter(|r| r.status != RegionStatus::Leader).collect();
        assert!(pick_write(&no_leader).is_none());
    }

    #[test]
    fn level_names() {
        use std::str::FromStr;
        assert_eq!(ConsistencyLevel::Linearizable.to_string(), "LINEARIZABLE");
        assert_eq!(
            ConsistencyLevel::from_str("EVENTUAL").unwrap(),
            ConsistencyLevel::Eventual
        );
    }
}
