use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::cluster::controller::ClusterController;
use crate::discovery::{now_millis, RegionInfo};
use crate::error::CResult;
use crate::server::client::Client;

/// Supplies a node's current region report. The heartbeater fetches the
/// discovery view of the shard first and hands it in, so implementations can
/// derive rank-dependent roles (the per-DC primary follower) without calling
/// back into discovery themselves.
pub trait StatusSource: Send + Sync {
    fn region_info(&self, shard_peers: &[RegionInfo]) -> RegionInfo;
}

/// The region report of a consensus member, derived from its controller
/// state and the discovery view of the shard.
pub struct MemberStatusSource {
    base: RegionInfo,
    controller: Arc<ClusterController>,
}

impl MemberStatusSource {
    pub fn new(base: RegionInfo, controller: Arc<ClusterController>) -> Self {
        MemberStatusSource { base, controller }
    }
}

impl StatusSource for MemberStatusSource {
    fn region_info(&self, shard_peers: &[RegionInfo]) -> RegionInfo {
        let mut region = self.base.clone();
        region.node_id = self.controller.node_id();
        // The node's own stale report must not compete with itself.
        let peers: Vec<RegionInfo> = shard_peers
            .iter()
            .filter(|p| p.node_address != self.base.node_address)
            .cloned()
            .collect();
        region.status = self.controller.derive_status(&self.base.dc_id, &peers);
        region
    }
}

/// The per-node heartbeat loop: every interval, posts the node's current
/// RegionInfo to every configured discovery endpoint. Fire-and-forget from
/// the node's perspective; failures are logged and the loop continues.
pub struct Heartbeater {
    endpoints: Vec<String>,
    source: Arc<dyn StatusSource>,
    database: String,
    vbucket: u32,
    interval: Duration,
    timeout: Duration,
}

impl Heartbeater {
    pub fn new(
        endpoints: Vec<String>,
        source: Arc<dyn StatusSource>,
        database: &str,
        vbucket: u32,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Heartbeater {
            endpoints,
            source,
            database: database.to_string(),
            vbucket,
            interval,
            timeout,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.beat().await {
                        log::warn!("Heartbeat failed: {}", err);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        log::info!("Heartbeater stopped");
    }

    /// One heartbeat: refresh the shard view, derive the report, post it.
    pub async fn beat(&self) -> CResult<()> {
        let peers = self.shard_peers().await;
        let region = self.source.region_info(&peers);
        let timestamp = now_millis();

        for endpoint in &self.endpoints {
            match Self::post(endpoint, region.clone(), timestamp, self.timeout).await {
                Ok(()) => {}
                Err(err) => {
                    log::debug!("Discovery endpoint {} rejected heartbeat: {}", endpoint, err)
                }
            }
        }
        Ok(())
    }

    /// The discovery view of this node's shard, from the first endpoint that
    /// answers. Empty when none do; role derivation then falls back to
    /// self-only data.
    async fn shard_peers(&self) -> Vec<RegionInfo> {
        for endpoint in &self.endpoints {
            let mut client = match Client::connect(endpoint, self.timeout).await {
                Ok(client) => client,
                Err(_) => continue,
            };
            match client
                .get_cluster_info(None, Some(self.database.clone()), Some(self.vbucket))
                .await
            {
                Ok(regions) => return regions,
                Err(_) => continue,
            }
        }
        Vec::new()
    }

    async fn post(
        endpoint: &str,
        region: RegionInfo,
        timestamp: u64,
        timeout: Duration,
    ) -> CResult<()> {
        let mut client = Client::connect(endpoint, timeout).await?;
        client.update_status(region, timestamp).await
    }
}
