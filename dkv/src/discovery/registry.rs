use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::discovery::RegionInfo;
use crate::error::{CResult, Error};

/// (dcID, database, vBucket, nodeAddress) — one entry per node per shard.
type RegionKey = (String, String, u32, String);

struct Tracked {
    region: RegionInfo,
    /// The reporting node's timestamp, enforcing per-region monotonicity.
    timestamp: u64,
    /// Local receive time, the basis for TTL eviction.
    last_heartbeat: Instant,
}

/// The discovery service's region table: a soft-state cache of what nodes
/// last reported about themselves. Stale reads are expected; clients verify
/// against the target node on the actual request path.
pub struct RegionRegistry {
    inner: RwLock<HashMap<RegionKey, Tracked>>,
    ttl: Duration,
}

impl RegionRegistry {
    pub fn new(ttl: Duration) -> Self {
        RegionRegistry { inner: RwLock::new(HashMap::new()), ttl }
    }

    /// Upserts a region report. A timestamp older than the stored one for
    /// the same key is dropped silently: the caller heartbeats fire-and-
    /// forget, a stale report is not its problem.
    pub fn update_status(&self, region: RegionInfo, timestamp: u64) -> CResult<()> {
        if region.node_address.is_empty() || region.database.is_empty() {
            return Err(Error::InvalidRequest(
                "region report requires node_address and database".to_string(),
            ));
        }

        let key = (
            region.dc_id.clone(),
            region.database.clone(),
            region.vbucket,
            region.node_address.clone(),
        );

        let mut inner = self.inner.write().expect("region table poisoned");
        if let Some(existing) = inner.get(&key) {
            if existing.timestamp > timestamp {
                log::debug!(
                    "Dropping stale status for {}@{}/{}: {} > {}",
                    key.3,
                    key.1,
                    key.2,
                    existing.timestamp,
                    timestamp
                );
                return Ok(());
            }
        }
        inner.insert(key, Tracked { region, timestamp, last_heartbeat: Instant::now() });
        Ok(())
    }

    /// Returns all non-expired regions matching every provided filter
    /// (missing filters are wildcards). Expired entries are omitted and
    /// lazily purged.
    pub fn get_cluster_info(
        &self,
        dc_id: Option<&str>,
        database: Option<&str>,
        vbucket: Option<u32>,
    ) -> Vec<RegionInfo> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut results = Vec::new();
        {
            let inner = self.inner.read().expect("region table poisoned");
            for (key, tracked) in inner.iter() {
                if now.duration_since(tracked.last_heartbeat) > self.ttl {
                    expired.push(key.clone());
                    continue;
                }
                if dc_id.map_or(true, |dc| tracked.region.dc_id == dc)
                    && database.map_or(true, |db| tracked.region.database == db)
                    && vbucket.map_or(true, |vb| tracked.region.vbucket == vb)
                {
                    results.push(tracked.region.clone());
                }
            }
        }

        if !expired.is_empty() {
            let mut inner = self.inner.write().expect("region table poisoned");
            for key in expired {
                // Re-check under the write lock: a fresh heartbeat may have
                // revived the entry in between.
                if let Some(tracked) = inner.get(&key) {
                    if now.duration_since(tracked.last_heartbeat) > self.ttl {
                        log::info!("Evicting expired region {}@{}/{}", key.3, key.1, key.2);
                        inner.remove(&key);
                    }
                }
            }
        }

        // Deterministic output order for clients and tests.
        results.sort_by(|a, b| {
            (&a.dc_id, &a.database, a.vbucket, &a.node_address)
                .cmp(&(&b.dc_id, &b.database, b.vbucket, &b.node_address))
        });
        results
    }
}
