use std::collections::HashMap;
use std::sync::RwLock;

use serde_derive::{Deserialize, Serialize};

use crate::discovery::now_millis;
use crate::error::{CResult, Error};

/// Identifies an asynchronous slave attached to a master.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Replica {
    pub zone: String,
    pub host: String,
    pub port: u16,
}

impl Replica {
    pub fn new(zone: &str, host: &str, port: u16) -> Self {
        Replica { zone: zone.to_string(), host: host.to_string(), port }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.zone, self.host, self.port)
    }
}

/// The per-master registry of attached slaves, keyed by (zone, host, port).
/// Updates are idempotent, so lost-update races between concurrent
/// registrations are benign: the last writer wins on the last-seen
/// timestamp and nothing else differs.
pub struct ReplicaRegistry {
    inner: RwLock<HashMap<Replica, u64>>,
}

impl ReplicaRegistry {
    pub fn new() -> Self {
        ReplicaRegistry { inner: RwLock::new(HashMap::new()) }
    }

    /// Registers a slave, refreshing its last-seen timestamp if already
    /// present.
    pub fn add(&self, replica: Replica) -> CResult<()> {
        if replica.host.is_empty() || replica.port == 0 {
            return Err(Error::InvalidRequest("replica requires host and port".to_string()));
        }
        let mut inner = self.inner.write().expect("replica registry poisoned");
        inner.insert(replica, now_millis());
        Ok(())
    }

    /// Deregisters a slave; a no-op if absent.
    pub fn remove(&self, replica: &Replica) -> CResult<()> {
        let mut inner = self.inner.write().expect("replica registry poisoned");
        inner.remove(replica);
        Ok(())
    }

    /// Enumerates registered slaves, optionally filtered to one zone, in a
    /// deterministic order.
    pub fn list(&self, zone: Option<&str>) -> Vec<Replica> {
        let inner = self.inner.read().expect("replica registry poisoned");
        let mut replicas: Vec<Replica> = inner
            .keys()
            .filter(|r| zone.map_or(true, |z| r.zone == z))
            .cloned()
            .collect();
        replicas.sort();
        replicas
    }
}

impl Default for ReplicaRegistry {
    fn default() -> Self {
        Self::new()
    }
}
