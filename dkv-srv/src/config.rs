use std::path::PathBuf;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:2891";
pub const DEFAULT_DB_FOLDER: &str = "storage/dkv";
pub const DEFAULT_DATABASE: &str = "default";

/// Server configuration, loaded from a TOML file. Every field is optional;
/// the accessors below supply the defaults so a missing or partial file
/// still yields a runnable node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigLoad {
    version: u8,

    /// RPC bind address, mirrored as the region's node address.
    listen_addr: Option<String>,

    /// Storage engine root. The store creates `data` and `changes` inside.
    db_folder: Option<PathBuf>,

    /// Copy buffer size for compaction and backup, in bytes.
    cache_size: Option<usize>,

    create_db_folder_if_missing: Option<bool>,

    /// "cask" (disk) or "memory".
    engine: Option<String>,

    /// Region identity.
    dc_id: Option<String>,
    database: Option<String>,
    vbucket: Option<u32>,

    /// "master", "slave" or "discovery".
    role: Option<String>,

    /// The slave's failure zone.
    zone: Option<String>,

    /// This member's nexus node id.
    node_id: Option<u64>,

    /// Comma-separated consensus peer urls for bootstrap.
    nexus_cluster_url: Option<String>,

    discovery_endpoints: Option<Vec<String>>,

    max_changes_per_pull: Option<u32>,
    poll_interval_ms: Option<u64>,

    /// Lag bound B for ACTIVE_SLAVE status.
    lag_bound: Option<u64>,

    /// T: seconds without a reachable master before self-demotion.
    master_unreachable_secs: Option<u64>,

    /// Change journal retention window, in records.
    retain_changes: Option<u64>,

    heartbeat_interval_ms: Option<u64>,

    /// Discovery evicts regions silent for longer than this.
    region_ttl_secs: Option<u64>,

    request_timeout_ms: Option<u64>,

    /// Shared snapshot directory for slave bootstrap.
    bootstrap_path: Option<PathBuf>,
}

impl Default for ConfigLoad {
    fn default() -> Self {
        ConfigLoad {
            version: 0,
            listen_addr: None,
            db_folder: None,
            cache_size: None,
            create_db_folder_if_missing: Some(true),
            engine: Some("cask".to_string()),
            dc_id: None,
            database: None,
            vbucket: Some(0),
            role: Some("master".to_string()),
            zone: None,
            node_id: Some(1),
            nexus_cluster_url: None,
            discovery_endpoints: None,
            max_changes_per_pull: Some(512),
            poll_interval_ms: Some(200),
            lag_bound: Some(1024),
            master_unreachable_secs: Some(30),
            retain_changes: Some(65_536),
            heartbeat_interval_ms: Some(1000),
            region_ttl_secs: Some(10),
            request_timeout_ms: Some(2000),
            bootstrap_path: None,
        }
    }
}

impl ConfigLoad {
    pub fn new(path: &str) -> anyhow::Result<Self> {
        Ok(confy::load_path(path)?)
    }

    pub fn get_listen_addr(&self) -> String {
        self.listen_addr.clone().unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
    }

    pub fn set_listen_addr(&mut self, addr: String) {
        self.listen_addr = Some(addr);
    }

    pub fn get_db_folder(&self) -> PathBuf {
        self.db_folder.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_DB_FOLDER))
    }

    pub fn get_cache_size(&self) -> usize {
        self.cache_size.unwrap_or(64 * 1024)
    }

    pub fn get_create_db_folder_if_missing(&self) -> bool {
        self.create_db_folder_if_missing.unwrap_or(true)
    }

    pub fn get_engine(&self) -> String {
        self.engine.clone().unwrap_or_else(|| "cask".to_string())
    }

    pub fn get_dc_id(&self) -> String {
        self.dc_id.clone().unwrap_or_else(|| "dc-1".to_string())
    }

    pub fn get_database(&self) -> String {
        self.database.clone().unwrap_or_else(|| DEFAULT_DATABASE.to_string())
    }

    pub fn get_vbucket(&self) -> u32 {
        self.vbucket.unwrap_or(0)
    }

    pub fn get_role(&self) -> String {
        self.role.clone().unwrap_or_else(|| "master".to_string())
    }

    pub fn set_role(&mut self, role: String) {
        self.role = Some(role);
    }

    pub fn get_zone(&self) -> String {
        self.zone.clone().unwrap_or_else(|| self.get_dc_id())
    }

    pub fn get_node_id(&self) -> u64 {
        self.node_id.unwrap_or(1)
    }

    pub fn get_nexus_cluster_url(&self) -> String {
        self.nexus_cluster_url.clone().unwrap_or_default()
    }

    pub fn get_discovery_endpoints(&self) -> Vec<String> {
        self.discovery_endpoints.clone().unwrap_or_default()
    }

    pub fn get_max_changes_per_pull(&self) -> u32 {
        self.max_changes_per_pull.unwrap_or(512)
    }

    pub fn get_poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(200))
    }

    pub fn get_lag_bound(&self) -> u64 {
        self.lag_bound.unwrap_or(1024)
    }

    pub fn get_master_unreachable(&self) -> Duration {
        Duration::from_secs(self.master_unreachable_secs.unwrap_or(30))
    }

    pub fn get_retain_changes(&self) -> u64 {
        self.retain_changes.unwrap_or(65_536)
    }

    pub fn get_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.unwrap_or(1000))
    }

    pub fn get_region_ttl(&self) -> Duration {
        Duration::from_secs(self.region_ttl_secs.unwrap_or(10))
    }

    pub fn get_request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.unwrap_or(2000))
    }

    pub fn get_bootstrap_path(&self) -> Option<PathBuf> {
        self.bootstrap_path.clone()
    }
}
