use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::discovery::heartbeat::StatusSource;
use crate::discovery::{RegionInfo, RegionStatus};
use crate::error::{CResult, Error};
use crate::replication::registry::Replica;
use crate::router::{pick_read, ConsistencyLevel};
use crate::server::client::Client;
use crate::storage::engine::Engine;
use crate::store::{ChangeApplier, ChangePropagator, Store};

/// Configuration of a slave's pull loop, one per (shard, slave).
pub struct PullerConfig {
    pub dc_id: String,
    pub zone: String,
    pub database: String,
    pub vbucket: u32,

    /// This slave's own RPC address, registered with the master and
    /// reported to discovery.
    pub node_address: String,

    pub discovery_endpoints: Vec<String>,

    pub max_batch: u32,
    pub poll_interval: Duration,

    /// Lag bound B: the slave reports ACTIVE_SLAVE only while
    /// master_change_number - applied <= lag_bound.
    pub lag_bound: u64,

    /// T: after this long without reaching any master, the slave reports
    /// INACTIVE.
    pub master_unreachable: Duration,

    pub request_timeout: Duration,

    /// Where the applied high-water mark is persisted; None for ephemeral
    /// slaves that resync from their own journal.
    pub applied_path: Option<PathBuf>,

    /// A directory shared with masters for snapshot bootstrap; None leaves
    /// a lagging slave INACTIVE until an operator intervenes.
    pub bootstrap_path: Option<PathBuf>,
}

/// The puller's observable state, shared with the heartbeater and GetStatus.
#[derive(Clone, Debug, PartialEq)]
pub struct SlaveProgress {
    pub applied: u64,
    pub lag: u64,
    pub status: RegionStatus,
    pub master: Option<String>,
}

impl Default for SlaveProgress {
    fn default() -> Self {
        SlaveProgress { applied: 0, lag: 0, status: RegionStatus::Inactive, master: None }
    }
}

/// The persisted applied-change-number mark: 8 big-endian bytes, written to
/// a temp file, fsynced and renamed into place, so a torn write can never
/// corrupt the previous mark.
struct AppliedMark {
    path: Option<PathBuf>,
}

impl AppliedMark {
    fn load(&self) -> CResult<u64> {
        let Some(path) = &self.path else { return Ok(0) };
        match std::fs::read(path) {
            Ok(bytes) if bytes.len() == 8 => {
                Ok(u64::from_be_bytes(bytes.as_slice().try_into().expect("checked length")))
            }
            Ok(bytes) => Err(Error::Storage(format!(
                "applied mark {} has {} bytes, want 8",
                path.display(),
                bytes.len()
            ))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, applied: u64) -> CResult<()> {
        let Some(path) = &self.path else { return Ok(()) };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut tmp = path.clone();
        tmp.set_extension("new");
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&applied.to_be_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// The single-threaded pull loop of one slave: pick a master through
/// discovery, pull a bounded batch of changes, apply them, persist the mark,
/// report lag. At-least-once delivery is made idempotent by the store's
/// strict contiguity check.
pub struct Puller<E: Engine> {
    config: PullerConfig,
    store: Arc<Mutex<Store<E>>>,
    progress: Arc<Mutex<SlaveProgress>>,
    mark: AppliedMark,
}

impl<E: Engine> Puller<E> {
    pub fn new(config: PullerConfig, store: Arc<Mutex<Store<E>>>) -> Self {
        let mark = AppliedMark { path: config.applied_path.clone() };
        Puller {
            config,
            store,
            progress: Arc::new(Mutex::new(SlaveProgress::default())),
            mark,
        }
    }

    /// The shared progress handle, for the heartbeater and GetStatus.
    pub fn progress_handle(&self) -> Arc<Mutex<SlaveProgress>> {
        self.progress.clone()
    }

    /// Runs until shutdown. Per-pull failures are logged and retried with
    /// backoff; storage corruption is fatal and propagates out.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> CResult<()> {
        // The store's own journal is authoritative; the mark only avoids a
        // full journal scan and survives engine swaps. After a crash between
        // apply and mark persistence the journal is ahead, take the max.
        let mut applied = std::cmp::max(
            self.mark.load()?,
            self.store.lock().expect("store poisoned").latest_change_number(),
        );
        log::info!("Puller starting from change number {}", applied);

        let mut conn: Option<(String, Client)> = None;
        let mut last_contact = Instant::now();
        let mut backoff = self.config.poll_interval;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let mut delay = self.config.poll_interval;
            match self.pull_once(&mut conn, &mut applied).await {
                Ok(caught_up) => {
                    last_contact = Instant::now();
                    backoff = self.config.poll_interval;
                    if !caught_up {
                        // A full batch means more is waiting; skip the sleep.
                        delay = Duration::ZERO;
                    }
                }
                Err(err @ Error::Storage(_)) => {
                    // Corruption is not survivable by retrying.
                    log::error!("Puller aborting on storage failure: {}", err);
                    self.report(applied, 0, RegionStatus::Inactive, None);
                    return Err(err);
                }
                Err(err) => {
                    conn = None;
                    backoff = std::cmp::min(backoff * 2, Duration::from_secs(8));
                    delay = jitter(backoff);
                    log::warn!("Pull failed, retrying in {:?}: {}", delay, err);
                    if last_contact.elapsed() > self.config.master_unreachable {
                        self.report(applied, 0, RegionStatus::Inactive, None);
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        log::info!("Puller stopped at change number {}", applied);
        Ok(())
    }

    /// One iteration: re-select the master, pull, apply, report. Returns
    /// whether the slave is caught up (a partial batch).
    async fn pull_once(
        &self,
        conn: &mut Option<(String, Client)>,
        applied: &mut u64,
    ) -> CResult<bool> {
        let master = self.pick_master().await?;

        if conn.as_ref().map(|(addr, _)| addr.as_str()) != Some(master.node_address.as_str()) {
            let client = self.attach(&master).await?;
            *conn = Some((master.node_address.clone(), client));
        }
        let (_, client) = conn.as_mut().expect("connection just established");

        let (master_change_number, changes) =
            match client.get_changes(*applied + 1, self.config.max_batch).await {
                Ok(resp) => resp,
                Err(Error::ChangesUnavailable { from, floor }) => {
                    log::warn!(
                        "Master retains changes only from {}, we need {}: bootstrapping",
                        floor,
                        from
                    );
                    *applied = self.bootstrap(client).await?;
                    self.mark.save(*applied)?;
                    return Ok(false);
                }
                Err(err) => return Err(err),
            };

        let full_batch = changes.len() as u64 >= self.config.max_batch as u64;
        if !changes.is_empty() {
            let saved = {
                let mut store = self.store.lock().expect("store poisoned");
                store.save_changes(&changes)
            };
            match saved {
                Ok(n) => {
                    *applied = n;
                    self.mark.save(n)?;
                }
                Err(Error::NonContiguous { expected, got }) => {
                    // Duplicate delivery, e.g. after a crash between apply
                    // and mark persistence. The local journal knows the
                    // truth; skip ahead to it and retry next round.
                    let latest = self
                        .store
                        .lock()
                        .expect("store poisoned")
                        .latest_change_number();
                    log::warn!(
                        "Non-contiguous range (expected {}, got {}), resyncing to {}",
                        expected,
                        got,
                        latest
                    );
                    *applied = latest;
                    self.mark.save(latest)?;
                    return Ok(false);
                }
                Err(err) => return Err(err),
            }
        }

        let lag = master_change_number.saturating_sub(*applied);
        let status = if lag <= self.config.lag_bound {
            RegionStatus::ActiveSlave
        } else {
            RegionStatus::Inactive
        };
        self.report(*applied, lag, status, Some(master.node_address.clone()));

        Ok(!full_batch)
    }

    /// Chooses the shard leader through discovery, preferring this DC.
    async fn pick_master(&self) -> CResult<RegionInfo> {
        let mut last_err = Error::Unreachable("no discovery endpoints".to_string());
        for endpoint in &self.config.discovery_endpoints {
            let mut client = match Client::connect(endpoint, self.config.request_timeout).await {
                Ok(client) => client,
                Err(err) => {
                    last_err = err;
                    continue;
                }
            };
            match client
                .get_cluster_info(
                    None,
                    Some(self.config.database.clone()),
                    Some(self.config.vbucket),
                )
                .await
            {
                Ok(regions) => {
                    return pick_read(&regions, ConsistencyLevel::Linearizable, &self.config.dc_id)
                        .cloned()
                        .ok_or_else(|| {
                            Error::Unreachable("discovery reports no leader for shard".to_string())
                        });
                }
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    /// Connects to a newly chosen master and registers this slave with it.
    async fn attach(&self, master: &RegionInfo) -> CResult<Client> {
        let mut client =
            Client::connect(&master.node_address, self.config.request_timeout).await?;
        let (host, port) = split_address(&self.config.node_address)?;
        client.add_replica(Replica::new(&self.config.zone, &host, port)).await?;
        log::info!("Attached to master {}", master.node_address);
        Ok(client)
    }

    /// Bootstraps from a snapshot: asks the master to back up into the
    /// shared bootstrap directory, restores locally, and resumes from the
    /// snapshot's change number.
    async fn bootstrap(&self, client: &mut Client) -> CResult<u64> {
        let Some(path) = &self.config.bootstrap_path else {
            return Err(Error::Internal(
                "bootstrap required but no bootstrap path configured".to_string(),
            ));
        };
        let path_str = path
            .to_str()
            .ok_or_else(|| Error::InvalidRequest("non-utf8 bootstrap path".to_string()))?;

        client.backup(path_str).await?;
        let mut store = self.store.lock().expect("store poisoned");
        store.restore(path)?;
        let applied = store.latest_change_number();
        log::info!("Bootstrapped from snapshot at change number {}", applied);
        Ok(applied)
    }

    fn report(&self, applied: u64, lag: u64, status: RegionStatus, master: Option<String>) {
        let mut progress = self.progress.lock().expect("progress poisoned");
        if progress.status != status {
            log::info!("Slave status {} -> {} (lag {})", progress.status, status, lag);
        }
        *progress = SlaveProgress { applied, lag, status, master };
    }
}

/// The region report of an async slave, fed by its puller's progress.
pub struct SlaveStatusSource {
    base: RegionInfo,
    progress: Arc<Mutex<SlaveProgress>>,
}

impl SlaveStatusSource {
    pub fn new(base: RegionInfo, progress: Arc<Mutex<SlaveProgress>>) -> Self {
        SlaveStatusSource { base, progress }
    }
}

impl StatusSource for SlaveStatusSource {
    fn region_info(&self, _shard_peers: &[RegionInfo]) -> RegionInfo {
        let progress = self.progress.lock().expect("progress poisoned");
        let mut region = self.base.clone();
        region.status = progress.status;
        region.master_host = progress.master.clone();
        region
    }
}

fn split_address(addr: &str) -> CResult<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidRequest(format!("address {} has no port", addr)))?;
    Ok((host.to_string(), port.parse()?))
}

/// Spreads retries out a little so a master coming back does not get hit by
/// every slave in the same instant.
fn jitter(base: Duration) -> Duration {
    use rand::Rng;
    base.mul_f64(rand::thread_rng().gen_range(0.8..1.2))
}
