use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use tokio::sync::watch;

use dkv::cluster::{ClusterController, LocalNexus};
use dkv::discovery::heartbeat::{Heartbeater, MemberStatusSource, StatusSource};
use dkv::discovery::registry::RegionRegistry;
use dkv::discovery::RegionInfo;
use dkv::replication::{Puller, PullerConfig, ReplicaRegistry, SlaveStatusSource};
use dkv::server::Server;
use dkv::storage::cask::Cask;
use dkv::storage::engine::Engine;
use dkv::storage::memory::Memory;
use dkv::store::Store;

use crate::config::ConfigLoad;

/// Builds and runs the node for the configured role until shutdown.
pub async fn run(cfg: ConfigLoad, shutdown: watch::Receiver<bool>) -> Result<()> {
    match cfg.get_role().as_str() {
        "discovery" => run_discovery(cfg, shutdown).await,
        "master" => match cfg.get_engine().as_str() {
            "memory" => {
                run_master(Store::memory_with_retain(cfg.get_retain_changes()), cfg, shutdown)
                    .await
            }
            "cask" => {
                let store = open_cask(&cfg)?;
                run_master(store, cfg, shutdown).await
            }
            other => bail!("unknown engine '{}'", other),
        },
        "slave" => match cfg.get_engine().as_str() {
            "memory" => {
                let store = Store::memory_with_retain(cfg.get_retain_changes());
                run_slave(store, None, cfg, shutdown).await
            }
            "cask" => {
                let store = open_cask(&cfg)?;
                let applied = cfg.get_db_folder().join("applied");
                run_slave(store, Some(applied), cfg, shutdown).await
            }
            other => bail!("unknown engine '{}'", other),
        },
        other => bail!("unknown role '{}', want master, slave or discovery", other),
    }
}

fn open_cask(cfg: &ConfigLoad) -> Result<Store<Cask>> {
    let folder = cfg.get_db_folder();
    if !folder.exists() {
        if !cfg.get_create_db_folder_if_missing() {
            bail!("db folder {} does not exist", folder.display());
        }
        std::fs::create_dir_all(&folder)?;
    }
    Ok(Store::cask_compact(&folder, cfg.get_retain_changes(), cfg.get_cache_size())?)
}

fn base_region(cfg: &ConfigLoad) -> RegionInfo {
    RegionInfo::new(
        &cfg.get_dc_id(),
        &cfg.get_listen_addr(),
        &cfg.get_database(),
        cfg.get_vbucket(),
    )
}

fn spawn_heartbeater(
    cfg: &ConfigLoad,
    source: Arc<dyn StatusSource>,
    shutdown: watch::Receiver<bool>,
) {
    let endpoints = cfg.get_discovery_endpoints();
    if endpoints.is_empty() {
        log::warn!("No discovery endpoints configured, this node will not be routable");
        return;
    }
    let heartbeater = Heartbeater::new(
        endpoints,
        source,
        &cfg.get_database(),
        cfg.get_vbucket(),
        cfg.get_heartbeat_interval(),
        cfg.get_request_timeout(),
    );
    tokio::spawn(heartbeater.run(shutdown));
}

async fn run_discovery(cfg: ConfigLoad, shutdown: watch::Receiver<bool>) -> Result<()> {
    let regions = Arc::new(RegionRegistry::new(cfg.get_region_ttl()));
    let server: Arc<Server<Memory>> = Arc::new(Server::new().with_regions(regions));
    let listener = Server::<Memory>::bind(&cfg.get_listen_addr()).await?;
    log::info!("Discovery node on {}", cfg.get_listen_addr());
    server.serve(listener, shutdown).await?;
    Ok(())
}

async fn run_master<E: Engine + 'static>(
    store: Store<E>,
    cfg: ConfigLoad,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let store = Arc::new(Mutex::new(store));
    let nexus = Arc::new(LocalNexus::bootstrap(
        cfg.get_node_id(),
        &cfg.get_nexus_cluster_url(),
    ));
    let controller = Arc::new(ClusterController::new(nexus));

    let mut base = base_region(&cfg);
    base.nexus_cluster_url =
        Some(cfg.get_nexus_cluster_url()).filter(|url| !url.is_empty());
    let source: Arc<dyn StatusSource> =
        Arc::new(MemberStatusSource::new(base, controller.clone()));

    let server = Arc::new(
        Server::new()
            .with_store(store)
            .with_replicas(Arc::new(ReplicaRegistry::new()))
            .with_controller(controller)
            .with_status_source(source.clone()),
    );
    spawn_heartbeater(&cfg, source, shutdown.clone());

    let listener = Server::<E>::bind(&cfg.get_listen_addr()).await?;
    log::info!(
        "Master node {} on {} ({}/{})",
        cfg.get_node_id(),
        cfg.get_listen_addr(),
        cfg.get_database(),
        cfg.get_vbucket()
    );
    server.serve(listener, shutdown).await?;
    Ok(())
}

async fn run_slave<E: Engine + 'static>(
    store: Store<E>,
    applied_path: Option<PathBuf>,
    cfg: ConfigLoad,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let store = Arc::new(Mutex::new(store));

    let puller = Puller::new(
        PullerConfig {
            dc_id: cfg.get_dc_id(),
            zone: cfg.get_zone(),
            database: cfg.get_database(),
            vbucket: cfg.get_vbucket(),
            node_address: cfg.get_listen_addr(),
            discovery_endpoints: cfg.get_discovery_endpoints(),
            max_batch: cfg.get_max_changes_per_pull(),
            poll_interval: cfg.get_poll_interval(),
            lag_bound: cfg.get_lag_bound(),
            master_unreachable: cfg.get_master_unreachable(),
            request_timeout: cfg.get_request_timeout(),
            applied_path,
            bootstrap_path: cfg.get_bootstrap_path(),
        },
        store.clone(),
    );
    let source: Arc<dyn StatusSource> = Arc::new(SlaveStatusSource::new(
        base_region(&cfg),
        puller.progress_handle(),
    ));

    let puller_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = puller.run(puller_shutdown).await {
            // Per-pull failures are retried inside the loop; getting here
            // means unrecoverable storage corruption.
            log::error!("Puller died: {}", err);
            std::process::exit(1);
        }
    });
    spawn_heartbeater(&cfg, source.clone(), shutdown.clone());

    let server = Arc::new(
        Server::new()
            .with_store(store)
            .with_status_source(source)
            .read_only(),
    );
    let listener = Server::<E>::bind(&cfg.get_listen_addr()).await?;
    log::info!(
        "Slave node on {} ({}/{})",
        cfg.get_listen_addr(),
        cfg.get_database(),
        cfg.get_vbucket()
    );
    server.serve(listener, shutdown).await?;
    Ok(())
}
