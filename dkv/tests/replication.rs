//! End-to-end replication: a master, an async slave and a discovery node
//! wired together over real sockets, exercising the heartbeat, pull,
//! bootstrap and routing paths.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use dkv::changes::Mutation;
use dkv::cluster::{ClusterController, LocalNexus};
use dkv::discovery::heartbeat::{Heartbeater, MemberStatusSource};
use dkv::discovery::registry::RegionRegistry;
use dkv::discovery::{RegionInfo, RegionStatus};
use dkv::error::CResult;
use dkv::replication::{Puller, PullerConfig, ReplicaRegistry, SlaveStatusSource};
use dkv::router::{ConsistencyLevel, Router};
use dkv::server::{Client, Request, Response, Server};
use dkv::storage::memory::Memory;
use dkv::store::{ChangePropagator, Store};

const TIMEOUT: Duration = Duration::from_secs(2);
const TICK: Duration = Duration::from_millis(25);

struct Cluster {
    discovery_addr: String,
    master_addr: String,
    master_store: Arc<Mutex<Store<Memory>>>,
    shutdown: watch::Sender<bool>,
}

async fn wait_for<F: FnMut() -> bool>(mut condition: F, what: &str) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(TICK).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Starts a discovery node and a single master (leader of D/0 in DC A) that
/// heartbeats into it.
async fn start_cluster(master_store: Store<Memory>) -> CResult<Cluster> {
    let (shutdown, rx) = watch::channel(false);

    // Discovery node.
    let regions = Arc::new(RegionRegistry::new(Duration::from_secs(5)));
    let discovery: Arc<Server<Memory>> = Arc::new(Server::new().with_regions(regions));
    let listener = Server::<Memory>::bind("127.0.0.1:0").await?;
    let discovery_addr = listener.local_addr()?.to_string();
    tokio::spawn(discovery.serve(listener, rx.clone()));

    // Master node.
    let store = Arc::new(Mutex::new(master_store));
    let controller = Arc::new(ClusterController::new(Arc::new(LocalNexus::bootstrap(
        1,
        "http://master:9020",
    ))));
    let listener = Server::<Memory>::bind("127.0.0.1:0").await?;
    let master_addr = listener.local_addr()?.to_string();
    let server = Arc::new(
        Server::new()
            .with_store(store.clone())
            .with_replicas(Arc::new(ReplicaRegistry::new()))
            .with_controller(controller.clone()),
    );
    tokio::spawn(server.serve(listener, rx.clone()));

    let mut base = RegionInfo::new("A", &master_addr, "D", 0);
    base.nexus_cluster_url = Some("http://master:9020".to_string());
    let heartbeater = Heartbeater::new(
        vec![discovery_addr.clone()],
        Arc::new(MemberStatusSource::new(base, controller)),
        "D",
        0,
        TICK,
        TIMEOUT,
    );
    tokio::spawn(heartbeater.run(rx));

    // Wait until discovery knows the leader.
    let mut client = Client::connect(&discovery_addr, TIMEOUT).await?;
    wait_for_leader(&mut client).await;

    Ok(Cluster { discovery_addr, master_addr, master_store: store, shutdown })
}

async fn wait_for_leader(client: &mut Client) {
    for _ in 0..200 {
        if let Ok(regions) = client.get_cluster_info(None, Some("D".to_string()), Some(0)).await {
            if regions.iter().any(|r| r.status == RegionStatus::Leader) {
                return;
            }
        }
        tokio::time::sleep(TICK).await;
    }
    panic!("discovery never saw a leader");
}

/// Starts a slave node: a read-only data server, a puller, and a
/// heartbeater reporting the puller's progress.
async fn start_slave(
    cluster: &Cluster,
    store: Arc<Mutex<Store<Memory>>>,
    bootstrap_path: Option<std::path::PathBuf>,
    applied_path: Option<std::path::PathBuf>,
) -> CResult<(String, Arc<Mutex<dkv::replication::SlaveProgress>>)> {
    let listener = Server::<Memory>::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    let server: Arc<Server<Memory>> =
        Arc::new(Server::new().with_store(store.clone()).read_only());
    tokio::spawn(server.serve(listener, cluster.shutdown.subscribe()));

    let puller = Puller::new(
        PullerConfig {
            dc_id: "A".to_string(),
            zone: "z1".to_string(),
            database: "D".to_string(),
            vbucket: 0,
            node_address: addr.clone(),
            discovery_endpoints: vec![cluster.discovery_addr.clone()],
            max_batch: 4,
            poll_interval: TICK,
            lag_bound: 8,
            master_unreachable: Duration::from_secs(1),
            request_timeout: TIMEOUT,
            applied_path,
            bootstrap_path,
        },
        store,
    );
    let progress = puller.progress_handle();
    tokio::spawn(puller.run(cluster.shutdown.subscribe()));

    let heartbeater = Heartbeater::new(
        vec![cluster.discovery_addr.clone()],
        Arc::new(SlaveStatusSource::new(
            RegionInfo::new("A", &addr, "D", 0),
            progress.clone(),
        )),
        "D",
        0,
        TICK,
        TIMEOUT,
    );
    tokio::spawn(heartbeater.run(cluster.shutdown.subscribe()));

    Ok((addr, progress))
}

#[tokio::test(flavor = "multi_thread")]
async fn slave_converges_and_reports_active() -> CResult<()> {
    let cluster = start_cluster(Store::memory()).await?;

    let mut client = Client::connect(&cluster.master_addr, TIMEOUT).await?;
    for i in 1..=3u8 {
        client.put(format!("cc_{}", i).as_bytes(), vec![i], 0).await?;
    }

    let slave_store = Arc::new(Mutex::new(Store::memory()));
    let (_, progress) = start_slave(&cluster, slave_store.clone(), None, None).await?;

    // Mixed batches, applied directly on the master store: each pair of
    // put+delete is one atomic change record.
    {
        let mut master = cluster.master_store.lock().unwrap();
        for i in 1..=3u8 {
            master.write_batch(vec![
                Mutation::put(format!("dd_{}", i).as_bytes(), vec![0x10 + i]),
                Mutation::delete(format!("cc_{}", i).as_bytes()),
            ])?;
        }
    }
    let master_latest = cluster.master_store.lock().unwrap().latest_change_number();

    wait_for(
        || slave_store.lock().unwrap().latest_change_number() == master_latest,
        "slave to catch up",
    )
    .await;

    {
        let mut slave = slave_store.lock().unwrap();
        for i in 1..=3u8 {
            assert_eq!(slave.get(format!("cc_{}", i).as_bytes())?, None);
            assert_eq!(slave.get(format!("dd_{}", i).as_bytes())?, Some(vec![0x10 + i]));
        }
    }

    wait_for(
        || progress.lock().unwrap().status == RegionStatus::ActiveSlave,
        "slave to report ACTIVE_SLAVE",
    )
    .await;
    assert_eq!(progress.lock().unwrap().lag, 0);

    // The slave registered itself with the master.
    let replicas = client.get_replicas(Some("z1".to_string())).await?;
    assert_eq!(replicas.len(), 1);

    // Discovery eventually shows master and slave.
    let mut discovery = Client::connect(&cluster.discovery_addr, TIMEOUT).await?;
    wait_for_region_status(&mut discovery, RegionStatus::ActiveSlave).await;

    cluster.shutdown.send(true).ok();
    Ok(())
}

async fn wait_for_region_status(client: &mut Client, status: RegionStatus) {
    for _ in 0..200 {
        if let Ok(regions) = client.get_cluster_info(Some("A".to_string()), None, None).await {
            if regions.iter().any(|r| r.status == status) {
                return;
            }
        }
        tokio::time::sleep(TICK).await;
    }
    panic!("discovery never saw {}", status);
}

#[tokio::test(flavor = "multi_thread")]
async fn slave_bootstraps_below_retention_floor() -> CResult<()> {
    // A master that has already compacted its journal past change 1.
    let mut master_store = Store::memory_with_retain(4);
    for i in 0..12u8 {
        master_store.put(format!("key_{:02}", i).as_bytes(), vec![i])?;
    }
    let master_latest = master_store.latest_change_number();
    let cluster = start_cluster(master_store).await?;

    let dir = tempdir::TempDir::new("bootstrap")?;
    let slave_store = Arc::new(Mutex::new(Store::memory_with_retain(4)));
    let (_, progress) = start_slave(
        &cluster,
        slave_store.clone(),
        Some(dir.path().join("snap")),
        Some(dir.path().join("applied")),
    )
    .await?;

    wait_for(
        || slave_store.lock().unwrap().latest_change_number() >= master_latest,
        "slave to bootstrap and catch up",
    )
    .await;

    {
        let mut slave = slave_store.lock().unwrap();
        for i in 0..12u8 {
            assert_eq!(slave.get(format!("key_{:02}", i).as_bytes())?, Some(vec![i]));
        }
    }
    wait_for(
        || progress.lock().unwrap().status == RegionStatus::ActiveSlave,
        "bootstrapped slave to report ACTIVE_SLAVE",
    )
    .await;

    // New writes keep flowing after the bootstrap.
    let mut client = Client::connect(&cluster.master_addr, TIMEOUT).await?;
    client.put(b"after", b"snapshot".to_vec(), 0).await?;
    wait_for(
        || slave_store.lock().unwrap().get(b"after").unwrap() == Some(b"snapshot".to_vec()),
        "post-bootstrap write to replicate",
    )
    .await;

    cluster.shutdown.send(true).ok();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn router_routes_by_consistency() -> CResult<()> {
    let cluster = start_cluster(Store::memory()).await?;
    let slave_store = Arc::new(Mutex::new(Store::memory()));
    let (slave_addr, _) = start_slave(&cluster, slave_store.clone(), None, None).await?;

    let router = Router::new(
        vec![cluster.discovery_addr.clone()],
        "A",
        "D",
        0,
        TIMEOUT,
        3,
    );

    // Writes land on the leader.
    let response = router
        .write(Request::Put { key: b"hello".to_vec(), value: b"world".to_vec(), ttl_secs: 0 })
        .await?;
    assert!(matches!(response, Response::Ack(_)));

    // A linearizable read observes the write immediately.
    let response = router
        .read(ConsistencyLevel::Linearizable, Request::Get { keys: vec![b"hello".to_vec()] })
        .await?;
    assert_eq!(response, Response::Values { values: vec![b"world".to_vec()] });

    // Wait for the slave to both catch up and advertise itself.
    wait_for(
        || slave_store.lock().unwrap().get(b"hello").unwrap() == Some(b"world".to_vec()),
        "slave to replicate the write",
    )
    .await;
    let mut discovery = Client::connect(&cluster.discovery_addr, TIMEOUT).await?;
    wait_for_region_status(&mut discovery, RegionStatus::ActiveSlave).await;

    // An eventual read is served by the slave.
    let response = router
        .read(ConsistencyLevel::Eventual, Request::Get { keys: vec![b"hello".to_vec()] })
        .await?;
    assert_eq!(response, Response::Values { values: vec![b"world".to_vec()] });

    // The eventual target really was the slave: it rejects writes with a
    // leader redirect.
    let mut slave = Client::connect(&slave_addr, TIMEOUT).await?;
    assert!(matches!(
        slave.put(b"nope", b"x".to_vec(), 0).await,
        Err(dkv::error::Error::NotLeader { .. })
    ));

    cluster.shutdown.send(true).ok();
    Ok(())
}
