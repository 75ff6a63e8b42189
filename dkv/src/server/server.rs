use std::sync::{Arc, Mutex};

use futures::{SinkExt, TryStreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_serde::formats::Bincode;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::cluster::controller::ClusterController;
use crate::discovery::heartbeat::StatusSource;
use crate::discovery::registry::RegionRegistry;
use crate::error::{CResult, Error, Status};
use crate::replication::registry::ReplicaRegistry;
use crate::server::protocol::{Request, Response};
use crate::storage::engine::Engine;
use crate::store::{ChangePropagator, Store};

type ServerTransport = tokio_serde::Framed<
    Framed<TcpStream, LengthDelimitedCodec>,
    Request,
    CResult<Response>,
    Bincode<Request, CResult<Response>>,
>;

/// A DKV node's RPC server. Which requests it answers depends on the parts
/// it was wired with: a master carries a store, a replica registry and a
/// controller; a slave carries a read-only store; a discovery node carries
/// the region registry.
///
/// Connections are handled on their own tasks; the store serializes writes
/// internally behind its mutex while the registries take shared locks.
pub struct Server<E: Engine> {
    store: Option<Arc<Mutex<Store<E>>>>,
    replicas: Option<Arc<ReplicaRegistry>>,
    controller: Option<Arc<ClusterController>>,
    regions: Option<Arc<RegionRegistry>>,
    status_source: Option<Arc<dyn StatusSource>>,

    /// Set on slaves: the data plane rejects writes, replication applies
    /// them instead.
    read_only: bool,
}

impl<E: Engine + 'static> Server<E> {
    pub fn new() -> Self {
        Server {
            store: None,
            replicas: None,
            controller: None,
            regions: None,
            status_source: None,
            read_only: false,
        }
    }

    pub fn with_store(mut self, store: Arc<Mutex<Store<E>>>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_replicas(mut self, replicas: Arc<ReplicaRegistry>) -> Self {
        self.replicas = Some(replicas);
        self
    }

    pub fn with_controller(mut self, controller: Arc<ClusterController>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn with_regions(mut self, regions: Arc<RegionRegistry>) -> Self {
        self.regions = Some(regions);
        self
    }

    pub fn with_status_source(mut self, source: Arc<dyn StatusSource>) -> Self {
        self.status_source = Some(source);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Binds the listening socket. Split from serve() so callers learn the
    /// bound address before accepting (tests bind port 0).
    pub async fn bind(addr: &str) -> CResult<TcpListener> {
        TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(format!("bind {}: {}", addr, e)))
    }

    /// Accepts connections until shutdown flips.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> CResult<()> {
        log::info!("Serving on {}", listener.local_addr()?);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            log::warn!("Accept failed: {}", err);
                            continue;
                        }
                    };
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = server.handle_conn(socket).await {
                            log::debug!("Connection from {} ended: {}", peer, err);
                        }
                    });
                }
                _ = shutdown.changed() => {
                    log::info!("Server shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_conn(self: Arc<Self>, socket: TcpStream) -> CResult<()> {
        let mut transport: ServerTransport = tokio_serde::Framed::new(
            Framed::new(socket, LengthDelimitedCodec::new()),
            Bincode::default(),
        );

        while let Some(request) = transport
            .try_next()
            .await
            .map_err(|e| Error::Unreachable(e.to_string()))?
        {
            let response = self.dispatch(request);
            if let Err(err) = &response {
                log::debug!("Request failed: {}", err);
            }
            transport
                .send(response)
                .await
                .map_err(|e| Error::Unreachable(e.to_string()))?;
        }
        Ok(())
    }

    fn store(&self) -> CResult<&Arc<Mutex<Store<E>>>> {
        self.store
            .as_ref()
            .ok_or_else(|| Error::InvalidRequest("node serves no data".to_string()))
    }

    /// The data-plane write gate: only the shard leader accepts writes.
    /// Slaves and followers answer with the leader hint so the client can
    /// re-route.
    fn require_writable(&self) -> CResult<()> {
        if self.read_only {
            return Err(Error::NotLeader { leader: 0 });
        }
        if let Some(controller) = &self.controller {
            if !controller.is_leader() {
                return Err(Error::NotLeader { leader: controller.leader() });
            }
        }
        Ok(())
    }

    fn dispatch(&self, request: Request) -> CResult<Response> {
        match request {
            Request::Put { key, value, ttl_secs } => {
                if key.is_empty() {
                    return Err(Error::InvalidRequest("empty key".to_string()));
                }
                self.require_writable()?;
                let mut store = self.store()?.lock().expect("store poisoned");
                if ttl_secs > 0 {
                    store.put_with_ttl(&key, value, ttl_secs)?;
                } else {
                    store.put(&key, value)?;
                }
                Ok(Response::ack())
            }

            Request::Delete { key } => {
                if key.is_empty() {
                    return Err(Error::InvalidRequest("empty key".to_string()));
                }
                self.require_writable()?;
                self.store()?.lock().expect("store poisoned").delete(&key)?;
                Ok(Response::ack())
            }

            Request::Get { keys } => {
                if keys.iter().any(|k| k.is_empty()) {
                    return Err(Error::InvalidRequest("empty key".to_string()));
                }
                let values = self.store()?.lock().expect("store poisoned").multi_get(&keys)?;
                Ok(Response::Values { values })
            }

            Request::Scan { start_key, key_prefix, limit } => {
                let mut store = self.store()?.lock().expect("store poisoned");
                let iter = store.iterate(&start_key, key_prefix.as_deref());
                let items = match limit {
                    0 => iter.collect::<CResult<Vec<_>>>()?,
                    n => iter.take(n as usize).collect::<CResult<Vec<_>>>()?,
                };
                Ok(Response::Entries { items })
            }

            Request::GetChanges { from_change_number, max_number_of_changes } => {
                let mut store = self.store()?.lock().expect("store poisoned");
                let master_change_number = store.latest_change_number();
                let changes = if max_number_of_changes == 0 {
                    // Metadata-only pull: the caller just wants the master's
                    // current change number.
                    Vec::new()
                } else {
                    store.load_changes(from_change_number, max_number_of_changes)?
                };
                Ok(Response::Changes {
                    status: Status::ok(),
                    master_change_number,
                    number_of_changes: changes.len() as u32,
                    changes,
                })
            }

            Request::AddReplica(replica) => {
                self.replicas()?.add(replica)?;
                Ok(Response::ack())
            }

            Request::RemoveReplica(replica) => {
                self.replicas()?.remove(&replica)?;
                Ok(Response::ack())
            }

            Request::GetReplicas { zone } => {
                let replicas = self.replicas()?.list(zone.as_deref());
                Ok(Response::Replicas { replicas })
            }

            Request::Backup { backup_path } => {
                if backup_path.is_empty() {
                    return Err(Error::InvalidRequest("empty backup path".to_string()));
                }
                let mut store = self.store()?.lock().expect("store poisoned");
                store.backup(std::path::Path::new(&backup_path))?;
                Ok(Response::ack())
            }

            Request::Restore { restore_path } => {
                if restore_path.is_empty() {
                    return Err(Error::InvalidRequest("empty restore path".to_string()));
                }
                let mut store = self.store()?.lock().expect("store poisoned");
                store.restore(std::path::Path::new(&restore_path))?;
                Ok(Response::ack())
            }

            Request::AddNode { node_url } => {
                self.controller()?.add_node(&node_url)?;
                Ok(Response::ack())
            }

            Request::RemoveNode { node_url } => {
                self.controller()?.remove_node(&node_url)?;
                Ok(Response::ack())
            }

            Request::ListNodes => {
                let (leader, nodes) = self.controller()?.list_nodes()?;
                Ok(Response::Nodes { status: Status::ok(), leader, nodes })
            }

            Request::UpdateStatus { region, timestamp } => {
                self.regions()?.update_status(region, timestamp)?;
                Ok(Response::ack())
            }

            Request::GetClusterInfo { dc_id, database, vbucket } => {
                let region_infos = self.regions()?.get_cluster_info(
                    dc_id.as_deref(),
                    database.as_deref(),
                    vbucket,
                );
                Ok(Response::Regions { region_infos })
            }

            Request::GetStatus => {
                let source = self.status_source.as_ref().ok_or_else(|| {
                    Error::InvalidRequest("node reports no status".to_string())
                })?;
                // Advisory self-report without the discovery context; the
                // heartbeat path supplies the full picture.
                Ok(Response::Region(source.region_info(&[])))
            }
        }
    }

    fn replicas(&self) -> CResult<&Arc<ReplicaRegistry>> {
        self.replicas
            .as_ref()
            .ok_or_else(|| Error::InvalidRequest("node keeps no replica registry".to_string()))
    }

    fn controller(&self) -> CResult<&Arc<ClusterController>> {
        self.controller
            .as_ref()
            .ok_or_else(|| Error::InvalidRequest("node is not a cluster member".to_string()))
    }

    fn regions(&self) -> CResult<&Arc<RegionRegistry>> {
        self.regions
            .as_ref()
            .ok_or_else(|| Error::InvalidRequest("node serves no discovery".to_string()))
    }
}

impl<E: Engine + 'static> Default for Server<E> {
    fn default() -> Self {
        Self::new()
    }
}
