use std::collections::HashMap;
use std::time::Duration;

use futures::{SinkExt, TryStreamExt};
use tokio::net::TcpStream;
use tokio_serde::formats::Bincode;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::changes::ChangeRecord;
use crate::cluster::nexus::NodeInfo;
use crate::discovery::RegionInfo;
use crate::error::{CResult, Error};
use crate::replication::registry::Replica;
use crate::server::protocol::{Request, Response};

type ClientTransport = tokio_serde::Framed<
    Framed<TcpStream, LengthDelimitedCodec>,
    CResult<Response>,
    Request,
    Bincode<CResult<Response>, Request>,
>;

/// A client connection to a DKV node. Every call carries the configured
/// deadline; transport failures surface as Unreachable and the connection
/// should be dropped and re-established by the caller.
pub struct Client {
    transport: ClientTransport,
    timeout: Duration,
}

impl Client {
    /// Connects to the given `host:port` address within the deadline.
    pub async fn connect(addr: &str, timeout: Duration) -> CResult<Self> {
        let socket = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Unreachable(format!("connect to {} timed out", addr)))?
            .map_err(|e| Error::Unreachable(format!("connect to {}: {}", addr, e)))?;
        let transport = tokio_serde::Framed::new(
            Framed::new(socket, LengthDelimitedCodec::new()),
            Bincode::default(),
        );
        Ok(Client { transport, timeout })
    }

    /// Sends a request and awaits its response, bounded by the deadline.
    pub async fn call(&mut self, request: Request) -> CResult<Response> {
        tokio::time::timeout(self.timeout, async {
            self.transport
                .send(request)
                .await
                .map_err(|e| Error::Unreachable(e.to_string()))?;
            match self
                .transport
                .try_next()
                .await
                .map_err(|e| Error::Unreachable(e.to_string()))?
            {
                Some(result) => result,
                None => Err(Error::Unreachable("connection closed".to_string())),
            }
        })
        .await?
    }

    fn unexpected(response: Response) -> Error {
        Error::Internal(format!("unexpected response: {:?}", response))
    }

    // Data plane.

    pub async fn put(&mut self, key: &[u8], value: Vec<u8>, ttl_secs: u64) -> CResult<()> {
        match self.call(Request::Put { key: key.to_vec(), value, ttl_secs }).await? {
            Response::Ack(_) => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn delete(&mut self, key: &[u8]) -> CResult<()> {
        match self.call(Request::Delete { key: key.to_vec() }).await? {
            Response::Ack(_) => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn get(&mut self, keys: Vec<Vec<u8>>) -> CResult<Vec<Vec<u8>>> {
        match self.call(Request::Get { keys }).await? {
            Response::Values { values } => Ok(values),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn scan(
        &mut self,
        start_key: &[u8],
        key_prefix: Option<&[u8]>,
        limit: u32,
    ) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let request = Request::Scan {
            start_key: start_key.to_vec(),
            key_prefix: key_prefix.map(|p| p.to_vec()),
            limit,
        };
        match self.call(request).await? {
            Response::Entries { items } => Ok(items),
            other => Err(Self::unexpected(other)),
        }
    }

    // Replication.

    pub async fn get_changes(
        &mut self,
        from_change_number: u64,
        max_number_of_changes: u32,
    ) -> CResult<(u64, Vec<ChangeRecord>)> {
        let request = Request::GetChanges { from_change_number, max_number_of_changes };
        match self.call(request).await? {
            Response::Changes { master_change_number, changes, .. } => {
                Ok((master_change_number, changes))
            }
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn add_replica(&mut self, replica: Replica) -> CResult<()> {
        match self.call(Request::AddReplica(replica)).await? {
            Response::Ack(_) => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn remove_replica(&mut self, replica: Replica) -> CResult<()> {
        match self.call(Request::RemoveReplica(replica)).await? {
            Response::Ack(_) => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn get_replicas(&mut self, zone: Option<String>) -> CResult<Vec<Replica>> {
        match self.call(Request::GetReplicas { zone }).await? {
            Response::Replicas { replicas } => Ok(replicas),
            other => Err(Self::unexpected(other)),
        }
    }

    // Backup/restore.

    pub async fn backup(&mut self, backup_path: &str) -> CResult<()> {
        match self.call(Request::Backup { backup_path: backup_path.to_string() }).await? {
            Response::Ack(_) => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn restore(&mut self, restore_path: &str) -> CResult<()> {
        match self.call(Request::Restore { restore_path: restore_path.to_string() }).await? {
            Response::Ack(_) => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    // Cluster.

    pub async fn add_node(&mut self, node_url: &str) -> CResult<()> {
        match self.call(Request::AddNode { node_url: node_url.to_string() }).await? {
            Response::Ack(_) => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn remove_node(&mut self, node_url: &str) -> CResult<()> {
        match self.call(Request::RemoveNode { node_url: node_url.to_string() }).await? {
            Response::Ack(_) => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn list_nodes(&mut self) -> CResult<(u64, HashMap<u64, NodeInfo>)> {
        match self.call(Request::ListNodes).await? {
            Response::Nodes { leader, nodes, .. } => Ok((leader, nodes)),
            other => Err(Self::unexpected(other)),
        }
    }

    // Discovery.

    pub async fn update_status(&mut self, region: RegionInfo, timestamp: u64) -> CResult<()> {
        match self.call(Request::UpdateStatus { region, timestamp }).await? {
            Response::Ack(_) => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn get_cluster_info(
        &mut self,
        dc_id: Option<String>,
        database: Option<String>,
        vbucket: Option<u32>,
    ) -> CResult<Vec<RegionInfo>> {
        match self.call(Request::GetClusterInfo { dc_id, database, vbucket }).await? {
            Response::Regions { region_infos } => Ok(region_infos),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn get_status(&mut self) -> CResult<RegionInfo> {
        match self.call(Request::GetStatus).await? {
            Response::Region(region) => Ok(region),
            other => Err(Self::unexpected(other)),
        }
    }
}
