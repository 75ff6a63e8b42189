use std::collections::HashMap;

use serde_derive::{Deserialize, Serialize};

use crate::changes::ChangeRecord;
use crate::cluster::nexus::NodeInfo;
use crate::discovery::RegionInfo;
use crate::error::Status;
use crate::replication::registry::Replica;

/// A request to a DKV node. Shipped as bincode inside a length-delimited
/// frame; the response travels back as a `CResult<Response>` so the error
/// taxonomy crosses the wire intact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    // Data plane.
    Put {
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
        #[serde(with = "serde_bytes")]
        value: Vec<u8>,
        /// Time-to-live in seconds, 0 for none.
        ttl_secs: u64,
    },
    Delete {
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
    },
    /// One result per key, in input order; missing keys yield empty values.
    Get {
        keys: Vec<Vec<u8>>,
    },
    Scan {
        #[serde(with = "serde_bytes")]
        start_key: Vec<u8>,
        key_prefix: Option<Vec<u8>>,
        /// Maximum pairs to return, 0 for unbounded.
        limit: u32,
    },

    // Replication.
    GetChanges {
        from_change_number: u64,
        max_number_of_changes: u32,
    },
    AddReplica(Replica),
    RemoveReplica(Replica),
    GetReplicas {
        zone: Option<String>,
    },

    // Backup/restore.
    Backup {
        backup_path: String,
    },
    Restore {
        restore_path: String,
    },

    // Cluster.
    AddNode {
        node_url: String,
    },
    RemoveNode {
        node_url: String,
    },
    ListNodes,

    // Discovery.
    UpdateStatus {
        region: RegionInfo,
        timestamp: u64,
    },
    GetClusterInfo {
        dc_id: Option<String>,
        database: Option<String>,
        vbucket: Option<u32>,
    },
    GetStatus,
}

/// A successful response. Errors travel as the Err arm of the wire result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// A plain acknowledgement carrying the OK envelope.
    Ack(Status),

    /// Values for Get, one per requested key.
    Values {
        values: Vec<Vec<u8>>,
    },

    /// Key/value pairs for Scan, in ascending key order.
    Entries {
        items: Vec<(Vec<u8>, Vec<u8>)>,
    },

    /// The change stream prefix for GetChanges, plus the master's current
    /// latest change number so the puller can compute its lag.
    Changes {
        status: Status,
        master_change_number: u64,
        number_of_changes: u32,
        changes: Vec<ChangeRecord>,
    },

    Replicas {
        replicas: Vec<Replica>,
    },

    Nodes {
        status: Status,
        leader: u64,
        nodes: HashMap<u64, NodeInfo>,
    },

    Regions {
        region_infos: Vec<RegionInfo>,
    },

    Region(RegionInfo),
}

impl Response {
    pub fn ack() -> Self {
        Response::Ack(Status::ok())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::{CResult, Error};

    #[test]
    /// The wire result round-trips through bincode on both arms.
    fn wire_roundtrip() -> CResult<()> {
        let ok: CResult<Response> = Ok(Response::Values { values: vec![b"v".to_vec(), vec![]] });
        let bytes = bincode::serialize(&ok)?;
        assert_eq!(bincode::deserialize::<CResult<Response>>(&bytes)?, ok);

        let err: CResult<Response> = Err(Error::NotLeader { leader: 2 });
        let bytes = bincode::serialize(&err)?;
        assert_eq!(bincode::deserialize::<CResult<Response>>(&bytes)?, err);
        Ok(())
    }

    #[test]
    fn request_roundtrip() -> CResult<()> {
        let req = Request::GetChanges { from_change_number: 42, max_number_of_changes: 8 };
        let bytes = bincode::serialize(&req)?;
        assert_eq!(bincode::deserialize::<Request>(&bytes)?, req);
        Ok(())
    }
}
