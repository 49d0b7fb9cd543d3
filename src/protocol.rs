//! Control-plane message types.
//!
//! Requests and responses exchanged between clients, the zone master, and
//! the partition servers. The gRPC wire plumbing is an external collaborator;
//! these structs are the payloads carried by [`crate::rpc`]'s client traits.
//!
//! Every response carries a [`ResponseHeader`] with a closed
//! [`RespCode`](crate::error::RespCode) and, on leadership errors, a leader
//! hint the caller can re-target with.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, RespCode};
use crate::types::{
    DbId, DbMeta, Epoch, NodeId, NodeMeta, PartitionId, PartitionMeta, PartitionStatus, Replica,
    SlotId, SpaceId, SpaceMeta,
};

/// Header carried by every request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestHeader {
    pub req_id: String,
}

impl RequestHeader {
    /// Fresh header with a random request id.
    pub fn new() -> Self {
        RequestHeader { req_id: Uuid::new_v4().to_string() }
    }
}

/// Leadership hint attached to `MASTER_NOT_LEADER` responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotLeader {
    pub leader_addr: String,
}

/// Structured error detail of a response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RespError {
    /// Set when another node is the leader.
    pub not_leader: Option<NotLeader>,
    /// Set when no leader is currently known.
    pub no_leader: bool,
}

/// Header carried by every response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub req_id: String,
    pub code: RespCode,
    pub message: String,
    pub error: RespError,
}

impl ResponseHeader {
    pub fn ok(req_id: &str) -> Self {
        ResponseHeader { req_id: req_id.to_string(), ..Default::default() }
    }

    /// Header for a failed request. Leadership errors carry their hint;
    /// internal details are not echoed, only a context-free message.
    pub fn from_error(req_id: &str, err: &Error) -> Self {
        let mut header = ResponseHeader {
            req_id: req_id.to_string(),
            code: err.resp_code(),
            message: err.to_string(),
            error: RespError::default(),
        };
        match err {
            Error::MasterNotLeader(Some(addr)) => {
                header.error.not_leader = Some(NotLeader { leader_addr: addr.clone() });
            }
            Error::MasterNotLeader(None) | Error::NoLeader => {
                header.error.no_leader = true;
            }
            _ => {}
        }
        header
    }

    pub fn is_ok(&self) -> bool {
        self.code == RespCode::Ok
    }
}

// =============================================================================
// Heartbeat payloads
// =============================================================================

/// Consensus-group view a PS reports for one partition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RaftStatus {
    /// The reporting node's own replica.
    pub replica: Replica,
    /// Followers, as known by the leader. Empty on follower reports.
    pub followers: Vec<FollowerStatus>,
}

/// One follower entry of a leader's report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FollowerStatus {
    pub replica: Replica,
}

/// Per-partition heartbeat payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub id: PartitionId,
    pub epoch: Epoch,
    pub status: PartitionStatus,
    pub is_leader: bool,
    pub raft_status: Option<RaftStatus>,
}

/// The leader replica of a report, or `None` for follower reports.
pub fn pick_leader_replica(info: &PartitionInfo) -> Option<&Replica> {
    if !info.is_leader {
        return None;
    }
    info.raft_status.as_ref().map(|rs| &rs.replica)
}

/// Choose the replica a delete event should target: the first follower, or
/// for leader reports the first follower that is not the leader itself,
/// falling back to the leader.
pub fn pick_replica_to_delete(info: &PartitionInfo) -> Option<&Replica> {
    let raft_status = info.raft_status.as_ref()?;

    if !info.is_leader {
        return raft_status.followers.first().map(|f| &f.replica);
    }

    let leader = &raft_status.replica;
    raft_status
        .followers
        .iter()
        .map(|f| &f.replica)
        .find(|r| r.id != leader.id)
        .or(Some(leader))
}

// =============================================================================
// Zone-master RPCs
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreatePartitionRequest {
    pub header: RequestHeader,
    pub partition: PartitionMeta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreatePartitionResponse {
    pub header: ResponseHeader,
    /// The replica allocated on the selected PS.
    pub replica: Option<Replica>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeletePartitionRequest {
    pub header: RequestHeader,
    pub partition_id: PartitionId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeletePartitionResponse {
    pub header: ResponseHeader,
}

/// Direction of a replica-set change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaChange {
    Add,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeReplicaRequest {
    pub header: RequestHeader,
    pub partition_id: PartitionId,
    pub change: ReplicaChange,
    pub replica: Replica,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeReplicaResponse {
    pub header: ResponseHeader,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeLeaderRequest {
    pub header: RequestHeader,
    pub partition_id: PartitionId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeLeaderResponse {
    pub header: ResponseHeader,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetRouteRequest {
    pub header: RequestHeader,
    pub db: DbId,
    pub space: SpaceId,
    pub slot: SlotId,
}

/// One routable partition: its record, the leader node when known, and the
/// resolved host nodes of its replicas.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Route {
    pub partition: PartitionMeta,
    pub leader: Option<NodeId>,
    pub nodes: Vec<NodeMeta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetRouteResponse {
    pub header: ResponseHeader,
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetDbRequest {
    pub header: RequestHeader,
    pub db_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetDbResponse {
    pub header: ResponseHeader,
    pub db: Option<DbMeta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetSpaceRequest {
    pub header: RequestHeader,
    pub db: DbId,
    pub space_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetSpaceResponse {
    pub header: ResponseHeader,
    pub space: Option<SpaceMeta>,
}

/// Build/runtime details a PS reports at registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub app_version: String,
    pub platform: String,
    pub start_time: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PsRegisterRequest {
    pub header: RequestHeader,
    /// `0` for a node that has never registered; otherwise the node resumes
    /// its previous identity.
    pub node_id: NodeId,
    pub ip: String,
    pub runtime: RuntimeInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PsRegisterResponse {
    pub header: ResponseHeader,
    pub node_id: NodeId,
    /// Partitions the node owned before; the PS diffs its local state
    /// against this assignment.
    pub partitions: Vec<PartitionMeta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PsHeartbeatRequest {
    pub header: RequestHeader,
    pub node_id: NodeId,
    pub partitions: Vec<PartitionInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PsHeartbeatResponse {
    pub header: ResponseHeader,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReplicaId;

    fn replica(id: u64, node: u64) -> Replica {
        Replica { id: ReplicaId(id), node_id: NodeId(node), ..Default::default() }
    }

    fn leader_info(leader: Replica, followers: Vec<Replica>) -> PartitionInfo {
        PartitionInfo {
            is_leader: true,
            raft_status: Some(RaftStatus {
                replica: leader,
                followers: followers.into_iter().map(|r| FollowerStatus { replica: r }).collect(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn pick_leader_requires_leader_flag() {
        let info = PartitionInfo {
            is_leader: false,
            raft_status: Some(RaftStatus { replica: replica(1, 1), followers: vec![] }),
            ..Default::default()
        };
        assert!(pick_leader_replica(&info).is_none());

        let info = leader_info(replica(1, 1), vec![]);
        assert_eq!(pick_leader_replica(&info).unwrap().id, ReplicaId(1));
    }

    #[test]
    fn pick_delete_prefers_non_leader_follower() {
        let info = leader_info(replica(1, 1), vec![replica(1, 1), replica(2, 2)]);
        assert_eq!(pick_replica_to_delete(&info).unwrap().id, ReplicaId(2));
    }

    #[test]
    fn pick_delete_falls_back_to_leader() {
        let info = leader_info(replica(1, 1), vec![replica(1, 1)]);
        assert_eq!(pick_replica_to_delete(&info).unwrap().id, ReplicaId(1));

        let info = leader_info(replica(1, 1), vec![]);
        assert_eq!(pick_replica_to_delete(&info).unwrap().id, ReplicaId(1));
    }

    #[test]
    fn pick_delete_on_follower_report_takes_first_follower() {
        let info = PartitionInfo {
            is_leader: false,
            raft_status: Some(RaftStatus {
                replica: replica(1, 1),
                followers: vec![FollowerStatus { replica: replica(7, 3) }],
            }),
            ..Default::default()
        };
        assert_eq!(pick_replica_to_delete(&info).unwrap().id, ReplicaId(7));
    }

    #[test]
    fn pick_delete_without_raft_status_is_none() {
        let info = PartitionInfo::default();
        assert!(pick_replica_to_delete(&info).is_none());
    }

    #[test]
    fn response_header_carries_leader_hint() {
        let err = Error::MasterNotLeader(Some("10.0.0.9:8817".into()));
        let header = ResponseHeader::from_error("req-1", &err);
        assert_eq!(header.code, RespCode::MasterNotLeader);
        assert_eq!(header.error.not_leader.as_ref().unwrap().leader_addr, "10.0.0.9:8817");
        assert!(!header.is_ok());
    }

    #[test]
    fn response_header_no_leader() {
        let header = ResponseHeader::from_error("req-2", &Error::NoLeader);
        assert!(header.error.no_leader);
        assert!(header.error.not_leader.is_none());
    }

    #[test]
    fn request_ids_are_unique() {
        assert_ne!(RequestHeader::new().req_id, RequestHeader::new().req_id);
    }
}
