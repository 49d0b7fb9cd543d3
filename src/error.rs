//! Crate-level errors and wire response codes.
//!
//! The crate uses a two-layer error hierarchy:
//!
//! - [`Error`]: rich internal errors carried through `Result` returns. These
//!   are what workers log and callers match on.
//! - [`RespCode`]: the closed enum of codes carried in every
//!   [`ResponseHeader`](crate::protocol::ResponseHeader). Internal errors are
//!   mapped onto it via [`Error::resp_code`]; details stay in the logs,
//!   responses carry a context-free message.
//!
//! Reconciliation errors are deliberately *not* surfaced to heartbeat
//! responses; the next heartbeat re-drives convergence.

use std::result;

use num_derive::FromPrimitive;
use thiserror::Error as ThisError;

use crate::topo::TopoError;

pub type Result<T> = result::Result<T, Error>;

/// Control-plane errors.
#[derive(Debug, Clone, ThisError)]
pub enum Error {
    /// The receiving server is shutting down.
    #[error("server is stopping")]
    ServerStop,

    /// An internal event queue is saturated; the caller should retry later.
    #[error("system busy")]
    SysBusy,

    /// This zone master is not the cluster-metadata leader. Carries the
    /// current leader address when known.
    #[error("not the zone master leader")]
    MasterNotLeader(Option<String>),

    /// No zone master leader is currently known.
    #[error("no zone master leader")]
    NoLeader,

    #[error("database not found")]
    DbNotExists,

    #[error("space not found")]
    SpaceNotExists,

    #[error("partition not found")]
    PartitionNotExists,

    #[error("no route for slot")]
    RouteNotFound,

    #[error("partition server not found")]
    PsNotExists,

    /// The addressed PS does not host the partition.
    #[error("partition not hosted on this node")]
    PsNoPartition,

    /// The addressed PS is not the partition's consensus leader.
    #[error("not the partition leader")]
    PsNotLeader,

    #[error("id allocation failed: {0}")]
    IdGenFailed(String),

    /// A local metadata store operation failed on a PS.
    #[error("local metadata store: {0}")]
    LocalDbOps(String),

    #[error(transparent)]
    Topo(#[from] TopoError),

    #[error("rpc: {0}")]
    Rpc(String),

    #[error("config: {0}")]
    Config(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// Map onto the closed wire code enum.
    pub fn resp_code(&self) -> RespCode {
        match self {
            Error::ServerStop => RespCode::ServerStop,
            Error::SysBusy => RespCode::SysBusy,
            Error::MasterNotLeader(_) => RespCode::MasterNotLeader,
            Error::NoLeader => RespCode::MasterNoLeader,
            Error::DbNotExists => RespCode::DbNotExists,
            Error::SpaceNotExists => RespCode::SpaceNotExists,
            Error::PartitionNotExists => RespCode::PartitionNotExists,
            Error::RouteNotFound => RespCode::RouteNotFound,
            Error::PsNotExists => RespCode::PsNotExists,
            Error::PsNoPartition => RespCode::PsNoPartition,
            Error::PsNotLeader => RespCode::PsNotLeader,
            Error::IdGenFailed(_) => RespCode::IdGenFailed,
            Error::LocalDbOps(_) => RespCode::LocalDbOpsFailed,
            Error::Topo(_) | Error::Rpc(_) | Error::Config(_) | Error::Internal(_) => {
                RespCode::ServerError
            }
        }
    }
}

/// Closed enum of response codes carried on the wire.
///
/// Grouped by kind:
/// - transient cluster: [`ServerStop`](RespCode::ServerStop),
///   [`SysBusy`](RespCode::SysBusy),
///   [`MasterNotLeader`](RespCode::MasterNotLeader) — clients retry with the
///   leader hint;
/// - not found: the `*NotExists` / [`RouteNotFound`](RespCode::RouteNotFound)
///   family;
/// - leadership: [`PsNotLeader`](RespCode::PsNotLeader);
/// - internal: [`ServerError`](RespCode::ServerError), message is
///   context-free;
/// - resource: [`IdGenFailed`](RespCode::IdGenFailed),
///   [`LocalDbOpsFailed`](RespCode::LocalDbOpsFailed).
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, Default, serde::Serialize, serde::Deserialize)]
pub enum RespCode {
    #[default]
    Ok = 0,
    ServerError = 1,
    ServerStop = 2,
    SysBusy = 3,

    MasterNotLeader = 10,
    MasterNoLeader = 11,

    DbNotExists = 20,
    SpaceNotExists = 21,
    PartitionNotExists = 22,
    RouteNotFound = 23,
    PsNotExists = 24,

    IdGenFailed = 30,
    LocalDbOpsFailed = 31,

    PsNoPartition = 40,
    PsNotLeader = 41,
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn resp_code_from_primitive() {
        assert_eq!(RespCode::from_i32(0), Some(RespCode::Ok));
        assert_eq!(RespCode::from_i32(3), Some(RespCode::SysBusy));
        assert_eq!(RespCode::from_i32(10), Some(RespCode::MasterNotLeader));
        assert_eq!(RespCode::from_i32(23), Some(RespCode::RouteNotFound));
        assert_eq!(RespCode::from_i32(41), Some(RespCode::PsNotLeader));
    }

    #[test]
    fn resp_code_unknown_value() {
        assert_eq!(RespCode::from_i32(999), None);
        assert_eq!(RespCode::from_i32(-1), None);
    }

    #[test]
    fn error_maps_to_codes() {
        assert_eq!(Error::SysBusy.resp_code(), RespCode::SysBusy);
        assert_eq!(
            Error::MasterNotLeader(Some("10.0.0.1:8817".into())).resp_code(),
            RespCode::MasterNotLeader
        );
        assert_eq!(Error::DbNotExists.resp_code(), RespCode::DbNotExists);
        assert_eq!(
            Error::IdGenFailed("boom".into()).resp_code(),
            RespCode::IdGenFailed
        );
        assert_eq!(
            Error::Internal("anything".into()).resp_code(),
            RespCode::ServerError
        );
    }

    #[test]
    fn topo_error_converts() {
        let err: Error = TopoError::NoNode.into();
        assert_eq!(err.resp_code(), RespCode::ServerError);
        assert!(err.to_string().contains("node"));
    }

    #[test]
    fn error_display() {
        let err = Error::Rpc("connection refused".into());
        assert!(err.to_string().contains("connection refused"));
    }
}
