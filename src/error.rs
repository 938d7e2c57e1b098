use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("not the leader, current leader is node {0:?}")]
    NotLeader(Option<u64>),

    #[error("peer {0} is unreachable")]
    PeerUnreachable(u64),

    #[error("rpc to peer {0} timed out")]
    RpcTimeout(u64),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("snapshot index {index} is ahead of commit index {commit_index}")]
    SnapshotAheadOfCommit { index: u64, commit_index: u64 },

    #[error("node is shutting down")]
    Shutdown,

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RaftError>;
