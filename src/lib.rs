pub mod config;
pub mod error;
pub mod grpc;
pub mod raft;
pub mod shutdown;
pub mod storage;

pub use error::{RaftError, Result};

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("raft");
}
