use std::sync::Arc;
use tonic::{Request, Response, Status};

use crate::error::RaftError;
use crate::proto::raft_service_server::RaftService;
use crate::proto::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::raft::RaftNode;

/// gRPC service for peer-to-peer consensus RPCs
pub struct RaftGrpcService {
    node: Arc<RaftNode>,
}

impl RaftGrpcService {
    pub fn new(node: Arc<RaftNode>) -> Self {
        Self { node }
    }
}

fn to_status(err: RaftError) -> Status {
    match err {
        RaftError::Shutdown => Status::unavailable("node is shutting down"),
        RaftError::Storage(e) => Status::internal(format!("storage failure: {e}")),
        other => Status::internal(other.to_string()),
    }
}

#[tonic::async_trait]
impl RaftService for RaftGrpcService {
    async fn request_vote(
        &self,
        request: Request<VoteRequest>,
    ) -> Result<Response<VoteResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(
            candidate = req.candidate_id,
            term = req.term,
            "Received RequestVote"
        );

        let response = self.node.handle_vote_request(req).await.map_err(to_status)?;
        Ok(Response::new(response))
    }

    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        let req = request.into_inner();
        let is_heartbeat = req.entries.is_empty();
        tracing::trace!(
            leader = req.leader_id,
            term = req.term,
            entries = req.entries.len(),
            is_heartbeat,
            "Received AppendEntries"
        );

        let response = self
            .node
            .handle_append_entries(req)
            .await
            .map_err(to_status)?;
        Ok(Response::new(response))
    }
}
