use std::sync::Arc;
use tonic::{Request, Response, Status};

use crate::error::RaftError;
use crate::proto::admin_service_server::AdminService;
use crate::proto::{ProposeRequest, ProposeResponse, StatusRequest, StatusResponse};
use crate::raft::RaftNode;

/// gRPC service for driving a node from clients and the CLI
pub struct AdminGrpcService {
    node: Arc<RaftNode>,
}

impl AdminGrpcService {
    pub fn new(node: Arc<RaftNode>) -> Self {
        Self { node }
    }
}

#[tonic::async_trait]
impl AdminService for AdminGrpcService {
    async fn propose(
        &self,
        request: Request<ProposeRequest>,
    ) -> Result<Response<ProposeResponse>, Status> {
        let req = request.into_inner();

        match self.node.start(req.command).await {
            Ok((index, term)) => Ok(Response::new(ProposeResponse { index, term })),
            Err(RaftError::NotLeader(leader)) => Err(Status::failed_precondition(match leader {
                Some(id) => format!("not the leader, try node {id}"),
                None => "not the leader, no leader known yet".to_string(),
            })),
            Err(RaftError::Shutdown) => Err(Status::unavailable("node is shutting down")),
            Err(e) => Err(Status::internal(e.to_string())),
        }
    }

    async fn get_status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let state = self.node.state.read().await;

        Ok(Response::new(StatusResponse {
            node_id: self.node.id,
            term: state.current_term,
            role: state.role.to_string(),
            leader_id: state.leader_id.unwrap_or(0),
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            last_log_index: state.last_log_index(),
        }))
    }
}
