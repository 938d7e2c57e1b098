use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::grpc::admin_service::AdminGrpcService;
use crate::grpc::raft_service::RaftGrpcService;
use crate::proto::admin_service_server::AdminServiceServer;
use crate::proto::raft_service_server::RaftServiceServer;
use crate::raft::RaftNode;

pub struct GrpcServer {
    addr: SocketAddr,
    node: Arc<RaftNode>,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, node: Arc<RaftNode>) -> Self {
        Self { addr, node }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        let raft_service = RaftGrpcService::new(self.node.clone());
        let admin_service = AdminGrpcService::new(self.node.clone());

        tracing::info!(addr = %self.addr, "Starting gRPC server");

        Server::builder()
            .add_service(RaftServiceServer::new(raft_service))
            .add_service(AdminServiceServer::new(admin_service))
            .serve_with_shutdown(self.addr, shutdown.cancelled())
            .await
    }
}
