use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use raft_lite::config::NodeConfig;
use raft_lite::grpc::GrpcServer;
use raft_lite::proto::admin_service_client::AdminServiceClient;
use raft_lite::proto::{ProposeRequest, StatusRequest};
use raft_lite::raft::{ApplyMsg, RaftNode};
use raft_lite::shutdown::install_shutdown_handler;
use raft_lite::storage::{FileStorage, MemStorage, Storage};

#[derive(Parser, Debug)]
#[command(name = "raft-lite")]
#[command(version)]
#[command(about = "A crash-fault-tolerant replicated log built on Raft consensus")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a raft-lite server node
    Server(ServerArgs),

    /// Propose a command to the cluster through one node
    Propose {
        /// Server address
        #[arg(long, short = 'a', default_value = "http://127.0.0.1:50051")]
        addr: String,

        /// Command payload to replicate
        command: String,
    },

    /// Show a node's consensus status
    Status {
        /// Server address
        #[arg(long, short = 'a', default_value = "http://127.0.0.1:50051")]
        addr: String,
    },
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Node ID (unique identifier for this node)
    #[arg(long, default_value = "1")]
    node_id: u64,

    /// Port to listen on for gRPC
    #[arg(long, default_value = "50051")]
    port: u16,

    /// Peer addresses (comma-separated, format: "id:host:port")
    /// Example: "2:127.0.0.1:50052,3:127.0.0.1:50053"
    #[arg(long, default_value = "")]
    peers: String,

    /// Directory for durable Raft state. Uses in-memory storage when
    /// omitted (state is lost across restarts).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Minimum election timeout in milliseconds
    #[arg(long, default_value = "300")]
    election_timeout_min_ms: u64,

    /// Maximum election timeout in milliseconds
    #[arg(long, default_value = "600")]
    election_timeout_max_ms: u64,

    /// Leader heartbeat interval in milliseconds
    #[arg(long, default_value = "50")]
    heartbeat_interval_ms: u64,
}

fn parse_peers(spec: &str) -> Result<Vec<(u64, String)>, String> {
    let mut peers = Vec::new();
    for part in spec.split(',').filter(|p| !p.is_empty()) {
        let (id, addr) = part
            .split_once(':')
            .ok_or_else(|| format!("invalid peer spec '{part}', expected id:host:port"))?;
        let id: u64 = id
            .parse()
            .map_err(|_| format!("invalid peer id in '{part}'"))?;
        peers.push((id, addr.to_string()));
    }
    Ok(peers)
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("127.0.0.1:{}", args.port).parse()?;
    let mut config = NodeConfig::new(args.node_id, listen_addr);
    config.election_timeout_min_ms = args.election_timeout_min_ms;
    config.election_timeout_max_ms = args.election_timeout_max_ms;
    config.heartbeat_interval_ms = args.heartbeat_interval_ms;
    for (id, addr) in parse_peers(&args.peers)? {
        config = config.with_peer(id, addr);
    }

    let storage: Arc<dyn Storage> = match &args.data_dir {
        Some(dir) => Arc::new(FileStorage::new(dir)?),
        None => {
            tracing::warn!("No --data-dir given, state will not survive a restart");
            Arc::new(MemStorage::new())
        }
    };

    let (apply_tx, mut apply_rx) = mpsc::channel(64);
    let node = Arc::new(RaftNode::new(config.clone(), storage, apply_tx)?);

    tokio::spawn(node.clone().run());

    // Placeholder state machine: a real deployment hands the receiver to
    // the owning service instead.
    tokio::spawn(async move {
        while let Some(msg) = apply_rx.recv().await {
            match msg {
                ApplyMsg::Command { index, command } => {
                    tracing::info!(
                        index,
                        command = %String::from_utf8_lossy(&command),
                        "Applied entry"
                    );
                }
                ApplyMsg::Snapshot { index, term, .. } => {
                    tracing::info!(index, term, "Applied snapshot");
                }
            }
        }
    });

    let shutdown = install_shutdown_handler();
    let server = GrpcServer::new(config.listen_addr, node.clone());
    let result = server.run(shutdown).await;

    node.kill();
    result?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Propose { addr, command } => {
            let mut client = AdminServiceClient::connect(addr).await?;
            let resp = client
                .propose(ProposeRequest {
                    command: command.into_bytes(),
                })
                .await?
                .into_inner();
            println!("accepted at index {} in term {}", resp.index, resp.term);
        }
        Commands::Status { addr } => {
            let mut client = AdminServiceClient::connect(addr).await?;
            let status = client.get_status(StatusRequest {}).await?.into_inner();
            println!("node:           {}", status.node_id);
            println!("role:           {}", status.role);
            println!("term:           {}", status.term);
            println!(
                "leader:         {}",
                if status.leader_id == 0 {
                    "unknown".to_string()
                } else {
                    status.leader_id.to_string()
                }
            );
            println!("commit index:   {}", status.commit_index);
            println!("last applied:   {}", status.last_applied);
            println!("last log index: {}", status.last_log_index);
        }
    }

    Ok(())
}
