//! Raft server binary
//!
//! Runs a single server with separate ports for cluster transport and the
//! client API.
//!
//! Usage: miniraft-server --id <ID> --transport-port <PORT> --api-port <PORT> --peers <ID=ADDR,...>
//!
//! Example for a 3-node cluster:
//!   miniraft-server --id 1 --transport-port 8001 --api-port 9001 --peers 2=127.0.0.1:8002,3=127.0.0.1:8003
//!   miniraft-server --id 2 --transport-port 8002 --api-port 9002 --peers 1=127.0.0.1:8001,3=127.0.0.1:8003
//!   miniraft-server --id 3 --transport-port 8003 --api-port 9003 --peers 1=127.0.0.1:8001,2=127.0.0.1:8002

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use miniraft::api::client_http::create_client_router;
use miniraft::core::raft::Raft;
use miniraft::core::raft_server::RaftServer;
use miniraft::core::request_handler::RequestHandler;
use miniraft::storage::memory::MemoryStorage;
use miniraft::transport::http::{create_router, HttpTransport};

fn parse_args() -> (u64, u16, u16, HashMap<u64, String>) {
    let args: Vec<String> = env::args().collect();

    let mut id: Option<u64> = None;
    let mut transport_port: Option<u16> = None;
    let mut api_port: Option<u16> = None;
    let mut peers: HashMap<u64, String> = HashMap::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--id" => {
                id = Some(args[i + 1].parse().expect("invalid server ID"));
                i += 2;
            }
            "--transport-port" => {
                transport_port = Some(args[i + 1].parse().expect("invalid transport port"));
                i += 2;
            }
            "--api-port" => {
                api_port = Some(args[i + 1].parse().expect("invalid API port"));
                i += 2;
            }
            "--peers" => {
                // Format: 2=127.0.0.1:8002,3=127.0.0.1:8003
                for peer_spec in args[i + 1].split(',') {
                    if let Some((peer_id, addr)) = peer_spec.split_once('=') {
                        peers.insert(
                            peer_id.parse().expect("invalid peer ID"),
                            addr.to_string(),
                        );
                    }
                }
                i += 2;
            }
            other => {
                eprintln!("unknown argument: {}", other);
                i += 1;
            }
        }
    }

    (
        id.expect("--id is required"),
        transport_port.expect("--transport-port is required"),
        api_port.expect("--api-port is required"),
        peers,
    )
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (id, transport_port, api_port, peers) = parse_args();
    info!(node = id, transport_port, api_port, ?peers, "starting server");

    let peer_ids: Vec<u64> = peers.keys().copied().collect();
    let transport = HttpTransport::new(peers, Duration::from_secs(2));

    let core = Raft::new(id, peer_ids, Box::new(MemoryStorage::new()))
        .expect("failed to load persistent state");
    let (server, shared) = RaftServer::new(core, transport);
    let (raft_handle, _server_task) = server.start();

    let handler = RequestHandler::new(shared.clone(), raft_handle.clone());
    let raft_router = create_router(handler);
    let client_router = create_client_router(raft_handle, shared);

    let transport_addr: SocketAddr = format!("0.0.0.0:{}", transport_port).parse().unwrap();
    let transport_listener = tokio::net::TcpListener::bind(transport_addr)
        .await
        .expect("failed to bind transport port");
    info!(node = id, %transport_addr, "transport listening");
    tokio::spawn(async move {
        axum::serve(transport_listener, raft_router).await.unwrap();
    });

    let api_addr: SocketAddr = format!("0.0.0.0:{}", api_port).parse().unwrap();
    let api_listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .expect("failed to bind API port");
    info!(node = id, %api_addr, "client API listening");
    axum::serve(api_listener, client_router).await.unwrap();
}
