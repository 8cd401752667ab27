//! Selective-forwarding server: UDP router (C4) over the shared client
//! registry/watcher table (C1–C3), TCP control processor (C5) with nudge
//! voting (C6).

pub mod control;
pub mod nudge;
pub mod router;
pub mod state;

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tracing::info;

use crate::config::ServerConfig;
use crate::error::ServerError;

use router::UdpRouter;
use state::SharedState;

pub async fn run(config: ServerConfig) -> Result<(), ServerError> {
    let tcp_addr: SocketAddr = format!("{}:{}", config.bind_host, config.tcp_port)
        .parse()
        .expect("invalid bind host/port");
    let udp_addr: SocketAddr = format!("{}:{}", config.bind_host, config.udp_port)
        .parse()
        .expect("invalid bind host/port");

    let listener = TcpListener::bind(tcp_addr).await.map_err(|e| ServerError::TcpBind {
        addr: tcp_addr.to_string(),
        source: e,
    })?;
    let socket = UdpSocket::bind(udp_addr).await.map_err(|e| ServerError::UdpBind {
        addr: udp_addr.to_string(),
        source: e,
    })?;
    configure_udp_buffers(&socket, &config);

    info!(%tcp_addr, %udp_addr, "sfu server listening");

    let state = Arc::new(SharedState::new());
    let socket = Arc::new(socket);

    let router = UdpRouter::new(socket.clone(), state.clone());
    let router_task = tokio::spawn(async move { router.run().await });

    let control_task = tokio::spawn(control::run(listener, state.clone()));

    let stats_task = tokio::spawn(stats_monitor(state.clone()));

    let _ = tokio::join!(router_task, control_task, stats_task);
    Ok(())
}

/// Best-effort widening of the kernel UDP send/recv buffers so a transient
/// burst (a stream's keyframe, a spike in concurrent speakers) doesn't drop
/// packets in the kernel before the router thread gets to them. Socket2
/// options that fail are logged, not fatal — the defaults still work, just
/// with a smaller cushion.
fn configure_udp_buffers(socket: &UdpSocket, config: &ServerConfig) {
    let sock_ref = socket2::SockRef::from(socket);
    if let Err(e) = sock_ref.set_recv_buffer_size(config.udp_recv_buffer_size) {
        tracing::warn!(error = %e, "failed to set SO_RCVBUF");
    }
    if let Err(e) = sock_ref.set_send_buffer_size(config.udp_send_buffer_size) {
        tracing::warn!(error = %e, "failed to set SO_SNDBUF");
    }
}

async fn stats_monitor(state: Arc<SharedState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    let mut last_packets = 0u64;
    let mut last_bytes = 0u64;
    loop {
        interval.tick().await;
        let packets = state.stat_packets_routed.load(Ordering::Relaxed);
        let bytes = state.stat_bytes_routed.load(Ordering::Relaxed);
        let clients = state.clients.lock().len();
        info!(
            clients,
            packets_per_5s = packets - last_packets,
            kb_per_5s = (bytes - last_bytes) / 1024,
            "server stats"
        );
        last_packets = packets;
        last_bytes = bytes;
    }
}
