//! Client network engine: the TCP control connection (streaming JSON, same
//! framing as the server's control processor) plus the UDP send/receive
//! loops, reconnect policy, ping RTT probe, and keep-alive ticks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{info, warn};

use crate::config::{
    MAX_SILENT_RECONNECT_ATTEMPTS, PING_INTERVAL_SECS, RECONNECT_DELAY_SECS, UDP_KEEPALIVE_INTERVAL_SECS,
};
use crate::error::ClientError;
use crate::proto::control::Envelope;
use crate::proto::{now_secs, UdpHeader, FLAG_PING};

use super::ingress::IngressContext;

pub struct NetworkHandles {
    pub control_tx: UnboundedSender<Envelope>,
    pub udp_tx: UnboundedSender<Vec<u8>>,
}

/// Connects the TCP control channel, applying `SO_KEEPALIVE` and bounded
/// silent-reconnect retries, then spawns the control reader/writer and the
/// UDP send/receive/ping/keepalive loops. Returns immediately with handles
/// to push outgoing control messages and raw UDP datagrams; the spawned
/// tasks run until the control connection drops for good.
pub async fn connect_and_run(
    server_host: String,
    tcp_port: u16,
    udp_port: u16,
    my_uid_flags: Arc<PresenceFlags>,
    ingress: Arc<IngressContext>,
    on_control: impl Fn(Envelope) + Send + Sync + 'static,
    on_whisper: impl Fn(u32) + Send + Sync + 'static,
) -> Result<(NetworkHandles, Arc<AtomicBool>), ClientError> {
    let tcp_addr = format!("{server_host}:{tcp_port}");
    let stream = connect_with_retry(&tcp_addr).await?;
    stream.set_nodelay(true).ok();
    if let Err(e) = socket2::SockRef::from(&stream).set_keepalive(true) {
        warn!(error = %e, "failed to set SO_KEEPALIVE on control socket");
    }

    let udp_addr: SocketAddr = format!("{server_host}:{udp_port}")
        .parse()
        .map_err(|_| ClientError::Connect {
            addr: format!("{server_host}:{udp_port}"),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad address"),
        })?;
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| ClientError::Connect { addr: udp_addr.to_string(), source: e })?;
    socket
        .connect(udp_addr)
        .await
        .map_err(|e| ClientError::Connect { addr: udp_addr.to_string(), source: e })?;
    let socket = Arc::new(socket);

    let (read_half, mut write_half) = stream.into_split();
    let (control_tx, mut control_rx) = tokio::sync::mpsc::unbounded_channel::<Envelope>();
    let (udp_tx, mut udp_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();

    let alive = Arc::new(AtomicBool::new(true));

    // Control writer.
    {
        tokio::spawn(async move {
            while let Some(envelope) = control_rx.recv().await {
                match serde_json::to_vec(&envelope) {
                    Ok(bytes) => {
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to serialize control message"),
                }
            }
        });
    }

    // Control reader: reused streaming JSON decoder over concatenated objects.
    {
        let alive = alive.clone();
        tokio::spawn(async move {
            let mut read_half = read_half;
            let mut buf = Vec::with_capacity(8192);
            let mut tmp = [0u8; 4096];
            loop {
                let n = match read_half.read(&mut tmp).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                buf.extend_from_slice(&tmp[..n]);
                loop {
                    let mut de = serde_json::Deserializer::from_slice(&buf);
                    match <Envelope as serde::Deserialize>::deserialize(&mut de) {
                        Ok(envelope) => {
                            let consumed = de.byte_offset();
                            buf.drain(..consumed);
                            on_control(envelope);
                        }
                        Err(e) if e.is_eof() => break,
                        Err(e) => {
                            warn!(error = %e, "malformed control message from server");
                            break;
                        }
                    }
                }
            }
            alive.store(false, Ordering::SeqCst);
            info!("control connection closed");
        });
    }

    // UDP sender: drains the outgoing queue straight onto the socket.
    {
        let socket = socket.clone();
        tokio::spawn(async move {
            while let Some(datagram) = udp_rx.recv().await {
                let _ = socket.send(&datagram).await;
            }
        });
    }

    // UDP receiver: demux each datagram through the shared ingress context.
    {
        let socket = socket.clone();
        let ingress = ingress.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; crate::config::UDP_DATAGRAM_BUFFER_SIZE];
            loop {
                let n = match socket.recv(&mut buf).await {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(error = %e, "udp recv failed");
                        continue;
                    }
                };
                let now = now_secs();
                if let Err(e) = ingress.handle_datagram(&buf[..n], now, |whisperer_uid| on_whisper(whisperer_uid)) {
                    tracing::trace!(error = %e, "dropping malformed incoming datagram");
                }
            }
        });
    }

    // Ping loop: a header-only FLAG_PING packet every PING_INTERVAL_SECS,
    // echoed back by the server unchanged so `handle_ping_echo` can derive RTT.
    {
        let udp_tx = udp_tx.clone();
        let uid_flags = my_uid_flags.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs_f64(PING_INTERVAL_SECS));
            loop {
                interval.tick().await;
                let header = UdpHeader {
                    sender_uid: uid_flags.uid,
                    send_timestamp: now_secs(),
                    sequence: 0,
                    flags: FLAG_PING,
                };
                let _ = udp_tx.send(header.encode().to_vec());
            }
        });
    }

    // Keep-alive loop: a header-only packet (no payload) every
    // UDP_KEEPALIVE_INTERVAL_SECS carrying current mute/deaf flags, so the
    // server's udp_map stays fresh even through silence.
    {
        let udp_tx = udp_tx.clone();
        let uid_flags = my_uid_flags.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs_f64(UDP_KEEPALIVE_INTERVAL_SECS));
            loop {
                interval.tick().await;
                let header = UdpHeader {
                    sender_uid: uid_flags.uid,
                    send_timestamp: now_secs(),
                    sequence: 0,
                    flags: uid_flags.flags(),
                };
                let _ = udp_tx.send(header.encode().to_vec());
            }
        });
    }

    Ok((NetworkHandles { control_tx, udp_tx }, alive))
}

/// Mute/deaf state shared with the ping/keepalive loops so they stamp the
/// header with whatever the UI last set, without the audio thread needing
/// to know about networking.
pub struct PresenceFlags {
    pub uid: u32,
    mute: AtomicBool,
    deaf: AtomicBool,
}

impl PresenceFlags {
    pub fn new(uid: u32) -> Self {
        PresenceFlags {
            uid,
            mute: AtomicBool::new(false),
            deaf: AtomicBool::new(false),
        }
    }

    pub fn set_mute(&self, mute: bool) {
        self.mute.store(mute, Ordering::Relaxed);
    }

    pub fn set_deaf(&self, deaf: bool) {
        self.deaf.store(deaf, Ordering::Relaxed);
    }

    fn flags(&self) -> u8 {
        let mut f = 0u8;
        if self.mute.load(Ordering::Relaxed) {
            f |= crate::proto::FLAG_MUTE;
        }
        if self.deaf.load(Ordering::Relaxed) {
            f |= crate::proto::FLAG_DEAF;
        }
        f
    }
}

async fn connect_with_retry(addr: &str) -> Result<TcpStream, ClientError> {
    let mut attempts = 0;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                attempts += 1;
                if attempts >= MAX_SILENT_RECONNECT_ATTEMPTS {
                    return Err(ClientError::Connect { addr: addr.to_string(), source: e });
                }
                warn!(attempt = attempts, error = %e, "control connect failed, retrying");
                tokio::time::sleep(Duration::from_secs_f64(RECONNECT_DELAY_SECS)).await;
            }
        }
    }
}
