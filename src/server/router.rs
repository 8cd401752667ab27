//! UDP router (C4): one task reads datagrams off the socket and forwards
//! them according to the classification in [`crate::proto`]. Packets are
//! forwarded byte-for-byte (header included) — routing never needs to
//! touch the payload, only the uid(s) to forward to.
//!
//! Lock order: `watchers → clients → udp`, and never across a `sendto`.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::error::ProtoError;
use crate::proto::{self, PacketKind, UdpHeader};

use super::state::SharedState;

pub struct UdpRouter {
    pub socket: Arc<UdpSocket>,
    pub state: Arc<SharedState>,
}

impl UdpRouter {
    pub fn new(socket: Arc<UdpSocket>, state: Arc<SharedState>) -> Self {
        UdpRouter { socket, state }
    }

    /// Runs forever, reading datagrams and dispatching them. Errors on a
    /// single datagram are logged and never tear down the loop.
    pub async fn run(&self) {
        let mut buf = vec![0u8; crate::config::UDP_DATAGRAM_BUFFER_SIZE];
        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "udp recv_from failed");
                    continue;
                }
            };
            if let Err(e) = self.handle_datagram(src, &buf[..len]).await {
                debug!(error = %e, %src, "dropping malformed datagram");
            }
        }
    }

    async fn handle_datagram(&self, src: SocketAddr, datagram: &[u8]) -> Result<(), ProtoError> {
        let header = UdpHeader::decode(datagram)?;

        if header.flags == proto::FLAG_PING {
            let _ = self.socket.send_to(datagram, src).await;
            return Ok(());
        }

        // Record the sender's current endpoint and read back its room,
        // both under a single `udp_map`/`uid_to_room` acquisition — never
        // under `watchers` or `clients`.
        let sender_room = {
            self.state.udp_map.lock().insert(header.sender_uid, src);
            self.state.uid_to_room.lock().get(&header.sender_uid).cloned()
        };

        self.state.stat_packets_routed.fetch_add(1, Ordering::Relaxed);
        self.state
            .stat_bytes_routed
            .fetch_add(datagram.len() as u64, Ordering::Relaxed);

        let payload = &datagram[proto::UDP_HEADER_SIZE..];
        let kind = proto::classify(&header, payload)?;

        match kind {
            PacketKind::Ping => unreachable!("handled above"),
            PacketKind::Whisper { target_uid, .. } => {
                if let Some(addr) = self.state.udp_map.lock().get(&target_uid).copied() {
                    let _ = self.socket.send_to(datagram, addr).await;
                } else {
                    trace!(target_uid, "whisper target has no udp endpoint, dropping");
                }
            }
            PacketKind::Video { .. } | PacketKind::StreamVoice { .. } | PacketKind::StreamAudio { .. } => {
                self.forward_to_watchers(header.sender_uid, datagram).await;
            }
            PacketKind::Voice { .. } => {
                let Some(room) = sender_room else {
                    trace!(uid = header.sender_uid, "voice packet from uid with no known room");
                    return Ok(());
                };
                let targets = self.state.room_member_uids(&room, Some(header.sender_uid));
                let addrs = self.state.resolve_addrs(&targets);
                for addr in addrs {
                    let _ = self.socket.send_to(datagram, addr).await;
                }
            }
        }
        Ok(())
    }

    /// Forward `datagram` (unmodified) to every watcher of `streamer_uid`.
    /// Used for VIDEO, STREAM_AUDIO and STREAM_VOICES — the server does not
    /// filter STREAM_VOICES by speaker uid, mix-minus self-filtering happens
    /// client-side.
    async fn forward_to_watchers(&self, streamer_uid: u32, datagram: &[u8]) {
        let watcher_uids = self.state.watcher_uids(streamer_uid);
        if watcher_uids.is_empty() {
            return;
        }
        let addrs = self
            .state
            .resolve_addrs(&watcher_uids.into_iter().collect::<Vec<_>>());
        for addr in addrs {
            let _ = self.socket.send_to(datagram, addr).await;
        }
    }
}
