//! Shared server state: the client registry (C1), the uid→UDP-endpoint map
//! (C2), and the watcher table (C3).
//!
//! Lock order is fixed and must never be taken out of order:
//! `watchers → clients → udp`. No lock may be held across a `sendto`/TCP
//! write — every routing path snapshots what it needs under lock, releases,
//! then does I/O.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

use crate::proto::control::Envelope;

/// One connected client, keyed by uid.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub uid: u32,
    pub nick: String,
    pub avatar: String,
    pub room: String,
    pub ip: String,
    pub status_icon: String,
    pub status_text: String,
    pub mute: bool,
    pub deaf: bool,
    pub is_streaming: bool,
}

/// A watcher's view of a streamer it is watching, stored per watcher uid.
#[derive(Debug, Clone)]
pub struct WatcherInfo {
    pub uid: u32,
    pub nick: String,
    pub avatar: String,
}

/// Per-connection handle used to push server→client control envelopes
/// without taking the registry lock during the send itself.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    pub tx: UnboundedSender<Envelope>,
}

pub struct SharedState {
    /// streamer_uid -> watcher_uid -> WatcherInfo
    pub watchers: Mutex<HashMap<u32, HashMap<u32, WatcherInfo>>>,
    /// uid -> ClientInfo, and uid -> ControlHandle for pushing envelopes.
    pub clients: Mutex<HashMap<u32, ClientInfo>>,
    pub control_handles: Mutex<HashMap<u32, ControlHandle>>,
    /// uid -> last known UDP source address.
    pub udp_map: Mutex<HashMap<u32, SocketAddr>>,
    /// uid -> room, a read-mostly cache so the UDP path doesn't need the
    /// full `clients` map to find a sender's room.
    pub uid_to_room: Mutex<HashMap<u32, String>>,
    /// room -> target_uid -> voter_uid -> unix timestamp, for nudge cooldown.
    pub nudge_votes: Mutex<HashMap<String, HashMap<u32, HashMap<u32, f64>>>>,

    pub stat_packets_routed: AtomicU64,
    pub stat_bytes_routed: AtomicU64,
}

impl SharedState {
    pub fn new() -> Self {
        SharedState {
            watchers: Mutex::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            control_handles: Mutex::new(HashMap::new()),
            udp_map: Mutex::new(HashMap::new()),
            uid_to_room: Mutex::new(HashMap::new()),
            nudge_votes: Mutex::new(HashMap::new()),
            stat_packets_routed: AtomicU64::new(0),
            stat_bytes_routed: AtomicU64::new(0),
        }
    }

    /// Members of `room` other than `exclude_uid`, snapshotted under the
    /// `clients` lock only (no nested lock taken here).
    pub fn room_member_uids(&self, room: &str, exclude_uid: Option<u32>) -> Vec<u32> {
        let clients = self.clients.lock();
        clients
            .values()
            .filter(|c| c.room == room && Some(c.uid) != exclude_uid)
            .map(|c| c.uid)
            .collect()
    }

    pub fn resolve_addrs(&self, uids: &[u32]) -> Vec<SocketAddr> {
        let udp = self.udp_map.lock();
        uids.iter().filter_map(|u| udp.get(u).copied()).collect()
    }

    /// Snapshot the set of uids watching `streamer_uid`, under the
    /// `watchers` lock only.
    pub fn watcher_uids(&self, streamer_uid: u32) -> HashSet<u32> {
        let watchers = self.watchers.lock();
        watchers
            .get(&streamer_uid)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Remove every trace of `uid` on disconnect: its own entries, and any
    /// edge where it appears as a watcher of someone else.
    pub fn remove_client(&self, uid: u32) {
        {
            let mut watchers = self.watchers.lock();
            watchers.remove(&uid);
            for set in watchers.values_mut() {
                set.remove(&uid);
            }
        }
        {
            let mut clients = self.clients.lock();
            clients.remove(&uid);
        }
        self.control_handles.lock().remove(&uid);
        {
            let mut udp = self.udp_map.lock();
            udp.remove(&uid);
        }
        {
            let mut uid_to_room = self.uid_to_room.lock();
            uid_to_room.remove(&uid);
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
