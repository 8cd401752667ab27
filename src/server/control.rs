//! TCP control processor (C5): one task per connection, a streaming JSON
//! decoder over concatenated (newline-less) objects, and the nudge-vote
//! wiring (C6).
//!
//! Lock-snapshot ordering for broadcasts follows the fixed order: take the
//! `watchers` snapshot first, then build per-room `clients` state from it,
//! then release both and do the writes.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{info, info_span, warn, Instrument};

use crate::config::{STATUS_ICON_MAX_LEN, STATUS_TEXT_MAX_LEN};
use crate::proto::control::{self, Envelope};
use crate::proto::now_secs;

use super::nudge::{self, VoteOutcome};
use super::state::{ClientInfo, ControlHandle, SharedState, WatcherInfo};

pub async fn run(listener: TcpListener, state: Arc<SharedState>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "tcp accept failed");
                continue;
            }
        };
        let state = state.clone();
        tokio::spawn(async move {
            let uid = login_uid();
            let span = info_span!("control_conn", %uid, %addr);
            if let Err(e) = handle_connection(stream, addr, uid, state.clone()).instrument(span).await {
                warn!(%uid, error = %e, "control connection ended with error");
            }
            state.remove_client(uid);
            nudge::clear_votes_for(&state, uid);
            broadcast_global_state(&state).await;
        });
    }
}

fn login_uid() -> u32 {
    rand::thread_rng().gen_range(1..=1_000_000_000u32)
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    addr: std::net::SocketAddr,
    uid: u32,
    state: Arc<SharedState>,
) -> anyhow::Result<()> {
    stream.set_nodelay(true).ok();
    let (mut read_half, mut write_half) = stream.into_split();

    let (tx, mut rx): (UnboundedSender<Envelope>, UnboundedReceiver<Envelope>) = mpsc::unbounded_channel();
    state.control_handles.lock().insert(uid, ControlHandle { tx: tx.clone() });

    let writer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            match serde_json::to_vec(&envelope) {
                Ok(bytes) => {
                    if write_half.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialize outgoing envelope"),
            }
        }
    });

    tx.send(Envelope::new(control::LOGIN_SUCCESS).with("uid", uid)).ok();

    state.clients.lock().insert(
        uid,
        ClientInfo {
            uid,
            nick: format!("user-{uid}"),
            avatar: String::new(),
            room: crate::config::DEFAULT_ROOM.to_string(),
            ip: addr.ip().to_string(),
            status_icon: String::new(),
            status_text: String::new(),
            mute: false,
            deaf: false,
            is_streaming: false,
        },
    );
    state
        .uid_to_room
        .lock()
        .insert(uid, crate::config::DEFAULT_ROOM.to_string());
    broadcast_global_state(&state).await;

    let mut buf = Vec::with_capacity(8192);
    let mut tmp = [0u8; 4096];
    loop {
        let n = read_half.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);

        loop {
            let mut de = serde_json::Deserializer::from_slice(&buf);
            match <Envelope as serde::Deserialize>::deserialize(&mut de) {
                Ok(envelope) => {
                    let consumed = de.byte_offset();
                    buf.drain(..consumed);
                    dispatch(&state, uid, envelope).await;
                }
                Err(e) if e.is_eof() => break,
                Err(e) => {
                    warn!(%uid, error = %e, "malformed control message, dropping connection");
                    writer.abort();
                    return Ok(());
                }
            }
        }
    }

    writer.abort();
    Ok(())
}

async fn dispatch(state: &Arc<SharedState>, uid: u32, envelope: Envelope) {
    match envelope.action.as_str() {
        control::JOIN_ROOM => {
            if let Some(room) = envelope.get_str("room") {
                let room = room.to_string();
                {
                    let mut clients = state.clients.lock();
                    if let Some(c) = clients.get_mut(&uid) {
                        c.room = room.clone();
                    }
                }
                state.uid_to_room.lock().insert(uid, room);
                broadcast_global_state(state).await;
            }
        }
        control::UPDATE_USER => {
            let mut clients = state.clients.lock();
            if let Some(c) = clients.get_mut(&uid) {
                if let Some(nick) = envelope.get_str("nick") {
                    c.nick = nick.to_string();
                }
                if let Some(avatar) = envelope.get_str("avatar") {
                    c.avatar = avatar.to_string();
                }
            }
            drop(clients);
            broadcast_global_state(state).await;
        }
        control::UPDATE_STATUS => {
            // Self-reported mute/deaf for the roster (the UDP flag bits on
            // each datagram are the latency-critical path; this keeps the
            // TCP-driven user list in sync for peers who aren't currently
            // receiving this uid's audio).
            let mut clients = state.clients.lock();
            if let Some(c) = clients.get_mut(&uid) {
                if let Some(mute) = envelope.get_bool("mute") {
                    c.mute = mute;
                }
                if let Some(deaf) = envelope.get_bool("deaf") {
                    c.deaf = deaf;
                }
            }
            drop(clients);
            broadcast_global_state(state).await;
        }
        control::UPDATE_PRESENCE => {
            // "Status" (icon + free text), server only stores/relays.
            let mut clients = state.clients.lock();
            if let Some(c) = clients.get_mut(&uid) {
                if let Some(icon) = envelope.get_str("status_icon") {
                    c.status_icon = truncate(icon, STATUS_ICON_MAX_LEN);
                }
                if let Some(text) = envelope.get_str("status_text") {
                    c.status_text = truncate(text, STATUS_TEXT_MAX_LEN);
                }
            }
            drop(clients);
            broadcast_global_state(state).await;
        }
        control::STREAM_START => {
            set_streaming(state, uid, true);
            broadcast_global_state(state).await;
        }
        control::STREAM_STOP => {
            set_streaming(state, uid, false);
            state.watchers.lock().remove(&uid);
            broadcast_global_state(state).await;
        }
        control::STREAM_WATCH_START => {
            if let Some(streamer_uid) = envelope.get_u64("streamer_uid").map(|v| v as u32) {
                let (nick, avatar) = {
                    let clients = state.clients.lock();
                    clients
                        .get(&uid)
                        .map(|c| (c.nick.clone(), c.avatar.clone()))
                        .unwrap_or_default()
                };
                state.watchers.lock().entry(streamer_uid).or_default().insert(
                    uid,
                    WatcherInfo {
                        uid,
                        nick,
                        avatar,
                    },
                );
                if let Some(handle) = state.control_handles.lock().get(&streamer_uid).cloned() {
                    let _ = handle.tx.send(Envelope::new(control::REQUEST_KEYFRAME));
                }
            }
        }
        control::STREAM_WATCH_STOP => {
            if let Some(streamer_uid) = envelope.get_u64("streamer_uid").map(|v| v as u32) {
                if let Some(set) = state.watchers.lock().get_mut(&streamer_uid) {
                    set.remove(&uid);
                }
            }
        }
        control::PLAY_SOUNDBOARD => {
            // Protocol pass-through only: relay the envelope to the sender's
            // room. Decoding/playing the referenced sound is client-side.
            let room = state.uid_to_room.lock().get(&uid).cloned();
            if let Some(room) = room {
                let targets = state.room_member_uids(&room, None);
                let handles = state.control_handles.lock();
                for t in targets {
                    if let Some(h) = handles.get(&t) {
                        let _ = h.tx.send(envelope.clone());
                    }
                }
            }
        }
        control::NUDGE_VOTE => {
            handle_nudge_vote(state, uid, &envelope).await;
        }
        control::LOGIN => {
            // Already acknowledged on connect; nick/avatar may arrive here
            // on some clients instead of a separate update_user.
            let mut clients = state.clients.lock();
            if let Some(c) = clients.get_mut(&uid) {
                if let Some(nick) = envelope.get_str("nick") {
                    c.nick = nick.to_string();
                }
                if let Some(avatar) = envelope.get_str("avatar") {
                    c.avatar = avatar.to_string();
                }
            }
            drop(clients);
        }
        other => {
            warn!(%uid, action = other, "unrecognized control action");
        }
    }
}

fn set_streaming(state: &SharedState, uid: u32, streaming: bool) {
    let mut clients = state.clients.lock();
    if let Some(c) = clients.get_mut(&uid) {
        c.is_streaming = streaming;
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

async fn handle_nudge_vote(state: &Arc<SharedState>, voter_uid: u32, envelope: &Envelope) {
    let Some(target_uid) = envelope.get_u64("target_uid").map(|v| v as u32) else {
        return;
    };
    let room = state.uid_to_room.lock().get(&voter_uid).cloned();
    let Some(room) = room else { return };
    let member_count = state.room_member_uids(&room, None).len();

    let outcome = nudge::record_vote(state, &room, target_uid, voter_uid, member_count, now_secs());
    match outcome {
        VoteOutcome::Triggered => {
            let (target_nick, voter_nick) = {
                let clients = state.clients.lock();
                (
                    clients.get(&target_uid).map(|c| c.nick.clone()).unwrap_or_default(),
                    clients.get(&voter_uid).map(|c| c.nick.clone()).unwrap_or_default(),
                )
            };
            if let Some(handle) = state.control_handles.lock().get(&target_uid).cloned() {
                let _ = handle.tx.send(Envelope::new(control::PLAY_NUDGE));
            }
            let targets = state.room_member_uids(&room, None);
            let handles = state.control_handles.lock();
            let msg = Envelope::new(control::NUDGE_TRIGGERED)
                .with("target_nick", target_nick)
                .with("voter_nick", voter_nick);
            for t in targets {
                if let Some(h) = handles.get(&t) {
                    let _ = h.tx.send(msg.clone());
                }
            }
        }
        VoteOutcome::Recorded | VoteOutcome::Cooldown => {}
    }
}

/// Rebuild and broadcast `sync_users`: one payload per room, each entry
/// carrying that client's public fields plus its nested watcher list.
/// Snapshot order is `watchers` first, then `clients`, matching the fixed
/// lock order so this never inverts against the router.
pub async fn broadcast_global_state(state: &Arc<SharedState>) {
    let watchers_snapshot = state.watchers.lock().clone();
    let clients_snapshot = state.clients.lock().clone();

    let mut by_room: HashMap<String, Vec<Value>> = HashMap::new();
    for client in clients_snapshot.values() {
        let watcher_list: Vec<Value> = watchers_snapshot
            .get(&client.uid)
            .map(|m| {
                m.values()
                    .map(|w| json!({"uid": w.uid, "nick": w.nick, "avatar": w.avatar}))
                    .collect()
            })
            .unwrap_or_default();
        by_room.entry(client.room.clone()).or_default().push(json!({
            "uid": client.uid,
            "nick": client.nick,
            "avatar": client.avatar,
            "status_icon": client.status_icon,
            "status_text": client.status_text,
            "mute": client.mute,
            "deaf": client.deaf,
            "is_streaming": client.is_streaming,
            "watchers": watcher_list,
        }));
    }

    let handles = state.control_handles.lock().clone();
    for client in clients_snapshot.values() {
        let Some(handle) = handles.get(&client.uid) else {
            continue;
        };
        let users = by_room.get(&client.room).cloned().unwrap_or_default();
        let envelope = Envelope::new(control::SYNC_USERS).with("users", Value::Array(users));
        let _ = handle.tx.send(envelope);
    }
    info!(rooms = by_room.len(), "broadcast sync_users");
}
