//! Cross-module TCP control-plane scenarios: real
//! connections against `server::control::run`, exercising the streaming
//! JSON framing, room join broadcasts, and the nudge-vote threshold end to
//! end rather than unit-testing `nudge::record_vote` in isolation.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use voicelink::proto::control::{self, Envelope};
use voicelink::server::state::SharedState;

async fn connect(addr: std::net::SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.unwrap()
}

async fn send(stream: &mut TcpStream, envelope: Envelope) {
    stream.write_all(&serde_json::to_vec(&envelope).unwrap()).await.unwrap();
}

/// Reads and discards envelopes from `stream` until one with `action`
/// arrives, or the timeout elapses. Mirrors the streaming-JSON
/// `byte_offset()` advance pattern `server/control.rs` and `client/network.rs`
/// both use for concatenated-object framing.
async fn read_until(stream: &mut TcpStream, buf: &mut Vec<u8>, action: &str) -> Envelope {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let mut de = serde_json::Deserializer::from_slice(buf);
            match <Envelope as serde::Deserialize>::deserialize(&mut de) {
                Ok(envelope) => {
                    let consumed = de.byte_offset();
                    buf.drain(..consumed);
                    if envelope.action == action {
                        return envelope;
                    }
                }
                Err(e) if e.is_eof() => {
                    let mut tmp = [0u8; 4096];
                    let n = stream.read(&mut tmp).await.unwrap();
                    assert!(n > 0, "connection closed before {action} arrived");
                    buf.extend_from_slice(&tmp[..n]);
                }
                Err(e) => panic!("malformed control envelope: {e}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {action}"))
}

#[tokio::test]
async fn login_places_a_session_in_the_default_room_before_any_join() {
    let state = Arc::new(SharedState::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(voicelink::server::control::run(listener, state));

    let mut alice = connect(addr).await;
    let mut abuf = Vec::new();
    let login = read_until(&mut alice, &mut abuf, control::LOGIN_SUCCESS).await;
    let alice_uid = login.get_u64("uid").unwrap();

    let sync = read_until(&mut alice, &mut abuf, control::SYNC_USERS).await;
    let users = sync.fields.get("users").and_then(|v| v.as_array()).expect("users array");
    assert!(
        users.iter().any(|u| u["uid"].as_u64() == Some(alice_uid)),
        "login alone (no join_room yet) should already place the session in the default room and broadcast it"
    );
}

#[tokio::test]
async fn login_then_join_room_gets_sync_users_with_self_listed() {
    let state = Arc::new(SharedState::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(voicelink::server::control::run(listener, state));

    let mut alice = connect(addr).await;
    let mut abuf = Vec::new();
    let login = read_until(&mut alice, &mut abuf, control::LOGIN_SUCCESS).await;
    let alice_uid = login.get_u64("uid").expect("login_success carries uid");

    send(&mut alice, Envelope::new(control::JOIN_ROOM).with("room", "general")).await;

    let sync = read_until(&mut alice, &mut abuf, control::SYNC_USERS).await;
    let users = sync.fields.get("users").and_then(|v| v.as_array()).expect("users array");
    assert!(users.iter().any(|u| u["uid"].as_u64() == Some(alice_uid)));
}

#[tokio::test]
async fn stream_watch_start_requests_a_keyframe_from_the_streamer() {
    let state = Arc::new(SharedState::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(voicelink::server::control::run(listener, state));

    let mut streamer = connect(addr).await;
    let mut sbuf = Vec::new();
    let streamer_uid = read_until(&mut streamer, &mut sbuf, control::LOGIN_SUCCESS)
        .await
        .get_u64("uid")
        .unwrap();
    send(&mut streamer, Envelope::new(control::STREAM_START)).await;

    let mut watcher = connect(addr).await;
    let mut wbuf = Vec::new();
    read_until(&mut watcher, &mut wbuf, control::LOGIN_SUCCESS).await;
    send(&mut watcher, Envelope::new(control::STREAM_WATCH_START).with("streamer_uid", streamer_uid)).await;

    read_until(&mut streamer, &mut sbuf, control::REQUEST_KEYFRAME).await;
}

#[tokio::test]
async fn nudge_triggers_once_every_other_room_member_votes() {
    let state = Arc::new(SharedState::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(voicelink::server::control::run(listener, state));

    let mut a = connect(addr).await;
    let mut abuf = Vec::new();
    let uid_a = read_until(&mut a, &mut abuf, control::LOGIN_SUCCESS).await.get_u64("uid").unwrap();
    send(&mut a, Envelope::new(control::JOIN_ROOM).with("room", "nudge-room")).await;
    read_until(&mut a, &mut abuf, control::SYNC_USERS).await;

    let mut b = connect(addr).await;
    let mut bbuf = Vec::new();
    let uid_b = read_until(&mut b, &mut bbuf, control::LOGIN_SUCCESS).await.get_u64("uid").unwrap();
    send(&mut b, Envelope::new(control::JOIN_ROOM).with("room", "nudge-room")).await;
    read_until(&mut b, &mut bbuf, control::SYNC_USERS).await;

    let mut c = connect(addr).await;
    let mut cbuf = Vec::new();
    let uid_c = read_until(&mut c, &mut cbuf, control::LOGIN_SUCCESS).await.get_u64("uid").unwrap();
    send(&mut c, Envelope::new(control::JOIN_ROOM).with("room", "nudge-room")).await;
    read_until(&mut c, &mut cbuf, control::SYNC_USERS).await;

    assert_ne!(uid_a, uid_b);
    assert_ne!(uid_a, uid_c);
    assert_ne!(uid_b, uid_c);

    // Room has 3 members; the vote threshold for nudging c is the other 2
    // (a and b) — one vote alone must not be enough.
    send(&mut a, Envelope::new(control::NUDGE_VOTE).with("target_uid", uid_c)).await;
    send(&mut b, Envelope::new(control::NUDGE_VOTE).with("target_uid", uid_c)).await;

    read_until(&mut c, &mut cbuf, control::PLAY_NUDGE).await;
}
