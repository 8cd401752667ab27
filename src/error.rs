//! Per-subsystem error taxonomy (matches the propagation policy laid out for
//! media-path loops vs. subsystem init: init returns `Result` up to `main`,
//! steady-state loops log and continue).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("datagram too short for header: {len} bytes")]
    ShortHeader { len: usize },
    #[error("{kind} payload too short: {len} bytes")]
    ShortPayload { kind: &'static str, len: usize },
    #[error("control message malformed: {0}")]
    Control(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind TCP listener on {addr}: {source}")]
    TcpBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to bind UDP socket on {addr}: {source}")]
    UdpBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("control message error: {0}")]
    Proto(#[from] ProtoError),
    #[error("client {uid} not found")]
    UnknownClient { uid: u32 },
    #[error("room {room} not found")]
    UnknownRoom { room: String },
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect control channel to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("control channel disconnected")]
    ControlDisconnected,
    #[error("audio device error: {0}")]
    Device(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("video codec error: {0}")]
    VideoCodec(String),
    #[error("control message error: {0}")]
    Proto(#[from] ProtoError),
}
