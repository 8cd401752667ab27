//! Wire framing for the UDP media plane and the TCP control
//! plane's command vocabulary.
//!
//! The 17-byte header is network-byte-order `u32 sender_uid | f64
//! send_timestamp | u32 sequence | u8 flags`. Everything downstream
//! classifies once, here, into [`PacketKind`] and routes on that instead of
//! re-testing bits at every call site.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ProtoError;

pub const UDP_HEADER_SIZE: usize = 4 + 8 + 4 + 1;
/// 4-byte big-endian uid prefix used by WHISPER and STREAM_VOICES payloads.
pub const UID_PREFIX_SIZE: usize = 4;
/// frame_id(u32) | part_idx(u16) | total_parts(u16)
pub const VIDEO_CHUNK_HEADER_SIZE: usize = 4 + 2 + 2;

pub const FLAG_MUTE: u8 = 0x01;
pub const FLAG_DEAF: u8 = 0x02;
pub const FLAG_VIDEO: u8 = 0x04;
pub const FLAG_STREAM_AUDIO: u8 = 0x08;
pub const FLAG_LOOPBACK: u8 = 0x10;
pub const FLAG_STREAM_VOICES: u8 = 0x20;
pub const FLAG_WHISPER: u8 = 0x40;
/// Exact-match sentinel, not a bit to OR with the others.
pub const FLAG_PING: u8 = 0xFE;

/// A decoded 17-byte datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub sender_uid: u32,
    pub send_timestamp: f64,
    pub sequence: u32,
    pub flags: u8,
}

impl UdpHeader {
    pub fn encode(&self) -> [u8; UDP_HEADER_SIZE] {
        let mut out = [0u8; UDP_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.sender_uid.to_be_bytes());
        out[4..12].copy_from_slice(&self.send_timestamp.to_be_bytes());
        out[12..16].copy_from_slice(&self.sequence.to_be_bytes());
        out[16] = self.flags;
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < UDP_HEADER_SIZE {
            return Err(ProtoError::ShortHeader { len: buf.len() });
        }
        let sender_uid = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let send_timestamp = f64::from_be_bytes(buf[4..12].try_into().unwrap());
        let sequence = u32::from_be_bytes(buf[12..16].try_into().unwrap());
        let flags = buf[16];
        Ok(UdpHeader {
            sender_uid,
            send_timestamp,
            sequence,
            flags,
        })
    }
}

/// Current wall-clock time as seconds since the epoch, matching the
/// sender-clock semantics of `send_timestamp` (used only for RTT math, never
/// for ordering — ordering is by `sequence`).
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// One classified datagram. Built once at ingress/egress from the flag byte
/// plus whatever leading payload bytes the classification needs; everything
/// downstream matches on this rather than re-testing bits.
#[derive(Debug, Clone)]
pub enum PacketKind<'a> {
    Ping,
    Whisper { target_uid: u32, opus: &'a [u8] },
    Video { frame_id: u32, part_idx: u16, total_parts: u16, chunk: &'a [u8] },
    /// STREAM_AUDIO | STREAM_VOICES: a chat voice frame forwarded by a
    /// streamer for mix-minus, tagged with the *original* speaker's uid.
    StreamVoice { speaker_uid: u32, opus: &'a [u8] },
    /// STREAM_AUDIO alone: raw captured audio (mic or loopback, see `loopback`).
    StreamAudio { loopback: bool, opus: &'a [u8] },
    /// Normal room voice. `opus` is empty for a keep-alive (sequence == 0).
    Voice { opus: &'a [u8] },
}

/// Classify a datagram's payload (the bytes *after* the 17-byte header) given
/// its header's flags. Mirrors the forwarding/dispatch table in
/// §4.3 — server and client share this classification so the two stay in
/// sync by construction.
pub fn classify<'a>(header: &UdpHeader, payload: &'a [u8]) -> Result<PacketKind<'a>, ProtoError> {
    if header.flags == FLAG_PING {
        return Ok(PacketKind::Ping);
    }
    if header.flags & FLAG_WHISPER != 0 {
        if payload.len() < UID_PREFIX_SIZE {
            return Err(ProtoError::ShortPayload {
                kind: "whisper",
                len: payload.len(),
            });
        }
        let target_uid = u32::from_be_bytes(payload[0..4].try_into().unwrap());
        return Ok(PacketKind::Whisper {
            target_uid,
            opus: &payload[UID_PREFIX_SIZE..],
        });
    }
    if header.flags & FLAG_VIDEO != 0 {
        if payload.len() < VIDEO_CHUNK_HEADER_SIZE {
            return Err(ProtoError::ShortPayload {
                kind: "video",
                len: payload.len(),
            });
        }
        let frame_id = u32::from_be_bytes(payload[0..4].try_into().unwrap());
        let part_idx = u16::from_be_bytes(payload[4..6].try_into().unwrap());
        let total_parts = u16::from_be_bytes(payload[6..8].try_into().unwrap());
        return Ok(PacketKind::Video {
            frame_id,
            part_idx,
            total_parts,
            chunk: &payload[VIDEO_CHUNK_HEADER_SIZE..],
        });
    }
    if header.flags & FLAG_STREAM_AUDIO != 0 {
        if header.flags & FLAG_STREAM_VOICES != 0 {
            if payload.len() < UID_PREFIX_SIZE {
                return Err(ProtoError::ShortPayload {
                    kind: "stream_voices",
                    len: payload.len(),
                });
            }
            let speaker_uid = u32::from_be_bytes(payload[0..4].try_into().unwrap());
            return Ok(PacketKind::StreamVoice {
                speaker_uid,
                opus: &payload[UID_PREFIX_SIZE..],
            });
        }
        return Ok(PacketKind::StreamAudio {
            loopback: header.flags & FLAG_LOOPBACK != 0,
            opus: payload,
        });
    }
    Ok(PacketKind::Voice { opus: payload })
}

/// Build the 8-byte video fragment inner header: `frame_id | part_idx | total_parts`.
pub fn encode_video_chunk_header(frame_id: u32, part_idx: u16, total_parts: u16) -> [u8; VIDEO_CHUNK_HEADER_SIZE] {
    let mut out = [0u8; VIDEO_CHUNK_HEADER_SIZE];
    out[0..4].copy_from_slice(&frame_id.to_be_bytes());
    out[4..6].copy_from_slice(&part_idx.to_be_bytes());
    out[6..8].copy_from_slice(&total_parts.to_be_bytes());
    out
}

/// Prefix a payload with a big-endian uid, used for WHISPER's `target_uid`
/// and STREAM_VOICES's `speaker_uid`.
pub fn prefix_uid(uid: u32, opus: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(UID_PREFIX_SIZE + opus.len());
    out.extend_from_slice(&uid.to_be_bytes());
    out.extend_from_slice(opus);
    out
}

/// TCP control-plane command envelope. `action` dispatches; fields beyond it
/// are per-action and kept as a flat `serde_json::Value` map since the wire
/// format is "concatenated JSON objects" rather than a tagged enum (spec
/// §4.1, §6).
pub mod control {
    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Envelope {
        pub action: String,
        #[serde(flatten)]
        pub fields: std::collections::BTreeMap<String, Value>,
    }

    impl Envelope {
        pub fn new(action: &str) -> Self {
            Envelope {
                action: action.to_string(),
                fields: Default::default(),
            }
        }

        pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
            self.fields.insert(key.to_string(), value.into());
            self
        }

        pub fn get_str(&self, key: &str) -> Option<&str> {
            self.fields.get(key).and_then(|v| v.as_str())
        }

        pub fn get_u64(&self, key: &str) -> Option<u64> {
            self.fields.get(key).and_then(|v| v.as_u64())
        }

        pub fn get_bool(&self, key: &str) -> Option<bool> {
            self.fields.get(key).and_then(|v| v.as_bool())
        }
    }

    pub const LOGIN: &str = "login";
    pub const JOIN_ROOM: &str = "join_room";
    pub const UPDATE_USER: &str = "update_user";
    pub const UPDATE_STATUS: &str = "update_status";
    pub const UPDATE_PRESENCE: &str = "update_presence";
    pub const STREAM_START: &str = "stream_start";
    pub const STREAM_STOP: &str = "stream_stop";
    pub const STREAM_WATCH_START: &str = "stream_watch_start";
    pub const STREAM_WATCH_STOP: &str = "stream_watch_stop";
    pub const PLAY_SOUNDBOARD: &str = "play_soundboard";
    pub const NUDGE_VOTE: &str = "nudge_vote";

    pub const LOGIN_SUCCESS: &str = "login_success";
    pub const SYNC_USERS: &str = "sync_users";
    pub const REQUEST_KEYFRAME: &str = "request_keyframe";
    pub const PLAY_NUDGE: &str = "play_nudge";
    pub const NUDGE_TRIGGERED: &str = "nudge_triggered";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let h = UdpHeader {
            sender_uid: 111,
            send_timestamp: 12345.6789,
            sequence: 42,
            flags: FLAG_MUTE | FLAG_DEAF,
        };
        let bytes = h.encode();
        let back = UdpHeader::decode(&bytes).unwrap();
        assert_eq!(h, back);
    }

    #[test]
    fn short_header_rejected() {
        assert!(UdpHeader::decode(&[0u8; 4]).is_err());
    }

    #[test]
    fn classify_whisper() {
        let header = UdpHeader {
            sender_uid: 111,
            send_timestamp: 0.0,
            sequence: 5,
            flags: FLAG_WHISPER,
        };
        let mut payload = 222u32.to_be_bytes().to_vec();
        payload.extend_from_slice(b"opusdata");
        match classify(&header, &payload).unwrap() {
            PacketKind::Whisper { target_uid, opus } => {
                assert_eq!(target_uid, 222);
                assert_eq!(opus, b"opusdata");
            }
            other => panic!("wrong classification: {other:?}"),
        }
    }

    #[test]
    fn classify_stream_voices_vs_plain_stream_audio() {
        let header_voices = UdpHeader {
            sender_uid: 1,
            send_timestamp: 0.0,
            sequence: 1,
            flags: FLAG_STREAM_AUDIO | FLAG_STREAM_VOICES,
        };
        let mut payload = 999u32.to_be_bytes().to_vec();
        payload.extend_from_slice(b"xx");
        match classify(&header_voices, &payload).unwrap() {
            PacketKind::StreamVoice { speaker_uid, .. } => assert_eq!(speaker_uid, 999),
            other => panic!("{other:?}"),
        }

        let header_loopback = UdpHeader {
            sender_uid: 1,
            send_timestamp: 0.0,
            sequence: 1,
            flags: FLAG_STREAM_AUDIO | FLAG_LOOPBACK,
        };
        match classify(&header_loopback, b"opus").unwrap() {
            PacketKind::StreamAudio { loopback, opus } => {
                assert!(loopback);
                assert_eq!(opus, b"opus");
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn classify_video_fragment() {
        let header = UdpHeader {
            sender_uid: 1,
            send_timestamp: 0.0,
            sequence: 1,
            flags: FLAG_VIDEO,
        };
        let mut payload = encode_video_chunk_header(7, 2, 9).to_vec();
        payload.extend_from_slice(b"h264");
        match classify(&header, &payload).unwrap() {
            PacketKind::Video {
                frame_id,
                part_idx,
                total_parts,
                chunk,
            } => {
                assert_eq!((frame_id, part_idx, total_parts), (7, 2, 9));
                assert_eq!(chunk, b"h264");
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn classify_plain_voice_and_keepalive() {
        let header = UdpHeader {
            sender_uid: 1,
            send_timestamp: 0.0,
            sequence: 0,
            flags: FLAG_MUTE,
        };
        match classify(&header, &[]).unwrap() {
            PacketKind::Voice { opus } => assert!(opus.is_empty()),
            other => panic!("{other:?}"),
        }
    }
}
