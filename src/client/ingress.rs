//! Ingress demux (M5): classify each incoming datagram once and route it to
//! the jitter buffer, video pipeline, or whisper handler it belongs to.
//! Mirrors the dispatch table a receive loop runs per packet.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::trace;

use crate::config::STREAM_MIC_DEDUPE_WINDOW_SECS;
use crate::error::ProtoError;
use crate::proto::{self, PacketKind, UdpHeader};

use super::mixer::{StreamSource, StreamUserRegistry, UserRegistry};
use super::video::SenderPipeline;

/// Smoothed round-trip-time estimate, updated on every PING echo.
pub struct RttEstimator {
    inner: Mutex<Option<f64>>,
}

impl RttEstimator {
    pub fn new() -> Self {
        RttEstimator { inner: Mutex::new(None) }
    }

    /// `sample` is the measured round trip in seconds for one ping echo.
    pub fn update(&self, sample: f64) {
        use crate::config::{PING_RTT_SMOOTHING_NEW_WEIGHT, PING_RTT_SMOOTHING_OLD_WEIGHT};
        let mut guard = self.inner.lock();
        *guard = Some(match *guard {
            Some(prev) => prev * PING_RTT_SMOOTHING_OLD_WEIGHT + sample * PING_RTT_SMOOTHING_NEW_WEIGHT,
            None => sample,
        });
    }

    pub fn get(&self) -> Option<f64> {
        *self.inner.lock()
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks, per uid, the last time a *regular room voice* packet arrived —
/// used to deduplicate a streamer's own mic audio between the normal room
/// path and the stream-audio path a watcher also receives.
#[derive(Default)]
pub struct RecentVoiceTracker {
    last_seen: Mutex<std::collections::HashMap<u32, Instant>>,
}

impl RecentVoiceTracker {
    pub fn mark(&self, uid: u32) {
        self.last_seen.lock().insert(uid, Instant::now());
    }

    pub fn recently_heard(&self, uid: u32) -> bool {
        self.last_seen
            .lock()
            .get(&uid)
            .map(|t| t.elapsed().as_secs_f64() < STREAM_MIC_DEDUPE_WINDOW_SECS)
            .unwrap_or(false)
    }
}

pub struct IngressContext {
    pub my_uid: u32,
    pub users: Arc<UserRegistry>,
    pub streams: Arc<StreamUserRegistry>,
    pub rtt: Arc<RttEstimator>,
    pub recent_voice: Arc<RecentVoiceTracker>,
    pub video_pipelines: Mutex<std::collections::HashMap<u32, Arc<SenderPipeline>>>,
}

impl IngressContext {
    pub fn new(my_uid: u32, users: Arc<UserRegistry>, streams: Arc<StreamUserRegistry>) -> Self {
        IngressContext {
            my_uid,
            users,
            streams,
            rtt: Arc::new(RttEstimator::new()),
            recent_voice: Arc::new(RecentVoiceTracker::default()),
            video_pipelines: Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn video_pipeline_for(&self, uid: u32) -> Arc<SenderPipeline> {
        let mut pipelines = self.video_pipelines.lock();
        pipelines
            .entry(uid)
            .or_insert_with(|| Arc::new(SenderPipeline::new()))
            .clone()
    }

    pub fn handle_ping_echo(&self, sent_at: f64, now: f64) {
        self.rtt.update((now - sent_at).max(0.0));
    }

    /// `on_whisper` fires on every whisper packet (not just the first) so a
    /// UI auto-hide timer can keep resetting for as long as the whisper
    /// continues.
    pub fn handle_datagram(&self, datagram: &[u8], now: f64, on_whisper: impl FnOnce(u32)) -> Result<(), ProtoError> {
        let header = UdpHeader::decode(datagram)?;
        if header.sender_uid == self.my_uid && header.flags != proto::FLAG_PING {
            // Our own packet looped back (e.g. via a misconfigured relay);
            // never mix or decode our own voice.
            return Ok(());
        }
        let payload = &datagram[proto::UDP_HEADER_SIZE..];
        let kind = proto::classify(&header, payload)?;

        match kind {
            PacketKind::Ping => {
                self.handle_ping_echo(header.send_timestamp, now);
            }
            PacketKind::Video { frame_id, part_idx, total_parts, chunk } => {
                let pipeline = self.video_pipeline_for(header.sender_uid);
                pipeline.process_chunk(frame_id, part_idx, total_parts, chunk);
            }
            PacketKind::StreamVoice { speaker_uid, opus } => {
                if speaker_uid == self.my_uid {
                    trace!("dropping own mix-minus voice (self-hearing prevention)");
                    return Ok(());
                }
                self.route_to_stream(StreamSource::Microphone(speaker_uid), header.sequence, opus);
            }
            PacketKind::StreamAudio { loopback, opus } => {
                if loopback {
                    // Always played: captured system audio, never overlaps
                    // with anything the normal voice path could also be
                    // carrying for this uid.
                    self.route_to_stream(StreamSource::Loopback(header.sender_uid), header.sequence, opus);
                } else {
                    if self.recent_voice.recently_heard(header.sender_uid) {
                        trace!(uid = header.sender_uid, "suppressing duplicate stream-audio of a live room voice");
                        return Ok(());
                    }
                    self.route_to_stream(StreamSource::Microphone(header.sender_uid), header.sequence, opus);
                }
            }
            PacketKind::Whisper { target_uid, opus } => {
                if target_uid != self.my_uid {
                    return Ok(());
                }
                self.route_to_jitter(header.sender_uid, header.sequence, opus);
                on_whisper(header.sender_uid);
            }
            PacketKind::Voice { opus } => {
                self.recent_voice.mark(header.sender_uid);
                self.route_to_jitter(header.sender_uid, header.sequence, opus);
            }
        }
        Ok(())
    }

    fn route_to_jitter(&self, uid: u32, sequence: u32, opus: &[u8]) {
        if opus.is_empty() {
            return;
        }
        let user = self.users.get_or_insert(uid);
        user.jitter.lock().add(sequence, opus.to_vec());
        *user.last_packet_time.lock() = crate::proto::now_secs();
    }

    fn route_to_stream(&self, source: StreamSource, sequence: u32, opus: &[u8]) {
        if opus.is_empty() {
            return;
        }
        let user = self.streams.get_or_insert(source);
        user.jitter.lock().add(sequence, opus.to_vec());
        *user.last_packet_time.lock() = crate::proto::now_secs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_self_originated_stream_voice() {
        let users = Arc::new(UserRegistry::new());
        let streams = Arc::new(StreamUserRegistry::new());
        let ctx = IngressContext::new(42, users.clone(), streams);
        let mut payload = 42u32.to_be_bytes().to_vec();
        payload.extend_from_slice(b"opus");
        let header = UdpHeader {
            sender_uid: 7,
            send_timestamp: 0.0,
            sequence: 1,
            flags: proto::FLAG_STREAM_AUDIO | proto::FLAG_STREAM_VOICES,
        };
        let mut datagram = header.encode().to_vec();
        datagram.extend_from_slice(&payload);
        ctx.handle_datagram(&datagram, 0.0, |_| {}).unwrap();
        assert!(!users.snapshot().0.contains_key(&7));
    }

    #[test]
    fn whisper_for_other_uid_is_ignored() {
        let users = Arc::new(UserRegistry::new());
        let streams = Arc::new(StreamUserRegistry::new());
        let ctx = IngressContext::new(42, users.clone(), streams);
        let mut payload = 99u32.to_be_bytes().to_vec();
        payload.extend_from_slice(b"opus");
        let header = UdpHeader {
            sender_uid: 7,
            send_timestamp: 0.0,
            sequence: 1,
            flags: proto::FLAG_WHISPER,
        };
        let mut datagram = header.encode().to_vec();
        datagram.extend_from_slice(&payload);
        let mut fired = false;
        ctx.handle_datagram(&datagram, 0.0, |_| fired = true).unwrap();
        assert!(!fired);
    }
}
