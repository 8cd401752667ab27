//! Client media engine: capture/VAD/encode (M1–M3), egress pacing (M4),
//! ingress demux (M5), jitter buffering (M6), mixing/DSP (M7), and the
//! video pipeline (M8), wired together by the network engine.

pub mod capture;
pub mod dsp;
pub mod egress;
pub mod ingress;
pub mod jitter;
pub mod mixer;
pub mod network;
pub mod video;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::proto::{self, control::{self, Envelope}, UdpHeader};

use capture::EncodeEngine;
use ingress::IngressContext;
use mixer::{mix_tick, BroadcastState, StreamUserRegistry, StreamVoiceSequencer, UserRegistry, WhisperInEffect};
use network::PresenceFlags;

/// Ties the capture/encode/network/mixer pieces into one running engine.
/// This is what `voice-client`'s binary drives; a GUI shell would drive the
/// same type from its own event loop.
pub struct ClientEngine {
    pub config: ClientConfig,
    pub users: Arc<UserRegistry>,
    pub streams: Arc<StreamUserRegistry>,
    pub presence: Arc<PresenceFlags>,
    pub broadcast: Arc<BroadcastState>,
    pub whisper_in: Arc<Mutex<WhisperInEffect>>,
    _input_stream: Option<cpal::Stream>,
    _loopback_stream: Option<cpal::Stream>,
    _output_stream: Option<cpal::Stream>,
}

impl ClientEngine {
    /// Logs in, joins `config.room`, and starts capture/playback/network
    /// loops. Returns once everything is up and running in the background.
    pub async fn start(config: ClientConfig) -> Result<Self, ClientError> {
        let uid = rand::random::<u32>().max(1);
        let presence = Arc::new(PresenceFlags::new(uid));
        let users = Arc::new(UserRegistry::with_jitter_params(config.jitter_target_delay, config.jitter_max_size));
        let streams = Arc::new(StreamUserRegistry::with_jitter_params(
            config.jitter_target_delay,
            config.jitter_max_size,
        ));
        let ingress = Arc::new(IngressContext::new(uid, users.clone(), streams.clone()));
        let whisper_in = Arc::new(Mutex::new(WhisperInEffect::new(crate::config::SAMPLE_RATE as f64)));
        let broadcast = Arc::new(BroadcastState::new());
        broadcast.set_stream_volume(config.stream_volume);
        let sv_sequencer = Arc::new(StreamVoiceSequencer::default());

        let whisper_in_for_udp = whisper_in.clone();
        let (handles, _alive) = network::connect_and_run(
            config.server_host.clone(),
            config.tcp_port,
            config.udp_port,
            presence.clone(),
            ingress.clone(),
            move |envelope: Envelope| {
                handle_server_envelope(&envelope);
            },
            move |whisperer_uid: u32| {
                // Re-armed on every whisper packet, not just the first, so
                // the effect (and a UI auto-hide timer) keeps resetting for
                // as long as the whisper continues (spec §4.2 example 2).
                whisper_in_for_udp.lock().start(whisperer_uid, crate::proto::now_secs());
            },
        )
        .await?;

        handles
            .control_tx
            .send(Envelope::new(control::JOIN_ROOM).with("room", config.room.clone()))
            .ok();
        handles
            .control_tx
            .send(Envelope::new(control::UPDATE_USER).with("nick", config.nickname.clone()))
            .ok();

        let mut encoder = EncodeEngine::new(uid, config.vad_threshold, config.opus_bitrate, config.denoise)?;
        let (sample_tx, sample_rx) = std::sync::mpsc::sync_channel::<Vec<f32>>(32);
        let input_stream = capture::start_capture(config.input_device.as_deref(), sample_tx).ok();

        {
            let udp_tx = handles.udp_tx.clone();
            let broadcast_mic_to_watchers = config.broadcast_audio;
            std::thread::spawn(move || {
                while let Ok(frame) = sample_rx.recv() {
                    let now = crate::proto::now_secs();
                    match encoder.process_frame(&frame, now, false, broadcast_mic_to_watchers) {
                        Ok(packets) => {
                            for packet in packets {
                                match packet {
                                    capture::EncodedOutgoing::Voice { header, opus } => {
                                        let mut datagram = header.encode().to_vec();
                                        datagram.extend_from_slice(&opus);
                                        let _ = udp_tx.send(datagram);
                                    }
                                    capture::EncodedOutgoing::Whisper { header, target_uid, opus } => {
                                        let mut datagram = header.encode().to_vec();
                                        datagram.extend_from_slice(&crate::proto::prefix_uid(target_uid, &opus));
                                        let _ = udp_tx.send(datagram);
                                    }
                                    capture::EncodedOutgoing::StreamAudio { header, opus } => {
                                        let mut datagram = header.encode().to_vec();
                                        datagram.extend_from_slice(&opus);
                                        let _ = udp_tx.send(datagram);
                                    }
                                }
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "frame encode failed"),
                    }
                }
            });
        }

        if config.broadcast_audio {
            broadcast.set_sending(true);
            handles.control_tx.send(Envelope::new(control::STREAM_START)).ok();
        }
        let loopback_stream = if config.broadcast_audio {
            let (lb_tx, lb_rx) = std::sync::mpsc::sync_channel::<Vec<f32>>(32);
            match capture::start_loopback_capture(config.loopback_device.as_deref(), lb_tx) {
                Ok(stream) => {
                    let mut lb_encoder = opus::Encoder::new(
                        crate::config::SAMPLE_RATE,
                        opus::Channels::Mono,
                        opus::Application::Audio,
                    )
                    .map_err(|e| ClientError::Codec(e.to_string()))?;
                    lb_encoder.set_bitrate(opus::Bitrate::Bits(config.opus_bitrate)).ok();
                    let udp_tx = handles.udp_tx.clone();
                    std::thread::spawn(move || {
                        let mut sequence: u32 = 0;
                        let mut scratch = vec![0u8; 4000];
                        while let Ok(frame) = lb_rx.recv() {
                            let n = match lb_encoder.encode_float(&frame, &mut scratch) {
                                Ok(n) => n,
                                Err(e) => {
                                    tracing::warn!(error = %e, "loopback frame encode failed");
                                    continue;
                                }
                            };
                            let header = UdpHeader {
                                sender_uid: uid,
                                send_timestamp: crate::proto::now_secs(),
                                sequence,
                                flags: proto::FLAG_STREAM_AUDIO | proto::FLAG_LOOPBACK,
                            };
                            sequence = sequence.wrapping_add(1);
                            let mut datagram = header.encode().to_vec();
                            datagram.extend_from_slice(&scratch[..n]);
                            let _ = udp_tx.send(datagram);
                        }
                    });
                    Some(stream)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "loopback capture unavailable, stream audio disabled");
                    None
                }
            }
        } else {
            None
        };

        let mixer_users = users.clone();
        let mixer_streams = streams.clone();
        let mixer_whisper = whisper_in.clone();
        let mixer_broadcast = broadcast.clone();
        let mix_minus_tx = handles.udp_tx.clone();
        let mix_minus_sequencer = sv_sequencer.clone();
        let output_stream = capture::start_playback(config.output_device.as_deref(), move |out: &mut [f32]| {
            for chunk in out.chunks_mut(crate::config::FRAME_SAMPLES) {
                let now = crate::proto::now_secs();
                let users_snapshot = mixer_users.snapshot();
                let streams_snapshot = mixer_streams.snapshot();
                let mut whisper = mixer_whisper.lock();
                let relay = mix_tick(
                    &users_snapshot,
                    &streams_snapshot,
                    &mut whisper,
                    false,
                    mixer_broadcast.is_sending(),
                    mixer_broadcast.stream_volume(),
                    now,
                    chunk,
                );
                for frame in relay {
                    let header = UdpHeader {
                        sender_uid: uid,
                        send_timestamp: now,
                        sequence: mix_minus_sequencer.next(),
                        flags: proto::FLAG_STREAM_AUDIO | proto::FLAG_STREAM_VOICES,
                    };
                    let mut datagram = header.encode().to_vec();
                    datagram.extend_from_slice(&crate::proto::prefix_uid(frame.speaker_uid, &frame.opus));
                    let _ = mix_minus_tx.send(datagram);
                }
            }
        })
        .ok();

        info!(uid, room = %config.room, "client engine started");

        Ok(ClientEngine {
            config,
            users,
            streams,
            presence,
            broadcast,
            whisper_in,
            _input_stream: input_stream,
            _loopback_stream: loopback_stream,
            _output_stream: output_stream,
        })
    }
}

fn handle_server_envelope(envelope: &Envelope) {
    match envelope.action.as_str() {
        control::LOGIN_SUCCESS => {
            info!("login acknowledged by server");
        }
        control::SYNC_USERS => {
            // Room roster update; a GUI shell would refresh its user list
            // here. The headless engine has nothing further to do.
        }
        control::REQUEST_KEYFRAME => {
            // Forwarded to the active video encoder by whatever owns it;
            // the engine itself doesn't hold an encoder instance.
        }
        control::PLAY_NUDGE | control::NUDGE_TRIGGERED | control::PLAY_SOUNDBOARD => {
            // Sound playback is out of scope; only the protocol event
            // reaches here for a UI/sound layer to act on.
        }
        _ => {}
    }
}
