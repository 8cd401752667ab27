//! Capture + VAD + encode (M1–M3): turns microphone samples into outgoing
//! Opus packets. The cpal callback is synchronous and must never block, so
//! it only pushes raw samples into a bounded channel; VAD, encoding and
//! sequencing happen on a dedicated encode task reading from that channel.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream};
use opus::Encoder as OpusEncoder;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::{FRAME_SAMPLES, SAMPLE_RATE};
use crate::error::ClientError;
use crate::proto::{now_secs, UdpHeader, FLAG_STREAM_AUDIO, FLAG_WHISPER};

use super::dsp::Denoiser;
use super::vad::Vad;

/// Soft pre-encode limiter ceiling: frames peaking above
/// this are scaled down before int16/Opus conversion rather than clipped.
const PRE_ENCODE_LIMITER_CEILING: f32 = 0.98;

/// Opens the default (or named) input device and forwards 20ms frames to
/// `tx`. Returns the live `Stream` — drop it to stop capture. Mirrors the
/// per-sample-format dispatch (`build_input::<T>`), generalized
/// to resample into mono f32 frames of exactly [`FRAME_SAMPLES`].
pub fn start_capture(
    device_name: Option<&str>,
    tx: std::sync::mpsc::SyncSender<Vec<f32>>,
) -> Result<Stream, ClientError> {
    let host = cpal::default_host();
    let device = match device_name {
        Some(name) => host
            .input_devices()
            .map_err(|e| ClientError::Device(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| ClientError::Device(format!("input device '{name}' not found")))?,
        None => host
            .default_input_device()
            .ok_or_else(|| ClientError::Device("no default input device".to_string()))?,
    };

    let config = device
        .default_input_config()
        .map_err(|e| ClientError::Device(e.to_string()))?;
    let sample_format = config.sample_format();
    let stream_config: cpal::StreamConfig = config.into();
    let channels = stream_config.channels as usize;

    let err_fn = |e| warn!(error = %e, "input stream error");
    let ring = Arc::new(Mutex::new(Vec::<f32>::new()));

    let stream = match sample_format {
        SampleFormat::F32 => build_input_stream::<f32>(&device, &stream_config, channels, ring.clone(), tx, err_fn)?,
        SampleFormat::I16 => build_input_stream::<i16>(&device, &stream_config, channels, ring.clone(), tx, err_fn)?,
        SampleFormat::U16 => build_input_stream::<u16>(&device, &stream_config, channels, ring.clone(), tx, err_fn)?,
        other => return Err(ClientError::Device(format!("unsupported sample format {other:?}"))),
    };
    stream.play().map_err(|e| ClientError::Device(e.to_string()))?;
    info!(device = %device.name().unwrap_or_default(), "capture started");
    Ok(stream)
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    ring: Arc<Mutex<Vec<f32>>>,
    tx: std::sync::mpsc::SyncSender<Vec<f32>>,
    err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<Stream, ClientError>
where
    T: cpal::Sample + cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _| {
                let mut buf = ring.lock();
                for frame in data.chunks(channels) {
                    let mono: f32 = frame.iter().map(|s| f32::from_sample(*s)).sum::<f32>() / channels as f32;
                    buf.push(mono);
                }
                while buf.len() >= FRAME_SAMPLES {
                    let frame: Vec<f32> = buf.drain(..FRAME_SAMPLES).collect();
                    let _ = tx.try_send(frame);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| ClientError::Device(e.to_string()))
}

/// Captures system/loopback audio to share with watchers. Tries, in order: an
/// explicit `requested` device name, then each of
/// [`crate::config::LOOPBACK_DEVICE_CANDIDATES`] as a substring match against
/// available input device names (virtual-cable output, then OS monitor
/// sources). Logs every failed strategy before trying the next; returns an
/// error only once the whole chain is exhausted, so the caller can disable
/// stream audio for this session without aborting it.
pub fn start_loopback_capture(
    requested: Option<&str>,
    tx: std::sync::mpsc::SyncSender<Vec<f32>>,
) -> Result<Stream, ClientError> {
    let host = cpal::default_host();
    let devices: Vec<cpal::Device> = host
        .input_devices()
        .map_err(|e| ClientError::Device(e.to_string()))?
        .collect();

    let pick = |name: &str| devices.iter().find(|d| d.name().map(|n| n == name).unwrap_or(false)).cloned();

    let mut device = None;
    if let Some(name) = requested {
        match pick(name) {
            Some(d) => device = Some(d),
            None => warn!(device = name, "loopback strategy failed: requested device not found"),
        }
    }
    if device.is_none() {
        for candidate in crate::config::LOOPBACK_DEVICE_CANDIDATES {
            let found = devices.iter().find(|d| d.name().map(|n| n.contains(candidate)).unwrap_or(false));
            match found {
                Some(d) => {
                    info!(strategy = %candidate, device = %d.name().unwrap_or_default(), "loopback capture strategy matched");
                    device = Some(d.clone());
                    break;
                }
                None => warn!(strategy = %candidate, "loopback strategy failed: no matching device"),
            }
        }
    }
    let device = device.ok_or_else(|| ClientError::Device("no loopback/virtual-cable device found".to_string()))?;

    let config = device
        .default_input_config()
        .map_err(|e| ClientError::Device(e.to_string()))?;
    let sample_format = config.sample_format();
    let stream_config: cpal::StreamConfig = config.into();
    let channels = stream_config.channels as usize;
    let err_fn = |e| warn!(error = %e, "loopback stream error");
    let ring = Arc::new(Mutex::new(Vec::<f32>::new()));

    let stream = match sample_format {
        SampleFormat::F32 => build_input_stream::<f32>(&device, &stream_config, channels, ring.clone(), tx, err_fn)?,
        SampleFormat::I16 => build_input_stream::<i16>(&device, &stream_config, channels, ring.clone(), tx, err_fn)?,
        SampleFormat::U16 => build_input_stream::<u16>(&device, &stream_config, channels, ring.clone(), tx, err_fn)?,
        other => return Err(ClientError::Device(format!("unsupported sample format {other:?}"))),
    };
    stream.play().map_err(|e| ClientError::Device(e.to_string()))?;
    info!(device = %device.name().unwrap_or_default(), "loopback capture started");
    Ok(stream)
}

/// Opens an output stream that plays whatever the mixer writes into the
/// shared `output_ring` each callback.
pub fn start_playback(
    device_name: Option<&str>,
    pull: impl FnMut(&mut [f32]) + Send + 'static,
) -> Result<Stream, ClientError> {
    let host = cpal::default_host();
    let device = match device_name {
        Some(name) => host
            .output_devices()
            .map_err(|e| ClientError::Device(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| ClientError::Device(format!("output device '{name}' not found")))?,
        None => host
            .default_output_device()
            .ok_or_else(|| ClientError::Device("no default output device".to_string()))?,
    };
    let config = device
        .default_output_config()
        .map_err(|e| ClientError::Device(e.to_string()))?;
    let stream_config: cpal::StreamConfig = config.into();
    let mut pull = pull;
    let err_fn = |e| warn!(error = %e, "output stream error");
    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _| pull(data),
            err_fn,
            None,
        )
        .map_err(|e| ClientError::Device(e.to_string()))?;
    stream.play().map_err(|e| ClientError::Device(e.to_string()))?;
    Ok(stream)
}

/// Encode state machine (M3): VAD gate plus a tri-state send decision —
/// idle (keepalive only), normal voice, or whisper — and the sequence
/// bookkeeping that keeps whisper packets from ever resetting the
/// receiver's jitter buffer.
pub struct EncodeEngine {
    my_uid: u32,
    encoder: OpusEncoder,
    vad: Vad,
    denoiser: Option<Denoiser>,
    my_sequence: AtomicU32,
    whisper_sequence: AtomicU32,
    whisper_target_uid: Mutex<Option<u32>>,
}

pub enum EncodedOutgoing {
    /// Normal room voice (empty `opus` for a keep-alive).
    Voice { header: UdpHeader, opus: Vec<u8> },
    /// Whisper, still carrying the target uid to prefix on the wire.
    Whisper { header: UdpHeader, target_uid: u32, opus: Vec<u8> },
    /// The live frame sent a second time with `STREAM_AUDIO` (no `LOOPBACK`)
    /// so watchers hear the streamer's own mic voice, per spec §4.5 step 6's
    /// "broadcast audio to watchers" — distinct from the mix-minus relay of
    /// *other* speakers' voice (§4.6) and from system-loopback capture (M1).
    StreamAudio { header: UdpHeader, opus: Vec<u8> },
}

impl EncodeEngine {
    pub fn new(my_uid: u32, vad_threshold: f32, bitrate: i32, denoise: bool) -> Result<Self, ClientError> {
        let mut encoder = OpusEncoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
            .map_err(|e| ClientError::Codec(e.to_string()))?;
        encoder.set_bitrate(opus::Bitrate::Bits(bitrate)).ok();
        Ok(EncodeEngine {
            my_uid,
            encoder,
            vad: Vad::new(vad_threshold),
            denoiser: denoise.then(Denoiser::new),
            my_sequence: AtomicU32::new(0),
            whisper_sequence: AtomicU32::new(0),
            whisper_target_uid: Mutex::new(None),
        })
    }

    /// Begin whispering to `target_uid`. Continues the shared sequence
    /// counter rather than resetting to 0 — resetting would make the
    /// receiver's jitter buffer treat the first whisper frames as
    /// duplicates/too-old and drop them.
    pub fn start_whisper(&self, target_uid: u32) {
        let current = self.my_sequence.load(Ordering::SeqCst);
        self.whisper_sequence.store(current, Ordering::SeqCst);
        *self.whisper_target_uid.lock() = Some(target_uid);
    }

    /// Stop whispering, syncing `my_sequence` forward past whatever the
    /// whisper path consumed so normal packets never jump backward.
    pub fn stop_whisper(&self) {
        let whisper_seq = self.whisper_sequence.load(Ordering::SeqCst);
        self.my_sequence.fetch_max(whisper_seq, Ordering::SeqCst);
        *self.whisper_target_uid.lock() = None;
    }

    fn encode_opus(&mut self, samples: &[f32]) -> Result<Vec<u8>, ClientError> {
        let mut out = vec![0u8; 4000];
        let n = self
            .encoder
            .encode_float(samples, &mut out)
            .map_err(|e| ClientError::Codec(e.to_string()))?;
        out.truncate(n);
        Ok(out)
    }

    /// Feed one raw 20ms capture frame. Runs the optional denoiser and the
    /// pre-encode soft limiter before VAD/encode see
    /// it, so the pre-roll ring and the wire both carry the processed
    /// signal, not the raw capture. Returns zero or more packets to send —
    /// on speech onset that can be the flushed pre-roll frames (each its own
    /// datagram, own sequence number, in order) followed by the live frame;
    /// an empty vec is a plain keep-alive tick with nothing worth sending.
    ///
    /// `broadcast_to_watchers` mirrors the live (non-whisper, non-muted)
    /// frame into an extra [`EncodedOutgoing::StreamAudio`] packet sharing
    /// the same sequence number, so a streamer's own mic voice reaches
    /// watchers the same way loopback/system audio does (spec §4.5 step 6).
    pub fn process_frame(
        &mut self,
        raw_frame: &[f32],
        now: f64,
        muted: bool,
        broadcast_to_watchers: bool,
    ) -> Result<Vec<EncodedOutgoing>, ClientError> {
        let mut processed = raw_frame.to_vec();
        if let Some(denoiser) = self.denoiser.as_mut() {
            denoiser.process_frame(&mut processed);
        }
        super::dsp::scale_to_peak(&mut processed, PRE_ENCODE_LIMITER_CEILING);
        let frame = processed.as_slice();

        let was_talking = self.vad.was_talking();
        let talking = self.vad.process(frame, now);
        let just_started = self.vad.just_started_talking(was_talking, talking);

        let whisper_target = *self.whisper_target_uid.lock();

        if !talking {
            return Ok(Vec::new());
        }

        if let Some(target_uid) = whisper_target {
            let seq = self.whisper_sequence.fetch_add(1, Ordering::SeqCst);
            let opus = self.encode_opus(frame)?;
            let header = UdpHeader {
                sender_uid: self.my_uid,
                send_timestamp: now_secs(),
                sequence: seq,
                flags: FLAG_WHISPER,
            };
            return Ok(vec![EncodedOutgoing::Whisper { header, target_uid, opus }]);
        }
        if muted {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        if just_started {
            for pre in self.vad.drain_pre_roll() {
                let seq = self.my_sequence.fetch_add(1, Ordering::SeqCst);
                let opus = self.encode_opus(&pre)?;
                out.push(EncodedOutgoing::Voice {
                    header: UdpHeader {
                        sender_uid: self.my_uid,
                        send_timestamp: now_secs(),
                        sequence: seq,
                        flags: 0,
                    },
                    opus,
                });
            }
        }
        let seq = self.my_sequence.fetch_add(1, Ordering::SeqCst);
        let opus = self.encode_opus(frame)?;
        out.push(EncodedOutgoing::Voice {
            header: UdpHeader {
                sender_uid: self.my_uid,
                send_timestamp: now_secs(),
                sequence: seq,
                flags: 0,
            },
            opus: opus.clone(),
        });
        if broadcast_to_watchers {
            out.push(EncodedOutgoing::StreamAudio {
                header: UdpHeader {
                    sender_uid: self.my_uid,
                    send_timestamp: now_secs(),
                    sequence: seq,
                    flags: FLAG_STREAM_AUDIO,
                },
                opus,
            });
        }
        Ok(out)
    }
}
