//! Constants from the external-interfaces section, plus the CLI-driven
//! configuration structs that let every one of them be overridden.

use clap::Parser;
use std::collections::HashMap;

pub const DEFAULT_PORT_TCP: u16 = 5000;
pub const DEFAULT_PORT_UDP: u16 = 5001;

pub const UDP_DATAGRAM_BUFFER_SIZE: usize = 65536;
pub const UDP_RECV_BUFFER_SIZE: usize = 8 * 1024 * 1024;
pub const UDP_SEND_BUFFER_SIZE: usize = 8 * 1024 * 1024;

pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: u16 = 1;
pub const FRAME_DURATION_MS: u32 = 20;
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE as usize * FRAME_DURATION_MS as usize) / 1000;

pub const VIDEO_WIDTH: u32 = 1280;
pub const VIDEO_HEIGHT: u32 = 720;
pub const VIDEO_FPS: u32 = 60;
pub const VIDEO_BITRATE: u32 = 6_000_000;
pub const MAX_VIDEO_PAYLOAD: usize = 1400;

pub const OPUS_APPLICATION_VOIP: i32 = 2048;
pub const DEFAULT_OPUS_BITRATE: i32 = 64_000;

pub const JITTER_TARGET_DELAY: usize = 4;
pub const JITTER_MAX_SIZE: usize = 50;

pub const VAD_HANGOVER_SECS: f64 = 0.4;
pub const VAD_PRE_ROLL_FRAMES: usize = 5;

pub const STREAM_MIC_DEDUPE_WINDOW_SECS: f64 = 1.5;
pub const SPEAKER_ACTIVITY_TIMEOUT_SECS: f64 = 1.5;

pub const WHISPER_LOWPASS_HZ: f64 = 4000.0;
pub const WHISPER_PITCH_SHIFT_SEMITONES: f64 = -4.0;
pub const WHISPER_EFFECT_DURATION_SECS: f64 = 2.0;
pub const WHISPER_AUTO_HIDE_SILENCE_SECS: f64 = 1.5;

pub const VIDEO_FRAME_REASSEMBLY_TIMEOUT_SECS: f64 = 1.0;
pub const VIDEO_MAX_INFLIGHT_FRAMES: usize = 5;
pub const VIDEO_DECODE_QUEUE_SIZE: usize = 2;
pub const VIDEO_PACING_QUEUE_SIZE: usize = 2000;
pub const VIDEO_PACING_SLEEP_THRESHOLD_SECS: f64 = 0.0005;

/// Left as an open configuration knob: exposed as
/// configurable rather than hardcoded. Default picked to match the
/// configured `VIDEO_BITRATE` at steady frame rate.
pub const DEFAULT_VIDEO_PACING_RATE_BYTES_SEC: u64 = VIDEO_BITRATE as u64 / 8;
/// Same Open Question: how often to proactively resend an IDR to a
/// degraded viewer. Default chosen conservatively; 0 disables proactive
/// resend and leaves keyframes purely on-demand via `request_keyframe`.
pub const DEFAULT_VIDEO_LOW_QUALITY_IDR_INTERVAL_MS: u64 = 0;

pub const PING_INTERVAL_SECS: f64 = 7.0;
pub const UDP_KEEPALIVE_INTERVAL_SECS: f64 = 1.0;
pub const PING_RTT_SMOOTHING_NEW_WEIGHT: f64 = 0.3;
pub const PING_RTT_SMOOTHING_OLD_WEIGHT: f64 = 0.7;

pub const MAX_SILENT_RECONNECT_ATTEMPTS: u32 = 4;
pub const RECONNECT_DELAY_SECS: f64 = 3.0;

pub const STATUS_ICON_MAX_LEN: usize = 64;
pub const STATUS_TEXT_MAX_LEN: usize = 30;

/// Room a freshly logged-in session is placed in before any `join_room`.
pub const DEFAULT_ROOM: &str = "General";

pub const NUDGE_VOTE_COOLDOWN_SECS: f64 = 30.0;

/// Ordered substrings tried, in order, against input device names when no
/// explicit `--loopback-device` is given: a virtual-cable output first, then
/// the common OS-level loopback monitor names. First match wins.
pub const LOOPBACK_DEVICE_CANDIDATES: &[&str] = &["CABLE Output", "Monitor of", "Stereo Mix"];

/// Server-side CLI configuration (clap derive).
#[derive(Debug, Clone, Parser)]
#[command(name = "sfu-server", about = "Selective-forwarding voice/video server")]
pub struct ServerConfig {
    #[arg(long, default_value = "0.0.0.0")]
    pub bind_host: String,

    #[arg(long, default_value_t = DEFAULT_PORT_TCP)]
    pub tcp_port: u16,

    #[arg(long, default_value_t = DEFAULT_PORT_UDP)]
    pub udp_port: u16,

    #[arg(long, default_value_t = UDP_RECV_BUFFER_SIZE)]
    pub udp_recv_buffer_size: usize,

    #[arg(long, default_value_t = UDP_SEND_BUFFER_SIZE)]
    pub udp_send_buffer_size: usize,

    #[arg(long, default_value_t = NUDGE_VOTE_COOLDOWN_SECS)]
    pub nudge_cooldown_secs: f64,

    #[arg(long, default_value = "logs")]
    pub log_dir: String,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_host: "0.0.0.0".to_string(),
            tcp_port: DEFAULT_PORT_TCP,
            udp_port: DEFAULT_PORT_UDP,
            udp_recv_buffer_size: UDP_RECV_BUFFER_SIZE,
            udp_send_buffer_size: UDP_SEND_BUFFER_SIZE,
            nudge_cooldown_secs: NUDGE_VOTE_COOLDOWN_SECS,
            log_dir: "logs".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Client-side CLI configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "voice-client", about = "Headless voice/video client engine")]
pub struct ClientConfig {
    #[arg(long)]
    pub server_host: String,

    #[arg(long, default_value_t = DEFAULT_PORT_TCP)]
    pub tcp_port: u16,

    #[arg(long, default_value_t = DEFAULT_PORT_UDP)]
    pub udp_port: u16,

    #[arg(long)]
    pub nickname: String,

    #[arg(long, default_value = "lobby")]
    pub room: String,

    #[arg(long, default_value_t = DEFAULT_OPUS_BITRATE)]
    pub opus_bitrate: i32,

    /// RMS threshold above which the VAD gate opens.
    #[arg(long, default_value_t = 0.02)]
    pub vad_threshold: f32,

    #[arg(long, default_value_t = JITTER_TARGET_DELAY)]
    pub jitter_target_delay: usize,

    #[arg(long, default_value_t = JITTER_MAX_SIZE)]
    pub jitter_max_size: usize,

    #[arg(long, default_value_t = DEFAULT_VIDEO_PACING_RATE_BYTES_SEC)]
    pub video_pacing_rate_bytes_sec: u64,

    #[arg(long, default_value_t = DEFAULT_VIDEO_LOW_QUALITY_IDR_INTERVAL_MS)]
    pub video_low_quality_idr_interval_ms: u64,

    #[arg(long)]
    pub input_device: Option<String>,

    #[arg(long)]
    pub output_device: Option<String>,

    /// Start with stream-audio publishing already on: mirrors the live mic
    /// frame to watchers with `STREAM_AUDIO` and, when a loopback/virtual-cable
    /// device is available, also captures and streams system audio with
    /// `STREAM_AUDIO | LOOPBACK`.
    #[arg(long, default_value_t = false)]
    pub broadcast_audio: bool,

    /// RNN-based noise suppression on the capture path.
    /// May be disabled by the user for low-powered devices or to avoid its
    /// artifacts on already-clean input.
    #[arg(long, default_value_t = true)]
    pub denoise: bool,

    /// Device name for system/loopback audio capture, tried before the
    /// built-in fallback chain.
    #[arg(long)]
    pub loopback_device: Option<String>,

    /// Mix level applied to every streamed-audio slot (mic broadcast, system
    /// loopback, and mix-minus-relayed chat voice), independent of each
    /// normal speaker's own per-user volume.
    #[arg(long, default_value_t = 1.0)]
    pub stream_volume: f32,

    #[arg(long, default_value = "logs")]
    pub log_dir: String,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Read interface for per-user persisted preferences (device names, per-peer
/// volume, known-user list). The backing store itself is out of scope; the
/// client engine only ever reads this at startup and on an explicit
/// "config applied" event from the UI thread, never polls it from the audio
/// callback.
pub trait SettingsStore: Send + Sync {
    fn volume_for(&self, uid: u32) -> f32;
    fn input_device_name(&self) -> Option<String>;
    fn output_device_name(&self) -> Option<String>;
}

/// In-memory default, sufficient for headless operation and tests.
#[derive(Debug, Default)]
pub struct InMemorySettingsStore {
    pub volumes: HashMap<u32, f32>,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl SettingsStore for InMemorySettingsStore {
    fn volume_for(&self, uid: u32) -> f32 {
        self.volumes.get(&uid).copied().unwrap_or(1.0)
    }

    fn input_device_name(&self) -> Option<String> {
        self.input_device.clone()
    }

    fn output_device_name(&self) -> Option<String> {
        self.output_device.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_samples_matches_20ms_at_48k() {
        assert_eq!(FRAME_SAMPLES, 960);
    }

    #[test]
    fn default_settings_store_has_unity_volume() {
        let store = InMemorySettingsStore::default();
        assert_eq!(store.volume_for(42), 1.0);
    }
}
