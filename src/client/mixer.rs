//! Mixer (M7): combines every active remote speaker into one output
//! buffer for the playback callback. Reads a copy-on-write snapshot of the
//! user table so the audio thread never blocks on the packet-processing
//! thread; each user's jitter buffer/decoder still needs its own lock since
//! both threads touch it, but the *set* of users never does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use opus::Decoder as OpusDecoder;
use parking_lot::Mutex;

use crate::config::{FRAME_SAMPLES, SAMPLE_RATE, SPEAKER_ACTIVITY_TIMEOUT_SECS, WHISPER_EFFECT_DURATION_SECS};

use super::dsp::{ButterworthLowpass4, PitchShifter};
use super::jitter::JitterBuffer;

/// Per-remote-user mutable playback state. Wrapped in its own lock so the
/// mixer and the ingress demux (M5) can touch it independently without
/// taking a registry-wide lock.
pub struct RemoteUser {
    pub uid: u32,
    pub jitter: Mutex<JitterBuffer>,
    pub decoder: Mutex<OpusDecoder>,
    pub last_packet_time: Mutex<f64>,
    pub volume: Mutex<f32>,
    pub locally_muted: Mutex<bool>,
    pub remote_muted: Mutex<bool>,
    pub remote_deafened: Mutex<bool>,
    /// Separate stream-mic path (for watchers listening to this uid's
    /// loudness-compensated mix-minus feed); `None` when not streaming.
    pub stream_last_packet_time: Mutex<Option<f64>>,
}

impl RemoteUser {
    pub fn new(uid: u32, jitter_target_delay: usize, jitter_max_size: usize) -> Result<Self, opus::Error> {
        Ok(RemoteUser {
            uid,
            jitter: Mutex::new(JitterBuffer::with_params(jitter_target_delay, jitter_max_size)),
            decoder: Mutex::new(OpusDecoder::new(SAMPLE_RATE, opus::Channels::Mono)?),
            last_packet_time: Mutex::new(0.0),
            volume: Mutex::new(1.0),
            locally_muted: Mutex::new(false),
            remote_muted: Mutex::new(false),
            remote_deafened: Mutex::new(false),
            stream_last_packet_time: Mutex::new(None),
        })
    }

    fn is_active(&self, now: f64) -> bool {
        let last = *self.last_packet_time.lock();
        now - last < SPEAKER_ACTIVITY_TIMEOUT_SECS
            && !*self.locally_muted.lock()
            && !*self.remote_muted.lock()
            && *self.volume.lock() != 0.0
    }
}

/// The set of known remote users, swapped as a whole on join/leave so reads
/// never block on writes.
#[derive(Default, Clone)]
pub struct UserTable(pub Arc<HashMap<u32, Arc<RemoteUser>>>);

pub struct UserRegistry {
    current: Mutex<UserTable>,
    jitter_target_delay: usize,
    jitter_max_size: usize,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self::with_jitter_params(crate::config::JITTER_TARGET_DELAY, crate::config::JITTER_MAX_SIZE)
    }

    pub fn with_jitter_params(jitter_target_delay: usize, jitter_max_size: usize) -> Self {
        UserRegistry {
            current: Mutex::new(UserTable::default()),
            jitter_target_delay,
            jitter_max_size,
        }
    }

    /// Cheap: clones the `Arc`, not the map.
    pub fn snapshot(&self) -> UserTable {
        self.current.lock().clone()
    }

    pub fn get_or_insert(&self, uid: u32) -> Arc<RemoteUser> {
        {
            let snapshot = self.snapshot();
            if let Some(u) = snapshot.0.get(&uid) {
                return u.clone();
            }
        }
        let mut guard = self.current.lock();
        if let Some(u) = guard.0.get(&uid) {
            return u.clone();
        }
        let user = Arc::new(
            RemoteUser::new(uid, self.jitter_target_delay, self.jitter_max_size).expect("opus decoder init"),
        );
        let mut map = (*guard.0).clone();
        map.insert(uid, user.clone());
        guard.0 = Arc::new(map);
        user
    }

    pub fn remove(&self, uid: u32) {
        let mut guard = self.current.lock();
        if !guard.0.contains_key(&uid) {
            return;
        }
        let mut map = (*guard.0).clone();
        map.remove(&uid);
        guard.0 = Arc::new(map);
    }
}

impl Default for UserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Whisper-in effect state: which uid is currently whispering to us and
/// since when, plus the DSP chain applied to that uid's decoded audio.
pub struct WhisperInEffect {
    pub active_uid: Option<u32>,
    pub started_at: f64,
    lowpass: ButterworthLowpass4,
    pitch: PitchShifter,
}

impl WhisperInEffect {
    pub fn new(sample_rate: f64) -> Self {
        WhisperInEffect {
            active_uid: None,
            started_at: 0.0,
            lowpass: ButterworthLowpass4::new(crate::config::WHISPER_LOWPASS_HZ, sample_rate),
            pitch: PitchShifter::new(crate::config::WHISPER_PITCH_SHIFT_SEMITONES, 40.0, sample_rate),
        }
    }

    /// Called from the ingress thread on every whisper packet (not just the
    /// first) so the effect keeps extending for as long as the whisper
    /// continues. Only resets the DSP history itself on a genuine
    /// sender change (or resumption after the effect had lapsed) — if every
    /// packet reset the filter/delay-line state, the lowpass and pitch
    /// shifter would never accumulate enough history to do anything.
    pub fn start(&mut self, uid: u32, now: f64) {
        let fresh = self.active_uid != Some(uid) || now - self.started_at >= WHISPER_EFFECT_DURATION_SECS;
        self.active_uid = Some(uid);
        self.started_at = now;
        if fresh {
            self.lowpass.reset();
            self.pitch.reset();
        }
    }

    pub fn apply_if_active(&mut self, uid: u32, now: f64, samples: &mut [f32]) {
        let Some(active) = self.active_uid else { return };
        if active != uid || now - self.started_at >= WHISPER_EFFECT_DURATION_SECS {
            return;
        }
        self.pitch.process_block(samples);
        self.lowpass.process_block(samples);
    }
}

/// Sequence counters owned by the encode/send side but read here so the
/// mixer can stamp a mix-minus forward with its own monotonic sequence.
/// Without a counter dedicated to STREAM_VOICES, multiple speakers
/// forwarded within the same mixer tick would collide on sequence number
/// and the receiving jitter buffer would drop all but the first.
#[derive(Default)]
pub struct StreamVoiceSequencer {
    next: AtomicU32,
}

impl StreamVoiceSequencer {
    pub fn next(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Whether this client is currently publishing stream audio (mic broadcast
/// or system loopback) and at what volume watchers should mix it in, read
/// from the playback callback without locking.
pub struct BroadcastState {
    sending: AtomicBool,
    stream_volume_bits: AtomicU32,
}

impl BroadcastState {
    pub fn new() -> Self {
        BroadcastState {
            sending: AtomicBool::new(false),
            stream_volume_bits: AtomicU32::new(1.0f32.to_bits()),
        }
    }

    pub fn set_sending(&self, sending: bool) {
        self.sending.store(sending, Ordering::Relaxed);
    }

    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::Relaxed)
    }

    pub fn set_stream_volume(&self, volume: f32) {
        self.stream_volume_bits.store(volume.clamp(0.0, 2.0).to_bits(), Ordering::Relaxed);
    }

    pub fn stream_volume(&self) -> f32 {
        f32::from_bits(self.stream_volume_bits.load(Ordering::Relaxed))
    }
}

impl Default for BroadcastState {
    fn default() -> Self {
        Self::new()
    }
}

/// Storage key for a streamed-audio slot a watcher plays back: an explicit
/// tagged key instead of an offset-uid trick. `Microphone` covers both a
/// streamer's own captured mic broadcast *and* a chat participant's voice
/// relayed via STREAM_VOICES. From a watcher's perspective both are "this
/// uid's voice, heard through the stream," and they occupy the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamSource {
    Microphone(u32),
    Loopback(u32),
}

/// One streamed-audio playback slot: its own jitter buffer and decoder, kept
/// out of the normal-voice [`RemoteUser`] table entirely so a streamer's mic
/// broadcast can't collide sequence numbers with their room voice.
pub struct StreamUser {
    pub source: StreamSource,
    pub jitter: Mutex<JitterBuffer>,
    pub decoder: Mutex<OpusDecoder>,
    pub last_packet_time: Mutex<f64>,
}

impl StreamUser {
    fn new(source: StreamSource, jitter_target_delay: usize, jitter_max_size: usize) -> Result<Self, opus::Error> {
        Ok(StreamUser {
            source,
            jitter: Mutex::new(JitterBuffer::with_params(jitter_target_delay, jitter_max_size)),
            decoder: Mutex::new(OpusDecoder::new(SAMPLE_RATE, opus::Channels::Mono)?),
            last_packet_time: Mutex::new(0.0),
        })
    }

    fn is_active(&self, now: f64) -> bool {
        now - *self.last_packet_time.lock() < SPEAKER_ACTIVITY_TIMEOUT_SECS
    }
}

/// Copy-on-write table of streamed-audio slots, mirrored in shape to
/// [`UserTable`]/[`UserRegistry`] for the same reason: the mixer must never
/// block on the ingress thread that's adding new slots.
#[derive(Default, Clone)]
pub struct StreamUserTable(pub Arc<HashMap<StreamSource, Arc<StreamUser>>>);

pub struct StreamUserRegistry {
    current: Mutex<StreamUserTable>,
    jitter_target_delay: usize,
    jitter_max_size: usize,
}

impl StreamUserRegistry {
    pub fn new() -> Self {
        Self::with_jitter_params(crate::config::JITTER_TARGET_DELAY, crate::config::JITTER_MAX_SIZE)
    }

    pub fn with_jitter_params(jitter_target_delay: usize, jitter_max_size: usize) -> Self {
        StreamUserRegistry {
            current: Mutex::new(StreamUserTable::default()),
            jitter_target_delay,
            jitter_max_size,
        }
    }

    pub fn snapshot(&self) -> StreamUserTable {
        self.current.lock().clone()
    }

    pub fn get_or_insert(&self, source: StreamSource) -> Arc<StreamUser> {
        {
            let snapshot = self.snapshot();
            if let Some(u) = snapshot.0.get(&source) {
                return u.clone();
            }
        }
        let mut guard = self.current.lock();
        if let Some(u) = guard.0.get(&source) {
            return u.clone();
        }
        let user = Arc::new(
            StreamUser::new(source, self.jitter_target_delay, self.jitter_max_size).expect("opus decoder init"),
        );
        let mut map = (*guard.0).clone();
        map.insert(source, user.clone());
        guard.0 = Arc::new(map);
        user
    }
}

impl Default for StreamUserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A chat voice frame this tick decoded and mixed in, worth relaying to
/// watchers (mix-minus): the *original* speaker's uid plus the untouched
/// Opus bytes pulled from that speaker's jitter buffer.
pub struct MixMinusFrame {
    pub speaker_uid: u32,
    pub opus: Vec<u8>,
}

/// One mix tick: decode every active speaker's next jitter-buffer frame,
/// apply per-speaker volume and the shared loudness-compensation gain, sum,
/// then soft-limit. `output` must already be zeroed and sized
/// [`crate::config::FRAME_SAMPLES`]. Also mixes in any active streamed-audio
/// slots (a streamer's forwarded mic or system-loopback audio) at
/// `stream_volume`, and — when `broadcasting` is set — returns the frames
/// that should additionally go out to watchers with `STREAM_AUDIO |
/// STREAM_VOICES` (mix-minus publishing).
pub fn mix_tick(
    users: &UserTable,
    streams: &StreamUserTable,
    whisper_in: &mut WhisperInEffect,
    deafened: bool,
    broadcasting: bool,
    stream_volume: f32,
    now: f64,
    output: &mut [f32],
) -> Vec<MixMinusFrame> {
    debug_assert_eq!(output.len(), FRAME_SAMPLES);
    let mut relay = Vec::new();
    if deafened {
        return relay;
    }

    let active: Vec<&Arc<RemoteUser>> = users.0.values().filter(|u| u.is_active(now)).collect();
    let active_streams: Vec<&Arc<StreamUser>> = streams.0.values().filter(|u| u.is_active(now)).collect();
    if active.is_empty() && active_streams.is_empty() {
        return relay;
    }
    let gain = speaker_gain(active.len() + active_streams.len());

    let mut pcm = [0i16; FRAME_SAMPLES];
    for user in active {
        let frame = { user.jitter.lock().get() };
        let Some(opus_data) = frame else { continue };
        let n = {
            let mut decoder = user.decoder.lock();
            match decoder.decode(&opus_data, &mut pcm, false) {
                Ok(n) => n,
                Err(_) => continue,
            }
        };
        let mut decoded: Vec<f32> = pcm[..n].iter().map(|s| *s as f32 / i16::MAX as f32).collect();
        whisper_in.apply_if_active(user.uid, now, &mut decoded);
        let volume = *user.volume.lock();
        for (o, s) in output.iter_mut().zip(decoded.iter()) {
            *o += s * volume * gain;
        }
        if broadcasting {
            relay.push(MixMinusFrame { speaker_uid: user.uid, opus: opus_data });
        }
    }

    for user in active_streams {
        let frame = { user.jitter.lock().get() };
        let Some(opus_data) = frame else { continue };
        let n = {
            let mut decoder = user.decoder.lock();
            match decoder.decode(&opus_data, &mut pcm, false) {
                Ok(n) => n,
                Err(_) => continue,
            }
        };
        let decoded: Vec<f32> = pcm[..n].iter().map(|s| *s as f32 / i16::MAX as f32).collect();
        for (o, s) in output.iter_mut().zip(decoded.iter()) {
            *o += s * stream_volume * gain;
        }
    }

    soft_limit(output, 0.95);
    for s in output.iter_mut() {
        *s = s.clamp(-1.0, 1.0);
    }
    relay
}

/// `g = sqrt(2) / sqrt(max(2, n_active))` — keeps perceived loudness
/// roughly constant as more people talk at once, instead of summed energy
/// growing with speaker count.
pub fn speaker_gain(n_active: usize) -> f32 {
    (2.0f32).sqrt() / (n_active.max(2) as f32).sqrt()
}

/// Post-mix soft limiter. Hard clipping afterward (in
/// [`mix_tick`]) is a safety net, not the primary limiter.
pub fn soft_limit(buf: &mut [f32], ceiling: f32) {
    super::dsp::scale_to_peak(buf, ceiling);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whisper_effect_repeated_start_same_sender_does_not_reset_dsp_history() {
        let mut effect = WhisperInEffect::new(SAMPLE_RATE as f64);
        effect.start(7, 0.0);
        // Feed enough samples that the lowpass filter accumulates non-zero
        // history (a single zero-initial-state sample always passes through
        // the first coefficient unchanged).
        let mut warm = vec![1.0f32; 32];
        effect.apply_if_active(7, 0.05, &mut warm);
        let after_first_block = warm.clone();

        // A second whisper packet from the *same* sender shortly after
        // should extend the effect window without zeroing the filter state.
        effect.start(7, 0.05);
        let mut continued = vec![1.0f32; 32];
        effect.apply_if_active(7, 0.06, &mut continued);
        assert_ne!(
            continued, after_first_block,
            "filter state should carry over across packets from the same whisper sender"
        );
    }

    #[test]
    fn whisper_effect_switching_sender_resets_dsp_history() {
        let mut effect = WhisperInEffect::new(SAMPLE_RATE as f64);
        effect.start(7, 0.0);
        let mut warm = vec![1.0f32; 32];
        effect.apply_if_active(7, 0.05, &mut warm);

        effect.start(9, 0.06);
        let mut fresh = vec![1.0f32; 32];
        effect.apply_if_active(9, 0.07, &mut fresh);

        let mut baseline_effect = WhisperInEffect::new(SAMPLE_RATE as f64);
        baseline_effect.start(9, 0.0);
        let mut baseline = vec![1.0f32; 32];
        baseline_effect.apply_if_active(9, 0.01, &mut baseline);

        assert_eq!(fresh, baseline, "a new sender should start from a clean filter/delay-line state");
    }

    #[test]
    fn speaker_gain_floors_at_two_speakers() {
        assert_eq!(speaker_gain(0), speaker_gain(2));
        assert_eq!(speaker_gain(1), speaker_gain(2));
        assert!(speaker_gain(8) < speaker_gain(2));
    }

    #[test]
    fn soft_limit_only_acts_above_ceiling() {
        let mut quiet = vec![0.1f32, -0.2, 0.3];
        let before = quiet.clone();
        soft_limit(&mut quiet, 0.95);
        assert_eq!(quiet, before);

        let mut loud = vec![1.9f32, -1.0, 0.5];
        soft_limit(&mut loud, 0.95);
        let peak = loud.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!((peak - 0.95).abs() < 1e-4);
    }

    #[test]
    fn user_registry_cow_snapshot_sees_additions() {
        let registry = UserRegistry::new();
        let snap_before = registry.snapshot();
        assert!(snap_before.0.is_empty());
        registry.get_or_insert(42);
        let snap_after = registry.snapshot();
        assert!(snap_after.0.contains_key(&42));
        assert!(snap_before.0.is_empty());
    }

    #[test]
    fn microphone_and_loopback_slots_for_same_uid_never_collide() {
        let registry = StreamUserRegistry::new();
        let mic = registry.get_or_insert(StreamSource::Microphone(111));
        let loopback = registry.get_or_insert(StreamSource::Loopback(111));
        assert_eq!(registry.snapshot().0.len(), 2);
        mic.jitter.lock().add(1, vec![1]);
        loopback.jitter.lock().add(1, vec![2]);
        assert_ne!(mic.jitter.lock().get(), loopback.jitter.lock().get());
    }

    fn encode_silence() -> Vec<u8> {
        let mut encoder =
            opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip).unwrap();
        let mut out = vec![0u8; 4000];
        let n = encoder.encode_float(&[0.0f32; FRAME_SAMPLES], &mut out).unwrap();
        out.truncate(n);
        out
    }

    #[test]
    fn broadcast_state_defaults_to_unity_volume_and_off() {
        let state = BroadcastState::new();
        assert!(!state.is_sending());
        assert_eq!(state.stream_volume(), 1.0);
        state.set_sending(true);
        state.set_stream_volume(3.0);
        assert!(state.is_sending());
        assert_eq!(state.stream_volume(), 2.0);
    }

    #[test]
    fn mix_tick_relays_mix_minus_only_when_broadcasting() {
        let users = UserRegistry::new();
        let remote = users.get_or_insert(222);
        *remote.last_packet_time.lock() = 100.0;
        // JitterBuffer default target delay is 4 frames; fill it before a
        // tick will actually pop anything.
        for seq in 0..4 {
            remote.jitter.lock().add(seq, encode_silence());
        }

        let mut whisper = WhisperInEffect::new(SAMPLE_RATE as f64);
        let streams = StreamUserTable::default();

        let mut output = vec![0.0f32; FRAME_SAMPLES];
        let relay = mix_tick(&users.snapshot(), &streams, &mut whisper, false, false, 1.0, 100.0, &mut output);
        assert!(relay.is_empty());

        remote.jitter.lock().add(4, encode_silence());
        let mut output = vec![0.0f32; FRAME_SAMPLES];
        let relay = mix_tick(&users.snapshot(), &streams, &mut whisper, false, true, 1.0, 100.0, &mut output);
        assert_eq!(relay.len(), 1);
        assert_eq!(relay[0].speaker_uid, 222);
    }
}
