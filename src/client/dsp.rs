//! Small signal-processing primitives: the pre-encode RNN denoiser (M1), a
//! cascaded-biquad Butterworth low-pass (replacing a `scipy.signal`
//! dependency with a couple of direct-form-II-transposed sections) and a
//! dual-tap pitch-shift-down delay line with Hann-window crossfade (both
//! for the whisper effect, M7).

use std::f64::consts::PI;

/// Optional RNN-based noise suppression, wrapping
/// `nnnoiseless`'s pure-Rust RNNoise port. RNNoise operates on native
/// 480-sample (10ms) frames at 48kHz in full int16 scale rather than
/// -1.0..1.0, so a 20ms capture frame is processed as two sub-frames with
/// rescaling at the boundary.
pub struct Denoiser {
    state: Box<nnnoiseless::DenoiseState<'static>>,
}

impl Denoiser {
    pub fn new() -> Self {
        Denoiser {
            state: nnnoiseless::DenoiseState::new(),
        }
    }

    /// In place. `frame.len()` must be a multiple of
    /// `nnnoiseless::DenoiseState::FRAME_SIZE` (960 at 48kHz splits into two).
    pub fn process_frame(&mut self, frame: &mut [f32]) {
        const RNNOISE_SCALE: f32 = 32768.0;
        let sub = nnnoiseless::DenoiseState::FRAME_SIZE;
        debug_assert_eq!(frame.len() % sub, 0, "frame length must be a multiple of RNNoise's frame size");

        let mut scaled_in = vec![0.0f32; sub];
        let mut scaled_out = vec![0.0f32; sub];
        for chunk in frame.chunks_mut(sub) {
            for (s, c) in scaled_in.iter_mut().zip(chunk.iter()) {
                *s = *c * RNNOISE_SCALE;
            }
            self.state.process_frame(&mut scaled_out, &scaled_in);
            for (c, o) in chunk.iter_mut().zip(scaled_out.iter()) {
                *c = (*o / RNNOISE_SCALE).clamp(-1.0, 1.0);
            }
        }
    }
}

impl Default for Denoiser {
    fn default() -> Self {
        Self::new()
    }
}

/// If the frame's peak exceeds `ceiling`, scale the whole frame down to meet
/// it. Shared by the pre-encode limiter (per-frame) and the
/// mixer's post-mix limiter (§4.6 step 5, per-block) — same operation, two
/// different callers.
pub fn scale_to_peak(buf: &mut [f32], ceiling: f32) {
    let peak = buf.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    if peak > ceiling {
        let scale = ceiling / peak;
        for s in buf.iter_mut() {
            *s *= scale;
        }
    }
}

/// One direct-form-II-transposed biquad section.
#[derive(Debug, Clone, Copy)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    z1: f64,
    z2: f64,
}

impl Biquad {
    fn process(&mut self, x: f64) -> f64 {
        let y = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;
        y
    }

    fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

/// A 4th-order Butterworth low-pass built from two cascaded biquads
/// (second-order sections), matching a `scipy.signal.butter(4, ..., output
/// 'sos')` design evaluated with a direct-form-II-transposed `sosfilt`.
pub struct ButterworthLowpass4 {
    sections: [Biquad; 2],
}

impl ButterworthLowpass4 {
    /// `cutoff_hz` / `sample_rate_hz` must satisfy `0 < cutoff < sample_rate/2`.
    pub fn new(cutoff_hz: f64, sample_rate_hz: f64) -> Self {
        // Two Butterworth biquad sections from the bilinear transform, pole
        // pairs at Q = 1/(2*cos(pi/8)) and 1/(2*cos(3*pi/8)) for a 4th-order
        // cascade (standard cascaded-Butterworth Q table).
        let q1 = 1.0 / (2.0 * (PI / 8.0).cos());
        let q2 = 1.0 / (2.0 * (3.0 * PI / 8.0).cos());
        let sections = [
            lowpass_biquad(cutoff_hz, sample_rate_hz, q1),
            lowpass_biquad(cutoff_hz, sample_rate_hz, q2),
        ];
        ButterworthLowpass4 { sections }
    }

    pub fn process(&mut self, x: f64) -> f64 {
        let mut y = x;
        for s in self.sections.iter_mut() {
            y = s.process(y);
        }
        y
    }

    pub fn process_block(&mut self, samples: &mut [f32]) {
        for s in samples.iter_mut() {
            *s = self.process(*s as f64) as f32;
        }
    }

    pub fn reset(&mut self) {
        for s in self.sections.iter_mut() {
            s.reset();
        }
    }
}

fn lowpass_biquad(cutoff_hz: f64, sample_rate_hz: f64, q: f64) -> Biquad {
    let omega = 2.0 * PI * cutoff_hz / sample_rate_hz;
    let alpha = omega.sin() / (2.0 * q);
    let cos_omega = omega.cos();

    let b0 = (1.0 - cos_omega) / 2.0;
    let b1 = 1.0 - cos_omega;
    let b2 = (1.0 - cos_omega) / 2.0;
    let a0 = 1.0 + alpha;
    let a1 = -2.0 * cos_omega;
    let a2 = 1.0 - alpha;

    Biquad {
        b0: b0 / a0,
        b1: b1 / a0,
        b2: b2 / a0,
        a1: a1 / a0,
        a2: a2 / a0,
        z1: 0.0,
        z2: 0.0,
    }
}

/// Dual-tap pitch-shift-down delay line: two read taps separated by half a
/// grain length, each amplitude-modulated by a Hann window, crossfaded so
/// one tap is always fading in as the other fades out. Running the taps at
/// a playback rate slower than 1.0 lowers pitch.
pub struct PitchShifter {
    buffer: Vec<f32>,
    write_pos: usize,
    phase: f64,
    grain_samples: f64,
    rate: f64,
}

impl PitchShifter {
    /// `semitones` negative shifts down. `grain_ms` controls the delay-line
    /// length (and thus the audible "doubling" artifact tradeoff).
    pub fn new(semitones: f64, grain_ms: f64, sample_rate_hz: f64) -> Self {
        let grain_samples = grain_ms / 1000.0 * sample_rate_hz;
        let buffer_len = (grain_samples.ceil() as usize) * 4 + 4;
        PitchShifter {
            buffer: vec![0.0; buffer_len],
            write_pos: 0,
            phase: 0.0,
            grain_samples,
            rate: 2f64.powf(semitones / 12.0),
        }
    }

    pub fn reset(&mut self) {
        self.buffer.iter_mut().for_each(|s| *s = 0.0);
        self.write_pos = 0;
        self.phase = 0.0;
    }

    fn read_interpolated(&self, delay: f64) -> f32 {
        let len = self.buffer.len() as f64;
        let read_pos = (self.write_pos as f64 - delay).rem_euclid(len);
        let i0 = read_pos.floor() as usize % self.buffer.len();
        let i1 = (i0 + 1) % self.buffer.len();
        let frac = read_pos.fract() as f32;
        self.buffer[i0] * (1.0 - frac) + self.buffer[i1] * frac
    }

    pub fn process(&mut self, x: f32) -> f32 {
        self.buffer[self.write_pos] = x;

        let grain = self.grain_samples;
        let half = grain / 2.0;

        let tap_a_delay = self.phase * grain;
        let tap_b_delay = ((self.phase + 0.5) % 1.0) * grain;

        let window_a = (PI * self.phase).sin().powi(2);
        let window_b = (PI * ((self.phase + 0.5) % 1.0)).sin().powi(2);

        let sample = self.read_interpolated(tap_a_delay) * window_a as f32
            + self.read_interpolated(tap_b_delay) * window_b as f32;

        self.phase += (1.0 - self.rate) / half.max(1.0);
        self.phase = self.phase.rem_euclid(1.0);

        self.write_pos = (self.write_pos + 1) % self.buffer.len();
        sample
    }

    pub fn process_block(&mut self, samples: &mut [f32]) {
        for s in samples.iter_mut() {
            *s = self.process(*s);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowpass_attenuates_high_frequency_more_than_low() {
        let sr = 48_000.0;
        let mut lp = ButterworthLowpass4::new(4000.0, sr);
        let n = 4096;
        let low_freq = 200.0;
        let low_out: f64 = (0..n)
            .map(|i| {
                let x = (2.0 * PI * low_freq * i as f64 / sr).sin();
                lp.process(x)
            })
            .map(|y| y * y)
            .sum();

        let mut lp2 = ButterworthLowpass4::new(4000.0, sr);
        let high_freq = 15000.0;
        let high_out: f64 = (0..n)
            .map(|i| {
                let x = (2.0 * PI * high_freq * i as f64 / sr).sin();
                lp2.process(x)
            })
            .map(|y| y * y)
            .sum();

        assert!(low_out > high_out * 4.0);
    }

    #[test]
    fn pitch_shifter_produces_bounded_output() {
        let mut ps = PitchShifter::new(-4.0, 40.0, 48_000.0);
        for i in 0..2000 {
            let x = (2.0 * PI * 220.0 * i as f64 / 48_000.0).sin() as f32;
            let y = ps.process(x);
            assert!(y.abs() <= 1.5);
        }
    }
}
