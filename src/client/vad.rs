//! Voice activity detection (M2): an RMS threshold gate with hangover, plus
//! the pre-roll ring that lets the first word of an utterance survive even
//! though VAD only confirms speech a few frames in.

use std::collections::VecDeque;

use crate::config::{VAD_HANGOVER_SECS, VAD_PRE_ROLL_FRAMES};

pub struct Vad {
    threshold: f32,
    last_voice_time: Option<f64>,
    was_talking: bool,
    pre_roll: VecDeque<Vec<f32>>,
}

impl Vad {
    pub fn new(threshold: f32) -> Self {
        Vad {
            threshold,
            last_voice_time: None,
            was_talking: false,
            pre_roll: VecDeque::with_capacity(VAD_PRE_ROLL_FRAMES),
        }
    }

    fn rms(frame: &[f32]) -> f32 {
        if frame.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = frame.iter().map(|s| s * s).sum();
        (sum_sq / frame.len() as f32).sqrt()
    }

    /// Feed one frame, returning whether the gate is open (talking). Also
    /// maintains the pre-roll ring — call [`Vad::drain_pre_roll`] exactly
    /// once on the onset transition (false -> true) to get the frames that
    /// preceded it, in order.
    pub fn process(&mut self, frame: &[f32], now: f64) -> bool {
        let rms = Self::rms(frame);
        let voice_now = rms > self.threshold;
        if voice_now {
            self.last_voice_time = Some(now);
        }
        let hangover_active = self
            .last_voice_time
            .map(|t| now - t < VAD_HANGOVER_SECS)
            .unwrap_or(false);
        let talking = voice_now || hangover_active;

        if !talking {
            if self.pre_roll.len() == VAD_PRE_ROLL_FRAMES {
                self.pre_roll.pop_front();
            }
            self.pre_roll.push_back(frame.to_vec());
        }

        self.was_talking = talking;
        talking
    }

    /// True exactly on the call to [`Vad::process`] that just transitioned
    /// from silence to speech.
    pub fn just_started_talking(&self, previously_talking: bool, talking_now: bool) -> bool {
        !previously_talking && talking_now
    }

    /// Pop the whole pre-roll ring in chronological order, emptying it.
    /// Call once on speech onset so the encoder can flush these frames
    /// ahead of the live one.
    pub fn drain_pre_roll(&mut self) -> Vec<Vec<f32>> {
        self.pre_roll.drain(..).collect()
    }

    pub fn was_talking(&self) -> bool {
        self.was_talking
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(amplitude: f32, n: usize) -> Vec<f32> {
        vec![amplitude; n]
    }

    #[test]
    fn gate_opens_above_threshold_and_closes_after_hangover() {
        let mut vad = Vad::new(0.1);
        assert!(!vad.process(&tone(0.0, 960), 0.0));
        assert!(vad.process(&tone(0.5, 960), 1.0));
        // still within hangover window right after voice stops
        assert!(vad.process(&tone(0.0, 960), 1.1));
        // past hangover
        assert!(!vad.process(&tone(0.0, 960), 1.1 + VAD_HANGOVER_SECS + 0.01));
    }

    #[test]
    fn pre_roll_keeps_exactly_five_most_recent_silent_frames_in_order() {
        let mut vad = Vad::new(0.1);
        for i in 0..8u8 {
            vad.process(&tone(0.0, 4), i as f64);
        }
        let drained = vad.drain_pre_roll();
        assert_eq!(drained.len(), VAD_PRE_ROLL_FRAMES);
        // frames are indices 3..8 each filled with amplitude 0.0 but we can't
        // distinguish content here since tone() is constant; length/order is
        // the property under test given FIFO eviction.
        assert!(vad.drain_pre_roll().is_empty());
    }
}
