//! Additive synthesis of the feedback tones.
//!
//! A [Synthesizer] lives on the audio thread. Each call to
//! [render](Synthesizer::render) reads the [FeedbackState] atomics once and
//! fills the buffer: pitch changes glide linearly across the buffer and
//! switching tone sets fades the old set out before the new one starts, so
//! nothing clicks.

use crate::config::AudioConfig;
use crate::feedback::{AudioState, FeedbackState};
use std::f32::consts::TAU;
use std::sync::Arc;

/// Frequency in Hz of MIDI semitone `s`, with A4 (69) at 440 Hz.
pub fn semitone_to_frequency(s: f32) -> f32 {
    440.0 * 2f32.powf((s - 69.0) / 12.0)
}

/// One sine in a tone set, relative to the root.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Partial {
    interval: f32,
    amplitude: f32,
}

const fn partial(interval: f32, amplitude: f32) -> Partial {
    Partial { interval, amplitude }
}

/// Root with octave and twelfth overtones.
const NOTE_TONES: [Partial; 3] = [partial(0.0, 1.0), partial(12.0, 0.5), partial(19.0, 0.25)];

/// Major triad with the octave.
const CHORD_TONES: [Partial; 4] = [
    partial(0.0, 1.0),
    partial(4.0, 0.8),
    partial(7.0, 0.8),
    partial(12.0, 0.5),
];

/// Minor second and tritone over the root.
const ERROR_TONES: [Partial; 3] = [partial(0.0, 1.0), partial(1.0, 0.8), partial(6.0, 0.8)];

/// Seconds the envelope takes to go from silence to full level.
const ENVELOPE_RAMP_SECONDS: f32 = 0.01;

fn tones(state: AudioState) -> &'static [Partial] {
    match state {
        AudioState::None => &[],
        AudioState::SlidingNote => &NOTE_TONES,
        AudioState::Chord => &CHORD_TONES,
        AudioState::Error => &ERROR_TONES,
    }
}

/// See the module docs.
#[derive(Debug)]
pub struct Synthesizer {
    shared: Arc<FeedbackState>,
    sample_rate: f32,
    gain: f32,
    base_semitone: f32,
    error_decay_samples: u64,
    playing: AudioState,
    semitone: f32,
    phases: [f32; 4],
    envelope: f32,
    last_error_serial: u64,
    error_remaining: u64,
}

impl Synthesizer {
    /// A silent synthesizer reading `shared`.
    pub fn new(shared: Arc<FeedbackState>, config: &AudioConfig) -> Self {
        let sample_rate = config.sample_rate.max(1) as f32;
        let last_error_serial = shared.error_serial();
        Self {
            shared,
            sample_rate,
            gain: config.gain,
            base_semitone: config.base_semitone,
            error_decay_samples: config
                .error_decay_ms
                .saturating_mul(config.sample_rate as u64)
                / 1000,
            playing: AudioState::None,
            semitone: config.base_semitone,
            phases: [0.0; 4],
            envelope: 0.0,
            last_error_serial,
            error_remaining: 0,
        }
    }

    /// Output sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate as u32
    }

    /// The tone set currently sounding, or fading out.
    pub fn playing(&self) -> AudioState {
        self.playing
    }

    /// Root pitch at the end of the last buffer.
    pub fn current_semitone(&self) -> f32 {
        self.semitone
    }

    /// The state to aim for during the next `frames` samples. The error
    /// cue is held for the decay interval after each new error and then
    /// falls silent, even if the shared state still says `Error`.
    fn requested_state(&mut self, frames: usize) -> AudioState {
        let serial = self.shared.error_serial();
        if serial != self.last_error_serial {
            self.last_error_serial = serial;
            self.error_remaining = self.error_decay_samples;
        }

        match self.shared.audio_state() {
            AudioState::Error if self.error_remaining == 0 => AudioState::None,
            AudioState::Error => {
                self.error_remaining = self.error_remaining.saturating_sub(frames as u64);
                AudioState::Error
            }
            state => state,
        }
    }

    /// Fill `out` with mono samples. Never blocks; an empty buffer is a
    /// no-op and silence is written when nothing should play.
    pub fn render(&mut self, out: &mut [f32]) {
        if out.is_empty() {
            return;
        }

        let requested = self.requested_state(out.len());
        let target_semitone = match requested {
            AudioState::SlidingNote => self.shared.target_semitone(),
            _ => self.base_semitone,
        };

        if requested != self.playing && self.envelope <= 0.0 {
            self.playing = requested;
            self.phases = [0.0; 4];
            self.semitone = target_semitone;
        }

        let switching = requested != self.playing;
        let target_envelope = if switching || self.playing == AudioState::None {
            0.0
        } else {
            1.0
        };
        let envelope_step = 1.0 / (ENVELOPE_RAMP_SECONDS * self.sample_rate);
        let end_semitone = if switching { self.semitone } else { target_semitone };

        let partials = tones(self.playing);
        let norm: f32 = partials.iter().map(|p| p.amplitude).sum::<f32>().max(1.0);
        let start_semitone = self.semitone;
        let n = out.len() as f32;

        for (i, sample) in out.iter_mut().enumerate() {
            let semitone = start_semitone + (end_semitone - start_semitone) * (i + 1) as f32 / n;

            if self.envelope < target_envelope {
                self.envelope = (self.envelope + envelope_step).min(target_envelope);
            } else if self.envelope > target_envelope {
                self.envelope = (self.envelope - envelope_step).max(target_envelope);
            }

            let mut mix = 0.0;
            for (phase, partial) in self.phases.iter_mut().zip(partials) {
                mix += partial.amplitude * phase.sin();
                let frequency = semitone_to_frequency(semitone + partial.interval);
                *phase = (*phase + TAU * frequency / self.sample_rate) % TAU;
            }
            *sample = mix / norm * self.envelope * self.gain;
        }

        self.semitone = end_semitone;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::ResidualFeedback;

    fn config() -> AudioConfig {
        AudioConfig {
            sample_rate: 8000,
            buffer_size: 64,
            base_semitone: 60.0,
            gain: 0.5,
            error_decay_ms: 20,
            enabled: true,
        }
    }

    #[test]
    fn equal_temperament() {
        assert!((semitone_to_frequency(69.0) - 440.0).abs() < 1e-3);
        assert!((semitone_to_frequency(81.0) - 880.0).abs() < 1e-2);
        assert!((semitone_to_frequency(60.0) - 261.63).abs() < 1e-2);
    }

    #[test]
    fn silent_until_told_otherwise() {
        let feedback = ResidualFeedback::new(60.0);
        let mut synth = Synthesizer::new(feedback.shared(), &config());
        let mut buffer = [1.0f32; 64];

        synth.render(&mut buffer);
        assert!(buffer.iter().all(|s| *s == 0.0));

        synth.render(&mut []);
    }

    #[test]
    fn chord_is_audible_and_bounded() {
        let mut feedback = ResidualFeedback::new(60.0);
        feedback.on_aligned(&[0.01; 8]);
        let mut synth = Synthesizer::new(feedback.shared(), &config());

        let mut buffer = [0.0f32; 256];
        synth.render(&mut buffer);

        assert_eq!(synth.playing(), AudioState::Chord);
        assert!(buffer.iter().any(|s| s.abs() > 0.01));
        assert!(buffer.iter().all(|s| s.abs() <= 0.5 + 1e-6));
    }

    #[test]
    fn sliding_note_glides_to_target() {
        let mut feedback = ResidualFeedback::new(60.0);
        feedback.on_aligned(&[0.01; 8]);
        let mut synth = Synthesizer::new(feedback.shared(), &config());
        let mut buffer = [0.0f32; 64];
        synth.render(&mut buffer);
        assert_eq!(synth.playing(), AudioState::Chord);

        for _ in 0..60 {
            feedback.on_aligned(&[0.5; 8]);
        }
        // Fade the chord out, then the note starts at its target.
        for _ in 0..4 {
            synth.render(&mut buffer);
        }
        assert_eq!(synth.playing(), AudioState::SlidingNote);
        let target = feedback.shared().target_semitone();
        assert!((synth.current_semitone() - target).abs() < 1e-4);
    }

    #[test]
    fn switching_fades_out_first() {
        let mut feedback = ResidualFeedback::new(60.0);
        feedback.on_aligned(&[0.01; 8]);
        let config = AudioConfig {
            error_decay_ms: 1000,
            ..config()
        };
        let mut synth = Synthesizer::new(feedback.shared(), &config);
        let mut buffer = [0.0f32; 256];
        synth.render(&mut buffer);

        feedback.on_failed();
        let mut short = [0.0f32; 8];
        synth.render(&mut short);
        assert_eq!(synth.playing(), AudioState::Chord);

        synth.render(&mut buffer);
        synth.render(&mut buffer);
        assert_eq!(synth.playing(), AudioState::Error);
    }

    #[test]
    fn error_cue_decays_to_silence() {
        let mut feedback = ResidualFeedback::new(60.0);
        let mut synth = Synthesizer::new(feedback.shared(), &config());
        let mut buffer = [0.0f32; 64];

        feedback.on_failed();
        synth.render(&mut buffer);
        assert_eq!(synth.playing(), AudioState::Error);

        // 20 ms at 8 kHz is 160 samples.
        for _ in 0..6 {
            synth.render(&mut buffer);
        }
        assert_eq!(synth.playing(), AudioState::None);
        synth.render(&mut buffer);
        assert!(buffer.iter().all(|s| *s == 0.0));

        feedback.on_failed();
        synth.render(&mut buffer);
        assert_eq!(synth.playing(), AudioState::Error);
    }

    #[test]
    fn huge_error_decay_holds_the_cue() {
        let mut feedback = ResidualFeedback::new(60.0);
        let config = AudioConfig {
            sample_rate: 48_000,
            error_decay_ms: u64::MAX,
            ..config()
        };
        let mut synth = Synthesizer::new(feedback.shared(), &config);
        let mut buffer = [0.0f32; 64];

        feedback.on_failed();
        for _ in 0..8 {
            synth.render(&mut buffer);
        }
        assert_eq!(synth.playing(), AudioState::Error);
    }
}
