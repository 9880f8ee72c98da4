//! Turns alignment residuals into audio feedback state.
//!
//! [ResidualFeedback] runs on the fusion consumer thread. Every frame it
//! folds the per-pixel residual into a smoothed alignment quality, picks an
//! [AudioState], and publishes both into a [FeedbackState] made only of
//! atomics, which the audio thread reads without ever blocking.

use crate::volume::{ColorFrame, ResidualFrame};
use log::trace;
use std::sync::{
    atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering},
    Arc,
};

/// Smoothing factor of the alignment quality average.
pub const QUALITY_SMOOTHING: f32 = 0.1;

/// Quality below which alignment counts as good and the chord plays.
pub const CHORD_THRESHOLD: f32 = 0.1;

/// Quality at which the sliding note reaches its lowest pitch.
pub const SLIDE_FLOOR: f32 = 0.16;

/// Range of the sliding note below the base tone.
pub const MAX_SLIDE_SEMITONES: f32 = 16.0;

/// What the synthesizer should be playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum AudioState {
    /// Silence
    #[default]
    None = 0,
    /// A single tone whose pitch follows alignment quality
    SlidingNote = 1,
    /// A consonant chord, alignment is good
    Chord = 2,
    /// A dissonant cue, alignment failed
    Error = 3,
}

impl From<u8> for AudioState {
    fn from(value: u8) -> Self {
        match value {
            1 => AudioState::SlidingNote,
            2 => AudioState::Chord,
            3 => AudioState::Error,
            _ => AudioState::None,
        }
    }
}

/// Valid pixel count and mean absolute residual of one residual frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResidualSummary {
    /// Pixels with `|residual| <= 1`
    pub valid_pixels: usize,
    /// Mean absolute residual over the valid pixels, `0.0` if there are none
    pub mean_abs: f32,
}

/// Summarize a residual frame.
pub fn summarize(residuals: &[f32]) -> ResidualSummary {
    let (valid_pixels, sum) = residuals
        .iter()
        .map(|r| r.abs())
        .filter(|r| *r <= 1.0)
        .fold((0usize, 0.0f64), |(n, sum), r| (n + 1, sum + r as f64));

    ResidualSummary {
        valid_pixels,
        mean_abs: if valid_pixels == 0 {
            0.0
        } else {
            (sum / valid_pixels as f64) as f32
        },
    }
}

/// One step of the quality average towards `frame_residual`.
pub fn update_quality(quality: f32, frame_residual: f32) -> f32 {
    quality + QUALITY_SMOOTHING * (frame_residual - quality)
}

/// Semitones below the base tone for a given quality, in
/// `[-MAX_SLIDE_SEMITONES, 0]`.
pub fn pitch_offset(quality: f32) -> f32 {
    let t = (quality - CHORD_THRESHOLD) / (SLIDE_FLOOR - CHORD_THRESHOLD);
    (-t * MAX_SLIDE_SEMITONES).clamp(-MAX_SLIDE_SEMITONES, 0.0)
}

/// Pick the audio state. `valid_pixels` is `None` when there was no
/// residual frame at all, as happens when alignment fails.
pub fn select_state(valid_pixels: Option<usize>, failed: bool, quality: f32) -> AudioState {
    match (valid_pixels, failed) {
        (Some(0), _) => AudioState::None,
        (_, true) => AudioState::Error,
        (None, false) => AudioState::None,
        _ if quality < CHORD_THRESHOLD => AudioState::Chord,
        _ => AudioState::SlidingNote,
    }
}

/// Feedback values shared with the audio thread. Every field is an atomic,
/// f32 values are stored as their bit patterns.
#[derive(Debug)]
pub struct FeedbackState {
    state: AtomicU8,
    target_semitone: AtomicU32,
    quality: AtomicU32,
    error_serial: AtomicU64,
}

impl FeedbackState {
    /// Silent state aimed at `base_semitone`.
    pub fn new(base_semitone: f32) -> Self {
        Self {
            state: AtomicU8::new(AudioState::None as u8),
            target_semitone: AtomicU32::new(base_semitone.to_bits()),
            quality: AtomicU32::new(0.0f32.to_bits()),
            error_serial: AtomicU64::new(0),
        }
    }

    /// What should be playing.
    pub fn audio_state(&self) -> AudioState {
        AudioState::from(self.state.load(Ordering::Relaxed))
    }

    /// Pitch the sliding note should head towards.
    pub fn target_semitone(&self) -> f32 {
        f32::from_bits(self.target_semitone.load(Ordering::Relaxed))
    }

    /// Smoothed alignment quality.
    pub fn quality(&self) -> f32 {
        f32::from_bits(self.quality.load(Ordering::Relaxed))
    }

    /// Bumped once per failed alignment, so the audio thread can tell a
    /// fresh error from a stale one.
    pub fn error_serial(&self) -> u64 {
        self.error_serial.load(Ordering::Relaxed)
    }

    fn publish(&self, state: AudioState, target_semitone: f32, quality: f32) {
        self.target_semitone
            .store(target_semitone.to_bits(), Ordering::Relaxed);
        self.quality.store(quality.to_bits(), Ordering::Relaxed);
        self.state.store(state as u8, Ordering::Relaxed);
    }
}

/// See the module docs.
#[derive(Debug)]
pub struct ResidualFeedback {
    quality: f32,
    base_semitone: f32,
    state: AudioState,
    shared: Arc<FeedbackState>,
}

impl ResidualFeedback {
    /// Feedback around `base_semitone`, starting silent.
    pub fn new(base_semitone: f32) -> Self {
        Self {
            quality: 0.0,
            base_semitone,
            state: AudioState::None,
            shared: Arc::new(FeedbackState::new(base_semitone)),
        }
    }

    /// Handle for the audio thread.
    pub fn shared(&self) -> Arc<FeedbackState> {
        Arc::clone(&self.shared)
    }

    /// Smoothed alignment quality, lower is better.
    pub fn quality(&self) -> f32 {
        self.quality
    }

    /// The state last published.
    pub fn state(&self) -> AudioState {
        self.state
    }

    /// Fold in the residual of a successful alignment.
    pub fn on_aligned(&mut self, residuals: &[f32]) -> AudioState {
        let summary = summarize(residuals);
        if summary.valid_pixels > 0 {
            self.quality = update_quality(self.quality, summary.mean_abs);
        }
        trace!(
            "ResidualFeedback : {} valid pixels, frame {:.4}, quality {:.4}.",
            summary.valid_pixels,
            summary.mean_abs,
            self.quality
        );
        self.publish(select_state(Some(summary.valid_pixels), false, self.quality))
    }

    /// Record a failed alignment.
    pub fn on_failed(&mut self) -> AudioState {
        self.shared.error_serial.fetch_add(1, Ordering::Relaxed);
        self.publish(select_state(None, true, self.quality))
    }

    /// Go quiet without touching the quality average, as while paused.
    pub fn silence(&mut self) -> AudioState {
        self.publish(AudioState::None)
    }

    fn publish(&mut self, state: AudioState) -> AudioState {
        let semitone = match state {
            AudioState::SlidingNote => self.base_semitone + pitch_offset(self.quality),
            _ => self.base_semitone,
        };
        self.shared.publish(state, semitone, self.quality);
        self.state = state;
        state
    }
}

/// Render a residual frame for display: green where alignment is good,
/// shading to red as the residual grows, black where a pixel took no part.
pub fn residual_image(residual: &ResidualFrame) -> ColorFrame {
    let mut image = ColorFrame::new(residual.resolution);
    for (pixel, r) in image.pixels.chunks_exact_mut(4).zip(&residual.residuals) {
        let r = r.abs();
        if r > 1.0 {
            continue;
        }
        let bad = (r * 255.0) as u8;
        pixel.copy_from_slice(&[0, 255 - bad, bad, 255]);
    }
    image
}
