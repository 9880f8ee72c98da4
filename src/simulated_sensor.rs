//! A synthetic depth camera looking at a head.
//!
//! The scene is a sphere for the head with a flat torso below it, in front
//! of a wall that sits beyond the far clip. The camera drifts slowly on a
//! smooth path so there is something to track, and can be made to jump now
//! and then to exercise tracking loss. Frames come out ray-cast at the
//! requested format, with the same skeleton (head and neck joints) reported
//! every frame.

use crate::sensor::{
    FrameSource, Intrinsics, Joint, JointType, SensorFormat, SensorFrame, Skeleton, SkeletonId,
    TrackingConfidence,
};
use nalgebra::{Point3, Vector3};
use rand::prelude::*;
use std::f32::consts::TAU;

/// Depth of the background wall, in metres.
const WALL_DEPTH: f32 = 1.5;

/// Torso plane depth and extent, in world metres.
const TORSO_DEPTH: f32 = 0.78;
const TORSO_TOP: f32 = 0.13;
const TORSO_HALF_WIDTH: f32 = 0.22;

/// How far the camera jumps back during a glitch, in metres.
const GLITCH_OFFSET: f32 = 0.15;

/// Emits [SensorFrame]s of a simulated head scan when iterated upon.
#[derive(Debug, Clone)]
pub struct SimulatedSensor {
    format: SensorFormat,
    intrinsics: Intrinsics,
    frame_number: u64,
    frames_left: Option<u64>,
    rng: StdRng,
    noise_mm: f32,
    drift: f32,
    drift_period: f32,
    glitch_every: Option<u64>,
    glitch_len: u64,
    subject_switch_at: Option<u64>,
    head_center: Point3<f32>,
    head_radius: f32,
}

impl SimulatedSensor {
    /// Make a [SimulatedSensorBuilder].
    pub fn builder() -> SimulatedSensorBuilder {
        SimulatedSensorBuilder::new()
    }

    /// World position of the camera on `frame`. The camera axes stay
    /// aligned with the world.
    pub fn camera_position(&self, frame: u64) -> Vector3<f32> {
        let phase = TAU * frame as f32 / self.drift_period;
        let mut c = Vector3::new(
            self.drift * phase.sin(),
            0.5 * self.drift * (0.7 * phase).sin(),
            0.5 * self.drift * (1.0 - phase.cos()),
        );
        if self.in_glitch(frame) {
            c.z -= GLITCH_OFFSET;
        }
        c
    }

    /// Whether the camera is jumped away on `frame`.
    pub fn in_glitch(&self, frame: u64) -> bool {
        match self.glitch_every {
            Some(every) if every > 0 && frame >= every => frame % every < self.glitch_len,
            _ => false,
        }
    }

    fn subject_id(&self, frame: u64) -> SkeletonId {
        match self.subject_switch_at {
            Some(at) if frame >= at => 2,
            _ => 1,
        }
    }

    /// Nearest hit along the ray through pixel `(u, v)` from `camera`, as a
    /// camera depth in metres.
    fn trace(&self, camera: &Vector3<f32>, u: f32, v: f32) -> f32 {
        let dir = Vector3::new(
            (u - self.intrinsics.cx) / self.intrinsics.fx,
            (v - self.intrinsics.cy) / self.intrinsics.fy,
            1.0,
        );
        let origin = Point3::from(*camera);
        let mut depth = WALL_DEPTH - camera.z;

        let torso = TORSO_DEPTH - camera.z;
        let hit = origin + dir * torso;
        if hit.y > TORSO_TOP && hit.x.abs() < TORSO_HALF_WIDTH {
            depth = depth.min(torso);
        }

        // |o + t d - s|^2 = r^2
        let oc = origin - self.head_center;
        let a = dir.norm_squared();
        let b = 2.0 * oc.dot(&dir);
        let c = oc.norm_squared() - self.head_radius * self.head_radius;
        let disc = b * b - 4.0 * a * c;
        if disc >= 0.0 {
            let t = (-b - disc.sqrt()) / (2.0 * a);
            if t > 0.0 {
                depth = depth.min(t);
            }
        }

        depth
    }

    fn render(&mut self) -> SensorFrame {
        let frame = self.frame_number;
        let camera = self.camera_position(frame);
        let resolution = self.format.depth;

        let mut depth = Vec::with_capacity(resolution.pixel_count());
        let mut color = Vec::with_capacity(resolution.pixel_count() * 4);
        for v in 0..resolution.height {
            for u in 0..resolution.width {
                let z = self.trace(&camera, u as f32, v as f32);
                let noise = if self.noise_mm > 0.0 {
                    self.rng.gen_range(-self.noise_mm..self.noise_mm)
                } else {
                    0.0
                };
                depth.push((z * 1000.0 + noise).round().clamp(0.0, u16::MAX as f32) as u16);

                let shade = (255.0 * (1.2 - z).clamp(0.2, 1.0)) as u8;
                color.extend_from_slice(&[shade / 2, shade / 2, shade, 255]);
            }
        }

        let to_camera = |p: Point3<f32>| Point3::from(p - camera);
        let joint = |kind, position| Joint {
            kind,
            position,
            confidence: TrackingConfidence::Tracked,
        };
        let skeleton = Skeleton {
            id: self.subject_id(frame),
            tracked: true,
            joints: vec![
                joint(JointType::Head, to_camera(self.head_center)),
                joint(
                    JointType::ShoulderCenter,
                    to_camera(self.head_center + Vector3::new(0.0, 0.15, 0.0)),
                ),
            ],
        };

        self.frame_number += 1;
        SensorFrame {
            frame_number: frame,
            depth,
            color,
            skeletons: vec![skeleton],
            format: self.format,
        }
    }
}

impl Iterator for SimulatedSensor {
    type Item = SensorFrame;

    fn next(&mut self) -> Option<Self::Item> {
        match self.frames_left.as_mut() {
            Some(0) => return None,
            Some(left) => *left -= 1,
            None => {}
        }
        Some(self.render())
    }
}

impl FrameSource for SimulatedSensor {
    fn format(&self) -> SensorFormat {
        self.format
    }
}

/// Configures a [SimulatedSensor].
#[derive(Debug, Clone)]
pub struct SimulatedSensorBuilder {
    format: SensorFormat,
    frames: Option<u64>,
    seed: u64,
    noise_mm: f32,
    drift: f32,
    drift_period: f32,
    glitch_every: Option<u64>,
    glitch_len: u64,
    subject_switch_at: Option<u64>,
}

impl Default for SimulatedSensorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedSensorBuilder {
    /// VGA frames forever, 2 mm of noise, a 2 cm drift with a 120 frame
    /// period and no glitches.
    fn new() -> Self {
        SimulatedSensorBuilder {
            format: SensorFormat::vga(),
            frames: None,
            seed: 0,
            noise_mm: 2.0,
            drift: 0.02,
            drift_period: 120.0,
            glitch_every: None,
            glitch_len: 0,
            subject_switch_at: None,
        }
    }

    /// Sets the capture format.
    pub fn set_format(self, format: SensorFormat) -> Self {
        SimulatedSensorBuilder { format, ..self }
    }

    /// Stop after `frames` frames.
    pub fn set_frames(self, frames: u64) -> Self {
        SimulatedSensorBuilder {
            frames: Some(frames),
            ..self
        }
    }

    /// Seeds the depth noise.
    pub fn set_seed(self, seed: u64) -> Self {
        SimulatedSensorBuilder { seed, ..self }
    }

    /// Uniform depth noise amplitude in millimetres.
    pub fn set_noise(self, noise_mm: f32) -> Self {
        SimulatedSensorBuilder { noise_mm, ..self }
    }

    /// Camera drift amplitude in metres and period in frames.
    pub fn set_drift(self, drift: f32, period: f32) -> Self {
        SimulatedSensorBuilder {
            drift,
            drift_period: period.max(1.0),
            ..self
        }
    }

    /// Every `every` frames, jump the camera away for `len` frames.
    pub fn set_glitches(self, every: u64, len: u64) -> Self {
        SimulatedSensorBuilder {
            glitch_every: Some(every),
            glitch_len: len,
            ..self
        }
    }

    /// Report a different skeleton id from frame `frame` on.
    pub fn switch_subject_at(self, frame: u64) -> Self {
        SimulatedSensorBuilder {
            subject_switch_at: Some(frame),
            ..self
        }
    }

    /// Builds the [SimulatedSensor].
    pub fn build(self) -> SimulatedSensor {
        SimulatedSensor {
            format: self.format,
            intrinsics: Intrinsics::for_resolution(self.format.depth),
            frame_number: 0,
            frames_left: self.frames,
            rng: StdRng::seed_from_u64(self.seed),
            noise_mm: self.noise_mm,
            drift: self.drift,
            drift_period: self.drift_period,
            glitch_every: self.glitch_every,
            glitch_len: self.glitch_len,
            subject_switch_at: self.subject_switch_at,
            head_center: Point3::new(0.0, 0.0, 0.7),
            head_radius: 0.1,
        }
    }
}
