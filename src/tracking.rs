//! The per-frame tracking and integration state machine.
//!
//! [TrackingStateMachine] runs on the fusion consumer thread and is the only
//! code that drives a [ReconstructionVolume] frame by frame. Each frame it
//! either skips work (paused), aligns and integrates (tracking), or counts a
//! failure (lost), optionally resetting the volume once failures pile up.

use crate::config::{TrackingConfig, VolumeConfig};
use crate::sensor::Resolution;
use crate::volume::{
    ColorFrame, DepthFloatFrame, PointCloudFrame, ReconstructionVolume, ResidualFrame,
    FAR_DEPTH_SENTINEL,
};
use log::{debug, info, warn};
use nalgebra::Matrix4;

/// Turns raw millimetre depth into calibrated metres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthConverter {
    /// Samples closer than this (metres) become invalid
    pub min_clip: f32,
    /// Samples beyond this (metres) become [FAR_DEPTH_SENTINEL]
    pub max_clip: f32,
    /// Flip each row horizontally
    pub mirror: bool,
}

impl DepthConverter {
    /// Build a converter from the volume and tracking settings.
    pub fn new(volume: &VolumeConfig, tracking: &TrackingConfig) -> Self {
        Self {
            min_clip: volume.min_depth_clip,
            max_clip: volume.max_depth_clip,
            mirror: tracking.mirror_depth,
        }
    }

    /// Convert `raw` into `out`, resizing `out` if the resolution changed.
    pub fn convert_into(&self, raw: &[u16], resolution: Resolution, out: &mut DepthFloatFrame) {
        if out.resolution != resolution {
            *out = DepthFloatFrame::new(resolution);
        }

        let width = resolution.width.max(1);
        for (row_in, row_out) in raw.chunks(width).zip(out.depth.chunks_mut(width)) {
            for (x, &mm) in row_in.iter().enumerate() {
                let z = mm as f32 / 1000.0;
                let metres = if mm == 0 || z < self.min_clip {
                    0.0
                } else if z > self.max_clip {
                    FAR_DEPTH_SENTINEL
                } else {
                    z
                };
                let x = if self.mirror { row_out.len() - 1 - x } else { x };
                if let Some(d) = row_out.get_mut(x) {
                    *d = metres;
                }
            }
        }
    }

    /// Copy `color` into `out` with the same row flip as the depth, so the
    /// two stay registered pixel for pixel.
    pub fn mirror_color_into(&self, color: &ColorFrame, out: &mut ColorFrame) {
        if out.resolution != color.resolution || out.pixels.len() != color.pixels.len() {
            *out = ColorFrame::new(color.resolution);
            out.pixels.resize(color.pixels.len(), 0);
        }
        if !self.mirror {
            out.pixels.copy_from_slice(&color.pixels);
            return;
        }

        let stride = color.resolution.width.max(1) * 4;
        for (row_in, row_out) in color.pixels.chunks(stride).zip(out.pixels.chunks_mut(stride)) {
            for (src, dst) in row_in.chunks_exact(4).zip(row_out.chunks_exact_mut(4).rev()) {
                dst.copy_from_slice(src);
            }
        }
    }
}

/// Coarse tracking status, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingStatus {
    /// The last alignment succeeded
    #[default]
    Tracking,
    /// The last alignment failed
    Lost,
    /// Integration is suspended by the user
    Paused,
}

/// Camera tracking state. Only the fusion consumer mutates it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackingState {
    /// Pose of the last successful alignment
    pub world_to_camera: Matrix4<f32>,
    /// Alignment failures since the last success or reset
    pub consecutive_failures: u32,
    /// Whether integration is suspended
    pub paused: bool,
}

impl Default for TrackingState {
    fn default() -> Self {
        Self {
            world_to_camera: Matrix4::identity(),
            consecutive_failures: 0,
            paused: false,
        }
    }
}

/// What alignment did with one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Alignment {
    /// The frame was aligned and integrated
    Aligned {
        /// Per-pixel residual of the alignment
        residual: ResidualFrame,
        /// Alignment energy reported by the volume
        energy: f32,
    },
    /// The frame could not be aligned
    Failed,
    /// Paused, so alignment never ran
    Skipped,
}

/// Result of running one frame through the state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutcome {
    /// Status after the frame
    pub status: TrackingStatus,
    /// What alignment did
    pub alignment: Alignment,
    /// Whether this frame triggered an automatic volume reset
    pub auto_reset: bool,
}

/// A raycast of the volume with its shaded image.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedView {
    /// Surface samples from the render pose
    pub cloud: PointCloudFrame,
    /// Shaded BGRA image of the samples
    pub image: ColorFrame,
}

/// See the module docs.
#[derive(Debug, Clone)]
pub struct TrackingStateMachine {
    config: TrackingConfig,
    converter: DepthConverter,
    max_align_iterations: u32,
    integration_weight: u16,
    integrate_color: bool,
    state: TrackingState,
    status: TrackingStatus,
    world_to_volume: Matrix4<f32>,
    depth: DepthFloatFrame,
    color: ColorFrame,
    frames_processed: u64,
}

impl TrackingStateMachine {
    /// A state machine at the identity pose for a volume placed by
    /// `world_to_volume`.
    pub fn new(tracking: &TrackingConfig, volume: &VolumeConfig, world_to_volume: Matrix4<f32>) -> Self {
        Self {
            config: tracking.clone(),
            converter: DepthConverter::new(volume, tracking),
            max_align_iterations: volume.max_align_iterations,
            integration_weight: volume.integration_weight,
            integrate_color: volume.integrate_color,
            state: TrackingState::default(),
            status: TrackingStatus::Tracking,
            world_to_volume,
            depth: DepthFloatFrame::new(Resolution::new(0, 0)),
            color: ColorFrame::new(Resolution::new(0, 0)),
            frames_processed: 0,
        }
    }

    /// Current tracking state.
    pub fn state(&self) -> &TrackingState {
        &self.state
    }

    /// Current status.
    pub fn status(&self) -> TrackingStatus {
        self.status
    }

    /// Frames run through [process](Self::process) so far.
    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    /// Suspend or resume integration.
    pub fn set_paused(&mut self, paused: bool) {
        if self.state.paused != paused {
            info!("TrackingStateMachine : {}.", if paused { "paused" } else { "resumed" });
        }
        self.state.paused = paused;
        self.status = match (paused, self.status) {
            (true, _) => TrackingStatus::Paused,
            (false, TrackingStatus::Paused) => TrackingStatus::Tracking,
            (false, status) => status,
        };
    }

    /// Clear the volume and restart tracking at `pose`. Calling this twice
    /// with the same arguments leaves the same state.
    pub fn reset(
        &mut self,
        volume: &mut dyn ReconstructionVolume,
        pose: &Matrix4<f32>,
        world_to_volume: &Matrix4<f32>,
    ) {
        volume.reset_reconstruction(pose, world_to_volume);
        self.world_to_volume = *world_to_volume;
        self.state.world_to_camera = *pose;
        self.state.consecutive_failures = 0;
    }

    /// Run one raw depth frame (millimetres) and its mapped color through
    /// the state machine.
    pub fn process(
        &mut self,
        volume: &mut dyn ReconstructionVolume,
        raw_depth: &[u16],
        resolution: Resolution,
        color: Option<&ColorFrame>,
    ) -> FrameOutcome {
        self.frames_processed += 1;

        if self.state.paused {
            self.status = TrackingStatus::Paused;
            return FrameOutcome {
                status: self.status,
                alignment: Alignment::Skipped,
                auto_reset: false,
            };
        }

        self.converter.convert_into(raw_depth, resolution, &mut self.depth);

        let aligned = volume.align_depth_to_volume(
            &self.depth,
            self.max_align_iterations,
            &self.state.world_to_camera,
        );

        let mut auto_reset = false;
        let alignment = match aligned {
            Ok(result) => {
                self.state.consecutive_failures = 0;
                self.status = TrackingStatus::Tracking;

                let color = match color.filter(|_| self.integrate_color) {
                    Some(frame) if self.converter.mirror => {
                        self.converter.mirror_color_into(frame, &mut self.color);
                        Some(&self.color)
                    }
                    other => other,
                };
                if let Err(e) =
                    volume.integrate(&self.depth, color, self.integration_weight, &result.pose)
                {
                    warn!("TrackingStateMachine : integration failed: {}", e);
                }
                self.state.world_to_camera = result.pose;

                Alignment::Aligned {
                    residual: result.residual,
                    energy: result.energy,
                }
            }
            Err(e) => {
                self.state.consecutive_failures += 1;
                self.status = TrackingStatus::Lost;
                debug!(
                    "TrackingStateMachine : {} ({} in a row).",
                    e, self.state.consecutive_failures
                );

                if self.config.auto_reset
                    && self.state.consecutive_failures >= self.config.failure_threshold
                {
                    info!(
                        "TrackingStateMachine : resetting volume after {} failed alignments.",
                        self.state.consecutive_failures
                    );
                    let world_to_volume = self.world_to_volume;
                    self.reset(volume, &Matrix4::identity(), &world_to_volume);
                    auto_reset = true;
                }

                Alignment::Failed
            }
        };

        FrameOutcome {
            status: self.status,
            alignment,
            auto_reset,
        }
    }

    /// Raycast and shade the volume from `render_pose`, on the configured
    /// cadence. Returns `None` on frames the cadence skips.
    pub fn render(
        &self,
        volume: &dyn ReconstructionVolume,
        render_pose: &Matrix4<f32>,
    ) -> Option<RenderedView> {
        let interval = self.config.render_interval.max(1) as u64;
        if self.frames_processed.saturating_sub(1) % interval != 0 {
            return None;
        }

        let cloud = volume.calculate_point_cloud(render_pose);
        let image = volume.shade(&cloud, render_pose, &Matrix4::identity());
        Some(RenderedView { cloud, image })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{AlignmentResult, Mesh, VolumeError};
    use nalgebra::Vector3;
    use std::collections::VecDeque;

    const RES: Resolution = Resolution::new(4, 2);

    /// Volume double that replays a script of alignment outcomes.
    #[derive(Default)]
    struct ScriptedVolume {
        script: VecDeque<bool>,
        aligns: usize,
        integrations: usize,
        integrated_color: bool,
        last_integrated: Option<(DepthFloatFrame, Option<ColorFrame>)>,
        resets: usize,
        raycasts: usize,
    }

    impl ScriptedVolume {
        fn with_script(script: &[bool]) -> Self {
            Self {
                script: script.iter().copied().collect(),
                ..Self::default()
            }
        }
    }

    impl ReconstructionVolume for ScriptedVolume {
        fn reset_reconstruction(&mut self, _pose: &Matrix4<f32>, _world_to_volume: &Matrix4<f32>) {
            self.resets += 1;
        }

        fn align_depth_to_volume(
            &mut self,
            depth: &DepthFloatFrame,
            _max_iterations: u32,
            seed_pose: &Matrix4<f32>,
        ) -> Result<AlignmentResult, VolumeError> {
            self.aligns += 1;
            if self.script.pop_front().unwrap_or(true) {
                Ok(AlignmentResult {
                    pose: Matrix4::new_translation(&Vector3::new(0.0, 0.0, 0.01)) * seed_pose,
                    residual: ResidualFrame {
                        resolution: depth.resolution,
                        residuals: vec![0.05; depth.depth.len()],
                    },
                    energy: 0.0025,
                })
            } else {
                Err(VolumeError::TrackingError)
            }
        }

        fn integrate(
            &mut self,
            depth: &DepthFloatFrame,
            color: Option<&ColorFrame>,
            _max_weight: u16,
            _pose: &Matrix4<f32>,
        ) -> Result<(), VolumeError> {
            self.integrations += 1;
            self.integrated_color = color.is_some();
            self.last_integrated = Some((depth.clone(), color.cloned()));
            Ok(())
        }

        fn calculate_point_cloud(&self, _pose: &Matrix4<f32>) -> PointCloudFrame {
            PointCloudFrame {
                resolution: RES,
                points: vec![None; RES.pixel_count()],
            }
        }

        fn shade(&self, cloud: &PointCloudFrame, _pose: &Matrix4<f32>, _view: &Matrix4<f32>) -> ColorFrame {
            ColorFrame::new(cloud.resolution)
        }

        fn calculate_mesh(&self, _voxel_step: u32) -> Result<Mesh, VolumeError> {
            Ok(Mesh::default())
        }

        fn default_world_to_volume(&self) -> Matrix4<f32> {
            Matrix4::identity()
        }
    }

    fn machine(tracking: TrackingConfig) -> TrackingStateMachine {
        TrackingStateMachine::new(&tracking, &VolumeConfig::default(), Matrix4::identity())
    }

    fn raw() -> Vec<u16> {
        vec![800; RES.pixel_count()]
    }

    #[test]
    fn depth_conversion_clips() {
        let converter = DepthConverter {
            min_clip: 0.35,
            max_clip: 1.2,
            mirror: false,
        };
        let mut out = DepthFloatFrame::new(Resolution::new(0, 0));
        converter.convert_into(&[0, 200, 800, 3000], Resolution::new(4, 1), &mut out);

        assert_eq!(out.depth, vec![0.0, 0.0, 0.8, FAR_DEPTH_SENTINEL]);
    }

    #[test]
    fn depth_conversion_mirrors_rows() {
        let converter = DepthConverter {
            min_clip: 0.1,
            max_clip: 2.0,
            mirror: true,
        };
        let mut out = DepthFloatFrame::new(Resolution::new(2, 2));
        converter.convert_into(&[500, 600, 700, 800], Resolution::new(2, 2), &mut out);

        assert_eq!(out.depth, vec![0.6, 0.5, 0.8, 0.7]);
    }

    #[test]
    fn success_integrates_and_moves_pose() {
        let mut volume = ScriptedVolume::with_script(&[false, true]);
        let mut machine = machine(TrackingConfig::default());
        let color = ColorFrame::new(RES);

        machine.process(&mut volume, &raw(), RES, Some(&color));
        assert_eq!(machine.state().consecutive_failures, 1);

        let outcome = machine.process(&mut volume, &raw(), RES, Some(&color));
        assert_eq!(outcome.status, TrackingStatus::Tracking);
        assert!(matches!(outcome.alignment, Alignment::Aligned { .. }));
        assert_eq!(machine.state().consecutive_failures, 0);
        assert_eq!(volume.integrations, 1);
        assert!(volume.integrated_color);
        assert!((machine.state().world_to_camera[(2, 3)] - 0.01).abs() < 1e-6);
    }

    #[test]
    fn failure_leaves_pose_and_volume_alone() {
        let mut volume = ScriptedVolume::with_script(&[false, false]);
        let mut machine = machine(TrackingConfig::default());

        let outcome = machine.process(&mut volume, &raw(), RES, None);
        machine.process(&mut volume, &raw(), RES, None);

        assert_eq!(outcome.status, TrackingStatus::Lost);
        assert_eq!(outcome.alignment, Alignment::Failed);
        assert_eq!(machine.state().consecutive_failures, 2);
        assert_eq!(machine.state().world_to_camera, Matrix4::identity());
        assert_eq!(volume.integrations, 0);
        assert_eq!(volume.resets, 0);
    }

    #[test]
    fn auto_reset_fires_once_at_threshold() {
        let mut volume = ScriptedVolume::with_script(&[false; 9]);
        let mut machine = machine(TrackingConfig {
            auto_reset: true,
            failure_threshold: 5,
            ..TrackingConfig::default()
        });

        let resets: Vec<bool> = (0..9)
            .map(|_| machine.process(&mut volume, &raw(), RES, None).auto_reset)
            .collect();

        assert_eq!(resets.iter().filter(|r| **r).count(), 1);
        assert!(resets[4]);
        assert_eq!(volume.resets, 1);
        assert_eq!(machine.state().consecutive_failures, 4);
    }

    #[test]
    fn auto_reset_disabled_keeps_counting() {
        let mut volume = ScriptedVolume::with_script(&[false; 12]);
        let mut machine = machine(TrackingConfig {
            auto_reset: false,
            failure_threshold: 5,
            ..TrackingConfig::default()
        });

        for _ in 0..12 {
            assert!(!machine.process(&mut volume, &raw(), RES, None).auto_reset);
        }
        assert_eq!(machine.state().consecutive_failures, 12);
        assert_eq!(volume.resets, 0);
    }

    #[test]
    fn paused_skips_alignment_but_renders() {
        let mut volume = ScriptedVolume::default();
        let mut machine = machine(TrackingConfig {
            render_interval: 1,
            ..TrackingConfig::default()
        });
        machine.set_paused(true);

        let outcome = machine.process(&mut volume, &raw(), RES, None);
        assert_eq!(outcome.status, TrackingStatus::Paused);
        assert_eq!(outcome.alignment, Alignment::Skipped);
        assert_eq!(volume.aligns, 0);
        assert!(machine.render(&volume, &Matrix4::identity()).is_some());

        machine.set_paused(false);
        assert_eq!(machine.status(), TrackingStatus::Tracking);
    }

    #[test]
    fn reset_is_idempotent() {
        let mut volume = ScriptedVolume::with_script(&[false, false, false]);
        let mut machine = machine(TrackingConfig::default());
        for _ in 0..3 {
            machine.process(&mut volume, &raw(), RES, None);
        }

        let pose = Matrix4::new_translation(&Vector3::new(0.1, 0.0, 0.0));
        let world_to_volume = Matrix4::new_scaling(512.0);
        machine.reset(&mut volume, &pose, &world_to_volume);
        let first = *machine.state();
        machine.reset(&mut volume, &pose, &world_to_volume);

        assert_eq!(*machine.state(), first);
        assert_eq!(first.consecutive_failures, 0);
        assert_eq!(first.world_to_camera, pose);
    }

    #[test]
    fn renders_every_other_frame() {
        let mut volume = ScriptedVolume::default();
        let mut machine = machine(TrackingConfig {
            render_interval: 2,
            ..TrackingConfig::default()
        });

        let rendered: Vec<bool> = (0..4)
            .map(|_| {
                machine.process(&mut volume, &raw(), RES, None);
                machine.render(&volume, &Matrix4::identity()).is_some()
            })
            .collect();
        assert_eq!(rendered, vec![true, false, true, false]);
    }

    #[test]
    fn mirrored_color_stays_registered_with_depth() {
        const RED: [u8; 4] = [0, 0, 255, 255];
        const BLUE: [u8; 4] = [255, 0, 0, 255];
        let res = Resolution::new(2, 1);
        let mut color = ColorFrame::new(res);
        color.pixels = [RED, BLUE].concat();

        let mut volume = ScriptedVolume::default();
        let mut machine = TrackingStateMachine::new(
            &TrackingConfig {
                mirror_depth: true,
                ..TrackingConfig::default()
            },
            &VolumeConfig {
                integrate_color: true,
                ..VolumeConfig::default()
            },
            Matrix4::identity(),
        );
        machine.process(&mut volume, &[500, 0], res, Some(&color));

        let (depth, color) = volume.last_integrated.take().expect("integrated");
        let color = color.expect("color integrated");
        assert_eq!(depth.depth, vec![0.0, 0.5]);
        assert_eq!(color.pixel(1), RED);
        assert_eq!(color.pixel(0), BLUE);
    }

    #[test]
    fn unmirrored_color_passes_through() {
        let res = Resolution::new(2, 1);
        let mut color = ColorFrame::new(res);
        color.pixels = (0..8).collect();
        let converter = DepthConverter {
            min_clip: 0.0,
            max_clip: 10.0,
            mirror: false,
        };
        let mut out = ColorFrame::new(Resolution::new(0, 0));
        converter.mirror_color_into(&color, &mut out);
        assert_eq!(out, color);
    }
}
