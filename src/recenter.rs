//! Keeps the reconstruction volume centred on the scanned subject.
//!
//! The [Recenterer] runs on the producer side. It watches the skeletons of
//! each frame and, when a new subject shows up or a reset is requested,
//! produces a [VolumeReset] carrying a world-to-volume transform that puts
//! the subject's head in the middle of the voxel grid. The tracking pose is
//! never touched here.
//!
//! [RenderOrbit] is a display-only transform that spins the rendered volume
//! while integration is paused.

use crate::config::{RecenterConfig, VolumeConfig};
use crate::sensor::{JointType, Skeleton, SkeletonId};
use crate::volume::VolumeParameters;
use log::{debug, info};
use nalgebra::{Matrix4, Point3, Vector3};
use std::f32::consts::TAU;

/// Where the volume should be centred.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeAnchor {
    /// Smoothed center
    pub current: Point3<f32>,
    /// Center measured on the latest frame
    pub target: Point3<f32>,
}

/// A volume reset requested by the [Recenterer].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeReset {
    /// Transform placing `center` in the middle of the grid
    pub world_to_volume: Matrix4<f32>,
    /// World-space center the transform was built for
    pub center: Point3<f32>,
}

/// The point `fraction` of the way from the neck to the head of `skeleton`,
/// if both joints are tracked.
pub fn blend_center(skeleton: &Skeleton, fraction: f32) -> Option<Point3<f32>> {
    let head = skeleton.tracked_joint(JointType::Head)?;
    let neck = skeleton.tracked_joint(JointType::ShoulderCenter)?;
    Some(neck + (head - neck) * fraction)
}

/// See the module docs.
#[derive(Debug, Clone)]
pub struct Recenterer {
    config: RecenterConfig,
    params: VolumeParameters,
    depth_extent: f32,
    subject: Option<SkeletonId>,
    anchor: Option<VolumeAnchor>,
    misses: u32,
    reset_requested: bool,
}

impl Recenterer {
    /// A recenterer with no subject yet.
    pub fn new(recenter: &RecenterConfig, volume: &VolumeConfig) -> Self {
        Self {
            config: recenter.clone(),
            params: VolumeParameters::from_config(volume),
            depth_extent: volume.depth_extent(),
            subject: None,
            anchor: None,
            misses: 0,
            reset_requested: false,
        }
    }

    /// Reset the volume around the current center on the next update.
    pub fn request_reset(&mut self) {
        self.reset_requested = true;
    }

    /// The subject the volume follows.
    pub fn subject(&self) -> Option<SkeletonId> {
        self.subject
    }

    /// The current anchor, if a subject has been seen.
    pub fn anchor(&self) -> Option<VolumeAnchor> {
        self.anchor
    }

    /// The on-axis center used when no joints are tracked.
    pub fn default_center(&self) -> Point3<f32> {
        Point3::from(self.config.default_center)
    }

    /// The world-to-volume transform that places `center` in the middle of
    /// the grid.
    pub fn world_to_volume_for(&self, center: &Point3<f32>) -> Matrix4<f32> {
        let vpm = self.params.voxels_per_meter;
        let mut m = self.params.default_world_to_volume();
        m[(0, 3)] -= center.x * vpm;
        m[(1, 3)] -= center.y * vpm;
        m[(2, 3)] -= (center.z - self.depth_extent / 2.0) * vpm;
        m
    }

    fn reset_at(&mut self, center: Point3<f32>) -> VolumeReset {
        self.anchor = Some(VolumeAnchor {
            current: center,
            target: center,
        });
        VolumeReset {
            world_to_volume: self.world_to_volume_for(&center),
            center,
        }
    }

    /// Feed the skeletons of one frame. Returns a reset when the volume
    /// should move.
    pub fn update(&mut self, skeletons: &[Skeleton]) -> Option<VolumeReset> {
        let requested = std::mem::take(&mut self.reset_requested);

        // Stay on the current subject while it is tracked, whatever order
        // the sensor lists skeletons in.
        let current = skeletons
            .iter()
            .find(|s| s.tracked && Some(s.id) == self.subject);
        let Some(skeleton) = current.or_else(|| skeletons.iter().find(|s| s.tracked)) else {
            self.misses = self.misses.saturating_add(1);
            if self.subject.is_some() && self.misses >= self.config.miss_threshold {
                info!("Recenterer : subject lost after {} frames.", self.misses);
                self.subject = None;
                self.anchor = None;
            }

            return requested.then(|| {
                let center = self
                    .anchor
                    .map_or_else(|| self.default_center(), |a| a.current);
                self.reset_at(center)
            });
        };

        self.misses = 0;
        let center =
            blend_center(skeleton, self.config.head_neck_blend).unwrap_or_else(|| self.default_center());

        if self.subject != Some(skeleton.id) || requested {
            info!(
                "Recenterer : centring on subject {} at ({:.3}, {:.3}, {:.3}).",
                skeleton.id, center.x, center.y, center.z
            );
            self.subject = Some(skeleton.id);
            return Some(self.reset_at(center));
        }

        if let Some(anchor) = self.anchor.as_mut() {
            anchor.target = center;
            anchor.current += (anchor.target - anchor.current) * self.config.smoothing;
        }
        None
    }
}

/// Spins the rendered volume about a vertical axis through `pivot` while
/// integration is paused.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderOrbit {
    angle: f32,
    rate: f32,
    pivot: Point3<f32>,
}

impl RenderOrbit {
    /// An orbit turning `rate` radians per frame about `pivot`.
    pub fn new(rate: f32, pivot: Point3<f32>) -> Self {
        Self {
            angle: 0.0,
            rate,
            pivot,
        }
    }

    /// Move the orbit axis.
    pub fn set_pivot(&mut self, pivot: Point3<f32>) {
        self.pivot = pivot;
    }

    /// Current orbit angle in radians.
    pub fn angle(&self) -> f32 {
        self.angle
    }

    /// Step the orbit one frame. It only turns while paused and snaps back
    /// to the tracking view on resume.
    pub fn advance(&mut self, paused: bool) {
        if paused {
            self.angle = (self.angle + self.rate) % TAU;
        } else if self.angle != 0.0 {
            debug!("RenderOrbit : back to tracking view.");
            self.angle = 0.0;
        }
    }

    /// The pose to render from, given the tracking pose.
    pub fn render_pose(&self, world_to_camera: &Matrix4<f32>) -> Matrix4<f32> {
        if self.angle == 0.0 {
            return *world_to_camera;
        }
        let pivot = self.pivot.coords;
        world_to_camera
            * Matrix4::new_translation(&pivot)
            * Matrix4::new_rotation(Vector3::y() * self.angle)
            * Matrix4::new_translation(&-pivot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::{Joint, TrackingConfidence};

    fn skeleton(id: SkeletonId, head: [f32; 3], neck: [f32; 3]) -> Skeleton {
        let joint = |kind, p: [f32; 3]| Joint {
            kind,
            position: Point3::from(p),
            confidence: TrackingConfidence::Tracked,
        };
        Skeleton {
            id,
            tracked: true,
            joints: vec![joint(JointType::Head, head), joint(JointType::ShoulderCenter, neck)],
        }
    }

    fn recenterer(miss_threshold: u32) -> Recenterer {
        Recenterer::new(
            &RecenterConfig {
                miss_threshold,
                ..RecenterConfig::default()
            },
            &VolumeConfig::default(),
        )
    }

    #[test]
    fn center_blends_head_and_neck() {
        let s = skeleton(1, [0.0, -0.2, 0.7], [0.0, 0.0, 0.7]);
        let center = blend_center(&s, 0.5).unwrap();
        assert!((center - Point3::new(0.0, -0.1, 0.7)).norm() < 1e-6);
        assert_eq!(blend_center(&s, 1.0), Some(Point3::new(0.0, -0.2, 0.7)));
    }

    #[test]
    fn new_subject_triggers_one_reset() {
        let mut r = recenterer(30);
        let first = [skeleton(1, [0.0, -0.2, 0.7], [0.0, 0.0, 0.7])];

        assert!(r.update(&first).is_some());
        assert!(r.update(&first).is_none());
        assert_eq!(r.subject(), Some(1));

        let other = [skeleton(2, [0.1, -0.2, 0.8], [0.1, 0.0, 0.8])];
        assert!(r.update(&other).is_some());
        assert_eq!(r.subject(), Some(2));
    }

    #[test]
    fn untracked_joints_use_default_center() {
        let mut r = recenterer(30);
        let mut s = skeleton(4, [0.0, -0.2, 0.7], [0.0, 0.0, 0.7]);
        s.joints[0].confidence = TrackingConfidence::Inferred;

        let reset = r.update(&[s]).unwrap();
        assert_eq!(reset.center, r.default_center());
    }

    #[test]
    fn transform_centres_the_subject() {
        let r = recenterer(30);
        let volume = VolumeConfig::default();
        let center = Point3::new(0.05, -0.1, 0.9);

        let voxel = r.world_to_volume_for(&center).transform_point(&center);
        assert!((voxel.x - volume.resolution_x as f32 / 2.0).abs() < 1e-2);
        assert!((voxel.y - volume.resolution_y as f32 / 2.0).abs() < 1e-2);
        assert!((voxel.z - volume.resolution_z as f32 / 2.0).abs() < 1e-2);
    }

    #[test]
    fn short_absence_keeps_subject() {
        let mut r = recenterer(3);
        let s = [skeleton(1, [0.0, -0.2, 0.7], [0.0, 0.0, 0.7])];
        r.update(&s);

        r.update(&[]);
        r.update(&[]);
        assert!(r.anchor().is_some());
        assert!(r.update(&s).is_none());

        for _ in 0..3 {
            r.update(&[]);
        }
        assert_eq!(r.subject(), None);
        assert_eq!(r.anchor(), None);
        assert!(r.update(&s).is_some());
    }

    #[test]
    fn keeps_subject_when_skeleton_order_changes() {
        let mut r = recenterer(30);
        let first = skeleton(1, [0.0, -0.2, 0.7], [0.0, 0.0, 0.7]);
        let second = skeleton(2, [0.3, -0.2, 0.9], [0.3, 0.0, 0.9]);
        assert!(r.update(&[first.clone(), second.clone()]).is_some());
        assert_eq!(r.subject(), Some(1));

        assert!(r.update(&[second.clone(), first]).is_none());
        assert_eq!(r.subject(), Some(1));

        // The other person takes over once the subject is no longer tracked.
        assert!(r.update(&[second]).is_some());
        assert_eq!(r.subject(), Some(2));
    }

    #[test]
    fn requested_reset_without_subject_uses_default() {
        let mut r = recenterer(30);
        r.request_reset();
        let reset = r.update(&[]).unwrap();
        assert_eq!(reset.center, r.default_center());
        assert!(r.update(&[]).is_none());
    }

    #[test]
    fn anchor_smooths_toward_target() {
        let mut r = recenterer(30);
        r.update(&[skeleton(1, [0.0, 0.0, 0.7], [0.0, 0.0, 0.7])]);
        r.update(&[skeleton(1, [0.0, 0.0, 1.7], [0.0, 0.0, 1.7])]);

        let anchor = r.anchor().unwrap();
        assert!((anchor.target.z - 1.7).abs() < 1e-6);
        assert!((anchor.current.z - 0.9).abs() < 1e-5);
    }

    #[test]
    fn orbit_turns_only_while_paused() {
        let pivot = Point3::new(0.0, 0.0, 0.7);
        let mut orbit = RenderOrbit::new(0.5, pivot);
        let pose = Matrix4::identity();

        orbit.advance(false);
        assert_eq!(orbit.render_pose(&pose), pose);

        orbit.advance(true);
        let render = orbit.render_pose(&pose);
        assert!(render != pose);
        // The pivot is on the rotation axis, so it stays put.
        assert!((render.transform_point(&pivot) - pivot).norm() < 1e-5);

        orbit.advance(false);
        assert_eq!(orbit.angle(), 0.0);
        assert_eq!(orbit.render_pose(&pose), pose);
    }
}
