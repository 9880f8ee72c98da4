//! Types describing what the depth camera delivers each frame.
//!
//! Capture, synchronization and color-to-depth remapping happen upstream;
//! a [SensorFrame] arrives already synchronized with its color mapped into
//! depth space.

use nalgebra::Point3;

/// Identifies a tracked skeleton across frames.
pub type SkeletonId = u64;

/// Width and height of an image, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    /// Pixels per row
    pub width: usize,
    /// Rows
    pub height: usize,
}

impl Resolution {
    /// Instantiate a resolution.
    pub const fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// Number of pixels in an image of this resolution.
    pub const fn pixel_count(&self) -> usize {
        self.width * self.height
    }
}

/// The capture format currently produced by the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SensorFormat {
    /// Resolution of the depth stream
    pub depth: Resolution,
    /// Resolution of the color stream
    pub color: Resolution,
    /// Maximum number of skeletons reported per frame
    pub skeleton_count: usize,
}

impl SensorFormat {
    /// The common 640x480 depth and color format.
    pub const fn vga() -> Self {
        Self {
            depth: Resolution::new(640, 480),
            color: Resolution::new(640, 480),
            skeleton_count: 6,
        }
    }
}

impl Default for SensorFormat {
    fn default() -> Self {
        Self::vga()
    }
}

/// Pinhole parameters of the depth camera, in pixels.
///
/// Camera space is x right, y down, z forward, in metres, matching image
/// rows and columns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intrinsics {
    /// Focal length along x
    pub fx: f32,
    /// Focal length along y
    pub fy: f32,
    /// Principal point column
    pub cx: f32,
    /// Principal point row
    pub cy: f32,
}

impl Intrinsics {
    /// Nominal parameters of the depth camera scaled to `resolution`.
    pub fn for_resolution(resolution: Resolution) -> Self {
        let focal = resolution.width as f32 * 0.9;
        Self {
            fx: focal,
            fy: focal,
            cx: resolution.width as f32 / 2.0,
            cy: resolution.height as f32 / 2.0,
        }
    }

    /// Camera-space point seen at pixel `(u, v)` with depth `z`.
    pub fn backproject(&self, u: f32, v: f32, z: f32) -> Point3<f32> {
        Point3::new((u - self.cx) * z / self.fx, (v - self.cy) * z / self.fy, z)
    }

    /// Pixel that `p` projects to, if it is in front of the camera.
    pub fn project(&self, p: &Point3<f32>) -> Option<(f32, f32)> {
        if p.z <= f32::EPSILON {
            return None;
        }
        Some((p.x * self.fx / p.z + self.cx, p.y * self.fy / p.z + self.cy))
    }
}

/// The joints the recentering controller cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JointType {
    /// Top of the head
    Head,
    /// Base of the neck, between the shoulders
    ShoulderCenter,
}

/// How confidently the skeleton tracker located a joint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingConfidence {
    /// The joint is not known
    NotTracked,
    /// The joint position is a guess from neighbouring joints
    Inferred,
    /// The joint is tracked directly
    Tracked,
}

/// A single joint reported by the skeleton tracker, in camera space metres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Joint {
    /// Which joint this is
    pub kind: JointType,
    /// Camera-space position in metres
    pub position: Point3<f32>,
    /// Confidence of the position
    pub confidence: TrackingConfidence,
}

/// A skeleton reported by the tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct Skeleton {
    /// Tracker-assigned identity, stable while the person stays in view
    pub id: SkeletonId,
    /// Whether the whole skeleton is tracked
    pub tracked: bool,
    /// Reported joints
    pub joints: Vec<Joint>,
}

impl Skeleton {
    /// Position of `kind` if it is directly tracked.
    pub fn tracked_joint(&self, kind: JointType) -> Option<Point3<f32>> {
        self.joints
            .iter()
            .find(|j| j.kind == kind && j.confidence == TrackingConfidence::Tracked)
            .map(|j| j.position)
    }
}

/// One synchronized set of sensor data.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorFrame {
    /// Sequence number assigned by the sensor
    pub frame_number: u64,
    /// Raw depth in millimetres, row major, `format.depth` sized
    pub depth: Vec<u16>,
    /// BGRA color already mapped into depth space, 4 bytes per depth pixel
    pub color: Vec<u8>,
    /// Skeletons seen in this frame
    pub skeletons: Vec<Skeleton>,
    /// Format the frame was captured in
    pub format: SensorFormat,
}

impl SensorFrame {
    /// The first fully tracked skeleton, if any.
    pub fn first_tracked_skeleton(&self) -> Option<&Skeleton> {
        self.skeletons.iter().find(|s| s.tracked)
    }
}

/// `FrameSource`
///
/// Anything that emits [SensorFrame]s when iterated upon: a real device
/// wrapper or a [SimulatedSensor](crate::simulated_sensor::SimulatedSensor).
pub trait FrameSource: Iterator<Item = SensorFrame> {
    /// The format of the frames currently being produced.
    fn format(&self) -> SensorFormat;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joint(kind: JointType, confidence: TrackingConfidence) -> Joint {
        Joint {
            kind,
            position: Point3::new(0.0, 0.1, 0.8),
            confidence,
        }
    }

    #[test]
    fn inferred_joints_are_not_tracked() {
        let skeleton = Skeleton {
            id: 7,
            tracked: true,
            joints: vec![
                joint(JointType::Head, TrackingConfidence::Inferred),
                joint(JointType::ShoulderCenter, TrackingConfidence::Tracked),
            ],
        };

        assert_eq!(skeleton.tracked_joint(JointType::Head), None);
        assert!(skeleton.tracked_joint(JointType::ShoulderCenter).is_some());
    }

    #[test]
    fn project_inverts_backproject() {
        let intrinsics = Intrinsics::for_resolution(Resolution::new(64, 48));
        let p = intrinsics.backproject(10.0, 40.0, 0.8);
        let (u, v) = intrinsics.project(&p).unwrap();
        assert!((u - 10.0).abs() < 1e-3);
        assert!((v - 40.0).abs() < 1e-3);
        assert_eq!(intrinsics.project(&Point3::new(0.0, 0.0, -1.0)), None);
    }

    #[test]
    fn vga_pixel_count() {
        assert_eq!(SensorFormat::vga().depth.pixel_count(), 307200);
    }
}
