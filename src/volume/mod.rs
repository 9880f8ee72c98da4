//! The reconstruction volume capability.
//!
//! Depth conversion happens in [tracking](crate::tracking); everything that
//! touches voxels (alignment, integration, raycasting, meshing) goes through
//! a [ReconstructionVolume]. Implementations are not expected to be
//! thread-safe: the fusion consumer thread is the only caller, which the
//! session guarantees by moving the volume into that thread.

mod depth_map;

pub use depth_map::{DepthMapVolume, DepthMapVolumeFactory};

use crate::config::VolumeConfig;
use crate::sensor::Resolution;
use nalgebra::{Matrix4, Point3, Vector3};
use std::fmt;

/// Depth value written for samples beyond the far clip distance. Far samples
/// are kept at a large distance instead of being zeroed, so a static camera
/// does not carve away voxels behind the subject.
pub const FAR_DEPTH_SENTINEL: f32 = 10.0;

/// Residual value for pixels that took no part in alignment.
pub const INVALID_RESIDUAL: f32 = 2.0;

/// Calibrated depth in metres. `0.0` marks an invalid sample.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthFloatFrame {
    /// Image size
    pub resolution: Resolution,
    /// Row-major depth in metres
    pub depth: Vec<f32>,
}

impl DepthFloatFrame {
    /// An all-invalid frame.
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            depth: vec![0.0; resolution.pixel_count()],
        }
    }

    /// Whether `depth` is a real surface measurement.
    pub fn is_surface(depth: f32) -> bool {
        depth > 0.0 && depth < FAR_DEPTH_SENTINEL
    }
}

/// A BGRA image.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorFrame {
    /// Image size
    pub resolution: Resolution,
    /// Row-major BGRA bytes
    pub pixels: Vec<u8>,
}

impl ColorFrame {
    /// An all-black image.
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            pixels: vec![0; resolution.pixel_count() * 4],
        }
    }

    /// BGRA bytes of pixel `index`.
    pub fn pixel(&self, index: usize) -> [u8; 4] {
        let p = &self.pixels[index * 4..index * 4 + 4];
        [p[0], p[1], p[2], p[3]]
    }
}

/// Per-pixel alignment residual. Values lie in roughly `[-1, 1]`; anything
/// with a larger magnitude took no part in alignment.
#[derive(Debug, Clone, PartialEq)]
pub struct ResidualFrame {
    /// Image size
    pub resolution: Resolution,
    /// Row-major residuals
    pub residuals: Vec<f32>,
}

/// A raycast surface sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfacePoint {
    /// Camera-space position
    pub position: Point3<f32>,
    /// Camera-space unit normal
    pub normal: Vector3<f32>,
}

/// The volume surface as seen from some pose.
#[derive(Debug, Clone, PartialEq)]
pub struct PointCloudFrame {
    /// Image size
    pub resolution: Resolution,
    /// Surface sample per pixel, `None` where the ray hit nothing
    pub points: Vec<Option<SurfacePoint>>,
}

/// Output of a successful alignment.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentResult {
    /// Refined world-to-camera transform
    pub pose: Matrix4<f32>,
    /// Per-pixel residual of the final iteration
    pub residual: ResidualFrame,
    /// Mean squared residual over participating pixels
    pub energy: f32,
}

/// A triangle mesh with three unshared vertices per triangle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    /// World-space positions
    pub vertices: Vec<Point3<f32>>,
    /// Per-vertex unit normals
    pub normals: Vec<Vector3<f32>>,
    /// Per-vertex RGB colors, when color was integrated
    pub colors: Option<Vec<[u8; 3]>>,
    /// Vertex indices, three per triangle
    pub triangle_indices: Vec<u32>,
}

/// Geometry of the voxel grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeParameters {
    /// Voxels per metre along each axis
    pub voxels_per_meter: f32,
    /// Voxel count along x
    pub resolution_x: u32,
    /// Voxel count along y
    pub resolution_y: u32,
    /// Voxel count along z
    pub resolution_z: u32,
}

impl VolumeParameters {
    /// Extract the grid geometry from the volume config.
    pub fn from_config(config: &VolumeConfig) -> Self {
        Self {
            voxels_per_meter: config.voxels_per_meter,
            resolution_x: config.resolution_x,
            resolution_y: config.resolution_y,
            resolution_z: config.resolution_z,
        }
    }

    /// Total number of voxels.
    pub fn voxel_count(&self) -> u64 {
        self.resolution_x as u64 * self.resolution_y as u64 * self.resolution_z as u64
    }

    /// The world-to-volume transform of a freshly created volume: scaled to
    /// voxel units and centred on the camera axis, with the near face at the
    /// camera.
    pub fn default_world_to_volume(&self) -> Matrix4<f32> {
        let mut m = Matrix4::new_scaling(self.voxels_per_meter);
        m[(0, 3)] = self.resolution_x as f32 / 2.0;
        m[(1, 3)] = self.resolution_y as f32 / 2.0;
        m
    }

    /// Whether a voxel-space point lies inside the grid.
    pub fn contains(&self, voxel: &Point3<f32>) -> bool {
        (0.0..self.resolution_x as f32).contains(&voxel.x)
            && (0.0..self.resolution_y as f32).contains(&voxel.y)
            && (0.0..self.resolution_z as f32).contains(&voxel.z)
    }
}

/// Where the reconstruction should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessorPreference {
    /// On the CPU
    Cpu,
    /// On an accelerator
    Accelerated,
    /// Wherever is available
    #[default]
    Any,
}

/// Failures reported by the reconstruction capability.
#[derive(Debug, Clone, PartialEq)]
pub enum VolumeError {
    /// No device satisfies the processor preference
    NoCompatibleDevice,
    /// The volume does not fit in the available memory
    OutOfMemory,
    /// The requested device exists but cannot be used
    DeviceUnavailable,
    /// Alignment did not converge on a pose
    TrackingError,
    /// An input does not fit the volume
    InvalidInput(String),
}

impl fmt::Display for VolumeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeError::NoCompatibleDevice => write!(f, "no compatible reconstruction device"),
            VolumeError::OutOfMemory => write!(f, "not enough memory for the reconstruction volume"),
            VolumeError::DeviceUnavailable => write!(f, "reconstruction device unavailable"),
            VolumeError::TrackingError => write!(f, "camera tracking failed"),
            VolumeError::InvalidInput(what) => write!(f, "invalid input: {}", what),
        }
    }
}

impl std::error::Error for VolumeError {}

/// A volumetric reconstruction of the scene.
pub trait ReconstructionVolume: Send {
    /// Clear the volume and restart it at `pose` with the given
    /// world-to-volume transform.
    fn reset_reconstruction(&mut self, pose: &Matrix4<f32>, world_to_volume: &Matrix4<f32>);

    /// Estimate the camera pose of `depth` against the volume, starting
    /// from `seed_pose` and giving up after `max_iterations`.
    fn align_depth_to_volume(
        &mut self,
        depth: &DepthFloatFrame,
        max_iterations: u32,
        seed_pose: &Matrix4<f32>,
    ) -> Result<AlignmentResult, VolumeError>;

    /// Fuse a depth (and optionally color) observation taken at `pose`.
    /// `max_weight` caps how many observations a voxel averages over.
    fn integrate(
        &mut self,
        depth: &DepthFloatFrame,
        color: Option<&ColorFrame>,
        max_weight: u16,
        pose: &Matrix4<f32>,
    ) -> Result<(), VolumeError>;

    /// Raycast the surface as seen from `pose`.
    fn calculate_point_cloud(&self, pose: &Matrix4<f32>) -> PointCloudFrame;

    /// Render a point cloud as a shaded image, lit from `view`.
    fn shade(&self, cloud: &PointCloudFrame, pose: &Matrix4<f32>, view: &Matrix4<f32>) -> ColorFrame;

    /// Extract the surface, sampling every `voxel_step` cells.
    fn calculate_mesh(&self, voxel_step: u32) -> Result<Mesh, VolumeError>;

    /// The transform a freshly created volume uses.
    fn default_world_to_volume(&self) -> Matrix4<f32>;
}

/// Creates [ReconstructionVolume]s.
pub trait VolumeFactory {
    /// Create a volume, or report why none could be created.
    fn create(
        &self,
        params: &VolumeParameters,
        processor: ProcessorPreference,
        device_index: Option<usize>,
        initial_pose: &Matrix4<f32>,
    ) -> Result<Box<dyn ReconstructionVolume>, VolumeError>;
}
