//! A CPU reference reconstruction.
//!
//! [DepthMapVolume] keeps the scene as a 2.5D model: a weighted running
//! average of depth (and color) seen from the reference camera, the pose the
//! volume was last reset at. Only observations that fall inside the voxel
//! grid, as placed by the world-to-volume transform, are fused. Alignment is
//! a translational projective ICP against that model, so rotation in the
//! seed pose is carried through unchanged.

use super::{
    AlignmentResult, ColorFrame, DepthFloatFrame, Mesh, PointCloudFrame, ProcessorPreference,
    ReconstructionVolume, ResidualFrame, SurfacePoint, VolumeError, VolumeFactory,
    VolumeParameters, INVALID_RESIDUAL,
};
use crate::sensor::{Intrinsics, Resolution};
use log::debug;
use nalgebra::{Matrix4, Point3, Vector3};

/// Correspondences further apart than this (metres) are outliers. Residuals
/// are expressed as a fraction of it.
const DISTANCE_THRESHOLD: f32 = 0.03;

/// Fraction of valid depth pixels that must find a correspondence.
const MIN_INLIER_FRACTION: f32 = 0.3;

/// ICP stops once a step moves the camera less than this (metres).
const CONVERGED_STEP: f32 = 1e-4;

/// Largest depth jump (metres, per sampled cell) bridged by a triangle.
const MESH_EDGE_LIMIT: f32 = 0.02;

/// Creates [DepthMapVolume]s. The reference implementation runs on the CPU
/// only and pretends to reserve four bytes per voxel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthMapVolumeFactory {
    /// Largest voxel storage, in bytes, the factory will agree to
    pub memory_budget_bytes: u64,
}

impl Default for DepthMapVolumeFactory {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 1 << 30,
        }
    }
}

impl VolumeFactory for DepthMapVolumeFactory {
    fn create(
        &self,
        params: &VolumeParameters,
        processor: ProcessorPreference,
        device_index: Option<usize>,
        initial_pose: &Matrix4<f32>,
    ) -> Result<Box<dyn ReconstructionVolume>, VolumeError> {
        if processor == ProcessorPreference::Accelerated {
            return Err(VolumeError::NoCompatibleDevice);
        }
        if matches!(device_index, Some(index) if index != 0) {
            return Err(VolumeError::DeviceUnavailable);
        }
        if params.voxel_count() == 0 || params.voxels_per_meter <= 0.0 {
            return Err(VolumeError::InvalidInput("empty voxel grid".to_string()));
        }
        if params.voxel_count().saturating_mul(4) > self.memory_budget_bytes {
            return Err(VolumeError::OutOfMemory);
        }
        Ok(Box::new(DepthMapVolume::new(*params, initial_pose)))
    }
}

#[derive(Debug, Clone)]
struct Model {
    resolution: Resolution,
    intrinsics: Intrinsics,
    depth: Vec<f32>,
    weight: Vec<u16>,
    color: Vec<[u8; 3]>,
    has_color: bool,
}

impl Model {
    fn new(resolution: Resolution) -> Self {
        let n = resolution.pixel_count();
        Self {
            resolution,
            intrinsics: Intrinsics::for_resolution(resolution),
            depth: vec![0.0; n],
            weight: vec![0; n],
            color: vec![[0; 3]; n],
            has_color: false,
        }
    }

    fn index(&self, u: f32, v: f32) -> Option<usize> {
        let (w, h) = (self.resolution.width as f32, self.resolution.height as f32);
        if u < 0.0 || v < 0.0 || u >= w || v >= h {
            return None;
        }
        Some(v as usize * self.resolution.width + u as usize)
    }

    fn is_empty(&self) -> bool {
        self.weight.iter().all(|w| *w == 0)
    }

    /// Reference-camera point stored at pixel `(u, v)`.
    fn point(&self, u: usize, v: usize) -> Option<Point3<f32>> {
        if u >= self.resolution.width || v >= self.resolution.height {
            return None;
        }
        let index = v * self.resolution.width + u;
        (self.weight[index] > 0)
            .then(|| self.intrinsics.backproject(u as f32, v as f32, self.depth[index]))
    }

    /// Reference-camera normal at pixel `(u, v)`, facing the camera.
    fn normal(&self, u: usize, v: usize, p: &Point3<f32>) -> Vector3<f32> {
        let near = |q: Option<Point3<f32>>| q.filter(|q| (q.z - p.z).abs() < MESH_EDGE_LIMIT);
        let horizontal = near(self.point(u + 1, v))
            .map(|q| q - p)
            .or_else(|| near(u.checked_sub(1).and_then(|u| self.point(u, v))).map(|q| p - q));
        let vertical = near(self.point(u, v + 1))
            .map(|q| q - p)
            .or_else(|| near(v.checked_sub(1).and_then(|v| self.point(u, v))).map(|q| p - q));

        let normal = match (horizontal, vertical) {
            (Some(h), Some(v)) => h.cross(&v).try_normalize(f32::EPSILON),
            _ => None,
        }
        .unwrap_or_else(|| Vector3::new(0.0, 0.0, -1.0));

        if normal.z > 0.0 {
            -normal
        } else {
            normal
        }
    }
}

struct Correspondence {
    source: Point3<f32>,
    target: Point3<f32>,
    residual: f32,
}

/// A 2.5D running-average reconstruction, see the module docs.
#[derive(Debug, Clone)]
pub struct DepthMapVolume {
    params: VolumeParameters,
    world_to_volume: Matrix4<f32>,
    reference: Matrix4<f32>,
    reference_inv: Matrix4<f32>,
    model: Option<Model>,
}

impl DepthMapVolume {
    /// An empty volume whose reference camera sits at `initial_pose`.
    pub fn new(params: VolumeParameters, initial_pose: &Matrix4<f32>) -> Self {
        let world_to_volume = params.default_world_to_volume();
        let mut volume = Self {
            params,
            world_to_volume,
            reference: Matrix4::identity(),
            reference_inv: Matrix4::identity(),
            model: None,
        };
        volume.reset_reconstruction(initial_pose, &world_to_volume);
        volume
    }

    fn model_for(&mut self, resolution: Resolution) -> &mut Model {
        if self.model.as_ref().map(|m| m.resolution) != Some(resolution) {
            debug!("DepthMapVolume : allocating model for {:?}.", resolution);
            self.model = Some(Model::new(resolution));
        }
        self.model.get_or_insert_with(|| Model::new(resolution))
    }

    fn correspond(
        &self,
        model: &Model,
        camera_to_world: &Matrix4<f32>,
        p_cam: &Point3<f32>,
    ) -> Option<Correspondence> {
        let source = camera_to_world.transform_point(p_cam);
        let p_ref = self.reference.transform_point(&source);
        let (u, v) = model.intrinsics.project(&p_ref)?;
        let (u, v) = (u.round(), v.round());
        let index = model.index(u, v)?;
        if model.weight[index] == 0 {
            return None;
        }

        let m = model.depth[index];
        let target = self
            .reference_inv
            .transform_point(&model.intrinsics.backproject(u, v, m));
        Some(Correspondence {
            source,
            target,
            residual: (m - p_ref.z) / DISTANCE_THRESHOLD,
        })
    }
}

fn check_size(what: &str, resolution: Resolution, len: usize, per_pixel: usize) -> Result<(), VolumeError> {
    if len != resolution.pixel_count() * per_pixel {
        return Err(VolumeError::InvalidInput(format!(
            "{} buffer has {} values for {:?}",
            what, len, resolution
        )));
    }
    Ok(())
}

impl ReconstructionVolume for DepthMapVolume {
    fn reset_reconstruction(&mut self, pose: &Matrix4<f32>, world_to_volume: &Matrix4<f32>) {
        self.reference = *pose;
        self.reference_inv = pose.try_inverse().unwrap_or_else(Matrix4::identity);
        self.world_to_volume = *world_to_volume;
        if let Some(model) = self.model.as_mut() {
            *model = Model::new(model.resolution);
        }
    }

    fn align_depth_to_volume(
        &mut self,
        depth: &DepthFloatFrame,
        max_iterations: u32,
        seed_pose: &Matrix4<f32>,
    ) -> Result<AlignmentResult, VolumeError> {
        let resolution = depth.resolution;
        check_size("depth", resolution, depth.depth.len(), 1)?;

        let mut residual = ResidualFrame {
            resolution,
            residuals: vec![INVALID_RESIDUAL; resolution.pixel_count()],
        };

        let model = match &self.model {
            Some(model) if model.resolution == resolution && !model.is_empty() => model,
            // Nothing fused yet, so the seed is as good as any pose.
            _ => {
                return Ok(AlignmentResult {
                    pose: *seed_pose,
                    residual,
                    energy: 0.0,
                })
            }
        };

        let intrinsics = model.intrinsics;
        let observed: Vec<(usize, Point3<f32>)> = depth
            .depth
            .iter()
            .enumerate()
            .filter(|(_, d)| DepthFloatFrame::is_surface(**d))
            .map(|(i, &d)| {
                let (u, v) = (i % resolution.width, i / resolution.width);
                (i, intrinsics.backproject(u as f32, v as f32, d))
            })
            .collect();
        if observed.is_empty() {
            return Err(VolumeError::TrackingError);
        }
        let min_inliers = ((observed.len() as f32 * MIN_INLIER_FRACTION).ceil() as usize).max(1);

        let mut camera_to_world = seed_pose
            .try_inverse()
            .ok_or_else(|| VolumeError::InvalidInput("seed pose is singular".to_string()))?;

        for _ in 0..max_iterations.max(1) {
            let (shift, inliers) = observed
                .iter()
                .filter_map(|(_, p)| self.correspond(model, &camera_to_world, p))
                .filter(|c| c.residual.abs() <= 1.0)
                .fold((Vector3::zeros(), 0usize), |(shift, n), c| {
                    (shift + (c.target - c.source), n + 1)
                });

            if inliers < min_inliers {
                debug!(
                    "DepthMapVolume : {} of {} pixels matched, giving up.",
                    inliers,
                    observed.len()
                );
                return Err(VolumeError::TrackingError);
            }

            let step = shift / inliers as f32;
            camera_to_world = Matrix4::new_translation(&step) * camera_to_world;
            if step.norm() < CONVERGED_STEP {
                break;
            }
        }

        let mut inliers = 0usize;
        let mut energy = 0.0;
        for (index, p) in &observed {
            if let Some(c) = self.correspond(model, &camera_to_world, p) {
                residual.residuals[*index] = c.residual;
                if c.residual.abs() <= 1.0 {
                    inliers += 1;
                    energy += c.residual * c.residual;
                }
            }
        }
        if inliers < min_inliers {
            return Err(VolumeError::TrackingError);
        }

        let pose = camera_to_world
            .try_inverse()
            .ok_or(VolumeError::TrackingError)?;
        Ok(AlignmentResult {
            pose,
            residual,
            energy: energy / inliers as f32,
        })
    }

    fn integrate(
        &mut self,
        depth: &DepthFloatFrame,
        color: Option<&ColorFrame>,
        max_weight: u16,
        pose: &Matrix4<f32>,
    ) -> Result<(), VolumeError> {
        let resolution = depth.resolution;
        check_size("depth", resolution, depth.depth.len(), 1)?;
        if let Some(color) = color {
            check_size("color", resolution, color.pixels.len(), 4)?;
        }

        let camera_to_world = pose
            .try_inverse()
            .ok_or_else(|| VolumeError::InvalidInput("pose is singular".to_string()))?;
        let camera_to_reference = self.reference * camera_to_world;
        let world_to_volume = self.world_to_volume;
        let params = self.params;
        let max_weight = max_weight.max(1);

        let model = self.model_for(resolution);
        let intrinsics = model.intrinsics;
        for (i, &d) in depth.depth.iter().enumerate() {
            if !DepthFloatFrame::is_surface(d) {
                continue;
            }
            let (u, v) = (i % resolution.width, i / resolution.width);
            let p_cam = intrinsics.backproject(u as f32, v as f32, d);
            let voxel = world_to_volume.transform_point(&camera_to_world.transform_point(&p_cam));
            if !params.contains(&voxel) {
                continue;
            }

            let p_ref = camera_to_reference.transform_point(&p_cam);
            let Some((ru, rv)) = intrinsics.project(&p_ref) else {
                continue;
            };
            let Some(index) = model.index(ru.round(), rv.round()) else {
                continue;
            };

            let mut weight = model.weight[index];
            if weight > 0 && (model.depth[index] - p_ref.z).abs() > DISTANCE_THRESHOLD {
                // Conflicting surface: wear the old one down before replacing it.
                weight -= 1;
                model.weight[index] = weight;
                if weight > 0 {
                    continue;
                }
            }

            let w = weight as f32;
            model.depth[index] = (model.depth[index] * w + p_ref.z) / (w + 1.0);
            if let Some(color) = color {
                let [b, g, r, _] = color.pixel(i);
                let old = model.color[index];
                let blend = |old: u8, new: u8| ((old as f32 * w + new as f32) / (w + 1.0)) as u8;
                model.color[index] = [blend(old[0], r), blend(old[1], g), blend(old[2], b)];
                model.has_color = true;
            }
            model.weight[index] = weight.saturating_add(1).min(max_weight);
        }

        Ok(())
    }

    fn calculate_point_cloud(&self, pose: &Matrix4<f32>) -> PointCloudFrame {
        let Some(model) = &self.model else {
            return PointCloudFrame {
                resolution: Resolution::new(0, 0),
                points: Vec::new(),
            };
        };

        let resolution = model.resolution;
        let reference_to_camera = pose * self.reference_inv;
        let mut points: Vec<Option<SurfacePoint>> = vec![None; resolution.pixel_count()];

        for v in 0..resolution.height {
            for u in 0..resolution.width {
                let Some(q_ref) = model.point(u, v) else {
                    continue;
                };
                let position = reference_to_camera.transform_point(&q_ref);
                let normal = reference_to_camera
                    .transform_vector(&model.normal(u, v, &q_ref))
                    .normalize();

                let Some((pu, pv)) = model.intrinsics.project(&position) else {
                    continue;
                };
                let Some(index) = model.index(pu.round(), pv.round()) else {
                    continue;
                };
                let closer = points[index].map_or(true, |p| position.z < p.position.z);
                if closer {
                    points[index] = Some(SurfacePoint { position, normal });
                }
            }
        }

        PointCloudFrame { resolution, points }
    }

    fn shade(&self, cloud: &PointCloudFrame, _pose: &Matrix4<f32>, view: &Matrix4<f32>) -> ColorFrame {
        let mut image = ColorFrame::new(cloud.resolution);
        for (i, point) in cloud.points.iter().enumerate() {
            let Some(point) = point else {
                continue;
            };
            let normal = view.transform_vector(&point.normal);
            let to_eye = -point.position.coords.try_normalize(f32::EPSILON).unwrap_or_else(Vector3::z);
            let lambert = normal.dot(&to_eye).clamp(0.0, 1.0);
            let level = (40.0 + 215.0 * lambert) as u8;
            image.pixels[i * 4..i * 4 + 4].copy_from_slice(&[level, level, level, 255]);
        }
        image
    }

    fn calculate_mesh(&self, voxel_step: u32) -> Result<Mesh, VolumeError> {
        let mut mesh = Mesh::default();
        let Some(model) = &self.model else {
            return Ok(mesh);
        };

        let step = voxel_step.max(1) as usize;
        let edge_limit = MESH_EDGE_LIMIT * step as f32;
        let mut colors = Vec::new();
        let world = |u: usize, v: usize| {
            model
                .point(u, v)
                .map(|p| (self.reference_inv.transform_point(&p), p.z, v * model.resolution.width + u))
        };

        for v in (0..model.resolution.height.saturating_sub(step)).step_by(step) {
            for u in (0..model.resolution.width.saturating_sub(step)).step_by(step) {
                let corners = [world(u, v), world(u + step, v), world(u, v + step), world(u + step, v + step)];
                let [Some(a), Some(b), Some(c), Some(d)] = corners else {
                    continue;
                };
                let (near, far) = [a.1, b.1, c.1, d.1]
                    .iter()
                    .fold((f32::MAX, f32::MIN), |(lo, hi), z| (lo.min(*z), hi.max(*z)));
                if far - near > edge_limit {
                    continue;
                }

                for triangle in [[a, c, b], [b, c, d]] {
                    let [p0, p1, p2] = triangle.map(|corner| corner.0);
                    let normal = (p1 - p0)
                        .cross(&(p2 - p0))
                        .try_normalize(f32::EPSILON)
                        .unwrap_or_else(|| Vector3::new(0.0, 0.0, -1.0));
                    for corner in triangle {
                        mesh.triangle_indices.push(mesh.vertices.len() as u32);
                        mesh.vertices.push(corner.0);
                        mesh.normals.push(normal);
                        colors.push(model.color[corner.2]);
                    }
                }
            }
        }

        if model.has_color {
            mesh.colors = Some(colors);
        }
        Ok(mesh)
    }

    fn default_world_to_volume(&self) -> Matrix4<f32> {
        self.params.default_world_to_volume()
    }
}
