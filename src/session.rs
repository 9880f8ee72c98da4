//! A running head scan.
//!
//! [ScanSession] owns the whole capture pipeline:
//!
//! ```text
//! on_frame ──► raw pool ──► raw stage (FramePreparer) ──► depth previews
//!    │                          │
//!    │ recenter resets          ▼
//!    └──────────────► fusion pool ──► fusion stage (FusionProcessor) ──► snapshots
//!                                          │
//!                                          ▼
//!                                   FeedbackState ──► AudioOutput
//! ```
//!
//! The producer side (`on_frame`) never blocks: a frame is dropped when a
//! pool is empty, and a full stage evicts its oldest pending frame. The
//! reconstruction volume is moved into the fusion stage's component, so the
//! fusion consumer thread is the only thing that ever touches it.
//! Presentation code reads [SessionSnapshot]s and [DepthPreview]s from
//! bounded channels; if it falls behind, it just sees fewer of them.

use crate::component::{Component, ComponentError};
use crate::config::{ConfigError, ScanConfig};
use crate::audio_output::{AudioOutput, AudioSink, NullSink};
use crate::feedback::{residual_image, AudioState, FeedbackState, ResidualFeedback};
use crate::frame_pool::{FramePool, PoolError, SlotLease};
use crate::mesh_export::{ExportError, MeshExportOptions, MeshExporter, MeshSummary};
use crate::pipeline_stage::{Admission, BoundedStage, StageError, StageStats};
use crate::recenter::{Recenterer, RenderOrbit, VolumeReset};
use crate::sensor::{Resolution, SensorFormat, SensorFrame};
use crate::synth::Synthesizer;
use crate::tracking::{Alignment, TrackingStateMachine, TrackingStatus};
use crate::volume::{
    ColorFrame, Mesh, ProcessorPreference, ReconstructionVolume, VolumeError, VolumeFactory,
    VolumeParameters,
};
use log::{debug, info, warn};
use nalgebra::{Matrix4, Point3};
use std::{
    fmt,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc,
    },
    time::Duration,
};

/// How long an export waits for the fusion stage to produce the mesh.
const EXPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Things that stop a session from starting or running.
#[derive(Debug)]
pub enum SessionError {
    /// The reconstruction volume could not be created
    Volume(VolumeError),
    /// The configuration is unusable
    Config(ConfigError),
    /// A frame did not fit the pools
    Pool(PoolError),
    /// The pipeline has shut down
    Stage(StageError),
    /// The audio output failed
    Audio(ComponentError),
    /// A pipeline thread could not be started
    IoError(std::io::Error),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Volume(error) => write!(f, "reconstruction unavailable: {}", error),
            SessionError::Config(error) => write!(f, "{}", error),
            SessionError::Pool(error) => write!(f, "{}", error),
            SessionError::Stage(error) => write!(f, "{}", error),
            SessionError::Audio(error) => write!(f, "audio output: {}", error),
            SessionError::IoError(error) => write!(f, "io error: {}", error),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<VolumeError> for SessionError {
    fn from(value: VolumeError) -> Self {
        Self::Volume(value)
    }
}

impl From<ConfigError> for SessionError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<PoolError> for SessionError {
    fn from(value: PoolError) -> Self {
        Self::Pool(value)
    }
}

impl From<StageError> for SessionError {
    fn from(value: StageError) -> Self {
        Self::Stage(value)
    }
}

impl From<ComponentError> for SessionError {
    fn from(value: ComponentError) -> Self {
        Self::Audio(value)
    }
}

impl From<std::io::Error> for SessionError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(value)
    }
}

/// A read-only view of the session after one fusion job.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    /// Last frame the fusion stage saw
    pub frame_number: u64,
    /// Tracking status
    pub status: TrackingStatus,
    /// Whether the last alignment succeeded
    pub is_tracking: bool,
    /// Alignment failures in a row
    pub consecutive_failures: u32,
    /// Smoothed alignment quality, lower is better
    pub alignment_quality: f32,
    /// Alignment quality formatted for display
    pub quality_text: String,
    /// What the synthesizer is asked to play
    pub audio_state: AudioState,
    /// Whether this frame reset the volume after sustained loss
    pub auto_reset: bool,
    /// Shaded raycast of the volume, on rendering frames
    pub rendered: Option<ColorFrame>,
    /// Residual visualization, on aligned frames
    pub residual_image: Option<ColorFrame>,
    /// Frames the fusion stage has run so far
    pub frames_processed: u64,
    /// Frames dropped so far because a pool was empty
    pub frames_dropped: u64,
    /// Frames evicted or drained from either stage without being run
    pub frames_cancelled: u64,
}

/// A grayscale rendering of a raw depth frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthPreview {
    /// Frame the preview was made from
    pub frame_number: u64,
    /// Image size
    pub resolution: Resolution,
    /// One byte per pixel, brighter is nearer, 0 is invalid
    pub intensity: Vec<u8>,
}

/// What `on_frame` did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDisposition {
    /// Queued for processing
    Queued,
    /// Queued after the oldest pending frame was cancelled
    ReplacedOldest,
    /// Dropped because every raw slot was busy
    Dropped,
}

/// Commands served by the fusion stage ahead of frames.
pub enum FusionCommand {
    /// Reset the volume around a new center
    Reset(VolumeReset),
    /// Suspend or resume integration
    SetPaused(bool),
    /// Extract a mesh and send it back
    ExportMesh {
        /// Voxel step for extraction
        voxel_step: u32,
        /// Where the mesh goes
        reply: Sender<Result<Mesh, VolumeError>>,
    },
}

/// A job for the fusion stage.
pub enum FusionInput {
    /// A frame to track and integrate
    Frame(SlotLease),
    /// A command
    Control(FusionCommand),
}

/// The raw stage: makes a depth preview of each frame and forwards a copy
/// to the fusion tier.
struct FramePreparer {
    fusion_pool: FramePool,
    fusion: Arc<BoundedStage<FusionInput>>,
    dropped: Arc<AtomicU64>,
    near_mm: u16,
    far_mm: u16,
}

impl FramePreparer {
    fn preview(&self, slot: &SlotLease) -> DepthPreview {
        let span = self.far_mm.saturating_sub(self.near_mm).max(1) as u32;
        let intensity = slot
            .depth
            .iter()
            .map(|&mm| {
                if mm < self.near_mm || mm > self.far_mm {
                    0
                } else {
                    (255 - (mm - self.near_mm) as u32 * 223 / span) as u8
                }
            })
            .collect();

        DepthPreview {
            frame_number: slot.frame_number,
            resolution: slot.format.depth,
            intensity,
        }
    }

    fn forward(&self, raw: &SlotLease) {
        let mut slot = match self.fusion_pool.acquire() {
            Ok(slot) => slot,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if slot.copy_from(raw).is_err() {
            debug!("{} : dropping frame {} from an old format.", self, raw.frame_number);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.fusion.enqueue(FusionInput::Frame(slot)).is_err() {
            debug!("{} : fusion stage closed.", self);
        }
    }
}

impl Component for FramePreparer {
    type InData = SlotLease;
    type OutData = DepthPreview;

    fn convert(&mut self, input: SlotLease) -> DepthPreview {
        self.forward(&input);
        self.preview(&input)
    }

    fn finalize(&mut self) -> Result<(), ComponentError> {
        Ok(())
    }
}

impl fmt::Display for FramePreparer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FramePreparer")
    }
}

/// The fusion stage: sole owner of the reconstruction volume.
struct FusionProcessor {
    volume: Box<dyn ReconstructionVolume>,
    tracking: TrackingStateMachine,
    feedback: ResidualFeedback,
    orbit: RenderOrbit,
    color: ColorFrame,
    last_frame: u64,
    dropped: Arc<AtomicU64>,
    cancelled: Arc<AtomicU64>,
}

impl FusionProcessor {
    fn process_frame(&mut self, slot: SlotLease) -> SessionSnapshot {
        let resolution = slot.format.depth;
        if self.color.resolution != resolution {
            self.color = ColorFrame::new(resolution);
        }
        self.last_frame = slot.frame_number;

        // Color arrives mapped into depth space; anything else is ignored.
        let color = if slot.color.len() == self.color.pixels.len() {
            self.color.pixels.copy_from_slice(&slot.color);
            Some(&self.color)
        } else {
            None
        };
        let outcome = self
            .tracking
            .process(self.volume.as_mut(), &slot.depth, resolution, color);
        drop(slot);

        let residual = match &outcome.alignment {
            Alignment::Aligned { residual, .. } => {
                self.feedback.on_aligned(&residual.residuals);
                Some(residual_image(residual))
            }
            Alignment::Failed => {
                self.feedback.on_failed();
                None
            }
            Alignment::Skipped => {
                self.feedback.silence();
                None
            }
        };

        self.orbit.advance(self.tracking.state().paused);
        let render_pose = self.orbit.render_pose(&self.tracking.state().world_to_camera);
        let rendered = self
            .tracking
            .render(self.volume.as_ref(), &render_pose)
            .map(|view| view.image);

        self.snapshot(outcome.auto_reset, rendered, residual)
    }

    fn apply(&mut self, command: FusionCommand) -> SessionSnapshot {
        match command {
            FusionCommand::Reset(reset) => {
                debug!("{} : volume reset around {:?}.", self, reset.center);
                self.tracking
                    .reset(self.volume.as_mut(), &Matrix4::identity(), &reset.world_to_volume);
                self.orbit.set_pivot(reset.center);
            }
            FusionCommand::SetPaused(paused) => self.tracking.set_paused(paused),
            FusionCommand::ExportMesh { voxel_step, reply } => {
                if reply.send(self.volume.calculate_mesh(voxel_step)).is_err() {
                    debug!("{} : mesh requester went away.", self);
                }
            }
        }
        self.snapshot(false, None, None)
    }

    fn snapshot(
        &self,
        auto_reset: bool,
        rendered: Option<ColorFrame>,
        residual_image: Option<ColorFrame>,
    ) -> SessionSnapshot {
        let state = self.tracking.state();
        let quality = self.feedback.quality();
        SessionSnapshot {
            frame_number: self.last_frame,
            status: self.tracking.status(),
            is_tracking: self.tracking.status() == TrackingStatus::Tracking,
            consecutive_failures: state.consecutive_failures,
            alignment_quality: quality,
            quality_text: format!("{:.3}", quality),
            audio_state: self.feedback.state(),
            auto_reset,
            rendered,
            residual_image,
            frames_processed: self.tracking.frames_processed(),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
            frames_cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

impl Component for FusionProcessor {
    type InData = FusionInput;
    type OutData = SessionSnapshot;

    fn convert(&mut self, input: FusionInput) -> SessionSnapshot {
        match input {
            FusionInput::Frame(slot) => self.process_frame(slot),
            FusionInput::Control(command) => self.apply(command),
        }
    }

    fn finalize(&mut self) -> Result<(), ComponentError> {
        self.feedback.silence();
        Ok(())
    }
}

impl fmt::Display for FusionProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FusionProcessor")
    }
}

/// Cancellation callback for the fusion stage. Dropping the job returns its
/// slot; only frames are counted.
fn count_cancelled(cancelled: &Arc<AtomicU64>) -> impl Fn(FusionInput) + Send + Sync + 'static {
    let cancelled = Arc::clone(cancelled);
    move |job: FusionInput| {
        if let FusionInput::Frame(_) = job {
            cancelled.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Totals reported when a session shuts down.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    /// Frames handed to `on_frame`
    pub frames_seen: u64,
    /// Frames dropped because a pool was empty
    pub frames_dropped: u64,
    /// Raw stage traffic
    pub raw: StageStats,
    /// Fusion stage traffic
    pub fusion: StageStats,
    /// Audio frames rendered
    pub audio_frames: u64,
    /// The last snapshot produced
    pub last_snapshot: Option<SessionSnapshot>,
}

/// See the module docs.
pub struct ScanSession {
    config: ScanConfig,
    format: SensorFormat,
    recenterer: Recenterer,
    exporter: MeshExporter,
    snapshots: Receiver<SessionSnapshot>,
    previews: Receiver<DepthPreview>,
    latest: Option<SessionSnapshot>,
    feedback: Arc<FeedbackState>,
    frames_seen: u64,
    dropped: Arc<AtomicU64>,
    raw_pool: FramePool,
    fusion_pool: FramePool,
    // Field order is drop order: the raw stage feeds the fusion stage.
    raw_stage: BoundedStage<SlotLease>,
    fusion_stage: Arc<BoundedStage<FusionInput>>,
    audio: Option<AudioOutput>,
}

impl ScanSession {
    /// Create the volume and start the pipeline threads. Fails without
    /// starting anything if the volume cannot be created. Audio goes to
    /// `sink`, or nowhere if it is `None`.
    pub fn start(
        config: ScanConfig,
        format: SensorFormat,
        factory: &dyn VolumeFactory,
        sink: Option<Box<dyn AudioSink>>,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let params = VolumeParameters::from_config(&config.volume);
        let volume = factory.create(&params, ProcessorPreference::Any, None, &Matrix4::identity())?;
        let world_to_volume = volume.default_world_to_volume();
        info!(
            "ScanSession : volume {}x{}x{} at {} voxels/m.",
            params.resolution_x, params.resolution_y, params.resolution_z, params.voxels_per_meter
        );

        let recenterer = Recenterer::new(&config.recenter, &config.volume);
        let feedback = ResidualFeedback::new(config.audio.base_semitone);
        let shared = feedback.shared();
        let pipeline = &config.pipeline;

        let raw_pool = FramePool::new("RawFramePool", pipeline.raw_pool_capacity, format);
        let fusion_pool = FramePool::new("FusionFramePool", pipeline.fusion_pool_capacity, format);
        let dropped = Arc::new(AtomicU64::new(0));
        let cancelled = Arc::new(AtomicU64::new(0));

        let (snapshot_tx, snapshots) = mpsc::sync_channel(pipeline.snapshot_backlog.max(1));
        let fusion_stage = Arc::new(BoundedStage::spawn(
            FusionProcessor {
                volume,
                tracking: TrackingStateMachine::new(&config.tracking, &config.volume, world_to_volume),
                feedback,
                orbit: RenderOrbit::new(config.recenter.orbit_rate, recenterer.default_center()),
                color: ColorFrame::new(format.depth),
                last_frame: 0,
                dropped: Arc::clone(&dropped),
                cancelled: Arc::clone(&cancelled),
            },
            pipeline.fusion_queue_depth,
            snapshot_tx,
            count_cancelled(&cancelled),
        )?);

        let (preview_tx, previews) = mpsc::sync_channel(pipeline.snapshot_backlog.max(1));
        let raw_stage = BoundedStage::spawn(
            FramePreparer {
                fusion_pool: fusion_pool.clone(),
                fusion: Arc::clone(&fusion_stage),
                dropped: Arc::clone(&dropped),
                near_mm: (config.volume.min_depth_clip * 1000.0) as u16,
                far_mm: (config.volume.max_depth_clip * 1000.0) as u16,
            },
            pipeline.raw_queue_depth,
            preview_tx,
            {
                let cancelled = Arc::clone(&cancelled);
                move |_: SlotLease| {
                    cancelled.fetch_add(1, Ordering::Relaxed);
                }
            },
        )?;

        let audio = if config.audio.enabled {
            let synth = Synthesizer::new(Arc::clone(&shared), &config.audio);
            let sink = sink.unwrap_or_else(|| Box::new(NullSink));
            Some(AudioOutput::start(synth, sink, config.audio.buffer_size)?)
        } else {
            None
        };

        info!("ScanSession : started.");
        Ok(Self {
            config,
            format,
            recenterer,
            exporter: MeshExporter::new(),
            snapshots,
            previews,
            latest: None,
            feedback: shared,
            frames_seen: 0,
            dropped,
            raw_pool,
            fusion_pool,
            raw_stage,
            fusion_stage,
            audio,
        })
    }

    /// Hand a new sensor frame to the pipeline. Never waits on fusion work.
    pub fn on_frame(&mut self, frame: &SensorFrame) -> Result<FrameDisposition, SessionError> {
        self.frames_seen += 1;

        if frame.format != self.format {
            self.change_format(frame.format)?;
        }

        if let Some(reset) = self.recenterer.update(&frame.skeletons) {
            self.fusion_stage
                .enqueue_control(FusionInput::Control(FusionCommand::Reset(reset)))?;
        }

        let mut lease = match self.raw_pool.acquire() {
            Ok(lease) => lease,
            Err(PoolError::Exhausted) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(FrameDisposition::Dropped);
            }
            Err(e) => return Err(e.into()),
        };
        lease.fill_from(frame)?;

        Ok(match self.raw_stage.enqueue(lease)? {
            Admission::Admitted => FrameDisposition::Queued,
            Admission::EvictedOldest => FrameDisposition::ReplacedOldest,
        })
    }

    /// Resize every slot for a new sensor format. Both stages are flushed
    /// first so no job still references the old buffers, and the volume is
    /// reset on the next frame.
    fn change_format(&mut self, format: SensorFormat) -> Result<(), SessionError> {
        info!(
            "ScanSession : format change {:?} -> {:?}.",
            self.format.depth, format.depth
        );
        self.raw_stage.flush();
        self.fusion_stage.flush();
        self.raw_pool.set_format(format)?;
        self.fusion_pool.set_format(format)?;
        self.format = format;
        self.recenterer.request_reset();
        Ok(())
    }

    /// Reset the volume around the subject. Takes effect with the next
    /// frame, so the center comes from fresh joint positions.
    pub fn request_reset(&mut self) {
        self.recenterer.request_reset();
    }

    /// Suspend or resume integration.
    pub fn set_paused(&self, paused: bool) -> Result<(), SessionError> {
        self.fusion_stage
            .enqueue_control(FusionInput::Control(FusionCommand::SetPaused(paused)))?;
        Ok(())
    }

    /// Extract the current surface and write it to `path`. Only one export
    /// runs at a time; the live pipeline keeps running either way.
    pub fn export_mesh(
        &self,
        path: impl AsRef<Path>,
        options: &MeshExportOptions,
    ) -> Result<MeshSummary, ExportError> {
        let voxel_step = self.config.volume.mesh_voxel_step;
        self.exporter.export(path, options, || {
            let (reply, mesh) = mpsc::channel();
            self.fusion_stage
                .enqueue_control(FusionInput::Control(FusionCommand::ExportMesh { voxel_step, reply }))
                .map_err(|_| ExportError::Cancelled)?;

            match mesh.recv_timeout(EXPORT_TIMEOUT) {
                Ok(mesh) => Ok(mesh?),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    Err(ExportError::Cancelled)
                }
            }
        })
    }

    /// Every snapshot produced since the last call.
    pub fn poll_snapshots(&mut self) -> Vec<SessionSnapshot> {
        let snapshots: Vec<SessionSnapshot> = self.snapshots.try_iter().collect();
        if let Some(last) = snapshots.last() {
            self.latest = Some(last.clone());
        }
        snapshots
    }

    /// Wait up to `timeout` for the next snapshot.
    pub fn next_snapshot(&mut self, timeout: Duration) -> Option<SessionSnapshot> {
        let snapshot = self.snapshots.recv_timeout(timeout).ok()?;
        self.latest = Some(snapshot.clone());
        Some(snapshot)
    }

    /// The most recent snapshot seen.
    pub fn latest_snapshot(&mut self) -> Option<&SessionSnapshot> {
        self.poll_snapshots();
        self.latest.as_ref()
    }

    /// Every depth preview produced since the last call.
    pub fn poll_previews(&mut self) -> Vec<DepthPreview> {
        self.previews.try_iter().collect()
    }

    /// The feedback atomics the audio thread reads.
    pub fn feedback_state(&self) -> Arc<FeedbackState> {
        Arc::clone(&self.feedback)
    }

    /// The sensor format the pools are sized for.
    pub fn format(&self) -> SensorFormat {
        self.format
    }

    /// Frames dropped so far because a pool was empty.
    pub fn frames_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Default on-axis volume center.
    pub fn default_center(&self) -> Point3<f32> {
        self.recenterer.default_center()
    }

    /// Stop taking frames, drain and join both stages, stop the audio and
    /// check that every slot came home.
    pub fn shutdown(mut self) -> Result<SessionSummary, SessionError> {
        self.raw_stage.dispose();
        self.fusion_stage.dispose();

        let audio_frames = match self.audio.take() {
            Some(audio) => audio.stop()?,
            None => 0,
        };

        self.poll_snapshots();
        for pool in [&self.raw_pool, &self.fusion_pool] {
            if pool.outstanding() != 0 {
                warn!("ScanSession : {} slots still leased at shutdown.", pool.outstanding());
            }
        }

        let summary = SessionSummary {
            frames_seen: self.frames_seen,
            frames_dropped: self.frames_dropped(),
            raw: self.raw_stage.stats(),
            fusion: self.fusion_stage.stats(),
            audio_frames,
            last_snapshot: self.latest.take(),
        };
        info!(
            "ScanSession : terminated after {} frames ({} dropped).",
            summary.frames_seen, summary.frames_dropped
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated_sensor::SimulatedSensor;
    use crate::volume::DepthMapVolumeFactory;

    const WAIT: Duration = Duration::from_secs(5);

    fn small() -> SensorFormat {
        SensorFormat {
            depth: Resolution::new(64, 48),
            color: Resolution::new(64, 48),
            skeleton_count: 1,
        }
    }

    fn quiet_config() -> ScanConfig {
        let mut config = ScanConfig::default();
        config.audio.enabled = false;
        config.tracking.render_interval = 1;
        config
    }

    /// Feed frames one at a time, waiting for each to come out of fusion.
    fn run(session: &mut ScanSession, frames: impl Iterator<Item = SensorFrame>) -> Vec<SessionSnapshot> {
        let mut seen = Vec::new();
        for frame in frames {
            let target = session.latest.as_ref().map_or(0, |s| s.frames_processed) + 1;
            assert_eq!(session.on_frame(&frame).unwrap(), FrameDisposition::Queued);
            loop {
                let snapshot = session.next_snapshot(WAIT).expect("fusion stage stalled");
                let done = snapshot.frames_processed >= target;
                seen.push(snapshot);
                if done {
                    break;
                }
            }
        }
        seen
    }

    struct NoDevice;

    impl VolumeFactory for NoDevice {
        fn create(
            &self,
            _params: &VolumeParameters,
            _processor: ProcessorPreference,
            _device_index: Option<usize>,
            _initial_pose: &Matrix4<f32>,
        ) -> Result<Box<dyn ReconstructionVolume>, VolumeError> {
            Err(VolumeError::NoCompatibleDevice)
        }
    }

    #[test]
    fn missing_device_is_fatal() {
        let res = ScanSession::start(quiet_config(), small(), &NoDevice, None);
        assert!(matches!(
            res,
            Err(SessionError::Volume(VolumeError::NoCompatibleDevice))
        ));
    }

    #[test]
    fn invalid_config_is_fatal() {
        let mut config = quiet_config();
        config.pipeline.fusion_queue_depth = 0;
        let res = ScanSession::start(config, small(), &DepthMapVolumeFactory::default(), None);
        assert!(matches!(res, Err(SessionError::Config(_))));
    }

    #[test]
    fn tracks_a_steady_scan() {
        let mut session =
            ScanSession::start(quiet_config(), small(), &DepthMapVolumeFactory::default(), None)
                .unwrap();
        let sensor = SimulatedSensor::builder().set_format(small()).set_frames(30).build();

        let snapshots = run(&mut session, sensor);
        let last = snapshots.last().unwrap();
        assert!(last.is_tracking);
        assert_eq!(last.consecutive_failures, 0);
        assert_eq!(last.frame_number, 29);
        assert_eq!(last.frames_dropped, 0);
        assert_eq!(last.frames_cancelled, 0);
        assert!(last.rendered.is_some());
        assert!(last.residual_image.is_some());
        assert!(last.alignment_quality.is_finite());
        assert_eq!(last.quality_text, format!("{:.3}", last.alignment_quality));
        assert!(matches!(
            last.audio_state,
            AudioState::Chord | AudioState::SlidingNote
        ));
        assert!(!session.poll_previews().is_empty());

        let summary = session.shutdown().unwrap();
        assert_eq!(summary.frames_seen, 30);
        assert_eq!(summary.frames_dropped, 0);
        assert_eq!(summary.fusion.processed + summary.fusion.cancelled, summary.fusion.enqueued + 1);
    }

    #[test]
    fn sustained_loss_resets_the_volume() {
        let mut config = quiet_config();
        config.tracking.auto_reset = true;
        config.tracking.failure_threshold = 3;
        let mut session =
            ScanSession::start(config, small(), &DepthMapVolumeFactory::default(), None).unwrap();
        let sensor = SimulatedSensor::builder()
            .set_format(small())
            .set_glitches(20, 6)
            .set_frames(40)
            .build();

        let snapshots = run(&mut session, sensor);
        assert!(snapshots.iter().any(|s| s.audio_state == AudioState::Error));
        assert!(snapshots.iter().any(|s| s.status == TrackingStatus::Lost));
        assert!(snapshots.iter().any(|s| s.auto_reset));
        assert!(snapshots.iter().all(|s| s.consecutive_failures < 3));
        assert!(snapshots.last().unwrap().is_tracking);

        session.shutdown().unwrap();
    }

    #[test]
    fn paused_frames_still_render() {
        let mut session =
            ScanSession::start(quiet_config(), small(), &DepthMapVolumeFactory::default(), None)
                .unwrap();
        let mut sensor = SimulatedSensor::builder().set_format(small()).build();

        run(&mut session, sensor.by_ref().take(5));
        session.set_paused(true).unwrap();
        let snapshots = run(&mut session, sensor.by_ref().take(3));
        let last = snapshots.last().unwrap();
        assert_eq!(last.status, TrackingStatus::Paused);
        assert_eq!(last.audio_state, AudioState::None);
        assert!(last.rendered.is_some());
        assert!(last.residual_image.is_none());

        session.set_paused(false).unwrap();
        let snapshots = run(&mut session, sensor.by_ref().take(3));
        assert!(snapshots.last().unwrap().is_tracking);

        session.shutdown().unwrap();
    }

    #[test]
    fn format_change_reallocates_and_continues() {
        let mut session =
            ScanSession::start(quiet_config(), small(), &DepthMapVolumeFactory::default(), None)
                .unwrap();
        let half = SensorFormat {
            depth: Resolution::new(32, 24),
            color: Resolution::new(32, 24),
            skeleton_count: 1,
        };

        run(&mut session, SimulatedSensor::builder().set_format(small()).set_frames(5).build());
        let snapshots = run(
            &mut session,
            SimulatedSensor::builder().set_format(half).set_frames(5).build(),
        );

        assert_eq!(session.format(), half);
        let last = snapshots.last().unwrap();
        assert!(last.is_tracking);
        assert_eq!(last.rendered.as_ref().unwrap().resolution, half.depth);

        let summary = session.shutdown().unwrap();
        assert_eq!(summary.frames_seen, 10);
    }

    #[test]
    fn exports_the_scanned_surface() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("head.ply");
        let mut session =
            ScanSession::start(quiet_config(), small(), &DepthMapVolumeFactory::default(), None)
                .unwrap();
        run(&mut session, SimulatedSensor::builder().set_format(small()).set_frames(10).build());

        let summary = session
            .export_mesh(&path, &MeshExportOptions::default())
            .unwrap();
        assert!(summary.triangles > 0);
        assert!(summary.colored);
        assert!(path.exists());

        session.shutdown().unwrap();
    }

    #[test]
    fn audio_runs_with_the_session() {
        let mut config = quiet_config();
        config.audio.enabled = true;
        config.audio.sample_rate = 8000;
        config.audio.buffer_size = 64;
        let mut session =
            ScanSession::start(config, small(), &DepthMapVolumeFactory::default(), None).unwrap();
        run(&mut session, SimulatedSensor::builder().set_format(small()).set_frames(5).build());
        std::thread::sleep(Duration::from_millis(30));

        let summary = session.shutdown().unwrap();
        assert!(summary.audio_frames > 0);
    }
}
