//! Runs a head scan against the simulated sensor, optionally recording the
//! feedback audio and exporting the finished mesh.

use clap::Parser;
use headscan::{
    args::{
        CommandTask::{Config, Scan},
        HeadScanArgs, ScanCommand,
    },
    audio_output::{AudioSink, WavRecorder},
    config::{ConfigError, ScanConfig},
    gui::fold_until_stop,
    mesh_export::MeshExportOptions,
    sensor::{Resolution, SensorFormat},
    session::{FrameDisposition, ScanSession, SessionSnapshot},
    simulated_sensor::SimulatedSensor,
    volume::DepthMapVolumeFactory,
};
use log::{debug, error, info, warn};
use std::{
    error::Error,
    fs,
    ops::ControlFlow,
    process::ExitCode,
    time::{Duration, Instant},
};

// Example:
// cargo run --bin headscan --
//                          scan
//                          --frames      300
//                          --auto-reset
//                          --wav         feedback.wav
//                          --out         head.ply

fn main() -> ExitCode {
    env_logger::init();
    let args = HeadScanArgs::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("headscan: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&str>) -> Result<ScanConfig, ConfigError> {
    match path {
        Some(path) => ScanConfig::from_path(path),
        None => Ok(ScanConfig::default()),
    }
}

fn run(args: HeadScanArgs) -> Result<(), Box<dyn Error>> {
    let config = load_config(args.config.as_deref())?;

    match args.command {
        Config(cmd) => {
            let text = config.to_ron()?;
            match cmd.outfile {
                Some(path) => fs::write(path, text)?,
                None => println!("{}", text),
            }
            Ok(())
        }
        Scan(cmd) => scan(config, cmd),
    }
}

/// Everything the scan loop carries from one frame to the next.
struct ScanLoop {
    session: ScanSession,
    sensor: SimulatedSensor,
    period: Duration,
    deadline: Instant,
    latest: Option<SessionSnapshot>,
    auto_resets: u64,
}

impl ScanLoop {
    /// Feed one sensor frame, then wait for the next frame time.
    fn step(mut self) -> ControlFlow<Self, Self> {
        let Some(frame) = self.sensor.next() else {
            return ControlFlow::Break(self);
        };

        match self.session.on_frame(&frame) {
            Ok(FrameDisposition::Queued) => {}
            Ok(disposition) => debug!("Frame {} : {:?}.", frame.frame_number, disposition),
            Err(e) => {
                error!("Frame {} : {}", frame.frame_number, e);
                return ControlFlow::Break(self);
            }
        }

        for snapshot in self.session.poll_snapshots() {
            if snapshot.auto_reset {
                warn!("Frame {} : tracking lost, volume reset.", snapshot.frame_number);
                self.auto_resets += 1;
            }
            self.latest = Some(snapshot);
        }

        if frame.frame_number % 30 == 0 {
            if let Some(snapshot) = &self.latest {
                info!(
                    "Frame {} : {:?}, quality {}, audio {:?}.",
                    snapshot.frame_number,
                    snapshot.status,
                    snapshot.quality_text,
                    snapshot.audio_state
                );
            }
        }

        self.deadline += self.period;
        let now = Instant::now();
        if self.deadline > now {
            spin_sleep::sleep(self.deadline - now);
        } else {
            self.deadline = now;
        }

        ControlFlow::Continue(self)
    }

    fn status_lines(&self) -> Vec<String> {
        let Some(snapshot) = &self.latest else {
            return vec![" Waiting for the first frame... ".to_string()];
        };

        vec![
            format!(" Frame {:>6}   {:?}", snapshot.frame_number, snapshot.status),
            format!(
                " Alignment quality {}   failures in a row {}",
                snapshot.quality_text, snapshot.consecutive_failures
            ),
            format!(" Audio cue {:?}", snapshot.audio_state),
            format!(
                " Automatic resets {}   dropped frames {}",
                self.auto_resets,
                self.session.frames_dropped()
            ),
        ]
    }
}

fn scan(mut config: ScanConfig, cmd: ScanCommand) -> Result<(), Box<dyn Error>> {
    if cmd.auto_reset {
        config.tracking.auto_reset = true;
    }

    let resolution = Resolution::new(cmd.width, cmd.height);
    let format = SensorFormat {
        depth: resolution,
        color: resolution,
        skeleton_count: 1,
    };
    let mut builder = SimulatedSensor::builder()
        .set_format(format)
        .set_frames(cmd.frames)
        .set_seed(cmd.seed);
    if let Some(every) = cmd.glitch_every {
        builder = builder.set_glitches(every, cmd.glitch_len);
    }

    let sink: Option<Box<dyn AudioSink>> = match &cmd.wav_out {
        Some(path) if config.audio.enabled => {
            Some(Box::new(WavRecorder::create(path, config.audio.sample_rate)?))
        }
        Some(_) => {
            warn!("Audio is disabled in the config, not recording.");
            None
        }
        None => None,
    };

    let session = ScanSession::start(config, format, &DepthMapVolumeFactory::default(), sink)?;
    let scan = ScanLoop {
        session,
        sensor: builder.build(),
        period: Duration::from_secs_f32(1.0 / cmd.fps.max(1.0)),
        deadline: Instant::now(),
        latest: None,
        auto_resets: 0,
    };

    let scan = if cmd.tui {
        fold_until_stop("Scanning...", scan, ScanLoop::step, ScanLoop::status_lines)?
    } else {
        let mut scan = scan;
        loop {
            match scan.step() {
                ControlFlow::Continue(next) => scan = next,
                ControlFlow::Break(done) => break done,
            }
        }
    };

    if let Some(path) = &cmd.mesh_out {
        let options = MeshExportOptions {
            flip_axes: !cmd.no_flip,
            ..MeshExportOptions::default()
        };
        let mesh = scan.session.export_mesh(path, &options)?;
        println!(
            "Wrote {} triangles ({} vertices) to {}",
            mesh.triangles,
            mesh.vertices,
            mesh.path.display()
        );
    }

    let summary = scan.session.shutdown()?;
    println!(
        "Scanned {} frames, {} dropped, {} automatic resets",
        summary.frames_seen, summary.frames_dropped, scan.auto_resets
    );
    if let Some(last) = summary.last_snapshot {
        println!(
            "Final status {:?}, alignment quality {}",
            last.status, last.quality_text
        );
    }
    if let Some(path) = &cmd.wav_out {
        if summary.audio_frames > 0 {
            println!("Recorded {} audio frames to {}", summary.audio_frames, path);
        }
    }

    Ok(())
}
