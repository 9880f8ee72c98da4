mod gui;

use std::error::Error;

use gui::engage_gui;
use headscan::{
    config::ScanConfig,
    sensor::{Resolution, SensorFormat},
    session::ScanSession,
    simulated_sensor::SimulatedSensor,
    volume::DepthMapVolumeFactory,
};

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let mut config = ScanConfig::default();
    config.tracking.auto_reset = true;
    config.tracking.failure_threshold = 10;
    config.audio.enabled = false;

    let resolution = Resolution::new(160, 120);
    let format = SensorFormat {
        depth: resolution,
        color: resolution,
        skeleton_count: 1,
    };
    let sensor = SimulatedSensor::builder()
        .set_format(format)
        .set_glitches(150, 8)
        .switch_subject_at(400)
        .build();

    let session = ScanSession::start(config, format, &DepthMapVolumeFactory::default(), None)?;
    let session = engage_gui(session, sensor)?;
    let summary = session.shutdown()?;

    println!(
        "Scanned {} frames, {} dropped",
        summary.frames_seen, summary.frames_dropped
    );
    Ok(())
}
