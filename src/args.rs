//! Commandline argument parser using clap for HeadScan

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
/// Capture a head scan from a depth sensor
pub struct HeadScanArgs {
    #[command(subcommand, long_about)]
    /// Which task to perform, scanning or writing a config file
    pub command: CommandTask,

    /// RON file with scan settings; defaults are used for anything it leaves out
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<String>,
}

/// The tasks the headscan binary can perform.
#[derive(Debug, Subcommand, Clone)]
pub enum CommandTask {
    /// Run a scan against the simulated sensor
    #[command(about)]
    Scan(ScanCommand),

    /// Print the effective configuration as RON
    #[command(about)]
    Config(ConfigCommand),
}

/// Arguments for a scan.
#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct ScanCommand {
    /// Number of sensor frames to capture
    #[arg(short = 'n', long = "frames", default_value_t = 300)]
    pub frames: u64,

    /// Sensor frame rate, in frames per second
    #[arg(long = "fps", default_value_t = 30.0)]
    pub fps: f32,

    /// Depth image width in pixels
    #[arg(long = "width", default_value_t = 640)]
    pub width: usize,

    /// Depth image height in pixels
    #[arg(long = "height", default_value_t = 480)]
    pub height: usize,

    /// Seed for the simulated sensor noise
    #[arg(long = "seed", default_value_t = 0)]
    pub seed: u64,

    /// Make the simulated camera jump away every N frames
    #[arg(long = "glitch-every")]
    pub glitch_every: Option<u64>,

    /// How many frames each glitch lasts
    #[arg(long = "glitch-len", default_value_t = 5)]
    pub glitch_len: u64,

    /// Reset the volume after sustained tracking loss
    #[arg(short = 'a', long = "auto-reset")]
    pub auto_reset: bool,

    /// Filename for the feedback audio to be recorded to, as WAV
    #[arg(short = 'w', long = "wav")]
    pub wav_out: Option<String>,

    /// Filename for the finished mesh to be written to, as PLY
    #[arg(short = 'o', long = "out")]
    pub mesh_out: Option<String>,

    /// Keep the camera convention (y down, z forward) in the mesh file
    #[arg(long = "no-flip")]
    pub no_flip: bool,

    /// Show a live status screen until a key is pressed
    #[arg(long = "tui")]
    pub tui: bool,
}

/// Arguments for printing the configuration.
#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct ConfigCommand {
    /// Write the config to this file instead of stdout
    #[arg(short = 'o', long = "out")]
    pub outfile: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_defaults() {
        let args = HeadScanArgs::parse_from(["headscan", "scan"]);
        let CommandTask::Scan(scan) = args.command else {
            panic!("expected scan");
        };
        assert_eq!(scan.frames, 300);
        assert_eq!((scan.width, scan.height), (640, 480));
        assert!(!scan.auto_reset);
        assert!(scan.mesh_out.is_none());
        assert!(args.config.is_none());
    }

    #[test]
    fn scan_with_outputs() {
        let args = HeadScanArgs::parse_from([
            "headscan", "scan", "-n", "90", "--auto-reset", "--wav", "fb.wav", "-o", "head.ply",
            "--glitch-every", "40", "-c", "scan.ron",
        ]);
        let CommandTask::Scan(scan) = args.command else {
            panic!("expected scan");
        };
        assert_eq!(scan.frames, 90);
        assert!(scan.auto_reset);
        assert_eq!(scan.wav_out.as_deref(), Some("fb.wav"));
        assert_eq!(scan.mesh_out.as_deref(), Some("head.ply"));
        assert_eq!(scan.glitch_every, Some(40));
        assert_eq!(args.config.as_deref(), Some("scan.ron"));
    }
}
