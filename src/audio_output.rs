//! Drives a [Synthesizer] from a dedicated audio thread.
//!
//! The thread stands in for an output device callback: every buffer period
//! it asks the synthesizer for one buffer and hands it to an [AudioSink].
//! The loop is paced against a deadline with [spin_sleep] so buffers come
//! out at the sample rate, and it only ever reads atomics and its own
//! state, never a lock.

use crate::component::ComponentError;
use crate::synth::Synthesizer;
use hound::{SampleFormat, WavSpec, WavWriter};
use log::{info, warn};
use std::{
    fs::File,
    io::BufWriter,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

/// Where rendered audio ends up.
pub trait AudioSink: Send {
    /// Accept one buffer of mono samples.
    fn write(&mut self, samples: &[f32]) -> Result<(), ComponentError>;

    /// Flush and close the sink.
    fn finish(&mut self) -> Result<(), ComponentError>;
}

/// Discards everything, for running the synthesizer without an output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn write(&mut self, _samples: &[f32]) -> Result<(), ComponentError> {
        Ok(())
    }

    fn finish(&mut self) -> Result<(), ComponentError> {
        Ok(())
    }
}

/// Records the feedback audio to a mono 32-bit float WAV file.
pub struct WavRecorder {
    writer: Option<WavWriter<BufWriter<File>>>,
}

impl WavRecorder {
    /// Create (or truncate) a WAV file at `path`.
    pub fn create(path: impl AsRef<Path>, sample_rate: u32) -> Result<Self, ComponentError> {
        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let writer = WavWriter::create(path, spec)?;

        Ok(Self {
            writer: Some(writer),
        })
    }
}

impl AudioSink for WavRecorder {
    fn write(&mut self, samples: &[f32]) -> Result<(), ComponentError> {
        if let Some(writer) = self.writer.as_mut() {
            for &sample in samples {
                writer.write_sample(sample)?;
            }
        }
        Ok(())
    }

    /// Finalizing writes the WAV header lengths. Dropping the writer does
    /// the same, but this way the error is reported.
    fn finish(&mut self) -> Result<(), ComponentError> {
        match self.writer.take() {
            Some(writer) => Ok(writer.finalize()?),
            None => Ok(()),
        }
    }
}

/// A running audio thread.
pub struct AudioOutput {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<Result<u64, ComponentError>>>,
}

impl AudioOutput {
    /// Start rendering `synth` into `sink`, `buffer_size` frames at a time.
    pub fn start(
        mut synth: Synthesizer,
        mut sink: Box<dyn AudioSink>,
        buffer_size: usize,
    ) -> Result<Self, ComponentError> {
        let stop = Arc::new(AtomicBool::new(false));
        let th_stop = Arc::clone(&stop);
        let buffer_size = buffer_size.max(1);
        let period = Duration::from_secs_f64(buffer_size as f64 / synth.sample_rate().max(1) as f64);

        let handle = thread::Builder::new()
            .name("AudioOutput".to_string())
            .spawn(move || {
                let mut buffer = vec![0.0f32; buffer_size];
                let mut frames = 0u64;
                let mut deadline = Instant::now();

                while !th_stop.load(Ordering::Relaxed) {
                    synth.render(&mut buffer);
                    if let Err(e) = sink.write(&buffer) {
                        warn!("AudioOutput : sink failed, stopping: {}", e);
                        let _ = sink.finish();
                        return Err(e);
                    }
                    frames += buffer_size as u64;

                    deadline += period;
                    let now = Instant::now();
                    if deadline > now {
                        spin_sleep::sleep(deadline - now);
                    } else {
                        // Fell behind, don't try to catch up with a burst.
                        deadline = now;
                    }
                }

                sink.finish()?;
                info!("AudioOutput : terminated.");
                Ok(frames)
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the thread, close the sink and return how many frames were
    /// rendered.
    pub fn stop(mut self) -> Result<u64, ComponentError> {
        self.stop.store(true, Ordering::Relaxed);
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                Err(ComponentError::IoError(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "audio thread panicked",
                )))
            }),
            None => Ok(0),
        }
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
