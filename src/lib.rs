//! HeadScan captures a 3D scan of a person's head with a depth sensor.
//!
//! Depth, color and skeleton frames stream from the sensor into a two-stage
//! pipeline. The first stage prepares each frame for display; the second
//! tracks the camera against a reconstruction volume and fuses the frame
//! into it. The volume follows the subject's head, so it is reset around
//! the head whenever a new person steps in front of the sensor. While the
//! scan runs, a small synthesizer turns alignment quality into sound, so
//! the operator can hear how well tracking is going without looking at the
//! screen. When the scan is done, the surface can be exported as a mesh.
//!
//! Start with [session::ScanSession], which owns the whole pipeline.

#![warn(missing_docs)]
pub mod args;
pub mod audio_output;
pub mod component;
pub mod config;
pub mod feedback;
pub mod frame_pool;
pub mod gui;
pub mod mesh_export;
pub mod pipeline_stage;
pub mod recenter;
pub mod sensor;
pub mod session;
pub mod simulated_sensor;
pub mod synth;
pub mod tracking;
pub mod volume;
