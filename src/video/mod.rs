//! Video capture-and-encode pipeline
//!
//! This module supervises an external encoder process, selects a
//! hardware acceleration backend at runtime, and re-frames the raw
//! H.264 elementary stream into discrete access units.

pub mod backend;
pub mod framer;
pub mod pipeline;
pub mod supervisor;

pub use backend::{build_encoder_args, select_backend, DeviceProbe, EncoderBackend, FsProbe};
pub use framer::H264Framer;
pub use pipeline::VideoPipeline;
pub use supervisor::{RunContext, RunHandle};
