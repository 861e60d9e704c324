//! kvm-video - IP-KVM video pipeline
//!
//! This crate provides the video capture-and-encode pipeline of a
//! lightweight IP-KVM appliance: it supervises an external encoder
//! process, picks a hardware acceleration backend by probing device
//! nodes, splits the raw H.264 bytestream into frames, and supports
//! live bitrate reconfiguration through a coordinated restart.

pub mod config;
pub mod error;
pub mod events;
pub mod video;

pub use config::{HwAccelMode, PipelineConfig};
pub use error::{Result, VideoError};
pub use events::{PipelineEvent, PipelineState, WorkerExitReason, WorkerKind};
pub use video::VideoPipeline;
