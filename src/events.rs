//! Outbound pipeline event types
//!
//! The pipeline reports its health through a state queue that carries
//! these events. Delivery is a bounded mpsc channel: a slow consumer
//! backpressures the producer instead of dropping events.

use serde::Serialize;

/// Snapshot of the pipeline's readiness and throughput
///
/// Written by the subprocess supervisor and the stdout worker,
/// republished on the state queue after every accumulation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineState {
    /// True once the encoder process is up and bytes are flowing
    pub ready: bool,
    /// Last fatal error message, if any
    pub error: Option<String>,
    /// Configured target frame rate
    pub fps: f64,
}

/// Which worker task an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// Drains encoder stdout into the framer
    Stdout,
    /// Drains encoder stderr into the log
    Stderr,
}

/// Why a worker task stopped
///
/// Every termination is reported explicitly so external monitoring can
/// tell a clean stop from an unexpected stream death.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerExitReason {
    /// Stream reached end-of-file (encoder exited)
    StreamEnded,
    /// Run was cancelled by stop() or a restart
    Cancelled,
    /// Non-terminal read error; the run itself is left alone
    ReadError(String),
    /// Unexpected fault inside the worker, confined to its task
    Fault(String),
}

/// Event published on the state queue
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// Periodic state snapshot
    State(PipelineState),
    /// A worker task terminated
    WorkerExit {
        worker: WorkerKind,
        reason: WorkerExitReason,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serializes() {
        let state = PipelineState {
            ready: true,
            error: None,
            fps: 30.0,
        };
        let json = serde_json::to_string(&PipelineEvent::State(state)).unwrap();
        assert!(json.contains("\"ready\":true"));
        assert!(json.contains("\"type\":\"state\""));
    }

    #[test]
    fn test_worker_exit_serializes() {
        let event = PipelineEvent::WorkerExit {
            worker: WorkerKind::Stdout,
            reason: WorkerExitReason::StreamEnded,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"worker\":\"stdout\""));
    }
}
