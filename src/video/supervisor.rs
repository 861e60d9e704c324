//! Encoder subprocess supervisor
//!
//! Owns the lifecycle of one external encoder process: spawn with piped
//! stdio, two reader workers (stderr into the log, stdout through the
//! framer into the frame queue), cancellation and teardown. At most one
//! run exists at a time; the pipeline control lock guarantees that.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, VideoError};
use crate::events::{PipelineEvent, PipelineState, WorkerExitReason, WorkerKind};
use crate::video::framer::H264Framer;

/// Read buffer size for the stdout worker
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Collaborators handed to the workers of one run
#[derive(Clone)]
pub struct RunContext {
    /// Outbound frame queue; a full queue backpressures the framing loop
    pub frame_tx: mpsc::Sender<Bytes>,
    /// Outbound state queue
    pub event_tx: mpsc::Sender<PipelineEvent>,
    /// Shared state snapshot, also read by the quality controller
    pub state: Arc<RwLock<PipelineState>>,
    /// Target frame rate, used to pace the framing loop
    pub fps: u32,
}

/// Live resources of one running encoder process
///
/// Dropping the handle kills the child (`kill_on_drop`), but the normal
/// path is an explicit [`RunHandle::shutdown`].
#[derive(Debug)]
pub struct RunHandle {
    child: Child,
    cancel: CancellationToken,
    stdout_monitor: JoinHandle<()>,
    stderr_monitor: Option<JoinHandle<()>>,
}

impl RunHandle {
    /// Spawn the encoder process and start both reader workers
    ///
    /// Fails with `EncoderLaunchFailed` if the process cannot be spawned
    /// or its stdout pipe cannot be opened. No retry is attempted; the
    /// caller may start again later.
    pub fn launch(program: &str, args: &[String], ctx: RunContext) -> Result<Self> {
        info!("Launching encoder: {} {}", program, args.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VideoError::EncoderLaunchFailed(format!("spawn {}: {}", program, e)))?;

        let stdout = child.stdout.take().ok_or_else(|| {
            VideoError::EncoderLaunchFailed("no stdout pipe on encoder process".to_string())
        })?;

        let cancel = CancellationToken::new();

        // Stderr drain is best-effort and must never fail the pipeline
        let stderr_monitor = child.stderr.take().map(|stderr| {
            let worker = tokio::spawn(drain_stderr(stderr, cancel.clone()));
            spawn_exit_monitor(worker, WorkerKind::Stderr, ctx.event_tx.clone())
        });

        let worker = tokio::spawn(drain_stdout(stdout, ctx.clone(), cancel.clone()));
        let stdout_monitor = spawn_exit_monitor(worker, WorkerKind::Stdout, ctx.event_tx.clone());

        info!("Encoder started with PID {:?}", child.id());
        Ok(Self {
            child,
            cancel,
            stdout_monitor,
            stderr_monitor,
        })
    }

    /// Cancel the run, terminate the process and reap both workers
    pub async fn shutdown(mut self) {
        self.cancel.cancel();

        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill encoder process: {}", e);
        }
        match self.child.wait().await {
            Ok(status) => debug!("Encoder process exited: {}", status),
            Err(e) => warn!("Failed to reap encoder process: {}", e),
        }

        // Workers observe the cancellation or the closed pipes and exit
        let _ = self.stdout_monitor.await;
        if let Some(monitor) = self.stderr_monitor {
            let _ = monitor.await;
        }
    }
}

/// Await a worker and publish a typed exit event for it
///
/// Worker deaths never tear down the run on their own; they surface as
/// events so monitoring can tell a clean stop from a stream death. A
/// panic inside a worker is confined to its task and reported as a
/// fault.
fn spawn_exit_monitor(
    worker: JoinHandle<WorkerExitReason>,
    kind: WorkerKind,
    event_tx: mpsc::Sender<PipelineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reason = match worker.await {
            Ok(reason) => reason,
            Err(e) if e.is_panic() => {
                error!("{:?} worker panicked", kind);
                WorkerExitReason::Fault("worker panicked".to_string())
            }
            Err(_) => WorkerExitReason::Cancelled,
        };

        match &reason {
            WorkerExitReason::StreamEnded | WorkerExitReason::Cancelled => {
                debug!("{:?} worker exited: {:?}", kind, reason)
            }
            WorkerExitReason::ReadError(e) => warn!("{:?} worker read error: {}", kind, e),
            WorkerExitReason::Fault(e) => error!("{:?} worker fault: {}", kind, e),
        }

        let _ = event_tx
            .send(PipelineEvent::WorkerExit {
                worker: kind,
                reason,
            })
            .await;
    })
}

/// Drain encoder stderr, republishing each line into the log
async fn drain_stderr(
    stderr: tokio::process::ChildStderr,
    cancel: CancellationToken,
) -> WorkerExitReason {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return WorkerExitReason::Cancelled,
            line = lines.next_line() => match line {
                Ok(Some(line)) => debug!("[encoder] {}", line),
                Ok(None) => return WorkerExitReason::StreamEnded,
                Err(e) => return WorkerExitReason::ReadError(e.to_string()),
            },
        }
    }
}

/// Drain encoder stdout through the framer into the outbound queues
///
/// After each accumulation pass the current state is republished and the
/// loop sleeps one frame interval to avoid spinning on tiny reads.
/// Delivery blocks when the consumer is slow; stalling beats dropping
/// frames or growing memory without bound.
async fn drain_stdout(
    mut stdout: ChildStdout,
    ctx: RunContext,
    cancel: CancellationToken,
) -> WorkerExitReason {
    let mut framer = H264Framer::new();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    let frame_interval = Duration::from_secs(1) / ctx.fps.max(1);

    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return WorkerExitReason::Cancelled,
            read = stdout.read(&mut buf) => match read {
                Ok(0) => {
                    // Deliver the dangling tail so the last access unit
                    // is not lost with the process
                    if let Some(tail) = framer.flush() {
                        let _ = deliver(&ctx.frame_tx, tail, &cancel).await;
                    }
                    return WorkerExitReason::StreamEnded;
                }
                Ok(n) => n,
                Err(e) => return WorkerExitReason::ReadError(e.to_string()),
            },
        };

        for frame in framer.push(&buf[..n]) {
            match deliver(&ctx.frame_tx, frame, &cancel).await {
                Delivery::Sent => {}
                Delivery::Cancelled => return WorkerExitReason::Cancelled,
                Delivery::Closed => {
                    return WorkerExitReason::Fault("frame queue closed".to_string())
                }
            }
        }

        let snapshot = {
            let mut state = ctx.state.write();
            state.ready = true;
            state.error = None;
            state.fps = ctx.fps as f64;
            state.clone()
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return WorkerExitReason::Cancelled,
            _ = ctx.event_tx.send(PipelineEvent::State(snapshot)) => {}
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return WorkerExitReason::Cancelled,
            _ = tokio::time::sleep(frame_interval) => {}
        }
    }
}

enum Delivery {
    Sent,
    Cancelled,
    Closed,
}

/// Send one frame, staying responsive to cancellation while blocked
async fn deliver(
    frame_tx: &mpsc::Sender<Bytes>,
    frame: Bytes,
    cancel: &CancellationToken,
) -> Delivery {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Delivery::Cancelled,
        sent = frame_tx.send(frame) => match sent {
            Ok(()) => Delivery::Sent,
            Err(_) => Delivery::Closed,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PipelineState;

    fn test_context(
        frame_cap: usize,
    ) -> (
        RunContext,
        mpsc::Receiver<Bytes>,
        mpsc::Receiver<PipelineEvent>,
    ) {
        let (frame_tx, frame_rx) = mpsc::channel(frame_cap);
        let (event_tx, event_rx) = mpsc::channel(64);
        let ctx = RunContext {
            frame_tx,
            event_tx,
            state: Arc::new(RwLock::new(PipelineState::default())),
            fps: 30,
        };
        (ctx, frame_rx, event_rx)
    }

    /// Shell fragment printing two synthetic access units plus a tail
    /// unit on stdout: start code is \000\000\000\001, AUD type is \011.
    const TWO_UNIT_STREAM: &str =
        "printf '\\000\\000\\000\\001\\011aaaa\\000\\000\\000\\001\\011bbbb\\000\\000\\000\\001\\011cc'";

    #[tokio::test]
    async fn test_launch_failure_is_reported() {
        let (ctx, _frame_rx, _event_rx) = test_context(8);
        let err = RunHandle::launch("/nonexistent/encoder-binary", &[], ctx).unwrap_err();
        assert!(matches!(err, VideoError::EncoderLaunchFailed(_)));
    }

    #[tokio::test]
    async fn test_frames_and_state_flow() {
        let (ctx, mut frame_rx, mut event_rx) = test_context(8);
        let state = ctx.state.clone();
        let args = vec!["-c".to_string(), TWO_UNIT_STREAM.to_string()];
        let handle = RunHandle::launch("sh", &args, ctx).unwrap();

        // Two complete frames split on the AUD boundaries
        let first = frame_rx.recv().await.unwrap();
        assert_eq!(&first[..5], &[0, 0, 0, 1, 9]);
        assert_eq!(&first[5..], b"aaaa");
        let second = frame_rx.recv().await.unwrap();
        assert_eq!(&second[5..], b"bbbb");

        // The dangling tail is flushed when the stream ends
        let tail = frame_rx.recv().await.unwrap();
        assert_eq!(&tail[5..], b"cc");

        // Stdout worker reported the stream end on the state queue
        let mut saw_stream_end = false;
        while let Some(event) = event_rx.recv().await {
            if let PipelineEvent::WorkerExit {
                worker: WorkerKind::Stdout,
                reason,
            } = event
            {
                assert_eq!(reason, WorkerExitReason::StreamEnded);
                saw_stream_end = true;
                break;
            }
        }
        assert!(saw_stream_end);
        assert!(state.read().ready);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_long_running_process() {
        let (ctx, _frame_rx, mut event_rx) = test_context(8);
        let args = vec!["30".to_string()];
        let handle = RunHandle::launch("sleep", &args, ctx).unwrap();

        handle.shutdown().await;

        // Both workers must have reported an exit
        let mut exits = 0;
        while let Ok(event) =
            tokio::time::timeout(Duration::from_secs(2), event_rx.recv()).await
        {
            match event {
                Some(PipelineEvent::WorkerExit { .. }) => {
                    exits += 1;
                    if exits == 2 {
                        break;
                    }
                }
                Some(_) => {}
                None => break,
            }
        }
        assert_eq!(exits, 2);
    }

    #[tokio::test]
    async fn test_stderr_lines_do_not_fail_pipeline() {
        let (ctx, mut frame_rx, _event_rx) = test_context(8);
        let script = format!("echo 'diagnostic noise' >&2; {}", TWO_UNIT_STREAM);
        let args = vec!["-c".to_string(), script];
        let handle = RunHandle::launch("sh", &args, ctx).unwrap();

        // Frames still arrive despite stderr output
        let first = frame_rx.recv().await.unwrap();
        assert_eq!(&first[5..], b"aaaa");

        handle.shutdown().await;
    }
}
