//! Video pipeline controller
//!
//! `VideoPipeline` is the single owner of the capture-and-encode
//! pipeline: the run handle, the shared state snapshot and the quality
//! factor. Nothing lives in process-wide globals; everything sits in
//! one explicitly constructed object with injectable collaborators
//! (device probe, encoder program), so backend selection and
//! supervision are testable without hardware or a real encoder.
//!
//! All start/stop/quality mutations serialize on one control lock. The
//! lock is held across the process-exit wait in `stop()` but never
//! blocks concurrent state reads, which go through a separate snapshot
//! lock.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::events::{PipelineEvent, PipelineState};
use crate::video::backend::{build_encoder_args, select_backend, DeviceProbe, FsProbe};
use crate::video::supervisor::{RunContext, RunHandle};

/// Base bitrate in Mbps at quality factor 1.0
const BASE_BITRATE_MBPS: f64 = 4.0;
/// Quality factor bounds
const QUALITY_FACTOR_MIN: f64 = 0.5;
const QUALITY_FACTOR_MAX: f64 = 2.0;
/// Mapped bitrate bounds in Mbps
const BITRATE_MBPS_MIN: i64 = 2;
const BITRATE_MBPS_MAX: i64 = 12;

/// Capture-and-encode pipeline for one video device
pub struct VideoPipeline {
    /// Immutable during a run, rewritten between stop/start cycles
    config: RwLock<PipelineConfig>,
    /// Quality knob, persists across restarts
    quality_factor: RwLock<f64>,
    /// Shared readiness snapshot
    state: Arc<RwLock<PipelineState>>,
    /// Control lock and the at-most-one run handle
    run: Mutex<Option<RunHandle>>,
    /// Outbound frame queue (ownership of frames transfers to consumer)
    frame_tx: mpsc::Sender<Bytes>,
    /// Outbound state queue
    event_tx: mpsc::Sender<PipelineEvent>,
    /// Filesystem existence probe, injectable for tests
    probe: Box<dyn DeviceProbe>,
    /// Encoder binary, injectable for tests
    program: String,
}

impl VideoPipeline {
    /// Create a pipeline wired to the given outbound queues
    pub fn new(
        config: PipelineConfig,
        frame_tx: mpsc::Sender<Bytes>,
        event_tx: mpsc::Sender<PipelineEvent>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            quality_factor: RwLock::new(1.0),
            state: Arc::new(RwLock::new(PipelineState::default())),
            run: Mutex::new(None),
            frame_tx,
            event_tx,
            probe: Box::new(FsProbe),
            program: "ffmpeg".to_string(),
        }
    }

    /// Replace the device probe (testing, pinned deployments)
    pub fn with_probe(mut self, probe: Box<dyn DeviceProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Replace the encoder binary
    pub fn with_encoder_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    /// Validate the resolved configuration
    ///
    /// Fails fast with `DeviceNotFound` when the capture device is
    /// absent. Advisory: the device may still disappear later.
    pub fn init(&self) -> Result<()> {
        let config = self.config.read();
        config.validate(self.probe.as_ref())?;
        info!(
            "Video pipeline initialized: device={} fps={} bitrate={} hwaccel={}",
            config.device_str(),
            config.fps,
            config.bitrate,
            config.hwaccel.as_str()
        );
        Ok(())
    }

    /// Start the encoder run
    ///
    /// No-op if a run already exists. Launch failures are returned to
    /// the caller, logged and reflected in the state snapshot; no retry
    /// is attempted here.
    pub async fn start(&self) -> Result<()> {
        let mut run = self.run.lock().await;
        self.start_locked(&mut run).await
    }

    /// Stop the encoder run, releasing the process and its streams
    ///
    /// Safe no-op when idle.
    pub async fn stop(&self) {
        let mut run = self.run.lock().await;
        self.stop_locked(&mut run).await;
    }

    /// Alias for stop, used on process shutdown
    pub async fn shutdown(&self) {
        self.stop().await;
    }

    /// Whether a run handle currently exists
    ///
    /// A dead encoder whose handle has not been reclaimed by `stop()`
    /// still counts as running; the next stop/start observes it.
    pub async fn is_running(&self) -> bool {
        self.run.lock().await.is_some()
    }

    async fn start_locked(&self, run: &mut Option<RunHandle>) -> Result<()> {
        if run.is_some() {
            debug!("Pipeline already running, start ignored");
            return Ok(());
        }

        let config = self.config.read().clone();
        config.validate(self.probe.as_ref())?;

        let backend = select_backend(&config, self.probe.as_ref());
        let args = build_encoder_args(backend, &config);
        info!("Selected encoder backend: {}", backend);

        let ctx = RunContext {
            frame_tx: self.frame_tx.clone(),
            event_tx: self.event_tx.clone(),
            state: self.state.clone(),
            fps: config.fps,
        };

        match RunHandle::launch(&self.program, &args, ctx) {
            Ok(handle) => {
                *run = Some(handle);
                let snapshot = {
                    let mut state = self.state.write();
                    state.ready = true;
                    state.error = None;
                    state.fps = config.fps as f64;
                    state.clone()
                };
                let _ = self.event_tx.send(PipelineEvent::State(snapshot)).await;
                Ok(())
            }
            Err(e) => {
                error!("Encoder launch failed: {}", e);
                let snapshot = {
                    let mut state = self.state.write();
                    state.ready = false;
                    state.error = Some(e.to_string());
                    state.clone()
                };
                let _ = self.event_tx.send(PipelineEvent::State(snapshot)).await;
                Err(e)
            }
        }
    }

    async fn stop_locked(&self, run: &mut Option<RunHandle>) {
        let Some(handle) = run.take() else {
            debug!("Pipeline already idle, stop ignored");
            return;
        };

        handle.shutdown().await;

        let snapshot = {
            let mut state = self.state.write();
            state.ready = false;
            state.clone()
        };
        let _ = self.event_tx.send(PipelineEvent::State(snapshot)).await;
        info!("Video pipeline stopped");
    }

    /// Current quality factor
    pub fn quality_factor(&self) -> f64 {
        *self.quality_factor.read()
    }

    /// Adjust the quality factor, restarting the run if one is active
    ///
    /// The factor clamps to [0.5, 2.0] and maps linearly to the bitrate:
    /// clamp(round(4 * factor), 2, 12) Mbps. The encoder has no live
    /// bitrate control channel, so an active run is stopped and started
    /// to apply the change; restart failures surface on the state queue,
    /// not here.
    pub async fn set_quality_factor(&self, factor: f64) -> Result<()> {
        let factor = factor.clamp(QUALITY_FACTOR_MIN, QUALITY_FACTOR_MAX);
        let mbps = ((BASE_BITRATE_MBPS * factor).round() as i64)
            .clamp(BITRATE_MBPS_MIN, BITRATE_MBPS_MAX);
        let bitrate = format!("{}M", mbps);

        let mut run = self.run.lock().await;
        *self.quality_factor.write() = factor;
        self.config.write().bitrate = bitrate.clone();
        info!("Quality factor set to {} (bitrate {})", factor, bitrate);

        if run.is_some() {
            self.stop_locked(&mut run).await;
            if let Err(e) = self.start_locked(&mut run).await {
                error!("Restart after quality change failed: {}", e);
            }
        }

        Ok(())
    }

    /// Current state snapshot
    pub fn state(&self) -> PipelineState {
        self.state.read().clone()
    }

    /// Current configuration snapshot
    pub fn config(&self) -> PipelineConfig {
        self.config.read().clone()
    }

    /// One-line operator-facing status
    pub fn status_summary(&self) -> String {
        let config = self.config.read();
        let state = self.state.read();
        format!(
            "device={} fps={} bitrate={} ready={}",
            config.device.display(),
            config.fps,
            config.bitrate,
            state.ready
        )
    }

    /// Display timing metadata is not readable on this capture path
    pub fn edid(&self) -> Option<String> {
        None
    }

    /// Display timing metadata is not settable on this capture path
    pub fn set_edid(&self, _edid: &str) -> Result<()> {
        Ok(())
    }
}
