//! Encoder backend selection and command-line construction
//!
//! The encoder runs as an external ffmpeg process. At each start the
//! selector probes for accelerator device nodes and picks one of three
//! backends: VAAPI (hwupload filter chain into h264_vaapi), Intel QSV
//! (hardware-assisted input decode into h264_qsv), or libx264 software
//! fallback. Selection and argument construction are pure functions of
//! the configuration and the probe results, so they are unit-testable
//! with a fake probe.

use std::path::Path;

use crate::config::{HwAccelMode, PipelineConfig};

/// Filesystem existence probe, injectable for tests
pub trait DeviceProbe: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
}

/// Real probe backed by the filesystem
pub struct FsProbe;

impl DeviceProbe for FsProbe {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// Probe answering from a fixed set of paths
///
/// Used by tests and available to callers that want to pin the backend
/// decision without touching /dev.
pub struct FakeProbe {
    present: Vec<std::path::PathBuf>,
}

impl FakeProbe {
    /// Probe that reports every path as absent
    pub fn none() -> Self {
        Self {
            present: Vec::new(),
        }
    }

    /// Probe that reports exactly the given paths as present
    pub fn with_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<std::path::PathBuf>,
    {
        Self {
            present: paths.into_iter().map(Into::into).collect(),
        }
    }
}

impl DeviceProbe for FakeProbe {
    fn exists(&self, path: &Path) -> bool {
        self.present.iter().any(|p| p == path)
    }
}

/// Selected encoder execution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderBackend {
    /// h264_vaapi with hwupload filter chain
    Vaapi,
    /// h264_qsv with hardware-assisted input decode
    Qsv,
    /// libx264 low-latency software fallback
    Software,
}

impl std::fmt::Display for EncoderBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vaapi => write!(f, "vaapi"),
            Self::Qsv => write!(f, "qsv"),
            Self::Software => write!(f, "software"),
        }
    }
}

/// QSV is assumed usable when the Intel render node is present
const QSV_RENDER_NODE: &str = "/dev/dri/renderD128";

/// Decide which backend to use for the next run
///
/// Policy, in order: forced or auto-probed VAAPI, then forced or
/// auto-probed QSV, else software. Deterministic for a given config and
/// probe state.
pub fn select_backend(config: &PipelineConfig, probe: &dyn DeviceProbe) -> EncoderBackend {
    let can_vaapi = match config.hwaccel {
        HwAccelMode::Vaapi => true,
        HwAccelMode::Auto => probe.exists(&config.vaapi_device),
        _ => false,
    };
    if can_vaapi {
        return EncoderBackend::Vaapi;
    }

    let can_qsv = match config.hwaccel {
        HwAccelMode::Qsv => true,
        HwAccelMode::Auto => probe.exists(Path::new(QSV_RENDER_NODE)),
        _ => false,
    };
    if can_qsv {
        return EncoderBackend::Qsv;
    }

    EncoderBackend::Software
}

/// Build the ffmpeg argument vector for a backend
///
/// All backends share the low-delay input flags, the V4L2 MJPEG input,
/// and the raw H.264 elementary-stream output on stdout. Only the codec
/// fragment differs. B-frames are disabled on the hardware paths to keep
/// latency down.
pub fn build_encoder_args(backend: EncoderBackend, config: &PipelineConfig) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "warning".into(),
        "-fflags".into(),
        "nobuffer".into(),
        "-flags".into(),
        "low_delay".into(),
    ];

    // Input-side hwaccel flags must precede -i
    match backend {
        EncoderBackend::Vaapi => {
            args.extend([
                "-hwaccel".into(),
                "vaapi".into(),
                "-vaapi_device".into(),
                config.vaapi_device.display().to_string(),
            ]);
        }
        EncoderBackend::Qsv => {
            args.extend(["-hwaccel".into(), "qsv".into()]);
        }
        EncoderBackend::Software => {}
    }

    args.extend([
        "-f".into(),
        "v4l2".into(),
        "-input_format".into(),
        "mjpeg".into(),
        "-i".into(),
        config.device.display().to_string(),
        "-an".into(),
    ]);

    match backend {
        EncoderBackend::Vaapi => {
            args.extend([
                "-vf".into(),
                "format=nv12,hwupload".into(),
                "-c:v".into(),
                "h264_vaapi".into(),
                "-bf".into(),
                "0".into(),
            ]);
        }
        EncoderBackend::Qsv => {
            args.extend([
                "-c:v".into(),
                "h264_qsv".into(),
                "-look_ahead".into(),
                "0".into(),
                "-bf".into(),
                "0".into(),
            ]);
        }
        EncoderBackend::Software => {
            args.extend([
                "-c:v".into(),
                "libx264".into(),
                "-preset".into(),
                "veryfast".into(),
                "-tune".into(),
                "zerolatency".into(),
                "-profile:v".into(),
                "baseline".into(),
                "-level".into(),
                "3.1".into(),
                "-pix_fmt".into(),
                "yuv420p".into(),
            ]);
        }
    }

    args.extend([
        "-r".into(),
        config.fps.to_string(),
        "-b:v".into(),
        config.bitrate.clone(),
        "-f".into(),
        "h264".into(),
        "pipe:1".into(),
    ]);

    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_mode(mode: HwAccelMode) -> PipelineConfig {
        PipelineConfig {
            hwaccel: mode,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_auto_prefers_vaapi() {
        let config = config_with_mode(HwAccelMode::Auto);
        let probe = FakeProbe::with_paths(["/dev/dri/renderD128"]);
        assert_eq!(select_backend(&config, &probe), EncoderBackend::Vaapi);
    }

    #[test]
    fn test_auto_falls_back_to_qsv() {
        let mut config = config_with_mode(HwAccelMode::Auto);
        // VAAPI probe looks at a node that is absent, QSV node is present
        config.vaapi_device = "/dev/dri/renderD999".into();
        let probe = FakeProbe::with_paths(["/dev/dri/renderD128"]);
        assert_eq!(select_backend(&config, &probe), EncoderBackend::Qsv);
    }

    #[test]
    fn test_auto_without_accelerators_is_software() {
        let config = config_with_mode(HwAccelMode::Auto);
        let probe = FakeProbe::none();
        assert_eq!(select_backend(&config, &probe), EncoderBackend::Software);
    }

    #[test]
    fn test_forced_modes_skip_probing() {
        let probe = FakeProbe::none();
        assert_eq!(
            select_backend(&config_with_mode(HwAccelMode::Vaapi), &probe),
            EncoderBackend::Vaapi
        );
        assert_eq!(
            select_backend(&config_with_mode(HwAccelMode::Qsv), &probe),
            EncoderBackend::Qsv
        );
        assert_eq!(
            select_backend(&config_with_mode(HwAccelMode::None), &probe),
            EncoderBackend::Software
        );
    }

    #[test]
    fn test_mode_none_ignores_present_accelerators() {
        let config = config_with_mode(HwAccelMode::None);
        let probe = FakeProbe::with_paths(["/dev/dri/renderD128"]);
        assert_eq!(select_backend(&config, &probe), EncoderBackend::Software);
    }

    #[test]
    fn test_selection_is_deterministic() {
        let config = config_with_mode(HwAccelMode::Auto);
        let probe = FakeProbe::with_paths(["/dev/dri/renderD128"]);
        let first = select_backend(&config, &probe);
        for _ in 0..10 {
            assert_eq!(select_backend(&config, &probe), first);
        }
        assert_eq!(
            build_encoder_args(first, &config),
            build_encoder_args(first, &config)
        );
    }

    #[test]
    fn test_shared_flags_on_all_backends() {
        let config = PipelineConfig::default();
        for backend in [
            EncoderBackend::Vaapi,
            EncoderBackend::Qsv,
            EncoderBackend::Software,
        ] {
            let args = build_encoder_args(backend, &config);
            for flag in ["-hide_banner", "nobuffer", "low_delay", "pipe:1"] {
                assert!(args.iter().any(|a| a == flag), "{} missing {}", backend, flag);
            }
            assert!(args.windows(2).any(|w| w[0] == "-r" && w[1] == "30"));
            assert!(args.windows(2).any(|w| w[0] == "-b:v" && w[1] == "4M"));
            assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/dev/video0"));
            // Elementary stream output, no container
            assert_eq!(args[args.len() - 3..], ["-f", "h264", "pipe:1"]);
        }
    }

    #[test]
    fn test_vaapi_args() {
        let config = PipelineConfig::default();
        let args = build_encoder_args(EncoderBackend::Vaapi, &config);
        let input_pos = args.iter().position(|a| a == "-i").unwrap();
        let hwaccel_pos = args.iter().position(|a| a == "-hwaccel").unwrap();
        assert!(hwaccel_pos < input_pos, "-hwaccel must precede -i");
        assert!(args.iter().any(|a| a == "h264_vaapi"));
        assert!(args.iter().any(|a| a == "format=nv12,hwupload"));
        assert!(args.windows(2).any(|w| w[0] == "-bf" && w[1] == "0"));
    }

    #[test]
    fn test_qsv_args() {
        let config = PipelineConfig::default();
        let args = build_encoder_args(EncoderBackend::Qsv, &config);
        assert!(args.iter().any(|a| a == "h264_qsv"));
        assert!(args.windows(2).any(|w| w[0] == "-look_ahead" && w[1] == "0"));
        assert!(args.windows(2).any(|w| w[0] == "-bf" && w[1] == "0"));
    }

    #[test]
    fn test_software_args() {
        let config = PipelineConfig::default();
        let args = build_encoder_args(EncoderBackend::Software, &config);
        assert!(args.iter().any(|a| a == "libx264"));
        assert!(args.windows(2).any(|w| w[0] == "-tune" && w[1] == "zerolatency"));
        assert!(args.windows(2).any(|w| w[0] == "-profile:v" && w[1] == "baseline"));
        assert!(!args.iter().any(|a| a == "-hwaccel"));
    }
}
