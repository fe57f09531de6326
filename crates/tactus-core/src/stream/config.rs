//! Stream configuration
//!
//! Backend selection is an explicit configuration object handed to
//! [`Stream::new`](super::Stream::new); there is no process-wide
//! "currently selected API" state. Options can be persisted as YAML
//! under the platform config directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::format::SampleFormat;

/// Upper bound on negotiated cycle sizes; per-direction staging
/// buffers are allocated against this at open time.
pub const MAX_BUFFER_SIZE: u32 = 8192;

/// Safe default cycle size when the caller has no preference (frames).
pub const DEFAULT_BUFFER_SIZE: u32 = 512;

/// Default sample rate for the audio system (48kHz).
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Which driver family services the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackendKind {
    /// Platform default: JACK when built with `jack-backend` on Linux,
    /// otherwise CPAL.
    #[default]
    Auto,
    /// Cross-platform CPAL backend (ALSA/PipeWire, WASAPI, CoreAudio).
    Cpal,
    /// Native JACK backend (Linux, `jack-backend` feature).
    #[cfg(all(target_os = "linux", feature = "jack-backend"))]
    Jack,
    /// Virtual loopback device; cycles are driven by the caller.
    /// Used for headless operation and tests.
    Null,
}

/// Per-direction stream request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamParams {
    /// Index into the probed device list.
    pub device: usize,
    /// Channels this direction should carry.
    pub channels: u16,
    /// First channel within the device buffer (for devices shared
    /// between logical ports).
    #[serde(default)]
    pub first_channel: u16,
}

impl StreamParams {
    pub fn new(device: usize, channels: u16) -> Self {
        Self {
            device,
            channels,
            first_channel: 0,
        }
    }
}

/// Stream construction configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Backend family to service the stream.
    pub backend: BackendKind,
    /// Client name shown to the driver (JACK client, stream label).
    pub name: Option<String>,
}

impl StreamConfig {
    pub fn with_backend(backend: BackendKind) -> Self {
        Self {
            backend,
            name: None,
        }
    }

    pub fn client_name(&self) -> &str {
        self.name.as_deref().unwrap_or("tactus")
    }
}

/// Open-time options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamOptions {
    /// Present user buffers as planar (per-channel blocks) rather than
    /// interleaved frames.
    pub planar: bool,
    /// Preferred sample format for user buffers.
    pub format: SampleFormat,
    /// Preferred sample rate (None = device default).
    pub sample_rate: Option<u32>,
    /// Requested cycle size in frames (clamped to device limits).
    pub buffer_frames: u32,
    /// Driver-side buffer count hint, where the backend honors it.
    pub number_of_buffers: u32,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            planar: false,
            format: SampleFormat::Float32,
            sample_rate: None,
            buffer_frames: DEFAULT_BUFFER_SIZE,
            number_of_buffers: 2,
        }
    }
}

/// Default location of the persisted stream options.
pub fn default_stream_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tactus")
        .join("stream.yaml")
}

/// Load stream options from a YAML file.
///
/// A missing file yields defaults; an unreadable or invalid file logs
/// a warning and yields defaults.
pub fn load_stream_options(path: &Path) -> StreamOptions {
    if !path.exists() {
        log::info!("load_stream_options: no config at {:?}, using defaults", path);
        return StreamOptions::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str::<StreamOptions>(&contents) {
            Ok(options) => {
                log::info!(
                    "load_stream_options: {} @ {}Hz, {} frames",
                    options.format,
                    options.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE),
                    options.buffer_frames
                );
                options
            }
            Err(e) => {
                log::warn!("load_stream_options: failed to parse {:?}: {}", path, e);
                StreamOptions::default()
            }
        },
        Err(e) => {
            log::warn!("load_stream_options: failed to read {:?}: {}", path, e);
            StreamOptions::default()
        }
    }
}

/// Persist stream options as YAML, creating parent directories.
pub fn save_stream_options(path: &Path, options: &StreamOptions) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serde_yaml::to_string(options)?;
    std::fs::write(path, yaml)?;
    log::info!("save_stream_options: wrote {:?}", path);
    Ok(())
}
