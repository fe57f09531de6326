//! Audio backend abstraction
//!
//! A backend owns the connection to one driver family (CPAL host,
//! JACK server, or the virtual loopback) and services at most one open
//! stream. The [`Stream`](crate::stream::Stream) front end handles
//! validation, conversion and lifecycle; the backend's job is device
//! probing, geometry negotiation and running driver callbacks through
//! the [`DriverEndpoint`] it receives at open time.

pub mod cpal_backend;
pub mod null;

#[cfg(all(target_os = "linux", feature = "jack-backend"))]
pub mod jack_backend;

use crate::format::SampleFormat;
use crate::stream::{
    BackendKind, DriverEndpoint, StreamConfig, StreamDirection, StreamError, StreamResult,
};

/// Capabilities of one probed device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Human-readable device name.
    pub name: String,
    /// Maximum playback channels.
    pub output_channels: u16,
    /// Maximum capture channels.
    pub input_channels: u16,
    /// Channels usable simultaneously in both directions.
    pub duplex_channels: u16,
    /// Whether this is the system default playback device.
    pub is_default_output: bool,
    /// Whether this is the system default capture device.
    pub is_default_input: bool,
    /// Supported sample rates (common ones).
    pub sample_rates: Vec<u32>,
    /// Sample formats the device can service natively.
    pub formats: Vec<SampleFormat>,
}

/// What the caller wants from one direction of a device.
#[derive(Debug, Clone, Copy)]
pub struct DeviceRequest {
    pub channels: u16,
    pub first_channel: u16,
    pub sample_rate: u32,
    pub format: SampleFormat,
    pub buffer_frames: u32,
}

/// What the device will actually deliver.
#[derive(Debug, Clone, Copy)]
pub struct NegotiatedDevice {
    /// Total channels in the device buffer (>= requested + first).
    pub total_channels: u16,
    /// Native sample format of the device buffer.
    pub format: SampleFormat,
    /// Whether the device buffer is planar (per-channel blocks).
    pub planar: bool,
    /// Whether device samples are opposite-endian to the host.
    pub byte_swap: bool,
    /// Driver-side latency in frames for this direction.
    pub latency: u32,
    /// Cycle size the device settled on.
    pub buffer_frames: u32,
}

/// One negotiated direction of an open request.
#[derive(Debug, Clone, Copy)]
pub struct DirectionSpec {
    /// Index into the probed device list.
    pub device: usize,
    pub negotiated: NegotiatedDevice,
}

/// Everything a backend needs to open its driver streams.
#[derive(Debug, Clone, Copy)]
pub struct OpenSpec {
    pub sample_rate: u32,
    pub buffer_frames: u32,
    pub playback: Option<DirectionSpec>,
    pub record: Option<DirectionSpec>,
}

/// Driver family servicing one stream.
///
/// Implementations are not required to be `Send`; driver handles like
/// CPAL streams are thread-bound, so the owning
/// [`Stream`](crate::stream::Stream) stays on its creating thread.
pub trait AudioBackend {
    /// Short name of the driver family, for logs.
    fn name(&self) -> &'static str;

    /// Enumerate devices. Returns false when none were found.
    fn probe_devices(&mut self) -> bool;

    /// Devices found by the last probe.
    fn devices(&self) -> &[DeviceInfo];

    /// Check that a device can satisfy `request` and report the
    /// geometry it would actually deliver. No driver resources are
    /// held afterwards.
    fn probe_device_open(
        &mut self,
        device: usize,
        direction: StreamDirection,
        request: &DeviceRequest,
    ) -> StreamResult<NegotiatedDevice>;

    /// Build the driver streams for `spec`, wiring callbacks to
    /// `endpoint`. The streams stay silent until [`start`].
    ///
    /// [`start`]: AudioBackend::start
    fn open(&mut self, endpoint: DriverEndpoint, spec: &OpenSpec) -> StreamResult<()>;

    /// Begin driver callbacks.
    fn start(&mut self) -> StreamResult<()>;

    /// Pause driver callbacks, letting queued buffers drain.
    fn stop(&mut self) -> StreamResult<()>;

    /// Pause driver callbacks immediately, discarding queued buffers.
    fn abort(&mut self) -> StreamResult<()>;

    /// Release driver streams. Infallible; errors are logged.
    fn close(&mut self);
}

/// Construct the backend selected by `config`.
pub fn create_backend(config: &StreamConfig) -> StreamResult<Box<dyn AudioBackend>> {
    match config.backend {
        BackendKind::Auto => default_backend(config),
        BackendKind::Cpal => Ok(Box::new(cpal_backend::CpalBackend::new(
            config.client_name().to_string(),
        ))),
        #[cfg(all(target_os = "linux", feature = "jack-backend"))]
        BackendKind::Jack => Ok(Box::new(jack_backend::JackBackend::connect(
            config.client_name(),
        )?)),
        BackendKind::Null => {
            // The paired driver handle is only reachable through
            // NullBackend::new directly; a config-selected null backend
            // runs silent.
            let (backend, _driver) = null::NullBackend::new();
            Ok(Box::new(backend))
        }
    }
}

#[cfg(all(target_os = "linux", feature = "jack-backend"))]
fn default_backend(config: &StreamConfig) -> StreamResult<Box<dyn AudioBackend>> {
    match jack_backend::JackBackend::connect(config.client_name()) {
        Ok(backend) => Ok(Box::new(backend)),
        Err(e) => {
            log::info!("backend: JACK unavailable ({}), falling back to CPAL", e);
            Ok(Box::new(cpal_backend::CpalBackend::new(
                config.client_name().to_string(),
            )))
        }
    }
}

#[cfg(not(all(target_os = "linux", feature = "jack-backend")))]
fn default_backend(config: &StreamConfig) -> StreamResult<Box<dyn AudioBackend>> {
    Ok(Box::new(cpal_backend::CpalBackend::new(
        config.client_name().to_string(),
    )))
}

impl DeviceInfo {
    /// Whether the device supports `format` natively.
    pub fn supports_format(&self, format: SampleFormat) -> bool {
        self.formats.contains(&format)
    }

    /// Channel capacity in `direction`.
    pub fn channels(&self, direction: StreamDirection) -> u16 {
        match direction {
            StreamDirection::Playback => self.output_channels,
            StreamDirection::Record => self.input_channels,
        }
    }
}

pub(crate) fn check_direction_request(
    info: &DeviceInfo,
    direction: StreamDirection,
    request: &DeviceRequest,
) -> StreamResult<()> {
    let capacity = info.channels(direction);
    // Widened so an extreme request cannot wrap before the check.
    let needed = request.channels as u32 + request.first_channel as u32;
    if capacity == 0 {
        return Err(StreamError::DeviceCapability(format!(
            "device '{}' has no {:?} channels",
            info.name, direction
        )));
    }
    if needed > capacity as u32 {
        return Err(StreamError::DeviceCapability(format!(
            "device '{}' has {} {:?} channels, {} requested",
            info.name, capacity, direction, needed
        )));
    }
    Ok(())
}
