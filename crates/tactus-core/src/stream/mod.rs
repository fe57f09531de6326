//! Audio stream lifecycle and callback plumbing
//!
//! A [`Stream`] wraps one backend and at most one open stream with an
//! optional playback and an optional record direction. The caller
//! provides a callback that is invoked once per cycle on the driver
//! thread with user-format buffers; format and layout conversion to
//! the device's native geometry happens inside the engine.
//!
//! Lifecycle: `Closed -> Stopped -> Running -> Stopped -> Closed`,
//! with a driver-side `Stopping` drain state entered when the callback
//! asks to stop. Every transition is validated; calls out of order
//! return [`StreamError::InvalidState`] without side effects.

mod config;
mod engine;
mod error;

pub use config::{
    default_stream_config_path, load_stream_options, save_stream_options, BackendKind,
    StreamConfig, StreamOptions, StreamParams, DEFAULT_BUFFER_SIZE, DEFAULT_SAMPLE_RATE,
    MAX_BUFFER_SIZE,
};
pub use engine::DriverEndpoint;
pub use error::{StreamError, StreamResult};

pub(crate) use engine::{CycleEngine, DirectionState, StreamShared};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{self, AudioBackend, DeviceInfo, DeviceRequest, DirectionSpec, OpenSpec};
use crate::format::{BufferGeometry, ConvertInfo, SampleFormat};

/// Bound on the teardown rendezvous with the driver thread.
const STOP_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle state of a [`Stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamStatus {
    /// No stream is open.
    Closed = 0,
    /// Open and configured, callbacks idle.
    Stopped = 1,
    /// Callbacks firing.
    Running = 2,
    /// Callback requested a stop; draining silence until the
    /// application completes the transition.
    Stopping = 3,
}

impl StreamStatus {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => StreamStatus::Stopped,
            2 => StreamStatus::Running,
            3 => StreamStatus::Stopping,
            _ => StreamStatus::Closed,
        }
    }
}

/// Which way samples flow, from the application's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    /// Application produces samples for the device.
    Playback,
    /// Application consumes samples from the device.
    Record,
}

/// Over/underflow indications for one callback cycle.
///
/// Latched by the driver between cycles and cleared on delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStatusFlags {
    /// Capture data was lost since the previous cycle.
    pub input_overflow: bool,
    /// The device ran dry since the previous cycle.
    pub output_underflow: bool,
}

/// What the callback wants the stream to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    /// Keep cycling.
    Continue,
    /// Stop after remaining buffers drain.
    Stop,
    /// Stop as soon as possible, discarding pending buffers.
    Abort,
}

/// User-format buffers handed to the callback each cycle.
///
/// Slices are sized for exactly the frames of this cycle; a direction
/// that was not opened is an empty slice. The typed accessors cast
/// through [`bytemuck`], which the engine's buffer alignment makes
/// safe for every supported sample format.
pub struct CycleBuffers<'a> {
    pub output: &'a mut [u8],
    pub input: &'a [u8],
}

impl CycleBuffers<'_> {
    /// View the output buffer as samples of `T`.
    pub fn output_as<T: bytemuck::Pod>(&mut self) -> &mut [T] {
        bytemuck::cast_slice_mut(self.output)
    }

    /// View the input buffer as samples of `T`.
    pub fn input_as<T: bytemuck::Pod>(&self) -> &[T] {
        bytemuck::cast_slice(self.input)
    }
}

/// Per-cycle user callback.
///
/// Runs on the driver thread; it must not block or allocate.
pub type StreamCallback =
    Box<dyn FnMut(CycleBuffers<'_>, u32, f64, StreamStatusFlags) -> CallbackAction + Send>;

/// One backend connection and at most one open stream.
pub struct Stream {
    backend: Box<dyn AudioBackend>,
    shared: Arc<StreamShared>,
    engine: Option<Arc<Mutex<CycleEngine>>>,
    sample_rate: u32,
    buffer_frames: u32,
    latency: u32,
}

impl Stream {
    /// Connect to the backend selected by `config` and probe devices.
    pub fn new(config: StreamConfig) -> StreamResult<Self> {
        let backend = backend::create_backend(&config)?;
        Ok(Self::with_backend(backend))
    }

    /// Wrap an already constructed backend.
    ///
    /// This is the injection seam used by tests and by embedders with
    /// custom drivers.
    pub fn with_backend(mut backend: Box<dyn AudioBackend>) -> Self {
        if !backend.probe_devices() {
            log::warn!("stream: backend {} reported no devices", backend.name());
        }
        Self {
            backend,
            shared: Arc::new(StreamShared::new()),
            engine: None,
            sample_rate: 0,
            buffer_frames: 0,
            latency: 0,
        }
    }

    /// Name of the driver family servicing this stream.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Re-enumerate devices. Only legal while no stream is open.
    pub fn probe_devices(&mut self) -> StreamResult<&[DeviceInfo]> {
        if self.status() != StreamStatus::Closed {
            return Err(StreamError::InvalidState {
                operation: "probe devices",
                state: self.status(),
            });
        }
        self.backend.probe_devices();
        Ok(self.backend.devices())
    }

    /// Devices found by the last probe.
    pub fn devices(&self) -> &[DeviceInfo] {
        self.backend.devices()
    }

    /// Index of the default output device, if any.
    pub fn default_output_device(&self) -> Option<usize> {
        self.backend.devices().iter().position(|d| d.is_default_output)
    }

    /// Index of the default input device, if any.
    pub fn default_input_device(&self) -> Option<usize> {
        self.backend.devices().iter().position(|d| d.is_default_input)
    }

    /// Open a stream in one or both directions.
    ///
    /// Validates parameters, negotiates device geometry, allocates all
    /// conversion buffers and hands the backend a driver endpoint. On
    /// success the stream is `Stopped`; on any failure it remains
    /// `Closed` with no resources held.
    #[allow(clippy::too_many_arguments)]
    pub fn open_stream(
        &mut self,
        output: Option<StreamParams>,
        input: Option<StreamParams>,
        format: SampleFormat,
        sample_rate: u32,
        buffer_frames: u32,
        callback: StreamCallback,
        options: &StreamOptions,
    ) -> StreamResult<()> {
        if self.status() != StreamStatus::Closed {
            return Err(StreamError::InvalidState {
                operation: "open",
                state: self.status(),
            });
        }
        if output.is_none() && input.is_none() {
            return Err(StreamError::NoStreamParams);
        }
        if sample_rate == 0 {
            return Err(StreamError::InvalidSampleRate(sample_rate));
        }

        let device_count = self.backend.devices().len();
        if device_count == 0 {
            return Err(StreamError::NoDevices);
        }
        for params in output.iter().chain(input.iter()) {
            if params.channels < 1 {
                return Err(StreamError::InvalidChannelCount(params.channels));
            }
            if params.device >= device_count {
                return Err(StreamError::DeviceOutOfRange {
                    device: params.device,
                    count: device_count,
                });
            }
        }

        let buffer_frames = buffer_frames.clamp(1, MAX_BUFFER_SIZE);

        let playback_neg = match output {
            Some(params) => Some(self.backend.probe_device_open(
                params.device,
                StreamDirection::Playback,
                &DeviceRequest {
                    channels: params.channels,
                    first_channel: params.first_channel,
                    sample_rate,
                    format,
                    buffer_frames,
                },
            )?),
            None => None,
        };
        let record_neg = match input {
            Some(params) => Some(self.backend.probe_device_open(
                params.device,
                StreamDirection::Record,
                &DeviceRequest {
                    channels: params.channels,
                    first_channel: params.first_channel,
                    sample_rate,
                    format,
                    buffer_frames,
                },
            )?),
            None => None,
        };

        // Directions may negotiate different cycle sizes; run the
        // stream at the larger one so neither starves.
        let buffer_frames = playback_neg
            .iter()
            .chain(record_neg.iter())
            .map(|n| n.buffer_frames)
            .max()
            .unwrap_or(buffer_frames)
            .clamp(1, MAX_BUFFER_SIZE);

        let playback = output.zip(playback_neg).map(|(params, neg)| {
            build_direction(&params, &neg, format, options.planar, StreamDirection::Playback)
        });
        let record = input.zip(record_neg).map(|(params, neg)| {
            build_direction(&params, &neg, format, options.planar, StreamDirection::Record)
        });

        let engine = Arc::new(Mutex::new(CycleEngine::new(
            callback,
            playback,
            record,
            buffer_frames,
            sample_rate,
        )));
        let endpoint = DriverEndpoint {
            engine: Arc::clone(&engine),
            shared: Arc::clone(&self.shared),
        };

        let spec = OpenSpec {
            sample_rate,
            buffer_frames,
            playback: output.zip(playback_neg).map(|(params, negotiated)| DirectionSpec {
                device: params.device,
                negotiated,
            }),
            record: input.zip(record_neg).map(|(params, negotiated)| DirectionSpec {
                device: params.device,
                negotiated,
            }),
        };

        if let Err(e) = self.backend.open(endpoint, &spec) {
            self.backend.close();
            return Err(e);
        }

        self.latency = engine.lock().unwrap().latency();
        self.engine = Some(engine);
        self.sample_rate = sample_rate;
        self.buffer_frames = buffer_frames;
        self.shared.reset_frames();
        self.shared.clear_stop();
        self.shared.set_status(StreamStatus::Stopped);
        log::info!(
            "stream: opened on {} @ {}Hz, {} frames/cycle, latency {} frames",
            self.backend.name(),
            sample_rate,
            buffer_frames,
            self.latency
        );
        Ok(())
    }

    /// Begin invoking the callback.
    pub fn start_stream(&mut self) -> StreamResult<()> {
        if self.status() != StreamStatus::Stopped {
            return Err(StreamError::InvalidState {
                operation: "start",
                state: self.status(),
            });
        }
        self.shared.clear_stop();
        self.backend.start()?;
        self.shared.set_status(StreamStatus::Running);
        Ok(())
    }

    /// Stop invoking the callback, draining pending buffers.
    pub fn stop_stream(&mut self) -> StreamResult<()> {
        match self.status() {
            StreamStatus::Running | StreamStatus::Stopping => {}
            state => {
                return Err(StreamError::InvalidState {
                    operation: "stop",
                    state,
                })
            }
        }
        self.rendezvous();
        self.backend.stop()?;
        self.shared.set_status(StreamStatus::Stopped);
        Ok(())
    }

    /// Stop invoking the callback immediately, discarding pending
    /// buffers.
    pub fn abort_stream(&mut self) -> StreamResult<()> {
        match self.status() {
            StreamStatus::Running | StreamStatus::Stopping => {}
            state => {
                return Err(StreamError::InvalidState {
                    operation: "abort",
                    state,
                })
            }
        }
        self.shared.begin_stop();
        self.backend.abort()?;
        self.shared.set_status(StreamStatus::Stopped);
        Ok(())
    }

    /// Close the stream, releasing the device.
    pub fn close_stream(&mut self) -> StreamResult<()> {
        match self.status() {
            StreamStatus::Closed => {
                return Err(StreamError::InvalidState {
                    operation: "close",
                    state: StreamStatus::Closed,
                })
            }
            StreamStatus::Running | StreamStatus::Stopping => {
                self.rendezvous();
                if let Err(e) = self.backend.abort() {
                    log::warn!("stream: abort during close failed: {}", e);
                }
            }
            StreamStatus::Stopped => {}
        }
        self.backend.close();
        self.engine = None;
        self.shared.set_status(StreamStatus::Closed);
        log::info!("stream: closed");
        Ok(())
    }

    /// Current lifecycle state.
    pub fn status(&self) -> StreamStatus {
        self.shared.status()
    }

    pub fn is_open(&self) -> bool {
        self.status() != StreamStatus::Closed
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status(), StreamStatus::Running | StreamStatus::Stopping)
    }

    /// Sample rate of the open stream, 0 when closed.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Cycle size of the open stream in frames, 0 when closed.
    pub fn buffer_frames(&self) -> u32 {
        self.buffer_frames
    }

    /// End-to-end latency in frames, summed over open directions.
    pub fn latency(&self) -> u32 {
        self.latency
    }

    /// Stream time in seconds: frames processed over the sample rate.
    pub fn time(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.shared.frames() as f64 / self.sample_rate as f64
    }

    /// Total capture overflows observed since open.
    pub fn input_overflows(&self) -> u64 {
        self.shared.input_overflows()
    }

    /// Total render underflows observed since open.
    pub fn output_underflows(&self) -> u64 {
        self.shared.output_underflows()
    }

    /// Request a stop and wait (bounded) for the driver thread to
    /// acknowledge, so no callback is in flight when the backend tears
    /// down.
    fn rendezvous(&self) {
        self.shared.begin_stop();
        if !self.shared.wait_ack(STOP_ACK_TIMEOUT) {
            log::warn!(
                "stream: driver did not acknowledge stop within {:?}, proceeding",
                STOP_ACK_TIMEOUT
            );
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.status() != StreamStatus::Closed {
            if let Err(e) = self.close_stream() {
                log::warn!("stream: close on drop failed: {}", e);
            }
        }
    }
}

/// Resolve one direction's conversion geometry from the negotiation
/// result.
fn build_direction(
    params: &StreamParams,
    negotiated: &backend::NegotiatedDevice,
    user_format: SampleFormat,
    user_planar: bool,
    direction: StreamDirection,
) -> DirectionState {
    let available = negotiated.total_channels.saturating_sub(params.first_channel);
    let channels = params.channels.min(available);

    let user_geometry = BufferGeometry::packed(channels, user_format, user_planar);
    let device_geometry = BufferGeometry {
        channels,
        total_channels: negotiated.total_channels,
        first_channel: params.first_channel,
        format: negotiated.format,
        planar: negotiated.planar,
    };

    let identical = user_format == negotiated.format
        && user_planar == negotiated.planar
        && negotiated.total_channels == channels
        && params.first_channel == 0;
    let convert = if identical {
        None
    } else {
        Some(match direction {
            StreamDirection::Playback => ConvertInfo::new(&user_geometry, &device_geometry),
            StreamDirection::Record => ConvertInfo::new(&device_geometry, &user_geometry),
        })
    };

    DirectionState {
        device: params.device,
        user_channels: channels,
        total_channels: negotiated.total_channels,
        user_format,
        device_format: negotiated.format,
        byte_swap: negotiated.byte_swap,
        latency: negotiated.latency,
        convert,
        clear_first: direction == StreamDirection::Playback
            && negotiated.total_channels > channels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null::NullBackend;

    fn passthrough() -> StreamCallback {
        Box::new(|mut buffers, _frames, _time, _flags| {
            let n = buffers.output.len().min(buffers.input.len());
            buffers.output[..n].copy_from_slice(&buffers.input[..n]);
            CallbackAction::Continue
        })
    }

    fn open_duplex(stream: &mut Stream) {
        stream
            .open_stream(
                Some(StreamParams::new(0, 2)),
                Some(StreamParams::new(0, 2)),
                SampleFormat::Float32,
                48000,
                256,
                passthrough(),
                &StreamOptions::default(),
            )
            .unwrap();
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let (backend, driver) = NullBackend::new();
        let mut stream = Stream::with_backend(Box::new(backend));
        assert_eq!(stream.status(), StreamStatus::Closed);

        open_duplex(&mut stream);
        assert_eq!(stream.status(), StreamStatus::Stopped);
        assert_eq!(stream.sample_rate(), 48000);
        assert_eq!(stream.buffer_frames(), 256);

        stream.start_stream().unwrap();
        assert_eq!(stream.status(), StreamStatus::Running);

        // Drive cycles from a background thread so stop's rendezvous
        // gets its acknowledgment.
        let handle = std::thread::spawn(move || {
            for _ in 0..200 {
                driver.drive_cycle();
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        });

        std::thread::sleep(std::time::Duration::from_millis(10));
        stream.stop_stream().unwrap();
        assert_eq!(stream.status(), StreamStatus::Stopped);
        assert!(stream.time() > 0.0);

        stream.close_stream().unwrap();
        assert_eq!(stream.status(), StreamStatus::Closed);
        handle.join().unwrap();
    }

    #[test]
    fn test_invalid_transitions_have_no_side_effects() {
        let (backend, _driver) = NullBackend::new();
        let mut stream = Stream::with_backend(Box::new(backend));

        assert!(matches!(
            stream.start_stream(),
            Err(StreamError::InvalidState { operation: "start", .. })
        ));
        assert!(matches!(
            stream.stop_stream(),
            Err(StreamError::InvalidState { operation: "stop", .. })
        ));
        assert!(matches!(
            stream.close_stream(),
            Err(StreamError::InvalidState { operation: "close", .. })
        ));
        assert_eq!(stream.status(), StreamStatus::Closed);

        open_duplex(&mut stream);
        assert!(matches!(
            stream.stop_stream(),
            Err(StreamError::InvalidState { operation: "stop", .. })
        ));
        // Double open is rejected and leaves the first stream intact.
        let err = stream.open_stream(
            Some(StreamParams::new(0, 2)),
            None,
            SampleFormat::Float32,
            48000,
            256,
            passthrough(),
            &StreamOptions::default(),
        );
        assert!(matches!(
            err,
            Err(StreamError::InvalidState { operation: "open", .. })
        ));
        assert_eq!(stream.status(), StreamStatus::Stopped);
    }

    #[test]
    fn test_open_validation() {
        let (backend, _driver) = NullBackend::new();
        let mut stream = Stream::with_backend(Box::new(backend));

        assert!(matches!(
            stream.open_stream(
                None,
                None,
                SampleFormat::Float32,
                48000,
                256,
                passthrough(),
                &StreamOptions::default(),
            ),
            Err(StreamError::NoStreamParams)
        ));

        assert!(matches!(
            stream.open_stream(
                Some(StreamParams::new(0, 0)),
                None,
                SampleFormat::Float32,
                48000,
                256,
                passthrough(),
                &StreamOptions::default(),
            ),
            Err(StreamError::InvalidChannelCount(0))
        ));

        assert!(matches!(
            stream.open_stream(
                Some(StreamParams::new(0, 2)),
                None,
                SampleFormat::Float32,
                0,
                256,
                passthrough(),
                &StreamOptions::default(),
            ),
            Err(StreamError::InvalidSampleRate(0))
        ));

        assert!(matches!(
            stream.open_stream(
                Some(StreamParams::new(99, 2)),
                None,
                SampleFormat::Float32,
                48000,
                256,
                passthrough(),
                &StreamOptions::default(),
            ),
            Err(StreamError::DeviceOutOfRange { device: 99, .. })
        ));

        // Every rejection leaves the stream closed.
        assert_eq!(stream.status(), StreamStatus::Closed);
    }

    #[test]
    fn test_loopback_passthrough() {
        let (backend, driver) = NullBackend::new();
        let mut stream = Stream::with_backend(Box::new(backend));
        open_duplex(&mut stream);
        stream.start_stream().unwrap();

        // Feed a recognizable capture pattern and run one cycle.
        let samples: Vec<f32> = (0..512).map(|i| i as f32 / 512.0).collect();
        driver.set_input_bytes(bytemuck::cast_slice(&samples));
        driver.drive_cycle();

        let out = driver.output_bytes();
        let out_samples: &[f32] = bytemuck::cast_slice(&out);
        assert_eq!(out_samples.len(), 512);
        assert!((out_samples[100] - samples[100]).abs() < 1e-6);

        stream.abort_stream().unwrap();
        stream.close_stream().unwrap();
    }

    #[test]
    fn test_callback_stop_enters_stopping() {
        let (backend, driver) = NullBackend::new();
        let mut stream = Stream::with_backend(Box::new(backend));
        let mut cycles = 0u32;
        stream
            .open_stream(
                Some(StreamParams::new(0, 2)),
                None,
                SampleFormat::Float32,
                48000,
                256,
                Box::new(move |_buffers, _frames, _time, _flags| {
                    cycles += 1;
                    if cycles >= 3 {
                        CallbackAction::Stop
                    } else {
                        CallbackAction::Continue
                    }
                }),
                &StreamOptions::default(),
            )
            .unwrap();
        stream.start_stream().unwrap();

        for _ in 0..5 {
            driver.drive_cycle();
        }
        assert_eq!(stream.status(), StreamStatus::Stopping);

        // The drain state still counts as running and can be stopped.
        assert!(stream.is_running());
        let handle = std::thread::spawn(move || {
            for _ in 0..100 {
                driver.drive_cycle();
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        });
        stream.stop_stream().unwrap();
        assert_eq!(stream.status(), StreamStatus::Stopped);
        handle.join().unwrap();
    }

    #[test]
    fn test_stop_proceeds_when_driver_never_acks() {
        // No cycles are driven, so the rendezvous times out; stop must
        // still complete rather than hang.
        let (backend, _driver) = NullBackend::new();
        let mut stream = Stream::with_backend(Box::new(backend));
        open_duplex(&mut stream);
        stream.start_stream().unwrap();

        let begun = std::time::Instant::now();
        stream.stop_stream().unwrap();
        assert_eq!(stream.status(), StreamStatus::Stopped);
        assert!(begun.elapsed() < STOP_ACK_TIMEOUT + Duration::from_secs(1));
    }

    #[test]
    fn test_end_to_end_float_user_sint16_device() {
        // User writes interleaved f32; the device is sint16-native, so
        // the engine scales, rounds and clamps on the way out.
        let (backend, driver) = NullBackend::with_device_format(SampleFormat::Sint16);
        let mut stream = Stream::with_backend(Box::new(backend));
        stream
            .open_stream(
                Some(StreamParams::new(0, 2)),
                None,
                SampleFormat::Float32,
                48000,
                1024,
                Box::new(|mut buffers, _frames, _time, _flags| {
                    for (i, sample) in buffers.output_as::<f32>().iter_mut().enumerate() {
                        *sample = ((i % 100) as f32 - 50.0) / 64.0;
                    }
                    CallbackAction::Continue
                }),
                &StreamOptions::default(),
            )
            .unwrap();
        stream.start_stream().unwrap();
        driver.drive_cycle();

        let bytes = driver.output_bytes();
        let device: &[i16] = bytemuck::cast_slice(&bytes);
        assert_eq!(device.len(), 1024 * 2);
        for (i, &sample) in device.iter().enumerate() {
            let user = ((i % 100) as f32 - 50.0) / 64.0;
            let expected = (user as f64 * 32768.0)
                .round()
                .clamp(-32768.0, 32767.0) as i16;
            assert_eq!(sample, expected, "sample {} mismatch", i);
        }

        stream.abort_stream().unwrap();
    }

    #[test]
    fn test_time_advances_with_cycles() {
        let (backend, driver) = NullBackend::new();
        let mut stream = Stream::with_backend(Box::new(backend));
        open_duplex(&mut stream);
        stream.start_stream().unwrap();

        assert_eq!(stream.time(), 0.0);
        for _ in 0..10 {
            driver.drive_cycle();
        }
        // 10 cycles x 256 frames at 48kHz
        let expected = 2560.0 / 48000.0;
        assert!((stream.time() - expected).abs() < 1e-9);

        stream.abort_stream().unwrap();
    }
}
