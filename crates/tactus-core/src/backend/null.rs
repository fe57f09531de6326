//! Virtual loopback backend
//!
//! Presents a single full-duplex device whose callback cycles are
//! driven explicitly through a [`NullDriver`] handle instead of by a
//! hardware clock. Capture bytes are whatever the driver handle last
//! injected; rendered bytes can be read back after each cycle. Used
//! for headless operation and as the test double for the stream
//! lifecycle.

use std::sync::{Arc, Mutex};

use crate::format::{AlignedBuffer, SampleFormat};
use crate::stream::{DriverEndpoint, StreamDirection, StreamResult};

use super::{
    check_direction_request, AudioBackend, DeviceInfo, DeviceRequest, NegotiatedDevice, OpenSpec,
};

struct NullInner {
    endpoint: Option<DriverEndpoint>,
    buffer_frames: u32,
    output: AlignedBuffer,
    input: AlignedBuffer,
}

/// Loopback backend half; plug into
/// [`Stream::with_backend`](crate::stream::Stream::with_backend).
pub struct NullBackend {
    inner: Arc<Mutex<NullInner>>,
    devices: Vec<DeviceInfo>,
    /// Forced device-native format; None mirrors the request.
    device_format: Option<SampleFormat>,
}

/// Driver half; each [`drive_cycle`](NullDriver::drive_cycle) call
/// stands in for one hardware interrupt.
#[derive(Clone)]
pub struct NullDriver {
    inner: Arc<Mutex<NullInner>>,
}

impl NullBackend {
    pub fn new() -> (NullBackend, NullDriver) {
        let inner = Arc::new(Mutex::new(NullInner {
            endpoint: None,
            buffer_frames: 0,
            output: AlignedBuffer::new(0),
            input: AlignedBuffer::new(0),
        }));
        let backend = NullBackend {
            inner: Arc::clone(&inner),
            devices: Vec::new(),
            device_format: None,
        };
        (backend, NullDriver { inner })
    }

    /// Loopback whose device buffers use `format` natively, so the
    /// engine's conversion path is exercised.
    pub fn with_device_format(format: SampleFormat) -> (NullBackend, NullDriver) {
        let (mut backend, driver) = Self::new();
        backend.device_format = Some(format);
        (backend, driver)
    }
}

impl AudioBackend for NullBackend {
    fn name(&self) -> &'static str {
        "null"
    }

    fn probe_devices(&mut self) -> bool {
        self.devices = vec![DeviceInfo {
            name: "null loopback".to_string(),
            output_channels: 8,
            input_channels: 8,
            duplex_channels: 8,
            is_default_output: true,
            is_default_input: true,
            sample_rates: vec![44100, 48000, 96000],
            formats: SampleFormat::ALL.to_vec(),
        }];
        true
    }

    fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    fn probe_device_open(
        &mut self,
        device: usize,
        direction: StreamDirection,
        request: &DeviceRequest,
    ) -> StreamResult<NegotiatedDevice> {
        check_direction_request(&self.devices[device], direction, request)?;
        Ok(NegotiatedDevice {
            total_channels: request.channels + request.first_channel,
            format: self.device_format.unwrap_or(request.format),
            planar: false,
            byte_swap: false,
            latency: request.buffer_frames,
            buffer_frames: request.buffer_frames,
        })
    }

    fn open(&mut self, endpoint: DriverEndpoint, spec: &OpenSpec) -> StreamResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let frames = spec.buffer_frames as usize;
        let direction_bytes = |d: &super::DirectionSpec| {
            frames * d.negotiated.total_channels as usize * d.negotiated.format.bytes()
        };
        inner.output =
            AlignedBuffer::new(spec.playback.as_ref().map_or(0, &direction_bytes));
        inner.input = AlignedBuffer::new(spec.record.as_ref().map_or(0, &direction_bytes));
        inner.buffer_frames = spec.buffer_frames;
        inner.endpoint = Some(endpoint);
        Ok(())
    }

    fn start(&mut self) -> StreamResult<()> {
        Ok(())
    }

    fn stop(&mut self) -> StreamResult<()> {
        Ok(())
    }

    fn abort(&mut self) -> StreamResult<()> {
        Ok(())
    }

    fn close(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        inner.endpoint = None;
        inner.output = AlignedBuffer::new(0);
        inner.input = AlignedBuffer::new(0);
    }
}

impl NullDriver {
    /// Run one callback cycle, as a hardware clock would.
    ///
    /// A no-op while no stream is open. Outside the running state the
    /// output buffer comes back silent, matching real drivers.
    pub fn drive_cycle(&self) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let endpoint = match &inner.endpoint {
            Some(e) => e.clone(),
            None => return,
        };
        let frames = inner.buffer_frames;
        let has_input = !inner.input.is_empty();
        let output = if inner.output.is_empty() {
            None
        } else {
            Some(inner.output.as_bytes_mut())
        };
        let input = if has_input {
            Some(inner.input.as_bytes())
        } else {
            None
        };
        endpoint.process_cycle(output, input, frames);
    }

    /// Inject capture bytes for subsequent cycles.
    pub fn set_input_bytes(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let n = inner.input.len().min(bytes.len());
        inner.input.as_bytes_mut()[..n].copy_from_slice(&bytes[..n]);
    }

    /// Read back the bytes rendered by the last cycle.
    pub fn output_bytes(&self) -> Vec<u8> {
        self.inner.lock().unwrap().output.as_bytes().to_vec()
    }
}
