//! CPAL audio backend implementation
//!
//! Services streams through the platform's default CPAL host (ALSA or
//! PipeWire on Linux, WASAPI on Windows, CoreAudio on macOS). Device
//! buffers are interleaved and host-endian; the driver delivers them
//! in the device's native sample type, which the stream engine
//! converts to the user format.
//!
//! Duplex streams run as two independent CPAL streams bridged by a
//! lock-free byte ring: the capture callback pushes raw device bytes,
//! the render callback pops one cycle's worth (silence-padding any
//! shortfall) and runs the full engine cycle. Neither callback ever
//! blocks on the other.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate};

use crate::format::{AlignedBuffer, SampleFormat};
use crate::stream::{DriverEndpoint, StreamDirection, StreamError, StreamResult};

use super::{
    check_direction_request, AudioBackend, DeviceInfo, DeviceRequest, NegotiatedDevice, OpenSpec,
};

pub struct CpalBackend {
    client_name: String,
    host: cpal::Host,
    devices: Vec<DeviceInfo>,
    /// CPAL device handles, parallel to `devices`.
    handles: Vec<cpal::Device>,
    output_stream: Option<cpal::Stream>,
    input_stream: Option<cpal::Stream>,
}

impl CpalBackend {
    pub fn new(client_name: String) -> Self {
        let host = cpal::default_host();
        log::info!(
            "cpal backend: host {:?}, client '{}'",
            host.id(),
            client_name
        );
        Self {
            client_name,
            host,
            devices: Vec::new(),
            handles: Vec::new(),
            output_stream: None,
            input_stream: None,
        }
    }

    fn handle(&self, device: usize) -> StreamResult<&cpal::Device> {
        self.handles.get(device).ok_or(StreamError::DeviceOutOfRange {
            device,
            count: self.handles.len(),
        })
    }
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn probe_devices(&mut self) -> bool {
        self.devices.clear();
        self.handles.clear();

        let default_output_name = self
            .host
            .default_output_device()
            .and_then(|d| d.name().ok());
        let default_input_name = self.host.default_input_device().and_then(|d| d.name().ok());

        let devices = match self.host.devices() {
            Ok(d) => d,
            Err(e) => {
                log::warn!("cpal backend: device enumeration failed: {}", e);
                return false;
            }
        };

        for device in devices {
            let name = match device.name() {
                Ok(n) => n,
                Err(_) => continue,
            };

            let output_configs: Vec<_> = device
                .supported_output_configs()
                .map(|c| c.collect())
                .unwrap_or_default();
            let input_configs: Vec<_> = device
                .supported_input_configs()
                .map(|c| c.collect())
                .unwrap_or_default();
            if output_configs.is_empty() && input_configs.is_empty() {
                continue;
            }

            let output_channels = output_configs.iter().map(|c| c.channels()).max().unwrap_or(0);
            let input_channels = input_configs.iter().map(|c| c.channels()).max().unwrap_or(0);

            let mut sample_rates: Vec<u32> = Vec::new();
            let mut formats: Vec<SampleFormat> = Vec::new();
            for config in output_configs.iter().chain(input_configs.iter()) {
                for rate in [44100, 48000, 88200, 96000, 176400, 192000] {
                    if rate >= config.min_sample_rate().0
                        && rate <= config.max_sample_rate().0
                        && !sample_rates.contains(&rate)
                    {
                        sample_rates.push(rate);
                    }
                }
                if let Some(format) = map_cpal_format(config.sample_format()) {
                    if !formats.contains(&format) {
                        formats.push(format);
                    }
                }
            }
            sample_rates.sort_unstable();

            self.devices.push(DeviceInfo {
                name: name.clone(),
                output_channels,
                input_channels,
                duplex_channels: output_channels.min(input_channels),
                is_default_output: default_output_name.as_ref() == Some(&name),
                is_default_input: default_input_name.as_ref() == Some(&name),
                sample_rates,
                formats,
            });
            self.handles.push(device);
        }

        log::info!("cpal backend: probed {} devices", self.devices.len());
        !self.devices.is_empty()
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
        let info = &self.devices[device];
        check_direction_request(info, direction, request)?;

        // Pick the closest native format the device offers: the
        // requested one if the driver carries it directly, otherwise
        // f32, otherwise whatever comes first. 24-bit is never used
        // device-side; it converts through i32.
        let candidates: Vec<SampleFormat> = info
            .formats
            .iter()
            .copied()
            .filter(|f| *f != SampleFormat::Sint24)
            .collect();
        let format = if candidates.contains(&request.format) {
            request.format
        } else if candidates.contains(&SampleFormat::Float32) {
            SampleFormat::Float32
        } else {
            *candidates.first().ok_or_else(|| {
                StreamError::DeviceCapability(format!(
                    "device '{}' offers no usable sample format",
                    info.name
                ))
            })?
        };

        if !info.sample_rates.contains(&request.sample_rate) {
            return Err(StreamError::DeviceCapability(format!(
                "device '{}' does not support {}Hz (supported: {:?})",
                info.name, request.sample_rate, info.sample_rates
            )));
        }

        Ok(NegotiatedDevice {
            total_channels: request.channels + request.first_channel,
            format,
            planar: false,
            byte_swap: false,
            latency: request.buffer_frames,
            buffer_frames: request.buffer_frames,
        })
    }

    fn open(&mut self, endpoint: DriverEndpoint, spec: &OpenSpec) -> StreamResult<()> {
        log::debug!(
            "cpal backend: opening '{}' @ {}Hz, {} frames",
            self.client_name,
            spec.sample_rate,
            spec.buffer_frames
        );

        match (spec.playback, spec.record) {
            (Some(playback), Some(record)) => {
                // Bridge capture to render with a byte ring sized for a
                // few cycles of jitter between the two driver clocks.
                let in_frame_bytes =
                    record.negotiated.total_channels as usize * record.negotiated.format.bytes();
                let capacity = spec.buffer_frames as usize * in_frame_bytes * 4;
                let (producer, consumer) = rtrb::RingBuffer::<u8>::new(capacity);

                let input_stream = build_capture_push(
                    self.handle(record.device)?,
                    &stream_config(&record.negotiated, spec),
                    record.negotiated.format,
                    endpoint.clone(),
                    producer,
                )?;
                let output_stream = build_duplex_render(
                    self.handle(playback.device)?,
                    &stream_config(&playback.negotiated, spec),
                    playback.negotiated.format,
                    endpoint,
                    consumer,
                    in_frame_bytes,
                    spec.buffer_frames,
                )?;
                self.input_stream = Some(input_stream);
                self.output_stream = Some(output_stream);
            }
            (Some(playback), None) => {
                self.output_stream = Some(build_render(
                    self.handle(playback.device)?,
                    &stream_config(&playback.negotiated, spec),
                    playback.negotiated.format,
                    endpoint,
                )?);
            }
            (None, Some(record)) => {
                self.input_stream = Some(build_capture(
                    self.handle(record.device)?,
                    &stream_config(&record.negotiated, spec),
                    record.negotiated.format,
                    endpoint,
                )?);
            }
            (None, None) => return Err(StreamError::NoStreamParams),
        }
        Ok(())
    }

    fn start(&mut self) -> StreamResult<()> {
        for stream in self.input_stream.iter().chain(self.output_stream.iter()) {
            stream
                .play()
                .map_err(|e| StreamError::StreamControl(e.to_string()))?;
        }
        Ok(())
    }

    fn stop(&mut self) -> StreamResult<()> {
        // CPAL has no drain primitive; the driver's own buffers play
        // out after pause, so stop and abort coincide here.
        for stream in self.input_stream.iter().chain(self.output_stream.iter()) {
            stream
                .pause()
                .map_err(|e| StreamError::StreamControl(e.to_string()))?;
        }
        Ok(())
    }

    fn abort(&mut self) -> StreamResult<()> {
        self.stop()
    }

    fn close(&mut self) {
        self.input_stream = None;
        self.output_stream = None;
    }
}

fn stream_config(negotiated: &NegotiatedDevice, spec: &OpenSpec) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: negotiated.total_channels,
        sample_rate: SampleRate(spec.sample_rate),
        buffer_size: BufferSize::Fixed(spec.buffer_frames),
    }
}

fn map_cpal_format(format: cpal::SampleFormat) -> Option<SampleFormat> {
    match format {
        cpal::SampleFormat::I8 => Some(SampleFormat::Sint8),
        cpal::SampleFormat::I16 => Some(SampleFormat::Sint16),
        cpal::SampleFormat::I32 => Some(SampleFormat::Sint32),
        cpal::SampleFormat::F32 => Some(SampleFormat::Float32),
        cpal::SampleFormat::F64 => Some(SampleFormat::Float64),
        _ => None,
    }
}

/// Expand a format-generic builder over the five device-native sample
/// carriers.
macro_rules! dispatch_format {
    ($format:expr, $builder:ident ( $($arg:expr),* )) => {
        match $format {
            SampleFormat::Sint8 => $builder::<i8>($($arg),*),
            SampleFormat::Sint16 => $builder::<i16>($($arg),*),
            SampleFormat::Sint32 => $builder::<i32>($($arg),*),
            SampleFormat::Float32 => $builder::<f32>($($arg),*),
            SampleFormat::Float64 => $builder::<f64>($($arg),*),
            SampleFormat::Sint24 => Err(StreamError::StreamBuild(
                "24-bit device buffers are not supported by this driver".to_string(),
            )),
        }
    };
}

fn build_render(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    format: SampleFormat,
    endpoint: DriverEndpoint,
) -> StreamResult<cpal::Stream> {
    dispatch_format!(format, build_render_typed(device, config, endpoint))
}

fn build_render_typed<T: cpal::SizedSample + bytemuck::Pod>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    endpoint: DriverEndpoint,
) -> StreamResult<cpal::Stream> {
    let channels = config.channels as usize;
    let error_endpoint = endpoint.clone();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info: &cpal::OutputCallbackInfo| {
                let frames = (data.len() / channels) as u32;
                endpoint.process_cycle(Some(bytemuck::cast_slice_mut(data)), None, frames);
            },
            move |err| {
                log::error!("cpal render stream error: {}", err);
                error_endpoint.note_output_underflow();
            },
            None,
        )
        .map_err(|e| StreamError::StreamBuild(e.to_string()))
}

fn build_capture(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    format: SampleFormat,
    endpoint: DriverEndpoint,
) -> StreamResult<cpal::Stream> {
    dispatch_format!(format, build_capture_typed(device, config, endpoint))
}

fn build_capture_typed<T: cpal::SizedSample + bytemuck::Pod>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    endpoint: DriverEndpoint,
) -> StreamResult<cpal::Stream> {
    let channels = config.channels as usize;
    let error_endpoint = endpoint.clone();
    device
        .build_input_stream(
            config,
            move |data: &[T], _info: &cpal::InputCallbackInfo| {
                let frames = (data.len() / channels) as u32;
                endpoint.process_cycle(None, Some(bytemuck::cast_slice(data)), frames);
            },
            move |err| {
                log::error!("cpal capture stream error: {}", err);
                error_endpoint.note_input_overflow();
            },
            None,
        )
        .map_err(|e| StreamError::StreamBuild(e.to_string()))
}

/// Capture half of a duplex stream: push raw device bytes into the
/// bridge ring. On a full ring the remainder of the cycle is dropped
/// and counted as an overflow.
fn build_capture_push(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    format: SampleFormat,
    endpoint: DriverEndpoint,
    producer: rtrb::Producer<u8>,
) -> StreamResult<cpal::Stream> {
    dispatch_format!(
        format,
        build_capture_push_typed(device, config, endpoint, producer)
    )
}

fn build_capture_push_typed<T: cpal::SizedSample + bytemuck::Pod>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    endpoint: DriverEndpoint,
    mut producer: rtrb::Producer<u8>,
) -> StreamResult<cpal::Stream> {
    let error_endpoint = endpoint.clone();
    device
        .build_input_stream(
            config,
            move |data: &[T], _info: &cpal::InputCallbackInfo| {
                let bytes: &[u8] = bytemuck::cast_slice(data);
                for &byte in bytes {
                    if producer.push(byte).is_err() {
                        endpoint.note_input_overflow();
                        break;
                    }
                }
            },
            move |err| {
                log::error!("cpal capture stream error: {}", err);
                error_endpoint.note_input_overflow();
            },
            None,
        )
        .map_err(|e| StreamError::StreamBuild(e.to_string()))
}

/// Render half of a duplex stream: pop one cycle of capture bytes from
/// the bridge ring (padding any shortfall with silence) and run the
/// engine cycle against both buffers.
fn build_duplex_render(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    format: SampleFormat,
    endpoint: DriverEndpoint,
    consumer: rtrb::Consumer<u8>,
    in_frame_bytes: usize,
    max_frames: u32,
) -> StreamResult<cpal::Stream> {
    dispatch_format!(
        format,
        build_duplex_render_typed(device, config, endpoint, consumer, in_frame_bytes, max_frames)
    )
}

fn build_duplex_render_typed<T: cpal::SizedSample + bytemuck::Pod>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    endpoint: DriverEndpoint,
    mut consumer: rtrb::Consumer<u8>,
    in_frame_bytes: usize,
    max_frames: u32,
) -> StreamResult<cpal::Stream> {
    let channels = config.channels as usize;
    let mut staging = AlignedBuffer::new(max_frames as usize * in_frame_bytes);
    let error_endpoint = endpoint.clone();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info: &cpal::OutputCallbackInfo| {
                let frames = (data.len() / channels).min(max_frames as usize);
                let needed = frames * in_frame_bytes;
                {
                    let stage = &mut staging.as_bytes_mut()[..needed];
                    let mut have = 0;
                    while have < needed {
                        match consumer.pop() {
                            Ok(byte) => {
                                stage[have] = byte;
                                have += 1;
                            }
                            Err(_) => break,
                        }
                    }
                    // Shortfall at startup is normal while the capture
                    // clock spins up; pad with silence.
                    stage[have..].fill(0);
                }
                data[frames * channels..].fill(T::EQUILIBRIUM);
                endpoint.process_cycle(
                    Some(bytemuck::cast_slice_mut(&mut data[..frames * channels])),
                    Some(&staging.as_bytes()[..needed]),
                    frames as u32,
                );
            },
            move |err| {
                log::error!("cpal render stream error: {}", err);
                error_endpoint.note_output_underflow();
            },
            None,
        )
        .map_err(|e| StreamError::StreamBuild(e.to_string()))
}
