//! Native JACK audio backend for Linux
//!
//! Connects as a JACK client and services streams through registered
//! audio ports. JACK fixes the sample rate and cycle size server-side
//! and its buffers are planar 32-bit float, so negotiation mostly
//! reports the server's terms back; the stream engine handles any
//! format or layout adaptation the caller asked for.
//!
//! Also works with PipeWire's JACK compatibility layer.

use jack::{AudioIn, AudioOut, Client, ClientOptions, Control, Port, ProcessScope};

use crate::format::{AlignedBuffer, SampleFormat};
use crate::stream::{DriverEndpoint, StreamDirection, StreamError, StreamResult};
use crate::transport::TransportPosition;

use super::{
    check_direction_request, AudioBackend, DeviceInfo, DeviceRequest, NegotiatedDevice, OpenSpec,
};

pub struct JackBackend {
    client_name: String,
    /// Connected but inactive client; consumed on open, restored on
    /// close.
    client: Option<Client>,
    active: Option<jack::AsyncClient<Notifications, Processor>>,
    devices: Vec<DeviceInfo>,
}

impl JackBackend {
    /// Connect to the JACK server without starting it.
    pub fn connect(client_name: &str) -> StreamResult<Self> {
        let (client, _status) = Client::new(client_name, ClientOptions::NO_START_SERVER)
            .map_err(|e| StreamError::Backend(format!("failed to create JACK client: {}", e)))?;
        let actual_name = client.name().to_string();
        log::info!(
            "jack backend: client '{}' connected ({}Hz, {} frames)",
            actual_name,
            client.sample_rate(),
            client.buffer_size()
        );
        Ok(Self {
            client_name: actual_name,
            client: Some(client),
            active: None,
            devices: Vec::new(),
        })
    }

    fn client(&self) -> StreamResult<&Client> {
        match (&self.client, &self.active) {
            (Some(client), _) => Ok(client),
            (None, Some(active)) => Ok(active.as_client()),
            (None, None) => Err(StreamError::Backend("JACK client lost".to_string())),
        }
    }

    /// Snapshot of the JACK transport, for tempo-locked scheduling.
    pub fn transport_position(&self) -> Option<TransportPosition> {
        let client = self.client().ok()?;
        let query = client.transport().query().ok()?;
        let bbt = query.pos.bbt()?;
        Some(TransportPosition {
            frame: query.pos.frame(),
            frame_rate: query
                .pos
                .frame_rate()
                .unwrap_or(client.sample_rate() as u32),
            ticks_per_beat: bbt.ticks_per_beat,
            beats_per_minute: bbt.bpm,
        })
    }
}

impl AudioBackend for JackBackend {
    fn name(&self) -> &'static str {
        "jack"
    }

    fn probe_devices(&mut self) -> bool {
        let client = match self.client() {
            Ok(c) => c,
            Err(e) => {
                log::warn!("jack backend: probe failed: {}", e);
                return false;
            }
        };

        // JACK presents as one device whose channel capacity is the
        // set of physical ports. Our playback side connects to the
        // server's input ports and vice versa.
        let playback_ports = client.ports(
            None,
            Some("32 bit float mono audio"),
            jack::PortFlags::IS_PHYSICAL | jack::PortFlags::IS_INPUT,
        );
        let capture_ports = client.ports(
            None,
            Some("32 bit float mono audio"),
            jack::PortFlags::IS_PHYSICAL | jack::PortFlags::IS_OUTPUT,
        );

        let output_channels = playback_ports.len() as u16;
        let input_channels = capture_ports.len() as u16;
        self.devices = vec![DeviceInfo {
            name: "JACK".to_string(),
            output_channels,
            input_channels,
            duplex_channels: output_channels.min(input_channels),
            is_default_output: true,
            is_default_input: true,
            sample_rates: vec![client.sample_rate() as u32],
            formats: vec![SampleFormat::Float32],
        }];
        output_channels > 0 || input_channels > 0
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
        let client = self.client()?;
        if request.sample_rate != client.sample_rate() as u32 {
            return Err(StreamError::DeviceCapability(format!(
                "JACK server runs at {}Hz, {}Hz requested",
                client.sample_rate(),
                request.sample_rate
            )));
        }
        Ok(NegotiatedDevice {
            total_channels: request.channels + request.first_channel,
            format: SampleFormat::Float32,
            planar: true,
            byte_swap: false,
            latency: client.buffer_size(),
            buffer_frames: client.buffer_size(),
        })
    }

    fn open(&mut self, endpoint: DriverEndpoint, spec: &OpenSpec) -> StreamResult<()> {
        let client = self.client.take().ok_or_else(|| {
            StreamError::Backend("JACK client already active".to_string())
        })?;

        let out_channels = spec.playback.map_or(0, |d| d.negotiated.total_channels) as usize;
        let in_channels = spec.record.map_or(0, |d| d.negotiated.total_channels) as usize;
        let max_frames = spec.buffer_frames as usize;

        let register = |client: &Client, name: String| {
            client
                .register_port(&name, AudioOut::default())
                .map_err(|e| StreamError::StreamBuild(format!("port '{}': {}", name, e)))
        };
        let register_in = |client: &Client, name: String| {
            client
                .register_port(&name, AudioIn::default())
                .map_err(|e| StreamError::StreamBuild(format!("port '{}': {}", name, e)))
        };

        let mut out_ports = Vec::with_capacity(out_channels);
        for ch in 0..out_channels {
            out_ports.push(register(&client, format!("out_{}", ch + 1))?);
        }
        let mut in_ports = Vec::with_capacity(in_channels);
        for ch in 0..in_channels {
            in_ports.push(register_in(&client, format!("in_{}", ch + 1))?);
        }

        let processor = Processor {
            out_ports,
            in_ports,
            out_stage: AlignedBuffer::new(out_channels * max_frames * 4),
            in_stage: AlignedBuffer::new(in_channels * max_frames * 4),
            max_frames,
            endpoint: endpoint.clone(),
        };

        let active = client
            .activate_async(Notifications { endpoint }, processor)
            .map_err(|e| StreamError::StreamBuild(format!("failed to activate: {}", e)))?;

        connect_physical_ports(
            active.as_client(),
            &self.client_name,
            out_channels,
            in_channels,
        );
        self.active = Some(active);
        Ok(())
    }

    // Activation happens at open; start and stop are logical
    // transitions gated inside the driver endpoint, since a JACK
    // client processes for as long as it is active.
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
        if let Some(active) = self.active.take() {
            match active.deactivate() {
                Ok((client, _notifications, _processor)) => {
                    self.client = Some(client);
                }
                Err(e) => log::warn!("jack backend: deactivate failed: {}", e),
            }
        }
    }
}

/// JACK process handler: stage planar buffers, run the engine cycle,
/// copy back out.
struct Processor {
    out_ports: Vec<Port<AudioOut>>,
    in_ports: Vec<Port<AudioIn>>,
    /// Planar f32 staging sized for the largest cycle; channel blocks
    /// are packed at the delivering cycle's frame count, which can
    /// shrink mid-stream under PipeWire.
    out_stage: AlignedBuffer,
    in_stage: AlignedBuffer,
    max_frames: usize,
    endpoint: DriverEndpoint,
}

impl jack::ProcessHandler for Processor {
    fn process(&mut self, _client: &Client, ps: &ProcessScope) -> Control {
        let frames = (ps.n_frames() as usize).min(self.max_frames);

        {
            let stage: &mut [f32] = bytemuck::cast_slice_mut(self.in_stage.as_bytes_mut());
            for (ch, port) in self.in_ports.iter().enumerate() {
                let src = port.as_slice(ps);
                stage[ch * frames..(ch + 1) * frames].copy_from_slice(&src[..frames]);
            }
        }

        let output = if self.out_ports.is_empty() {
            None
        } else {
            Some(self.out_stage.as_bytes_mut())
        };
        let input = if self.in_ports.is_empty() {
            None
        } else {
            Some(self.in_stage.as_bytes())
        };
        self.endpoint.process_cycle(output, input, frames as u32);

        let stage: &[f32] = bytemuck::cast_slice(self.out_stage.as_bytes());
        for (ch, port) in self.out_ports.iter_mut().enumerate() {
            let dst = port.as_mut_slice(ps);
            dst[..frames].copy_from_slice(&stage[ch * frames..(ch + 1) * frames]);
        }

        Control::Continue
    }
}

struct Notifications {
    endpoint: DriverEndpoint,
}

impl jack::NotificationHandler for Notifications {
    fn sample_rate(&mut self, _client: &Client, srate: jack::Frames) -> Control {
        log::info!("jack backend: server sample rate changed to {}", srate);
        Control::Continue
    }

    fn xrun(&mut self, _client: &Client) -> Control {
        self.endpoint.note_output_underflow();
        Control::Continue
    }
}

/// Wire our ports to the physical ports in order. Failures are
/// warnings; the user may prefer to patch manually.
fn connect_physical_ports(
    client: &Client,
    client_name: &str,
    out_channels: usize,
    in_channels: usize,
) {
    let playback = client.ports(
        None,
        Some("32 bit float mono audio"),
        jack::PortFlags::IS_PHYSICAL | jack::PortFlags::IS_INPUT,
    );
    for (ch, target) in playback.iter().take(out_channels).enumerate() {
        let source = format!("{}:out_{}", client_name, ch + 1);
        if let Err(e) = client.connect_ports_by_name(&source, target) {
            log::warn!("jack backend: could not connect {} -> {}: {}", source, target, e);
        }
    }

    let capture = client.ports(
        None,
        Some("32 bit float mono audio"),
        jack::PortFlags::IS_PHYSICAL | jack::PortFlags::IS_OUTPUT,
    );
    for (ch, source) in capture.iter().take(in_channels).enumerate() {
        let target = format!("{}:in_{}", client_name, ch + 1);
        if let Err(e) = client.connect_ports_by_name(source, &target) {
            log::warn!("jack backend: could not connect {} -> {}: {}", source, target, e);
        }
    }
}
