//! Per-cycle stream engine
//!
//! [`CycleEngine`] owns the user-format staging buffers and runs one
//! callback cycle: device capture -> format conversion -> user
//! callback -> format conversion -> device playback. It is driven
//! through a [`DriverEndpoint`] handed to the backend at open time.
//!
//! The driver side never blocks: the engine mutex is only contended
//! while the application thread reconfigures the stream, and in that
//! case the cycle degrades to silence instead of waiting.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::format::{
    byte_swap_buffer, clear_buffer, convert_buffer, AlignedBuffer, ConvertInfo, SampleFormat,
};

use super::{CallbackAction, CycleBuffers, StreamCallback, StreamStatus, StreamStatusFlags};

/// Resolved geometry for one open direction.
pub(crate) struct DirectionState {
    /// Index into the probed device list.
    #[allow(dead_code)]
    pub device: usize,
    pub user_channels: u16,
    /// Total channels in the device buffer (may exceed ours).
    pub total_channels: u16,
    pub user_format: SampleFormat,
    pub device_format: SampleFormat,
    pub byte_swap: bool,
    pub latency: u32,
    /// None when user and device layouts are byte-identical.
    pub convert: Option<ConvertInfo>,
    /// Zero the device buffer before converting into it, so channels
    /// with no corresponding input never carry stale samples.
    pub clear_first: bool,
}

impl DirectionState {
    pub fn user_frame_bytes(&self) -> usize {
        self.user_channels as usize * self.user_format.bytes()
    }

    pub fn device_frame_bytes(&self) -> usize {
        self.total_channels as usize * self.device_format.bytes()
    }
}

/// State shared between the application thread and driver callbacks.
pub(crate) struct StreamShared {
    status: AtomicU8,
    frames: AtomicU64,
    input_overflows: AtomicU64,
    output_underflows: AtomicU64,
    pending_overflow: AtomicBool,
    pending_underflow: AtomicBool,
    stop_requested: AtomicBool,
    ack: Mutex<bool>,
    ack_cv: Condvar,
}

impl StreamShared {
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(StreamStatus::Closed as u8),
            frames: AtomicU64::new(0),
            input_overflows: AtomicU64::new(0),
            output_underflows: AtomicU64::new(0),
            pending_overflow: AtomicBool::new(false),
            pending_underflow: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            ack: Mutex::new(false),
            ack_cv: Condvar::new(),
        }
    }

    pub fn status(&self) -> StreamStatus {
        StreamStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: StreamStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn add_frames(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn reset_frames(&self) {
        self.frames.store(0, Ordering::Relaxed);
    }

    pub fn input_overflows(&self) -> u64 {
        self.input_overflows.load(Ordering::Relaxed)
    }

    pub fn output_underflows(&self) -> u64 {
        self.output_underflows.load(Ordering::Relaxed)
    }

    pub fn note_input_overflow(&self) {
        self.input_overflows.fetch_add(1, Ordering::Relaxed);
        self.pending_overflow.store(true, Ordering::Release);
    }

    pub fn note_output_underflow(&self) {
        self.output_underflows.fetch_add(1, Ordering::Relaxed);
        self.pending_underflow.store(true, Ordering::Release);
    }

    fn take_flags(&self) -> StreamStatusFlags {
        StreamStatusFlags {
            input_overflow: self.pending_overflow.swap(false, Ordering::AcqRel),
            output_underflow: self.pending_underflow.swap(false, Ordering::AcqRel),
        }
    }

    /// Phase one of the teardown handshake: ask the driver to stop.
    pub fn begin_stop(&self) {
        *self.ack.lock().unwrap() = false;
        self.stop_requested.store(true, Ordering::Release);
    }

    pub fn clear_stop(&self) {
        self.stop_requested.store(false, Ordering::Release);
        *self.ack.lock().unwrap() = false;
    }

    /// Phase two: wait (bounded) for the driver thread to acknowledge.
    /// Returns false on timeout, after which teardown proceeds anyway.
    pub fn wait_ack(&self, timeout: Duration) -> bool {
        let guard = self.ack.lock().unwrap();
        let (guard, result) = self
            .ack_cv
            .wait_timeout_while(guard, timeout, |acked| !*acked)
            .unwrap();
        drop(guard);
        !result.timed_out()
    }

    /// Driver side of the handshake, called at every cycle entry.
    pub fn acknowledge_stop_if_requested(&self) {
        if self.stop_requested.load(Ordering::Acquire) {
            let mut acked = self.ack.lock().unwrap();
            *acked = true;
            self.ack_cv.notify_all();
        }
    }
}

/// Owns the user staging buffers and runs one cycle.
pub(crate) struct CycleEngine {
    callback: StreamCallback,
    playback: Option<DirectionState>,
    record: Option<DirectionState>,
    user_out: AlignedBuffer,
    user_in: AlignedBuffer,
    /// Staging for byte-swapped capture data.
    swap_in: AlignedBuffer,
    buffer_frames: u32,
    sample_rate: u32,
}

impl CycleEngine {
    pub fn new(
        callback: StreamCallback,
        playback: Option<DirectionState>,
        record: Option<DirectionState>,
        buffer_frames: u32,
        sample_rate: u32,
    ) -> Self {
        let out_bytes = playback
            .as_ref()
            .map_or(0, |d| d.user_frame_bytes() * buffer_frames as usize);
        let in_bytes = record
            .as_ref()
            .map_or(0, |d| d.user_frame_bytes() * buffer_frames as usize);
        let swap_bytes = record
            .as_ref()
            .filter(|d| d.byte_swap)
            .map_or(0, |d| d.device_frame_bytes() * buffer_frames as usize);

        Self {
            callback,
            playback,
            record,
            user_out: AlignedBuffer::new(out_bytes),
            user_in: AlignedBuffer::new(in_bytes),
            swap_in: AlignedBuffer::new(swap_bytes),
            buffer_frames,
            sample_rate,
        }
    }

    /// Run one callback cycle. All buffers were sized at open time;
    /// nothing here allocates.
    pub fn process_cycle(
        &mut self,
        device_out: Option<&mut [u8]>,
        device_in: Option<&[u8]>,
        frames: u32,
        shared: &StreamShared,
    ) -> CallbackAction {
        let frames = frames.min(self.buffer_frames) as usize;
        let flags = shared.take_flags();
        let stream_time = shared.frames() as f64 / self.sample_rate as f64;

        // Capture: device format -> user format.
        if let (Some(dir), Some(dev_in)) = (&self.record, device_in) {
            let dev_bytes = frames * dir.device_frame_bytes();
            let user_bytes = frames * dir.user_frame_bytes();
            let src = if dir.byte_swap {
                let stage = &mut self.swap_in.as_bytes_mut()[..dev_bytes];
                stage.copy_from_slice(&dev_in[..dev_bytes]);
                byte_swap_buffer(stage, dir.device_format);
                &self.swap_in.as_bytes()[..dev_bytes]
            } else {
                &dev_in[..dev_bytes]
            };

            match &dir.convert {
                Some(info) => {
                    convert_buffer(self.user_in.as_bytes_mut(), src, frames, info);
                }
                None => self.user_in.as_bytes_mut()[..user_bytes].copy_from_slice(src),
            }
        }

        // User callback on user-format buffers.
        let out_bytes = self
            .playback
            .as_ref()
            .map_or(0, |d| frames * d.user_frame_bytes());
        let in_bytes = self
            .record
            .as_ref()
            .map_or(0, |d| frames * d.user_frame_bytes());
        let action = (self.callback)(
            CycleBuffers {
                output: &mut self.user_out.as_bytes_mut()[..out_bytes],
                input: &self.user_in.as_bytes()[..in_bytes],
            },
            frames as u32,
            stream_time,
            flags,
        );

        // Playback: user format -> device format.
        if let (Some(dir), Some(dev_out)) = (&self.playback, device_out) {
            let dev_bytes = frames * dir.device_frame_bytes();
            let dev_out = &mut dev_out[..dev_bytes];
            match &dir.convert {
                Some(info) => {
                    if dir.clear_first {
                        clear_buffer(dev_out);
                    }
                    convert_buffer(dev_out, self.user_out.as_bytes(), frames, info);
                }
                None => dev_out.copy_from_slice(&self.user_out.as_bytes()[..dev_bytes]),
            }
            if dir.byte_swap {
                byte_swap_buffer(dev_out, dir.device_format);
            }
        }

        shared.add_frames(frames as u64);
        action
    }

    pub fn latency(&self) -> u32 {
        self.playback.as_ref().map_or(0, |d| d.latency)
            + self.record.as_ref().map_or(0, |d| d.latency)
    }
}

/// Handle the backend's driver callbacks use to run cycles.
///
/// Clonable so duplex backends can share it between their capture and
/// render callbacks.
#[derive(Clone)]
pub struct DriverEndpoint {
    pub(crate) engine: Arc<Mutex<CycleEngine>>,
    pub(crate) shared: Arc<StreamShared>,
}

impl DriverEndpoint {
    /// Run one cycle from the driver thread.
    ///
    /// Outside the `Running` state, or while the application thread
    /// briefly holds the engine for reconfiguration, the cycle outputs
    /// silence instead of blocking.
    pub fn process_cycle(
        &self,
        device_out: Option<&mut [u8]>,
        device_in: Option<&[u8]>,
        frames: u32,
    ) {
        self.shared.acknowledge_stop_if_requested();

        if self.shared.status() != StreamStatus::Running {
            if let Some(out) = device_out {
                out.fill(0);
            }
            return;
        }

        let mut engine = match self.engine.try_lock() {
            Ok(engine) => engine,
            Err(_) => {
                if let Some(out) = device_out {
                    out.fill(0);
                }
                return;
            }
        };

        match engine.process_cycle(device_out, device_in, frames, &self.shared) {
            CallbackAction::Continue => {}
            CallbackAction::Stop | CallbackAction::Abort => {
                // The stream drains silence until the application
                // completes the transition with stop/abort/close.
                self.shared.set_status(StreamStatus::Stopping);
            }
        }
    }

    /// Record a capture-side overflow reported by the driver.
    pub fn note_input_overflow(&self) {
        self.shared.note_input_overflow();
    }

    /// Record a render-side underflow reported by the driver.
    pub fn note_output_underflow(&self) {
        self.shared.note_output_underflow();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::format::BufferGeometry;

    fn direction(input: &BufferGeometry, output: &BufferGeometry) -> DirectionState {
        let device = if input.planar { input } else { output };
        DirectionState {
            device: 0,
            user_channels: input.channels.min(output.channels),
            total_channels: device.total_channels,
            user_format: if input.planar { output.format } else { input.format },
            device_format: device.format,
            byte_swap: false,
            latency: 0,
            convert: Some(ConvertInfo::new(input, output)),
            clear_first: false,
        }
    }

    // JACK and PipeWire can deliver cycles shorter than the opened
    // size; planar geometry must track the delivering cycle's frame
    // count, not the opened one.
    #[test]
    fn test_planar_capture_short_cycle_stays_in_bounds() {
        const BUFFER_FRAMES: u32 = 512;
        const FRAMES: usize = 100;

        let device = BufferGeometry::packed(2, SampleFormat::Float32, true);
        let user = BufferGeometry::packed(2, SampleFormat::Float32, false);
        let seen = Arc::new(Mutex::new(Vec::<f32>::new()));
        let sink = Arc::clone(&seen);
        let callback: StreamCallback = Box::new(move |buffers, frames, _time, _flags| {
            assert_eq!(frames as usize, FRAMES);
            sink.lock().unwrap().extend_from_slice(buffers.input_as::<f32>());
            CallbackAction::Continue
        });
        let mut engine = CycleEngine::new(
            callback,
            None,
            Some(direction(&device, &user)),
            BUFFER_FRAMES,
            48000,
        );
        let shared = StreamShared::new();

        // One tightly packed block per channel, sized for this cycle.
        let mut capture = AlignedBuffer::new(FRAMES * 2 * 4);
        {
            let samples: &mut [f32] = bytemuck::cast_slice_mut(capture.as_bytes_mut());
            for f in 0..FRAMES {
                samples[f] = f as f32;
                samples[FRAMES + f] = -(f as f32);
            }
        }
        engine.process_cycle(None, Some(capture.as_bytes()), FRAMES as u32, &shared);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), FRAMES * 2);
        for f in 0..FRAMES {
            assert_eq!(seen[f * 2], f as f32);
            assert_eq!(seen[f * 2 + 1], -(f as f32));
        }
    }

    #[test]
    fn test_planar_playback_short_cycle_writes_tight_blocks() {
        const BUFFER_FRAMES: u32 = 256;
        const FRAMES: usize = 64;

        let user = BufferGeometry::packed(2, SampleFormat::Float32, false);
        let device = BufferGeometry::packed(2, SampleFormat::Float32, true);
        let callback: StreamCallback = Box::new(|mut buffers, frames, _time, _flags| {
            let samples = buffers.output_as::<f32>();
            for f in 0..frames as usize {
                samples[f * 2] = f as f32;
                samples[f * 2 + 1] = -(f as f32);
            }
            CallbackAction::Continue
        });
        let mut engine = CycleEngine::new(
            callback,
            Some(direction(&user, &device)),
            None,
            BUFFER_FRAMES,
            48000,
        );
        let shared = StreamShared::new();

        let mut render = AlignedBuffer::new(FRAMES * 2 * 4);
        engine.process_cycle(Some(render.as_bytes_mut()), None, FRAMES as u32, &shared);

        let out: &[f32] = bytemuck::cast_slice(render.as_bytes());
        for f in 0..FRAMES {
            assert_eq!(out[f], f as f32);
            assert_eq!(out[FRAMES + f], -(f as f32));
        }
    }
}
