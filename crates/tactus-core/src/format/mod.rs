//! Sample format description and conversion geometry
//!
//! A stream negotiates a user-side representation and a device-side
//! representation for each direction; whenever the two differ in
//! encoding, channel count, interleaving, or first-channel offset, a
//! [`ConvertInfo`] describes how to walk both buffers so a single
//! conversion loop can translate between them. The conversion loops
//! themselves live in [`convert`].

mod convert;

pub use convert::{byte_swap_buffer, clear_buffer, convert_buffer, AlignedBuffer};

use serde::{Deserialize, Serialize};

/// The six supported sample encodings.
///
/// `Sint24` is carried in the low three bytes of an `i32` slot, so its
/// in-memory width is four bytes while its full-scale magnitude is
/// 2^23.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    Sint8,
    Sint16,
    Sint24,
    Sint32,
    Float32,
    Float64,
}

impl SampleFormat {
    /// All encodings, in widening order.
    pub const ALL: [SampleFormat; 6] = [
        SampleFormat::Sint8,
        SampleFormat::Sint16,
        SampleFormat::Sint24,
        SampleFormat::Sint32,
        SampleFormat::Float32,
        SampleFormat::Float64,
    ];

    /// In-memory width of one sample, in bytes.
    pub fn bytes(self) -> usize {
        match self {
            SampleFormat::Sint8 => 1,
            SampleFormat::Sint16 => 2,
            SampleFormat::Sint24 | SampleFormat::Sint32 | SampleFormat::Float32 => 4,
            SampleFormat::Float64 => 8,
        }
    }

    /// Full-scale magnitude used for integer<->float normalization.
    pub fn full_scale(self) -> f64 {
        match self {
            SampleFormat::Sint8 => 128.0,
            SampleFormat::Sint16 => 32768.0,
            SampleFormat::Sint24 => 8_388_608.0,
            SampleFormat::Sint32 => 2_147_483_648.0,
            SampleFormat::Float32 | SampleFormat::Float64 => 1.0,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, SampleFormat::Float32 | SampleFormat::Float64)
    }
}

impl std::fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SampleFormat::Sint8 => "sint8",
            SampleFormat::Sint16 => "sint16",
            SampleFormat::Sint24 => "sint24",
            SampleFormat::Sint32 => "sint32",
            SampleFormat::Float32 => "float32",
            SampleFormat::Float64 => "float64",
        };
        f.write_str(name)
    }
}

/// Layout of one side of a conversion: how samples of `format` are
/// arranged in a (possibly shared) buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferGeometry {
    /// Logical channels this stream direction carries.
    pub channels: u16,
    /// Total channels present in the physical buffer. Exceeds
    /// `first_channel + channels` when other logical ports share the
    /// same device buffer.
    pub total_channels: u16,
    /// Index of our first channel within the physical buffer.
    pub first_channel: u16,
    pub format: SampleFormat,
    /// Planar (per-channel blocks) vs. interleaved frames.
    pub planar: bool,
}

impl BufferGeometry {
    /// A private buffer: all channels ours, no offset.
    pub fn packed(channels: u16, format: SampleFormat, planar: bool) -> Self {
        Self {
            channels,
            total_channels: channels,
            first_channel: 0,
            format,
            planar,
        }
    }
}

/// Per-direction conversion descriptor.
///
/// Rebuilt whenever stream geometry changes; never persisted. The
/// offset tables map logical channel index to a channel slot, and
/// `in_jump`/`out_jump` advance the frame base (1 for planar buffers,
/// the total channel count for interleaved ones). Planar sides scale
/// their slots by the delivering cycle's frame count at conversion
/// time, so cycles shorter than the opened size stay in bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertInfo {
    pub channels: u16,
    pub in_jump: usize,
    pub out_jump: usize,
    pub in_planar: bool,
    pub out_planar: bool,
    pub in_format: SampleFormat,
    pub out_format: SampleFormat,
    pub in_offset: Vec<usize>,
    pub out_offset: Vec<usize>,
}

impl ConvertInfo {
    /// Build the descriptor for converting from `input` layout into
    /// `output` layout. Only the overlapping channel set is converted.
    pub fn new(input: &BufferGeometry, output: &BufferGeometry) -> Self {
        let channels = input.channels.min(output.channels);

        let (in_jump, in_offset) = Self::side(input, channels);
        let (out_jump, out_offset) = Self::side(output, channels);

        Self {
            channels,
            in_jump,
            out_jump,
            in_planar: input.planar,
            out_planar: output.planar,
            in_format: input.format,
            out_format: output.format,
            in_offset,
            out_offset,
        }
    }

    fn side(geom: &BufferGeometry, channels: u16) -> (usize, Vec<usize>) {
        let first = geom.first_channel as usize;
        let offsets = (0..channels as usize).map(|k| first + k).collect();
        if geom.planar {
            // Channel blocks are contiguous; step one sample per frame.
            (1, offsets)
        } else {
            (geom.total_channels as usize, offsets)
        }
    }

    /// Whether applying this descriptor is a plain same-layout copy.
    pub fn is_identity(&self) -> bool {
        self.in_format == self.out_format
            && self.in_planar == self.out_planar
            && self.in_jump == self.out_jump
            && self.in_offset == self.out_offset
    }
}
