//! Sample conversion loops
//!
//! One strongly-typed loop per (source, destination) format pair,
//! selected by an exhaustive match. The compiler guarantees every
//! pair of the six encodings has exactly one path; there is no way to
//! configure a pair that silently converts nothing.
//!
//! Conversion rules:
//! - integer -> float divides by the source full-scale magnitude
//! - float -> integer multiplies by the destination full scale,
//!   rounds to nearest, and clamps to the representable range
//! - integer -> integer shifts by the bit-width difference, so
//!   widening is exact and narrowing truncates low-order bits
//!
//! All loops walk both buffers through the [`ConvertInfo`] offset
//! tables and jumps, so interleave adaptation and channel-offset
//! compensation fall out of the same code path. No loop allocates;
//! all are safe to run inside a driver callback.

use bytemuck::Pod;

use super::{ConvertInfo, SampleFormat};

/// Byte buffer backed by u64 storage, so slices of it can be cast to
/// any of the six sample carriers without alignment faults.
pub struct AlignedBuffer {
    storage: Vec<u64>,
    len: usize,
}

impl AlignedBuffer {
    /// Allocate `len` zeroed bytes.
    pub fn new(len: usize) -> Self {
        Self {
            storage: vec![0u64; len.div_ceil(8)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.storage)[..self.len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.storage)[..self.len]
    }

    /// Zero the whole buffer.
    pub fn clear(&mut self) {
        self.storage.fill(0);
    }
}

/// Convert `frames` frames from `input` into `out` according to
/// `info`.
///
/// Both slices must be sized for their side's geometry (frames x jump
/// samples, or frames x channels for planar sides) and aligned for
/// their sample width; buffers allocated through [`AlignedBuffer`] or
/// borrowed from typed device slices always are.
pub fn convert_buffer(out: &mut [u8], input: &[u8], frames: usize, info: &ConvertInfo) {
    use SampleFormat::*;

    match (info.in_format, info.out_format) {
        // From sint8
        (Sint8, Sint8) => map::<i8, i8>(out, input, frames, info, |s| s),
        (Sint8, Sint16) => map::<i8, i16>(out, input, frames, info, |s| (s as i16) << 8),
        (Sint8, Sint24) => map::<i8, i32>(out, input, frames, info, |s| (s as i32) << 16),
        (Sint8, Sint32) => map::<i8, i32>(out, input, frames, info, |s| (s as i32) << 24),
        (Sint8, Float32) => map::<i8, f32>(out, input, frames, info, |s| s as f32 / 128.0),
        (Sint8, Float64) => map::<i8, f64>(out, input, frames, info, |s| s as f64 / 128.0),

        // From sint16
        (Sint16, Sint8) => map::<i16, i8>(out, input, frames, info, |s| (s >> 8) as i8),
        (Sint16, Sint16) => map::<i16, i16>(out, input, frames, info, |s| s),
        (Sint16, Sint24) => map::<i16, i32>(out, input, frames, info, |s| (s as i32) << 8),
        (Sint16, Sint32) => map::<i16, i32>(out, input, frames, info, |s| (s as i32) << 16),
        (Sint16, Float32) => map::<i16, f32>(out, input, frames, info, |s| s as f32 / 32768.0),
        (Sint16, Float64) => map::<i16, f64>(out, input, frames, info, |s| s as f64 / 32768.0),

        // From sint24 (carried in i32)
        (Sint24, Sint8) => map::<i32, i8>(out, input, frames, info, |s| (s >> 16) as i8),
        (Sint24, Sint16) => map::<i32, i16>(out, input, frames, info, |s| (s >> 8) as i16),
        (Sint24, Sint24) => map::<i32, i32>(out, input, frames, info, |s| s),
        (Sint24, Sint32) => map::<i32, i32>(out, input, frames, info, |s| s << 8),
        (Sint24, Float32) => {
            map::<i32, f32>(out, input, frames, info, |s| (s as f64 / 8_388_608.0) as f32)
        }
        (Sint24, Float64) => map::<i32, f64>(out, input, frames, info, |s| s as f64 / 8_388_608.0),

        // From sint32
        (Sint32, Sint8) => map::<i32, i8>(out, input, frames, info, |s| (s >> 24) as i8),
        (Sint32, Sint16) => map::<i32, i16>(out, input, frames, info, |s| (s >> 16) as i16),
        (Sint32, Sint24) => map::<i32, i32>(out, input, frames, info, |s| s >> 8),
        (Sint32, Sint32) => map::<i32, i32>(out, input, frames, info, |s| s),
        (Sint32, Float32) => map::<i32, f32>(out, input, frames, info, |s| {
            (s as f64 / 2_147_483_648.0) as f32
        }),
        (Sint32, Float64) => {
            map::<i32, f64>(out, input, frames, info, |s| s as f64 / 2_147_483_648.0)
        }

        // From float32
        (Float32, Sint8) => {
            map::<f32, i8>(out, input, frames, info, |s| scale_clamp(s as f64, 128.0) as i8)
        }
        (Float32, Sint16) => map::<f32, i16>(out, input, frames, info, |s| {
            scale_clamp(s as f64, 32768.0) as i16
        }),
        (Float32, Sint24) => map::<f32, i32>(out, input, frames, info, |s| {
            scale_clamp(s as f64, 8_388_608.0) as i32
        }),
        (Float32, Sint32) => map::<f32, i32>(out, input, frames, info, |s| {
            scale_clamp(s as f64, 2_147_483_648.0) as i32
        }),
        (Float32, Float32) => map::<f32, f32>(out, input, frames, info, |s| s),
        (Float32, Float64) => map::<f32, f64>(out, input, frames, info, |s| s as f64),

        // From float64
        (Float64, Sint8) => {
            map::<f64, i8>(out, input, frames, info, |s| scale_clamp(s, 128.0) as i8)
        }
        (Float64, Sint16) => {
            map::<f64, i16>(out, input, frames, info, |s| scale_clamp(s, 32768.0) as i16)
        }
        (Float64, Sint24) => {
            map::<f64, i32>(out, input, frames, info, |s| scale_clamp(s, 8_388_608.0) as i32)
        }
        (Float64, Sint32) => map::<f64, i32>(out, input, frames, info, |s| {
            scale_clamp(s, 2_147_483_648.0) as i32
        }),
        (Float64, Float32) => map::<f64, f32>(out, input, frames, info, |s| s as f32),
        (Float64, Float64) => map::<f64, f64>(out, input, frames, info, |s| s),
    }
}

/// Scale a normalized value to integer range, round to nearest, and
/// clamp so out-of-range input saturates instead of wrapping.
#[inline]
fn scale_clamp(value: f64, full_scale: f64) -> f64 {
    (value * full_scale).round().clamp(-full_scale, full_scale - 1.0)
}

/// The shared conversion loop: iterate frames, map each overlapping
/// channel through the offset tables, advance by the jumps.
fn map<I: Pod, O: Pod>(
    out: &mut [u8],
    input: &[u8],
    frames: usize,
    info: &ConvertInfo,
    convert: impl Fn(I) -> O,
) {
    let input: &[I] = bytemuck::cast_slice(input);
    let out: &mut [O] = bytemuck::cast_slice_mut(out);

    // Planar channel blocks span the frames of this cycle, so the
    // slot tables are scaled here rather than at open time.
    let in_scale = if info.in_planar { frames } else { 1 };
    let out_scale = if info.out_planar { frames } else { 1 };

    let mut in_base = 0usize;
    let mut out_base = 0usize;
    for _ in 0..frames {
        for ch in 0..info.channels as usize {
            out[out_base + info.out_offset[ch] * out_scale] =
                convert(input[in_base + info.in_offset[ch] * in_scale]);
        }
        in_base += info.in_jump;
        out_base += info.out_jump;
    }
}

/// Zero a device buffer before converting into it.
///
/// Used on duplex output buffers whose channel count exceeds the
/// converted set, so stale samples never leak into unmatched channels.
pub fn clear_buffer(out: &mut [u8]) {
    out.fill(0);
}

/// In-place endianness swap for every sample in the buffer.
pub fn byte_swap_buffer(buf: &mut [u8], format: SampleFormat) {
    let width = format.bytes();
    if width < 2 {
        return;
    }
    for sample in buf.chunks_exact_mut(width) {
        sample.reverse();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::BufferGeometry;

    /// Write a quarter-full-scale sample value at `index`.
    fn write_quarter(buf: &mut [u8], format: SampleFormat, index: usize) {
        match format {
            SampleFormat::Sint8 => bytemuck::cast_slice_mut::<u8, i8>(buf)[index] = 32,
            SampleFormat::Sint16 => bytemuck::cast_slice_mut::<u8, i16>(buf)[index] = 8192,
            SampleFormat::Sint24 => bytemuck::cast_slice_mut::<u8, i32>(buf)[index] = 2_097_152,
            SampleFormat::Sint32 => bytemuck::cast_slice_mut::<u8, i32>(buf)[index] = 536_870_912,
            SampleFormat::Float32 => bytemuck::cast_slice_mut::<u8, f32>(buf)[index] = 0.25,
            SampleFormat::Float64 => bytemuck::cast_slice_mut::<u8, f64>(buf)[index] = 0.25,
        }
    }

    /// Read sample `index` normalized to [-1, 1).
    fn read_norm(buf: &[u8], format: SampleFormat, index: usize) -> f64 {
        let scale = format.full_scale();
        match format {
            SampleFormat::Sint8 => bytemuck::cast_slice::<u8, i8>(buf)[index] as f64 / scale,
            SampleFormat::Sint16 => bytemuck::cast_slice::<u8, i16>(buf)[index] as f64 / scale,
            SampleFormat::Sint24 | SampleFormat::Sint32 => {
                bytemuck::cast_slice::<u8, i32>(buf)[index] as f64 / scale
            }
            SampleFormat::Float32 => bytemuck::cast_slice::<u8, f32>(buf)[index] as f64,
            SampleFormat::Float64 => bytemuck::cast_slice::<u8, f64>(buf)[index],
        }
    }

    fn mono_info(from: SampleFormat, to: SampleFormat) -> ConvertInfo {
        ConvertInfo::new(
            &BufferGeometry::packed(1, from, false),
            &BufferGeometry::packed(1, to, false),
        )
    }

    /// Every pair of the six formats must have a working conversion
    /// path; a quarter-scale input survives any of them exactly.
    #[test]
    fn test_conversion_completeness_all_pairs() {
        const FRAMES: usize = 4;
        for from in SampleFormat::ALL {
            for to in SampleFormat::ALL {
                let mut input = AlignedBuffer::new(FRAMES * from.bytes());
                let mut out = AlignedBuffer::new(FRAMES * to.bytes());
                for i in 0..FRAMES {
                    write_quarter(input.as_bytes_mut(), from, i);
                }

                let info = mono_info(from, to);
                convert_buffer(out.as_bytes_mut(), input.as_bytes(), FRAMES, &info);

                for i in 0..FRAMES {
                    let got = read_norm(out.as_bytes(), to, i);
                    assert!(
                        (got - 0.25).abs() < 1e-9,
                        "{} -> {}: sample {} came out {}",
                        from,
                        to,
                        i,
                        got
                    );
                }
            }
        }
    }

    #[test]
    fn test_sint16_float64_roundtrip_lossless() {
        let values: [i16; 7] = [i16::MIN, -12345, -1, 0, 1, 456, i16::MAX];
        let frames = values.len();

        let mut s16 = AlignedBuffer::new(frames * 2);
        bytemuck::cast_slice_mut::<u8, i16>(s16.as_bytes_mut()).copy_from_slice(&values);

        let mut f64buf = AlignedBuffer::new(frames * 8);
        let info = mono_info(SampleFormat::Sint16, SampleFormat::Float64);
        convert_buffer(f64buf.as_bytes_mut(), s16.as_bytes(), frames, &info);

        let mut back = AlignedBuffer::new(frames * 2);
        let info = mono_info(SampleFormat::Float64, SampleFormat::Sint16);
        convert_buffer(back.as_bytes_mut(), f64buf.as_bytes(), frames, &info);

        assert_eq!(bytemuck::cast_slice::<u8, i16>(back.as_bytes()), &values);
    }

    #[test]
    fn test_sint16_sint8_roundtrip_truncates_low_bits() {
        let mut s16 = AlignedBuffer::new(2);
        bytemuck::cast_slice_mut::<u8, i16>(s16.as_bytes_mut())[0] = 0x1234;

        let mut s8 = AlignedBuffer::new(1);
        let info = mono_info(SampleFormat::Sint16, SampleFormat::Sint8);
        convert_buffer(s8.as_bytes_mut(), s16.as_bytes(), 1, &info);
        assert_eq!(bytemuck::cast_slice::<u8, i8>(s8.as_bytes())[0], 0x12);

        let mut back = AlignedBuffer::new(2);
        let info = mono_info(SampleFormat::Sint8, SampleFormat::Sint16);
        convert_buffer(back.as_bytes_mut(), s8.as_bytes(), 1, &info);
        assert_eq!(bytemuck::cast_slice::<u8, i16>(back.as_bytes())[0], 0x1200);
    }

    #[test]
    fn test_float_to_int_clamps_instead_of_wrapping() {
        let mut f32buf = AlignedBuffer::new(3 * 4);
        let samples = bytemuck::cast_slice_mut::<u8, f32>(f32buf.as_bytes_mut());
        samples[0] = 2.0;
        samples[1] = -2.0;
        samples[2] = 1.0; // exactly full scale also clamps to max

        let mut s16 = AlignedBuffer::new(3 * 2);
        let info = mono_info(SampleFormat::Float32, SampleFormat::Sint16);
        convert_buffer(s16.as_bytes_mut(), f32buf.as_bytes(), 3, &info);

        let out = bytemuck::cast_slice::<u8, i16>(s16.as_bytes());
        assert_eq!(out[0], i16::MAX);
        assert_eq!(out[1], i16::MIN);
        assert_eq!(out[2], i16::MAX);
    }

    #[test]
    fn test_integer_widening_is_exact_shift() {
        let mut s8 = AlignedBuffer::new(1);
        bytemuck::cast_slice_mut::<u8, i8>(s8.as_bytes_mut())[0] = 0x12;

        let mut s32 = AlignedBuffer::new(4);
        let info = mono_info(SampleFormat::Sint8, SampleFormat::Sint32);
        convert_buffer(s32.as_bytes_mut(), s8.as_bytes(), 1, &info);
        assert_eq!(bytemuck::cast_slice::<u8, i32>(s32.as_bytes())[0], 0x12_00_00_00);

        let mut s16 = AlignedBuffer::new(2);
        bytemuck::cast_slice_mut::<u8, i16>(s16.as_bytes_mut())[0] = -1;
        let mut s24 = AlignedBuffer::new(4);
        let info = mono_info(SampleFormat::Sint16, SampleFormat::Sint24);
        convert_buffer(s24.as_bytes_mut(), s16.as_bytes(), 1, &info);
        assert_eq!(bytemuck::cast_slice::<u8, i32>(s24.as_bytes())[0], -256);
    }

    #[test]
    fn test_interleaved_to_planar() {
        const FRAMES: usize = 4;
        let mut inter = AlignedBuffer::new(FRAMES * 2 * 4);
        {
            let samples = bytemuck::cast_slice_mut::<u8, f32>(inter.as_bytes_mut());
            for f in 0..FRAMES {
                samples[f * 2] = f as f32; // left
                samples[f * 2 + 1] = -(f as f32); // right
            }
        }

        let info = ConvertInfo::new(
            &BufferGeometry::packed(2, SampleFormat::Float32, false),
            &BufferGeometry::packed(2, SampleFormat::Float32, true),
        );
        let mut planar = AlignedBuffer::new(FRAMES * 2 * 4);
        convert_buffer(planar.as_bytes_mut(), inter.as_bytes(), FRAMES, &info);

        let out = bytemuck::cast_slice::<u8, f32>(planar.as_bytes());
        for f in 0..FRAMES {
            assert_eq!(out[f], f as f32);
            assert_eq!(out[FRAMES + f], -(f as f32));
        }
    }

    #[test]
    fn test_first_channel_offset_compensation() {
        const FRAMES: usize = 2;
        // Stereo user buffer into channels 1..3 of a 4-channel device
        // buffer shared with another port.
        let mut user = AlignedBuffer::new(FRAMES * 2 * 4);
        {
            let samples = bytemuck::cast_slice_mut::<u8, f32>(user.as_bytes_mut());
            samples.copy_from_slice(&[0.5, -0.5, 0.25, -0.25]);
        }

        let device_geom = BufferGeometry {
            channels: 2,
            total_channels: 4,
            first_channel: 1,
            format: SampleFormat::Sint16,
            planar: false,
        };
        let info = ConvertInfo::new(
            &BufferGeometry::packed(2, SampleFormat::Float32, false),
            &device_geom,
        );

        let mut device = AlignedBuffer::new(FRAMES * 4 * 2);
        bytemuck::cast_slice_mut::<u8, i16>(device.as_bytes_mut()).fill(0x7777);
        convert_buffer(device.as_bytes_mut(), user.as_bytes(), FRAMES, &info);

        let out = bytemuck::cast_slice::<u8, i16>(device.as_bytes());
        // Channels 0 and 3 belong to someone else and stay untouched.
        assert_eq!(out[0], 0x7777);
        assert_eq!(out[3], 0x7777);
        assert_eq!(out[1], 16384);
        assert_eq!(out[2], -16384);
        assert_eq!(out[4], 0x7777);
        assert_eq!(out[5], 8192);
        assert_eq!(out[6], -8192);
        assert_eq!(out[7], 0x7777);
    }

    #[test]
    fn test_duplex_clear_zero_fills_unmatched_channels() {
        const FRAMES: usize = 2;
        // Mono input into a stereo device buffer full of stale data.
        let mut user = AlignedBuffer::new(FRAMES * 4);
        bytemuck::cast_slice_mut::<u8, f32>(user.as_bytes_mut()).copy_from_slice(&[0.5, 0.5]);

        let info = ConvertInfo::new(
            &BufferGeometry::packed(1, SampleFormat::Float32, false),
            &BufferGeometry::packed(2, SampleFormat::Float32, false),
        );

        let mut device = AlignedBuffer::new(FRAMES * 2 * 4);
        bytemuck::cast_slice_mut::<u8, f32>(device.as_bytes_mut()).fill(0.9);

        clear_buffer(device.as_bytes_mut());
        convert_buffer(device.as_bytes_mut(), user.as_bytes(), FRAMES, &info);

        let out = bytemuck::cast_slice::<u8, f32>(device.as_bytes());
        assert_eq!(out, &[0.5, 0.0, 0.5, 0.0]);
    }

    #[test]
    fn test_byte_swap_roundtrip() {
        let mut buf = AlignedBuffer::new(4);
        bytemuck::cast_slice_mut::<u8, i16>(buf.as_bytes_mut()).copy_from_slice(&[0x1234, 0x5678]);

        byte_swap_buffer(buf.as_bytes_mut(), SampleFormat::Sint16);
        let swapped = bytemuck::cast_slice::<u8, i16>(buf.as_bytes());
        assert_eq!(swapped[0], 0x3412);
        assert_eq!(swapped[1], 0x7856);

        byte_swap_buffer(buf.as_bytes_mut(), SampleFormat::Sint16);
        let back = bytemuck::cast_slice::<u8, i16>(buf.as_bytes());
        assert_eq!(back, &[0x1234, 0x5678]);
    }
}
