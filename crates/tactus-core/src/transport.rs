//! Transport clock mapping between musical pulses and audio frames
//!
//! The driver delivers audio in fixed-size callback cycles counted in
//! frames, while musical events are scheduled in pulses (ticks at a
//! given PPQN). [`ClockMapper`] converts between the two coordinate
//! systems relative to a specific cycle, staying drift-free under
//! integer frame quantization.
//!
//! The tempo inputs (frame rate, ticks per beat, beats per minute)
//! come straight from a JACK-style transport position; see
//! [`TransportPosition`]. Everything here is pure computation apart
//! from the cached recalculation, because these functions run inside
//! the audio callback every cycle.

/// Snapshot of the driver transport, as queried once per cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportPosition {
    /// Current transport frame number.
    pub frame: u32,
    /// Frames per second (e.g. 48000).
    pub frame_rate: u32,
    /// Pulses per quarter note.
    pub ticks_per_beat: f64,
    /// Tempo in quarter notes per minute.
    pub beats_per_minute: f64,
}

/// Maps pulse positions to frame positions across callback cycles.
#[derive(Debug, Clone)]
pub struct ClockMapper {
    // Cached tempo inputs; recalculation is skipped while they hold.
    frame_rate: u32,
    ticks_per_beat: f64,
    beats_per_minute: f64,

    /// Frames per pulse (seconds-per-pulse x frame rate).
    frame_factor: f64,
    /// Frames spanned by one callback cycle.
    cycle_frame_count: u32,
    /// Seconds spanned by one callback cycle.
    cycle_time: f64,
    /// Seconds spanned by one pulse.
    pulse_time: f64,
    /// Small frame constant absorbing end-to-end latency when mapping
    /// an event computed in an earlier cycle.
    size_compensation: u32,
    /// Frame origin of musical time (transport frame at start).
    start_frame: u32,
    /// Whether frame-offset correction is applied by callers.
    use_offset: bool,
}

impl Default for ClockMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockMapper {
    pub fn new() -> Self {
        Self {
            frame_rate: 0,
            ticks_per_beat: 0.0,
            beats_per_minute: 0.0,
            frame_factor: 0.0,
            cycle_frame_count: 0,
            cycle_time: 0.0,
            pulse_time: 0.0,
            size_compensation: 0,
            start_frame: 0,
            use_offset: false,
        }
    }

    /// Recompute the derived factors from a transport snapshot.
    ///
    /// Does nothing and returns `false` unless the frame rate, ticks
    /// per beat, or tempo actually changed since the last call, so it
    /// is cheap to invoke every cycle.
    pub fn recalculate_frame_factor(
        &mut self,
        position: &TransportPosition,
        cycle_frame_count: u32,
    ) -> bool {
        if position.frame_rate == self.frame_rate
            && position.ticks_per_beat == self.ticks_per_beat
            && position.beats_per_minute == self.beats_per_minute
            && cycle_frame_count == self.cycle_frame_count
        {
            return false;
        }

        self.frame_rate = position.frame_rate;
        self.ticks_per_beat = position.ticks_per_beat;
        self.beats_per_minute = position.beats_per_minute;
        self.cycle_frame_count = cycle_frame_count;

        if self.ticks_per_beat > 0.0 && self.beats_per_minute > 0.0 && self.frame_rate > 0 {
            self.pulse_time = 60.0 / (self.beats_per_minute * self.ticks_per_beat);
            self.frame_factor = self.pulse_time * self.frame_rate as f64;
            self.cycle_time = cycle_frame_count as f64 / self.frame_rate as f64;
        } else {
            self.pulse_time = 0.0;
            self.frame_factor = 0.0;
            self.cycle_time = 0.0;
        }

        // Proportionality constant tuned against observed round-trip
        // latency on JACK.
        self.size_compensation = (cycle_frame_count as f64 * 0.10 + 0.5) as u32;
        true
    }

    /// Frames per pulse currently in effect.
    pub fn frame_factor(&self) -> f64 {
        self.frame_factor
    }

    pub fn size_compensation(&self) -> u32 {
        self.size_compensation
    }

    /// Record the transport frame at which musical time zero sits.
    pub fn set_start_frame(&mut self, frame: u32) {
        self.start_frame = frame;
    }

    pub fn start_frame(&self) -> u32 {
        self.start_frame
    }

    pub fn set_use_offset(&mut self, on: bool) {
        self.use_offset = on;
    }

    pub fn use_offset(&self) -> bool {
        self.use_offset
    }

    /// Absolute frame estimate for a pulse position, rounded half-up.
    pub fn frame_estimate(&self, pulse: u64) -> u64 {
        (pulse as f64 * self.frame_factor + 0.5) as u64
    }

    /// Place a pulse within the current cycle.
    ///
    /// Returns the frame offset inside a cycle of `cycle_frame_count`
    /// frames; with a degenerate one-frame cycle the raw estimate is
    /// returned instead.
    pub fn frame_offset(&self, cycle_frame_count: u32, pulse: u64) -> u32 {
        if cycle_frame_count > 1 {
            ((self.frame_estimate(pulse) + self.start_frame as u64) % cycle_frame_count as u64)
                as u32
        } else {
            self.frame_estimate(pulse) as u32
        }
    }

    /// Place a pulse whose target frame was computed in a different
    /// cycle than the one now delivering it.
    ///
    /// Compensates for scheduling latency by crediting one cycle minus
    /// the size compensation, then clamps into the delivering cycle.
    pub fn frame_offset_from(
        &self,
        cycle_start_frame: u32,
        cycle_frame_count: u32,
        pulse: u64,
    ) -> u32 {
        if cycle_frame_count == 0 {
            return 0;
        }
        let estimate = self.frame_estimate(pulse) + cycle_frame_count as u64
            - self.size_compensation as u64;
        let offset = estimate.saturating_sub(cycle_start_frame as u64);
        offset.min(cycle_frame_count as u64 - 1) as u32
    }

    /// Split a pulse's continuous cycle coordinate into an integral
    /// cycle number and a frame-scaled offset within that cycle.
    pub fn cycle_frame(&self, pulse: u64) -> (u64, f64) {
        if self.cycle_frame_count == 0 {
            return (0, 0.0);
        }
        let position = self.frame_estimate(pulse) as f64 / self.cycle_frame_count as f64;
        let cycle = position.floor();
        let offset = (position - cycle) * self.cycle_frame_count as f64;
        (cycle as u64, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position() -> TransportPosition {
        TransportPosition {
            frame: 0,
            frame_rate: 48000,
            ticks_per_beat: 1920.0,
            beats_per_minute: 120.0,
        }
    }

    fn mapper() -> ClockMapper {
        let mut m = ClockMapper::new();
        assert!(m.recalculate_frame_factor(&position(), 1024));
        m
    }

    #[test]
    fn test_frame_factor_derivation() {
        let m = mapper();
        // 48000 * 60 / (120 * 1920) = 12.5 frames per pulse
        assert!((m.frame_factor() - 12.5).abs() < 1e-12);
        // 1024 * 0.10 + 0.5 = 102.9 -> 102
        assert_eq!(m.size_compensation(), 102);
    }

    #[test]
    fn test_recalculation_is_idempotent() {
        let mut m = mapper();
        assert!(!m.recalculate_frame_factor(&position(), 1024));
        assert!(!m.recalculate_frame_factor(&position(), 1024));

        // Any single input change triggers recomputation.
        let mut faster = position();
        faster.beats_per_minute = 140.0;
        assert!(m.recalculate_frame_factor(&faster, 1024));
        assert!(!m.recalculate_frame_factor(&faster, 1024));
    }

    #[test]
    fn test_frame_estimate_rounds_half_up() {
        let mut m = ClockMapper::new();
        let pos = TransportPosition {
            frame: 0,
            frame_rate: 44100,
            ticks_per_beat: 1920.0,
            beats_per_minute: 120.0,
        };
        m.recalculate_frame_factor(&pos, 512);
        // factor = 44100 * 60 / (120 * 1920) = 11.484375
        assert_eq!(m.frame_estimate(0), 0);
        assert_eq!(m.frame_estimate(1), 11);
        assert_eq!(m.frame_estimate(2), 23); // 22.96875 rounds up
    }

    #[test]
    fn test_frame_offset_monotonic_until_wrap() {
        let m = mapper();
        let mut last_offset = 0u32;
        let mut last_cycle = 0u64;
        let mut wraps = 0;

        for pulse in (0..=1000u64).step_by(10) {
            let offset = m.frame_offset(1024, pulse);
            let (cycle, _) = m.cycle_frame(pulse);
            if cycle == last_cycle {
                assert!(
                    offset >= last_offset,
                    "offset regressed within cycle {} at pulse {}",
                    cycle,
                    pulse
                );
            } else {
                assert!(cycle > last_cycle);
                // After a wrap the offset restarts near zero.
                assert!(offset < last_offset);
                wraps += 1;
            }
            last_offset = offset;
            last_cycle = cycle;
        }
        // 12.5 frames/pulse x 1000 pulses / 1024 frames ~ 12 cycles
        assert!(wraps >= 11, "expected about 12 wraps, saw {}", wraps);
    }

    #[test]
    fn test_frame_offset_degenerate_cycle() {
        let m = mapper();
        assert_eq!(m.frame_offset(1, 8), m.frame_estimate(8) as u32);
    }

    #[test]
    fn test_frame_offset_includes_start_frame() {
        let mut m = mapper();
        m.set_start_frame(100);
        assert_eq!(m.frame_offset(1024, 0), 100);
    }

    #[test]
    fn test_frame_offset_from_clamps_into_cycle() {
        let m = mapper();
        // Event far in the past clamps to frame 0, far in the future
        // clamps to the last frame of the delivering cycle.
        assert_eq!(m.frame_offset_from(1_000_000, 1024, 0), 0);
        assert_eq!(m.frame_offset_from(0, 1024, 1_000_000), 1023);

        // A pulse near the delivering cycle lands inside it:
        // estimate 750, credited one cycle minus compensation.
        let offset = m.frame_offset_from(1024, 1024, 60);
        assert_eq!(offset, 750 + 1024 - 102 - 1024);
        assert!(offset < 1024);
    }

    #[test]
    fn test_frame_offset_from_zero_frame_cycle() {
        let m = mapper();
        assert_eq!(m.frame_offset_from(0, 0, 8), 0);
        assert_eq!(m.frame_offset_from(500, 0, 8), 0);
    }

    #[test]
    fn test_cycle_frame_split() {
        let m = mapper();
        // pulse 100 -> frame 1250 -> cycle 1, offset 226
        let (cycle, offset) = m.cycle_frame(100);
        assert_eq!(cycle, 1);
        assert!((offset - 226.0).abs() < 1e-9);

        let (cycle, offset) = m.cycle_frame(0);
        assert_eq!(cycle, 0);
        assert_eq!(offset, 0.0);
    }

    #[test]
    fn test_unset_tempo_yields_zero_factor() {
        let mut m = ClockMapper::new();
        let silent = TransportPosition {
            frame: 0,
            frame_rate: 48000,
            ticks_per_beat: 0.0,
            beats_per_minute: 0.0,
        };
        assert!(m.recalculate_frame_factor(&silent, 256));
        assert_eq!(m.frame_factor(), 0.0);
        assert_eq!(m.frame_estimate(1000), 0);
    }
}
