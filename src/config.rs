//! Runtime machine configuration.
//!
//! These knobs were historically compile-time constants. Keeping them in a
//! config record handed to `Machine::new` lets a host build instantiate
//! differently shaped machines (2- or 3-axis, different timer bases) in one
//! process without rebuilding.

/// Largest axis count the data structures are sized for.
pub const MAX_AXES: usize = 3;

pub const X_AXIS: usize = 0;
pub const Y_AXIS: usize = 1;
pub const Z_AXIS: usize = 2;

/// Letters used when reporting per-axis data.
pub const AXIS_LETTERS: [char; MAX_AXES] = ['X', 'Y', 'Z'];

/// Bit mask covering every configured axis.
pub fn axes_mask(n_axis: usize) -> u8 {
    (1u8 << n_axis) - 1
}

// Feed and rapid override envelope, in percent of programmed rate.
pub const DEFAULT_FEED_OVERRIDE: u8 = 100;
pub const MAX_FEED_RATE_OVERRIDE: u8 = 200;
pub const MIN_FEED_RATE_OVERRIDE: u8 = 10;
pub const FEED_OVERRIDE_COARSE_INCREMENT: u8 = 10;
pub const FEED_OVERRIDE_FINE_INCREMENT: u8 = 1;

pub const DEFAULT_RAPID_OVERRIDE: u8 = 100;
pub const RAPID_OVERRIDE_MEDIUM: u8 = 50;
pub const RAPID_OVERRIDE_LOW: u8 = 25;

/// Slowest feed the planner will accept, mm/min. Guarantees every planned
/// motion completes despite float round-off.
pub const MINIMUM_FEED_RATE: f32 = 1.0;

/// Junction floor speed, mm/min. Zero plans to a full stop at sharp corners.
pub const MINIMUM_JUNCTION_SPEED: f32 = 0.0;

#[derive(Clone, Debug)]
pub struct MachineConfig {
    /// Number of driven axes, 2 or 3.
    pub n_axis: usize,
    /// Step timer base frequency in Hz; segment timer reload values
    /// (`cycles_per_tick`) are expressed in this clock.
    pub timer_hz: u32,
    /// Temporal resolution of the acceleration profile. Each step segment
    /// spans roughly `1 / acceleration_ticks_per_second` of motion time.
    pub acceleration_ticks_per_second: u32,
    /// Arc iterations run on the small-angle approximation before an exact
    /// sin/cos correction is applied.
    pub n_arc_correction: u8,
    /// Angular cutoff distinguishing a programmed full circle from numerical
    /// noise in offset-mode arcs, radians.
    pub arc_angular_travel_epsilon: f32,
    /// Dwell slice duration between realtime checkpoints, milliseconds.
    pub dwell_time_step_ms: u16,
    /// Largest accepted N-word value.
    pub max_line_number: u32,
    /// Startup blocks stored in the non-volatile area.
    pub n_startup_lines: usize,
    /// Step interrupts executed per realtime checkpoint when no hardware
    /// timer drives the machine (console builds and tests). Zero leaves all
    /// ticking to the caller.
    pub checkpoint_ticks: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            n_axis: 3,
            timer_hz: 16_000_000,
            acceleration_ticks_per_second: 100,
            n_arc_correction: 12,
            arc_angular_travel_epsilon: 5e-7,
            dwell_time_step_ms: 50,
            max_line_number: 10_000_000,
            n_startup_lines: 2,
            checkpoint_ticks: 0,
        }
    }
}

impl MachineConfig {
    /// Config for a machine with `n_axis` driven axes.
    pub fn with_axes(n_axis: usize) -> Self {
        assert!((2..=MAX_AXES).contains(&n_axis), "unsupported axis count");
        MachineConfig {
            n_axis,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axes_mask_covers_configured_axes() {
        assert_eq!(axes_mask(2), 0b011);
        assert_eq!(axes_mask(3), 0b111);
    }

    #[test]
    #[should_panic]
    fn rejects_single_axis() {
        MachineConfig::with_axes(1);
    }
}
