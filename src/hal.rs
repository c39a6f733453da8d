//! Hardware boundary traits.
//!
//! Board bring-up lives outside this crate; everything the motion core needs
//! from the machine is expressed here as a trait. The simulation
//! implementations below are what the console binary and the tests wire in.

use crate::config::MAX_AXES;

/// Step and direction outputs for all axes.
///
/// `pulse` receives one bit per axis that must step on this interrupt tick;
/// generating the trailing edge after the configured pulse width is the
/// implementor's job (a one-shot timer on real boards). Implementors also
/// own the step/direction invert masks of the wiring.
pub trait StepDriver {
    /// Latches the direction outputs. Bit set = negative travel.
    fn set_direction_mask(&mut self, dir_mask: u8);

    /// Asserts the leading edge of a step pulse on every set bit.
    fn pulse(&mut self, step_mask: u8);

    /// Energizes or releases the motors.
    fn set_enabled(&mut self, enabled: bool);
}

/// Limit switch inputs, one bit per axis.
pub trait LimitPins {
    /// Mask of axes whose limit switch currently reads triggered.
    fn triggered_mask(&self) -> u8;
}

impl<T: LimitPins> LimitPins for std::sync::Arc<T> {
    fn triggered_mask(&self) -> u8 {
        (**self).triggered_mask()
    }
}

/// Probe input. Reserved for probing cycles; the default is never triggered.
pub trait ProbePin {
    fn triggered(&self) -> bool {
        false
    }
}

/// Records emitted motion instead of driving pins. The step counts are what
/// the tests assert against.
#[derive(Debug, Default)]
pub struct SimDriver {
    pub dir_mask: u8,
    pub enabled: bool,
    /// Pulses emitted per axis since the last clear.
    pub steps: [u64; MAX_AXES],
    /// Raw mask of the most recent pulse call.
    pub last_pulse_mask: u8,
    /// Interrupt ticks that produced at least one pulse.
    pub pulse_events: u64,
}

impl SimDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.steps = [0; MAX_AXES];
        self.pulse_events = 0;
        self.last_pulse_mask = 0;
    }
}

impl StepDriver for SimDriver {
    fn set_direction_mask(&mut self, dir_mask: u8) {
        self.dir_mask = dir_mask;
    }

    fn pulse(&mut self, step_mask: u8) {
        if step_mask == 0 {
            return;
        }
        self.last_pulse_mask = step_mask;
        self.pulse_events += 1;
        for (axis, count) in self.steps.iter_mut().enumerate() {
            if step_mask & (1 << axis) != 0 {
                *count += 1;
            }
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}

/// Limit inputs settable from test code.
#[derive(Debug, Default)]
pub struct SimLimits {
    mask: std::sync::atomic::AtomicU8,
}

impl SimLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self, axis_mask: u8) {
        self.mask
            .fetch_or(axis_mask, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn release(&self, axis_mask: u8) {
        self.mask
            .fetch_and(!axis_mask, std::sync::atomic::Ordering::SeqCst);
    }
}

impl LimitPins for SimLimits {
    fn triggered_mask(&self) -> u8 {
        self.mask.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Mirrors one axis's step and direction onto a spare output channel, for
/// dual-motor gantries. The clone shares the parent axis's settings; only
/// its direction sense can differ.
pub struct DualAxisClone<D: StepDriver> {
    inner: D,
    source_axis: usize,
    clone_bit: u8,
    invert_dir: bool,
}

impl<D: StepDriver> DualAxisClone<D> {
    pub fn new(inner: D, source_axis: usize, clone_bit: u8, invert_dir: bool) -> Self {
        DualAxisClone {
            inner,
            source_axis,
            clone_bit,
            invert_dir,
        }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut D {
        &mut self.inner
    }
}

impl<D: StepDriver> StepDriver for DualAxisClone<D> {
    fn set_direction_mask(&mut self, dir_mask: u8) {
        let mut out = dir_mask & !self.clone_bit;
        let source_negative = dir_mask & (1 << self.source_axis) != 0;
        if source_negative != self.invert_dir {
            out |= self.clone_bit;
        }
        self.inner.set_direction_mask(out);
    }

    fn pulse(&mut self, step_mask: u8) {
        let mut out = step_mask & !self.clone_bit;
        if step_mask & (1 << self.source_axis) != 0 {
            out |= self.clone_bit;
        }
        self.inner.pulse(out);
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.inner.set_enabled(enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_driver_counts_per_axis() {
        let mut driver = SimDriver::new();
        driver.pulse(0b011);
        driver.pulse(0b001);
        driver.pulse(0);
        assert_eq!(driver.steps[0], 2);
        assert_eq!(driver.steps[1], 1);
        assert_eq!(driver.pulse_events, 2);
    }

    #[test]
    fn dual_axis_clone_mirrors_steps() {
        let clone_bit = 1 << 3;
        let mut driver = DualAxisClone::new(SimDriver::new(), 0, clone_bit, false);
        driver.pulse(0b001);
        assert_eq!(driver.inner().last_pulse_mask, 0b001 | clone_bit);
        driver.pulse(0b010);
        assert_eq!(driver.inner().last_pulse_mask, 0b010);
    }

    #[test]
    fn dual_axis_clone_mirrors_direction() {
        let clone_bit = 1 << 3;
        let mut driver = DualAxisClone::new(SimDriver::new(), 0, clone_bit, false);
        driver.set_direction_mask(0b001);
        assert_eq!(driver.inner().dir_mask, 0b001 | clone_bit);
        driver.set_direction_mask(0b000);
        assert_eq!(driver.inner().dir_mask, 0);
    }

    #[test]
    fn dual_axis_clone_can_invert_direction() {
        let clone_bit = 1 << 3;
        let mut driver = DualAxisClone::new(SimDriver::new(), 1, clone_bit, true);
        driver.set_direction_mask(0);
        assert_eq!(driver.inner().dir_mask & clone_bit, clone_bit);
        driver.set_direction_mask(1 << 1);
        assert_eq!(driver.inner().dir_mask & clone_bit, 0);
    }
}
