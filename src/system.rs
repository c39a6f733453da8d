//! Machine state, realtime executor flags and the shared position vector.
//!
//! The realtime flag words model an interrupt-driven mailbox: the serial
//! receive side (another thread, or an ISR on a board build) only ever sets
//! bits, the protocol loop only ever reads and clears them. Both sides go
//! through lock-free atomic bit operations.

use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};

use bitflags::bitflags;

use crate::config::MAX_AXES;
use crate::settings::Settings;
use crate::status::Alarm;

bitflags! {
    /// Realtime executor command flags, one bit per asynchronous request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RtExec: u8 {
        const STATUS_REPORT = 1 << 0;
        const CYCLE_START   = 1 << 1;
        const CYCLE_STOP    = 1 << 2;
        const FEED_HOLD     = 1 << 3;
        const RESET         = 1 << 4;
        const MOTION_CANCEL = 1 << 6;
        const SLEEP         = 1 << 7;
    }
}

bitflags! {
    /// Realtime feed/rapid override change requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RtOverride: u8 {
        const FEED_RESET         = 1 << 0;
        const FEED_COARSE_PLUS   = 1 << 1;
        const FEED_COARSE_MINUS  = 1 << 2;
        const FEED_FINE_PLUS     = 1 << 3;
        const FEED_FINE_MINUS    = 1 << 4;
        const RAPID_RESET        = 1 << 5;
        const RAPID_MEDIUM       = 1 << 6;
        const RAPID_LOW          = 1 << 7;
    }
}

bitflags! {
    /// Suspend bookkeeping while a hold or cancel is in progress.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Suspend: u8 {
        const HOLD_COMPLETE  = 1 << 0;
        const MOTION_CANCEL  = 1 << 6;
        const JOG_CANCEL     = 1 << 7;
    }
}

bitflags! {
    /// Orders for the step segment generator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StepControl: u8 {
        const END_MOTION         = 1 << 0;
        const EXECUTE_HOLD       = 1 << 1;
        const EXECUTE_SYS_MOTION = 1 << 2;
    }
}

/// Top-level machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Idle,
    Alarm,
    CheckMode,
    Cycle,
    Hold,
    Jog,
    Sleep,
}

impl MachineState {
    /// Name used in the framed status report.
    pub fn report_name(self) -> &'static str {
        match self {
            MachineState::Idle => "Idle",
            MachineState::Alarm => "Alarm",
            MachineState::CheckMode => "Check",
            MachineState::Cycle => "Run",
            MachineState::Hold => "Hold",
            MachineState::Jog => "Jog",
            MachineState::Sleep => "Sleep",
        }
    }
}

/// The three shared flag bytes crossing the receive/protocol boundary.
///
/// Setting is a `fetch_or`, clearing a `fetch_and`; a read-modify-write
/// never straddles the boundary unprotected.
#[derive(Debug, Default)]
pub struct RtSignals {
    exec_state: AtomicU8,
    exec_alarm: AtomicU8,
    exec_override: AtomicU8,
}

impl RtSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, flags: RtExec) {
        self.exec_state.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    pub fn clear_state(&self, flags: RtExec) {
        self.exec_state.fetch_and(!flags.bits(), Ordering::SeqCst);
    }

    pub fn state(&self) -> RtExec {
        RtExec::from_bits_truncate(self.exec_state.load(Ordering::SeqCst))
    }

    pub fn set_alarm(&self, alarm: Alarm) {
        self.exec_alarm.store(alarm.code(), Ordering::SeqCst);
    }

    /// Consumes a pending alarm, if any.
    pub fn take_alarm(&self) -> Option<Alarm> {
        Alarm::from_code(self.exec_alarm.swap(0, Ordering::SeqCst))
    }

    pub fn set_override(&self, flags: RtOverride) {
        self.exec_override.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    /// Drops every pending request. Used by the reset path only.
    pub fn clear_all(&self) {
        self.exec_state.store(0, Ordering::SeqCst);
        self.exec_alarm.store(0, Ordering::SeqCst);
        self.exec_override.store(0, Ordering::SeqCst);
    }

    /// Consumes all pending override requests.
    pub fn take_overrides(&self) -> RtOverride {
        RtOverride::from_bits_truncate(self.exec_override.swap(0, Ordering::SeqCst))
    }
}

/// Machine position in steps, owned by the stepper interrupt.
///
/// The interrupt is the single writer; readers (reports, parser resync)
/// see whole-word snapshots through the atomics.
#[derive(Debug, Default)]
pub struct Positions {
    steps: [AtomicI32; MAX_AXES],
}

impl Positions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, axis: usize) -> i32 {
        self.steps[axis].load(Ordering::Relaxed)
    }

    pub fn set(&self, axis: usize, value: i32) {
        self.steps[axis].store(value, Ordering::Relaxed);
    }

    pub fn add(&self, axis: usize, delta: i32) {
        self.steps[axis].fetch_add(delta, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> [i32; MAX_AXES] {
        [self.get(0), self.get(1), self.get(2)]
    }

    pub fn zero(&self) {
        for axis in 0..MAX_AXES {
            self.set(axis, 0);
        }
    }

    /// Machine position of one axis in mm.
    pub fn mpos(&self, axis: usize, settings: &Settings) -> f32 {
        self.get(axis) as f32 / settings.axis[axis].steps_per_mm
    }

    /// Machine position vector in mm for the configured axes.
    pub fn mpos_all(&self, settings: &Settings, n_axis: usize) -> [f32; MAX_AXES] {
        let mut out = [0.0; MAX_AXES];
        for (axis, slot) in out.iter_mut().enumerate().take(n_axis) {
            *slot = self.mpos(axis, settings);
        }
        out
    }
}

/// Mutable system state owned by the protocol loop.
#[derive(Debug)]
pub struct SysState {
    pub state: MachineState,
    pub suspend: Suspend,
    pub step_control: StepControl,
    /// Feed override, percent.
    pub f_override: u8,
    /// Rapid override, percent.
    pub r_override: u8,
    /// Forces the protocol loop back to re-initialization.
    pub abort: bool,
    /// Suppresses hard-limit polling while the homing cycle rides the
    /// switches on purpose.
    pub homing_active: bool,
    /// Axes with an established machine origin.
    pub homed_mask: u8,
    /// A work-coordinate offset changed; the next status report must carry
    /// the fresh WCO vector.
    pub wco_dirty: bool,
    /// Countdown until the WCO vector is refreshed in a status report.
    pub report_wco_counter: u8,
    /// Countdown until override percents are refreshed in a status report.
    pub report_ovr_counter: u8,
    /// Latched alarm while in the alarm state.
    pub alarm: Option<crate::status::Alarm>,
}

impl SysState {
    pub fn new() -> Self {
        SysState {
            state: MachineState::Idle,
            suspend: Suspend::empty(),
            step_control: StepControl::empty(),
            f_override: crate::config::DEFAULT_FEED_OVERRIDE,
            r_override: crate::config::DEFAULT_RAPID_OVERRIDE,
            abort: false,
            homing_active: false,
            homed_mask: 0,
            wco_dirty: true,
            report_wco_counter: 0,
            report_ovr_counter: 0,
            alarm: None,
        }
    }

    /// True while the step generator may be producing pulses.
    pub fn motion_active(&self) -> bool {
        matches!(
            self.state,
            MachineState::Cycle | MachineState::Hold | MachineState::Jog
        )
    }
}

impl Default for SysState {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a step snapshot to a mm position vector.
pub fn steps_to_mpos(steps: &[i32; MAX_AXES], settings: &Settings, n_axis: usize) -> [f32; MAX_AXES] {
    let mut out = [0.0; MAX_AXES];
    for axis in 0..n_axis {
        out[axis] = steps[axis] as f32 / settings.axis[axis].steps_per_mm;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rt_state_set_and_clear() {
        let signals = RtSignals::new();
        signals.set_state(RtExec::FEED_HOLD | RtExec::STATUS_REPORT);
        assert!(signals.state().contains(RtExec::FEED_HOLD));
        signals.clear_state(RtExec::FEED_HOLD);
        assert_eq!(signals.state(), RtExec::STATUS_REPORT);
    }

    #[test]
    fn alarm_is_consumed_once() {
        let signals = RtSignals::new();
        signals.set_alarm(Alarm::HardLimit);
        assert_eq!(signals.take_alarm(), Some(Alarm::HardLimit));
        assert_eq!(signals.take_alarm(), None);
    }

    #[test]
    fn override_requests_accumulate() {
        let signals = RtSignals::new();
        signals.set_override(RtOverride::FEED_COARSE_PLUS);
        signals.set_override(RtOverride::RAPID_LOW);
        let taken = signals.take_overrides();
        assert!(taken.contains(RtOverride::FEED_COARSE_PLUS | RtOverride::RAPID_LOW));
        assert!(signals.take_overrides().is_empty());
    }

    #[test]
    fn positions_track_signed_steps() {
        let pos = Positions::new();
        pos.add(0, 5);
        pos.add(0, -2);
        pos.set(1, -100);
        assert_eq!(pos.get(0), 3);
        assert_eq!(pos.snapshot()[1], -100);
    }
}
