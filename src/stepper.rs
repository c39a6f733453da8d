//! Step segment generator and the step interrupt engine.
//!
//! The prep side ("main loop" context) carves the executing planner block
//! into short constant-rate segments that trace its velocity profile, and
//! keeps the small segment ring topped up. The tick side models the
//! periodic step interrupt: it drains segments and emits per-axis pulses
//! with a Bresenham line algorithm. The tick never allocates and never
//! touches a planner block; its whole world is the immutable stepper-block
//! cache plus the segment ring.

use bitflags::bitflags;
use log::trace;

use crate::config::{MachineConfig, MAX_AXES};
use crate::hal::StepDriver;
use crate::planner::{PlanBlock, Planner};
use crate::settings::Settings;
use crate::system::{Positions, RtExec, RtSignals, StepControl, SysState};

/// Segment ring capacity; roughly 50 ms of lead time at the default
/// acceleration tick rate.
pub const SEGMENT_BUFFER_SIZE: usize = 6;

/// Deepest adaptive step-smoothing level. Stepper-block step counts are
/// pre-shifted by this so any level can be selected per segment.
pub const MAX_AMASS_LEVEL: u8 = 3;

// Over-sampling factor keeping at least one step in very slow segments.
const REQ_MM_INCREMENT_SCALAR: f32 = 1.25;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct PrepFlags: u8 {
        /// Re-derive the velocity profile of the block already being
        /// prepped, keeping its remaining-step bookkeeping.
        const RECALCULATE    = 1 << 0;
        /// The next block must start as a deceleration because an override
        /// reduction left it faster than its planned entry.
        const DECEL_OVERRIDE = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ramp {
    Accel,
    Cruise,
    Decel,
    DecelOverride,
}

/// Direction bits and Bresenham counts mirrored from a planner block.
/// Published once per block and immutable while the tick side reads it.
#[derive(Debug, Clone, Copy, Default)]
struct StBlock {
    direction_bits: u8,
    steps: [u32; MAX_AXES],
    step_event_count: u32,
}

/// One constant-rate slice of a block's trajectory.
#[derive(Debug, Clone, Copy, Default)]
pub struct Segment {
    /// Interrupt ticks in this segment (post-smoothing).
    pub n_step: u16,
    /// Timer reload value, in `timer_hz` cycles per tick.
    pub cycles_per_tick: u32,
    /// Which stepper-block cache entry this segment executes.
    pub st_block_index: usize,
    /// Adaptive smoothing level; step events are subdivided by
    /// `2^amass_level`.
    pub amass_level: u8,
}

#[derive(Debug)]
struct PrepState {
    st_block_index: usize,
    flags: PrepFlags,
    /// A planner block is mid-prep; its profile state below is live.
    block_active: bool,
    steps_remaining: f32,
    step_per_mm: f32,
    req_mm_increment: f32,
    dt_remainder: f32,
    ramp_type: Ramp,
    /// Distance from block end where the profile stops early (feed hold
    /// deceleration point); zero for a full block.
    mm_complete: f32,
    current_speed: f32,
    maximum_speed: f32,
    exit_speed: f32,
    accelerate_until: f32,
    decelerate_after: f32,
}

impl Default for PrepState {
    fn default() -> Self {
        PrepState {
            st_block_index: 0,
            flags: PrepFlags::empty(),
            block_active: false,
            steps_remaining: 0.0,
            step_per_mm: 0.0,
            req_mm_increment: 0.0,
            dt_remainder: 0.0,
            ramp_type: Ramp::Accel,
            mm_complete: 0.0,
            current_speed: 0.0,
            maximum_speed: 0.0,
            exit_speed: 0.0,
            accelerate_until: 0.0,
            decelerate_after: 0.0,
        }
    }
}

pub struct Stepper {
    // Segment ring: prep produces at head, the tick consumes at tail.
    segments: [Segment; SEGMENT_BUFFER_SIZE],
    segment_head: usize,
    segment_tail: usize,
    segment_next_head: usize,
    st_blocks: [StBlock; SEGMENT_BUFFER_SIZE],

    // Tick-side state.
    counters: [u32; MAX_AXES],
    exec_steps: [u32; MAX_AXES],
    exec_block_index: Option<usize>,
    exec_segment: Option<Segment>,
    step_count: u16,
    dir_outbits: u8,
    running: bool,
    /// Axes allowed to emit pulses; homing narrows this to the cycle axes.
    pub homing_axis_lock: u8,

    prep: PrepState,

    // Derived configuration.
    amass_threshold: [u32; MAX_AMASS_LEVEL as usize],
    /// Segment duration in minutes.
    dt_segment: f32,
    timer_hz: u32,
    n_axis: usize,
}

impl Stepper {
    pub fn new(config: &MachineConfig) -> Self {
        Stepper {
            segments: [Segment::default(); SEGMENT_BUFFER_SIZE],
            segment_head: 0,
            segment_tail: 0,
            segment_next_head: 1,
            st_blocks: [StBlock::default(); SEGMENT_BUFFER_SIZE],
            counters: [0; MAX_AXES],
            exec_steps: [0; MAX_AXES],
            exec_block_index: None,
            exec_segment: None,
            step_count: 0,
            dir_outbits: 0,
            running: false,
            homing_axis_lock: 0xff,
            prep: PrepState::default(),
            amass_threshold: [
                config.timer_hz / 8000,
                config.timer_hz / 4000,
                config.timer_hz / 2000,
            ],
            dt_segment: 1.0 / (config.acceleration_ticks_per_second as f32 * 60.0),
            timer_hz: config.timer_hz,
            n_axis: config.n_axis,
        }
    }

    /// Clears all generator and interrupt state. The planner ring is the
    /// caller's to flush.
    pub fn reset(&mut self) {
        self.segment_head = 0;
        self.segment_tail = 0;
        self.segment_next_head = 1;
        self.counters = [0; MAX_AXES];
        self.exec_steps = [0; MAX_AXES];
        self.exec_block_index = None;
        self.exec_segment = None;
        self.step_count = 0;
        self.dir_outbits = 0;
        self.running = false;
        self.homing_axis_lock = 0xff;
        self.prep = PrepState::default();
    }

    pub fn wake_up(&mut self, driver: &mut dyn StepDriver) {
        driver.set_enabled(true);
        self.running = true;
    }

    pub fn go_idle(&mut self, driver: &mut dyn StepDriver, settings: &Settings) {
        self.running = false;
        // 255 keeps the motors energized between motions.
        if settings.stepper_idle_lock_time != 255 {
            driver.set_enabled(false);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn segment_ring_full(&self) -> bool {
        self.segment_next_head == self.segment_tail
    }

    pub fn has_segments(&self) -> bool {
        self.segment_head != self.segment_tail || self.exec_segment.is_some()
    }

    /// Speed currently being traced, mm/min. Reported in the status frame.
    pub fn realtime_rate(&self) -> f32 {
        if self.prep.block_active || self.has_segments() {
            self.prep.current_speed
        } else {
            0.0
        }
    }

    /// Freezes the executing block's entry speed at the speed being traced
    /// and flags the profile for recomputation. Called by the planner when
    /// a recompute pass lands on the executing block, and on feed hold.
    pub fn update_plan_block_parameters(&mut self, block: &mut PlanBlock) {
        if self.prep.block_active {
            self.prep.flags.insert(PrepFlags::RECALCULATE);
            block.entry_speed_sqr = self.prep.current_speed * self.prep.current_speed;
            self.prep.block_active = false;
        }
    }

    fn next_segment_index(index: usize) -> usize {
        (index + 1) % SEGMENT_BUFFER_SIZE
    }

    /// Fills the segment ring from the executing planner block, tracing its
    /// acceleration/cruise/deceleration profile in ~one-tick slices.
    pub fn prep_buffer(
        &mut self,
        planner: &mut Planner,
        sys: &mut SysState,
        settings: &Settings,
    ) {
        if sys.step_control.contains(StepControl::END_MOTION) {
            return;
        }

        while !self.segment_ring_full() {
            let sys_motion = sys.step_control.contains(StepControl::EXECUTE_SYS_MOTION);

            // Fetch the block being prepped. Mutations are written back at
            // the single commit point below.
            let mut blk = if sys_motion {
                *planner.system_motion_block_mut()
            } else {
                match planner.current_block() {
                    Some(block) => *block,
                    None => return,
                }
            };

            if !self.prep.block_active {
                if self.prep.flags.contains(PrepFlags::RECALCULATE) {
                    // Same block, new profile: keep the step bookkeeping and
                    // the traced speed; only the profile below is re-derived.
                    self.prep.flags.remove(PrepFlags::RECALCULATE);
                } else {
                    // Publish the Bresenham data for a fresh block.
                    self.prep.st_block_index =
                        Self::next_segment_index(self.prep.st_block_index);
                    let st_block = &mut self.st_blocks[self.prep.st_block_index];
                    st_block.direction_bits = blk.direction_bits;
                    st_block.step_event_count = blk.step_event_count << MAX_AMASS_LEVEL;
                    for idx in 0..self.n_axis {
                        st_block.steps[idx] = blk.steps[idx] << MAX_AMASS_LEVEL;
                    }
                    self.prep.steps_remaining = blk.step_event_count as f32;
                    self.prep.step_per_mm = self.prep.steps_remaining / blk.millimeters;
                    self.prep.req_mm_increment =
                        REQ_MM_INCREMENT_SCALAR / self.prep.step_per_mm;
                    self.prep.dt_remainder = 0.0;

                    if sys.step_control.contains(StepControl::EXECUTE_HOLD)
                        || self.prep.flags.contains(PrepFlags::DECEL_OVERRIDE)
                    {
                        // New block entered mid-hold or after an override
                        // reduction: it begins at the traced exit speed.
                        self.prep.current_speed = self.prep.exit_speed;
                        blk.entry_speed_sqr = self.prep.exit_speed * self.prep.exit_speed;
                        self.prep.flags.remove(PrepFlags::DECEL_OVERRIDE);
                    } else {
                        self.prep.current_speed = blk.entry_speed_sqr.sqrt();
                    }
                }

                // Velocity profile of the (remaining) block.
                self.prep.mm_complete = 0.0;
                let inv_2_accel = 0.5 / blk.acceleration;
                if sys.step_control.contains(StepControl::EXECUTE_HOLD) {
                    // Forced deceleration to zero.
                    self.prep.ramp_type = Ramp::Decel;
                    let decel_dist = blk.millimeters - inv_2_accel * blk.entry_speed_sqr;
                    if decel_dist < 0.0 {
                        // Hold does not finish inside this block.
                        self.prep.exit_speed = (blk.entry_speed_sqr
                            - 2.0 * blk.acceleration * blk.millimeters)
                            .max(0.0)
                            .sqrt();
                    } else {
                        self.prep.mm_complete = decel_dist;
                        self.prep.exit_speed = 0.0;
                    }
                } else {
                    self.prep.ramp_type = Ramp::Accel;
                    self.prep.accelerate_until = blk.millimeters;

                    let exit_speed_sqr = if sys_motion {
                        self.prep.exit_speed = 0.0;
                        0.0
                    } else {
                        let exit = planner.exec_block_exit_speed_sqr();
                        self.prep.exit_speed = exit.sqrt();
                        exit
                    };

                    let nominal_speed = planner.compute_profile_nominal_speed(
                        &blk,
                        sys.f_override,
                        sys.r_override,
                    );
                    let nominal_speed_sqr = nominal_speed * nominal_speed;
                    let intersect_distance = 0.5
                        * (blk.millimeters
                            + inv_2_accel * (blk.entry_speed_sqr - exit_speed_sqr));

                    if blk.entry_speed_sqr > nominal_speed_sqr {
                        // Only possible after an override reduction.
                        self.prep.accelerate_until = blk.millimeters
                            - inv_2_accel * (blk.entry_speed_sqr - nominal_speed_sqr);
                        if self.prep.accelerate_until <= 0.0 {
                            // The whole block decelerates and still exits
                            // fast; the next block continues the ramp-down.
                            self.prep.ramp_type = Ramp::Decel;
                            self.prep.exit_speed = (blk.entry_speed_sqr
                                - 2.0 * blk.acceleration * blk.millimeters)
                                .max(0.0)
                                .sqrt();
                            self.prep.flags.insert(PrepFlags::DECEL_OVERRIDE);
                        } else {
                            self.prep.decelerate_after =
                                inv_2_accel * (nominal_speed_sqr - exit_speed_sqr);
                            self.prep.maximum_speed = nominal_speed;
                            self.prep.ramp_type = Ramp::DecelOverride;
                        }
                    } else if intersect_distance > 0.0 {
                        if intersect_distance < blk.millimeters {
                            // Trapezoid or triangle.
                            self.prep.decelerate_after =
                                inv_2_accel * (nominal_speed_sqr - exit_speed_sqr);
                            if self.prep.decelerate_after < intersect_distance {
                                // Trapezoid.
                                self.prep.maximum_speed = nominal_speed;
                                if blk.entry_speed_sqr == nominal_speed_sqr {
                                    self.prep.ramp_type = Ramp::Cruise;
                                } else {
                                    self.prep.accelerate_until -= inv_2_accel
                                        * (nominal_speed_sqr - blk.entry_speed_sqr);
                                }
                            } else {
                                // Triangle.
                                self.prep.accelerate_until = intersect_distance;
                                self.prep.decelerate_after = intersect_distance;
                                self.prep.maximum_speed = (2.0
                                    * blk.acceleration
                                    * intersect_distance
                                    + exit_speed_sqr)
                                    .sqrt();
                            }
                        } else {
                            // Deceleration spans the whole block.
                            self.prep.ramp_type = Ramp::Decel;
                        }
                    } else {
                        // Acceleration spans the whole block.
                        self.prep.accelerate_until = 0.0;
                        self.prep.maximum_speed = self.prep.exit_speed;
                    }
                }

                self.prep.block_active = true;
            }

            // Slice one segment off the remaining profile. Worker loop runs
            // once per ramp junction crossed inside the segment window.
            let mut dt_max = self.dt_segment;
            let mut dt = 0.0f32;
            let mut time_var = dt_max;
            let mut mm_remaining = blk.millimeters;
            let minimum_mm = (mm_remaining - self.prep.req_mm_increment).max(0.0);

            loop {
                match self.prep.ramp_type {
                    Ramp::DecelOverride => {
                        let speed_var = blk.acceleration * time_var;
                        let mm_var = time_var * (self.prep.current_speed - 0.5 * speed_var);
                        mm_remaining -= mm_var;
                        if mm_remaining < self.prep.accelerate_until || mm_var <= 0.0 {
                            mm_remaining = self.prep.accelerate_until;
                            time_var = 2.0 * (blk.millimeters - mm_remaining)
                                / (self.prep.current_speed + self.prep.maximum_speed);
                            self.prep.ramp_type = Ramp::Cruise;
                            self.prep.current_speed = self.prep.maximum_speed;
                        } else {
                            self.prep.current_speed -= speed_var;
                        }
                    }
                    Ramp::Accel => {
                        let speed_var = blk.acceleration * time_var;
                        mm_remaining -= time_var * (self.prep.current_speed + 0.5 * speed_var);
                        if mm_remaining < self.prep.accelerate_until {
                            // Ramp ends inside this segment.
                            mm_remaining = self.prep.accelerate_until;
                            time_var = 2.0 * (blk.millimeters - mm_remaining)
                                / (self.prep.current_speed + self.prep.maximum_speed);
                            self.prep.ramp_type = if mm_remaining == self.prep.decelerate_after
                            {
                                Ramp::Decel
                            } else {
                                Ramp::Cruise
                            };
                            self.prep.current_speed = self.prep.maximum_speed;
                        } else {
                            self.prep.current_speed += speed_var;
                        }
                    }
                    Ramp::Cruise => {
                        let mm_var = mm_remaining - self.prep.maximum_speed * time_var;
                        if mm_var < self.prep.decelerate_after {
                            time_var = (mm_remaining - self.prep.decelerate_after)
                                / self.prep.maximum_speed;
                            mm_remaining = self.prep.decelerate_after;
                            self.prep.ramp_type = Ramp::Decel;
                        } else {
                            mm_remaining = mm_var;
                        }
                    }
                    Ramp::Decel => {
                        let speed_var = blk.acceleration * time_var;
                        if self.prep.current_speed > speed_var {
                            let mm_var = mm_remaining
                                - time_var * (self.prep.current_speed - 0.5 * speed_var);
                            if mm_var > self.prep.mm_complete {
                                mm_remaining = mm_var;
                                self.prep.current_speed -= speed_var;
                                // Segment time continues below.
                            } else {
                                // End of block or of the forced stop.
                                time_var = 2.0 * (mm_remaining - self.prep.mm_complete)
                                    / (self.prep.current_speed + self.prep.exit_speed);
                                mm_remaining = self.prep.mm_complete;
                                self.prep.current_speed = self.prep.exit_speed;
                            }
                        } else {
                            time_var = 2.0 * (mm_remaining - self.prep.mm_complete)
                                / (self.prep.current_speed + self.prep.exit_speed);
                            mm_remaining = self.prep.mm_complete;
                            self.prep.current_speed = self.prep.exit_speed;
                        }
                    }
                }

                dt += time_var;
                if dt < dt_max {
                    time_var = dt_max - dt;
                } else if mm_remaining > minimum_mm {
                    // Too slow for a whole step in one window: widen it.
                    dt_max += self.dt_segment;
                    time_var = dt_max - dt;
                } else {
                    break;
                }
                if mm_remaining <= self.prep.mm_complete {
                    break;
                }
            }

            // Convert the slice to steps and a timer reload value.
            let step_dist_remaining = self.prep.step_per_mm * mm_remaining;
            let n_steps_remaining = step_dist_remaining.ceil();
            let last_n_steps_remaining = self.prep.steps_remaining.ceil();
            let raw_n_step = (last_n_steps_remaining - n_steps_remaining) as u32;

            if raw_n_step == 0 {
                if sys.step_control.contains(StepControl::EXECUTE_HOLD) {
                    // Under one step left while stopping; close out here and
                    // let the interrupt drain what is queued.
                    trace!("hold reached zero speed");
                    sys.step_control.insert(StepControl::END_MOTION);
                    return;
                }
            }

            dt += self.prep.dt_remainder;
            let inv_rate = dt / (last_n_steps_remaining - step_dist_remaining);
            let mut cycles = (self.timer_hz as f32 * 60.0 * inv_rate).ceil();

            let mut amass_level = 0u8;
            let mut n_step = raw_n_step;
            if cycles >= self.amass_threshold[0] as f32 {
                amass_level = if cycles < self.amass_threshold[1] as f32 {
                    1
                } else if cycles < self.amass_threshold[2] as f32 {
                    2
                } else {
                    3
                };
                cycles /= (1u32 << amass_level) as f32;
                n_step <<= amass_level;
            }
            let cycles_per_tick = if cycles < u32::MAX as f32 {
                cycles as u32
            } else {
                u32::MAX
            };

            self.segments[self.segment_head] = Segment {
                n_step: n_step as u16,
                cycles_per_tick,
                st_block_index: self.prep.st_block_index,
                amass_level,
            };
            self.segment_head = self.segment_next_head;
            self.segment_next_head = Self::next_segment_index(self.segment_head);

            // Commit the consumed distance back to the block and the prep
            // bookkeeping.
            blk.millimeters = mm_remaining;
            if sys_motion {
                *planner.system_motion_block_mut() = blk;
            } else if let Some(block) = planner.current_block_mut() {
                *block = blk;
            }
            self.prep.steps_remaining = n_steps_remaining;
            self.prep.dt_remainder = (n_steps_remaining - step_dist_remaining) * inv_rate;

            if mm_remaining == self.prep.mm_complete {
                if mm_remaining > 0.0 {
                    // Forced stop mid-block; hold the partial block for the
                    // resume to re-plan.
                    sys.step_control.insert(StepControl::END_MOTION);
                    return;
                }
                // Block fully sliced.
                if sys_motion {
                    sys.step_control.insert(StepControl::END_MOTION);
                    return;
                }
                self.prep.block_active = false;
                planner.discard_current_block();
            }
        }
    }

    /// One step interrupt. Loads the next segment when the current one is
    /// exhausted, runs the Bresenham kernel across all axes, advances the
    /// shared position vector, and raises the cycle-stop flag when the ring
    /// drains with motion ending.
    pub fn tick(
        &mut self,
        driver: &mut dyn StepDriver,
        position: &Positions,
        signals: &RtSignals,
        settings: &Settings,
    ) {
        if !self.running {
            return;
        }

        if self.exec_segment.is_none() {
            if self.segment_head != self.segment_tail {
                let segment = self.segments[self.segment_tail];
                self.step_count = segment.n_step;
                if self.exec_block_index != Some(segment.st_block_index) {
                    self.exec_block_index = Some(segment.st_block_index);
                    let count = self.st_blocks[segment.st_block_index].step_event_count;
                    self.counters = [count >> 1; MAX_AXES];
                }
                let block = &self.st_blocks[segment.st_block_index];
                self.dir_outbits = block.direction_bits;
                for idx in 0..self.n_axis {
                    self.exec_steps[idx] = block.steps[idx] >> segment.amass_level;
                }
                self.exec_segment = Some(segment);
            } else {
                // Ring drained: motion is complete or was told to end.
                self.go_idle(driver, settings);
                signals.set_state(RtExec::CYCLE_STOP);
                return;
            }
        }

        let Some(segment) = self.exec_segment else {
            return;
        };

        driver.set_direction_mask(self.dir_outbits);

        let block = &self.st_blocks[segment.st_block_index];
        let mut step_outbits = 0u8;
        for idx in 0..self.n_axis {
            self.counters[idx] += self.exec_steps[idx];
            if self.counters[idx] > block.step_event_count {
                self.counters[idx] -= block.step_event_count;
                step_outbits |= 1 << idx;
                if block.direction_bits & (1 << idx) != 0 {
                    position.add(idx, -1);
                } else {
                    position.add(idx, 1);
                }
            }
        }
        step_outbits &= self.homing_axis_lock;
        driver.pulse(step_outbits);

        self.step_count -= 1;
        if self.step_count == 0 {
            self.exec_segment = None;
            self.segment_tail = Self::next_segment_index(self.segment_tail);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;
    use crate::hal::SimDriver;
    use crate::planner::{PlanCondition, PlanLineData, PlanResult};
    use std::sync::Arc;

    struct Rig {
        planner: Planner,
        stepper: Stepper,
        sys: SysState,
        settings: Settings,
        driver: SimDriver,
        position: Arc<Positions>,
        signals: Arc<RtSignals>,
    }

    fn rig() -> Rig {
        let config = MachineConfig::default();
        Rig {
            planner: Planner::new(config.n_axis),
            stepper: Stepper::new(&config),
            sys: SysState::new(),
            settings: Settings::default(),
            driver: SimDriver::new(),
            position: Arc::new(Positions::new()),
            signals: Arc::new(RtSignals::new()),
        }
    }

    fn queue_line(rig: &mut Rig, target: [f32; MAX_AXES], feed: f32) {
        let data = PlanLineData {
            feed_rate: feed,
            condition: PlanCondition::empty(),
            line_number: 0,
        };
        let result = rig.planner.buffer_line(
            &target,
            &data,
            &rig.settings,
            &rig.position.snapshot(),
            rig.sys.f_override,
            rig.sys.r_override,
        );
        assert_eq!(result, PlanResult::Queued);
        let stepper = &mut rig.stepper;
        rig.planner
            .recalculate(|blk| stepper.update_plan_block_parameters(blk));
    }

    /// Pumps prep and the tick until motion stops or the tick budget runs
    /// out. Returns ticks consumed.
    fn run_to_completion(rig: &mut Rig, max_ticks: u64) -> u64 {
        rig.stepper.wake_up(&mut rig.driver);
        let mut ticks = 0;
        while ticks < max_ticks {
            rig.stepper
                .prep_buffer(&mut rig.planner, &mut rig.sys, &rig.settings);
            if !rig.stepper.is_running() {
                break;
            }
            rig.stepper
                .tick(&mut rig.driver, &rig.position, &rig.signals, &rig.settings);
            ticks += 1;
        }
        ticks
    }

    #[test]
    fn line_emits_exact_step_count() {
        let mut rig = rig();
        queue_line(&mut rig, [10.0, 0.0, 0.0], 600.0);
        run_to_completion(&mut rig, 2_000_000);
        // 10 mm at 250 steps/mm.
        assert_eq!(rig.driver.steps[0], 2500);
        assert_eq!(rig.driver.steps[1], 0);
        assert_eq!(rig.driver.steps[2], 0);
        assert_eq!(rig.position.get(0), 2500);
        assert!(rig.planner.is_empty());
        assert!(rig.signals.state().contains(RtExec::CYCLE_STOP));
    }

    #[test]
    fn negative_move_counts_down() {
        let mut rig = rig();
        queue_line(&mut rig, [-4.0, 0.0, 0.0], 400.0);
        run_to_completion(&mut rig, 2_000_000);
        assert_eq!(rig.driver.steps[0], 1000);
        assert_eq!(rig.position.get(0), -1000);
    }

    #[test]
    fn diagonal_move_steps_both_axes() {
        let mut rig = rig();
        queue_line(&mut rig, [2.0, 2.0, 0.0], 500.0);
        run_to_completion(&mut rig, 2_000_000);
        assert_eq!(rig.driver.steps[0], 500);
        assert_eq!(rig.driver.steps[1], 500);
        assert_eq!(rig.position.get(0), 500);
        assert_eq!(rig.position.get(1), 500);
    }

    #[test]
    fn back_to_back_blocks_all_complete() {
        let mut rig = rig();
        queue_line(&mut rig, [1.0, 0.0, 0.0], 300.0);
        queue_line(&mut rig, [2.0, 0.0, 0.0], 300.0);
        queue_line(&mut rig, [3.0, 0.0, 0.0], 300.0);
        run_to_completion(&mut rig, 4_000_000);
        assert_eq!(rig.driver.steps[0], 750);
        assert_eq!(rig.position.get(0), 750);
        assert!(rig.planner.is_empty());
    }

    #[test]
    fn hold_decelerates_and_ends_motion() {
        let mut rig = rig();
        queue_line(&mut rig, [100.0, 0.0, 0.0], 1000.0);
        rig.stepper.wake_up(&mut rig.driver);
        // Run a little, then order a hold.
        for _ in 0..2000 {
            rig.stepper
                .prep_buffer(&mut rig.planner, &mut rig.sys, &rig.settings);
            rig.stepper
                .tick(&mut rig.driver, &rig.position, &rig.signals, &rig.settings);
        }
        if let Some(block) = rig.planner.current_block_mut() {
            rig.stepper.update_plan_block_parameters(block);
        }
        rig.sys.step_control = StepControl::EXECUTE_HOLD;
        let ticks = run_to_completion(&mut rig, 6_000_000);
        assert!(ticks < 6_000_000, "hold never completed");
        assert!(rig.sys.step_control.contains(StepControl::END_MOTION));
        // Strictly between start and programmed end.
        let steps = rig.position.get(0);
        assert!(steps > 0 && steps < 25_000, "stopped at {steps}");
    }

    #[test]
    fn slow_segments_select_amass_levels() {
        let mut rig = rig();
        // 5 mm/min on a 250 steps/mm axis is ~20 steps/sec, far below the
        // smoothing cutoff.
        queue_line(&mut rig, [0.2, 0.0, 0.0], 5.0);
        rig.stepper.wake_up(&mut rig.driver);
        rig.stepper
            .prep_buffer(&mut rig.planner, &mut rig.sys, &rig.settings);
        let mut saw_amass = false;
        let mut index = rig.stepper.segment_tail;
        while index != rig.stepper.segment_head {
            if rig.stepper.segments[index].amass_level > 0 {
                saw_amass = true;
            }
            index = Stepper::next_segment_index(index);
        }
        assert!(saw_amass, "no smoothing applied to a very slow move");
    }

    #[test]
    fn isr_never_reads_past_producer() {
        let mut rig = rig();
        queue_line(&mut rig, [1.0, 0.0, 0.0], 200.0);
        rig.stepper.wake_up(&mut rig.driver);
        // Tick without ever prepping: the ring is empty, so the interrupt
        // must stop cleanly rather than execute stale data.
        rig.stepper
            .tick(&mut rig.driver, &rig.position, &rig.signals, &rig.settings);
        assert_eq!(rig.driver.steps[0], 0);
        assert!(!rig.stepper.is_running());
        assert!(rig.signals.state().contains(RtExec::CYCLE_STOP));
    }
}
