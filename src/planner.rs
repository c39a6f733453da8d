//! Look-ahead trajectory planner.
//!
//! A fixed ring of straight-line motion blocks over which junction entry
//! speeds are continually re-optimised as new blocks arrive. The producer
//! writes at `head`; the step generator consumes at `tail` and frees a slot
//! only by advancing it. The speculative `next_head` slot lets a partially
//! built block be abandoned without disturbing the live ring.

use bitflags::bitflags;
use log::debug;

use crate::config::{MAX_AXES, MINIMUM_FEED_RATE, MINIMUM_JUNCTION_SPEED};
use crate::settings::Settings;

/// Queued motion blocks. One slot stays unoccupied to distinguish full from
/// empty, and doubles as the out-of-band system-motion slot.
pub const BLOCK_BUFFER_SIZE: usize = 16;

/// Stand-in for an unconstrained speed bound.
pub const SOME_LARGE_VALUE: f32 = 1.0e38;

bitflags! {
    /// Per-block planning conditions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PlanCondition: u8 {
        /// Motion at the rapid rate (G0), subject to the rapid override.
        const RAPID_MOTION     = 1 << 0;
        /// Homing or other machine-internal motion; bypasses the ring
        /// commit and all overrides.
        const SYSTEM_MOTION    = 1 << 1;
        /// Feed override does not apply (jogging).
        const NO_FEED_OVERRIDE = 1 << 2;
        /// Programmed rate is inverse-time (G93); scaled by length.
        const INVERSE_TIME     = 1 << 3;
    }
}

/// One straight-line motion in step space plus its velocity plan.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanBlock {
    /// Absolute step count per axis; sign lives in `direction_bits`.
    pub steps: [u32; MAX_AXES],
    /// Maximum of `steps`, the Bresenham event count.
    pub step_event_count: u32,
    /// One bit per axis, set for negative travel.
    pub direction_bits: u8,
    pub condition: PlanCondition,
    pub line_number: i32,

    /// Entry speed squared at the junction with the previous block,
    /// (mm/min)^2. Maintained by the recompute passes.
    pub entry_speed_sqr: f32,
    /// Upper bound on `entry_speed_sqr` from the junction geometry and
    /// neighbouring nominal speeds.
    pub max_entry_speed_sqr: f32,
    /// Acceleration limit along this line, mm/min^2.
    pub acceleration: f32,
    /// Euclidean length of the move, mm. Consumed by the step generator as
    /// the block executes.
    pub millimeters: f32,

    /// Junction-deviation speed cap at the entry corner, (mm/min)^2.
    pub max_junction_speed_sqr: f32,
    /// Axis-limit-derived rapid rate along this line, mm/min.
    pub rapid_rate: f32,
    /// Programmed feed, mm/min (pre-scaled for inverse-time blocks).
    pub programmed_rate: f32,
}

/// Per-line planning inputs handed over by the parser.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanLineData {
    pub feed_rate: f32,
    pub condition: PlanCondition,
    pub line_number: i32,
}

/// Outcome of a block submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanResult {
    Queued,
    /// Zero-step move; nothing was produced.
    Empty,
}

/// Normalizes `vector` in place and returns its magnitude.
pub fn convert_delta_vector_to_unit_vector(vector: &mut [f32; MAX_AXES]) -> f32 {
    let mut magnitude = 0.0f32;
    for value in vector.iter() {
        magnitude += value * value;
    }
    let magnitude = magnitude.sqrt();
    if magnitude > 0.0 {
        let inv = 1.0 / magnitude;
        for value in vector.iter_mut() {
            *value *= inv;
        }
    }
    magnitude
}

/// Tightest per-axis limit scaled by that axis's share of the move.
pub fn limit_value_by_axis_maximum(
    max_values: &[f32; MAX_AXES],
    unit_vec: &[f32; MAX_AXES],
    n_axis: usize,
) -> f32 {
    let mut limit = SOME_LARGE_VALUE;
    for idx in 0..n_axis {
        if unit_vec[idx] != 0.0 {
            limit = limit.min((max_values[idx] / unit_vec[idx]).abs());
        }
    }
    limit
}

pub struct Planner {
    buffer: [PlanBlock; BLOCK_BUFFER_SIZE],
    /// Producer index of the next commit.
    head: usize,
    /// Consumer index; the block here may be executing.
    tail: usize,
    /// Speculative slot one past `head`.
    next_head: usize,
    /// Oldest block whose plan is already optimal; the recompute passes
    /// never walk past it.
    planned: usize,
    /// Planned machine position in steps (end of the last queued block).
    position_steps: [i32; MAX_AXES],
    previous_unit_vec: [f32; MAX_AXES],
    previous_nominal_speed: f32,
    n_axis: usize,
}

impl Planner {
    pub fn new(n_axis: usize) -> Self {
        Planner {
            buffer: [PlanBlock::default(); BLOCK_BUFFER_SIZE],
            head: 0,
            tail: 0,
            next_head: 1,
            planned: 0,
            position_steps: [0; MAX_AXES],
            previous_unit_vec: [0.0; MAX_AXES],
            previous_nominal_speed: 0.0,
            n_axis,
        }
    }

    /// Full re-initialization, position included.
    pub fn reset(&mut self) {
        self.position_steps = [0; MAX_AXES];
        self.previous_unit_vec = [0.0; MAX_AXES];
        self.previous_nominal_speed = 0.0;
        self.reset_buffer();
    }

    /// Empties the ring without touching the planned position.
    pub fn reset_buffer(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.next_head = 1;
        self.planned = 0;
    }

    fn next_block_index(&self, index: usize) -> usize {
        (index + 1) % BLOCK_BUFFER_SIZE
    }

    fn prev_block_index(&self, index: usize) -> usize {
        (index + BLOCK_BUFFER_SIZE - 1) % BLOCK_BUFFER_SIZE
    }

    pub fn is_full(&self) -> bool {
        self.next_head == self.tail
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Queued block count.
    pub fn block_count(&self) -> usize {
        (self.head + BLOCK_BUFFER_SIZE - self.tail) % BLOCK_BUFFER_SIZE
    }

    /// Free slots, as reported in the status frame.
    pub fn blocks_available(&self) -> usize {
        BLOCK_BUFFER_SIZE - 1 - self.block_count()
    }

    /// Planned position in steps.
    pub fn position(&self) -> [i32; MAX_AXES] {
        self.position_steps
    }

    /// Re-anchors the planned position, e.g. after an abort or jog cancel.
    pub fn sync_position(&mut self, sys_position: &[i32; MAX_AXES]) {
        self.position_steps = *sys_position;
    }

    /// Oldest queued block, the one the step generator is consuming.
    pub fn current_block(&self) -> Option<&PlanBlock> {
        if self.is_empty() {
            None
        } else {
            Some(&self.buffer[self.tail])
        }
    }

    pub fn current_block_mut(&mut self) -> Option<&mut PlanBlock> {
        if self.is_empty() {
            None
        } else {
            Some(&mut self.buffer[self.tail])
        }
    }

    /// The out-of-band system-motion block (homing). Lives in the head slot
    /// without the ring ever committing it.
    pub fn system_motion_block_mut(&mut self) -> &mut PlanBlock {
        &mut self.buffer[self.head]
    }

    /// Entry speed of the block after the executing one; zero at the end of
    /// the queue.
    pub fn exec_block_exit_speed_sqr(&self) -> f32 {
        let next = self.next_block_index(self.tail);
        if next == self.head {
            0.0
        } else {
            self.buffer[next].entry_speed_sqr
        }
    }

    /// Frees the executing block's slot.
    pub fn discard_current_block(&mut self) {
        if self.is_empty() {
            return;
        }
        if self.planned == self.tail {
            self.planned = self.next_block_index(self.tail);
        }
        self.tail = self.next_block_index(self.tail);
    }

    /// Nominal speed of a block with the current overrides applied.
    pub fn compute_profile_nominal_speed(
        &self,
        block: &PlanBlock,
        f_override: u8,
        r_override: u8,
    ) -> f32 {
        let mut nominal = block.programmed_rate;
        if block.condition.contains(PlanCondition::RAPID_MOTION) {
            nominal *= r_override as f32 / 100.0;
        } else {
            if !block.condition.contains(PlanCondition::NO_FEED_OVERRIDE) {
                nominal *= f_override as f32 / 100.0;
            }
            if nominal > block.rapid_rate {
                nominal = block.rapid_rate;
            }
        }
        nominal.max(MINIMUM_FEED_RATE)
    }

    /// Caps a block's entry speed bound by the junction geometry and the
    /// slower of its own and the previous block's nominal speeds.
    fn compute_profile_parameters(
        block: &mut PlanBlock,
        nominal_speed: f32,
        prev_nominal_speed: f32,
    ) {
        let slower = nominal_speed.min(prev_nominal_speed);
        block.max_entry_speed_sqr = (slower * slower).min(block.max_junction_speed_sqr);
    }

    /// Re-derives every queued block's nominal-speed-dependent bounds after
    /// an override change.
    pub fn update_velocity_profile_parameters(&mut self, f_override: u8, r_override: u8) {
        let mut block_index = self.tail;
        let mut prev_nominal_speed = SOME_LARGE_VALUE;
        while block_index != self.head {
            let nominal_speed = {
                let block = &self.buffer[block_index];
                self.compute_profile_nominal_speed(block, f_override, r_override)
            };
            Self::compute_profile_parameters(
                &mut self.buffer[block_index],
                nominal_speed,
                prev_nominal_speed,
            );
            prev_nominal_speed = nominal_speed;
            block_index = self.next_block_index(block_index);
        }
        self.previous_nominal_speed = prev_nominal_speed;
    }

    /// Adds a straight-line motion to `target` (absolute mm, machine
    /// coordinates). `sys_position` anchors system motions, which are built
    /// in the head slot but never committed to the ring.
    ///
    /// The caller must run [`Planner::recalculate`] after a `Queued` result.
    pub fn buffer_line(
        &mut self,
        target: &[f32; MAX_AXES],
        pl_data: &PlanLineData,
        settings: &Settings,
        sys_position: &[i32; MAX_AXES],
        f_override: u8,
        r_override: u8,
    ) -> PlanResult {
        let mut block = PlanBlock {
            condition: pl_data.condition,
            line_number: pl_data.line_number,
            ..PlanBlock::default()
        };

        let base_steps = if block.condition.contains(PlanCondition::SYSTEM_MOTION) {
            *sys_position
        } else {
            self.position_steps
        };

        let mut target_steps = [0i32; MAX_AXES];
        let mut unit_vec = [0.0f32; MAX_AXES];
        for idx in 0..self.n_axis {
            target_steps[idx] = (target[idx] * settings.axis[idx].steps_per_mm).round() as i32;
            let delta_steps = target_steps[idx] - base_steps[idx];
            block.steps[idx] = delta_steps.unsigned_abs();
            block.step_event_count = block.step_event_count.max(block.steps[idx]);
            let delta_mm = delta_steps as f32 / settings.axis[idx].steps_per_mm;
            unit_vec[idx] = delta_mm;
            if delta_mm < 0.0 {
                block.direction_bits |= 1 << idx;
            }
        }
        if block.step_event_count == 0 {
            return PlanResult::Empty;
        }

        block.millimeters = convert_delta_vector_to_unit_vector(&mut unit_vec);

        let mut accel_limits = [0.0f32; MAX_AXES];
        let mut rate_limits = [0.0f32; MAX_AXES];
        for idx in 0..self.n_axis {
            accel_limits[idx] = settings.axis[idx].acceleration;
            rate_limits[idx] = settings.axis[idx].max_rate;
        }
        block.acceleration = limit_value_by_axis_maximum(&accel_limits, &unit_vec, self.n_axis);
        block.rapid_rate = limit_value_by_axis_maximum(&rate_limits, &unit_vec, self.n_axis);

        if block.condition.contains(PlanCondition::RAPID_MOTION) {
            block.programmed_rate = block.rapid_rate;
        } else {
            block.programmed_rate = pl_data.feed_rate;
            if block.condition.contains(PlanCondition::INVERSE_TIME) {
                block.programmed_rate *= block.millimeters;
            }
        }

        if self.is_empty() || block.condition.contains(PlanCondition::SYSTEM_MOTION) {
            // From rest: junction is unconstrained but entry must be zero.
            block.entry_speed_sqr = 0.0;
            block.max_junction_speed_sqr = 0.0;
        } else {
            // Junction deviation model: the admissible centripetal speed of
            // a circle tangent to both paths whose deviation from the
            // corner equals the configured tolerance.
            let mut junction_unit_vec = [0.0f32; MAX_AXES];
            let mut junction_cos_theta = 0.0f32;
            for idx in 0..self.n_axis {
                junction_cos_theta -= self.previous_unit_vec[idx] * unit_vec[idx];
                junction_unit_vec[idx] = unit_vec[idx] - self.previous_unit_vec[idx];
            }
            if junction_cos_theta > 0.999999 {
                // Full reversal: plan to a stop.
                block.max_junction_speed_sqr = MINIMUM_JUNCTION_SPEED * MINIMUM_JUNCTION_SPEED;
            } else if junction_cos_theta < -0.999999 {
                // Collinear continuation: junction imposes no cap.
                block.max_junction_speed_sqr = SOME_LARGE_VALUE;
            } else {
                convert_delta_vector_to_unit_vector(&mut junction_unit_vec);
                let junction_acceleration =
                    limit_value_by_axis_maximum(&accel_limits, &junction_unit_vec, self.n_axis);
                let sin_theta_d2 = (0.5 * (1.0 - junction_cos_theta)).sqrt();
                block.max_junction_speed_sqr = (MINIMUM_JUNCTION_SPEED
                    * MINIMUM_JUNCTION_SPEED)
                    .max(
                        junction_acceleration * settings.junction_deviation * sin_theta_d2
                            / (1.0 - sin_theta_d2),
                    );
            }
        }

        let nominal_speed = self.compute_profile_nominal_speed(&block, f_override, r_override);
        Self::compute_profile_parameters(&mut block, nominal_speed, self.previous_nominal_speed);

        if block.condition.contains(PlanCondition::SYSTEM_MOTION) {
            block.max_junction_speed_sqr = 0.0;
            block.entry_speed_sqr = 0.0;
            block.max_entry_speed_sqr = 0.0;
            self.buffer[self.head] = block;
            return PlanResult::Queued;
        }

        self.previous_unit_vec = unit_vec;
        self.previous_nominal_speed = nominal_speed;
        self.position_steps = target_steps;

        self.buffer[self.head] = block;
        self.head = self.next_head;
        self.next_head = self.next_block_index(self.head);
        debug!(
            "queued block: {:.3}mm at {:.0}mm/min, {} events",
            block.millimeters, block.programmed_rate, block.step_event_count
        );
        PlanResult::Queued
    }

    /// Reverse-then-forward entry speed optimisation.
    ///
    /// The reverse pass raises entry speeds from the newest block backwards
    /// as far as `planned`; the forward pass caps each entry by what the
    /// previous block can actually accelerate to, advancing `planned` past
    /// blocks that can no longer improve. `on_exec_touch` runs when a pass
    /// lands on the executing block so the step generator can freeze its
    /// entry at the speed currently being traced and re-plan from there.
    pub fn recalculate(&mut self, mut on_exec_touch: impl FnMut(&mut PlanBlock)) {
        if self.is_empty() {
            return;
        }
        let mut block_index = self.prev_block_index(self.head);
        if block_index == self.planned {
            return;
        }

        // Newest block decelerates to rest at the buffer's end.
        {
            let block = &mut self.buffer[block_index];
            block.entry_speed_sqr = block
                .max_entry_speed_sqr
                .min(2.0 * block.acceleration * block.millimeters);
        }

        let mut next_index = block_index;
        block_index = self.prev_block_index(block_index);
        if block_index == self.planned {
            if block_index == self.tail {
                on_exec_touch(&mut self.buffer[block_index]);
            }
        } else {
            while block_index != self.planned {
                if block_index == self.tail {
                    on_exec_touch(&mut self.buffer[block_index]);
                }
                let next_entry = self.buffer[next_index].entry_speed_sqr;
                let current = &mut self.buffer[block_index];
                if current.entry_speed_sqr != current.max_entry_speed_sqr {
                    let entry = next_entry + 2.0 * current.acceleration * current.millimeters;
                    current.entry_speed_sqr = entry.min(current.max_entry_speed_sqr);
                }
                next_index = block_index;
                block_index = self.prev_block_index(block_index);
            }
        }

        // Forward pass from the optimally planned block.
        let mut current_index = self.planned;
        block_index = self.next_block_index(self.planned);
        while block_index != self.head {
            let (current_entry, current_accel, current_mm) = {
                let current = &self.buffer[current_index];
                (
                    current.entry_speed_sqr,
                    current.acceleration,
                    current.millimeters,
                )
            };
            let next = &mut self.buffer[block_index];
            if current_entry < next.entry_speed_sqr {
                let entry_speed_sqr = current_entry + 2.0 * current_accel * current_mm;
                if entry_speed_sqr < next.entry_speed_sqr {
                    next.entry_speed_sqr = entry_speed_sqr;
                    self.planned = block_index;
                }
            }
            if next.entry_speed_sqr == next.max_entry_speed_sqr {
                self.planned = block_index;
            }
            current_index = block_index;
            block_index = self.next_block_index(block_index);
        }
    }

    /// Restarts planning from rest at the executing block, used when a hold
    /// completes or overrides take effect mid-queue.
    pub fn cycle_reinitialize(&mut self, mut on_exec_touch: impl FnMut(&mut PlanBlock)) {
        if self.is_empty() {
            return;
        }
        on_exec_touch(&mut self.buffer[self.tail]);
        self.planned = self.tail;
        self.recalculate(|_| {});
    }

    /// Iterates the queued blocks oldest-first, for diagnostics and tests.
    pub fn iter_blocks(&self) -> impl Iterator<Item = &PlanBlock> + '_ {
        let mut index = self.tail;
        let head = self.head;
        let buffer = &self.buffer;
        std::iter::from_fn(move || {
            if index == head {
                None
            } else {
                let block = &buffer[index];
                index = (index + 1) % BLOCK_BUFFER_SIZE;
                Some(block)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn settings() -> Settings {
        Settings::default()
    }

    fn line(feed: f32) -> PlanLineData {
        PlanLineData {
            feed_rate: feed,
            condition: PlanCondition::empty(),
            line_number: 0,
        }
    }

    fn queue(planner: &mut Planner, target: [f32; MAX_AXES], feed: f32) -> PlanResult {
        let s = settings();
        let result = planner.buffer_line(&target, &line(feed), &s, &[0; MAX_AXES], 100, 100);
        if result == PlanResult::Queued {
            planner.recalculate(|_| {});
        }
        result
    }

    #[test]
    fn zero_length_move_is_dropped() {
        let mut planner = Planner::new(3);
        assert_eq!(queue(&mut planner, [0.0, 0.0, 0.0], 100.0), PlanResult::Empty);
        assert!(planner.is_empty());
    }

    #[test]
    fn single_block_starts_from_rest() {
        let mut planner = Planner::new(3);
        queue(&mut planner, [10.0, 0.0, 0.0], 600.0);
        let block = planner.current_block().unwrap();
        assert_relative_eq!(block.entry_speed_sqr, 0.0);
        assert_eq!(block.step_event_count, 2500); // 10mm * 250 steps/mm
        assert_relative_eq!(block.millimeters, 10.0);
    }

    #[test]
    fn collinear_junction_keeps_speed() {
        let mut planner = Planner::new(3);
        queue(&mut planner, [1.0, 0.0, 0.0], 100.0);
        queue(&mut planner, [2.0, 0.0, 0.0], 100.0);
        queue(&mut planner, [3.0, 0.0, 0.0], 100.0);
        let blocks: Vec<_> = planner.iter_blocks().collect();
        assert_eq!(blocks.len(), 3);
        // The middle block's junction is unconstrained and its planned
        // entry speed is strictly positive.
        assert!(blocks[1].max_junction_speed_sqr >= SOME_LARGE_VALUE * 0.5);
        assert!(blocks[1].entry_speed_sqr > 0.0);
    }

    #[test]
    fn reversal_junction_stops() {
        let mut planner = Planner::new(3);
        queue(&mut planner, [5.0, 0.0, 0.0], 100.0);
        queue(&mut planner, [0.0, 0.0, 0.0], 100.0);
        let blocks: Vec<_> = planner.iter_blocks().collect();
        assert_relative_eq!(blocks[1].max_junction_speed_sqr, 0.0);
        assert_relative_eq!(blocks[1].entry_speed_sqr, 0.0);
    }

    #[test]
    fn right_angle_junction_is_bounded() {
        let mut planner = Planner::new(3);
        queue(&mut planner, [5.0, 0.0, 0.0], 1000.0);
        queue(&mut planner, [5.0, 5.0, 0.0], 1000.0);
        let blocks: Vec<_> = planner.iter_blocks().collect();
        let cap = blocks[1].max_junction_speed_sqr;
        assert!(cap > 0.0 && cap < SOME_LARGE_VALUE);
    }

    #[test]
    fn entry_speed_invariants_hold() {
        let mut planner = Planner::new(3);
        let targets = [
            [2.0, 0.0, 0.0],
            [4.0, 1.0, 0.0],
            [4.0, 5.0, 0.0],
            [0.0, 5.0, 0.0],
            [0.0, 0.0, 0.0],
        ];
        for target in targets {
            queue(&mut planner, target, 800.0);
        }
        for block in planner.iter_blocks() {
            let nominal =
                planner.compute_profile_nominal_speed(block, 100, 100);
            assert!(block.entry_speed_sqr >= 0.0);
            assert!(block.entry_speed_sqr <= block.max_entry_speed_sqr + 1e-3);
            assert!(block.max_entry_speed_sqr <= nominal * nominal + 1e-3);
            assert!(block.max_entry_speed_sqr <= block.max_junction_speed_sqr + 1e-3);
            assert!(block.step_event_count > 0);
            assert_eq!(
                block.step_event_count,
                *block.steps.iter().max().unwrap()
            );
        }
    }

    #[test]
    fn ring_reports_full() {
        let mut planner = Planner::new(3);
        let mut x = 0.0;
        for _ in 0..BLOCK_BUFFER_SIZE - 1 {
            assert!(!planner.is_full());
            x += 1.0;
            queue(&mut planner, [x, 0.0, 0.0], 100.0);
        }
        assert!(planner.is_full());
        assert_eq!(planner.blocks_available(), 0);
        planner.discard_current_block();
        assert!(!planner.is_full());
    }

    #[test]
    fn discard_advances_tail_only() {
        let mut planner = Planner::new(3);
        queue(&mut planner, [1.0, 0.0, 0.0], 100.0);
        queue(&mut planner, [2.0, 0.0, 0.0], 100.0);
        assert_eq!(planner.block_count(), 2);
        planner.discard_current_block();
        assert_eq!(planner.block_count(), 1);
        planner.discard_current_block();
        assert!(planner.is_empty());
        planner.discard_current_block();
        assert!(planner.is_empty());
    }

    #[test]
    fn feed_override_scales_nominal_speed() {
        let mut planner = Planner::new(3);
        queue(&mut planner, [10.0, 0.0, 0.0], 200.0);
        let block = *planner.current_block().unwrap();
        let base = planner.compute_profile_nominal_speed(&block, 100, 100);
        let halved = planner.compute_profile_nominal_speed(&block, 50, 100);
        assert_relative_eq!(halved, base * 0.5);
        // Rapid override leaves feed moves alone.
        let rapid_only = planner.compute_profile_nominal_speed(&block, 100, 25);
        assert_relative_eq!(rapid_only, base);
    }

    #[test]
    fn inverse_time_rate_scales_with_length() {
        let mut planner = Planner::new(3);
        let s = settings();
        let data = PlanLineData {
            feed_rate: 2.0, // two moves per minute
            condition: PlanCondition::INVERSE_TIME,
            line_number: 0,
        };
        planner.buffer_line(&[10.0, 0.0, 0.0], &data, &s, &[0; MAX_AXES], 100, 100);
        let block = planner.current_block().unwrap();
        assert_relative_eq!(block.programmed_rate, 20.0); // 2/min * 10mm
    }
}
