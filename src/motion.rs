//! Motion-level operations sitting between the parser and the planner.
//!
//! Everything here runs in the foreground and may block on a full planner
//! ring; all waiting spins through the realtime checkpoint so holds, resets
//! and overrides stay live.

use log::{info, warn};

use crate::config::{MAX_AXES, X_AXIS, Y_AXIS};
use crate::planner::{PlanCondition, PlanLineData, PlanResult};
use crate::protocol::Machine;
use crate::status::{Alarm, Status};
use crate::system::{MachineState, RtExec, StepControl};

impl Machine {
    /// Queues a straight-line motion to `target` (absolute mm, machine
    /// coordinates), waiting for planner space if necessary.
    pub fn mc_line(&mut self, target: &[f32; MAX_AXES], pl_data: &PlanLineData) -> Result<(), Status> {
        if self.settings.current.soft_limits
            && !pl_data.condition.contains(PlanCondition::SYSTEM_MOTION)
            && self.sys.state != MachineState::Jog
        {
            self.soft_limit_check(target)?;
        }

        if self.sys.state == MachineState::CheckMode {
            return Ok(());
        }

        // Wait for a free slot; auto-starting the cycle keeps the ring
        // draining while we spin.
        loop {
            self.protocol_execute_realtime();
            if self.sys.abort {
                return Ok(());
            }
            if !self.planner.is_full() {
                break;
            }
            self.auto_cycle_start();
            if self.config.checkpoint_ticks == 0 && !self.stepper.is_running() {
                // No tick source can ever drain the ring; surface the stall
                // instead of spinning forever.
                return Err(Status::Overflow);
            }
        }

        let result = self.planner.buffer_line(
            target,
            pl_data,
            &self.settings.current,
            &self.position.snapshot(),
            self.sys.f_override,
            self.sys.r_override,
        );
        if result == PlanResult::Queued {
            let Machine {
                planner, stepper, ..
            } = self;
            planner.recalculate(|block| stepper.update_plan_block_parameters(block));
        }
        Ok(())
    }

    /// Refuses targets outside the homed travel envelope. Machine
    /// coordinates live in negative space: valid travel is
    /// `[-max_travel, 0]` per axis.
    fn soft_limit_check(&mut self, target: &[f32; MAX_AXES]) -> Result<(), Status> {
        let mut violated = false;
        for idx in 0..self.config.n_axis {
            if self.sys.homed_mask & (1 << idx) == 0 {
                continue;
            }
            let max_travel = self.settings.current.axis[idx].max_travel;
            if target[idx] > 0.0 || target[idx] < -max_travel {
                violated = true;
            }
        }
        if !violated {
            return Ok(());
        }
        warn!("soft limit: target outside travel envelope");
        if self.sys.state == MachineState::Cycle {
            // Stop gracefully before alarming so no steps are lost.
            self.signals.set_state(RtExec::FEED_HOLD);
            loop {
                self.protocol_execute_realtime();
                if self.sys.abort {
                    return Err(Status::SoftLimitError);
                }
                if !self.stepper.has_segments() && !self.stepper.is_running() {
                    break;
                }
                if self.config.checkpoint_ticks == 0 {
                    break;
                }
            }
        }
        self.halt_motion();
        self.enter_alarm_from_motion(Alarm::SoftLimit);
        Err(Status::SoftLimitError)
    }

    pub(crate) fn enter_alarm_from_motion(&mut self, alarm: Alarm) {
        self.signals.set_alarm(alarm);
        self.protocol_execute_realtime();
    }

    /// Traces a circular arc by chaining short line segments. `position` is
    /// the current parser position, `offset` the centre offset vector, and
    /// the arc runs in the XY plane (the only supported plane selection).
    #[allow(clippy::too_many_arguments)]
    pub fn mc_arc(
        &mut self,
        target: &[f32; MAX_AXES],
        pl_data: &mut PlanLineData,
        position: &[f32; MAX_AXES],
        offset: &[f32; MAX_AXES],
        radius: f32,
        axis_linear: Option<usize>,
        is_clockwise_arc: bool,
    ) -> Result<(), Status> {
        let center_x = position[X_AXIS] + offset[X_AXIS];
        let center_y = position[Y_AXIS] + offset[Y_AXIS];
        // Radius vector from the centre to the current position.
        let mut r_x = -offset[X_AXIS];
        let mut r_y = -offset[Y_AXIS];
        let rt_x = target[X_AXIS] - center_x;
        let rt_y = target[Y_AXIS] - center_y;

        // CCW angle between position and target, one atan2 only.
        let mut angular_travel = (r_x * rt_y - r_y * rt_x).atan2(r_x * rt_x + r_y * rt_y);
        let epsilon = self.config.arc_angular_travel_epsilon;
        if is_clockwise_arc {
            if angular_travel >= -epsilon {
                // Identical endpoints within the cutoff trace a full circle.
                angular_travel -= 2.0 * std::f32::consts::PI;
            }
        } else if angular_travel <= epsilon {
            angular_travel += 2.0 * std::f32::consts::PI;
        }

        let arc_tolerance = self.settings.current.arc_tolerance;
        let segments = ((0.5 * angular_travel.abs() * radius)
            / (arc_tolerance * (2.0 * radius - arc_tolerance)).sqrt())
        .floor() as u32;

        let mut position = *position;
        if segments > 0 {
            if pl_data.condition.contains(PlanCondition::INVERSE_TIME) {
                // Each sub-segment receives an equal share of the move time.
                pl_data.feed_rate *= segments as f32;
                pl_data.condition.remove(PlanCondition::INVERSE_TIME);
            }

            let theta_per_segment = angular_travel / segments as f32;
            let linear_per_segment = axis_linear
                .map(|axis| (target[axis] - position[axis]) / segments as f32)
                .unwrap_or(0.0);

            // Small-angle rotation matrix terms, corrected with exact
            // trig every few iterations to stop drift accumulating.
            let mut cos_t = 2.0 - theta_per_segment * theta_per_segment;
            let sin_t = theta_per_segment * 0.166_666_67 * (cos_t + 4.0);
            cos_t *= 0.5;

            let mut count = 0u8;
            for i in 1..segments {
                if count < self.config.n_arc_correction {
                    let r_new = r_x * sin_t + r_y * cos_t;
                    r_x = r_x * cos_t - r_y * sin_t;
                    r_y = r_new;
                    count += 1;
                } else {
                    let cos_ti = (i as f32 * theta_per_segment).cos();
                    let sin_ti = (i as f32 * theta_per_segment).sin();
                    r_x = -offset[X_AXIS] * cos_ti + offset[Y_AXIS] * sin_ti;
                    r_y = -offset[X_AXIS] * sin_ti - offset[Y_AXIS] * cos_ti;
                    count = 0;
                }

                position[X_AXIS] = center_x + r_x;
                position[Y_AXIS] = center_y + r_y;
                if let Some(axis) = axis_linear {
                    position[axis] += linear_per_segment;
                }
                self.mc_line(&position, pl_data)?;
                if self.sys.abort {
                    return Ok(());
                }
            }
        }
        // Land exactly on the programmed target.
        self.mc_line(target, pl_data)
    }

    /// G4 dwell: drains the buffer, then waits in realtime-checkpointed
    /// slices.
    pub fn mc_dwell(&mut self, seconds: f32) {
        if self.sys.state == MachineState::CheckMode {
            return;
        }
        self.protocol_buffer_synchronize();
        let step_ms = self.config.dwell_time_step_ms as u64;
        let mut remaining_ms = (seconds * 1000.0) as u64;
        while remaining_ms > 0 && !self.sys.abort {
            let slice = remaining_ms.min(step_ms);
            std::thread::sleep(std::time::Duration::from_millis(slice));
            remaining_ms -= slice;
            self.protocol_execute_realtime();
        }
    }

    /// Homes every axis in `axes`: seek the switch fast, back off, re-approach
    /// slowly, back off again, then make the rest position the machine origin.
    pub fn mc_homing_cycle(&mut self, axes: u8) -> Result<(), Status> {
        self.sys.homing_active = true;
        let result = self.homing_cycle_inner(axes);
        self.sys.homing_active = false;
        self.sys.step_control = StepControl::empty();
        self.stepper.reset();

        match result {
            Ok(()) => {
                for idx in 0..self.config.n_axis {
                    if axes & (1 << idx) != 0 {
                        self.position.set(idx, 0);
                    }
                }
                self.sys.homed_mask |= axes;
                self.plan_sync_position();
                self.gc_sync_position();
                self.sys.wco_dirty = true;
                info!("homing complete, mask {:#05b}", axes);
                Ok(())
            }
            Err(alarm) => {
                self.halt_motion();
                self.enter_alarm_from_motion(alarm);
                Err(Status::SystemGcLock)
            }
        }
    }

    fn homing_cycle_inner(&mut self, axes: u8) -> Result<(), Alarm> {
        let seek_rate = self.settings.current.homing_seek_rate;
        let feed_rate = self.settings.current.homing_feed_rate;
        let pulloff = self.settings.current.homing_pulloff;
        for idx in 0..self.config.n_axis {
            if axes & (1 << idx) == 0 {
                continue;
            }
            let travel = self.settings.current.axis[idx].max_travel * 1.5;
            self.homing_move(idx, seek_rate, travel, true)?;
            self.homing_move(idx, seek_rate, pulloff, false)?;
            self.homing_move(idx, feed_rate, pulloff * 2.0, true)?;
            self.homing_move(idx, feed_rate, pulloff, false)?;
        }
        Ok(())
    }

    /// One homing stroke on `axis`. `toward_switch` strokes expect the limit
    /// to trigger before the distance runs out; pull-off strokes expect it
    /// to release by the end.
    fn homing_move(
        &mut self,
        axis: usize,
        rate: f32,
        distance: f32,
        toward_switch: bool,
    ) -> Result<(), Alarm> {
        let axis_bit = 1u8 << axis;
        // A set homing-direction bit searches the negative end.
        let search_negative = self.settings.current.homing_dir_mask & axis_bit != 0;
        let sign = if search_negative == toward_switch { -1.0 } else { 1.0 };

        let mut target = self
            .position
            .mpos_all(&self.settings.current, self.config.n_axis);
        target[axis] += sign * distance;

        let pl_data = PlanLineData {
            feed_rate: rate,
            condition: PlanCondition::SYSTEM_MOTION | PlanCondition::NO_FEED_OVERRIDE,
            line_number: 0,
        };
        let snapshot = self.position.snapshot();
        let result = self.planner.buffer_line(
            &target,
            &pl_data,
            &self.settings.current,
            &snapshot,
            100,
            100,
        );
        if result != PlanResult::Queued {
            return Ok(()); // Zero-length stroke; e.g. pull-off of 0.
        }

        self.sys.step_control = StepControl::EXECUTE_SYS_MOTION;
        self.stepper.homing_axis_lock = axis_bit;
        {
            let Machine {
                stepper, driver, ..
            } = self;
            stepper.wake_up(driver.as_mut());
        }

        let ticks_per_poll = self.config.checkpoint_ticks.max(16);
        loop {
            let triggered = self.limits.triggered_mask() & axis_bit != 0;
            if toward_switch && triggered {
                // Found the switch: kill the stroke where it stands.
                self.stepper.reset();
                self.planner.reset_buffer();
                self.sys.step_control = StepControl::empty();
                self.plan_sync_position();
                return Ok(());
            }

            if self.signals.state().contains(RtExec::RESET) {
                self.sys.abort = true;
                return Err(Alarm::HomingFailReset);
            }

            if self.sys.step_control.contains(StepControl::END_MOTION)
                && !self.stepper.has_segments()
            {
                // Stroke ran to completion.
                self.stepper.reset();
                self.planner.reset_buffer();
                self.sys.step_control = StepControl::empty();
                self.plan_sync_position();
                return if toward_switch {
                    Err(Alarm::HomingFailApproach)
                } else if self.limits.triggered_mask() & axis_bit != 0 {
                    Err(Alarm::HomingFailPulloff)
                } else {
                    Ok(())
                };
            }

            for _ in 0..ticks_per_poll {
                self.st_prep();
                if !self.stepper.is_running() {
                    break;
                }
                self.stepper_tick();
            }
        }
    }

    /// Kills motion dead and schedules a reset; the abort-cycle alarm is
    /// raised if steps could have been lost.
    pub fn mc_reset(&mut self) {
        info!("motion reset requested");
        self.signals.set_state(RtExec::RESET);
        if self.sys.motion_active() || self.stepper.has_segments() {
            self.signals.set_alarm(Alarm::AbortCycle);
            self.halt_motion();
        }
    }
}
