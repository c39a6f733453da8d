//! Jogging: one-shot, cancelable motions that bypass the modal state.

use crate::config::MAX_AXES;
use crate::planner::{PlanLineData, PlanResult};
use crate::protocol::Machine;
use crate::status::Status;
use crate::system::MachineState;

impl Machine {
    /// Admits a validated jog target into the planner and starts motion if
    /// the machine is idle. Feed override never applies to jogs.
    pub(crate) fn jog_execute(
        &mut self,
        pl_data: &mut PlanLineData,
        target: &[f32; MAX_AXES],
    ) -> Result<(), Status> {
        // Jogs are refused outright when they would leave the travel
        // envelope; there is no feed-hold-then-alarm dance.
        if self.settings.current.soft_limits {
            for idx in 0..self.config.n_axis {
                if self.sys.homed_mask & (1 << idx) == 0 {
                    continue;
                }
                let max_travel = self.settings.current.axis[idx].max_travel;
                if target[idx] > 0.0 || target[idx] < -max_travel {
                    return Err(Status::TravelExceeded);
                }
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

            if self.sys.state == MachineState::Idle {
                self.sys.state = MachineState::Jog;
                self.st_prep();
                let Machine {
                    stepper, driver, ..
                } = self;
                stepper.wake_up(driver.as_mut());
            }
        }
        Ok(())
    }
}
