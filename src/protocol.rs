//! Protocol loop and realtime executor.
//!
//! [`Machine`] owns every subsystem and is the single foreground task: line
//! execution, `$` commands, and the flag-driven state machine that reacts to
//! asynchronous requests pushed in by the receive side. All long-running
//! operations funnel through [`Machine::protocol_execute_realtime`], the
//! only suspension point.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::config::{
    axes_mask, MachineConfig, DEFAULT_FEED_OVERRIDE, DEFAULT_RAPID_OVERRIDE,
    FEED_OVERRIDE_COARSE_INCREMENT, FEED_OVERRIDE_FINE_INCREMENT, MAX_FEED_RATE_OVERRIDE,
    MIN_FEED_RATE_OVERRIDE, RAPID_OVERRIDE_LOW, RAPID_OVERRIDE_MEDIUM,
};
use crate::gcode::ParserState;
use crate::hal::{LimitPins, StepDriver};
use crate::planner::Planner;
use crate::report::Reporter;
use crate::serial::{LineAssembler, SerialRx, RX_BUFFER_SIZE};
use crate::settings::{NvsBackend, SettingsStore, RESTORE_ALL, RESTORE_DEFAULTS, RESTORE_PARAMETERS};
use crate::status::{Alarm, Status};
use crate::stepper::Stepper;
use crate::system::{
    MachineState, Positions, RtExec, RtOverride, RtSignals, StepControl, Suspend, SysState,
};

/// The whole machine: configuration, state, and every pipeline stage.
pub struct Machine {
    pub config: MachineConfig,
    pub settings: SettingsStore,
    pub signals: Arc<RtSignals>,
    pub sys: SysState,
    pub position: Arc<Positions>,
    pub parser: ParserState,
    pub planner: Planner,
    pub stepper: Stepper,
    pub driver: Box<dyn StepDriver + Send>,
    pub limits: Box<dyn LimitPins + Send>,
    pub reporter: Box<dyn Reporter + Send>,
    line_assembler: LineAssembler,
    pub(crate) rx_bytes_available: usize,
}

impl Machine {
    pub fn new(
        config: MachineConfig,
        driver: Box<dyn StepDriver + Send>,
        limits: Box<dyn LimitPins + Send>,
        nvs: Box<dyn NvsBackend + Send>,
        reporter: Box<dyn Reporter + Send>,
    ) -> Self {
        let settings = SettingsStore::new(nvs);
        let mut parser = ParserState::new();
        match settings.read_coord_data(0) {
            Ok(coords) => parser.coord_system = coords,
            Err(status) => warn!("startup coordinate load failed: {status}"),
        }
        Machine {
            planner: Planner::new(config.n_axis),
            stepper: Stepper::new(&config),
            config,
            settings,
            signals: Arc::new(RtSignals::new()),
            sys: SysState::new(),
            position: Arc::new(Positions::new()),
            parser,
            driver,
            limits,
            reporter,
            line_assembler: LineAssembler::new(),
            rx_bytes_available: RX_BUFFER_SIZE,
        }
    }

    /// Handle for wiring a [`SerialRx`] to this machine's executor flags.
    pub fn signals(&self) -> Arc<RtSignals> {
        self.signals.clone()
    }

    /// Re-anchors the parser's mm position from the step counters.
    pub fn gc_sync_position(&mut self) {
        let steps = self.position.snapshot();
        self.parser.position = crate::system::steps_to_mpos(
            &steps,
            &self.settings.current,
            self.config.n_axis,
        );
    }

    /// Re-anchors the planner's step position from the step counters.
    pub fn plan_sync_position(&mut self) {
        let steps = self.position.snapshot();
        self.planner.sync_position(&steps);
    }

    pub(crate) fn st_prep(&mut self) {
        let Machine {
            planner,
            stepper,
            sys,
            settings,
            ..
        } = self;
        stepper.prep_buffer(planner, sys, &settings.current);
    }

    /// One step interrupt, driven by the host timer or the checkpoint pump.
    pub fn stepper_tick(&mut self) {
        let Machine {
            stepper,
            driver,
            position,
            signals,
            settings,
            ..
        } = self;
        stepper.tick(driver.as_mut(), position, signals, &settings.current);
    }

    fn pump_ticks(&mut self) {
        for _ in 0..self.config.checkpoint_ticks {
            if !self.stepper.is_running() {
                break;
            }
            self.st_prep();
            self.stepper_tick();
        }
    }

    /// Requests a cycle start when queued motion is waiting on an idle
    /// machine. Resuming a hold always takes an explicit cycle-start byte.
    pub fn auto_cycle_start(&mut self) {
        if self.sys.state == MachineState::Idle
            && self.sys.suspend.is_empty()
            && !self.planner.is_empty()
        {
            self.signals.set_state(RtExec::CYCLE_START);
        }
    }

    /// The main loop's (and every checkpoint's) realtime dispatch.
    pub fn protocol_execute_realtime(&mut self) {
        self.exec_rt_system();
        if self.sys.abort {
            return;
        }
        if self.sys.motion_active() {
            self.st_prep();
            self.pump_ticks();
        }
    }

    fn exec_rt_system(&mut self) {
        if let Some(alarm) = self.signals.take_alarm() {
            self.enter_alarm(alarm);
        }

        let rt = self.signals.state();

        if rt.contains(RtExec::RESET) {
            self.sys.abort = true;
            return;
        }

        if rt.contains(RtExec::STATUS_REPORT) {
            self.report_realtime_status();
            self.signals.clear_state(RtExec::STATUS_REPORT);
        }

        if rt.intersects(RtExec::FEED_HOLD | RtExec::MOTION_CANCEL | RtExec::SLEEP) {
            self.handle_hold_events(rt);
            self.signals
                .clear_state(RtExec::FEED_HOLD | RtExec::MOTION_CANCEL | RtExec::SLEEP);
        }

        if rt.contains(RtExec::CYCLE_START) {
            self.handle_cycle_start();
            self.signals.clear_state(RtExec::CYCLE_START);
        }

        if rt.contains(RtExec::CYCLE_STOP) {
            self.handle_cycle_stop();
            self.signals.clear_state(RtExec::CYCLE_STOP);
        }

        self.handle_override_requests();
        self.poll_hard_limits();
    }

    fn enter_alarm(&mut self, alarm: Alarm) {
        warn!("alarm {}: machine locked", alarm.code());
        self.sys.state = MachineState::Alarm;
        self.sys.alarm = Some(alarm);
        self.report_alarm(alarm);
    }

    fn handle_hold_events(&mut self, rt: RtExec) {
        if matches!(
            self.sys.state,
            MachineState::Alarm | MachineState::CheckMode | MachineState::Sleep
        ) {
            return;
        }

        // Motion cancel is only meaningful while jogging.
        if rt.contains(RtExec::MOTION_CANCEL)
            && !rt.intersects(RtExec::FEED_HOLD | RtExec::SLEEP)
            && self.sys.state != MachineState::Jog
        {
            return;
        }

        if matches!(self.sys.state, MachineState::Cycle | MachineState::Jog)
            && !self
                .sys
                .suspend
                .intersects(Suspend::MOTION_CANCEL | Suspend::JOG_CANCEL)
        {
            // Freeze the executing block at its traced speed and order a
            // controlled deceleration to zero.
            let Machine {
                planner, stepper, ..
            } = self;
            if let Some(block) = planner.current_block_mut() {
                stepper.update_plan_block_parameters(block);
            }
            self.sys.step_control = StepControl::EXECUTE_HOLD;
            self.sys.suspend.remove(Suspend::HOLD_COMPLETE);
            if self.sys.state == MachineState::Jog {
                self.sys.suspend.insert(Suspend::JOG_CANCEL);
            }
        }

        if self.sys.state == MachineState::Cycle {
            self.sys.state = MachineState::Hold;
            debug!("feed hold: decelerating");
        } else if self.sys.state == MachineState::Idle
            && rt.contains(RtExec::FEED_HOLD)
            && !rt.contains(RtExec::SLEEP)
        {
            // Hold with nothing moving (program pause): latch immediately
            // complete and wait for cycle start.
            self.sys.state = MachineState::Hold;
            self.sys.suspend.insert(Suspend::HOLD_COMPLETE);
        }

        if rt.contains(RtExec::SLEEP) {
            // Sleep waits for nothing: stop motion outright and power down.
            self.halt_motion();
            self.sys.suspend = Suspend::empty();
            self.sys.state = MachineState::Sleep;
            self.driver.set_enabled(false);
            self.report_feedback("Sleeping");
            info!("sleep mode; reset to continue");
        }
    }

    fn handle_cycle_start(&mut self) {
        match self.sys.state {
            MachineState::Hold if self.sys.suspend.contains(Suspend::HOLD_COMPLETE) => {
                self.sys.step_control = StepControl::empty();
                self.sys.suspend = Suspend::empty();
                if self.planner.is_empty() {
                    self.sys.state = MachineState::Idle;
                } else {
                    // Resume: re-plan the partial block from rest.
                    self.sys.state = MachineState::Cycle;
                    let Machine {
                        planner, stepper, ..
                    } = self;
                    planner.cycle_reinitialize(|block| {
                        stepper.update_plan_block_parameters(block)
                    });
                    self.st_prep();
                    let Machine {
                        stepper, driver, ..
                    } = self;
                    stepper.wake_up(driver.as_mut());
                    debug!("cycle resumed");
                }
            }
            MachineState::Idle if self.sys.suspend.is_empty() => {
                if !self.planner.is_empty() {
                    self.sys.state = MachineState::Cycle;
                    self.st_prep();
                    let Machine {
                        stepper, driver, ..
                    } = self;
                    stepper.wake_up(driver.as_mut());
                }
            }
            _ => {}
        }
    }

    fn handle_cycle_stop(&mut self) {
        if self.sys.state == MachineState::Hold && !self.sys.suspend.contains(Suspend::JOG_CANCEL)
        {
            // Deceleration reached zero and the interrupt drained its ring.
            self.sys.suspend.insert(Suspend::HOLD_COMPLETE);
            debug!("hold complete");
            return;
        }
        if self.sys.suspend.contains(Suspend::JOG_CANCEL) {
            // Graceful jog cancel: motion is stopped, now flush everything
            // and resynchronize both position shadows.
            self.sys.step_control = StepControl::empty();
            self.stepper.reset();
            self.planner.reset_buffer();
            self.gc_sync_position();
            self.plan_sync_position();
            debug!("jog canceled at {:?}", self.position.snapshot());
        }
        self.sys.suspend = Suspend::empty();
        self.sys.step_control = StepControl::empty();
        if self.sys.state != MachineState::Sleep && self.sys.state != MachineState::Alarm {
            self.sys.state = MachineState::Idle;
        }
    }

    fn handle_override_requests(&mut self) {
        let requests = self.signals.take_overrides();
        if requests.is_empty() {
            return;
        }

        let mut f_override = self.sys.f_override as i16;
        if requests.contains(RtOverride::FEED_RESET) {
            f_override = DEFAULT_FEED_OVERRIDE as i16;
        }
        if requests.contains(RtOverride::FEED_COARSE_PLUS) {
            f_override += FEED_OVERRIDE_COARSE_INCREMENT as i16;
        }
        if requests.contains(RtOverride::FEED_COARSE_MINUS) {
            f_override -= FEED_OVERRIDE_COARSE_INCREMENT as i16;
        }
        if requests.contains(RtOverride::FEED_FINE_PLUS) {
            f_override += FEED_OVERRIDE_FINE_INCREMENT as i16;
        }
        if requests.contains(RtOverride::FEED_FINE_MINUS) {
            f_override -= FEED_OVERRIDE_FINE_INCREMENT as i16;
        }
        let f_override =
            f_override.clamp(MIN_FEED_RATE_OVERRIDE as i16, MAX_FEED_RATE_OVERRIDE as i16) as u8;

        let mut r_override = self.sys.r_override;
        if requests.contains(RtOverride::RAPID_RESET) {
            r_override = DEFAULT_RAPID_OVERRIDE;
        }
        if requests.contains(RtOverride::RAPID_MEDIUM) {
            r_override = RAPID_OVERRIDE_MEDIUM;
        }
        if requests.contains(RtOverride::RAPID_LOW) {
            r_override = RAPID_OVERRIDE_LOW;
        }

        if f_override != self.sys.f_override || r_override != self.sys.r_override {
            info!("overrides: feed {}%, rapid {}%", f_override, r_override);
            self.sys.f_override = f_override;
            self.sys.r_override = r_override;
            self.sys.report_ovr_counter = 0;
            let Machine {
                planner, stepper, ..
            } = self;
            planner.update_velocity_profile_parameters(f_override, r_override);
            planner.cycle_reinitialize(|block| stepper.update_plan_block_parameters(block));
        }
    }

    fn poll_hard_limits(&mut self) {
        if !self.settings.current.hard_limits || self.sys.homing_active {
            return;
        }
        let mask = self.limits.triggered_mask() & axes_mask(self.config.n_axis);
        if mask != 0 && self.sys.motion_active() {
            warn!("hard limit triggered, mask {:#05b}", mask);
            self.halt_motion();
            self.enter_alarm(Alarm::HardLimit);
        }
    }

    /// Immediate motion kill: interrupt state and both rings are flushed,
    /// position shadows resynchronized to wherever the steppers stopped.
    pub(crate) fn halt_motion(&mut self) {
        self.stepper.reset();
        self.planner.reset_buffer();
        self.sys.step_control = StepControl::empty();
        self.gc_sync_position();
        self.plan_sync_position();
    }

    /// Blocks until every queued motion has been executed. The only other
    /// work performed while waiting is realtime dispatch.
    pub fn protocol_buffer_synchronize(&mut self) {
        loop {
            self.auto_cycle_start();
            self.protocol_execute_realtime();
            if self.sys.abort {
                return;
            }
            if self.planner.is_empty()
                && !self.stepper.has_segments()
                && !self.stepper.is_running()
            {
                if self.sys.state == MachineState::Cycle {
                    self.sys.state = MachineState::Idle;
                }
                return;
            }
            if self.sys.state == MachineState::Hold
                && self.sys.suspend.contains(Suspend::HOLD_COMPLETE)
            {
                // Parked mid-queue by a feed hold; only a cycle start can
                // continue, so there is nothing left to wait on here.
                return;
            }
            if self.config.checkpoint_ticks == 0 {
                // No tick source: nothing can drain, so the sync degrades
                // to a single checkpoint.
                return;
            }
        }
    }

    /// Feeds buffered serial bytes through line assembly and execution.
    pub fn poll(&mut self, rx: &SerialRx) {
        if rx.take_overflow() {
            self.report_feedback("RX buffer overflow");
        }
        self.rx_bytes_available = rx.available();
        while let Some(byte) = rx.read() {
            if let Some(finished) = self.line_assembler.accept(byte) {
                let result = match finished {
                    Ok(line) if line.is_empty() => Ok(()),
                    Ok(line) => self.execute_line(&line),
                    Err(status) => Err(status),
                };
                self.report_status_response(result);
                self.auto_cycle_start();
            }
            self.protocol_execute_realtime();
            if self.sys.abort {
                // Reset also drops whatever was in flight on the wire.
                while rx.read().is_some() {}
                self.reset_state();
            }
            self.rx_bytes_available = rx.available();
        }
        self.protocol_execute_realtime();
        if self.sys.abort {
            while rx.read().is_some() {}
            self.reset_state();
        }
    }

    /// Executes one clean input line: `$` command or G-code block.
    pub fn execute_line(&mut self, line: &str) -> Result<(), Status> {
        debug_assert!(!line.contains(' '));
        if line.starts_with('$') {
            return self.execute_system_line(line);
        }
        match self.sys.state {
            MachineState::Alarm | MachineState::Sleep | MachineState::Jog => {
                Err(Status::SystemGcLock)
            }
            _ => self.gc_execute_line(line, false),
        }
    }

    fn execute_system_line(&mut self, line: &str) -> Result<(), Status> {
        match line {
            "$" => {
                self.report_help();
                Ok(())
            }
            "$$" => {
                self.report_settings();
                Ok(())
            }
            "$#" => {
                self.report_ngc_parameters()?;
                Ok(())
            }
            "$G" => {
                self.report_gcode_modes();
                Ok(())
            }
            "$I" => {
                self.report_build_info();
                Ok(())
            }
            "$N" => {
                self.report_startup_lines();
                Ok(())
            }
            "$C" => self.toggle_check_mode(),
            "$X" => self.unlock_alarm(),
            "$H" => self.run_homing(),
            "$SLP" => {
                self.signals.set_state(RtExec::SLEEP);
                Ok(())
            }
            _ => self.execute_system_assignment(line),
        }
    }

    fn execute_system_assignment(&mut self, line: &str) -> Result<(), Status> {
        if let Some(rest) = line.strip_prefix("$J=") {
            return self.execute_jog_line(rest);
        }
        if let Some(kind) = line.strip_prefix("$RST=") {
            if !matches!(self.sys.state, MachineState::Idle | MachineState::Alarm) {
                return Err(Status::IdleError);
            }
            match kind {
                "*" => self.settings.restore(RESTORE_ALL),
                "$" => self.settings.restore(RESTORE_DEFAULTS),
                "#" => self.settings.restore(RESTORE_PARAMETERS),
                _ => return Err(Status::InvalidStatement),
            }
            self.report_feedback("Restoring defaults");
            self.signals.set_state(RtExec::RESET);
            return Ok(());
        }
        if let Some(rest) = line.strip_prefix("$I=") {
            if self.sys.state != MachineState::Idle {
                return Err(Status::IdleError);
            }
            self.settings.write_build_info(rest);
            return Ok(());
        }

        let body = &line[1..];
        let eq = body.find('=').ok_or(Status::InvalidStatement)?;
        let (key_text, value_text) = body.split_at(eq);
        let value_text = &value_text[1..];

        if let Some(slot_text) = key_text.strip_prefix('N') {
            // `$Nx=<line>`: store a startup block.
            if self.sys.state != MachineState::Idle {
                return Err(Status::IdleError);
            }
            let slot: usize = slot_text.parse().map_err(|_| Status::InvalidStatement)?;
            if slot >= self.config.n_startup_lines {
                return Err(Status::InvalidStatement);
            }
            if value_text.len() >= crate::serial::LINE_BUFFER_SIZE {
                return Err(Status::Overflow);
            }
            self.settings.write_startup_line(slot, value_text);
            return Ok(());
        }

        // `$<n>=<v>`: numeric setting write. Refused mid-motion because the
        // non-volatile write would stall step generation on real boards.
        if !matches!(self.sys.state, MachineState::Idle | MachineState::Alarm) {
            return Err(Status::IdleError);
        }
        let key: u32 = key_text.parse().map_err(|_| Status::InvalidStatement)?;
        let value: f32 = value_text.parse().map_err(|_| Status::BadNumberFormat)?;
        self.protocol_buffer_synchronize();
        self.settings.set_numeric(key, value)
    }

    fn toggle_check_mode(&mut self) -> Result<(), Status> {
        match self.sys.state {
            MachineState::Idle => {
                self.sys.state = MachineState::CheckMode;
                self.report_feedback("Enabled");
                Ok(())
            }
            MachineState::CheckMode => {
                // Leaving check mode resets the parser wholesale.
                self.report_feedback("Disabled");
                self.signals.set_state(RtExec::RESET);
                Ok(())
            }
            _ => Err(Status::IdleError),
        }
    }

    fn unlock_alarm(&mut self) -> Result<(), Status> {
        if self.sys.state != MachineState::Alarm {
            return Ok(());
        }
        if let Some(alarm) = self.sys.alarm {
            if alarm.is_critical()
                && self.limits.triggered_mask() & axes_mask(self.config.n_axis) != 0
            {
                // Still sitting on a switch; clearing now invites a crash.
                return Err(Status::SystemGcLock);
            }
        }
        self.report_feedback("Caution: Unlocked");
        self.sys.state = MachineState::Idle;
        self.sys.alarm = None;
        info!("alarm cleared by unlock");
        Ok(())
    }

    fn run_homing(&mut self) -> Result<(), Status> {
        if !self.settings.current.homing_enable {
            return Err(Status::SettingDisabled);
        }
        if !matches!(self.sys.state, MachineState::Idle | MachineState::Alarm) {
            return Err(Status::IdleError);
        }
        let mask = axes_mask(self.config.n_axis);
        self.mc_homing_cycle(mask)?;
        if !self.sys.abort {
            self.sys.state = MachineState::Idle;
            self.sys.alarm = None;
            self.execute_startup_lines();
        }
        Ok(())
    }

    fn execute_jog_line(&mut self, gcode: &str) -> Result<(), Status> {
        if !matches!(self.sys.state, MachineState::Idle | MachineState::Jog) {
            return Err(Status::IdleError);
        }
        self.gc_execute_line(gcode, true)
    }

    /// Runs the stored startup blocks, echoing each with its outcome.
    pub fn execute_startup_lines(&mut self) {
        for n in 0..self.config.n_startup_lines {
            if let Some(line) = self.settings.read_startup_line(n) {
                if line.is_empty() {
                    continue;
                }
                let result = self.gc_execute_line(&line, false);
                self.report_startup_result(&line, result);
            }
        }
    }

    /// Post-reset re-initialization: flush everything, resync positions,
    /// reset the parser, and decide whether the abort latches an alarm.
    pub fn reset_state(&mut self) {
        let aborted_motion = self.sys.motion_active() || self.stepper.has_segments();
        info!("soft reset (motion active: {})", aborted_motion);

        self.stepper.reset();
        self.planner.reset();
        self.signals.clear_all();
        self.sys.step_control = StepControl::empty();
        self.sys.suspend = Suspend::empty();
        self.sys.abort = false;
        self.sys.f_override = DEFAULT_FEED_OVERRIDE;
        self.sys.r_override = DEFAULT_RAPID_OVERRIDE;
        self.sys.homing_active = false;
        self.sys.wco_dirty = true;

        self.plan_sync_position();
        let coord_select = self.parser.modal.coord_select;
        self.parser.reset();
        self.parser.modal.coord_select = coord_select;
        if let Ok(coords) = self.settings.read_coord_data(coord_select) {
            self.parser.coord_system = coords;
        }
        self.gc_sync_position();
        self.line_assembler = LineAssembler::new();

        let previous_alarm = self.sys.alarm;
        if aborted_motion {
            // Steps were lost the moment the buffers died; flag it.
            self.sys.state = MachineState::Alarm;
            self.sys.alarm = Some(Alarm::AbortCycle);
            self.report_alarm(Alarm::AbortCycle);
        } else if self.sys.state == MachineState::Alarm && previous_alarm.is_some() {
            // Stay locked; homing or unlock clears it.
        } else {
            self.sys.state = MachineState::Idle;
            self.sys.alarm = None;
        }

        let Machine {
            stepper,
            driver,
            settings,
            ..
        } = self;
        stepper.go_idle(driver.as_mut(), &settings.current);

        self.report_welcome();
        if self.sys.state != MachineState::Alarm {
            self.execute_startup_lines();
        }
    }
}
