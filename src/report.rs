//! Response and report formatting: the named contract between the firmware
//! core and whatever carries its text to the user.
//!
//! The core only ever emits whole lines through [`Reporter`]; the console
//! binary prints them, the tests capture them.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::MAX_AXES;
use crate::protocol::Machine;
use crate::settings::{SettingsStore, COORD_INDEX_G28, COORD_INDEX_G30, N_COORDINATE_SYSTEM};
use crate::status::{Alarm, Status};
use crate::system::MachineState;

/// Line-oriented response sink.
pub trait Reporter {
    fn line(&mut self, text: &str);
}

/// Prints to stdout; the console front-end's sink.
#[derive(Debug, Default)]
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn line(&mut self, text: &str) {
        println!("{text}");
    }
}

/// Captures lines for inspection; the tests' sink.
#[derive(Debug, Default, Clone)]
pub struct BufferReporter {
    lines: Arc<Mutex<Vec<String>>>,
}

impl BufferReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }

    /// True if any captured line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|l| l.contains(needle))
    }
}

impl Reporter for BufferReporter {
    fn line(&mut self, text: &str) {
        self.lines.lock().push(text.to_owned());
    }
}

/// Prints an integer-valued setting bare, a fractional one with three
/// decimals.
fn fmt_setting_value(value: f32) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value:.3}")
    }
}

fn fmt_vector(vector: &[f32; MAX_AXES], n_axis: usize) -> String {
    let mut out = String::new();
    for (idx, value) in vector.iter().enumerate().take(n_axis) {
        if idx > 0 {
            out.push(',');
        }
        out.push_str(&format!("{value:.3}"));
    }
    out
}

// Report cadence for the slow-changing status fields.
const WCO_REFRESH_COUNT: u8 = 10;
const OVR_REFRESH_COUNT: u8 = 10;

impl Machine {
    /// Per-line response: `ok` or `error:<n>`.
    pub(crate) fn report_status_response(&mut self, result: Result<(), Status>) {
        match result {
            Ok(()) => self.reporter.line("ok"),
            Err(status) => self.reporter.line(&format!("error:{}", status.code())),
        }
    }

    pub(crate) fn report_alarm(&mut self, alarm: Alarm) {
        self.reporter.line(&format!("ALARM:{}", alarm.code()));
        if alarm.is_critical() {
            self.reporter
                .line("[MSG:Reset to continue]");
        }
    }

    pub(crate) fn report_feedback(&mut self, message: &str) {
        self.reporter.line(&format!("[MSG:{message}]"));
    }

    pub(crate) fn report_welcome(&mut self) {
        self.reporter.line(&format!(
            "MillCore {} ['$' for help]",
            env!("CARGO_PKG_VERSION")
        ));
    }

    pub(crate) fn report_help(&mut self) {
        self.reporter.line(
            "[HLP:$$ $# $G $I $N $x=val $Nx=line $J=line $SLP $C $X $H $RST= ~ ! ? ctrl-x]",
        );
    }

    pub(crate) fn report_settings(&mut self) {
        for key in SettingsStore::listed_keys(self.config.n_axis) {
            if let Some(value) = self.settings.get_numeric(key) {
                self.reporter
                    .line(&format!("${}={}", key, fmt_setting_value(value)));
            }
        }
    }

    pub(crate) fn report_ngc_parameters(&mut self) -> Result<(), Status> {
        let n_axis = self.config.n_axis;
        for system in 0..N_COORDINATE_SYSTEM {
            let coords = self.settings.read_coord_data(system)?;
            self.reporter.line(&format!(
                "[G{}:{}]",
                54 + system,
                fmt_vector(&coords, n_axis)
            ));
        }
        let g28 = self.settings.read_coord_data(COORD_INDEX_G28)?;
        self.reporter
            .line(&format!("[G28:{}]", fmt_vector(&g28, n_axis)));
        let g30 = self.settings.read_coord_data(COORD_INDEX_G30)?;
        self.reporter
            .line(&format!("[G30:{}]", fmt_vector(&g30, n_axis)));
        let offset = self.parser.coord_offset;
        self.reporter
            .line(&format!("[G92:{}]", fmt_vector(&offset, n_axis)));
        Ok(())
    }

    pub(crate) fn report_gcode_modes(&mut self) {
        use crate::gcode::{DistanceMode, FeedRateMode, MotionMode, UnitsMode};
        let modal = &self.parser.modal;
        let motion = match modal.motion {
            MotionMode::Seek => "G0",
            MotionMode::Linear => "G1",
            MotionMode::CwArc => "G2",
            MotionMode::CcwArc => "G3",
            MotionMode::None => "G80",
        };
        let units = match modal.units {
            UnitsMode::Mm => "G21",
            UnitsMode::Inches => "G20",
        };
        let distance = match modal.distance {
            DistanceMode::Absolute => "G90",
            DistanceMode::Incremental => "G91",
        };
        let feed_mode = match modal.feed_rate {
            FeedRateMode::UnitsPerMin => "G94",
            FeedRateMode::InverseTime => "G93",
        };
        self.reporter.line(&format!(
            "[GC:{} G{} G17 {} {} {} F{:.1}]",
            motion,
            54 + modal.coord_select,
            units,
            distance,
            feed_mode,
            self.parser.feed_rate
        ));
    }

    pub(crate) fn report_build_info(&mut self) {
        self.reporter.line(&format!(
            "[VER:{}:{}]",
            env!("CARGO_PKG_VERSION"),
            self.settings.read_build_info().unwrap_or_default()
        ));
        self.reporter
            .line(&format!("[AXS:{}]", self.config.n_axis));
    }

    pub(crate) fn report_startup_lines(&mut self) {
        for n in 0..self.config.n_startup_lines {
            let line = self.settings.read_startup_line(n).unwrap_or_default();
            self.reporter.line(&format!("$N{n}={line}"));
        }
    }

    pub(crate) fn report_startup_result(&mut self, line: &str, result: Result<(), Status>) {
        match result {
            Ok(()) => self.reporter.line(&format!(">{line}:ok")),
            Err(status) => self
                .reporter
                .line(&format!(">{line}:error:{}", status.code())),
        }
    }

    /// The single `<...>` framed realtime status line.
    pub(crate) fn report_realtime_status(&mut self) {
        let n_axis = self.config.n_axis;
        let settings = &self.settings.current;
        let steps = self.position.snapshot();
        let mpos = crate::system::steps_to_mpos(&steps, settings, n_axis);
        let mut wco = [0.0f32; MAX_AXES];
        for idx in 0..n_axis {
            wco[idx] = self.parser.coord_system[idx] + self.parser.coord_offset[idx];
        }

        let state_text = match self.sys.state {
            MachineState::Hold => {
                if self.sys.suspend.contains(crate::system::Suspend::HOLD_COMPLETE) {
                    "Hold:0".to_owned()
                } else {
                    "Hold:1".to_owned()
                }
            }
            other => other.report_name().to_owned(),
        };

        let mut report = format!("<{state_text}");
        if settings.status_report_mask & 1 != 0 {
            report.push_str(&format!("|MPos:{}", fmt_vector(&mpos, n_axis)));
        } else {
            let mut wpos = [0.0f32; MAX_AXES];
            for idx in 0..n_axis {
                wpos[idx] = mpos[idx] - wco[idx];
            }
            report.push_str(&format!("|WPos:{}", fmt_vector(&wpos, n_axis)));
        }
        report.push_str(&format!(
            "|Bf:{},{}",
            self.planner.blocks_available(),
            self.rx_bytes_available
        ));
        report.push_str(&format!("|FS:{:.0},0", self.stepper.realtime_rate()));

        // WCO and override fields rotate in at a slow cadence, never both
        // in the same frame; a WCO change forces the next frame to carry it.
        if self.sys.wco_dirty || self.sys.report_wco_counter == 0 {
            report.push_str(&format!("|WCO:{}", fmt_vector(&wco, n_axis)));
            self.sys.report_wco_counter = WCO_REFRESH_COUNT;
            self.sys.wco_dirty = false;
        } else {
            self.sys.report_wco_counter -= 1;
            if self.sys.report_ovr_counter == 0 {
                report.push_str(&format!(
                    "|Ov:{},{},100",
                    self.sys.f_override, self.sys.r_override
                ));
                self.sys.report_ovr_counter = OVR_REFRESH_COUNT;
            } else {
                self.sys.report_ovr_counter -= 1;
            }
        }
        report.push('>');
        self.reporter.line(&report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setting_values_format_like_their_type() {
        assert_eq!(fmt_setting_value(10.0), "10");
        assert_eq!(fmt_setting_value(0.01), "0.010");
        assert_eq!(fmt_setting_value(250.0), "250");
    }

    #[test]
    fn vectors_format_with_three_decimals() {
        assert_eq!(fmt_vector(&[1.0, -2.5, 0.0], 3), "1.000,-2.500,0.000");
        assert_eq!(fmt_vector(&[1.0, -2.5, 0.0], 2), "1.000,-2.500");
    }

    #[test]
    fn buffer_reporter_captures_lines() {
        let reporter = BufferReporter::new();
        let mut sink = reporter.clone();
        sink.line("ok");
        sink.line("error:20");
        assert_eq!(reporter.lines(), vec!["ok", "error:20"]);
        assert!(reporter.contains("error:20"));
    }
}
