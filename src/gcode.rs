//! RS274/NGC-subset G-code parser and interpreter.
//!
//! One call, four strictly ordered phases: copy the modal state into a
//! scratch block, ingest words with modal-group checking, validate and
//! pre-compute everything the block needs, then commit state and enact the
//! block in order of execution. Any failure aborts before the commit phase,
//! so a rejected line never perturbs the parser state.

use bitflags::bitflags;

use crate::config::{MAX_AXES, X_AXIS, Y_AXIS, Z_AXIS};
use crate::planner::{PlanCondition, PlanLineData};
use crate::protocol::Machine;
use crate::settings::{COORD_INDEX_G28, COORD_INDEX_G30, N_COORDINATE_SYSTEM};
use crate::status::Status;
use crate::system::{MachineState, RtExec};

const MM_PER_INCH: f32 = 25.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotionMode {
    #[default]
    Seek,
    Linear,
    CwArc,
    CcwArc,
    /// G80: motion canceled; axis words are an error.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedRateMode {
    #[default]
    UnitsPerMin,
    InverseTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnitsMode {
    #[default]
    Mm,
    Inches,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceMode {
    #[default]
    Absolute,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgramFlow {
    #[default]
    Running,
    Paused,
    CompletedM2,
    CompletedM30,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum NonModal {
    #[default]
    NoAction,
    Dwell,
    SetCoordinateData,
    GoHome0,
    SetHome0,
    GoHome1,
    SetHome1,
    AbsoluteOverride,
    SetCoordinateOffset,
    ResetCoordinateOffset,
}

/// Modal groups carried across blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModalState {
    pub motion: MotionMode,
    pub feed_rate: FeedRateMode,
    pub units: UnitsMode,
    pub distance: DistanceMode,
    pub coord_select: usize,
    pub program_flow: ProgramFlow,
}

/// Process-lifetime parser state.
#[derive(Debug, Clone)]
pub struct ParserState {
    pub modal: ModalState,
    /// Last programmed feed, mm/min.
    pub feed_rate: f32,
    pub line_number: i32,
    /// The parser's mm shadow of the machine position.
    pub position: [f32; MAX_AXES],
    /// Active work coordinate system offsets (G54..G59 contents).
    pub coord_system: [f32; MAX_AXES],
    /// G92 offsets.
    pub coord_offset: [f32; MAX_AXES],
}

impl ParserState {
    pub fn new() -> Self {
        ParserState {
            modal: ModalState::default(),
            feed_rate: 0.0,
            line_number: 0,
            position: [0.0; MAX_AXES],
            coord_system: [0.0; MAX_AXES],
            coord_offset: [0.0; MAX_AXES],
        }
    }

    /// Back to power-on defaults. The caller re-syncs position and reloads
    /// the active coordinate system afterwards.
    pub fn reset(&mut self) {
        *self = ParserState::new();
    }
}

impl Default for ParserState {
    fn default() -> Self {
        Self::new()
    }
}

bitflags! {
    /// Value-word tracking for repeat and unused-word checks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct Words: u16 {
        const F = 1 << 0;
        const I = 1 << 1;
        const J = 1 << 2;
        const K = 1 << 3;
        const L = 1 << 4;
        const N = 1 << 5;
        const P = 1 << 6;
        const R = 1 << 7;
        const X = 1 << 8;
        const Y = 1 << 9;
        const Z = 1 << 10;
    }
}

bitflags! {
    /// One bit per modal group, for violation checks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct CommandGroups: u16 {
        const NON_MODAL    = 1 << 0;
        const MOTION       = 1 << 1;
        const PLANE        = 1 << 2;
        const DISTANCE     = 1 << 3;
        const ARC_DISTANCE = 1 << 4;
        const FEED_RATE    = 1 << 5;
        const UNITS        = 1 << 6;
        const CUTTER_COMP  = 1 << 7;
        const COORD_SELECT = 1 << 8;
        const PATH_CONTROL = 1 << 9;
        const PROGRAM_FLOW = 1 << 10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AxisCommand {
    None,
    NonModal,
    Motion,
}

#[derive(Debug, Default, Clone, Copy)]
struct BlockValues {
    f: f32,
    ijk: [f32; MAX_AXES],
    l: u8,
    n: i32,
    p: f32,
    r: f32,
    xyz: [f32; MAX_AXES],
}

/// Reads one signed decimal float starting at `*idx`, advancing past it.
fn read_float(bytes: &[u8], idx: &mut usize) -> Option<f32> {
    let start = *idx;
    let mut i = *idx;
    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
        i += 1;
    }
    let mut seen_digit = false;
    let mut seen_dot = false;
    while i < bytes.len() {
        match bytes[i] {
            b'0'..=b'9' => {
                seen_digit = true;
                i += 1;
            }
            b'.' if !seen_dot => {
                seen_dot = true;
                i += 1;
            }
            _ => break,
        }
    }
    if !seen_digit {
        return None;
    }
    let text = std::str::from_utf8(&bytes[start..i]).ok()?;
    let value = text.parse::<f32>().ok()?;
    *idx = i;
    Some(value)
}

fn axis_bit(axis: usize) -> u8 {
    1 << axis
}

impl Machine {
    /// Executes one clean G-code block. `is_jog` admits the constrained
    /// `$J=` form: linear, units-per-minute, no modal-state update.
    pub fn gc_execute_line(&mut self, line: &str, is_jog: bool) -> Result<(), Status> {
        let n_axis = self.config.n_axis;

        // -------------------------------------------------------------
        // Phase 1: scratch block seeded from the current modal state.
        let mut block_modal = self.parser.modal;
        let mut non_modal = NonModal::NoAction;
        let mut values = BlockValues::default();
        let mut axis_words: u8 = 0;
        let mut ijk_words: u8 = 0;
        let mut command_words = CommandGroups::empty();
        let mut value_words = Words::empty();
        let mut axis_command = AxisCommand::None;

        if is_jog {
            block_modal.motion = MotionMode::Linear;
            block_modal.feed_rate = FeedRateMode::UnitsPerMin;
        }

        // -------------------------------------------------------------
        // Phase 2: word ingest with modal-group and repeat checking.
        let bytes = line.as_bytes();
        let mut at = 0usize;
        while at < bytes.len() {
            let letter = bytes[at];
            if !letter.is_ascii_uppercase() {
                return Err(Status::ExpectedCommandLetter);
            }
            at += 1;
            let value = read_float(bytes, &mut at).ok_or(Status::BadNumberFormat)?;
            let int_value = value.trunc() as i32;
            // Two decimal digits are enough to classify every legal Gxx.x.
            let mut mantissa = ((value - value.trunc()) * 100.0).round() as i32;

            match letter {
                b'G' => {
                    let group = match int_value {
                        4 | 10 | 28 | 30 | 53 | 92 => {
                            if matches!(int_value, 10 | 28 | 30 | 92) && mantissa == 0 {
                                if axis_command != AxisCommand::None {
                                    return Err(Status::GcodeAxisCommandConflict);
                                }
                                axis_command = AxisCommand::NonModal;
                            }
                            non_modal = match int_value {
                                4 => NonModal::Dwell,
                                10 => NonModal::SetCoordinateData,
                                28 => NonModal::GoHome0,
                                30 => NonModal::GoHome1,
                                53 => NonModal::AbsoluteOverride,
                                _ => NonModal::SetCoordinateOffset,
                            };
                            if matches!(int_value, 28 | 30 | 92) {
                                if !(mantissa == 0 || mantissa == 10) {
                                    return Err(Status::GcodeUnsupportedCommand);
                                }
                                if mantissa == 10 {
                                    non_modal = match int_value {
                                        28 => NonModal::SetHome0,
                                        30 => NonModal::SetHome1,
                                        _ => NonModal::ResetCoordinateOffset,
                                    };
                                }
                                mantissa = 0;
                            }
                            CommandGroups::NON_MODAL
                        }
                        0 | 1 | 2 | 3 | 80 => {
                            if int_value != 80 {
                                if axis_command != AxisCommand::None {
                                    return Err(Status::GcodeAxisCommandConflict);
                                }
                                axis_command = AxisCommand::Motion;
                            }
                            block_modal.motion = match int_value {
                                0 => MotionMode::Seek,
                                1 => MotionMode::Linear,
                                2 => MotionMode::CwArc,
                                3 => MotionMode::CcwArc,
                                _ => MotionMode::None,
                            };
                            CommandGroups::MOTION
                        }
                        // Probing hardware is an external contract this
                        // build does not carry; the G38 family is refused
                        // outright.
                        38 => return Err(Status::GcodeUnsupportedCommand),
                        90 | 91 => {
                            if mantissa == 0 {
                                block_modal.distance = if int_value == 90 {
                                    DistanceMode::Absolute
                                } else {
                                    DistanceMode::Incremental
                                };
                                CommandGroups::DISTANCE
                            } else {
                                if mantissa != 10 || int_value == 90 {
                                    return Err(Status::GcodeUnsupportedCommand);
                                }
                                mantissa = 0;
                                // G91.1 selects incremental arc offsets,
                                // which is already the only mode.
                                CommandGroups::ARC_DISTANCE
                            }
                        }
                        93 | 94 => {
                            block_modal.feed_rate = if int_value == 93 {
                                FeedRateMode::InverseTime
                            } else {
                                FeedRateMode::UnitsPerMin
                            };
                            CommandGroups::FEED_RATE
                        }
                        20 | 21 => {
                            block_modal.units = if int_value == 20 {
                                UnitsMode::Inches
                            } else {
                                UnitsMode::Mm
                            };
                            CommandGroups::UNITS
                        }
                        // XY is the only supported plane; G17 is accepted
                        // for program-header compatibility.
                        17 => CommandGroups::PLANE,
                        // Cutter compensation is permanently off; G40 is
                        // likewise header noise.
                        40 => CommandGroups::CUTTER_COMP,
                        54..=59 => {
                            block_modal.coord_select = (int_value - 54) as usize;
                            CommandGroups::COORD_SELECT
                        }
                        61 => {
                            if mantissa != 0 {
                                return Err(Status::GcodeUnsupportedCommand);
                            }
                            CommandGroups::PATH_CONTROL
                        }
                        _ => return Err(Status::GcodeUnsupportedCommand),
                    };
                    if mantissa > 0 {
                        return Err(Status::GcodeCommandValueNotInteger);
                    }
                    if command_words.contains(group) {
                        return Err(Status::GcodeModalGroupViolation);
                    }
                    command_words.insert(group);
                }
                b'M' => {
                    if mantissa > 0 {
                        return Err(Status::GcodeCommandValueNotInteger);
                    }
                    match int_value {
                        0 => block_modal.program_flow = ProgramFlow::Paused,
                        1 => {} // Optional stop: no input to honor it.
                        2 => block_modal.program_flow = ProgramFlow::CompletedM2,
                        30 => block_modal.program_flow = ProgramFlow::CompletedM30,
                        _ => return Err(Status::GcodeUnsupportedCommand),
                    }
                    if command_words.contains(CommandGroups::PROGRAM_FLOW) {
                        return Err(Status::GcodeModalGroupViolation);
                    }
                    command_words.insert(CommandGroups::PROGRAM_FLOW);
                }
                _ => {
                    let word = match letter {
                        b'F' => {
                            values.f = value;
                            Words::F
                        }
                        b'I' => {
                            values.ijk[X_AXIS] = value;
                            ijk_words |= axis_bit(X_AXIS);
                            Words::I
                        }
                        b'J' => {
                            values.ijk[Y_AXIS] = value;
                            ijk_words |= axis_bit(Y_AXIS);
                            Words::J
                        }
                        b'K' if n_axis > Z_AXIS => {
                            values.ijk[Z_AXIS] = value;
                            ijk_words |= axis_bit(Z_AXIS);
                            Words::K
                        }
                        b'L' => {
                            values.l = int_value.max(0) as u8;
                            Words::L
                        }
                        b'N' => {
                            values.n = value.trunc() as i32;
                            Words::N
                        }
                        b'P' => {
                            values.p = value;
                            Words::P
                        }
                        b'R' => {
                            values.r = value;
                            Words::R
                        }
                        b'X' => {
                            values.xyz[X_AXIS] = value;
                            axis_words |= axis_bit(X_AXIS);
                            Words::X
                        }
                        b'Y' => {
                            values.xyz[Y_AXIS] = value;
                            axis_words |= axis_bit(Y_AXIS);
                            Words::Y
                        }
                        b'Z' if n_axis > Z_AXIS => {
                            values.xyz[Z_AXIS] = value;
                            axis_words |= axis_bit(Z_AXIS);
                            Words::Z
                        }
                        _ => return Err(Status::GcodeUnsupportedCommand),
                    };
                    if value_words.contains(word) {
                        return Err(Status::GcodeWordRepeated);
                    }
                    if word.intersects(Words::F | Words::N | Words::P) && value < 0.0 {
                        return Err(Status::NegativeValue);
                    }
                    value_words.insert(word);
                }
            }
        }

        // -------------------------------------------------------------
        // Phase 3: validation and pre-computation, NIST execution order.

        if axis_words != 0 && axis_command == AxisCommand::None {
            axis_command = AxisCommand::Motion; // Implicit motion mode.
        }

        if value_words.contains(Words::N) && values.n as u32 > self.config.max_line_number {
            return Err(Status::GcodeInvalidLineNumber);
        }

        // Inch input converts once, here; everything downstream is mm.
        if block_modal.units == UnitsMode::Inches {
            for idx in 0..n_axis {
                if axis_words & axis_bit(idx) != 0 {
                    values.xyz[idx] *= MM_PER_INCH;
                }
                if ijk_words & axis_bit(idx) != 0 {
                    values.ijk[idx] *= MM_PER_INCH;
                }
            }
            if value_words.contains(Words::R) {
                values.r *= MM_PER_INCH;
            }
        }

        // Feed rate mode. Jogs always carry their own F word.
        if is_jog {
            if !value_words.contains(Words::F) {
                return Err(Status::GcodeUndefinedFeedRate);
            }
        } else if block_modal.feed_rate == FeedRateMode::InverseTime {
            if axis_command == AxisCommand::Motion
                && !matches!(block_modal.motion, MotionMode::None | MotionMode::Seek)
                && !value_words.contains(Words::F)
            {
                return Err(Status::GcodeUndefinedFeedRate);
            }
        } else if self.parser.modal.feed_rate == FeedRateMode::UnitsPerMin {
            if value_words.contains(Words::F) {
                if block_modal.units == UnitsMode::Inches {
                    values.f *= MM_PER_INCH;
                }
            } else {
                values.f = self.parser.feed_rate; // Carry the modal feed.
            }
        }
        // Switching G93->G94 leaves the feed undefined until a new F word.

        if non_modal == NonModal::Dwell {
            if !value_words.contains(Words::P) {
                return Err(Status::GcodeValueWordMissing);
            }
            value_words.remove(Words::P);
        }

        // Coordinate system select: load the target system when changing.
        let mut block_coord_system = self.parser.coord_system;
        if command_words.contains(CommandGroups::COORD_SELECT)
            && self.parser.modal.coord_select != block_modal.coord_select
        {
            block_coord_system = self.settings.read_coord_data(block_modal.coord_select)?;
        }

        // Non-modal pre-computation. G10 and G92 interpret axis words as
        // coordinate data; everything else sees a motion target.
        let mut coord_data = [0.0f32; MAX_AXES];
        let mut coord_slot = 0usize;
        match non_modal {
            NonModal::SetCoordinateData => {
                if axis_words == 0 {
                    return Err(Status::GcodeNoAxisWords);
                }
                if !value_words.intersects(Words::P | Words::L) {
                    return Err(Status::GcodeValueWordMissing);
                }
                let p = values.p.trunc() as usize;
                if p > N_COORDINATE_SYSTEM {
                    return Err(Status::GcodeUnsupportedCoordSys);
                }
                if values.l != 20 {
                    if values.l == 2 {
                        if value_words.contains(Words::R) {
                            return Err(Status::GcodeUnsupportedCommand);
                        }
                    } else {
                        return Err(Status::GcodeUnsupportedCommand);
                    }
                }
                value_words.remove(Words::L | Words::P);
                // P0 addresses the active system.
                coord_slot = if p > 0 {
                    p - 1
                } else {
                    block_modal.coord_select
                };
                coord_data = self.settings.read_coord_data(coord_slot)?;
                for idx in 0..n_axis {
                    if axis_words & axis_bit(idx) != 0 {
                        if values.l == 20 {
                            // Make the current position read as the given
                            // value: WCS = MPos - G92 - WPos.
                            coord_data[idx] = self.parser.position[idx]
                                - self.parser.coord_offset[idx]
                                - values.xyz[idx];
                        } else {
                            coord_data[idx] = values.xyz[idx];
                        }
                    }
                }
            }
            NonModal::SetCoordinateOffset => {
                if axis_words == 0 {
                    return Err(Status::GcodeNoAxisWords);
                }
                for idx in 0..n_axis {
                    if axis_words & axis_bit(idx) != 0 {
                        values.xyz[idx] = self.parser.position[idx]
                            - block_coord_system[idx]
                            - values.xyz[idx];
                    } else {
                        values.xyz[idx] = self.parser.coord_offset[idx];
                    }
                }
            }
            _ => {
                // Convert axis words to an absolute mm machine target,
                // honoring distance mode unless G53 overrides it.
                if axis_words != 0 {
                    for idx in 0..n_axis {
                        if axis_words & axis_bit(idx) == 0 {
                            values.xyz[idx] = self.parser.position[idx];
                        } else if non_modal != NonModal::AbsoluteOverride {
                            if block_modal.distance == DistanceMode::Absolute {
                                values.xyz[idx] +=
                                    block_coord_system[idx] + self.parser.coord_offset[idx];
                            } else {
                                values.xyz[idx] += self.parser.position[idx];
                            }
                        }
                    }
                }
                match non_modal {
                    NonModal::AbsoluteOverride => {
                        if !matches!(
                            block_modal.motion,
                            MotionMode::Seek | MotionMode::Linear
                        ) {
                            return Err(Status::GcodeG53InvalidMotionMode);
                        }
                    }
                    NonModal::GoHome0 | NonModal::GoHome1 => {
                        let slot = if non_modal == NonModal::GoHome0 {
                            COORD_INDEX_G28
                        } else {
                            COORD_INDEX_G30
                        };
                        coord_data = self.settings.read_coord_data(slot)?;
                        if axis_words != 0 {
                            // Only the worded axes travel to the stored
                            // position; the rest hold station.
                            for idx in 0..n_axis {
                                if axis_words & axis_bit(idx) == 0 {
                                    coord_data[idx] = self.parser.position[idx];
                                }
                            }
                        } else {
                            // No intermediate move.
                            axis_command = AxisCommand::None;
                        }
                    }
                    _ => {}
                }
            }
        }

        // Motion modes.
        let mut arc_clockwise = false;
        if block_modal.motion == MotionMode::None {
            if axis_words != 0 {
                return Err(Status::GcodeAxisWordsExist);
            }
        } else if axis_command == AxisCommand::Motion {
            if block_modal.motion == MotionMode::Seek {
                if axis_words == 0 {
                    axis_command = AxisCommand::None;
                }
            } else {
                if values.f == 0.0 {
                    return Err(Status::GcodeUndefinedFeedRate);
                }
                match block_modal.motion {
                    MotionMode::Linear => {
                        if axis_words == 0 {
                            axis_command = AxisCommand::None;
                        }
                    }
                    MotionMode::CwArc | MotionMode::CcwArc => {
                        arc_clockwise = block_modal.motion == MotionMode::CwArc;
                        if axis_words == 0 {
                            return Err(Status::GcodeNoAxisWords);
                        }
                        if axis_words & (axis_bit(X_AXIS) | axis_bit(Y_AXIS)) == 0 {
                            return Err(Status::GcodeNoAxisWordsInPlane);
                        }
                        let x = values.xyz[X_AXIS] - self.parser.position[X_AXIS];
                        let y = values.xyz[Y_AXIS] - self.parser.position[Y_AXIS];

                        if value_words.contains(Words::R) {
                            // Radius form: locate the centre on the chord's
                            // perpendicular bisector.
                            value_words.remove(Words::R);
                            let same = (0..n_axis).all(|idx| {
                                values.xyz[idx] == self.parser.position[idx]
                            });
                            if same {
                                return Err(Status::GcodeInvalidTarget);
                            }
                            let mut h_x2_div_d =
                                4.0 * values.r * values.r - x * x - y * y;
                            if h_x2_div_d < 0.0 {
                                return Err(Status::GcodeArcRadiusError);
                            }
                            h_x2_div_d = -h_x2_div_d.sqrt() / x.hypot(y);
                            if block_modal.motion == MotionMode::CcwArc {
                                h_x2_div_d = -h_x2_div_d;
                            }
                            if values.r < 0.0 {
                                // Negative R asks for the long way around.
                                h_x2_div_d = -h_x2_div_d;
                                values.r = -values.r;
                            }
                            values.ijk[X_AXIS] = 0.5 * (x - y * h_x2_div_d);
                            values.ijk[Y_AXIS] = 0.5 * (y + x * h_x2_div_d);
                        } else {
                            // Centre-offset form.
                            if ijk_words & (axis_bit(X_AXIS) | axis_bit(Y_AXIS)) == 0 {
                                return Err(Status::GcodeNoOffsetsInPlane);
                            }
                            value_words.remove(Words::I | Words::J | Words::K);
                            let xr = x - values.ijk[X_AXIS];
                            let yr = y - values.ijk[Y_AXIS];
                            let target_r = xr.hypot(yr);
                            values.r = values.ijk[X_AXIS].hypot(values.ijk[Y_AXIS]);
                            let delta_r = (target_r - values.r).abs();
                            if delta_r > 0.005 {
                                if delta_r > 0.5 {
                                    return Err(Status::GcodeInvalidTarget);
                                }
                                if delta_r > 0.001 * values.r {
                                    return Err(Status::GcodeInvalidTarget);
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        // Unused-word sweep: everything consumed above must be accounted
        // for here, or the block carries stray data.
        value_words.remove(Words::N | Words::F);
        if axis_command != AxisCommand::None {
            value_words.remove(Words::X | Words::Y | Words::Z);
        }
        if !value_words.is_empty() {
            return Err(Status::GcodeUnusedWords);
        }

        // -------------------------------------------------------------
        // Phase 4: commit and execute.

        let mut pl_data = PlanLineData::default();

        if is_jog {
            // Jogs admit only distance, units and the G53/no-op non-modals,
            // and never touch the modal state.
            if !command_words
                .difference(
                    CommandGroups::DISTANCE | CommandGroups::UNITS | CommandGroups::NON_MODAL,
                )
                .is_empty()
            {
                return Err(Status::InvalidJogCommand);
            }
            if !matches!(non_modal, NonModal::AbsoluteOverride | NonModal::NoAction) {
                return Err(Status::InvalidJogCommand);
            }
            pl_data.feed_rate = values.f;
            pl_data.condition = PlanCondition::NO_FEED_OVERRIDE;
            pl_data.line_number = values.n;
            self.jog_execute(&mut pl_data, &values.xyz)?;
            self.parser.position = values.xyz;
            return Ok(());
        }

        self.parser.line_number = values.n;
        pl_data.line_number = values.n;

        self.parser.modal.feed_rate = block_modal.feed_rate;
        if block_modal.feed_rate == FeedRateMode::InverseTime {
            pl_data.condition.insert(PlanCondition::INVERSE_TIME);
        }
        self.parser.feed_rate = values.f;
        pl_data.feed_rate = values.f;

        if non_modal == NonModal::Dwell {
            self.mc_dwell(values.p);
        }

        self.parser.modal.units = block_modal.units;

        if self.parser.modal.coord_select != block_modal.coord_select {
            // Changing the WCO mid-stream would skew reported work
            // positions, so drain queued motion first.
            self.protocol_buffer_synchronize();
            self.parser.modal.coord_select = block_modal.coord_select;
            self.parser.coord_system = block_coord_system;
            self.sys.wco_dirty = true;
        }

        self.parser.modal.distance = block_modal.distance;

        match non_modal {
            NonModal::SetCoordinateData => {
                if self.sys.state != MachineState::CheckMode {
                    // The store write stalls stepping on real boards.
                    self.protocol_buffer_synchronize();
                    self.settings.write_coord_data(coord_slot, &coord_data);
                    if self.parser.modal.coord_select == coord_slot {
                        self.parser.coord_system = coord_data;
                        self.sys.wco_dirty = true;
                    }
                }
            }
            NonModal::GoHome0 | NonModal::GoHome1 => {
                pl_data.condition.insert(PlanCondition::RAPID_MOTION);
                if axis_command != AxisCommand::None {
                    self.mc_line(&values.xyz, &pl_data)?;
                }
                self.mc_line(&coord_data, &pl_data)?;
                self.parser.position = coord_data;
            }
            NonModal::SetHome0 | NonModal::SetHome1 => {
                if self.sys.state != MachineState::CheckMode {
                    self.protocol_buffer_synchronize();
                    let slot = if non_modal == NonModal::SetHome0 {
                        COORD_INDEX_G28
                    } else {
                        COORD_INDEX_G30
                    };
                    let position = self.parser.position;
                    self.settings.write_coord_data(slot, &position);
                }
            }
            NonModal::SetCoordinateOffset => {
                self.protocol_buffer_synchronize();
                self.parser.coord_offset = values.xyz;
                self.sys.wco_dirty = true;
            }
            NonModal::ResetCoordinateOffset => {
                self.parser.coord_offset = [0.0; MAX_AXES];
                self.sys.wco_dirty = true;
            }
            _ => {}
        }

        self.parser.modal.motion = block_modal.motion;
        if self.parser.modal.motion != MotionMode::None && axis_command == AxisCommand::Motion {
            match self.parser.modal.motion {
                MotionMode::Linear => {
                    self.mc_line(&values.xyz, &pl_data)?;
                }
                MotionMode::Seek => {
                    pl_data.condition.insert(PlanCondition::RAPID_MOTION);
                    self.mc_line(&values.xyz, &pl_data)?;
                }
                MotionMode::CwArc | MotionMode::CcwArc => {
                    let position = self.parser.position;
                    let offset = values.ijk;
                    let axis_linear = if n_axis > Z_AXIS { Some(Z_AXIS) } else { None };
                    self.mc_arc(
                        &values.xyz,
                        &mut pl_data,
                        &position,
                        &offset,
                        values.r,
                        axis_linear,
                        arc_clockwise,
                    )?;
                }
                _ => {}
            }
            // The parser's view: position is now the target, however far
            // behind the steppers are.
            self.parser.position = values.xyz;
        }

        self.parser.modal.program_flow = block_modal.program_flow;
        match self.parser.modal.program_flow {
            ProgramFlow::Paused => {
                self.protocol_buffer_synchronize();
                if self.sys.state != MachineState::CheckMode {
                    self.signals.set_state(RtExec::FEED_HOLD);
                    self.protocol_execute_realtime();
                }
            }
            ProgramFlow::CompletedM2 | ProgramFlow::CompletedM30 => {
                self.protocol_buffer_synchronize();
                // Program end restores a defined modal subset only.
                self.parser.modal.motion = MotionMode::Linear;
                self.parser.modal.distance = DistanceMode::Absolute;
                self.parser.modal.feed_rate = FeedRateMode::UnitsPerMin;
                self.parser.modal.coord_select = 0;
                self.sys.f_override = crate::config::DEFAULT_FEED_OVERRIDE;
                self.sys.r_override = crate::config::DEFAULT_RAPID_OVERRIDE;
                if self.sys.state != MachineState::CheckMode {
                    self.parser.coord_system = self.settings.read_coord_data(0)?;
                    self.sys.wco_dirty = true;
                }
                self.report_feedback("Pgm End");
            }
            ProgramFlow::Running => {}
        }
        self.parser.modal.program_flow = ProgramFlow::Running;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_float_handles_signs_and_dots() {
        let mut at = 0;
        assert_eq!(read_float(b"-12.5X", &mut at), Some(-12.5));
        assert_eq!(at, 5);
        let mut at = 0;
        assert_eq!(read_float(b"+.25", &mut at), Some(0.25));
        let mut at = 0;
        assert_eq!(read_float(b"3.", &mut at), Some(3.0));
        let mut at = 0;
        assert_eq!(read_float(b"X10", &mut at), None);
        let mut at = 0;
        assert_eq!(read_float(b"-", &mut at), None);
    }

    #[test]
    fn modal_defaults_match_power_on_state() {
        let state = ParserState::new();
        assert_eq!(state.modal.motion, MotionMode::Seek);
        assert_eq!(state.modal.distance, DistanceMode::Absolute);
        assert_eq!(state.modal.units, UnitsMode::Mm);
        assert_eq!(state.modal.feed_rate, FeedRateMode::UnitsPerMin);
        assert_eq!(state.modal.coord_select, 0);
    }
}
