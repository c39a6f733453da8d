//! Per-line status codes and alarm codes.
//!
//! Two parallel numeric namespaces: `Status` values travel back over the
//! serial link as `error:<n>` after a rejected line, `Alarm` values as
//! `ALARM:<n>` when the executor latches into the alarm state.

use std::fmt;

/// Everything that can go wrong while accepting one input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    ExpectedCommandLetter = 1,
    BadNumberFormat = 2,
    InvalidStatement = 3,
    NegativeValue = 4,
    SettingDisabled = 5,
    SettingStepPulseMin = 6,
    SettingReadFail = 7,
    IdleError = 8,
    SystemGcLock = 9,
    SoftLimitError = 10,
    Overflow = 11,
    MaxStepRateExceeded = 12,
    LineLengthExceeded = 14,
    TravelExceeded = 15,
    InvalidJogCommand = 16,

    GcodeUnsupportedCommand = 20,
    GcodeModalGroupViolation = 21,
    GcodeUndefinedFeedRate = 22,
    GcodeCommandValueNotInteger = 23,
    GcodeAxisCommandConflict = 24,
    GcodeWordRepeated = 25,
    GcodeNoAxisWords = 26,
    GcodeInvalidLineNumber = 27,
    GcodeValueWordMissing = 28,
    GcodeUnsupportedCoordSys = 29,
    GcodeG53InvalidMotionMode = 30,
    GcodeAxisWordsExist = 31,
    GcodeNoAxisWordsInPlane = 32,
    GcodeInvalidTarget = 33,
    GcodeArcRadiusError = 34,
    GcodeNoOffsetsInPlane = 35,
    GcodeUnusedWords = 36,
    GcodeMaxValueExceeded = 38,
}

impl Status {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Short human-readable description, used by verbose front-ends.
    pub fn description(self) -> &'static str {
        match self {
            Status::ExpectedCommandLetter => "expected command letter",
            Status::BadNumberFormat => "bad number format",
            Status::InvalidStatement => "invalid statement",
            Status::NegativeValue => "value cannot be negative",
            Status::SettingDisabled => "setting disabled",
            Status::SettingStepPulseMin => "step pulse below minimum",
            Status::SettingReadFail => "non-volatile read failed",
            Status::IdleError => "command requires idle state",
            Status::SystemGcLock => "locked out by alarm or jog",
            Status::SoftLimitError => "target exceeds soft limits",
            Status::Overflow => "line overflow",
            Status::MaxStepRateExceeded => "step rate above maximum",
            Status::LineLengthExceeded => "line length exceeded",
            Status::TravelExceeded => "travel exceeded during jog",
            Status::InvalidJogCommand => "invalid jog command",
            Status::GcodeUnsupportedCommand => "unsupported command",
            Status::GcodeModalGroupViolation => "modal group violation",
            Status::GcodeUndefinedFeedRate => "undefined feed rate",
            Status::GcodeCommandValueNotInteger => "command value not integer",
            Status::GcodeAxisCommandConflict => "axis word/command conflict",
            Status::GcodeWordRepeated => "word repeated",
            Status::GcodeNoAxisWords => "no axis words",
            Status::GcodeInvalidLineNumber => "invalid line number",
            Status::GcodeValueWordMissing => "value word missing",
            Status::GcodeUnsupportedCoordSys => "unsupported coordinate system",
            Status::GcodeG53InvalidMotionMode => "G53 requires G0 or G1",
            Status::GcodeAxisWordsExist => "axis words not allowed",
            Status::GcodeNoAxisWordsInPlane => "no axis words in plane",
            Status::GcodeInvalidTarget => "invalid target",
            Status::GcodeArcRadiusError => "arc radius error",
            Status::GcodeNoOffsetsInPlane => "no offsets in plane",
            Status::GcodeUnusedWords => "unused value words",
            Status::GcodeMaxValueExceeded => "value above maximum",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error:{} ({})", self.code(), self.description())
    }
}

impl std::error::Error for Status {}

/// Conditions that latch the executor into the alarm state. Recovery is
/// `$X` unlock or a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Alarm {
    HardLimit = 1,
    SoftLimit = 2,
    AbortCycle = 3,
    ProbeFailInitial = 4,
    ProbeFailContact = 5,
    HomingFailReset = 6,
    HomingFailPulloff = 8,
    HomingFailApproach = 9,
}

impl Alarm {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Alarm> {
        match code {
            1 => Some(Alarm::HardLimit),
            2 => Some(Alarm::SoftLimit),
            3 => Some(Alarm::AbortCycle),
            4 => Some(Alarm::ProbeFailInitial),
            5 => Some(Alarm::ProbeFailContact),
            6 => Some(Alarm::HomingFailReset),
            8 => Some(Alarm::HomingFailPulloff),
            9 => Some(Alarm::HomingFailApproach),
            _ => None,
        }
    }

    /// Critical alarms hold the machine until a reset; `$X` is refused.
    pub fn is_critical(self) -> bool {
        matches!(self, Alarm::HardLimit | Alarm::SoftLimit)
    }
}

impl fmt::Display for Alarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ALARM:{}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alarm_codes_round_trip() {
        for code in 0..=10u8 {
            if let Some(alarm) = Alarm::from_code(code) {
                assert_eq!(alarm.code(), code);
            }
        }
        assert_eq!(Alarm::from_code(7), None);
        assert_eq!(Alarm::from_code(0), None);
    }

    #[test]
    fn status_codes_match_wire_protocol() {
        assert_eq!(Status::ExpectedCommandLetter.code(), 1);
        assert_eq!(Status::GcodeUnsupportedCommand.code(), 20);
        assert_eq!(Status::GcodeUnusedWords.code(), 36);
    }
}
