use approx::assert_relative_eq;

use millcore::gcode::{DistanceMode, FeedRateMode, MotionMode, UnitsMode};
use millcore::hal::{SimDriver, SimLimits};
use millcore::report::BufferReporter;
use millcore::settings::MemoryNvs;
use millcore::{Machine, MachineConfig, Status};

fn machine() -> (Machine, BufferReporter) {
    let mut config = MachineConfig::default();
    // Let long moves drain while a line is still being planned; arcs can
    // queue far more segments than the ring holds.
    config.checkpoint_ticks = 64;
    let reporter = BufferReporter::new();
    let machine = Machine::new(
        config,
        Box::new(SimDriver::new()),
        Box::new(SimLimits::new()),
        Box::new(MemoryNvs::new()),
        Box::new(reporter.clone()),
    );
    (machine, reporter)
}

fn two_axis_machine() -> Machine {
    let reporter = BufferReporter::new();
    Machine::new(
        MachineConfig::with_axes(2),
        Box::new(SimDriver::new()),
        Box::new(SimLimits::new()),
        Box::new(MemoryNvs::new()),
        Box::new(reporter),
    )
}

#[test]
fn linear_move_updates_parser_position() {
    let (mut m, _) = machine();
    m.execute_line("G21G90G1X10F600").unwrap();
    assert_relative_eq!(m.parser.position[0], 10.0);
    assert_eq!(m.parser.modal.motion, MotionMode::Linear);
    assert_eq!(m.planner.block_count(), 1);
}

#[test]
fn modal_group_violation_rejected() {
    let (mut m, _) = machine();
    assert_eq!(
        m.execute_line("G0G1X5F100"),
        Err(Status::GcodeModalGroupViolation)
    );
    assert_eq!(m.execute_line("G90G91X1"), Err(Status::GcodeModalGroupViolation));
    assert_eq!(m.execute_line("M0M2"), Err(Status::GcodeModalGroupViolation));
}

#[test]
fn repeated_word_rejected() {
    let (mut m, _) = machine();
    assert_eq!(
        m.execute_line("G1X5X6F100"),
        Err(Status::GcodeWordRepeated)
    );
}

#[test]
fn negative_value_words_rejected() {
    let (mut m, _) = machine();
    assert_eq!(m.execute_line("G1X5F-100"), Err(Status::NegativeValue));
    assert_eq!(m.execute_line("N-1G0X1"), Err(Status::NegativeValue));
    assert_eq!(m.execute_line("G4P-1"), Err(Status::NegativeValue));
}

#[test]
fn bad_letter_and_number_rejected() {
    let (mut m, _) = machine();
    assert_eq!(m.execute_line("%G0X1"), Err(Status::ExpectedCommandLetter));
    assert_eq!(m.execute_line("GX1"), Err(Status::BadNumberFormat));
    assert_eq!(m.execute_line("G1X"), Err(Status::BadNumberFormat));
}

#[test]
fn unsupported_commands_rejected() {
    let (mut m, _) = machine();
    assert_eq!(m.execute_line("G5X1"), Err(Status::GcodeUnsupportedCommand));
    assert_eq!(m.execute_line("M7"), Err(Status::GcodeUnsupportedCommand));
    assert_eq!(m.execute_line("G38.2X5F100"), Err(Status::GcodeUnsupportedCommand));
    // Non-integer forms outside the whitelist.
    assert_eq!(m.execute_line("G1.3X5F100"), Err(Status::GcodeCommandValueNotInteger));
    assert_eq!(m.execute_line("G90.1"), Err(Status::GcodeUnsupportedCommand));
}

#[test]
fn accepted_no_op_compatibility_commands() {
    let (mut m, _) = machine();
    // Typical program header: plane select, cutter comp off, path control.
    m.execute_line("G17G40G61G21G90").unwrap();
    m.execute_line("G91.1").unwrap();
}

#[test]
fn axis_command_conflict_rejected() {
    let (mut m, _) = machine();
    assert_eq!(
        m.execute_line("G1G28X5F100"),
        Err(Status::GcodeAxisCommandConflict)
    );
}

#[test]
fn failing_block_leaves_state_untouched() {
    let (mut m, _) = machine();
    m.execute_line("G91G20F200").unwrap();
    let before_modal = m.parser.modal;
    let before_position = m.parser.position;
    // Unsupported word makes the whole block fail late in validation.
    assert!(m.execute_line("G90G21G1X5Q9F100").is_err());
    assert_eq!(m.parser.modal, before_modal);
    assert_eq!(m.parser.position, before_position);
    assert_eq!(m.parser.modal.distance, DistanceMode::Incremental);
    assert_eq!(m.parser.modal.units, UnitsMode::Inches);
}

#[test]
fn unused_words_rejected() {
    let (mut m, _) = machine();
    assert_eq!(m.execute_line("G0X1R5"), Err(Status::GcodeUnusedWords));
    assert_eq!(m.execute_line("G4P0L2"), Err(Status::GcodeUnusedWords));
}

#[test]
fn g80_with_axis_words_rejected() {
    let (mut m, _) = machine();
    assert_eq!(m.execute_line("G80X5"), Err(Status::GcodeAxisWordsExist));
}

#[test]
fn feed_rate_is_modal_and_required() {
    let (mut m, _) = machine();
    assert_eq!(m.execute_line("G1X5"), Err(Status::GcodeUndefinedFeedRate));
    m.execute_line("G1X5F300").unwrap();
    // Carried feed makes the next block legal.
    m.execute_line("G1X10").unwrap();
    assert_relative_eq!(m.parser.feed_rate, 300.0);
}

#[test]
fn inverse_time_requires_f_every_block() {
    let (mut m, _) = machine();
    m.execute_line("G93").unwrap();
    m.execute_line("G1X5F2").unwrap();
    assert_eq!(
        m.execute_line("G1X10"),
        Err(Status::GcodeUndefinedFeedRate)
    );
    assert_eq!(m.parser.modal.feed_rate, FeedRateMode::InverseTime);
}

#[test]
fn incremental_then_zero_move_keeps_position() {
    let (mut m, _) = machine();
    m.execute_line("G90G1X10F600").unwrap();
    m.execute_line("G91X0").unwrap();
    assert_relative_eq!(m.parser.position[0], 10.0);
    // The zero-length move queued nothing.
    assert_eq!(m.planner.block_count(), 1);
}

#[test]
fn line_numbers_enforce_maximum() {
    let (mut m, _) = machine();
    m.execute_line("N10000000G0X1").unwrap();
    assert_eq!(m.parser.line_number, 10_000_000);
    assert_eq!(
        m.execute_line("N10000001G0X2"),
        Err(Status::GcodeInvalidLineNumber)
    );
}

#[test]
fn inch_units_convert_to_mm() {
    let (mut m, _) = machine();
    m.execute_line("G20G90G1X1F60").unwrap();
    assert_relative_eq!(m.parser.position[0], 25.4);
    assert_relative_eq!(m.parser.feed_rate, 60.0 * 25.4);
}

#[test]
fn g53_requires_g0_or_g1() {
    let (mut m, _) = machine();
    m.execute_line("G1F100").unwrap();
    m.execute_line("G53X5").unwrap();
    assert_eq!(
        m.execute_line("G2G53X5Y0I1J0F100"),
        Err(Status::GcodeG53InvalidMotionMode)
    );
    m.execute_line("G2X1Y0I-2J0F100").unwrap();
    // Arc mode is now modal; G53 alone must refuse it.
    assert_eq!(
        m.execute_line("G53X5"),
        Err(Status::GcodeG53InvalidMotionMode)
    );
}

#[test]
fn g53_ignores_work_offsets_for_one_block() {
    let (mut m, _) = machine();
    m.execute_line("G10L2P1X5Y0Z0").unwrap();
    m.execute_line("G90G1X0F100").unwrap();
    // Work X0 is machine X5 under the G54 offset.
    assert_relative_eq!(m.parser.position[0], 5.0);
    m.execute_line("G53G1X2F100").unwrap();
    // Machine coordinates, offset suppressed.
    assert_relative_eq!(m.parser.position[0], 2.0);
    m.execute_line("G1X0").unwrap();
    assert_relative_eq!(m.parser.position[0], 5.0);
}

#[test]
fn g10_l2_writes_and_selects() {
    let (mut m, _) = machine();
    m.execute_line("G10L2P3X10Y20Z30").unwrap();
    m.execute_line("G56").unwrap();
    assert_relative_eq!(m.parser.coord_system[0], 10.0);
    assert_relative_eq!(m.parser.coord_system[1], 20.0);
    assert_relative_eq!(m.parser.coord_system[2], 30.0);
    // Work zero now sits at machine (10,20,30).
    m.execute_line("G90G1X0Y0Z0F100").unwrap();
    assert_relative_eq!(m.parser.position[0], 10.0);
}

#[test]
fn g10_validation_errors() {
    let (mut m, _) = machine();
    assert_eq!(m.execute_line("G10L2P1"), Err(Status::GcodeNoAxisWords));
    assert_eq!(m.execute_line("G10X1"), Err(Status::GcodeValueWordMissing));
    assert_eq!(
        m.execute_line("G10L2P7X1"),
        Err(Status::GcodeUnsupportedCoordSys)
    );
    assert_eq!(
        m.execute_line("G10L2P1R5X1"),
        Err(Status::GcodeUnsupportedCommand)
    );
    assert_eq!(
        m.execute_line("G10L5P1X1"),
        Err(Status::GcodeUnsupportedCommand)
    );
}

#[test]
fn g10_l20_sets_current_position_to_value() {
    let (mut m, _) = machine();
    m.execute_line("G90G1X10F600").unwrap();
    // Make the current spot read as work X2 in P0 (the active system).
    m.execute_line("G10L20P0X2").unwrap();
    assert_relative_eq!(m.parser.coord_system[0], 8.0);
}

#[test]
fn g92_offset_and_clear() {
    let (mut m, _) = machine();
    m.execute_line("G90G1X10F600").unwrap();
    m.execute_line("G92X0").unwrap();
    // Position reads zero in work terms; machine position unchanged.
    assert_relative_eq!(m.parser.coord_offset[0], 10.0);
    assert_relative_eq!(m.parser.position[0], 10.0);
    m.execute_line("G1X5").unwrap();
    assert_relative_eq!(m.parser.position[0], 15.0);
    m.execute_line("G92.1").unwrap();
    assert_relative_eq!(m.parser.coord_offset[0], 0.0);
    assert_eq!(m.execute_line("G92"), Err(Status::GcodeNoAxisWords));
}

#[test]
fn g28_stores_and_returns() {
    let (mut m, _) = machine();
    m.execute_line("G90G1X10Y5F600").unwrap();
    m.execute_line("G28.1").unwrap();
    m.execute_line("G1X20Y20").unwrap();
    m.execute_line("G28").unwrap();
    assert_relative_eq!(m.parser.position[0], 10.0);
    assert_relative_eq!(m.parser.position[1], 5.0);
}

#[test]
fn g28_with_axis_words_moves_those_axes_only() {
    let (mut m, _) = machine();
    m.execute_line("G90G1X10Y5F600").unwrap();
    m.execute_line("G28.1").unwrap();
    m.execute_line("G1X20Y20").unwrap();
    m.execute_line("G28X0").unwrap();
    // X went through work X0 to its stored home; Y held station.
    assert_relative_eq!(m.parser.position[0], 10.0);
    assert_relative_eq!(m.parser.position[1], 20.0);
}

#[test]
fn arc_radius_mode_computes_center() {
    let (mut m, _) = machine();
    m.execute_line("G2X10Y0R5F200").unwrap();
    assert_relative_eq!(m.parser.position[0], 10.0);
    assert_relative_eq!(m.parser.position[1], 0.0);
    assert!(m.planner.block_count() > 1, "arc did not segment");
}

#[test]
fn arc_errors() {
    let (mut m, _) = machine();
    // Radius too small to span the chord.
    assert_eq!(
        m.execute_line("G2X20Y0R5F100"),
        Err(Status::GcodeArcRadiusError)
    );
    // Radius mode with coincident endpoints.
    assert_eq!(
        m.execute_line("G2X0Y0R5F100"),
        Err(Status::GcodeInvalidTarget)
    );
    // Offset mode with inconsistent radii.
    assert_eq!(
        m.execute_line("G2X10Y0I1J0F100"),
        Err(Status::GcodeInvalidTarget)
    );
    // No offsets and no radius.
    assert_eq!(
        m.execute_line("G2X10Y0F100"),
        Err(Status::GcodeNoOffsetsInPlane)
    );
    // No in-plane axis words.
    assert_eq!(
        m.execute_line("G2Z1I5J0F100"),
        Err(Status::GcodeNoAxisWordsInPlane)
    );
}

#[test]
fn full_circle_via_offsets_produces_motion() {
    let (mut m, _) = machine();
    // Identical start and end in offset mode must trace the whole circle.
    m.execute_line("G2X0Y0I5J0F200").unwrap();
    assert!(
        m.planner.block_count() > 8,
        "only {} blocks for a full circle",
        m.planner.block_count()
    );
    assert_relative_eq!(m.parser.position[0], 0.0);
}

#[test]
fn k_and_z_words_rejected_on_two_axis_machines() {
    let mut m = two_axis_machine();
    assert_eq!(m.execute_line("G1Z5F100"), Err(Status::GcodeUnsupportedCommand));
    assert_eq!(
        m.execute_line("G2X1Y1K2F100"),
        Err(Status::GcodeUnsupportedCommand)
    );
    m.execute_line("G1X5Y5F100").unwrap();
}

#[test]
fn m2_restores_modal_defaults() {
    let (mut m, _) = machine();
    m.execute_line("G55G91G93").unwrap();
    m.execute_line("M2").unwrap();
    assert_eq!(m.parser.modal.motion, MotionMode::Linear);
    assert_eq!(m.parser.modal.distance, DistanceMode::Absolute);
    assert_eq!(m.parser.modal.feed_rate, FeedRateMode::UnitsPerMin);
    assert_eq!(m.parser.modal.coord_select, 0);
}

#[test]
fn dwell_requires_p_word() {
    let (mut m, _) = machine();
    assert_eq!(m.execute_line("G4"), Err(Status::GcodeValueWordMissing));
    m.execute_line("G4P0").unwrap();
}
