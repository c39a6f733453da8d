use std::sync::Arc;

use parking_lot::Mutex;

use millcore::hal::{SimLimits, StepDriver};
use millcore::report::BufferReporter;
use millcore::settings::MemoryNvs;
use millcore::system::MachineState;
use millcore::{Machine, MachineConfig};

#[derive(Default)]
struct Tracking {
    dir_mask: u8,
    steps: [i64; 3],
    pulses: u64,
    max_radius_dev: f32,
    center: (f32, f32),
    radius: f32,
}

/// Driver that integrates pulses into a position and measures how far the
/// traced path strays from a nominal circle.
#[derive(Clone)]
struct TrackingDriver(Arc<Mutex<Tracking>>);

impl TrackingDriver {
    fn new(center: (f32, f32), radius: f32) -> Self {
        TrackingDriver(Arc::new(Mutex::new(Tracking {
            center,
            radius,
            ..Tracking::default()
        })))
    }
}

impl StepDriver for TrackingDriver {
    fn set_direction_mask(&mut self, dir_mask: u8) {
        self.0.lock().dir_mask = dir_mask;
    }

    fn pulse(&mut self, step_mask: u8) {
        if step_mask == 0 {
            return;
        }
        let mut t = self.0.lock();
        for axis in 0..3 {
            if step_mask & (1 << axis) != 0 {
                if t.dir_mask & (1 << axis) != 0 {
                    t.steps[axis] -= 1;
                } else {
                    t.steps[axis] += 1;
                }
            }
        }
        t.pulses += 1;
        if t.radius > 0.0 {
            let x = t.steps[0] as f32 / 250.0;
            let y = t.steps[1] as f32 / 250.0;
            let dev = ((x - t.center.0).hypot(y - t.center.1) - t.radius).abs();
            if dev > t.max_radius_dev {
                t.max_radius_dev = dev;
            }
        }
    }

    fn set_enabled(&mut self, _enabled: bool) {}
}

fn machine_with_driver(driver: TrackingDriver) -> Machine {
    let mut config = MachineConfig::default();
    config.checkpoint_ticks = 256;
    Machine::new(
        config,
        Box::new(driver),
        Box::new(SimLimits::new()),
        Box::new(MemoryNvs::new()),
        Box::new(BufferReporter::new()),
    )
}

fn drain(machine: &mut Machine, budget: usize) {
    for _ in 0..budget {
        machine.protocol_execute_realtime();
        machine.auto_cycle_start();
        if machine.sys.state == MachineState::Idle
            && machine.planner.is_empty()
            && !machine.stepper.is_running()
        {
            return;
        }
    }
    panic!("motion did not complete within the tick budget");
}

#[test]
fn half_circle_traces_within_tolerance() {
    let driver = TrackingDriver::new((5.0, 0.0), 5.0);
    let probe = driver.clone();
    let mut m = machine_with_driver(driver);
    m.execute_line("G2X10Y0I5J0F600").unwrap();
    drain(&mut m, 500_000);
    assert_eq!(m.position.get(0), 2500);
    assert_eq!(m.position.get(1), 0);
    let t = probe.0.lock();
    assert!(t.pulses > 0);
    // Chord deviation stays within the arc tolerance plus one step of
    // quantization.
    assert!(
        t.max_radius_dev < 0.02,
        "radius deviation {}",
        t.max_radius_dev
    );
}

#[test]
fn full_circle_returns_to_start_after_real_motion() {
    let driver = TrackingDriver::new((5.0, 0.0), 5.0);
    let probe = driver.clone();
    let mut m = machine_with_driver(driver);
    // Identical start and end in offset mode: a full circle, not a no-op.
    m.execute_line("G2X0Y0I5J0F600").unwrap();
    drain(&mut m, 1_000_000);
    assert_eq!(m.position.get(0), 0);
    assert_eq!(m.position.get(1), 0);
    let t = probe.0.lock();
    assert!(
        t.pulses > 5000,
        "only {} pulses for a full circle",
        t.pulses
    );
    assert!(t.max_radius_dev < 0.02);
}

#[test]
fn ccw_arc_lands_on_target() {
    let driver = TrackingDriver::new((0.0, 5.0), 5.0);
    let mut m = machine_with_driver(driver);
    m.execute_line("G3X0Y10J5F600").unwrap();
    drain(&mut m, 500_000);
    assert_eq!(m.position.get(0), 0);
    assert_eq!(m.position.get(1), 2500);
}

#[test]
fn rapid_and_feed_moves_chain() {
    let driver = TrackingDriver::new((0.0, 0.0), 0.0);
    let mut m = machine_with_driver(driver);
    m.execute_line("G0X4").unwrap();
    m.execute_line("G1Y3F500").unwrap();
    m.execute_line("G1X0Y0").unwrap();
    drain(&mut m, 500_000);
    assert_eq!(m.position.get(0), 0);
    assert_eq!(m.position.get(1), 0);
}
