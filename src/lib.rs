//! Host-portable CNC motion-control core.
//!
//! A line-oriented G-code front-end feeding a look-ahead trajectory
//! planner, a step segment generator, and an interrupt-model step engine,
//! overseen by a flag-driven realtime executor (hold, reset, jog, homing,
//! overrides, alarms). Hardware is reached only through the traits in
//! [`hal`]; the step interrupt is a method the host timer (or a test loop)
//! invokes, so the whole pipeline runs and tests on any machine.

pub mod config;
pub mod gcode;
pub mod hal;
pub mod jog;
pub mod motion;
pub mod planner;
pub mod protocol;
pub mod report;
pub mod serial;
pub mod settings;
pub mod status;
pub mod stepper;
pub mod system;

pub use crate::config::MachineConfig;
pub use crate::protocol::Machine;
pub use crate::status::{Alarm, Status};
