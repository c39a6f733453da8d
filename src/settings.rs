//! Persistent machine settings and the non-volatile storage layout.
//!
//! The backing store is reached through the byte-level [`NvsBackend`]
//! contract; board builds wire in an EEPROM or flash page, hosted builds the
//! in-memory implementation. Records live at fixed offsets and carry a
//! trailing XOR checksum. A version byte at offset zero gates the whole
//! area: on mismatch the configured regions are wiped and restored to
//! defaults.

use log::{info, warn};

use crate::config::MAX_AXES;
use crate::serial::LINE_BUFFER_SIZE;
use crate::status::Status;

/// Bump when the byte layout below changes.
pub const SETTINGS_VERSION: u8 = 10;

/// Work coordinate systems G54 through G59.
pub const N_COORDINATE_SYSTEM: usize = 6;
/// Slot index of the G28 home position.
pub const COORD_INDEX_G28: usize = N_COORDINATE_SYSTEM;
/// Slot index of the G30 home position.
pub const COORD_INDEX_G30: usize = N_COORDINATE_SYSTEM + 1;
const N_COORD_SLOTS: usize = N_COORDINATE_SYSTEM + 2;

const ADDR_VERSION: usize = 0;
const ADDR_GLOBAL: usize = 1;
const ADDR_PARAMETERS: usize = 512;
const ADDR_STARTUP_LINES: usize = 768;
const ADDR_BUILD_INFO: usize = 942;

/// Total bytes a backend must provide.
pub const NVS_SIZE: usize = 1024;

// Regions wiped by `$RST=` commands.
pub const RESTORE_DEFAULTS: u8 = 1 << 0;
pub const RESTORE_PARAMETERS: u8 = 1 << 1;
pub const RESTORE_STARTUP_LINES: u8 = 1 << 2;
pub const RESTORE_BUILD_INFO: u8 = 1 << 3;
pub const RESTORE_ALL: u8 =
    RESTORE_DEFAULTS | RESTORE_PARAMETERS | RESTORE_STARTUP_LINES | RESTORE_BUILD_INFO;

/// Byte-addressed non-volatile storage.
pub trait NvsBackend {
    fn read_byte(&self, addr: usize) -> u8;
    fn write_byte(&mut self, addr: usize, value: u8);
}

/// Hosted backend: a flat byte array, optionally seeded from a prior run.
pub struct MemoryNvs {
    bytes: Vec<u8>,
}

impl MemoryNvs {
    pub fn new() -> Self {
        MemoryNvs {
            bytes: vec![0; NVS_SIZE],
        }
    }

    pub fn from_bytes(mut bytes: Vec<u8>) -> Self {
        bytes.resize(NVS_SIZE, 0);
        MemoryNvs { bytes }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl Default for MemoryNvs {
    fn default() -> Self {
        Self::new()
    }
}

impl NvsBackend for MemoryNvs {
    fn read_byte(&self, addr: usize) -> u8 {
        self.bytes[addr]
    }

    fn write_byte(&mut self, addr: usize, value: u8) {
        self.bytes[addr] = value;
    }
}

/// Per-axis kinematic limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisSettings {
    /// Steps per millimetre of travel.
    pub steps_per_mm: f32,
    /// Maximum rate, mm/min.
    pub max_rate: f32,
    /// Acceleration, mm/min^2 (entered and reported as mm/sec^2).
    pub acceleration: f32,
    /// Maximum travel from the homed origin, mm (entered positive).
    pub max_travel: f32,
}

impl Default for AxisSettings {
    fn default() -> Self {
        AxisSettings {
            steps_per_mm: 250.0,
            max_rate: 500.0,
            acceleration: 10.0 * 60.0 * 60.0,
            max_travel: 200.0,
        }
    }
}

/// The writable `$n` settings set.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub pulse_microseconds: u8,
    pub stepper_idle_lock_time: u8,
    pub step_invert_mask: u8,
    pub dir_invert_mask: u8,
    pub invert_st_enable: bool,
    pub invert_limit_pins: bool,
    pub status_report_mask: u8,
    pub junction_deviation: f32,
    pub arc_tolerance: f32,
    pub report_inches: bool,
    pub soft_limits: bool,
    pub hard_limits: bool,
    pub homing_enable: bool,
    pub homing_dir_mask: u8,
    pub homing_feed_rate: f32,
    pub homing_seek_rate: f32,
    pub homing_debounce_ms: u16,
    pub homing_pulloff: f32,
    pub axis: [AxisSettings; MAX_AXES],
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            pulse_microseconds: 10,
            stepper_idle_lock_time: 25,
            step_invert_mask: 0,
            dir_invert_mask: 0,
            invert_st_enable: false,
            invert_limit_pins: false,
            status_report_mask: 1,
            junction_deviation: 0.01,
            arc_tolerance: 0.002,
            report_inches: false,
            soft_limits: false,
            hard_limits: false,
            homing_enable: false,
            homing_dir_mask: 0,
            homing_feed_rate: 25.0,
            homing_seek_rate: 500.0,
            homing_debounce_ms: 250,
            homing_pulloff: 1.0,
            axis: [AxisSettings::default(); MAX_AXES],
        }
    }
}

impl Settings {
    fn pack_flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.invert_st_enable {
            flags |= 1 << 0;
        }
        if self.invert_limit_pins {
            flags |= 1 << 1;
        }
        if self.report_inches {
            flags |= 1 << 2;
        }
        if self.soft_limits {
            flags |= 1 << 3;
        }
        if self.hard_limits {
            flags |= 1 << 4;
        }
        if self.homing_enable {
            flags |= 1 << 5;
        }
        flags
    }

    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(96);
        out.push(self.pulse_microseconds);
        out.push(self.stepper_idle_lock_time);
        out.push(self.step_invert_mask);
        out.push(self.dir_invert_mask);
        out.push(self.pack_flags());
        out.push(self.status_report_mask);
        out.extend_from_slice(&self.junction_deviation.to_le_bytes());
        out.extend_from_slice(&self.arc_tolerance.to_le_bytes());
        out.push(self.homing_dir_mask);
        out.extend_from_slice(&self.homing_feed_rate.to_le_bytes());
        out.extend_from_slice(&self.homing_seek_rate.to_le_bytes());
        out.extend_from_slice(&self.homing_debounce_ms.to_le_bytes());
        out.extend_from_slice(&self.homing_pulloff.to_le_bytes());
        for axis in &self.axis {
            out.extend_from_slice(&axis.steps_per_mm.to_le_bytes());
            out.extend_from_slice(&axis.max_rate.to_le_bytes());
            out.extend_from_slice(&axis.acceleration.to_le_bytes());
            out.extend_from_slice(&axis.max_travel.to_le_bytes());
        }
        out
    }

    fn deserialize(bytes: &[u8]) -> Option<Settings> {
        let mut r = FieldReader { bytes, at: 0 };
        let mut s = Settings::default();
        s.pulse_microseconds = r.u8()?;
        s.stepper_idle_lock_time = r.u8()?;
        s.step_invert_mask = r.u8()?;
        s.dir_invert_mask = r.u8()?;
        let flags = r.u8()?;
        s.invert_st_enable = flags & (1 << 0) != 0;
        s.invert_limit_pins = flags & (1 << 1) != 0;
        s.report_inches = flags & (1 << 2) != 0;
        s.soft_limits = flags & (1 << 3) != 0;
        s.hard_limits = flags & (1 << 4) != 0;
        s.homing_enable = flags & (1 << 5) != 0;
        s.status_report_mask = r.u8()?;
        s.junction_deviation = r.f32()?;
        s.arc_tolerance = r.f32()?;
        s.homing_dir_mask = r.u8()?;
        s.homing_feed_rate = r.f32()?;
        s.homing_seek_rate = r.f32()?;
        s.homing_debounce_ms = r.u16()?;
        s.homing_pulloff = r.f32()?;
        for axis in s.axis.iter_mut() {
            axis.steps_per_mm = r.f32()?;
            axis.max_rate = r.f32()?;
            axis.acceleration = r.f32()?;
            axis.max_travel = r.f32()?;
        }
        Some(s)
    }
}

fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

struct FieldReader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl FieldReader<'_> {
    fn u8(&mut self) -> Option<u8> {
        let b = *self.bytes.get(self.at)?;
        self.at += 1;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        let raw: [u8; 2] = self.bytes.get(self.at..self.at + 2)?.try_into().ok()?;
        self.at += 2;
        Some(u16::from_le_bytes(raw))
    }

    fn f32(&mut self) -> Option<f32> {
        let raw: [u8; 4] = self.bytes.get(self.at..self.at + 4)?.try_into().ok()?;
        self.at += 4;
        Some(f32::from_le_bytes(raw))
    }
}

/// Settings plus their backing store.
pub struct SettingsStore {
    pub current: Settings,
    nvs: Box<dyn NvsBackend + Send>,
}

impl SettingsStore {
    /// Loads settings from the backend, wiping and restoring defaults when
    /// the version byte does not match.
    pub fn new(nvs: Box<dyn NvsBackend + Send>) -> Self {
        let mut store = SettingsStore {
            current: Settings::default(),
            nvs,
        };
        let version = store.nvs.read_byte(ADDR_VERSION);
        if version != SETTINGS_VERSION {
            warn!(
                "settings version {} != {}, restoring defaults",
                version, SETTINGS_VERSION
            );
            store.restore(RESTORE_ALL);
            return store;
        }
        let loaded = match store.read_record(ADDR_GLOBAL) {
            Ok(Some(bytes)) => Settings::deserialize(&bytes),
            _ => None,
        };
        match loaded {
            Some(settings) => store.current = settings,
            None => {
                warn!("settings record unreadable, restoring defaults");
                store.restore(RESTORE_DEFAULTS);
            }
        }
        store
    }

    fn write_record(&mut self, addr: usize, bytes: &[u8]) {
        self.nvs.write_byte(addr, bytes.len() as u8);
        for (i, b) in bytes.iter().enumerate() {
            self.nvs.write_byte(addr + 1 + i, *b);
        }
        self.nvs.write_byte(addr + 1 + bytes.len(), xor_checksum(bytes));
    }

    /// `Ok(None)` for a never-written record, `Err` on checksum mismatch.
    fn read_record(&self, addr: usize) -> Result<Option<Vec<u8>>, Status> {
        let len = self.nvs.read_byte(addr) as usize;
        if len == 0 {
            return Ok(None);
        }
        let bytes: Vec<u8> = (0..len).map(|i| self.nvs.read_byte(addr + 1 + i)).collect();
        let stored = self.nvs.read_byte(addr + 1 + len);
        if xor_checksum(&bytes) != stored {
            return Err(Status::SettingReadFail);
        }
        Ok(Some(bytes))
    }

    /// Persists the current settings record.
    pub fn write_global(&mut self) {
        let bytes = self.current.serialize();
        self.write_record(ADDR_GLOBAL, &bytes);
    }

    /// Wipes and restores the selected regions.
    pub fn restore(&mut self, mask: u8) {
        if mask & RESTORE_DEFAULTS != 0 {
            self.current = Settings::default();
            self.write_global();
        }
        if mask & RESTORE_PARAMETERS != 0 {
            let zero = [0.0f32; MAX_AXES];
            for slot in 0..N_COORD_SLOTS {
                self.write_coord_data(slot, &zero);
            }
        }
        if mask & RESTORE_STARTUP_LINES != 0 {
            for n in 0..2 {
                self.write_startup_line(n, "");
            }
        }
        if mask & RESTORE_BUILD_INFO != 0 {
            self.write_build_info("");
        }
        self.nvs.write_byte(ADDR_VERSION, SETTINGS_VERSION);
        info!("non-volatile area restored (mask {:#06b})", mask);
    }

    fn coord_addr(slot: usize) -> usize {
        ADDR_PARAMETERS + slot * (MAX_AXES * 4 + 2)
    }

    /// Reads one stored coordinate vector (G54..G59, G28, G30). An
    /// unwritten slot reads as all zeros so a fresh machine can select any
    /// system immediately.
    pub fn read_coord_data(&self, slot: usize) -> Result<[f32; MAX_AXES], Status> {
        if slot >= N_COORD_SLOTS {
            return Err(Status::GcodeUnsupportedCoordSys);
        }
        match self.read_record(Self::coord_addr(slot))? {
            Some(bytes) if bytes.len() == MAX_AXES * 4 => {
                let mut out = [0.0f32; MAX_AXES];
                for (axis, value) in out.iter_mut().enumerate() {
                    let raw: [u8; 4] = bytes[axis * 4..axis * 4 + 4]
                        .try_into()
                        .map_err(|_| Status::SettingReadFail)?;
                    *value = f32::from_le_bytes(raw);
                }
                Ok(out)
            }
            Some(_) => Err(Status::SettingReadFail),
            None => Ok([0.0; MAX_AXES]),
        }
    }

    /// Stores one coordinate vector.
    pub fn write_coord_data(&mut self, slot: usize, data: &[f32; MAX_AXES]) {
        let mut bytes = Vec::with_capacity(MAX_AXES * 4);
        for value in data {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        self.write_record(Self::coord_addr(slot), &bytes);
    }

    fn startup_addr(n: usize) -> usize {
        ADDR_STARTUP_LINES + n * (LINE_BUFFER_SIZE + 2)
    }

    pub fn read_startup_line(&self, n: usize) -> Option<String> {
        let bytes = self.read_record(Self::startup_addr(n)).ok()??;
        String::from_utf8(bytes).ok()
    }

    pub fn write_startup_line(&mut self, n: usize, line: &str) {
        let trimmed = &line.as_bytes()[..line.len().min(LINE_BUFFER_SIZE)];
        self.write_record(Self::startup_addr(n), trimmed);
    }

    pub fn read_build_info(&self) -> Option<String> {
        let bytes = self.read_record(ADDR_BUILD_INFO).ok()??;
        String::from_utf8(bytes).ok()
    }

    pub fn write_build_info(&mut self, info: &str) {
        let trimmed = &info.as_bytes()[..info.len().min(LINE_BUFFER_SIZE)];
        self.write_record(ADDR_BUILD_INFO, trimmed);
    }

    /// Applies a `$<key>=<value>` write, validating and persisting.
    pub fn set_numeric(&mut self, key: u32, value: f32) -> Result<(), Status> {
        if value < 0.0 {
            return Err(Status::NegativeValue);
        }
        if key >= 100 {
            let axis = (key % 10) as usize;
            if axis >= MAX_AXES {
                return Err(Status::InvalidStatement);
            }
            match key - key % 10 {
                100 => self.current.axis[axis].steps_per_mm = value,
                110 => self.current.axis[axis].max_rate = value,
                120 => self.current.axis[axis].acceleration = value * 60.0 * 60.0,
                130 => self.current.axis[axis].max_travel = value,
                _ => return Err(Status::InvalidStatement),
            }
            self.write_global();
            return Ok(());
        }
        let int_value = value as u32;
        match key {
            0 => {
                if int_value < 3 {
                    return Err(Status::SettingStepPulseMin);
                }
                self.current.pulse_microseconds = int_value as u8;
            }
            1 => self.current.stepper_idle_lock_time = int_value as u8,
            2 => self.current.step_invert_mask = int_value as u8,
            3 => self.current.dir_invert_mask = int_value as u8,
            4 => self.current.invert_st_enable = int_value != 0,
            5 => self.current.invert_limit_pins = int_value != 0,
            10 => self.current.status_report_mask = int_value as u8,
            11 => self.current.junction_deviation = value,
            12 => self.current.arc_tolerance = value,
            13 => self.current.report_inches = int_value != 0,
            20 => {
                if int_value != 0 && !self.current.homing_enable {
                    return Err(Status::SoftLimitError);
                }
                self.current.soft_limits = int_value != 0;
            }
            21 => self.current.hard_limits = int_value != 0,
            22 => {
                self.current.homing_enable = int_value != 0;
                if !self.current.homing_enable {
                    self.current.soft_limits = false;
                }
            }
            23 => self.current.homing_dir_mask = int_value as u8,
            24 => self.current.homing_feed_rate = value,
            25 => self.current.homing_seek_rate = value,
            26 => self.current.homing_debounce_ms = int_value as u16,
            27 => self.current.homing_pulloff = value,
            _ => return Err(Status::InvalidStatement),
        }
        self.write_global();
        Ok(())
    }

    /// Value as reported for `$<key>`, or `None` for an unknown key.
    pub fn get_numeric(&self, key: u32) -> Option<f32> {
        if key >= 100 {
            let axis = (key % 10) as usize;
            if axis >= MAX_AXES {
                return None;
            }
            return match key - key % 10 {
                100 => Some(self.current.axis[axis].steps_per_mm),
                110 => Some(self.current.axis[axis].max_rate),
                120 => Some(self.current.axis[axis].acceleration / (60.0 * 60.0)),
                130 => Some(self.current.axis[axis].max_travel),
                _ => None,
            };
        }
        let s = &self.current;
        Some(match key {
            0 => s.pulse_microseconds as f32,
            1 => s.stepper_idle_lock_time as f32,
            2 => s.step_invert_mask as f32,
            3 => s.dir_invert_mask as f32,
            4 => s.invert_st_enable as u8 as f32,
            5 => s.invert_limit_pins as u8 as f32,
            10 => s.status_report_mask as f32,
            11 => s.junction_deviation,
            12 => s.arc_tolerance,
            13 => s.report_inches as u8 as f32,
            20 => s.soft_limits as u8 as f32,
            21 => s.hard_limits as u8 as f32,
            22 => s.homing_enable as u8 as f32,
            23 => s.homing_dir_mask as f32,
            24 => s.homing_feed_rate,
            25 => s.homing_seek_rate,
            26 => s.homing_debounce_ms as f32,
            27 => s.homing_pulloff,
            _ => return None,
        })
    }

    /// Keys listed by `$$`, in report order.
    pub fn listed_keys(n_axis: usize) -> Vec<u32> {
        let mut keys = vec![
            0, 1, 2, 3, 4, 5, 10, 11, 12, 13, 20, 21, 22, 23, 24, 25, 26, 27,
        ];
        for group in [100u32, 110, 120, 130] {
            for axis in 0..n_axis as u32 {
                keys.push(group + axis);
            }
        }
        keys
    }
}
