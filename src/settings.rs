use bincode::{Decode, Encode};
use log::{info, warn};

use crate::heater::DEFAULT_FAN_KICK_HALF_CYCLES;
use crate::pid::PidGains;
use crate::profile::PROFILE_COUNT;
use crate::storage::{ByteStore, NonvolatileStore, Slot, StoreFault};
use crate::temperature::Calibration;

pub const CALIBRATION_SLOT: Slot = Slot(0);
pub const SETTINGS_SLOT: Slot = Slot(1);

const SETTINGS_MAGIC: u8 = 0xB5;
const SETTINGS_VERSION: u8 = 0x03;

const MIN_FAN_SPEED_RANGE: (f32, f32) = (0.05, 1.0);
const MAX_FAN_KICK_HALF_CYCLES: u16 = 50;
/// Case fan never runs slower than this once it is on.
const CASE_FAN_MIN_DUTY: f32 = 0.1;

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct Settings {
    magic: u8,
    version: u8,
    pub pid: PidGains,
    /// Fan speed while the heater is running, fraction of full speed.
    pub min_fan_speed: f32,
    pub fan_kick_half_cycles: u16,
    pub profile_index: u8,
    pub case_fan_start_c: f32,
    pub case_fan_full_c: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            magic: SETTINGS_MAGIC,
            version: SETTINGS_VERSION,
            pid: PidGains::default(),
            min_fan_speed: 0.3,
            fan_kick_half_cycles: DEFAULT_FAN_KICK_HALF_CYCLES,
            profile_index: 0,
            case_fan_start_c: 35.0,
            case_fan_full_c: 45.0,
        }
    }
}

impl Settings {
    pub fn load<B: ByteStore>(store: &mut NonvolatileStore<B>) -> Self {
        let settings = match store.load::<Settings>(SETTINGS_SLOT) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("settings: {}, using defaults", e);
                return Settings::default();
            }
        };

        //sanity checks
        if settings.magic != SETTINGS_MAGIC || settings.version != SETTINGS_VERSION {
            warn!("settings: unknown layout {:#x}/{}, using defaults", settings.magic, settings.version);
            return Settings::default();
        }
        settings.sanitize()
    }

    pub fn save<B: ByteStore>(&self, store: &mut NonvolatileStore<B>) -> Result<(), StoreFault> {
        store.save(SETTINGS_SLOT, &self.clone().sanitize())
    }

    pub fn sanitize(mut self) -> Self {
        let defaults = Settings::default();
        if !self.pid.is_valid() {
            self.pid = defaults.pid;
        }
        if self.min_fan_speed.is_nan() {
            self.min_fan_speed = defaults.min_fan_speed;
        }
        self.min_fan_speed = self
            .min_fan_speed
            .max(MIN_FAN_SPEED_RANGE.0)
            .min(MIN_FAN_SPEED_RANGE.1);
        self.fan_kick_half_cycles = self.fan_kick_half_cycles.min(MAX_FAN_KICK_HALF_CYCLES);
        if self.profile_index as usize >= PROFILE_COUNT {
            self.profile_index = defaults.profile_index;
        }
        let case_fan_ok = self.case_fan_start_c.is_finite()
            && self.case_fan_full_c.is_finite()
            && self.case_fan_start_c < self.case_fan_full_c;
        if !case_fan_ok {
            self.case_fan_start_c = defaults.case_fan_start_c;
            self.case_fan_full_c = defaults.case_fan_full_c;
        }
        self
    }

    /// Case fan duty for the given case temperature.
    ///
    /// Off below the start temperature, then from 10 % up to full speed.
    pub fn case_fan_duty(&self, case_c: f32) -> f32 {
        if case_c.is_nan() {
            return 1.0;
        }
        let span = self.case_fan_full_c - self.case_fan_start_c;
        let duty = CASE_FAN_MIN_DUTY + (case_c - self.case_fan_start_c) / span;
        if duty < CASE_FAN_MIN_DUTY {
            0.0
        } else {
            duty.min(1.0)
        }
    }
}

/// Calibration from flash, defaults when missing or implausible.
pub fn load_calibration<B: ByteStore>(store: &mut NonvolatileStore<B>) -> Calibration {
    match store.load::<Calibration>(CALIBRATION_SLOT) {
        Ok(calibration) if calibration.is_sane() => {
            info!("calibration: gain {} offset {}", calibration.gain, calibration.offset);
            calibration
        }
        Ok(calibration) => {
            warn!("calibration: rejected {:?}, using defaults", calibration);
            Calibration::default()
        }
        Err(e) => {
            warn!("calibration: {}, using defaults", e);
            Calibration::default()
        }
    }
}

pub fn save_calibration<B: ByteStore>(
    store: &mut NonvolatileStore<B>,
    calibration: &Calibration,
) -> Result<(), StoreFault> {
    store.save(CALIBRATION_SLOT, calibration)
}
