use core::fmt;

use bincode::{Decode, Encode};
use log::warn;
#[allow(unused_imports)]
use micromath::F32Ext;

pub const FAULT_OPEN_CIRCUIT: u8 = 1 << 0;
pub const FAULT_SHORT_TO_GROUND: u8 = 1 << 1;
pub const FAULT_SHORT_TO_VCC: u8 = 1 << 2;
/// All fault bits set: nothing answered on the bus.
pub const FAULT_NO_RESPONSE: u8 = FAULT_OPEN_CIRCUIT | FAULT_SHORT_TO_GROUND | FAULT_SHORT_TO_VCC;

const MIN_CALIBRATION_GAIN: f32 = 0.5;
const MAX_CALIBRATION_GAIN: f32 = 2.0;
const MAX_CALIBRATION_OFFSET: f32 = 30.0;

/// Uncalibrated reading as delivered by a thermocouple amplifier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawReading {
    pub thermocouple_c: f32,
    pub cold_junction_c: f32,
    pub fault_bits: u8,
}

impl RawReading {
    pub const fn no_response() -> Self {
        Self {
            thermocouple_c: f32::NAN,
            cold_junction_c: f32::NAN,
            fault_bits: FAULT_NO_RESPONSE,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.fault_bits == 0 && self.thermocouple_c.is_finite()
    }
}

pub trait TemperatureSource {
    fn raw_reading(&mut self) -> RawReading;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorFault {
    OpenCircuit,
    ShortToGround,
    ShortToVcc,
    NoResponse,
}

impl SensorFault {
    pub fn from_fault_bits(bits: u8) -> Option<Self> {
        let bits = bits & FAULT_NO_RESPONSE;
        if bits == FAULT_NO_RESPONSE {
            Some(Self::NoResponse)
        } else if bits & FAULT_OPEN_CIRCUIT != 0 {
            Some(Self::OpenCircuit)
        } else if bits & FAULT_SHORT_TO_GROUND != 0 {
            Some(Self::ShortToGround)
        } else if bits & FAULT_SHORT_TO_VCC != 0 {
            Some(Self::ShortToVcc)
        } else {
            None
        }
    }
}

impl fmt::Display for SensorFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OpenCircuit => "thermocouple open",
            Self::ShortToGround => "thermocouple shorted to gnd",
            Self::ShortToVcc => "thermocouple shorted to vcc",
            Self::NoResponse => "thermocouple not responding",
        })
    }
}

/// Linear thermocouple correction, `measured = raw * gain + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Encode, Decode)]
pub struct Calibration {
    pub gain: f32,
    pub offset: f32,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            gain: 1.0,
            offset: 0.0,
        }
    }
}

impl Calibration {
    pub fn apply(&self, raw_c: f32) -> f32 {
        raw_c * self.gain + self.offset
    }

    pub fn is_sane(&self) -> bool {
        self.gain.is_finite()
            && self.offset.is_finite()
            && (MIN_CALIBRATION_GAIN..=MAX_CALIBRATION_GAIN).contains(&self.gain)
            && (-MAX_CALIBRATION_OFFSET..=MAX_CALIBRATION_OFFSET).contains(&self.offset)
    }

    /// Calibration routine: fit a line through two reference points.
    ///
    /// Returns `None` when the points coincide or the fit falls outside the
    /// plausible range for a K-type amplifier.
    pub fn from_two_points(raw_low: f32, actual_low: f32, raw_high: f32, actual_high: f32) -> Option<Self> {
        let span = raw_high - raw_low;
        if !span.is_finite() || span.abs() < 1.0 {
            return None;
        }
        let gain = (actual_high - actual_low) / span;
        let calibration = Self {
            gain,
            offset: actual_low - raw_low * gain,
        };
        calibration.is_sane().then_some(calibration)
    }
}

/// Calibrated temperature sensor on top of a raw thermocouple source.
///
/// Hardware faults are reported as [`SensorFault`], never as a number.
pub struct TemperatureSensor<S> {
    source: S,
    calibration: Calibration,
}

impl<S: TemperatureSource> TemperatureSensor<S> {
    pub fn new(source: S, calibration: Calibration) -> Self {
        let calibration = if calibration.is_sane() {
            calibration
        } else {
            warn!("ignoring implausible calibration {:?}", calibration);
            Calibration::default()
        };
        Self { source, calibration }
    }

    pub fn read(&mut self) -> Result<f32, SensorFault> {
        let raw = self.source.raw_reading();
        if let Some(fault) = SensorFault::from_fault_bits(raw.fault_bits) {
            return Err(fault);
        }
        if !raw.thermocouple_c.is_finite() {
            return Err(SensorFault::NoResponse);
        }
        Ok(self.calibration.apply(raw.thermocouple_c))
    }

    /// Temperature of the amplifier itself, used as the case temperature.
    ///
    /// Still available with an open thermocouple, only a silent amplifier fails.
    pub fn cold_junction(&mut self) -> Result<f32, SensorFault> {
        let raw = self.source.raw_reading();
        if raw.fault_bits & FAULT_NO_RESPONSE == FAULT_NO_RESPONSE || !raw.cold_junction_c.is_finite() {
            return Err(SensorFault::NoResponse);
        }
        Ok(raw.cold_junction_c)
    }

    pub fn calibration(&self) -> Calibration {
        self.calibration
    }

    pub fn set_calibration(&mut self, calibration: Calibration) -> bool {
        if !calibration.is_sane() {
            return false;
        }
        self.calibration = calibration;
        true
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }
}
