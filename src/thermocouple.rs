use embedded_hal_1::spi::{Error as _, SpiDevice};
use log::warn;

use crate::temperature::{RawReading, TemperatureSource, FAULT_NO_RESPONSE};

/**
### Decodes a MAX31855 conversion frame
* D31..D18: thermocouple, signed, 0.25 °C per lsb
* D15..D4: cold junction, signed, 0.0625 °C per lsb
* D2..D0: short to vcc, short to gnd, open circuit
*/
pub fn decode_frame(frame: [u8; 4]) -> RawReading {
    let thermocouple = i16::from_be_bytes([frame[0], frame[1]]) >> 2;
    let cold_junction = i16::from_be_bytes([frame[2], frame[3]]) >> 4;
    RawReading {
        thermocouple_c: thermocouple as f32 / 4.0,
        cold_junction_c: cold_junction as f32 / 16.0,
        fault_bits: frame[3] & FAULT_NO_RESPONSE,
    }
}

/// MAX31855 K-type thermocouple amplifier on a read-only SPI device.
pub struct Max31855<SPI> {
    spi: SPI,
}

impl<SPI: SpiDevice> Max31855<SPI> {
    pub fn new(spi: SPI) -> Self {
        Self { spi }
    }

    pub fn release(self) -> SPI {
        self.spi
    }
}

impl<SPI: SpiDevice> TemperatureSource for Max31855<SPI> {
    fn raw_reading(&mut self) -> RawReading {
        let mut frame = [0u8; 4];
        match self.spi.read(&mut frame) {
            Ok(()) => decode_frame(frame),
            Err(e) => {
                warn!("max31855: spi read failed: {:?}", e.kind());
                RawReading::no_response()
            }
        }
    }
}

/// Several thermocouples averaged into one reading.
///
/// Faulty channels are left out, the bank only reports a fault when no
/// channel produced a usable sample.
pub struct ThermocoupleBank<S, const N: usize> {
    sources: [S; N],
    oversample: u8,
}

impl<S: TemperatureSource, const N: usize> ThermocoupleBank<S, N> {
    pub fn new(sources: [S; N], oversample: u8) -> Self {
        Self {
            sources,
            oversample: oversample.max(1),
        }
    }

    pub fn sources_mut(&mut self) -> &mut [S; N] {
        &mut self.sources
    }
}

impl<S: TemperatureSource, const N: usize> TemperatureSource for ThermocoupleBank<S, N> {
    fn raw_reading(&mut self) -> RawReading {
        let mut thermocouple_sum = 0.0;
        let mut thermocouple_count = 0u16;
        let mut cold_sum = 0.0;
        let mut cold_count = 0u16;
        let mut first_fault = None;

        for _ in 0..self.oversample {
            for source in self.sources.iter_mut() {
                let reading = source.raw_reading();
                if reading.cold_junction_c.is_finite() && reading.fault_bits != FAULT_NO_RESPONSE {
                    cold_sum += reading.cold_junction_c;
                    cold_count += 1;
                }
                if reading.is_healthy() {
                    thermocouple_sum += reading.thermocouple_c;
                    thermocouple_count += 1;
                } else if first_fault.is_none() {
                    first_fault = Some(reading.fault_bits);
                }
            }
        }

        let cold_junction_c = if cold_count > 0 {
            cold_sum / cold_count as f32
        } else {
            f32::NAN
        };

        if thermocouple_count == 0 {
            return RawReading {
                thermocouple_c: f32::NAN,
                cold_junction_c,
                fault_bits: match first_fault {
                    Some(bits) if bits != 0 => bits,
                    _ => FAULT_NO_RESPONSE,
                },
            };
        }

        RawReading {
            thermocouple_c: thermocouple_sum / thermocouple_count as f32,
            cold_junction_c,
            fault_bits: 0,
        }
    }
}
