use core::time::Duration;

pub type BincodeConfigType =
    bincode::config::Configuration<bincode::config::LittleEndian, bincode::config::Fixint>;
pub const BINCODE_CONFIG: BincodeConfigType = bincode::config::standard()
    .with_little_endian()
    .with_fixed_int_encoding();

/// Millisecond timestamp as kept by the zero-crossing context.
///
/// Wraps after ~49 days, comparisons must use `wrapping_sub`.
pub fn wrapping_millis(now: Duration) -> u32 {
    now.as_millis() as u32
}

pub fn as_secs_f32(duration: Duration) -> f32 {
    duration.as_millis() as f32 / 1000.0
}
