use core::fmt;

use embedded_hal_1::digital::OutputPin;
use log::{info, warn};
#[allow(unused_imports)]
use micromath::F32Ext;
use portable_atomic::{AtomicBool, AtomicU32, Ordering};

pub const DEFAULT_WINDOW_HALF_CYCLES: u16 = 100;
pub const DEFAULT_MAINS_TIMEOUT_MS: u32 = 100;
pub const DEFAULT_FAN_KICK_HALF_CYCLES: u16 = 10;

const CHANNEL_COUNT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Heater,
    Fan,
}

impl Channel {
    fn index(self) -> usize {
        match self {
            Channel::Heater => 0,
            Channel::Fan => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MainsSyncLost;

impl fmt::Display for MainsSyncLost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("mains zero crossing lost")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PwmConfig {
    pub window_half_cycles: u16,
    pub mains_timeout_ms: u32,
    pub fan_kick_half_cycles: u16,
}

impl Default for PwmConfig {
    fn default() -> Self {
        Self {
            window_half_cycles: DEFAULT_WINDOW_HALF_CYCLES,
            mains_timeout_ms: DEFAULT_MAINS_TIMEOUT_MS,
            fan_kick_half_cycles: DEFAULT_FAN_KICK_HALF_CYCLES,
        }
    }
}

/// State shared between the control loop and the zero-crossing context.
///
/// Everything is a plain atomic so either side can run from interrupt context.
/// Duties are stored as `f32` bit patterns.
pub struct PwmShared {
    duty: [AtomicU32; CHANNEL_COUNT],
    edge_count: AtomicU32,
    last_edge_ms: AtomicU32,
    sync_lost: AtomicBool,
    mains_timeout_ms: u32,
}

impl PwmShared {
    pub const fn new(mains_timeout_ms: u32) -> Self {
        Self {
            duty: [AtomicU32::new(0), AtomicU32::new(0)],
            edge_count: AtomicU32::new(0),
            last_edge_ms: AtomicU32::new(0),
            sync_lost: AtomicBool::new(false),
            mains_timeout_ms,
        }
    }

    pub fn set_duty_fraction(&self, channel: Channel, duty: f32) {
        let duty = if self.is_sync_lost() || duty.is_nan() {
            0.0
        } else {
            duty.max(0.0).min(1.0)
        };
        self.duty[channel.index()].store(duty.to_bits(), Ordering::Release);
    }

    pub fn duty_fraction(&self, channel: Channel) -> f32 {
        f32::from_bits(self.duty[channel.index()].load(Ordering::Acquire))
    }

    pub fn force_off(&self) {
        for duty in self.duty.iter() {
            duty.store(0.0f32.to_bits(), Ordering::Release);
        }
    }

    pub fn record_zero_crossing(&self, now_ms: u32) {
        self.last_edge_ms.store(now_ms, Ordering::Release);
        self.edge_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn edge_count(&self) -> u32 {
        self.edge_count.load(Ordering::Acquire)
    }

    pub fn mains_timeout_ms(&self) -> u32 {
        self.mains_timeout_ms
    }

    /// Milliseconds since the last zero crossing, 0 for an edge newer than `now_ms`.
    pub fn edge_age_ms(&self, now_ms: u32) -> u32 {
        let since_edge = now_ms.wrapping_sub(self.last_edge_ms.load(Ordering::Acquire));
        //edge recorded after `now_ms` was sampled
        if since_edge > u32::MAX / 2 {
            0
        } else {
            since_edge
        }
    }

    /**
    ### Mains supervision
    * Fails when the last zero crossing is older than the timeout
    * Forces every duty to 0 and latches until `clear_fault`
    */
    pub fn check_sync(&self, now_ms: u32) -> Result<(), MainsSyncLost> {
        if self.is_sync_lost() {
            return Err(MainsSyncLost);
        }
        let since_edge = self.edge_age_ms(now_ms);
        if since_edge > self.mains_timeout_ms {
            self.sync_lost.store(true, Ordering::Release);
            self.force_off();
            warn!("no zero crossing for {} ms, outputs off", since_edge);
            return Err(MainsSyncLost);
        }
        Ok(())
    }

    pub fn is_sync_lost(&self) -> bool {
        self.sync_lost.load(Ordering::Acquire)
    }

    pub fn clear_fault(&self) {
        if self.sync_lost.swap(false, Ordering::AcqRel) {
            info!("mains sync fault cleared");
        }
    }
}

impl Default for PwmShared {
    fn default() -> Self {
        Self::new(DEFAULT_MAINS_TIMEOUT_MS)
    }
}

/// Spreads `round(duty * window)` on half-cycles evenly over each window.
#[derive(Debug, Clone)]
pub struct HalfCycleScheduler {
    window: u16,
    position: u16,
    on_count: u16,
    accumulator: u32,
}

impl HalfCycleScheduler {
    pub fn new(window: u16) -> Self {
        Self {
            window: window.max(1),
            position: 0,
            on_count: 0,
            accumulator: 0,
        }
    }

    /// Advances by one half-cycle, the duty is only latched at window start.
    pub fn next(&mut self, duty: f32) -> bool {
        if self.position == 0 {
            let duty = if duty.is_nan() { 0.0 } else { duty.max(0.0).min(1.0) };
            self.on_count = ((duty * self.window as f32).round() as u16).min(self.window);
            self.accumulator = 0;
        }
        self.position += 1;
        if self.position >= self.window {
            self.position = 0;
        }

        self.accumulator += self.on_count as u32;
        if self.accumulator >= self.window as u32 {
            self.accumulator -= self.window as u32;
            true
        } else {
            false
        }
    }

    pub fn on_count(&self) -> u16 {
        self.on_count
    }
}

pub trait PowerSwitch {
    fn set_half_cycle_state(&mut self, on: bool);
}

impl<T: PowerSwitch + ?Sized> PowerSwitch for &mut T {
    fn set_half_cycle_state(&mut self, on: bool) {
        (**self).set_half_cycle_state(on)
    }
}

/// Zero-crossing solid state relay on a gpio.
pub struct SsrSwitch<P> {
    pin: P,
}

impl<P: OutputPin> SsrSwitch<P> {
    pub fn new(mut pin: P) -> Self {
        if pin.set_low().is_err() {
            //ignore: retried on the next half-cycle
        }
        Self { pin }
    }
}

impl<P: OutputPin> PowerSwitch for SsrSwitch<P> {
    fn set_half_cycle_state(&mut self, on: bool) {
        let res = if on { self.pin.set_high() } else { self.pin.set_low() };
        if res.is_err() {
            //ignore: retried on the next half-cycle
        }
    }
}

/// Zero-crossing side of the driver, owns the switches.
pub struct ZeroCrossingPwm<'a, H, F> {
    shared: &'a PwmShared,
    heater: H,
    fan: F,
    heater_schedule: HalfCycleScheduler,
    fan_schedule: HalfCycleScheduler,
    fan_kick_half_cycles: u16,
    fan_kick_remaining: u16,
    fan_was_running: bool,
}

impl<'a, H: PowerSwitch, F: PowerSwitch> ZeroCrossingPwm<'a, H, F> {
    pub fn new(shared: &'a PwmShared, mut heater: H, mut fan: F, config: PwmConfig) -> Self {
        heater.set_half_cycle_state(false);
        fan.set_half_cycle_state(false);
        Self {
            shared,
            heater,
            fan,
            heater_schedule: HalfCycleScheduler::new(config.window_half_cycles),
            fan_schedule: HalfCycleScheduler::new(config.window_half_cycles),
            fan_kick_half_cycles: config.fan_kick_half_cycles,
            fan_kick_remaining: 0,
            fan_was_running: false,
        }
    }

    pub fn on_zero_crossing(&mut self, now_ms: u32) {
        self.shared.record_zero_crossing(now_ms);
        if self.shared.is_sync_lost() {
            self.all_off();
            return;
        }

        let heater_on = self.heater_schedule.next(self.shared.duty_fraction(Channel::Heater));

        let fan_duty = self.shared.duty_fraction(Channel::Fan);
        let fan_running = fan_duty > 0.0;
        if fan_running && !self.fan_was_running {
            self.fan_kick_remaining = self.fan_kick_half_cycles;
        } else if !fan_running {
            self.fan_kick_remaining = 0;
        }
        self.fan_was_running = fan_running;

        let mut fan_on = self.fan_schedule.next(fan_duty);
        if self.fan_kick_remaining > 0 {
            self.fan_kick_remaining -= 1;
            fan_on = true;
        }

        self.heater.set_half_cycle_state(heater_on);
        self.fan.set_half_cycle_state(fan_on);
    }

    /**
    ### No edge within the mains timeout
    * Switches are only driven from edges, so a dead detector would leave them as they were
    * Turns both off when the fault is latched or the last edge is at least a timeout old
    * Returns true when the switches were turned off
    */
    pub fn supervise(&mut self, now_ms: u32) -> bool {
        if self.shared.is_sync_lost() || self.shared.edge_age_ms(now_ms) >= self.shared.mains_timeout_ms() {
            self.all_off();
            return true;
        }
        false
    }

    pub fn all_off(&mut self) {
        self.heater.set_half_cycle_state(false);
        self.fan.set_half_cycle_state(false);
        self.fan_kick_remaining = 0;
        self.fan_was_running = false;
    }

    pub fn shared(&self) -> &'a PwmShared {
        self.shared
    }
}
