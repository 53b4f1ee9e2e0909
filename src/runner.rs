use core::fmt;
use core::time::Duration;

use log::{error, info, warn};

use crate::heater::{Channel, PwmShared};
use crate::pid::{OutputBounds, PidController, PidGains};
use crate::profile::{SolderProfile, MAX_TARGET_C, MIN_TARGET_C};
use crate::temperature::{SensorFault, TemperatureSensor, TemperatureSource};
use crate::tools::{as_secs_f32, wrapping_millis};

/// Nine minutes of one second samples.
pub const RUN_LOG_CAPACITY: usize = 9 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Sensor(SensorFault),
    MainsSyncLost,
    Overshoot,
    HeatingStalled,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sensor(fault) => write!(f, "sensor: {}", fault),
            Self::MainsSyncLost => f.write_str("mains sync lost"),
            Self::Overshoot => f.write_str("overshoot"),
            Self::HeatingStalled => f.write_str("heating stalled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Running,
    Manual,
    Completed,
    Aborted,
    Faulted(Fault),
}

impl RunnerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Faulted(_))
    }

    /// Outputs are driven by `tick`.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Manual)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerError {
    Busy,
    NotRunning,
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Busy => "runner busy",
            Self::NotRunning => "no profile running",
        })
    }
}

/// Operator control of the oven outside a profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ManualControl {
    /// PID holds the setpoint with the same heater/fan split as a profile run.
    Hold { setpoint_c: f32 },
    /// Heater off, fan at a fixed duty.
    Fan { duty: f32 },
}

impl ManualControl {
    fn sanitized(self) -> Self {
        match self {
            Self::Hold { setpoint_c } if setpoint_c.is_nan() => Self::Hold { setpoint_c: MIN_TARGET_C },
            Self::Hold { setpoint_c } => Self::Hold {
                setpoint_c: setpoint_c.max(MIN_TARGET_C).min(MAX_TARGET_C),
            },
            Self::Fan { duty } if duty.is_nan() => Self::Fan { duty: 0.0 },
            Self::Fan { duty } => Self::Fan {
                duty: duty.max(0.0).min(1.0),
            },
        }
    }
}

/// Heater saturated for `window` without `min_rise_c` of progress is a fault.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StallGuard {
    pub window: Duration,
    pub min_rise_c: f32,
}

impl Default for StallGuard {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            min_rise_c: 5.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunnerConfig {
    pub sample_period: Duration,
    /// Negative output is cooling with the fan.
    pub output_bounds: OutputBounds,
    pub derivative_alpha: f32,
    pub overshoot_margin_c: f32,
    pub overshoot_duration: Duration,
    pub stall_guard: Option<StallGuard>,
    pub min_fan_speed: f32,
    /// Longest manual hold before the heater is switched off.
    pub manual_heater_limit: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            sample_period: Duration::from_secs(1),
            output_bounds: OutputBounds::new(-1.0, 1.0),
            derivative_alpha: 0.5,
            overshoot_margin_c: 15.0,
            overshoot_duration: Duration::from_secs(10),
            stall_guard: Some(StallGuard::default()),
            min_fan_speed: 0.3,
            manual_heater_limit: Duration::from_secs(800),
        }
    }
}

/// What the front panel shows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunnerStatus {
    pub state: RunnerState,
    pub elapsed_s: f32,
    pub duration_s: u16,
    pub waypoint_index: usize,
    pub setpoint_c: f32,
    pub measured_c: Option<f32>,
    pub heater_duty: f32,
    pub fan_duty: f32,
    pub manual: Option<ManualControl>,
}

/// One sample of a run, taken at the end of every active `tick`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogPoint {
    pub time_s: u16,
    pub state: RunnerState,
    pub setpoint_c: f32,
    pub measured_c: Option<f32>,
    pub heater_duty: f32,
    pub fan_duty: f32,
}

/// Samples of the current or last run, cleared on start.
#[derive(Debug, Clone, Default)]
pub struct RunLog {
    points: heapless::Vec<LogPoint, RUN_LOG_CAPACITY>,
    dropped: u32,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.dropped = 0;
    }

    fn record(&mut self, point: LogPoint) {
        if self.points.push(point).is_err() {
            if self.dropped == 0 {
                warn!("run log full after {} samples", RUN_LOG_CAPACITY);
            }
            self.dropped = self.dropped.saturating_add(1);
        }
    }

    pub fn points(&self) -> &[LogPoint] {
        &self.points
    }

    /// Samples that did not fit.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    pub fn peak_c(&self) -> Option<f32> {
        self.points
            .iter()
            .filter_map(|p| p.measured_c)
            .fold(None, |peak: Option<f32>, t| Some(peak.map_or(t, |peak| peak.max(t))))
    }
}

#[derive(Debug, Clone, Copy)]
enum Mode<'a> {
    Profile(&'a SolderProfile),
    Manual(ManualControl),
}

#[derive(Debug, Clone, Default)]
struct RunState {
    start: Option<Duration>,
    last_tick: Option<Duration>,
    elapsed: Duration,
    waypoint_index: usize,
    setpoint_c: f32,
    measured_c: Option<f32>,
    heater_duty: f32,
    fan_duty: f32,
    overshoot_since: Option<Duration>,
    stall_reference: Option<(Duration, f32)>,
    hold_since: Option<Duration>,
}

/**
### Executes a solder profile or a manual hold
* `tick` is the only place run and PID state change
* Every fault forces both outputs to 0 before the state changes
* Terminal states go back to `Idle` through `acknowledge`
* Every active `tick` appends one sample to the run log
*/
pub struct ProfileRunner<'a, S> {
    sensor: &'a mut TemperatureSensor<S>,
    pwm: &'a PwmShared,
    config: RunnerConfig,
    gains: PidGains,
    pid: PidController,
    mode: Option<Mode<'a>>,
    state: RunnerState,
    run: RunState,
    log: RunLog,
}

impl<'a, S: TemperatureSource> ProfileRunner<'a, S> {
    pub fn new(
        sensor: &'a mut TemperatureSensor<S>,
        pwm: &'a PwmShared,
        gains: PidGains,
        config: RunnerConfig,
    ) -> Self {
        Self {
            sensor,
            pwm,
            pid: PidController::new(gains, config.output_bounds, config.derivative_alpha),
            config,
            gains,
            mode: None,
            state: RunnerState::Idle,
            run: RunState::default(),
            log: RunLog::new(),
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Used from the next `start` on.
    pub fn set_gains(&mut self, gains: PidGains) {
        self.gains = gains;
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    fn begin(&mut self, mode: Mode<'a>, state: RunnerState) -> Result<(), RunnerError> {
        if self.state != RunnerState::Idle {
            return Err(RunnerError::Busy);
        }
        self.pid.reset(self.gains, self.config.output_bounds);
        self.run = RunState::default();
        self.log.clear();
        self.mode = Some(mode);
        self.state = state;
        Ok(())
    }

    pub fn start(&mut self, profile: &'a SolderProfile) -> Result<(), RunnerError> {
        self.begin(Mode::Profile(profile), RunnerState::Running)?;
        info!("run: '{}' started, {} s", profile.name(), profile.duration_s());
        Ok(())
    }

    pub fn start_manual(&mut self, control: ManualControl) -> Result<(), RunnerError> {
        let control = control.sanitized();
        self.begin(Mode::Manual(control), RunnerState::Manual)?;
        info!("manual: started, {:?}", control);
        Ok(())
    }

    /// Changes the manual control, a new hold starts with a fresh PID.
    pub fn set_manual(&mut self, control: ManualControl) -> Result<(), RunnerError> {
        let Some(Mode::Manual(current)) = self.mode.filter(|_| self.state == RunnerState::Manual) else {
            return Err(RunnerError::NotRunning);
        };
        let control = control.sanitized();
        if let (ManualControl::Fan { .. }, ManualControl::Hold { .. }) = (current, control) {
            self.pid.reset(self.gains, self.config.output_bounds);
            self.run.hold_since = None;
            self.run.stall_reference = None;
            self.run.overshoot_since = None;
        }
        self.mode = Some(Mode::Manual(control));
        Ok(())
    }

    pub fn tick(&mut self, now: Duration) -> RunnerState {
        if !self.state.is_active() {
            return self.state;
        }
        match self.mode {
            Some(Mode::Profile(profile)) => self.profile_tick(profile, now),
            Some(Mode::Manual(control)) => self.manual_tick(control, now),
            None => self.finish(RunnerState::Aborted),
        }
        self.log.record(LogPoint {
            time_s: self.run.elapsed.as_secs().min(u16::MAX as u64) as u16,
            state: self.state,
            setpoint_c: self.run.setpoint_c,
            measured_c: self.run.measured_c,
            heater_duty: self.run.heater_duty,
            fan_duty: self.run.fan_duty,
        });
        self.state
    }

    fn profile_tick(&mut self, profile: &SolderProfile, now: Duration) {
        let Some(dt) = self.advance(now) else {
            return;
        };

        let (waypoint_index, setpoint_c) = profile.setpoint_at(as_secs_f32(self.run.elapsed));
        self.run.waypoint_index = waypoint_index;
        self.run.setpoint_c = setpoint_c;

        let Some(measured_c) = self.measure() else {
            return;
        };
        if self.overshoot(now, setpoint_c, measured_c) {
            return;
        }

        if self.run.elapsed.as_secs() >= profile.duration_s() as u64 {
            self.finish(RunnerState::Completed);
            return;
        }

        self.drive(now, dt, setpoint_c, measured_c);
    }

    fn manual_tick(&mut self, control: ManualControl, now: Duration) {
        let Some(dt) = self.advance(now) else {
            return;
        };
        let Some(measured_c) = self.measure() else {
            return;
        };

        match control {
            ManualControl::Hold { setpoint_c } => {
                self.run.setpoint_c = setpoint_c;
                if self.overshoot(now, setpoint_c, measured_c) {
                    return;
                }
                let since = *self.run.hold_since.get_or_insert(now);
                if now.saturating_sub(since) >= self.config.manual_heater_limit {
                    warn!("manual: heater off after {} s", self.config.manual_heater_limit.as_secs());
                    let fan_duty = self.run.fan_duty;
                    self.mode = Some(Mode::Manual(ManualControl::Fan { duty: fan_duty }));
                    self.run.hold_since = None;
                    self.set_outputs(0.0, fan_duty);
                    return;
                }
                self.drive(now, dt, setpoint_c, measured_c);
            }
            ManualControl::Fan { duty } => {
                self.run.setpoint_c = 0.0;
                self.run.overshoot_since = None;
                self.run.stall_reference = None;
                self.set_outputs(0.0, duty);
            }
        }
    }

    /// Run clock and mains check, `None` once faulted.
    fn advance(&mut self, now: Duration) -> Option<Duration> {
        let start = *self.run.start.get_or_insert(now);
        self.run.elapsed = now.saturating_sub(start);
        let dt = self
            .run
            .last_tick
            .map_or(self.config.sample_period, |last| now.saturating_sub(last));
        self.run.last_tick = Some(now);

        if self.pwm.check_sync(wrapping_millis(now)).is_err() {
            self.fault(Fault::MainsSyncLost);
            return None;
        }
        Some(dt)
    }

    fn measure(&mut self) -> Option<f32> {
        match self.sensor.read() {
            Ok(value) => {
                self.run.measured_c = Some(value);
                Some(value)
            }
            Err(e) => {
                self.run.measured_c = None;
                self.fault(Fault::Sensor(e));
                None
            }
        }
    }

    /// True once the run faulted.
    fn overshoot(&mut self, now: Duration, setpoint_c: f32, measured_c: f32) -> bool {
        if measured_c > setpoint_c + self.config.overshoot_margin_c {
            let since = *self.run.overshoot_since.get_or_insert(now);
            if now.saturating_sub(since) > self.config.overshoot_duration {
                warn!("run: {} C against setpoint {} C", measured_c, setpoint_c);
                self.fault(Fault::Overshoot);
                return true;
            }
        } else {
            self.run.overshoot_since = None;
        }
        false
    }

    fn drive(&mut self, now: Duration, dt: Duration, setpoint_c: f32, measured_c: f32) {
        let output = self.pid.step(setpoint_c, measured_c, as_secs_f32(dt));
        let min_fan = self.config.min_fan_speed;
        let (heater_duty, fan_duty) = if output >= 0.0 {
            (output, min_fan)
        } else {
            (0.0, (-output).max(min_fan))
        };
        self.set_outputs(heater_duty, fan_duty);

        if let Some(guard) = self.config.stall_guard {
            if self.stalled(guard, now, heater_duty, setpoint_c, measured_c) {
                self.fault(Fault::HeatingStalled);
            }
        }
    }

    fn stalled(&mut self, guard: StallGuard, now: Duration, heater_duty: f32, setpoint_c: f32, measured_c: f32) -> bool {
        if heater_duty < 1.0 || measured_c >= setpoint_c {
            self.run.stall_reference = None;
            return false;
        }
        let (since, reference_c) = *self.run.stall_reference.get_or_insert((now, measured_c));
        if now.saturating_sub(since) < guard.window {
            return false;
        }
        if measured_c - reference_c < guard.min_rise_c {
            warn!("run: {} C rise in {} s at full power", measured_c - reference_c, guard.window.as_secs());
            return true;
        }
        self.run.stall_reference = Some((now, measured_c));
        false
    }

    pub fn abort(&mut self) -> Result<(), RunnerError> {
        if !self.state.is_active() {
            return Err(RunnerError::NotRunning);
        }
        self.finish(RunnerState::Aborted);
        Ok(())
    }

    pub fn acknowledge(&mut self) -> Result<(), RunnerError> {
        match self.state {
            RunnerState::Running | RunnerState::Manual => Err(RunnerError::Busy),
            RunnerState::Idle => Ok(()),
            state => {
                if state == RunnerState::Faulted(Fault::MainsSyncLost) {
                    self.pwm.clear_fault();
                }
                self.mode = None;
                self.state = RunnerState::Idle;
                Ok(())
            }
        }
    }

    pub fn status(&self) -> RunnerStatus {
        let (duration_s, manual) = match self.mode {
            Some(Mode::Profile(profile)) => (profile.duration_s(), None),
            Some(Mode::Manual(control)) => (0, Some(control)),
            None => (0, None),
        };
        RunnerStatus {
            state: self.state,
            elapsed_s: as_secs_f32(self.run.elapsed),
            duration_s,
            waypoint_index: self.run.waypoint_index,
            setpoint_c: self.run.setpoint_c,
            measured_c: self.run.measured_c,
            heater_duty: self.run.heater_duty,
            fan_duty: self.run.fan_duty,
            manual,
        }
    }

    fn set_outputs(&mut self, heater_duty: f32, fan_duty: f32) {
        self.pwm.set_duty_fraction(Channel::Heater, heater_duty);
        self.pwm.set_duty_fraction(Channel::Fan, fan_duty);
        self.run.heater_duty = heater_duty;
        self.run.fan_duty = fan_duty;
    }

    fn outputs_off(&mut self) {
        self.pwm.force_off();
        self.run.heater_duty = 0.0;
        self.run.fan_duty = 0.0;
    }

    fn finish(&mut self, state: RunnerState) {
        self.outputs_off();
        self.state = state;
        info!("run: {:?} after {} s", state, self.run.elapsed.as_secs());
    }

    fn fault(&mut self, fault: Fault) {
        self.outputs_off();
        self.state = RunnerState::Faulted(fault);
        error!("run: fault: {}", fault);
    }
}

#[cfg(test)]
mod tests {
    use core::cell::Cell;

    use super::*;
    use crate::profile::Waypoint;
    use crate::temperature::{Calibration, RawReading, FAULT_OPEN_CIRCUIT};

    struct Probe<'c> {
        value: &'c Cell<f32>,
        fault_bits: &'c Cell<u8>,
    }

    impl TemperatureSource for Probe<'_> {
        fn raw_reading(&mut self) -> RawReading {
            RawReading {
                thermocouple_c: self.value.get(),
                cold_junction_c: 25.0,
                fault_bits: self.fault_bits.get(),
            }
        }
    }

    fn profile() -> SolderProfile {
        SolderProfile::new(
            "test",
            &[
                Waypoint::new(0, 25.0),
                Waypoint::new(60, 150.0),
                Waypoint::new(120, 150.0),
            ],
            3.0,
        )
        .unwrap()
    }

    fn no_stall_guard() -> RunnerConfig {
        RunnerConfig {
            stall_guard: None,
            ..RunnerConfig::default()
        }
    }

    fn at(secs: u64) -> Duration {
        Duration::from_secs(secs)
    }

    /// Zero crossing seen just before the tick.
    fn tick<S: TemperatureSource>(runner: &mut ProfileRunner<'_, S>, pwm: &PwmShared, now: Duration) -> RunnerState {
        pwm.record_zero_crossing(wrapping_millis(now));
        runner.tick(now)
    }

    #[test]
    fn follows_profile_to_completion() {
        let value = Cell::new(25.0);
        let fault_bits = Cell::new(0);
        let mut sensor = TemperatureSensor::new(
            Probe {
                value: &value,
                fault_bits: &fault_bits,
            },
            Calibration::default(),
        );
        let pwm = PwmShared::default();
        let profile = profile();
        let mut runner = ProfileRunner::new(&mut sensor, &pwm, PidGains::default(), no_stall_guard());
        runner.start(&profile).unwrap();

        let base = 500;
        for t in 0..120 {
            assert_eq!(tick(&mut runner, &pwm, at(base + t)), RunnerState::Running);
            if t == 30 {
                let status = runner.status();
                assert_eq!(status.setpoint_c, 87.5);
                assert_eq!(status.waypoint_index, 0);
                assert_eq!(status.elapsed_s, 30.0);
                assert_eq!(status.heater_duty, 1.0);
                assert_eq!(status.fan_duty, 0.3);
            }
        }
        assert_eq!(tick(&mut runner, &pwm, at(base + 120)), RunnerState::Completed);
        assert_eq!(pwm.duty_fraction(Channel::Heater), 0.0);
        assert_eq!(pwm.duty_fraction(Channel::Fan), 0.0);

        assert_eq!(runner.acknowledge(), Ok(()));
        assert_eq!(runner.state(), RunnerState::Idle);
    }

    #[test]
    fn sensor_fault_stops_heating_within_one_tick() {
        let value = Cell::new(25.0);
        let fault_bits = Cell::new(0);
        let mut sensor = TemperatureSensor::new(
            Probe {
                value: &value,
                fault_bits: &fault_bits,
            },
            Calibration::default(),
        );
        let pwm = PwmShared::default();
        let profile = profile();
        let mut runner = ProfileRunner::new(&mut sensor, &pwm, PidGains::default(), no_stall_guard());
        runner.start(&profile).unwrap();

        for t in 0..10 {
            tick(&mut runner, &pwm, at(t));
        }
        assert!(pwm.duty_fraction(Channel::Heater) > 0.0);

        fault_bits.set(FAULT_OPEN_CIRCUIT);
        assert_eq!(
            tick(&mut runner, &pwm, at(10)),
            RunnerState::Faulted(Fault::Sensor(SensorFault::OpenCircuit))
        );
        assert_eq!(pwm.duty_fraction(Channel::Heater), 0.0);
        assert_eq!(pwm.duty_fraction(Channel::Fan), 0.0);
        assert_eq!(runner.status().measured_c, None);

        // stays faulted until acknowledged
        fault_bits.set(0);
        assert_eq!(
            tick(&mut runner, &pwm, at(11)),
            RunnerState::Faulted(Fault::Sensor(SensorFault::OpenCircuit))
        );
        assert_eq!(runner.start(&profile), Err(RunnerError::Busy));
        runner.acknowledge().unwrap();
        runner.start(&profile).unwrap();
    }

    #[test]
    fn sustained_overshoot_faults() {
        let value = Cell::new(0.0);
        let fault_bits = Cell::new(0);
        let mut sensor = TemperatureSensor::new(
            Probe {
                value: &value,
                fault_bits: &fault_bits,
            },
            Calibration::default(),
        );
        let pwm = PwmShared::default();
        let profile = profile();
        let mut runner = ProfileRunner::new(&mut sensor, &pwm, PidGains::default(), no_stall_guard());
        runner.start(&profile).unwrap();

        for t in 0..=10 {
            value.set(profile.setpoint_at(t as f32).1 + 20.0);
            assert_eq!(tick(&mut runner, &pwm, at(t)), RunnerState::Running);
            assert_eq!(pwm.duty_fraction(Channel::Heater), 0.0);
            assert!(pwm.duty_fraction(Channel::Fan) >= 0.3);
        }
        value.set(profile.setpoint_at(11.0).1 + 20.0);
        assert_eq!(tick(&mut runner, &pwm, at(11)), RunnerState::Faulted(Fault::Overshoot));
        assert_eq!(pwm.duty_fraction(Channel::Fan), 0.0);
    }

    #[test]
    fn short_overshoot_is_tolerated() {
        let value = Cell::new(0.0);
        let fault_bits = Cell::new(0);
        let mut sensor = TemperatureSensor::new(
            Probe {
                value: &value,
                fault_bits: &fault_bits,
            },
            Calibration::default(),
        );
        let pwm = PwmShared::default();
        let profile = profile();
        let mut runner = ProfileRunner::new(&mut sensor, &pwm, PidGains::default(), no_stall_guard());
        runner.start(&profile).unwrap();

        for t in 0..40 {
            // 10 s above the margin, 1 s back in range
            let excess = if t % 11 == 10 { 0.0 } else { 20.0 };
            value.set(profile.setpoint_at(t as f32).1 + excess);
            assert_eq!(tick(&mut runner, &pwm, at(t)), RunnerState::Running);
        }
    }

    #[test]
    fn lost_mains_faults_and_clears_on_acknowledge() {
        let value = Cell::new(25.0);
        let fault_bits = Cell::new(0);
        let mut sensor = TemperatureSensor::new(
            Probe {
                value: &value,
                fault_bits: &fault_bits,
            },
            Calibration::default(),
        );
        let pwm = PwmShared::default();
        let profile = profile();
        let mut runner = ProfileRunner::new(&mut sensor, &pwm, PidGains::default(), no_stall_guard());
        runner.start(&profile).unwrap();

        assert_eq!(tick(&mut runner, &pwm, at(0)), RunnerState::Running);
        assert_eq!(runner.tick(at(1)), RunnerState::Faulted(Fault::MainsSyncLost));
        assert_eq!(pwm.duty_fraction(Channel::Heater), 0.0);
        assert!(pwm.is_sync_lost());

        runner.acknowledge().unwrap();
        assert!(!pwm.is_sync_lost());
    }

    #[test]
    fn abort_turns_outputs_off() {
        let value = Cell::new(25.0);
        let fault_bits = Cell::new(0);
        let mut sensor = TemperatureSensor::new(
            Probe {
                value: &value,
                fault_bits: &fault_bits,
            },
            Calibration::default(),
        );
        let pwm = PwmShared::default();
        let profile = profile();
        let mut runner = ProfileRunner::new(&mut sensor, &pwm, PidGains::default(), no_stall_guard());

        assert_eq!(runner.abort(), Err(RunnerError::NotRunning));
        runner.start(&profile).unwrap();
        assert_eq!(runner.start(&profile), Err(RunnerError::Busy));
        tick(&mut runner, &pwm, at(0));
        tick(&mut runner, &pwm, at(1));
        assert!(pwm.duty_fraction(Channel::Fan) > 0.0);

        runner.abort().unwrap();
        assert_eq!(runner.state(), RunnerState::Aborted);
        assert_eq!(pwm.duty_fraction(Channel::Heater), 0.0);
        assert_eq!(pwm.duty_fraction(Channel::Fan), 0.0);
        assert_eq!(tick(&mut runner, &pwm, at(2)), RunnerState::Aborted);
        assert_eq!(pwm.duty_fraction(Channel::Fan), 0.0);
    }

    #[test]
    fn negative_output_runs_the_fan() {
        let value = Cell::new(200.0);
        let fault_bits = Cell::new(0);
        let mut sensor = TemperatureSensor::new(
            Probe {
                value: &value,
                fault_bits: &fault_bits,
            },
            Calibration::default(),
        );
        let pwm = PwmShared::default();
        let profile = profile();
        let mut runner = ProfileRunner::new(&mut sensor, &pwm, PidGains::default(), no_stall_guard());
        runner.start(&profile).unwrap();

        tick(&mut runner, &pwm, at(0));
        let status = runner.status();
        assert_eq!(status.heater_duty, 0.0);
        assert_eq!(status.fan_duty, 1.0);
    }

    #[test]
    fn stalled_heating_faults() {
        let value = Cell::new(25.0);
        let fault_bits = Cell::new(0);
        let mut sensor = TemperatureSensor::new(
            Probe {
                value: &value,
                fault_bits: &fault_bits,
            },
            Calibration::default(),
        );
        let pwm = PwmShared::default();
        let profile = profile();
        let mut runner = ProfileRunner::new(&mut sensor, &pwm, PidGains::default(), RunnerConfig::default());
        runner.start(&profile).unwrap();

        for t in 0..=50 {
            assert_eq!(tick(&mut runner, &pwm, at(t)), RunnerState::Running);
        }
        let mut state = RunnerState::Running;
        for t in 51..=70 {
            state = tick(&mut runner, &pwm, at(t));
            if state != RunnerState::Running {
                break;
            }
        }
        assert_eq!(state, RunnerState::Faulted(Fault::HeatingStalled));
        assert_eq!(pwm.duty_fraction(Channel::Heater), 0.0);
    }

    #[test]
    fn manual_hold_and_fan_control() {
        let value = Cell::new(25.0);
        let fault_bits = Cell::new(0);
        let mut sensor = TemperatureSensor::new(
            Probe {
                value: &value,
                fault_bits: &fault_bits,
            },
            Calibration::default(),
        );
        let pwm = PwmShared::default();
        let profile = profile();
        let mut runner = ProfileRunner::new(&mut sensor, &pwm, PidGains::default(), no_stall_guard());

        assert_eq!(runner.set_manual(ManualControl::Fan { duty: 1.0 }), Err(RunnerError::NotRunning));
        runner.start_manual(ManualControl::Hold { setpoint_c: 100.0 }).unwrap();
        assert_eq!(runner.start(&profile), Err(RunnerError::Busy));
        assert_eq!(runner.acknowledge(), Err(RunnerError::Busy));

        assert_eq!(tick(&mut runner, &pwm, at(0)), RunnerState::Manual);
        let status = runner.status();
        assert_eq!(status.setpoint_c, 100.0);
        assert_eq!(status.heater_duty, 1.0);
        assert_eq!(status.fan_duty, 0.3);
        assert_eq!(status.duration_s, 0);

        runner.set_manual(ManualControl::Fan { duty: 0.5 }).unwrap();
        assert_eq!(tick(&mut runner, &pwm, at(1)), RunnerState::Manual);
        assert_eq!(pwm.duty_fraction(Channel::Heater), 0.0);
        assert_eq!(pwm.duty_fraction(Channel::Fan), 0.5);

        runner.set_manual(ManualControl::Hold { setpoint_c: 400.0 }).unwrap();
        assert_eq!(runner.status().manual, Some(ManualControl::Hold { setpoint_c: 300.0 }));
        tick(&mut runner, &pwm, at(2));
        assert_eq!(runner.status().setpoint_c, 300.0);
        assert_eq!(pwm.duty_fraction(Channel::Heater), 1.0);

        runner.abort().unwrap();
        assert_eq!(pwm.duty_fraction(Channel::Heater), 0.0);
        assert_eq!(pwm.duty_fraction(Channel::Fan), 0.0);
        runner.acknowledge().unwrap();
        runner.start(&profile).unwrap();
    }

    #[test]
    fn manual_hold_has_a_heater_time_limit() {
        let value = Cell::new(25.0);
        let fault_bits = Cell::new(0);
        let mut sensor = TemperatureSensor::new(
            Probe {
                value: &value,
                fault_bits: &fault_bits,
            },
            Calibration::default(),
        );
        let pwm = PwmShared::default();
        let config = RunnerConfig {
            manual_heater_limit: at(10),
            ..no_stall_guard()
        };
        let mut runner = ProfileRunner::new(&mut sensor, &pwm, PidGains::default(), config);
        runner.start_manual(ManualControl::Hold { setpoint_c: 100.0 }).unwrap();

        for t in 0..10 {
            tick(&mut runner, &pwm, at(t));
            assert_eq!(pwm.duty_fraction(Channel::Heater), 1.0);
        }
        assert_eq!(tick(&mut runner, &pwm, at(10)), RunnerState::Manual);
        assert_eq!(pwm.duty_fraction(Channel::Heater), 0.0);
        assert_eq!(pwm.duty_fraction(Channel::Fan), 0.3);
        assert_eq!(runner.status().manual, Some(ManualControl::Fan { duty: 0.3 }));
    }

    #[test]
    fn manual_mode_faults_like_a_run() {
        let value = Cell::new(25.0);
        let fault_bits = Cell::new(0);
        let mut sensor = TemperatureSensor::new(
            Probe {
                value: &value,
                fault_bits: &fault_bits,
            },
            Calibration::default(),
        );
        let pwm = PwmShared::default();
        let mut runner = ProfileRunner::new(&mut sensor, &pwm, PidGains::default(), no_stall_guard());
        runner.start_manual(ManualControl::Fan { duty: 0.4 }).unwrap();

        tick(&mut runner, &pwm, at(0));
        fault_bits.set(FAULT_OPEN_CIRCUIT);
        assert_eq!(
            tick(&mut runner, &pwm, at(1)),
            RunnerState::Faulted(Fault::Sensor(SensorFault::OpenCircuit))
        );
        assert_eq!(pwm.duty_fraction(Channel::Fan), 0.0);
        assert_eq!(runner.set_manual(ManualControl::Fan { duty: 0.4 }), Err(RunnerError::NotRunning));
    }

    #[test]
    fn run_log_keeps_one_sample_per_tick() {
        let value = Cell::new(25.0);
        let fault_bits = Cell::new(0);
        let mut sensor = TemperatureSensor::new(
            Probe {
                value: &value,
                fault_bits: &fault_bits,
            },
            Calibration::default(),
        );
        let pwm = PwmShared::default();
        let profile = profile();
        let mut runner = ProfileRunner::new(&mut sensor, &pwm, PidGains::default(), no_stall_guard());
        runner.start(&profile).unwrap();

        for t in 0..5 {
            value.set(25.0 + t as f32);
            tick(&mut runner, &pwm, at(100 + t));
        }
        fault_bits.set(FAULT_OPEN_CIRCUIT);
        tick(&mut runner, &pwm, at(105));
        // not active any more
        tick(&mut runner, &pwm, at(106));

        let log = runner.log();
        assert_eq!(log.points().len(), 6);
        let point = log.points()[2];
        assert_eq!(point.time_s, 2);
        assert_eq!(point.state, RunnerState::Running);
        assert_eq!(point.measured_c, Some(27.0));
        assert_eq!(point.setpoint_c, profile.setpoint_at(2.0).1);
        assert!(point.heater_duty > 0.0);
        assert_eq!(point.fan_duty, 0.3);
        let last = log.points()[5];
        assert_eq!(last.state, RunnerState::Faulted(Fault::Sensor(SensorFault::OpenCircuit)));
        assert_eq!(last.measured_c, None);
        assert_eq!(last.heater_duty, 0.0);
        assert_eq!(log.peak_c(), Some(29.0));

        runner.acknowledge().unwrap();
        fault_bits.set(0);
        runner.start(&profile).unwrap();
        assert!(runner.log().points().is_empty());
    }

    #[test]
    fn run_log_is_bounded() {
        let value = Cell::new(25.0);
        let fault_bits = Cell::new(0);
        let mut sensor = TemperatureSensor::new(
            Probe {
                value: &value,
                fault_bits: &fault_bits,
            },
            Calibration::default(),
        );
        let pwm = PwmShared::default();
        let mut runner = ProfileRunner::new(&mut sensor, &pwm, PidGains::default(), no_stall_guard());
        runner.start_manual(ManualControl::Fan { duty: 0.2 }).unwrap();

        for t in 0..(RUN_LOG_CAPACITY as u64 + 60) {
            assert_eq!(tick(&mut runner, &pwm, at(t)), RunnerState::Manual);
        }
        assert_eq!(runner.log().points().len(), RUN_LOG_CAPACITY);
        assert_eq!(runner.log().dropped(), 60);
        assert_eq!(runner.log().points()[RUN_LOG_CAPACITY - 1].time_s, RUN_LOG_CAPACITY as u16 - 1);
    }
}
