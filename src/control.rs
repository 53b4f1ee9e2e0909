use embassy_futures::select::Either;
use embassy_rp::peripherals::PWM_CH2;
use embassy_rp::pwm::{self, Pwm};
use embassy_time::{Duration, Instant, Ticker, Timer};
use log::{debug, error, info, warn};

use reflow_oven_rp_rs::debounce::{Buttons, SwitchEvent};
use reflow_oven_rp_rs::heater::PwmShared;
use reflow_oven_rp_rs::profile::{self, MAX_TARGET_C, MIN_TARGET_C, PROFILE_COUNT};
use reflow_oven_rp_rs::runner::{ManualControl, ProfileRunner, RunLog, RunnerConfig, RunnerState, RunnerStatus};
use reflow_oven_rp_rs::settings::Settings;

use crate::channels::{self, SyncStateChannelReceiver, SyncStateChannelSender};
use crate::watchdog::SyncWdStateEnum;
use crate::{FlashStore, OvenSensor};

const IDLE_PERIOD_MS: u64 = 1000;
const MANUAL_START_SETPOINT_C: f32 = 100.0;
const MANUAL_SETPOINT_STEP_C: f32 = 5.0;
const MANUAL_FAN_STEP: f32 = 0.05;

#[derive(Debug, PartialEq)]
pub(crate) enum SyncControlStateEnum {
    Button(SwitchEvent),
}

pub(crate) struct Control<'a> {
    store: FlashStore,
    sensor: OvenSensor,
    settings: Settings,
    pwm: &'a PwmShared,
    case_fan: Pwm<'a, PWM_CH2>,
    case_fan_config: pwm::Config,
    rx: SyncStateChannelReceiver<'a, SyncControlStateEnum>,
    wd_tx: SyncStateChannelSender<'a, SyncWdStateEnum>,
}

impl<'a> Control<'a> {
    pub fn new(
        store: FlashStore,
        sensor: OvenSensor,
        settings: Settings,
        pwm: &'a PwmShared,
        case_fan: Pwm<'a, PWM_CH2>,
        channels: &'a channels::Channels,
    ) -> Self {
        Self {
            store,
            sensor,
            settings,
            pwm,
            case_fan,
            case_fan_config: pwm::Config::default(),
            rx: channels.get_control_rx(),
            wd_tx: channels.get_watchdog_tx(),
        }
    }

    pub async fn control_task(&mut self) -> ! {
        info!("oven ready, profile {}", self.settings.profile_index);
        loop {
            let recv_fut = self.rx.receive();
            let sleep_fut = Timer::after_millis(IDLE_PERIOD_MS);
            let select_fut = crate::select!(recv_fut, sleep_fut,);
            match select_fut.await {
                Either::First(SyncControlStateEnum::Button(event)) => self.on_idle_button(event).await,
                Either::Second(()) => {}
            }

            self.update_case_fan();
            heartbeat(self.wd_tx);
        }
    }

    async fn on_idle_button(&mut self, event: SwitchEvent) {
        let buttons = event.buttons;
        let index = self.settings.profile_index as usize;
        if buttons == Buttons::F1 {
            self.select_profile((index + PROFILE_COUNT - 1) % PROFILE_COUNT);
        } else if buttons == Buttons::F2 {
            self.select_profile((index + 1) % PROFILE_COUNT);
        } else if buttons == Buttons::F3 && !event.repeating {
            match self.settings.save(&mut self.store) {
                Ok(()) => info!("settings saved"),
                Err(e) => error!("settings not saved: {}", e),
            }
        } else if buttons == Buttons::F4 && !event.repeating {
            self.run_manual().await;
        } else if buttons == Buttons::S {
            self.run_profile().await;
        }
    }

    fn select_profile(&mut self, index: usize) {
        self.settings.profile_index = index as u8;
        match profile::load_profile(&mut self.store, index) {
            Ok(profile) => info!("profile {}: '{}', peak {} C", index, profile.name(), profile.peak_c()),
            Err(e) => warn!("profile {}: {}", index, e),
        }
    }

    fn update_case_fan(&mut self) {
        match self.sensor.cold_junction() {
            Ok(case_c) => {
                let duty = self.settings.case_fan_duty(case_c);
                debug!("case {} C, fan {}", case_c, duty);
                self.set_case_fan(duty);
            }
            Err(e) => {
                warn!("case temperature: {}", e);
                self.set_case_fan(1.0);
            }
        }
    }

    fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            min_fan_speed: self.settings.min_fan_speed,
            ..RunnerConfig::default()
        }
    }

    fn set_case_fan(&mut self, duty: f32) {
        self.case_fan_config.compare_a = (duty * self.case_fan_config.top as f32) as u16;
        self.case_fan.set_config(&self.case_fan_config);
    }

    /**
    ### Runs the selected profile until acknowledged
    * The profile is loaded once, before the run starts
    * S aborts a running profile, any button acknowledges a finished one
    */
    async fn run_profile(&mut self) {
        let index = self.settings.profile_index as usize;
        let profile = match profile::load_profile(&mut self.store, index) {
            Ok(profile) => profile,
            Err(e) => {
                error!("profile {} not started: {}", index, e);
                return;
            }
        };

        self.set_case_fan(1.0);

        let config = self.runner_config();
        let rx = self.rx;
        let wd_tx = self.wd_tx;
        let mut runner = ProfileRunner::new(&mut self.sensor, self.pwm, self.settings.pid, config);
        if let Err(e) = runner.start(&profile) {
            error!("profile {} not started: {}", index, e);
            return;
        }

        let mut ticker = Ticker::every(Duration::from_millis(config.sample_period.as_millis() as u64));
        loop {
            let tick_fut = ticker.next();
            let recv_fut = rx.receive();
            let select_fut = crate::select!(tick_fut, recv_fut,);
            match select_fut.await {
                Either::First(()) => {
                    let now = core::time::Duration::from_millis(Instant::now().as_millis());
                    if runner.tick(now) == RunnerState::Running {
                        log_status(&runner.status());
                    }
                }
                Either::Second(SyncControlStateEnum::Button(event)) => {
                    if runner.state() == RunnerState::Running {
                        if event.buttons.contains(Buttons::S) && runner.abort().is_err() {
                            //ignore: finished in the meantime
                        }
                    } else {
                        report_log(runner.log());
                        if runner.acknowledge().is_ok() {
                            info!("run acknowledged");
                            break;
                        }
                    }
                }
            }

            heartbeat(wd_tx);
        }
    }

    /**
    ### Manual oven control until S
    * Starts with the heater off and the fan stopped
    * F2 toggles the heater, holding the setpoint through the PID
    * F3/F4 change the setpoint while heating, the fan speed otherwise
    * F1 toggles the fan while the heater is off
    */
    async fn run_manual(&mut self) {
        self.set_case_fan(1.0);

        let config = self.runner_config();
        let rx = self.rx;
        let wd_tx = self.wd_tx;
        let mut setpoint_c = MANUAL_START_SETPOINT_C;
        let mut fan_speed = 1.0f32;
        let mut control = ManualControl::Fan { duty: 0.0 };
        let mut runner = ProfileRunner::new(&mut self.sensor, self.pwm, self.settings.pid, config);
        if let Err(e) = runner.start_manual(control) {
            error!("manual mode not started: {}", e);
            return;
        }

        let mut ticker = Ticker::every(Duration::from_millis(config.sample_period.as_millis() as u64));
        loop {
            let tick_fut = ticker.next();
            let recv_fut = rx.receive();
            let select_fut = crate::select!(tick_fut, recv_fut,);
            match select_fut.await {
                Either::First(()) => {
                    let now = core::time::Duration::from_millis(Instant::now().as_millis());
                    if runner.tick(now) == RunnerState::Manual {
                        log_status(&runner.status());
                    }
                }
                Either::Second(SyncControlStateEnum::Button(event)) => {
                    if runner.state() != RunnerState::Manual {
                        report_log(runner.log());
                        if runner.acknowledge().is_ok() {
                            break;
                        }
                        continue;
                    }
                    //heater time limit switches back to fan control
                    if let Some(current) = runner.status().manual {
                        control = current;
                    }

                    let buttons = event.buttons;
                    let next = match control {
                        _ if buttons == Buttons::S => {
                            if runner.abort().is_err() {
                                //ignore: faulted in the meantime
                            }
                            report_log(runner.log());
                            if runner.acknowledge().is_err() {
                                //ignore: aborted just above
                            }
                            info!("manual mode left");
                            break;
                        }
                        ManualControl::Fan { duty } if buttons == Buttons::F1 && !event.repeating => {
                            ManualControl::Fan {
                                duty: if duty > 0.0 { 0.0 } else { fan_speed },
                            }
                        }
                        ManualControl::Fan { duty } if buttons == Buttons::F2 && !event.repeating => {
                            fan_speed = if duty > 0.0 { duty } else { fan_speed };
                            ManualControl::Hold { setpoint_c }
                        }
                        ManualControl::Hold { .. } if buttons == Buttons::F2 && !event.repeating => {
                            //fan keeps its current speed
                            ManualControl::Fan {
                                duty: runner.status().fan_duty,
                            }
                        }
                        ManualControl::Hold { .. } if buttons == Buttons::F3 || buttons == Buttons::F4 => {
                            let step = if buttons == Buttons::F3 { MANUAL_SETPOINT_STEP_C } else { -MANUAL_SETPOINT_STEP_C };
                            setpoint_c = (setpoint_c + step).max(MIN_TARGET_C).min(MAX_TARGET_C);
                            ManualControl::Hold { setpoint_c }
                        }
                        ManualControl::Fan { .. } if buttons == Buttons::F3 || buttons == Buttons::F4 => {
                            let step = if buttons == Buttons::F3 { MANUAL_FAN_STEP } else { -MANUAL_FAN_STEP };
                            fan_speed = (fan_speed + step).max(0.0).min(1.0);
                            ManualControl::Fan { duty: fan_speed }
                        }
                        current => current,
                    };
                    if next != control && runner.set_manual(next).is_ok() {
                        info!("manual: {:?}", next);
                        control = next;
                    }
                }
            }

            heartbeat(wd_tx);
        }
    }
}

fn log_status(status: &RunnerStatus) {
    info!(
        "{:.0}/{} s set {:.1} C is {:.1} C heat {:.2} fan {:.2}",
        status.elapsed_s,
        status.duration_s,
        status.setpoint_c,
        status.measured_c.unwrap_or(f32::NAN),
        status.heater_duty,
        status.fan_duty
    );
}

/// Dumps the run over the USB log as `time,state,set,measured,heater,fan`.
fn report_log(log: &RunLog) {
    match log.peak_c() {
        Some(peak) => info!("run log: {} samples, peak {:.1} C", log.points().len(), peak),
        None => info!("run log: {} samples", log.points().len()),
    }
    if log.dropped() > 0 {
        warn!("run log: {} samples not kept", log.dropped());
    }
    for point in log.points() {
        info!(
            "{},{:?},{:.1},{:.1},{:.2},{:.2}",
            point.time_s,
            point.state,
            point.setpoint_c,
            point.measured_c.unwrap_or(f32::NAN),
            point.heater_duty,
            point.fan_duty
        );
    }
}

fn heartbeat(wd_tx: SyncStateChannelSender<'_, SyncWdStateEnum>) {
    if wd_tx.try_send(SyncWdStateEnum::ControlTask).is_err() {
        //ignore: watchdog has pending heartbeats
    }
}
