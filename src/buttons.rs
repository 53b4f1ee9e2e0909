use embassy_rp::gpio::{AnyPin, Input};
use embassy_time::{Duration, Ticker};

use reflow_oven_rp_rs::debounce::{Buttons, DebounceConfig, SwitchDebouncer};

use crate::channels::{self, SyncStateChannelSender};
use crate::control::SyncControlStateEnum;
use crate::watchdog::SyncWdStateEnum;

const HEARTBEAT_PERIOD_MS: u32 = 1000;

/// F1..F4 and S, in snapshot bit order.
const PANEL: [Buttons; 5] = [Buttons::F1, Buttons::F2, Buttons::F3, Buttons::F4, Buttons::S];

pub(crate) struct ButtonPanel<'a> {
    inputs: [Input<'a, AnyPin>; 5],
    debouncer: SwitchDebouncer,
    control_tx: SyncStateChannelSender<'a, SyncControlStateEnum>,
    wd_tx: SyncStateChannelSender<'a, SyncWdStateEnum>,
}

impl<'a> ButtonPanel<'a> {
    pub fn new(inputs: [Input<'a, AnyPin>; 5], channels: &'a channels::Channels) -> Self {
        Self {
            inputs,
            debouncer: SwitchDebouncer::new(DebounceConfig::default()),
            control_tx: channels.get_control_tx(),
            wd_tx: channels.get_watchdog_tx(),
        }
    }

    fn snapshot(&self) -> Buttons {
        //buttons pull to ground
        self.inputs
            .iter()
            .zip(PANEL)
            .filter(|(input, _)| input.is_low())
            .fold(Buttons::NONE, |acc, (_, button)| acc | button)
    }

    pub async fn btn_task(&mut self) -> ! {
        let poll_period_ms = self.debouncer.config().poll_period_ms;
        let mut ticker = Ticker::every(Duration::from_millis(poll_period_ms as u64));
        let mut since_heartbeat_ms = 0;
        loop {
            ticker.next().await;

            if let Some(event) = self.debouncer.poll(self.snapshot()) {
                if self.control_tx.try_send(SyncControlStateEnum::Button(event)).is_err() {
                    //ignore: msg dropped
                }
            }

            since_heartbeat_ms += poll_period_ms;
            if since_heartbeat_ms >= HEARTBEAT_PERIOD_MS {
                since_heartbeat_ms = 0;
                if self.wd_tx.try_send(SyncWdStateEnum::ButtonTask).is_err() {
                    //ignore: watchdog has pending heartbeats
                }
            }
        }
    }
}
