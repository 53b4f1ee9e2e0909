use embassy_rp::gpio::{AnyPin, Output};
use embassy_time::Timer;

use crate::channels::{self, wait_for_each_state, SyncStateChannelReceiver};

const WATCHDOG_TIMEOUT_MS: u64 = 3000;

#[derive(Debug, PartialEq)]
pub(crate) enum SyncWdStateEnum {
    ControlTask,
    ButtonTask,
}

pub(crate) struct Watchdog<'a> {
    channel: SyncStateChannelReceiver<'a, SyncWdStateEnum>,
    led: Output<'a, AnyPin>,
}

impl<'a> Watchdog<'a> {
    pub fn new(led: Output<'a, AnyPin>, channels: &'a channels::Channels) -> Self {
        Self {
            channel: channels.get_watchdog_rx(),
            led,
        }
    }

    pub async fn wd_task(&mut self) -> ! {
        let rx = self.channel;
        loop {
            let recv_fut = wait_for_each_state([SyncWdStateEnum::ControlTask, SyncWdStateEnum::ButtonTask], rx);
            let sleep_fut = Timer::after_millis(WATCHDOG_TIMEOUT_MS);
            let select_fut = crate::select!(recv_fut, sleep_fut,);
            match select_fut.await {
                embassy_futures::select::Either::First(_x) => {}
                embassy_futures::select::Either::Second(()) => panic!("wd failed"),
            }

            self.led.toggle();
        }
    }
}
