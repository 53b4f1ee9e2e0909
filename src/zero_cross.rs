use embassy_futures::select::Either;
use embassy_rp::gpio::{AnyPin, Input, Output};
use embassy_time::{Instant, Timer};
use log::warn;

use reflow_oven_rp_rs::heater::{SsrSwitch, ZeroCrossingPwm};

pub(crate) type SsrOutput<'a> = SsrSwitch<Output<'a, AnyPin>>;

/// Mains zero-crossing detector driving both SSRs.
pub(crate) struct ZeroCross<'a> {
    input: Input<'a, AnyPin>,
    pwm: ZeroCrossingPwm<'a, SsrOutput<'a>, SsrOutput<'a>>,
}

impl<'a> ZeroCross<'a> {
    pub fn new(input: Input<'a, AnyPin>, pwm: ZeroCrossingPwm<'a, SsrOutput<'a>, SsrOutput<'a>>) -> Self {
        Self { input, pwm }
    }

    pub async fn zc_task(&mut self) -> ! {
        let timeout_ms = self.pwm.shared().mains_timeout_ms() as u64;
        let mut timed_out = false;
        loop {
            let edge_fut = self.input.wait_for_rising_edge();
            let timeout_fut = Timer::after_millis(timeout_ms);
            let select_fut = crate::select!(edge_fut, timeout_fut,);
            let edge = matches!(select_fut.await, Either::First(()));

            //same millisecond clock as the control task
            let now_ms = Instant::now().as_millis() as u32;
            if edge {
                timed_out = false;
                self.pwm.on_zero_crossing(now_ms);
            } else if self.pwm.supervise(now_ms) && !timed_out {
                timed_out = true;
                warn!("no zero crossing for {} ms, SSRs off", timeout_ms);
            }
        }
    }
}
