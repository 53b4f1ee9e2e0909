use core::sync::atomic::{AtomicBool, Ordering};

/**
### Panic handler
* Heater and fan SSRs are released before anything else
* A second panic while resetting goes straight to the hard fault
*/
#[panic_handler]
fn panic_handler(_info: &core::panic::PanicInfo) -> ! {
    static PANICKED: AtomicBool = AtomicBool::new(false);
    cortex_m::interrupt::disable();
    if !PANICKED.load(Ordering::Relaxed) {
        PANICKED.store(true, Ordering::Relaxed);

        let peripherals = unsafe { embassy_rp::Peripherals::steal() };
        crate::reset_peripherals_on_exception(peripherals);
    }
    //cortex-m0+ has no UsageFault, udf always ends in HardFault
    cortex_m::asm::udf();
}
