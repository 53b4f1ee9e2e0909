#![no_std]
#![no_main]

use core::cell::RefCell;

use embassy_executor::Spawner;
use embassy_rp::flash::{self, Flash};
use embassy_rp::gpio::{AnyPin, Input, Level, Output, Pin, Pull};
use embassy_rp::peripherals::{FLASH, SPI0, USB};
use embassy_rp::pwm::{self, Pwm};
use embassy_rp::spi::{self, Spi};
use embassy_rp::{bind_interrupts, usb};
use embedded_hal_bus::spi::RefCellDevice;
use log::info;
use static_cell::StaticCell;

use reflow_oven_rp_rs::heater::{PwmConfig, PwmShared, SsrSwitch, ZeroCrossingPwm, DEFAULT_MAINS_TIMEOUT_MS};
use reflow_oven_rp_rs::settings::{self, Settings};
use reflow_oven_rp_rs::storage::{FlashRegions, NonvolatileStore, StoreLayout};
use reflow_oven_rp_rs::temperature::TemperatureSensor;
use reflow_oven_rp_rs::thermocouple::{Max31855, ThermocoupleBank};

mod buttons;
mod channels;
mod control;
mod panic;
mod watchdog;
mod zero_cross;

bind_interrupts!(struct Irqs {
    USBCTRL_IRQ => usb::InterruptHandler<USB>;
});

const FLASH_SIZE: usize = 2048 * 1024;
const FLASH_ERASE_SIZE: usize = 4096;
/// 8 slots of 4 regions: calibration, settings, 6 user profiles.
const STORAGE_REGIONS: usize = 32;
const STORAGE_OFFSET: u32 = (FLASH_SIZE - STORAGE_REGIONS * FLASH_ERASE_SIZE) as u32;
const MAX31855_SPI_FREQUENCY: u32 = 4_000_000;
const THERMOCOUPLE_COUNT: usize = 4;
const THERMOCOUPLE_OVERSAMPLE: u8 = 4;

pub(crate) type FlashStore = NonvolatileStore<FlashRegions<Flash<'static, FLASH, flash::Blocking, FLASH_SIZE>>>;
type ThermocoupleBus = Spi<'static, SPI0, spi::Blocking>;
type Thermocouple = Max31855<RefCellDevice<'static, ThermocoupleBus, Output<'static, AnyPin>, embassy_time::Delay>>;
pub(crate) type OvenSensor = TemperatureSensor<ThermocoupleBank<Thermocouple, THERMOCOUPLE_COUNT>>;

static PWM: PwmShared = PwmShared::new(DEFAULT_MAINS_TIMEOUT_MS);
static THERMOCOUPLE_BUS: StaticCell<RefCell<ThermocoupleBus>> = StaticCell::new();

/**
### Resets peripherals to safe states on exception
* For panic_handler
* Interrupts are disabled
* No panic allowed
*/
fn reset_peripherals_on_exception(peripherals: embassy_rp::Peripherals) {
    let mut heater = Output::new(peripherals.PIN_22, Level::Low);
    let mut fan = Output::new(peripherals.PIN_21, Level::Low);
    let mut led = Output::new(peripherals.PIN_25, Level::Low);

    heater.set_low();
    fan.set_low();

    led.set_high();
    cortex_m::asm::delay(8_000_000);
    led.set_low();
    cortex_m::asm::delay(8_000_000);
    led.set_high();
    cortex_m::asm::delay(8_000_000);
    led.set_low();
}

#[embassy_executor::task]
async fn logger_task(driver: usb::Driver<'static, USB>) {
    embassy_usb_logger::run!(1024, log::LevelFilter::Info, driver);
}

async fn main_loop(spawner: Spawner) -> ! {
    let peripherals = embassy_rp::init(Default::default());

    //outputs low before anything else
    let heater = SsrSwitch::new(Output::new(peripherals.PIN_22.degrade(), Level::Low));
    let fan = SsrSwitch::new(Output::new(peripherals.PIN_21.degrade(), Level::Low));

    let driver = usb::Driver::new(peripherals.USB, Irqs);
    spawner.spawn(logger_task(driver)).expect("logger spawn fail");

    let flash = Flash::<_, flash::Blocking, FLASH_SIZE>::new_blocking(peripherals.FLASH);
    let regions = FlashRegions::new(flash, STORAGE_OFFSET, STORAGE_REGIONS);
    let mut store = NonvolatileStore::new(regions, StoreLayout::default());
    let calibration = settings::load_calibration(&mut store);
    let startup_settings = Settings::load(&mut store);

    let mut spi_config = spi::Config::default();
    spi_config.frequency = MAX31855_SPI_FREQUENCY;
    let spi_bus = Spi::new_blocking_rxonly(peripherals.SPI0, peripherals.PIN_18, peripherals.PIN_16, spi_config);
    let spi_bus: &'static RefCell<ThermocoupleBus> = THERMOCOUPLE_BUS.init(RefCell::new(spi_bus));
    let chip_selects = [
        Output::new(peripherals.PIN_17.degrade(), Level::High),
        Output::new(peripherals.PIN_19.degrade(), Level::High),
        Output::new(peripherals.PIN_26.degrade(), Level::High),
        Output::new(peripherals.PIN_27.degrade(), Level::High),
    ];
    let thermocouples = chip_selects.map(|cs| Max31855::new(RefCellDevice::new(spi_bus, cs, embassy_time::Delay)));
    let bank = ThermocoupleBank::new(thermocouples, THERMOCOUPLE_OVERSAMPLE);
    let sensor = TemperatureSensor::new(bank, calibration);

    let case_fan = Pwm::new_output_a(peripherals.PWM_CH2, peripherals.PIN_20, pwm::Config::default());
    let zc_input = Input::new(peripherals.PIN_15.degrade(), Pull::None);
    let led = Output::new(peripherals.PIN_25.degrade(), Level::Low);
    let panel = [
        Input::new(peripherals.PIN_2.degrade(), Pull::Up),
        Input::new(peripherals.PIN_3.degrade(), Pull::Up),
        Input::new(peripherals.PIN_4.degrade(), Pull::Up),
        Input::new(peripherals.PIN_5.degrade(), Pull::Up),
        Input::new(peripherals.PIN_6.degrade(), Pull::Up),
    ];

    let pwm_config = PwmConfig {
        fan_kick_half_cycles: startup_settings.fan_kick_half_cycles,
        ..PwmConfig::default()
    };
    info!("store: {} slots, pwm {:?}", store.slot_count(), pwm_config);

    let channels = channels::Channels::new();

    let mut watchdog = watchdog::Watchdog::new(led, &channels);
    let mut zero_cross = zero_cross::ZeroCross::new(zc_input, ZeroCrossingPwm::new(&PWM, heater, fan, pwm_config));
    let mut buttons = buttons::ButtonPanel::new(panel, &channels);
    let mut control = control::Control::new(store, sensor, startup_settings, &PWM, case_fan, &channels);

    let f1 = zero_cross.zc_task();
    let f2 = control.control_task();
    let f3 = watchdog.wd_task();
    let f4 = buttons.btn_task();

    let fut = join!(f1, f2, f3, f4,);

    fut.await;
    panic!("not reachable");
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    main_loop(spawner).await;
}
