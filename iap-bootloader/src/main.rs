#![no_main]
#![no_std]

mod board;
mod flash;
mod link;

extern crate alloc;

use core::{mem::MaybeUninit, sync::atomic::AtomicU32};

use embedded_alloc::Heap;
use panic_halt as _;

#[global_allocator]
static HEAP: Heap = Heap::empty();
const HEAP_SIZE: usize = 8192;

fn heap_init() {
  static mut HEAP_MEM: [MaybeUninit<u8>; HEAP_SIZE] = [MaybeUninit::uninit(); HEAP_SIZE];
  unsafe { HEAP.init(HEAP_MEM.as_ptr() as usize, HEAP_SIZE) }
}

static TIME_MS: AtomicU32 = AtomicU32::new(0);

// The application region: everything between the recovery bootloader and this
// program, see memory.x.
pub const FIRMWARE_START: u32 = 0x0800_5000;
pub const FIRMWARE_END: u32 = 0x0801_C000;

#[rtic::app(device = stm32f1xx_hal::pac, peripherals = true)]
mod app {
  use cortex_m::peripheral::SCB;
  use flash_iap::{config::IapConfig, source::LinkSource, update::Updater, IapImpl, Peripherals};
  use stm32f1xx_hal::{
    prelude::*,
    gpio::{Edge, ExtiPin, Floating, Input, Output, PushPull, PA4, PB0},
    pac::USART1,
    serial::{Config, Serial, Tx},
    timer,
    watchdog::IndependentWatchdog,
  };

  use crate::{
    board::{Iwdg, Millis, Reset, StatusLed},
    flash::Stm32Flash,
    heap_init,
    link::{SpiLink, TRANSFER_DONE},
    FIRMWARE_END, FIRMWARE_START,
  };

  type Iap = IapImpl<Iwdg, Millis, StatusLed, Reset, Tx<USART1>, Stm32Flash, LinkSource<SpiLink<PB0<Output<PushPull>>>>>;

  #[shared]
  struct SharedResources {}

  #[local]
  struct LocalResources {
    iap: Iap,
    nss: PA4<Input<Floating>>,
  }

  #[init]
  fn init(mut ctx: init::Context) -> (SharedResources, LocalResources, init::Monotonics) {
    let mut flash = ctx.device.FLASH.constrain();
    let clocks = ctx.device.RCC.constrain().cfgr.freeze(&mut flash.acr);

    // The application may already have started the watchdog, in which case this
    // only reloads it.
    let mut watchdog = IndependentWatchdog::new(ctx.device.IWDG);
    watchdog.start(3000.millis());
    watchdog.feed();

    heap_init();

    let mut gpioa = ctx.device.GPIOA.split();
    let mut gpiob = ctx.device.GPIOB.split();
    let mut afio = ctx.device.AFIO.constrain();

    /* TIMER INIT */
    let mut systick = ctx.core.SYST.counter_us(&clocks);
    systick.start(1.millis()).unwrap();
    systick.listen(timer::SysEvent::Update);

    /* LED INIT */
    let mut status_led = gpioa.pa8.into_push_pull_output(&mut gpioa.crh);
    status_led.set_low();

    /* DIAGNOSTIC SERIAL */
    let serial_tx_pin = gpioa.pa9.into_alternate_push_pull(&mut gpioa.crh);
    let serial = Serial::new(
      ctx.device.USART1,
      (serial_tx_pin, gpioa.pa10),
      &mut afio.mapr,
      Config::default().baudrate(57600.bps()),
      &clocks
    );
    let (serial_tx, _) = serial.split();

    /* LINK INIT */
    // SCK (PA5) and MOSI (PA7) stay floating inputs, MISO is driven by the peripheral.
    let _miso = gpioa.pa6.into_alternate_push_pull(&mut gpioa.crl);

    let mut nss = gpioa.pa4;
    nss.make_interrupt_source(&mut afio);
    nss.trigger_on_edge(&mut ctx.device.EXTI, Edge::Rising);
    nss.enable_interrupt(&mut ctx.device.EXTI);

    let ready = gpiob.pb0.into_push_pull_output(&mut gpiob.crl);
    let dma = ctx.device.DMA1.split();

    let config = IapConfig::new(FIRMWARE_START, FIRMWARE_END);
    let link = SpiLink::new(ctx.device.SPI1, dma.2, dma.3, ready, config.block_size);

    let mut periph = Peripherals::new(Iwdg(watchdog), Millis, StatusLed(status_led.erase()), Reset, serial_tx);
    periph.report(format_args!("IAP started"));

    let source = LinkSource::new(link, &config);
    let iap = match Updater::new(Stm32Flash::new(flash), source, config.clone()) {
      Ok(updater) => IapImpl::new(periph, updater),
      Err(fault) => {
        periph.abort(&fault, &config);
        SCB::sys_reset();
      }
    };

    (
      SharedResources {},
      LocalResources { iap, nss },
      init::Monotonics()
    )
  }

  #[idle(local = [iap])]
  fn idle(ctx: idle::Context) -> ! {
    loop {
      // Ends in a reset, never returns here.
      ctx.local.iap.poll();
    }
  }

  #[task(binds = SysTick, priority = 15, local = [])]
  fn systick_tick(_: systick_tick::Context) {
    crate::TIME_MS.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
  }

  #[task(binds = EXTI4, priority = 14, local = [nss])]
  fn nss_released(ctx: nss_released::Context) {
    ctx.local.nss.clear_interrupt_pending_bit();
    TRANSFER_DONE.signal();
  }
}
