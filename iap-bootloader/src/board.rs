use core::sync::atomic::Ordering;

use cortex_m::peripheral::SCB;
use flash_iap::{InputOutput, Reboot, SysTick, Watchdog};
use stm32f1xx_hal::{gpio::{ErasedPin, Output}, watchdog::IndependentWatchdog};

pub struct Iwdg(pub IndependentWatchdog);

impl Watchdog for Iwdg {
  fn feed(&mut self) {
    self.0.feed();
  }
}

/// Milliseconds counted by the SysTick interrupt.
pub struct Millis;

impl SysTick for Millis {
  fn time(&self) -> u32 {
    crate::TIME_MS.load(Ordering::Relaxed)
  }
}

pub struct StatusLed(pub ErasedPin<Output>);

impl InputOutput for StatusLed {
  fn set_led(&mut self, on: bool) {
    if on { self.0.set_high() } else { self.0.set_low() }
  }

  fn toggle_led(&mut self) {
    self.0.toggle();
  }
}

/// A failed update leaves no firmware magic behind, so the recovery bootloader
/// keeps the board in DFU after the reset. An abort before erasing leaves the
/// old application intact and it simply starts again.
pub struct Reset;

impl Reboot for Reset {
  fn reboot(&mut self, _success: bool) {
    SCB::sys_reset();
  }
}
