use alloc::{vec, vec::Vec};
use core::sync::atomic::{compiler_fence, Ordering};

use embedded_hal::digital::v2::OutputPin;
use flash_iap::source::{CompletionFlag, LinkTransport};
use stm32f1xx_hal::{dma::dma1::{C2, C3}, pac::SPI1};

/// Raised by the NSS interrupt when the host ends a transfer.
pub static TRANSFER_DONE: CompletionFlag = CompletionFlag::new();

/// SPI1 in slave mode with both directions on DMA1 (channel 2 receives,
/// channel 3 transmits). The ready line is a plain GPIO the host watches.
pub struct SpiLink<READY> {
  spi: SPI1,
  rx_dma: C2,
  tx_dma: C3,
  ready: READY,

  rx: Vec<u8>,
  tx: Vec<u8>,
  len: usize,
}

impl<READY: OutputPin> SpiLink<READY> {
  pub fn new(spi: SPI1, mut rx_dma: C2, mut tx_dma: C3, ready: READY, capacity: usize) -> Self {
    // The HAL only drives SPI as a master, so the clock has to be enabled by hand.
    unsafe { (*stm32f1xx_hal::pac::RCC::ptr()).apb2enr.modify(|_, w| w.spi1en().set_bit()) };

    // Mode 1, 8 bit frames, NSS from the pin.
    spi.cr1.write(|w| w
      .cpha().set_bit()
      .cpol().clear_bit()
      .mstr().clear_bit()
      .ssm().clear_bit()
      .dff().clear_bit()
    );
    spi.cr2.write(|w| w.rxdmaen().set_bit().txdmaen().set_bit());

    let dr = &spi.dr as *const _ as u32;
    rx_dma.set_peripheral_address(dr, false);
    tx_dma.set_peripheral_address(dr, false);
    rx_dma.ch().cr.modify(|_, w| w.dir().clear_bit());
    tx_dma.ch().cr.modify(|_, w| w.dir().set_bit());

    Self {
      spi, rx_dma, tx_dma, ready,
      rx: vec![0; capacity],
      tx: vec![0; capacity],
      len: 0,
    }
  }

  fn stop(&mut self) {
    self.spi.cr1.modify(|_, w| w.spe().clear_bit());
    self.rx_dma.stop();
    self.tx_dma.stop();
  }
}

impl<READY: OutputPin> LinkTransport for SpiLink<READY> {
  fn arm(&mut self, tx: &[u8]) {
    self.stop();
    TRANSFER_DONE.clear();

    let len = tx.len().min(self.tx.len());
    self.tx[..len].copy_from_slice(&tx[..len]);
    self.len = len;

    self.rx_dma.set_memory_address(self.rx.as_mut_ptr() as u32, true);
    self.rx_dma.set_transfer_length(len);
    self.tx_dma.set_memory_address(self.tx.as_ptr() as u32, true);
    self.tx_dma.set_transfer_length(len);

    compiler_fence(Ordering::Release);
    self.rx_dma.start();
    self.tx_dma.start();
    self.spi.cr1.modify(|_, w| w.spe().set_bit());
  }

  fn set_ready(&mut self, high: bool) {
    if high {
      self.ready.set_high().ok();
    } else {
      self.ready.set_low().ok();
    }
  }

  fn poll_complete(&mut self, rx: &mut [u8]) -> bool {
    // The select line can come up before the last byte has been moved.
    if !TRANSFER_DONE.is_set() || self.rx_dma.get_ndtr() != 0 {
      return false;
    }

    self.stop();
    TRANSFER_DONE.clear();
    compiler_fence(Ordering::Acquire);

    let n = rx.len().min(self.len);
    rx[..n].copy_from_slice(&self.rx[..n]);
    true
  }

  fn disarm(&mut self) {
    self.stop();
    TRANSFER_DONE.clear();
  }
}
