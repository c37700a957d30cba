use flash_iap::flash::{align_down, FlashFault, FlashGeometry, FlashRegion, FlashResult, LockScheme, STM32F103};
use stm32f1xx_hal::{flash::{self, FlashSize, SectorSize, FLASH_START}, pac};

/// The FPEC, through the HAL's flash writer. The writer unlocks and relocks the
/// controller around every operation. Write protection sits in the option
/// bytes, which are only reloaded on reset, so it is checked here and never
/// changed.
pub struct Stm32Flash {
  parts: flash::Parts,
  geometry: FlashGeometry,
}

impl Stm32Flash {
  pub fn new(parts: flash::Parts) -> Self {
    Self { parts, geometry: STM32F103 }
  }

  fn writer(&mut self) -> flash::FlashWriter<'_> {
    self.parts.writer(SectorSize::Sz1K, FlashSize::Sz128K)
  }

  fn offset(&self, addr: u32) -> Result<u32, FlashFault> {
    if addr < self.geometry.base || addr >= self.geometry.end() {
      return Err(FlashFault::OutOfRange);
    }
    Ok(addr - FLASH_START)
  }
}

fn fault(e: flash::Error) -> FlashFault {
  match e {
    flash::Error::AddressLargerThanFlash | flash::Error::LengthTooLong => FlashFault::OutOfRange,
    flash::Error::AddressMisaligned | flash::Error::LengthNotMultiple2 => FlashFault::Misaligned,
    flash::Error::UnlockError | flash::Error::LockError => FlashFault::Busy,
    _ => FlashFault::Programming,
  }
}

impl FlashRegion for Stm32Flash {
  fn page_size(&self) -> u32 {
    self.geometry.page_size
  }

  fn erase_unit(&self, addr: u32) -> u32 {
    self.geometry.erase_unit(addr)
  }

  fn lock_scheme(&self) -> LockScheme {
    self.geometry.lock
  }

  fn unlock(&mut self, addr: u32, len: u32) -> FlashResult {
    let LockScheme::OptionBytes { granularity } = self.geometry.lock else { return Err(FlashFault::Unsupported) };
    let start = self.offset(addr)?;
    let end = start.checked_add(len).ok_or(FlashFault::OutOfRange)?;

    // A cleared WRP bit protects its 4K. Clearing it is up to the recovery
    // bootloader, which owns the option bytes.
    let wrp = unsafe { (*pac::FLASH::ptr()).wrpr.read().bits() };
    let mut pos = align_down(start, granularity);
    while pos < end {
      let bit = pos / granularity;
      if bit < 32 && wrp & (1 << bit) == 0 {
        return Err(FlashFault::Protected);
      }
      pos += granularity;
    }
    Ok(())
  }

  fn lock(&mut self, _addr: u32, _len: u32) -> FlashResult {
    Err(FlashFault::Unsupported)
  }

  fn erase(&mut self, addr: u32) -> FlashResult {
    let sector = self.erase_unit(addr);
    let offset = align_down(self.offset(addr)?, sector);
    self.writer().erase(offset, sector as usize).map_err(fault)
  }

  fn write(&mut self, addr: u32, data: &[u8]) -> FlashResult {
    let offset = self.offset(addr)?;
    let mut writer = self.writer();
    // Read back is done by the caller.
    writer.change_verification(false);
    writer.write(offset, data).map_err(fault)
  }

  fn contents(&self, addr: u32, len: u32) -> &[u8] {
    let end = addr.saturating_add(len).min(self.geometry.end());
    let addr = addr.clamp(self.geometry.base, end);
    unsafe { core::slice::from_raw_parts(addr as *const u8, (end - addr) as usize) }
  }
}
