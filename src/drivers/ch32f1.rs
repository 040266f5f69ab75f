//! WCH CH32F1 Flash driver.
//!
//! CH32F1 is a pin- and peripheral-compatible clone of the STM32F103: same
//! FPEC unlock-key/`CR`/`SR` program-erase sequence, same Cortex-M3 debug
//! core, and — on most samples — the same `DBGMCU_IDCODE` value as a
//! genuine STM32F103, so device-ID alone can't tell them apart. WCH's
//! reference manual documents one extra FPEC register absent from ST's:
//! an unlock-key-gated "fast mode extension" at offset `0x34`, used here
//! purely to positively identify the part (a genuine STM32F103 has nothing
//! mapped there and reads back zero).
//!
//! The fast-mode extension itself — bulk 128-byte page program/erase,
//! faster than the standard FPEC sequence — has no publicly documented
//! register-level behaviour beyond the identification quirk. Rather than
//! guess at its command encoding, this driver identifies CH32F1 through it
//! and then falls back to the standard (documented, STM32F103-compatible)
//! FPEC erase/program path for every actual Flash operation.

use crate::error::Error;
use crate::flash::{FlashAlgorithm, FlashGeometry, FlashRegion};
use crate::registry::ProbeFn;
use crate::target::{Command, Target, TargetDriver};
use crate::transport::Transport;
use alloc::boxed::Box;
use alloc::rc::Rc;
use bitflags::bitflags;
use core::cell::RefCell;

const DBGMCU_IDCODE_ADDR: u32 = 0xE004_2000;
const DHCSR_ADDR: u32 = 0xE000_EDF0; // Cortex-M3 debug halt control/status, read only to confirm the core answers

const FLASH_BASE: u32 = 0x4002_2000;
const KEYR: u32 = FLASH_BASE + 0x04;
const SR: u32 = FLASH_BASE + 0x0C;
const CR: u32 = FLASH_BASE + 0x10;

/// WCH's "fast mode" unlock-key register. Undocumented beyond its
/// existence and reset value; used only as a silicon fingerprint.
const MODEKEYR: u32 = FLASH_BASE + 0x34;
const MODEKEYR_CH32_RESET_VALUE: u32 = 0x0000_1000;

const FLASH_KEY1: u32 = 0x4567_0123;
const FLASH_KEY2: u32 = 0xCDEF_89AB;

bitflags! {
    struct Cr: u32 {
        const PG = 1 << 0;
        const PER = 1 << 1;
        const MER = 1 << 2;
        const STRT = 1 << 6;
        const LOCK = 1 << 7;
    }
}

bitflags! {
    struct Sr: u32 {
        const BSY = 1 << 0;
        const PGERR = 1 << 2;
        const WRPRTERR = 1 << 4;
        const EOP = 1 << 5;
    }
}

const SR_ERROR_MASK: u32 = Sr::PGERR.bits() | Sr::WRPRTERR.bits();

const PAGE_SIZE: u32 = 1024;
const FLASH_SIZE_BYTES: u32 = 64 * 1024;
const RAM_BASE: u32 = 0x2000_0000;
const RAM_SIZE_BYTES: u32 = 20 * 1024;

fn read32(xport: &mut dyn Transport, addr: u32) -> Result<u32, Error> {
    let mut buf = [0u8; 4];
    xport.mem_read(addr, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn write32(xport: &mut dyn Transport, addr: u32, value: u32) -> Result<(), Error> {
    xport.mem_write(addr, &value.to_le_bytes())
}

fn unlock(xport: &mut dyn Transport) -> Result<(), Error> {
    let cr = read32(xport, CR)?;
    if cr & Cr::LOCK.bits() != 0 {
        write32(xport, KEYR, FLASH_KEY1)?;
        write32(xport, KEYR, FLASH_KEY2)?;
    }
    Ok(())
}

fn lock(xport: &mut dyn Transport) -> Result<(), Error> {
    let cr = read32(xport, CR)?;
    write32(xport, CR, cr | Cr::LOCK.bits())
}

fn clear_errors(xport: &mut dyn Transport) -> Result<(), Error> {
    write32(xport, SR, SR_ERROR_MASK)
}

fn wait_busy(xport: &mut dyn Transport) -> Result<(), Error> {
    loop {
        let sr = read32(xport, SR)?;
        if sr & Sr::BSY.bits() == 0 {
            if sr & SR_ERROR_MASK != 0 {
                return Err(Error::Controller);
            }
            return Ok(());
        }
    }
}

pub struct Ch32f1FlashAlgorithm;

impl FlashAlgorithm for Ch32f1FlashAlgorithm {
    fn erase(&mut self, xport: &mut dyn Transport, _geo: &FlashGeometry, addr: u32, len: u32) -> Result<(), Error> {
        unlock(xport)?;
        clear_errors(xport)?;
        let mut offset = 0;
        while offset < len {
            write32(xport, CR, Cr::PER.bits())?;
            write32(xport, FLASH_BASE + 0x14 /* AR */, addr + offset)?;
            write32(xport, CR, Cr::PER.bits() | Cr::STRT.bits())?;
            let result = wait_busy(xport);
            write32(xport, CR, 0)?;
            result?;
            offset += PAGE_SIZE;
        }
        lock(xport)
    }

    fn write(&mut self, xport: &mut dyn Transport, _geo: &FlashGeometry, dest: u32, src: &[u8]) -> Result<(), Error> {
        unlock(xport)?;
        clear_errors(xport)?;
        write32(xport, CR, Cr::PG.bits())?;
        // STM32F1-compatible FPEC programs one 16-bit half-word at a time.
        for (i, halfword) in src.chunks(2).enumerate() {
            let mut padded = [0xFFu8; 2];
            padded[..halfword.len()].copy_from_slice(halfword);
            xport.mem_write(dest + i as u32 * 2, &padded)?;
            wait_busy(xport)?;
        }
        write32(xport, CR, 0)?;
        lock(xport)
    }

    fn mass_erase(&mut self, xport: &mut dyn Transport, _geo: &FlashGeometry) -> Result<(), Error> {
        unlock(xport)?;
        clear_errors(xport)?;
        write32(xport, CR, Cr::MER.bits())?;
        write32(xport, CR, Cr::MER.bits() | Cr::STRT.bits())?;
        let result = wait_busy(xport);
        write32(xport, CR, 0)?;
        result?;
        lock(xport)
    }
}

pub struct Ch32f1Driver;

impl TargetDriver for Ch32f1Driver {
    fn attach(&mut self, xport: &mut dyn Transport) -> Result<(), Error> {
        // Confirm the debug core is actually present at the expected
        // address before relying on any Flash operation.
        read32(xport, DHCSR_ADDR)?;
        Ok(())
    }

    fn detach(&mut self, _xport: &mut dyn Transport) {}

    fn mass_erase(&mut self, _xport: &mut dyn Transport) -> Result<(), Error> {
        Ok(())
    }
}

fn cmd_erase_mass(target: &mut Target, _argv: &[&str]) -> Result<bool, Error> {
    target.mass_erase()?;
    Ok(true)
}

const COMMANDS: &[Command] =
    &[Command { name: "erase_mass", help: "Erase the whole device", handler: cmd_erase_mass }];

fn probe(xport: &Rc<RefCell<dyn Transport>>) -> Option<Target> {
    let (dev_id, modekeyr) = {
        let mut x = xport.borrow_mut();
        let dev_id = (read32(&mut *x, DBGMCU_IDCODE_ADDR).ok()? & 0xFFF) as u16;
        let modekeyr = read32(&mut *x, MODEKEYR).ok()?;
        (dev_id, modekeyr)
    };

    // STM32F103 medium/high-density share this device ID; only WCH's
    // clone answers with the fast-mode register's documented reset value.
    if dev_id != 0x410 || modekeyr != MODEKEYR_CH32_RESET_VALUE {
        return None;
    }

    let mut target = Target::new("CH32F103", dev_id as u32, 0, xport.clone(), Box::new(Ch32f1Driver));
    target.add_ram(RAM_BASE, RAM_SIZE_BYTES);
    target.add_flash(FlashRegion::new(
        FlashGeometry {
            start: 0x0800_0000,
            length: FLASH_SIZE_BYTES,
            block_size: PAGE_SIZE,
            write_buffer_size: PAGE_SIZE,
            erased_byte_value: 0xFF,
        },
        Box::new(Ch32f1FlashAlgorithm),
    ));
    target.add_commands(COMMANDS);

    Some(target)
}

pub const PROBE: ProbeFn = probe;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;

    fn make_xport(dev_id: u16, modekeyr: u32) -> Rc<RefCell<dyn Transport>> {
        let mut mock = MockTransport::new();
        mock.raw_write(DBGMCU_IDCODE_ADDR, &(dev_id as u32).to_le_bytes());
        mock.raw_write(MODEKEYR, &modekeyr.to_le_bytes());
        mock.raw_write(CR, &0u32.to_le_bytes());
        mock.raw_write(SR, &0u32.to_le_bytes());
        Rc::new(RefCell::new(mock))
    }

    #[test]
    fn probe_recognises_ch32f103_via_modekeyr_fingerprint() {
        let xport = make_xport(0x410, MODEKEYR_CH32_RESET_VALUE);
        let target = probe(&xport).unwrap();
        assert_eq!(target.driver_name, "CH32F103");
    }

    #[test]
    fn probe_rejects_a_genuine_stm32f103_with_the_same_device_id() {
        // Same DBGMCU_IDCODE as CH32F103, but MODEKEYR is unmapped on real
        // silicon and reads back the mock's default 0xFF fill.
        let xport = make_xport(0x410, 0xFFFF_FFFF);
        assert!(probe(&xport).is_none());
    }

    #[test]
    fn erase_then_program_round_trips_half_words() {
        let xport = make_xport(0x410, MODEKEYR_CH32_RESET_VALUE);
        let mut target = probe(&xport).unwrap();

        target.flash_erase(0x0800_0000, PAGE_SIZE).unwrap();
        target.flash_write(0x0800_0000, &[0x11, 0x22, 0x33, 0x44, 0x55]).unwrap();
        target.flash_complete().unwrap();

        let mut buf = [0u8; 6];
        target.mem_read(&mut buf, 0x0800_0000).unwrap();
        assert_eq!(&buf[..5], &[0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(buf[5], 0xFF); // padding half-word byte
    }

    #[test]
    fn mass_erase_runs_the_fpec_mer_sequence_and_relocks() {
        let xport = make_xport(0x410, MODEKEYR_CH32_RESET_VALUE);
        let mut target = probe(&xport).unwrap();
        target.mass_erase().unwrap();

        let mut cr = [0u8; 4];
        target.mem_read(&mut cr, CR).unwrap();
        assert_eq!(u32::from_le_bytes(cr) & Cr::LOCK.bits(), Cr::LOCK.bits());
    }
}
