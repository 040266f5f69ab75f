//! STM32 G0/C0/L0/L1 Flash driver.
//!
//! Shared behavioural contract across this family: two unlock keys to
//! `KEYR`, a separate pair for `OPTKEYR`; dual-bank parts (most L1, some
//! G0) select the bank with a `BKER` bit plus a page-number field; the
//! G0 "empty" cache flag (`ACR.EMPTY`) must be cleared after the first
//! write to `0x0800_0000` so the device boots from user Flash without a
//! power-cycle; DBGMCU freeze bits (`STANDBY`/`STOP`, watchdog) are
//! restored to their pre-attach value on detach.

use crate::error::Error;
use crate::flash::{FlashAlgorithm, FlashGeometry, FlashRegion};
use crate::registry::ProbeFn;
use crate::target::{Command, Target, TargetDriver};
use crate::transport::Transport;
use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::cell::RefCell;

const DBGMCU_IDCODE_ADDR: u32 = 0xE004_2000;
const DBGMCU_CR_ADDR: u32 = 0x4001_5804;
const DBGMCU_CR_FREEZE_BITS: u32 = (1 << 1) | (1 << 2); // DBG_STOP | DBG_STANDBY

const FLASH_BASE: u32 = 0x4002_2000;
const ACR: u32 = FLASH_BASE + 0x00;
const KEYR: u32 = FLASH_BASE + 0x08;
const OPTKEYR: u32 = FLASH_BASE + 0x0C;
const SR: u32 = FLASH_BASE + 0x10;
const CR: u32 = FLASH_BASE + 0x14;
const OPTR: u32 = FLASH_BASE + 0x20;

const FLASH_KEY1: u32 = 0x4567_0123;
const FLASH_KEY2: u32 = 0xCDEF_89AB;
const OPT_KEY1: u32 = 0x0819_2A3B;
const OPT_KEY2: u32 = 0x4C5D_6E7F;

const ACR_EMPTY: u32 = 1 << 16;

bitflags! {
    struct Cr: u32 {
        const PG = 1 << 0;
        const PER = 1 << 1;
        const MER = 1 << 2;
        const STRT = 1 << 6;
        const OPTSTRT = 1 << 17;
        const LOCK = 1 << 7;
        const OPTLOCK = 1 << 30;
        const BKER = 1 << 13;
    }
}

bitflags! {
    struct Sr: u32 {
        const EOP = 1 << 0;
        const PROGERR = 1 << 3;
        const WRPERR = 1 << 4;
        const PGAERR = 1 << 5;
        const SIZERR = 1 << 6;
        const BSY = 1 << 16;
    }
}

const SR_ERROR_MASK: u32 = Sr::PROGERR.bits() | Sr::WRPERR.bits() | Sr::PGAERR.bits() | Sr::SIZERR.bits();

struct PartInfo {
    dev_id: u16,
    name: &'static str,
    flash_size_bytes: u32,
    page_size: u32,
    dual_bank: bool,
}

const PARTS: &[PartInfo] = &[
    PartInfo { dev_id: 0x466, name: "STM32G0B/C", flash_size_bytes: 256 * 1024, page_size: 2048, dual_bank: true },
    PartInfo { dev_id: 0x460, name: "STM32G07/G08", flash_size_bytes: 128 * 1024, page_size: 2048, dual_bank: false },
    PartInfo { dev_id: 0x443, name: "STM32C0x1", flash_size_bytes: 32 * 1024, page_size: 2048, dual_bank: false },
    PartInfo { dev_id: 0x417, name: "STM32L0x1/2/3", flash_size_bytes: 64 * 1024, page_size: 128, dual_bank: false },
    PartInfo { dev_id: 0x416, name: "STM32L15x (cat 1/2)", flash_size_bytes: 128 * 1024, page_size: 256, dual_bank: false },
    PartInfo { dev_id: 0x437, name: "STM32L15x (cat 5/6)", flash_size_bytes: 512 * 1024, page_size: 256, dual_bank: true },
];

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

fn bank_and_page(page_size: u32, flash_size_bytes: u32, dual_bank: bool, addr: u32) -> (bool, u32) {
    let offset = addr - 0x0800_0000;
    if dual_bank {
        let bank_size = flash_size_bytes / 2;
        let bank = offset >= bank_size;
        let page = (offset % bank_size) / page_size;
        (bank, page)
    } else {
        (false, offset / page_size)
    }
}

pub struct Stm32FlashAlgorithm {
    page_size: u32,
    flash_size_bytes: u32,
    dual_bank: bool,
    empty_cache_cleared: bool,
}

impl FlashAlgorithm for Stm32FlashAlgorithm {
    fn erase(&mut self, xport: &mut dyn Transport, _geo: &FlashGeometry, addr: u32, len: u32) -> Result<(), Error> {
        unlock(xport)?;
        clear_errors(xport)?;
        let mut offset = 0;
        while offset < len {
            let page_addr = addr + offset;
            let (bank, page) = bank_and_page(self.page_size, self.flash_size_bytes, self.dual_bank, page_addr);
            let mut cr = Cr::PER.bits() | (page << 3);
            if bank {
                cr |= Cr::BKER.bits();
            }
            write32(xport, CR, cr)?;
            write32(xport, CR, cr | Cr::STRT.bits())?;
            let result = wait_busy(xport);
            write32(xport, CR, 0)?;
            result?;
            offset += self.page_size;
        }
        lock(xport)
    }

    fn write(&mut self, xport: &mut dyn Transport, _geo: &FlashGeometry, dest: u32, src: &[u8]) -> Result<(), Error> {
        unlock(xport)?;
        clear_errors(xport)?;
        write32(xport, CR, Cr::PG.bits())?;
        for (i, word) in src.chunks(4).enumerate() {
            let mut padded = [0xFFu8; 4];
            padded[..word.len()].copy_from_slice(word);
            xport.mem_write(dest + i as u32 * 4, &padded)?;
            wait_busy(xport)?;
        }
        write32(xport, CR, 0)?;

        if dest == 0x0800_0000 && !self.empty_cache_cleared {
            let acr = read32(xport, ACR)?;
            write32(xport, ACR, acr & !ACR_EMPTY)?;
            self.empty_cache_cleared = true;
        }

        lock(xport)
    }

    fn mass_erase(&mut self, xport: &mut dyn Transport, _geo: &FlashGeometry) -> Result<(), Error> {
        unlock(xport)?;
        clear_errors(xport)?;
        let banks: &[bool] = if self.dual_bank { &[false, true] } else { &[false] };
        for &bank in banks {
            let mut cr = Cr::MER.bits();
            if bank {
                cr |= Cr::BKER.bits();
            }
            write32(xport, CR, cr)?;
            write32(xport, CR, cr | Cr::STRT.bits())?;
            let result = wait_busy(xport);
            write32(xport, CR, 0)?;
            result?;
        }
        lock(xport)
    }
}

pub struct Stm32Driver {
    dbgmcu_cr_saved: Option<u32>,
}

impl TargetDriver for Stm32Driver {
    fn attach(&mut self, xport: &mut dyn Transport) -> Result<(), Error> {
        let cr = read32(xport, DBGMCU_CR_ADDR)?;
        self.dbgmcu_cr_saved = Some(cr);
        write32(xport, DBGMCU_CR_ADDR, cr | DBGMCU_CR_FREEZE_BITS)
    }

    fn detach(&mut self, xport: &mut dyn Transport) {
        if let Some(saved) = self.dbgmcu_cr_saved.take() {
            let _ = write32(xport, DBGMCU_CR_ADDR, saved);
        }
    }

    fn mass_erase(&mut self, _xport: &mut dyn Transport) -> Result<(), Error> {
        // Region-level `FlashAlgorithm::mass_erase` already ran the MER
        // sequence for every bank; nothing extra at the device level.
        Ok(())
    }
}

fn cmd_erase_mass(target: &mut Target, _argv: &[&str]) -> Result<bool, Error> {
    target.mass_erase()?;
    Ok(true)
}

fn cmd_irreversible(target: &mut Target, argv: &[&str]) -> Result<bool, Error> {
    match argv.first().copied() {
        Some("enable") => {
            target.irreversible_enabled = true;
            Ok(true)
        }
        Some("disable") => {
            target.irreversible_enabled = false;
            Ok(true)
        }
        _ => Err(Error::Protocol("usage: irreversible enable|disable")),
    }
}

fn target_read32(target: &mut Target, addr: u32) -> Result<u32, Error> {
    let mut buf = [0u8; 4];
    target.mem_read(&mut buf, addr)?;
    Ok(u32::from_le_bytes(buf))
}

fn target_write32(target: &mut Target, addr: u32, value: u32) -> Result<(), Error> {
    target.mem_write(addr, &value.to_le_bytes())
}

fn parse_u32(s: &str) -> Option<u32> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

/// Unlocks `CR` then `OPTKEYR`, pokes one option-byte word, fires `OPTSTRT`,
/// and polls `BSY` before relocking both `CR` and `OPTR`.
fn option_bytes_operation(target: &mut Target, addr: u32, val: u32) -> Result<(), Error> {
    let cr = target_read32(target, CR)?;
    if cr & Cr::LOCK.bits() != 0 {
        target_write32(target, KEYR, FLASH_KEY1)?;
        target_write32(target, KEYR, FLASH_KEY2)?;
    }
    target_write32(target, OPTKEYR, OPT_KEY1)?;
    target_write32(target, OPTKEYR, OPT_KEY2)?;
    target_write32(target, addr, val)?;

    target_write32(target, CR, Cr::OPTSTRT.bits())?;
    loop {
        let sr = target_read32(target, SR)?;
        if sr & Sr::BSY.bits() == 0 {
            if sr & SR_ERROR_MASK != 0 {
                return Err(Error::Controller);
            }
            break;
        }
    }
    target_write32(target, CR, Cr::OPTLOCK.bits() | Cr::LOCK.bits())
}

fn cmd_option(target: &mut Target, argv: &[&str]) -> Result<bool, Error> {
    if !target.irreversible_enabled {
        return Err(Error::GuardedOperationRefused);
    }
    match argv.first().copied() {
        // Reload the factory option bytes: all-ones is the erased value.
        Some("erase") => {
            option_bytes_operation(target, OPTR, 0xFFFF_FFFF)?;
            Ok(true)
        }
        Some("write") => {
            let addr = argv.get(1).and_then(|s| parse_u32(s));
            let val = argv.get(2).and_then(|s| parse_u32(s));
            match (addr, val) {
                (Some(addr), Some(val)) => {
                    option_bytes_operation(target, addr, val)?;
                    Ok(true)
                }
                _ => Err(Error::Protocol("usage: option write <addr> <val>")),
            }
        }
        _ => Err(Error::Protocol("usage: option erase|write <addr> <val>")),
    }
}

const COMMANDS: &[Command] = &[
    Command { name: "erase_mass", help: "Erase the whole device", handler: cmd_erase_mass },
    Command { name: "irreversible", help: "irreversible enable|disable", handler: cmd_irreversible },
    Command { name: "option", help: "option erase|write <addr> <val>", handler: cmd_option },
];

fn probe(xport: &Rc<RefCell<dyn Transport>>) -> Option<Target> {
    let dev_id = {
        let mut x = xport.borrow_mut();
        (read32(&mut *x, DBGMCU_IDCODE_ADDR).ok()? & 0xFFF) as u16
    };
    let part = PARTS.iter().find(|p| p.dev_id == dev_id)?;

    let mut target = Target::new(
        part.name,
        dev_id as u32,
        0,
        xport.clone(),
        Box::new(Stm32Driver { dbgmcu_cr_saved: None }),
    );

    target.add_ram(0x2000_0000, 0x4000);
    target.add_flash(FlashRegion::new(
        FlashGeometry {
            start: 0x0800_0000,
            length: part.flash_size_bytes,
            block_size: part.page_size,
            write_buffer_size: part.page_size,
            erased_byte_value: 0xFF,
        },
        Box::new(Stm32FlashAlgorithm {
            page_size: part.page_size,
            flash_size_bytes: part.flash_size_bytes,
            dual_bank: part.dual_bank,
            empty_cache_cleared: false,
        }),
    ));
    target.add_commands(COMMANDS);

    Some(target)
}

pub const PROBE: ProbeFn = probe;
