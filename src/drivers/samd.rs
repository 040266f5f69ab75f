//! Microchip SAM D5x/E5x Flash driver.
//!
//! The NVM controller programs and erases rows directly through MMIO
//! (`CTRLB`/`ADDR`/`INTFLAG`), the same shape as nRF91's NVMC. What sets
//! this family apart is the DSU (Device Service Unit): its `CTRL.CE` bit
//! drives a full-chip erase that is wired straight into the debug access
//! port, bypassing the NVM controller entirely, and still answers even when
//! `STATUSB.PROT` reports the device is security-bit locked.
//!
//! `attach` doesn't refuse a locked device: it records the protection bit
//! and still returns the device to the caller, because the DSU chip-erase
//! path (`monitor erase_mass`, via `TargetDriver::mass_erase`) is exactly
//! the rescue mechanism a locked part needs. Anything that isn't mass
//! erase — programming, region erase — stays refused while locked, since
//! the NVM controller itself won't honour them.

use crate::error::Error;
use crate::flash::{FlashAlgorithm, FlashGeometry, FlashRegion};
use crate::registry::ProbeFn;
use crate::target::{Target, TargetDriver};
use crate::transport::Transport;
use alloc::boxed::Box;
use alloc::rc::Rc;
use core::cell::RefCell;

const DSU_BASE: u32 = 0x4100_2000;
const DSU_CTRL: u32 = DSU_BASE + 0x00;
const DSU_STATUSA: u32 = DSU_BASE + 0x01;
const DSU_STATUSB: u32 = DSU_BASE + 0x02;
const DSU_DID: u32 = DSU_BASE + 0x18;

const DSU_CTRL_CE: u8 = 1 << 4;
const DSU_STATUSA_DONE: u8 = 1 << 0;
const DSU_STATUSB_PROT: u8 = 1 << 0;

const NVMCTRL_BASE: u32 = 0x4100_0000;
const NVMCTRL_CTRLB: u32 = NVMCTRL_BASE + 0x04;
const NVMCTRL_ADDR: u32 = NVMCTRL_BASE + 0x1C;
const NVMCTRL_INTFLAG: u32 = NVMCTRL_BASE + 0x10;

const CTRLB_CMD_EP: u8 = 0x00; // erase page/row
const CTRLB_CMD_WP: u8 = 0x04; // write page
const CTRLB_CMDEX_KEY: u16 = 0xA500;
const INTFLAG_READY: u8 = 1 << 0;

const ROW_SIZE: u32 = 256;
const PAGE_SIZE: u32 = 64;
const FLASH_SIZE_BYTES: u32 = 1024 * 1024;
const RAM_BASE: u32 = 0x2000_0000;
const RAM_SIZE_BYTES: u32 = 256 * 1024;

fn read8(xport: &mut dyn Transport, addr: u32) -> Result<u8, Error> {
    let mut buf = [0u8; 1];
    xport.mem_read(addr, &mut buf)?;
    Ok(buf[0])
}

fn write8(xport: &mut dyn Transport, addr: u32, value: u8) -> Result<(), Error> {
    xport.mem_write(addr, &[value])
}

fn read32(xport: &mut dyn Transport, addr: u32) -> Result<u32, Error> {
    let mut buf = [0u8; 4];
    xport.mem_read(addr, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn wait_nvm_ready(xport: &mut dyn Transport) -> Result<(), Error> {
    loop {
        if read8(xport, NVMCTRL_INTFLAG)? & INTFLAG_READY != 0 {
            return Ok(());
        }
    }
}

fn nvm_command(xport: &mut dyn Transport, addr: u32, cmd: u8) -> Result<(), Error> {
    write8(xport, NVMCTRL_ADDR, (addr / 2) as u8)?;
    let word = CTRLB_CMDEX_KEY | cmd as u16;
    xport.mem_write(NVMCTRL_CTRLB, &word.to_le_bytes())?;
    wait_nvm_ready(xport)
}

pub struct SamdFlashAlgorithm;

impl FlashAlgorithm for SamdFlashAlgorithm {
    fn erase(&mut self, xport: &mut dyn Transport, _geo: &FlashGeometry, addr: u32, len: u32) -> Result<(), Error> {
        let mut offset = 0;
        while offset < len {
            nvm_command(xport, addr + offset, CTRLB_CMD_EP)?;
            offset += ROW_SIZE;
        }
        Ok(())
    }

    fn write(&mut self, xport: &mut dyn Transport, _geo: &FlashGeometry, dest: u32, src: &[u8]) -> Result<(), Error> {
        xport.mem_write(dest, src)?;
        nvm_command(xport, dest, CTRLB_CMD_WP)
    }
}

/// `TargetDriver` for the SAM D5x/E5x family. Tracks whether `attach`
/// observed the security bit so Flash operations other than mass erase can
/// be refused up front rather than failing deep inside the NVM controller.
pub struct SamdDriver {
    protected: bool,
}

impl SamdDriver {
    pub fn new() -> Self {
        Self { protected: false }
    }
}

impl TargetDriver for SamdDriver {
    /// Always succeeds, even on a security-bit-locked device: rescue mode
    /// exists precisely so `monitor erase_mass` remains reachable.
    fn attach(&mut self, xport: &mut dyn Transport) -> Result<(), Error> {
        self.protected = read8(xport, DSU_STATUSB)? & DSU_STATUSB_PROT != 0;
        Ok(())
    }

    fn detach(&mut self, _xport: &mut dyn Transport) {}

    fn enter_flash_mode(&mut self, _xport: &mut dyn Transport) -> Result<(), Error> {
        if self.protected {
            return Err(Error::Protocol("device is security-bit locked; only mass erase is available"));
        }
        Ok(())
    }

    /// The DSU chip-erase path. Works identically whether or not `attach`
    /// found the device locked — it is the one operation the DSU performs
    /// ahead of (and regardless of) the NVM controller's own lock state.
    fn mass_erase(&mut self, xport: &mut dyn Transport) -> Result<(), Error> {
        write8(xport, DSU_CTRL, DSU_CTRL_CE)?;
        loop {
            if read8(xport, DSU_STATUSA)? & DSU_STATUSA_DONE != 0 {
                break;
            }
        }
        self.protected = false;
        Ok(())
    }
}

fn probe(xport: &Rc<RefCell<dyn Transport>>) -> Option<Target> {
    let did = {
        let mut x = xport.borrow_mut();
        read32(&mut *x, DSU_DID).ok()?
    };
    if did & 0xFF00_0000 != 0x6100_0000 {
        return None; // SAM D5x/E5x processor family code
    }

    let mut target = Target::new("SAMD51", did, 0, xport.clone(), Box::new(SamdDriver::new()));
    target.add_ram(RAM_BASE, RAM_SIZE_BYTES);
    target.add_flash(FlashRegion::new(
        FlashGeometry {
            start: 0,
            length: FLASH_SIZE_BYTES,
            block_size: ROW_SIZE,
            write_buffer_size: PAGE_SIZE,
            erased_byte_value: 0xFF,
        },
        Box::new(SamdFlashAlgorithm),
    ));

    Some(target)
}

pub const PROBE: ProbeFn = probe;
