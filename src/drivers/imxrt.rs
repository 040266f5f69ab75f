//! i.MXRT FlexSPI Flash driver.
//!
//! Unlike RP2040's SSI, FlexSPI's "IP command" interface issues whole SPI-NOR
//! transactions (opcode/address/dummy/data) from a four-slot lookup table
//! (LUT) without any bootrom call: the controller itself drives the wire
//! protocol once a slot is programmed. `FlexSpiLutCache` caches which command
//! currently occupies each of the four slots and only reprograms a slot on a
//! miss, evicting whichever slot was least recently used.
//!
//! The IP receive FIFO holds 128 bytes; a read past that is split into
//! multiple IP commands rather than assumed away, so `FlexSpiLutCache::read`
//! chunks at that boundary.
//!
//! `enter_flash_mode`/`exit_flash_mode` bracket a Flash session by leaving
//! XIP (memory-mapped reads) disabled and the MPU region covering FlexSPI's
//! memory window disabled, restoring both on exit, the same save/restore
//! shape as the STM32 driver's DBGMCU freeze bit.

use crate::error::Error;
use crate::flash::spi_nor::{self, AddrMode, Direction, SpiCommand, SpiNorAlgorithm, SpiNorTransport};
use crate::flash::FlashRegion;
use crate::registry::ProbeFn;
use crate::target::{Target, TargetDriver};
use crate::transport::Transport;
use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec;
use core::cell::RefCell;

const FLEXSPI_BASE: u32 = 0x402A_8000;
const MCR0: u32 = FLEXSPI_BASE + 0x00;
const INTR: u32 = FLEXSPI_BASE + 0x30;
const LUTKEY: u32 = FLEXSPI_BASE + 0x18;
const LUTCR: u32 = FLEXSPI_BASE + 0x1C;
const LUT_BASE: u32 = FLEXSPI_BASE + 0x200;
const IPCR0: u32 = FLEXSPI_BASE + 0xA0;
const IPCR1: u32 = FLEXSPI_BASE + 0xA4;
const IPCMD: u32 = FLEXSPI_BASE + 0xB0;
const RFDR_BASE: u32 = FLEXSPI_BASE + 0x100;
const TFDR_BASE: u32 = FLEXSPI_BASE + 0x180;

const LUT_KEY_VALUE: u32 = 0x5AF0_5AF0;
const LUT_UNLOCK: u32 = 0x2;
const LUT_LOCK: u32 = 0x1;

const MCR0_MDIS: u32 = 1 << 1; // module disable, set while reprogramming the LUT
const INTR_IPCMDDONE: u32 = 1 << 0;

const MPU_CTRL_ADDR: u32 = 0xE000_ED94;
const MPU_CTRL_ENABLE: u32 = 1 << 0;

const OCOTP_DEVICE_ID: u32 = 0x401F_4410;

const RAM_BASE: u32 = 0x2020_0000;
const RAM_SIZE_BYTES: u32 = 512 * 1024;
const FLASH_BASE: u32 = 0x6000_0000; // FlexSPI memory-mapped window

const LUT_SLOTS: usize = 4;
/// FlexSPI's IP receive FIFO depth. A read larger than this must be split
/// into multiple IP commands; this driver does the splitting rather than
/// requesting more than the FIFO can hold.
const MAX_IP_TRANSFER: usize = 128;

fn read32(xport: &mut dyn Transport, addr: u32) -> Result<u32, Error> {
    let mut buf = [0u8; 4];
    xport.mem_read(addr, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn write32(xport: &mut dyn Transport, addr: u32, value: u32) -> Result<(), Error> {
    xport.mem_write(addr, &value.to_le_bytes())
}

/// Implements `SpiNorTransport` over FlexSPI's IP-command interface, caching
/// which of the four LUT slots holds which command so a repeated command
/// (page program, sector erase, RDSR) doesn't reprogram the LUT every call.
pub struct FlexSpiLutCache {
    xport: Rc<RefCell<dyn Transport>>,
    slot_tag: [Option<u16>; LUT_SLOTS],
    slot_age: [u32; LUT_SLOTS],
    clock: u32,
}

impl FlexSpiLutCache {
    pub fn new(xport: Rc<RefCell<dyn Transport>>) -> Self {
        Self { xport, slot_tag: [None; LUT_SLOTS], slot_age: [0; LUT_SLOTS], clock: 0 }
    }

    fn tick(&mut self) -> u32 {
        self.clock = self.clock.wrapping_add(1);
        self.clock
    }

    /// Returns the LUT slot programmed for `cmd`, reprogramming the least
    /// recently used slot on a miss.
    fn seq_for(&mut self, cmd: SpiCommand) -> Result<usize, Error> {
        let tag = cmd.to_u16();
        if let Some(idx) = self.slot_tag.iter().position(|t| *t == Some(tag)) {
            let age = self.tick();
            self.slot_age[idx] = age;
            return Ok(idx);
        }

        let evict = (0..LUT_SLOTS)
            .min_by_key(|&i| self.slot_age[i])
            .expect("LUT_SLOTS is nonzero");

        let mut x = self.xport.borrow_mut();
        write32(&mut *x, LUTKEY, LUT_KEY_VALUE)?;
        write32(&mut *x, LUTCR, LUT_UNLOCK)?;
        let instr_addr = LUT_BASE + (evict as u32) * 16;
        write32(&mut *x, instr_addr, cmd.to_u16() as u32)?;
        write32(&mut *x, instr_addr + 4, 0)?;
        write32(&mut *x, instr_addr + 8, 0)?;
        write32(&mut *x, instr_addr + 12, 0)?;
        write32(&mut *x, LUTKEY, LUT_KEY_VALUE)?;
        write32(&mut *x, LUTCR, LUT_LOCK)?;
        drop(x);

        self.slot_tag[evict] = Some(tag);
        let age = self.tick();
        self.slot_age[evict] = age;
        Ok(evict)
    }

    fn run_ip_command(&mut self, seq: usize, address: u32, len: usize) -> Result<(), Error> {
        let mut x = self.xport.borrow_mut();
        write32(&mut *x, IPCR0, address)?;
        write32(&mut *x, IPCR1, ((seq as u32) << 16) | len as u32)?;
        write32(&mut *x, IPCMD, 1)?;
        loop {
            if read32(&mut *x, INTR)? & INTR_IPCMDDONE != 0 {
                break;
            }
        }
        write32(&mut *x, INTR, INTR_IPCMDDONE)
    }

    fn drain_rx(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let mut x = self.xport.borrow_mut();
        let mut offset = 0usize;
        while offset < buf.len() {
            let word = read32(&mut *x, RFDR_BASE + offset as u32)?;
            let bytes = word.to_le_bytes();
            let n = core::cmp::min(4, buf.len() - offset);
            buf[offset..offset + n].copy_from_slice(&bytes[..n]);
            offset += n;
        }
        Ok(())
    }

    fn fill_tx(&mut self, data: &[u8]) -> Result<(), Error> {
        let mut x = self.xport.borrow_mut();
        let mut offset = 0usize;
        while offset < data.len() {
            let mut word = [0u8; 4];
            let n = core::cmp::min(4, data.len() - offset);
            word[..n].copy_from_slice(&data[offset..offset + n]);
            write32(&mut *x, TFDR_BASE + offset as u32, u32::from_le_bytes(word))?;
            offset += n;
        }
        Ok(())
    }
}

impl SpiNorTransport for FlexSpiLutCache {
    fn read(&mut self, cmd: SpiCommand, address: u32, buf: &mut [u8]) -> Result<(), Error> {
        let seq = self.seq_for(cmd)?;
        let mut offset = 0usize;
        while offset < buf.len() {
            let chunk_len = core::cmp::min(MAX_IP_TRANSFER, buf.len() - offset);
            self.run_ip_command(seq, address + offset as u32, chunk_len)?;
            self.drain_rx(&mut buf[offset..offset + chunk_len])?;
            offset += chunk_len;
        }
        Ok(())
    }

    fn write(&mut self, cmd: SpiCommand, address: u32, data: &[u8]) -> Result<(), Error> {
        let seq = self.seq_for(cmd)?;
        let mut offset = 0usize;
        while offset < data.len() {
            let chunk_len = core::cmp::min(MAX_IP_TRANSFER, data.len() - offset);
            self.fill_tx(&data[offset..offset + chunk_len])?;
            self.run_ip_command(seq, address + offset as u32, chunk_len)?;
            offset += chunk_len;
        }
        Ok(())
    }

    fn run_command(&mut self, cmd: SpiCommand, address: Option<u32>) -> Result<(), Error> {
        let seq = self.seq_for(cmd)?;
        self.run_ip_command(seq, address.unwrap_or(0), 0)
    }

    fn read_status(&mut self) -> Result<u8, Error> {
        let mut buf = [0u8; 1];
        self.read(
            SpiCommand::new(spi_nor::opcode::READ_STATUS, AddrMode::None, 0, Direction::In),
            0,
            &mut buf,
        )?;
        Ok(buf[0])
    }
}

/// Saved across a Flash session so `exit_flash_mode` can put the controller
/// back exactly as it found it.
pub struct ImxrtDriver {
    mpu_ctrl_saved: Option<u32>,
    mcr0_saved: Option<u32>,
}

impl ImxrtDriver {
    pub fn new() -> Self {
        Self { mpu_ctrl_saved: None, mcr0_saved: None }
    }
}

impl TargetDriver for ImxrtDriver {
    fn attach(&mut self, _xport: &mut dyn Transport) -> Result<(), Error> {
        Ok(())
    }

    fn detach(&mut self, _xport: &mut dyn Transport) {}

    fn enter_flash_mode(&mut self, xport: &mut dyn Transport) -> Result<(), Error> {
        let mpu_ctrl = read32(xport, MPU_CTRL_ADDR)?;
        self.mpu_ctrl_saved = Some(mpu_ctrl);
        write32(xport, MPU_CTRL_ADDR, mpu_ctrl & !MPU_CTRL_ENABLE)?;

        let mcr0 = read32(xport, MCR0)?;
        self.mcr0_saved = Some(mcr0);
        write32(xport, MCR0, mcr0 | MCR0_MDIS)
    }

    fn exit_flash_mode(&mut self, xport: &mut dyn Transport) -> Result<(), Error> {
        if let Some(mcr0) = self.mcr0_saved.take() {
            write32(xport, MCR0, mcr0)?;
        }
        if let Some(mpu_ctrl) = self.mpu_ctrl_saved.take() {
            write32(xport, MPU_CTRL_ADDR, mpu_ctrl)?;
        }
        Ok(())
    }

    fn mass_erase(&mut self, _xport: &mut dyn Transport) -> Result<(), Error> {
        Ok(())
    }
}

fn probe(xport: &Rc<RefCell<dyn Transport>>) -> Option<Target> {
    let device_id = {
        let mut x = xport.borrow_mut();
        read32(&mut *x, OCOTP_DEVICE_ID).ok()?
    };
    if device_id & 0xFF00_0000 != 0x6900_0000 {
        return None;
    }

    let mut flexspi = FlexSpiLutCache::new(xport.clone());
    let (_id, params) = spi_nor::probe(&mut flexspi).ok()?;

    let mut target = Target::new("i.MXRT1060", device_id, 0, xport.clone(), Box::new(ImxrtDriver::new()));
    target.add_ram(RAM_BASE, RAM_SIZE_BYTES);
    target.add_flash(FlashRegion::new(
        crate::flash::FlashGeometry {
            start: FLASH_BASE,
            length: params.capacity_bytes.max(8 * 1024 * 1024),
            block_size: params.sector_size,
            write_buffer_size: params.page_size,
            erased_byte_value: 0xFF,
        },
        Box::new(SpiNorAlgorithm::new(FlexSpiLutCache::new(xport.clone()), params)),
    ));

    Some(target)
}

pub const PROBE: ProbeFn = probe;
