//! Target object: the in-memory handle the GDB front-end (external, out of
//! scope) drives through its whole lifetime — created when a probe
//! function claims the device, destroyed on disconnect, communication
//! failure, or at the start of a fresh scan.

use crate::error::Error;
use crate::flash::FlashRegion;
use crate::memmap::{self, RamRegion};
use crate::transport::{TargetOptions, Transport, WatchKind};
use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

/// Per-family implementation of the operations a `Target` can't do itself:
/// one concrete implementation per family.
pub trait TargetDriver {
    /// Claims the debug core: halt it, populate registers, snapshot any
    /// controller-config registers `detach` must restore.
    fn attach(&mut self, xport: &mut dyn Transport) -> Result<(), Error>;

    /// Releases the core, restoring registers/clocks attach touched.
    fn detach(&mut self, xport: &mut dyn Transport);

    /// Brackets a Flash session: disable/snapshot the MPU, gate clocks,
    /// take the controller lock. Default no-op for drivers whose Flash
    /// regions handle this themselves (e.g. pure SPI-NOR drivers).
    fn enter_flash_mode(&mut self, _xport: &mut dyn Transport) -> Result<(), Error> {
        Ok(())
    }

    /// Restores exactly the state observed at `enter_flash_mode`.
    fn exit_flash_mode(&mut self, _xport: &mut dyn Transport) -> Result<(), Error> {
        Ok(())
    }

    /// The fastest controller-native whole-device erase, if the family
    /// driver provides one distinct from region-level mass erase.
    fn mass_erase(&mut self, _xport: &mut dyn Transport) -> Result<(), Error> {
        Err(Error::Protocol("mass erase not supported by this driver"))
    }
}

/// A `monitor` sub-command.
#[derive(Clone, Copy)]
pub struct Command {
    pub name: &'static str,
    pub help: &'static str,
    pub handler: fn(&mut Target, &[&str]) -> Result<bool, Error>,
}

/// One attached device. Lifecycle: created when a probe claims it, owned
/// by the caller's target list (not modelled here — that's process-wide
/// state), destroyed on disconnect or comm failure.
pub struct Target {
    pub driver_name: &'static str,
    pub part_id: u32,
    pub cpuid: u32,
    pub options: TargetOptions,
    pub ram_regions: Vec<RamRegion>,
    pub flash_regions: Vec<FlashRegion>,
    pub commands: Vec<Command>,
    pub driver: Box<dyn TargetDriver>,
    transport: Rc<RefCell<dyn Transport>>,
    /// Sticky "this Flash session is poisoned" flag: set on the first
    /// mid-sequence error, cleared unconditionally by `flash_complete`.
    flash_error: bool,
    /// Set by `monitor irreversible enable`; gates guarded operations.
    pub irreversible_enabled: bool,
}

impl Target {
    pub fn new(
        driver_name: &'static str,
        part_id: u32,
        cpuid: u32,
        transport: Rc<RefCell<dyn Transport>>,
        driver: Box<dyn TargetDriver>,
    ) -> Self {
        Self {
            driver_name,
            part_id,
            cpuid,
            options: TargetOptions::empty(),
            ram_regions: Vec::new(),
            flash_regions: Vec::new(),
            commands: Vec::new(),
            driver,
            transport,
            flash_error: false,
            irreversible_enabled: false,
        }
    }

    pub fn add_ram(&mut self, start: u32, length: u32) {
        self.ram_regions.push(RamRegion { start, length });
    }

    pub fn add_flash(&mut self, region: FlashRegion) {
        self.flash_regions.push(region);
    }

    /// Registers `monitor` sub-commands for this target.
    pub fn add_commands(&mut self, commands: &[Command]) {
        self.commands.extend_from_slice(commands);
    }

    pub fn run_command(&mut self, name: &str, argv: &[&str]) -> Result<bool, Error> {
        let handler = self
            .commands
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.handler)
            .ok_or(Error::Protocol("no such monitor command"))?;
        handler(self, argv)
    }

    pub fn attach(&mut self) -> Result<(), Error> {
        let mut xport = self.transport.borrow_mut();
        self.driver.attach(&mut *xport)
    }

    pub fn detach(&mut self) {
        let mut xport = self.transport.borrow_mut();
        self.driver.detach(&mut *xport);
    }

    pub fn mem_read(&mut self, dst: &mut [u8], src_addr: u32) -> Result<(), Error> {
        self.transport.borrow_mut().mem_read(src_addr, dst)
    }

    pub fn mem_write(&mut self, dst_addr: u32, src: &[u8]) -> Result<(), Error> {
        self.transport.borrow_mut().mem_write(dst_addr, src)
    }

    pub fn regs_read(&mut self, dst: &mut [u32]) -> Result<(), Error> {
        for (i, slot) in dst.iter_mut().enumerate() {
            *slot = self.transport.borrow_mut().reg_read(i)?;
        }
        Ok(())
    }

    pub fn regs_write(&mut self, src: &[u32]) -> Result<(), Error> {
        for (i, value) in src.iter().enumerate() {
            self.transport.borrow_mut().reg_write(i, *value)?;
        }
        Ok(())
    }

    pub fn reset(&mut self) -> Result<(), Error> {
        self.transport.borrow_mut().reset()
    }

    pub fn halt_request(&mut self) -> Result<(), Error> {
        self.transport.borrow_mut().halt_request()
    }

    pub fn halt_wait(&mut self, timeout_ms: u32) -> Result<bool, Error> {
        self.transport.borrow_mut().halt_wait(timeout_ms)
    }

    pub fn halt_resume(&mut self, step: bool) -> Result<(), Error> {
        self.transport.borrow_mut().halt_resume(step)
    }

    pub fn set_hw_bp(&mut self, addr: u32) -> Result<(), Error> {
        self.transport.borrow_mut().set_hw_bp(addr)
    }

    pub fn clear_hw_bp(&mut self, addr: u32) -> Result<(), Error> {
        self.transport.borrow_mut().clear_hw_bp(addr)
    }

    pub fn set_hw_wp(&mut self, kind: WatchKind, addr: u32, len: u32) -> Result<(), Error> {
        self.transport.borrow_mut().set_hw_wp(kind, addr, len)
    }

    pub fn clear_hw_wp(&mut self, kind: WatchKind, addr: u32, len: u32) -> Result<(), Error> {
        self.transport.borrow_mut().clear_hw_wp(kind, addr, len)
    }

    pub fn check_hw_wp(&mut self) -> Result<Option<u32>, Error> {
        self.transport.borrow_mut().check_hw_wp()
    }

    pub fn check_error(&mut self) -> bool {
        self.transport.borrow_mut().check_error()
    }

    pub fn enter_flash_mode(&mut self) -> Result<(), Error> {
        let mut xport = self.transport.borrow_mut();
        self.driver.enter_flash_mode(&mut *xport)
    }

    pub fn exit_flash_mode(&mut self) -> Result<(), Error> {
        let mut xport = self.transport.borrow_mut();
        self.driver.exit_flash_mode(&mut *xport)
    }

    fn flash_region_index(&self, addr: u32) -> Option<usize> {
        self.flash_regions.iter().position(|r| r.contains(addr))
    }

    /// Locates the region containing `dest`; if the range straddles two
    /// regions, splits and recurses.
    pub fn flash_write(&mut self, dest: u32, src: &[u8]) -> Result<(), Error> {
        if self.flash_error {
            return Err(Error::Protocol("flash session poisoned by a prior error"));
        }
        let result = self.flash_write_inner(dest, src);
        if result.is_err() {
            self.flash_error = true;
        }
        result
    }

    fn flash_write_inner(&mut self, dest: u32, src: &[u8]) -> Result<(), Error> {
        let mut offset = 0usize;
        while offset < src.len() {
            let addr = dest + offset as u32;
            let idx = self
                .flash_region_index(addr)
                .ok_or(Error::Protocol("flash_write address is not in any flash region"))?;
            let region_end = self.flash_regions[idx].end();
            let chunk_len = core::cmp::min(src.len() - offset, (region_end - addr) as usize);
            let mut xport = self.transport.borrow_mut();
            self.flash_regions[idx].write_bytes(&mut *xport, addr, &src[offset..offset + chunk_len])?;
            offset += chunk_len;
        }
        Ok(())
    }

    /// Rounds `addr`/`addr+len` to `block_size` and invokes `erase` for
    /// the minimum sector run covering the result, region by region if
    /// the range straddles a boundary.
    pub fn flash_erase(&mut self, addr: u32, len: u32) -> Result<(), Error> {
        if self.flash_error {
            return Err(Error::Protocol("flash session poisoned by a prior error"));
        }
        let result = self.flash_erase_inner(addr, len);
        if result.is_err() {
            self.flash_error = true;
        }
        result
    }

    fn flash_erase_inner(&mut self, addr: u32, len: u32) -> Result<(), Error> {
        let mut cursor = addr;
        let end = addr + len;
        while cursor < end {
            let idx = self
                .flash_region_index(cursor)
                .ok_or(Error::Protocol("flash_erase address is not in any flash region"))?;
            let (region_end, block_size) = {
                let region = &self.flash_regions[idx];
                (region.end(), region.geometry.block_size)
            };
            let span_end = core::cmp::min(end, region_end);
            let aligned_start = (cursor / block_size) * block_size;
            let aligned_end = ((span_end + block_size - 1) / block_size) * block_size;
            let mut xport = self.transport.borrow_mut();
            self.flash_regions[idx].erase(&mut *xport, aligned_start, aligned_end - aligned_start)?;
            cursor = region_end;
        }
        Ok(())
    }

    /// Flushes any dirty buffer, runs each region's commit hook, clears
    /// `is_prepared`. Always attempted, even if a prior write poisoned
    /// the session, so the controller is left quiescent.
    pub fn flash_complete(&mut self) -> Result<(), Error> {
        let mut first_err = None;
        for region in &mut self.flash_regions {
            let mut xport = self.transport.borrow_mut();
            if let Err(e) = region.complete(&mut *xport) {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        self.flash_error = false;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn mass_erase(&mut self) -> Result<(), Error> {
        for region in &mut self.flash_regions {
            let mut xport = self.transport.borrow_mut();
            region.mass_erase(&mut *xport)?;
        }
        let mut xport = self.transport.borrow_mut();
        self.driver.mass_erase(&mut *xport)
    }

    /// The GDB target-XML document listing every region.
    pub fn memory_map_xml(&self) -> alloc::string::String {
        let flash: Vec<(u32, u32, u32)> = self
            .flash_regions
            .iter()
            .map(|r| (r.geometry.start, r.geometry.length, r.geometry.block_size))
            .collect();
        memmap::target_xml(&self.ram_regions, &flash)
    }
}
