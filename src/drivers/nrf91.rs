//! nRF91 Flash driver.
//!
//! The NVMC peripheral gates every Flash access through a single mode
//! register: `CONFIG` must hold `WRITE_ENABLE` before any word store lands
//! in Flash rather than faulting, and `ERASE_ENABLE` before a page erase
//! (a plain word write of `0xFFFF_FFFF` to the page's first address).
//! `READY` must be polled after every mode transition and every erase,
//! since both take unspecified (and much longer than a word-store) time.
//! No vendor IAP/ROM call is involved — NVMC is driven directly by MMIO,
//! with dispatch happening once per operation, never inside the busy-poll
//! itself.

use crate::error::Error;
use crate::flash::{FlashAlgorithm, FlashGeometry, FlashRegion};
use crate::registry::ProbeFn;
use crate::target::{Target, TargetDriver};
use crate::transport::Transport;
use alloc::boxed::Box;
use alloc::rc::Rc;
use core::cell::RefCell;

const FICR_INFO_PART: u32 = 0x00FF_0100;
const NVMC_BASE: u32 = 0x5003_9500;
const NVMC_READY: u32 = NVMC_BASE + 0x400;
const NVMC_CONFIG: u32 = NVMC_BASE + 0x504;

const CONFIG_READ_ONLY: u32 = 0x00;
const CONFIG_WRITE_ENABLE: u32 = 0x01;
const CONFIG_ERASE_ENABLE: u32 = 0x02;

const PAGE_SIZE: u32 = 4096;
const FLASH_SIZE_BYTES: u32 = 1024 * 1024;
const RAM_BASE: u32 = 0x2000_0000;
const RAM_SIZE_BYTES: u32 = 256 * 1024;

fn read32(xport: &mut dyn Transport, addr: u32) -> Result<u32, Error> {
    let mut buf = [0u8; 4];
    xport.mem_read(addr, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn write32(xport: &mut dyn Transport, addr: u32, value: u32) -> Result<(), Error> {
    xport.mem_write(addr, &value.to_le_bytes())
}

fn wait_ready(xport: &mut dyn Transport) -> Result<(), Error> {
    loop {
        if read32(xport, NVMC_READY)? & 1 != 0 {
            return Ok(());
        }
    }
}

fn set_config(xport: &mut dyn Transport, config: u32) -> Result<(), Error> {
    write32(xport, NVMC_CONFIG, config)?;
    wait_ready(xport)
}

pub struct Nrf91FlashAlgorithm;

impl FlashAlgorithm for Nrf91FlashAlgorithm {
    fn erase(&mut self, xport: &mut dyn Transport, _geo: &FlashGeometry, addr: u32, len: u32) -> Result<(), Error> {
        set_config(xport, CONFIG_ERASE_ENABLE)?;
        let mut offset = 0;
        while offset < len {
            write32(xport, addr + offset, 0xFFFF_FFFF)?;
            wait_ready(xport)?;
            offset += PAGE_SIZE;
        }
        set_config(xport, CONFIG_READ_ONLY)
    }

    fn write(&mut self, xport: &mut dyn Transport, _geo: &FlashGeometry, dest: u32, src: &[u8]) -> Result<(), Error> {
        set_config(xport, CONFIG_WRITE_ENABLE)?;
        for (i, word) in src.chunks(4).enumerate() {
            let mut padded = [0xFFu8; 4];
            padded[..word.len()].copy_from_slice(word);
            write32(xport, dest + i as u32 * 4, u32::from_le_bytes(padded))?;
            wait_ready(xport)?;
        }
        set_config(xport, CONFIG_READ_ONLY)
    }

    fn mass_erase(&mut self, xport: &mut dyn Transport, geo: &FlashGeometry) -> Result<(), Error> {
        self.erase(xport, geo, geo.start, geo.length)
    }
}

pub struct Nrf91Driver;

impl TargetDriver for Nrf91Driver {
    fn attach(&mut self, _xport: &mut dyn Transport) -> Result<(), Error> {
        Ok(())
    }

    fn detach(&mut self, _xport: &mut dyn Transport) {}

    fn mass_erase(&mut self, _xport: &mut dyn Transport) -> Result<(), Error> {
        Ok(())
    }
}

fn probe(xport: &Rc<RefCell<dyn Transport>>) -> Option<Target> {
    let part = {
        let mut x = xport.borrow_mut();
        read32(&mut *x, FICR_INFO_PART).ok()?
    };
    if part & 0xFFFF_0000 != 0x9160_0000 {
        return None;
    }

    let mut target = Target::new("nRF9160", part, 0, xport.clone(), Box::new(Nrf91Driver));
    target.add_ram(RAM_BASE, RAM_SIZE_BYTES);
    target.add_flash(FlashRegion::new(
        FlashGeometry {
            start: 0,
            length: FLASH_SIZE_BYTES,
            block_size: PAGE_SIZE,
            write_buffer_size: PAGE_SIZE,
            erased_byte_value: 0xFF,
        },
        Box::new(Nrf91FlashAlgorithm),
    ));

    Some(target)
}

pub const PROBE: ProbeFn = probe;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;

    fn make_xport(part: u32) -> Rc<RefCell<dyn Transport>> {
        let mut mock = MockTransport::new();
        mock.raw_write(FICR_INFO_PART, &part.to_le_bytes());
        mock.raw_write(NVMC_READY, &1u32.to_le_bytes());
        Rc::new(RefCell::new(mock))
    }

    #[test]
    fn probe_recognises_nrf9160() {
        let xport = make_xport(0x9160_0001);
        let target = probe(&xport).unwrap();
        assert_eq!(target.driver_name, "nRF9160");
    }

    #[test]
    fn probe_rejects_other_parts() {
        let xport = make_xport(0x5340_0001);
        assert!(probe(&xport).is_none());
    }

    #[test]
    fn erase_writes_all_ones_then_write_stores_words_under_correct_config_gating() {
        let xport = make_xport(0x9160_0001);
        let mut target = probe(&xport).unwrap();

        target.flash_erase(0, PAGE_SIZE).unwrap();
        let mut page = [0u8; PAGE_SIZE as usize];
        target.mem_read(&mut page, 0).unwrap();
        assert_eq!(&page[..], &[0xFF; PAGE_SIZE as usize][..]);

        target.flash_write(0, &[0xAA; PAGE_SIZE as usize]).unwrap();
        target.flash_complete().unwrap();
        target.mem_read(&mut page, 0).unwrap();
        assert_eq!(&page[..], &[0xAA; PAGE_SIZE as usize][..]);

        // CONFIG is left read-only after both operations.
        let mut cfg = [0u8; 4];
        target.mem_read(&mut cfg, NVMC_CONFIG).unwrap();
        assert_eq!(u32::from_le_bytes(cfg), CONFIG_READ_ONLY);
    }
}
