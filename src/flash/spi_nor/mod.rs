//! Generic SPI-NOR command encoding.
//!
//! Every family that talks to a SPI-NOR Flash through whatever controller
//! it has on board — direct SSI register pokes on RP2040, FlexSPI LUT
//! slots on i.MXRT, the Renesas SPI Multi-I/O controller — funnels down to
//! the same `(opcode, addr_mode, dummy_cycles, direction)` tuple, packed
//! into one 16-bit word so a single decoder suffices across families. This
//! generalises the classic 25-series opcode enum to carry addressing mode
//! and dummy-cycle count instead of assuming a fixed 3-byte-address,
//! zero-dummy-cycle transaction.

pub mod sfdp;

use crate::error::Error;

/// Addressing mode carried by a SPI-NOR command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddrMode {
    None,
    ThreeByte,
}

/// Data direction of the data phase following the command/address/dummy
/// phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Data flows from the chip to the host (e.g. READ, RDSR).
    In,
    /// Data flows from the host to the chip (e.g. PAGE PROGRAM).
    Out,
}

/// A SPI-NOR transaction, packed into 16 bits: low 8 bits opcode, 2 bits
/// addressing mode, 3 bits dummy-byte count, 1 bit data direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpiCommand {
    pub opcode: u8,
    pub addr_mode: AddrMode,
    pub dummy_bytes: u8,
    pub direction: Direction,
}

const ADDR_MODE_SHIFT: u32 = 8;
const DUMMY_SHIFT: u32 = 10;
const DIRECTION_BIT: u16 = 1 << 13;

impl SpiCommand {
    pub fn new(opcode: u8, addr_mode: AddrMode, dummy_bytes: u8, direction: Direction) -> Self {
        debug_assert!(dummy_bytes < 8, "dummy-byte count must fit in 3 bits");
        Self { opcode, addr_mode, dummy_bytes, direction }
    }

    /// Packs this command into the 16-bit word every layer above the
    /// opcode tables passes around.
    pub fn to_u16(self) -> u16 {
        let addr_bits: u16 = match self.addr_mode {
            AddrMode::None => 0b00,
            AddrMode::ThreeByte => 0b01,
        };
        let direction_bit = match self.direction {
            Direction::In => 0,
            Direction::Out => DIRECTION_BIT,
        };
        (self.opcode as u16)
            | (addr_bits << ADDR_MODE_SHIFT)
            | ((self.dummy_bytes as u16 & 0b111) << DUMMY_SHIFT)
            | direction_bit
    }

    /// Unpacks a 16-bit command word back into its fields.
    pub fn from_u16(word: u16) -> Self {
        let opcode = (word & 0xFF) as u8;
        let addr_mode = match (word >> ADDR_MODE_SHIFT) & 0b11 {
            0b01 => AddrMode::ThreeByte,
            _ => AddrMode::None,
        };
        let dummy_bytes = ((word >> DUMMY_SHIFT) & 0b111) as u8;
        let direction = if word & DIRECTION_BIT != 0 { Direction::Out } else { Direction::In };
        Self { opcode, addr_mode, dummy_bytes, direction }
    }
}

/// Well-known 25-series opcodes, shared across every family that drives
/// a SPI-NOR part.
pub mod opcode {
    pub const READ_JEDEC_ID: u8 = 0x9F;
    pub const READ_SFDP: u8 = 0x5A;
    pub const WRITE_ENABLE: u8 = 0x06;
    pub const READ_STATUS: u8 = 0x05;
    pub const READ: u8 = 0x03;
    pub const PAGE_PROGRAM: u8 = 0x02;
    pub const SECTOR_ERASE: u8 = 0x20;
    pub const CHIP_ERASE: u8 = 0xC7;
}

/// Three-function transport every SPI-capable driver implements:
/// `read`/`write` carry a data phase, `run_command` is for opcode-only or
/// opcode+address transactions like WRITE ENABLE or SECTOR ERASE.
pub trait SpiNorTransport {
    fn read(&mut self, cmd: SpiCommand, address: u32, buf: &mut [u8]) -> Result<(), Error>;
    fn write(&mut self, cmd: SpiCommand, address: u32, data: &[u8]) -> Result<(), Error>;
    fn run_command(&mut self, cmd: SpiCommand, address: Option<u32>) -> Result<(), Error>;
    /// Reads the 8-bit status register (opcode 0x05) without a full
    /// `read()` round trip, since every busy-poll in this module uses it.
    fn read_status(&mut self) -> Result<u8, Error>;
}

const STATUS_BUSY: u8 = 1 << 0;

/// JEDEC manufacturer + device identification, decoded from a
/// `READ_JEDEC_ID` response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Identification {
    pub mfr_code: u8,
    pub device_id: [u8; 2],
}

/// Derived SPI-NOR parameters, either decoded from the chip's SFDP table
/// or falling back to conservative defaults.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NorParams {
    pub page_size: u32,
    pub sector_size: u32,
    pub capacity_bytes: u32,
    pub sector_erase_opcode: u8,
}

impl NorParams {
    /// Conservative defaults: 256-byte page, 4 KiB sector, opcode 0x20.
    pub const FALLBACK: NorParams = NorParams {
        page_size: 256,
        sector_size: 4096,
        capacity_bytes: 0,
        sector_erase_opcode: opcode::SECTOR_ERASE,
    };
}

/// Probes a SPI-NOR chip: reads the JEDEC ID, then SFDP if present, and
/// returns the identification plus the parameters every region built on
/// top of this module needs (`write_buffer_size`, `block_size`, erase
/// opcode).
pub fn probe(xport: &mut dyn SpiNorTransport) -> Result<(Identification, NorParams), Error> {
    let mut id_buf = [0u8; 3];
    xport.read(
        SpiCommand::new(opcode::READ_JEDEC_ID, AddrMode::None, 0, Direction::In),
        0,
        &mut id_buf,
    )?;
    let id = Identification { mfr_code: id_buf[0], device_id: [id_buf[1], id_buf[2]] };

    let plausible = !(id.mfr_code == 0xFF && id.device_id == [0xFF, 0xFF])
        && !(id.mfr_code == 0x00 && id.device_id == [0x00, 0x00]);

    if !plausible {
        return Ok((id, NorParams::FALLBACK));
    }

    let mut sfdp_header = [0u8; 256];
    let sfdp_cmd = SpiCommand::new(opcode::READ_SFDP, AddrMode::ThreeByte, 1, Direction::In);
    let params = match xport.read(sfdp_cmd, 0, &mut sfdp_header) {
        Ok(()) => sfdp::parse(&sfdp_header).unwrap_or(NorParams::FALLBACK),
        Err(_) => NorParams::FALLBACK,
    };

    let capacity_bytes = if params.capacity_bytes == 0 {
        // Capacity from JEDEC-ID when SFDP didn't give us one: the 25-series
        // convention is `2 ^ device_id[1]` bytes.
        1u32.checked_shl(id.device_id[1] as u32).unwrap_or(0)
    } else {
        params.capacity_bytes
    };

    Ok((id, NorParams { capacity_bytes, ..params }))
}

/// Generic SPI-NOR `FlashAlgorithm`, driven by whatever `SpiNorTransport`
/// the family driver implements over its own controller: the classic
/// erase/write-enable/poll-busy shape, generalised to the command-word
/// encoding above.
pub struct SpiNorAlgorithm<T: SpiNorTransport> {
    xport: T,
    params: NorParams,
}

impl<T: SpiNorTransport> SpiNorAlgorithm<T> {
    pub fn new(xport: T, params: NorParams) -> Self {
        Self { xport, params }
    }

    fn write_enable(&mut self) -> Result<(), Error> {
        self.xport.run_command(
            SpiCommand::new(opcode::WRITE_ENABLE, AddrMode::None, 0, Direction::Out),
            None,
        )
    }

    fn wait_done(&mut self) -> Result<(), Error> {
        while self.xport.read_status()? & STATUS_BUSY != 0 {}
        Ok(())
    }

    pub fn erase_sectors(&mut self, addr: u32, len: u32) -> Result<(), Error> {
        let sector_size = self.params.sector_size;
        let mut offset = 0;
        while offset < len {
            self.write_enable()?;
            let cmd = SpiCommand::new(
                self.params.sector_erase_opcode,
                AddrMode::ThreeByte,
                0,
                Direction::Out,
            );
            self.xport.run_command(cmd, Some(addr + offset))?;
            self.wait_done()?;
            offset += sector_size;
        }
        Ok(())
    }

    pub fn program(&mut self, dest: u32, data: &[u8]) -> Result<(), Error> {
        let page_size = self.params.page_size;
        for (i, chunk) in data.chunks(page_size as usize).enumerate() {
            self.write_enable()?;
            let addr = dest + i as u32 * page_size;
            let cmd = SpiCommand::new(opcode::PAGE_PROGRAM, AddrMode::ThreeByte, 0, Direction::Out);
            self.xport.write(cmd, addr, chunk)?;
            self.wait_done()?;
        }
        Ok(())
    }

    pub fn chip_erase(&mut self) -> Result<(), Error> {
        self.write_enable()?;
        self.xport.run_command(
            SpiCommand::new(opcode::CHIP_ERASE, AddrMode::None, 0, Direction::Out),
            None,
        )?;
        self.wait_done()
    }
}

impl<T: SpiNorTransport> crate::flash::FlashAlgorithm for SpiNorAlgorithm<T> {
    fn erase(
        &mut self,
        _xport: &mut dyn crate::transport::Transport,
        _geo: &crate::flash::FlashGeometry,
        addr: u32,
        len: u32,
    ) -> Result<(), Error> {
        self.erase_sectors(addr, len)
    }

    fn write(
        &mut self,
        _xport: &mut dyn crate::transport::Transport,
        _geo: &crate::flash::FlashGeometry,
        dest: u32,
        src: &[u8],
    ) -> Result<(), Error> {
        self.program(dest, src)
    }

    fn mass_erase(
        &mut self,
        _xport: &mut dyn crate::transport::Transport,
        _geo: &crate::flash::FlashGeometry,
    ) -> Result<(), Error> {
        self.chip_erase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_word_round_trips() {
        let cmd = SpiCommand::new(0x9F, AddrMode::ThreeByte, 5, Direction::Out);
        let word = cmd.to_u16();
        assert_eq!(SpiCommand::from_u16(word), cmd);

        let cmd2 = SpiCommand::new(0x03, AddrMode::None, 0, Direction::In);
        assert_eq!(SpiCommand::from_u16(cmd2.to_u16()), cmd2);
    }
}
