//! SFDP (Serial Flash Discoverable Parameters) table decoder.
//!
//! Parses the subset of the JEDEC JESD216 Basic Flash Parameter Table this
//! crate needs to build a Flash region: page size, the primary erase
//! type's granularity and opcode, and flash density. On failure, callers
//! fall back to `NorParams::FALLBACK` when `parse` returns `None`.

use super::NorParams;

const SIGNATURE: [u8; 4] = *b"SFDP";

/// Parses a raw SFDP dump (as read starting at SFDP offset 0) into
/// `NorParams`. Returns `None` if the signature doesn't match or the
/// buffer is too short to contain the first parameter header and its
/// basic table.
pub fn parse(buf: &[u8]) -> Option<NorParams> {
    if buf.len() < 16 || buf[0..4] != SIGNATURE {
        return None;
    }

    // First (mandatory) parameter header, 8 bytes starting right after the
    // 8-byte SFDP header.
    let header = &buf.get(8..16)?;
    let table_len_dwords = header[3];
    let table_ptr = u32::from_le_bytes([header[4], header[5], header[6], 0]) as usize;

    let table_len = table_len_dwords as usize * 4;
    let table = buf.get(table_ptr..table_ptr + table_len)?;
    if table.len() < 44 {
        return None;
    }

    // DWORD2 (byte offset 4): flash memory density.
    let dword2 = u32::from_le_bytes(table[4..8].try_into().ok()?);
    let capacity_bits: u64 = if dword2 & 0x8000_0000 != 0 {
        1u64 << (dword2 & 0x7FFF_FFFF)
    } else {
        dword2 as u64 + 1
    };
    let capacity_bytes = (capacity_bits / 8).min(u32::MAX as u64) as u32;

    // DWORD8 (byte offset 28): erase type 1 size exponent + opcode.
    let erase_type1_exponent = table[28];
    let erase_type1_opcode = table[29];
    let sector_size = if erase_type1_exponent == 0 {
        NorParams::FALLBACK.sector_size
    } else {
        1u32 << erase_type1_exponent
    };

    // DWORD11 (byte offset 40): page size exponent in bits [4:7].
    let page_size_exponent = (table[40] >> 4) & 0xF;
    let page_size = if page_size_exponent == 0 {
        NorParams::FALLBACK.page_size
    } else {
        1u32 << page_size_exponent
    };

    Some(NorParams {
        page_size,
        sector_size,
        capacity_bytes,
        sector_erase_opcode: erase_type1_opcode,
    })
}
