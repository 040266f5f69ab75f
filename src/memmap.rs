//! Per-target memory map.
//!
//! Two independent, append-only lists: RAM regions and Flash regions.
//! Deliberately no merging and no ordering guarantee — order of addition
//! is not semantically significant.

use alloc::format;
use alloc::string::String;

/// A contiguous RAM range. Immutable after `add_ram`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RamRegion {
    pub start: u32,
    pub length: u32,
}

impl RamRegion {
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr < self.start.wrapping_add(self.length)
    }
}

/// Serialises `ram` and the geometry of `flash` into a GDB target-XML
/// `<memory-map>` document, as returned by `qXfer:memory-map:read`.
///
/// `flash` is passed as `(start, length, block_size)` triples rather than
/// full `FlashRegion`s so this module does not need to depend on
/// `crate::flash`, keeping it self-contained.
pub fn target_xml(ram: &[RamRegion], flash: &[(u32, u32, u32)]) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\"?>\n<!DOCTYPE memory-map PUBLIC \"+//IDN gnu.org//DTD GDB Memory Map V1.0//EN\" \"http://sourceware.org/gdb/gdb-memory-map.dtd\">\n<memory-map>\n",
    );

    for r in ram {
        xml.push_str(&format!(
            "  <memory type=\"ram\" start=\"{:#010x}\" length=\"{:#010x}\"/>\n",
            r.start, r.length
        ));
    }

    for (start, length, block_size) in flash {
        xml.push_str(&format!(
            "  <memory type=\"flash\" start=\"{:#010x}\" length=\"{:#010x}\">\n    <property name=\"blocksize\">{}</property>\n  </memory>\n",
            start, length, block_size
        ));
    }

    xml.push_str("</memory-map>\n");
    xml
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_region_contains() {
        let r = RamRegion { start: 0x2000_0000, length: 0x1000 };
        assert!(r.contains(0x2000_0000));
        assert!(r.contains(0x2000_0fff));
        assert!(!r.contains(0x2000_1000));
    }

    #[test]
    fn xml_lists_every_region_without_merging() {
        let ram = [RamRegion { start: 0x2000_0000, length: 0x1000 }];
        let flash = [(0x0800_0000, 0x0002_0000, 0x800), (0x0802_0000, 0x0002_0000, 0x800)];
        let xml = target_xml(&ram, &flash);
        assert_eq!(xml.matches("<memory type=\"ram\"").count(), 1);
        assert_eq!(xml.matches("<memory type=\"flash\"").count(), 2);
        assert!(xml.contains("0x08000000"));
        assert!(xml.contains("0x08020000"));
    }
}
