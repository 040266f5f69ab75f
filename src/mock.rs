//! In-memory `Transport` fixture used by this crate's own tests.
//!
//! Backed by plain memory rather than a real debug adapter, so the core's
//! own tests can exercise the buffered Flash engine and the IAP trampoline
//! without real silicon.

use crate::error::Error;
use crate::transport::{Transport, WatchKind};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

/// A ROM/IAP routine the mock can "execute" on resume: given the target
/// state, mutate memory/registers as the real vendor ROM code would, then
/// report back through `regs[pc] = regs[lr]` so the trampoline's landing
/// check succeeds.
pub type RomFn = fn(&mut MockTransport);

/// An in-memory stand-in for the ADIv5 transport.
///
/// `resume()` does not model real instruction execution. Instead, if the
/// register file's PC matches a registered ROM function at the moment of
/// resume, that function runs synchronously and the core is reported
/// halted immediately afterwards — enough to exercise the generic IAP/ROM
/// trampoline's save/marshal/run/restore sequence end-to-end. Otherwise
/// resume just halts immediately, which is enough for simple run-control
/// tests.
pub struct MockTransport {
    mem: BTreeMap<u32, u8>,
    default_byte: u8,
    regs: [u32; 17],
    halted: bool,
    sticky_error: bool,
    hw_bps: Vec<u32>,
    hw_wps: Vec<(WatchKind, u32, u32)>,
    wp_hit: Option<u32>,
    rom_functions: Vec<(u32, RomFn)>,
    /// When set, `halt_wait` always reports "still running" so tests can
    /// exercise the IAP trampoline's timeout path.
    pub force_timeout: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            mem: BTreeMap::new(),
            default_byte: 0xFF,
            regs: [0; 17],
            halted: true,
            sticky_error: false,
            hw_bps: Vec::new(),
            hw_wps: Vec::new(),
            wp_hit: None,
            rom_functions: Vec::new(),
            force_timeout: false,
        }
    }

    pub fn with_default_byte(mut self, byte: u8) -> Self {
        self.default_byte = byte;
        self
    }

    /// Registers a ROM function at `entry`, used by IAP-trampoline tests.
    pub fn register_rom_fn(&mut self, entry: u32, f: RomFn) {
        self.rom_functions.push((entry, f));
    }

    pub fn raw_read(&self, addr: u32, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self
                .mem
                .get(&(addr.wrapping_add(i as u32)))
                .copied()
                .unwrap_or(self.default_byte);
        }
    }

    pub fn raw_write(&mut self, addr: u32, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            self.mem.insert(addr.wrapping_add(i as u32), *byte);
        }
    }

    pub fn fill(&mut self, addr: u32, len: u32, value: u8) {
        for i in 0..len {
            self.mem.insert(addr.wrapping_add(i), value);
        }
    }

    pub fn raise_sticky_error(&mut self) {
        self.sticky_error = true;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn mem_read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error> {
        if self.sticky_error {
            return Err(Error::Transport);
        }
        self.raw_read(addr, buf);
        Ok(())
    }

    fn mem_write(&mut self, addr: u32, src: &[u8]) -> Result<(), Error> {
        if self.sticky_error {
            return Err(Error::Transport);
        }
        self.raw_write(addr, src);
        Ok(())
    }

    fn reg_count(&self) -> usize {
        self.regs.len()
    }

    fn reg_read(&mut self, index: usize) -> Result<u32, Error> {
        self.regs.get(index).copied().ok_or(Error::Protocol("register index out of range"))
    }

    fn reg_write(&mut self, index: usize, value: u32) -> Result<(), Error> {
        *self
            .regs
            .get_mut(index)
            .ok_or(Error::Protocol("register index out of range"))? = value;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), Error> {
        self.halted = true;
        Ok(())
    }

    fn halt_request(&mut self) -> Result<(), Error> {
        self.halted = true;
        Ok(())
    }

    fn halt_wait(&mut self, _timeout_ms: u32) -> Result<bool, Error> {
        if self.force_timeout {
            return Ok(false);
        }
        Ok(self.halted)
    }

    fn halt_resume(&mut self, _step: bool) -> Result<(), Error> {
        self.halted = false;
        if self.force_timeout {
            return Ok(());
        }
        let pc = self.regs[crate::transport::reg::PC];
        if let Some((_, f)) = self.rom_functions.iter().find(|(entry, _)| *entry == pc).copied() {
            f(self);
        }
        self.halted = true;
        Ok(())
    }

    fn set_hw_bp(&mut self, addr: u32) -> Result<(), Error> {
        self.hw_bps.push(addr);
        Ok(())
    }

    fn clear_hw_bp(&mut self, addr: u32) -> Result<(), Error> {
        self.hw_bps.retain(|a| *a != addr);
        Ok(())
    }

    fn set_hw_wp(&mut self, kind: WatchKind, addr: u32, len: u32) -> Result<(), Error> {
        self.hw_wps.push((kind, addr, len));
        Ok(())
    }

    fn clear_hw_wp(&mut self, kind: WatchKind, addr: u32, len: u32) -> Result<(), Error> {
        self.hw_wps.retain(|w| *w != (kind, addr, len));
        Ok(())
    }

    fn check_hw_wp(&mut self) -> Result<Option<u32>, Error> {
        Ok(self.wp_hit.take())
    }

    fn check_error(&mut self) -> bool {
        let err = self.sticky_error;
        self.sticky_error = false;
        err
    }
}
