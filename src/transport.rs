//! The debug transport contract (external collaborator).
//!
//! This crate does not implement ADIv5/SWD/JTAG wire timing — that is the
//! platform layer's job. What the core needs is an abstraction over
//! 32-bit memory read/write to an address space, whole register-file I/O,
//! halt/resume/reset, and a sticky comm-error flag the core clears
//! explicitly. Every family driver and the buffered Flash engine is
//! written against this trait, never against a concrete ADIv5
//! implementation.

use crate::error::Error;
use bitflags::bitflags;

bitflags! {
    /// Per-target options bitset.
    #[derive(Default)]
    pub struct TargetOptions: u32 {
        /// Keep nRST deasserted across `reset()`; some targets lose their
        /// debug connection if the reset pin is ever driven.
        const INHIBIT_NRST = 1 << 0;
        /// Connect with SRST asserted, modelled per-target here rather
        /// than as process-wide state.
        const CONNECT_SRST = 1 << 1;
    }
}

/// Hardware watchpoint kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchKind {
    Read,
    Write,
    Access,
}

/// Canonical ARM Cortex-M core register indices, used by IAP trampolines
/// and family drivers to address `reg_read`/`reg_write`. Targets with a
/// different register file layout (e.g. a family without a banked LR) may
/// still use a superset of these indices; `reg_count` reports how many are
/// actually valid for the attached core.
pub mod reg {
    pub const R0: usize = 0;
    pub const R1: usize = 1;
    pub const R2: usize = 2;
    pub const R3: usize = 3;
    pub const R4: usize = 4;
    pub const SP: usize = 13;
    pub const LR: usize = 14;
    pub const PC: usize = 15;
    pub const XPSR: usize = 16;
}

/// The debug transport: 32-bit memory load/store, register-file access,
/// and run control, as consumed by `Target` and every family driver.
///
/// Implementations are expected to be "stateless on errors": a failed
/// transaction does not leave the transport wedged, it only raises the
/// sticky comm-error flag that `check_error` consumes.
pub trait Transport {
    /// Reads `buf.len()` bytes from the target's address space starting at
    /// `addr`. Sets the sticky error flag and returns `Err` on failure.
    fn mem_read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error>;

    /// Writes `src` to the target's address space starting at `addr`.
    fn mem_write(&mut self, addr: u32, src: &[u8]) -> Result<(), Error>;

    /// Number of general-purpose + status registers in the target's
    /// register file (used to size the GDB register-XML and the IAP
    /// save/restore window).
    fn reg_count(&self) -> usize;

    /// Reads one register by index (see the `reg` module for canonical
    /// ARM Cortex-M indices).
    fn reg_read(&mut self, index: usize) -> Result<u32, Error>;

    /// Writes one register by index.
    fn reg_write(&mut self, index: usize, value: u32) -> Result<(), Error>;

    /// Issues a target reset. Honours `TargetOptions::INHIBIT_NRST` if the
    /// implementation tracks it.
    fn reset(&mut self) -> Result<(), Error>;

    /// Requests the core halt (does not wait for it).
    fn halt_request(&mut self) -> Result<(), Error>;

    /// Polls for a halted core. Returns `Ok(true)` once halted, `Ok(false)`
    /// if `timeout_ms` elapses first. A `timeout_ms` of `0` means poll
    /// indefinitely unless the transport reports a sticky error.
    fn halt_wait(&mut self, timeout_ms: u32) -> Result<bool, Error>;

    /// Resumes the halted core. `step` requests single-instruction step
    /// instead of free-run.
    fn halt_resume(&mut self, step: bool) -> Result<(), Error>;

    fn set_hw_bp(&mut self, addr: u32) -> Result<(), Error>;
    fn clear_hw_bp(&mut self, addr: u32) -> Result<(), Error>;
    fn set_hw_wp(&mut self, kind: WatchKind, addr: u32, len: u32) -> Result<(), Error>;
    fn clear_hw_wp(&mut self, kind: WatchKind, addr: u32, len: u32) -> Result<(), Error>;

    /// Returns the address of a watchpoint that fired since the last call,
    /// if any.
    fn check_hw_wp(&mut self) -> Result<Option<u32>, Error>;

    /// Consumes and clears the transport's sticky comm-error flag.
    fn check_error(&mut self) -> bool;
}

pub mod swd_bitbang;
