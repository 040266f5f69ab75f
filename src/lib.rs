//! Target abstraction and on-chip Flash programming core for a JTAG/SWD
//! debug probe.
//!
//! This crate owns everything between a connected debug transport and the
//! GDB remote-serial-protocol front-end: identifying an attached device
//! (`registry`), the per-target object and its family driver contract
//! (`target`), the buffered Flash write engine and generic SPI-NOR/IAP
//! building blocks (`flash`), and the memory-map XML the front-end reads
//! back (`memmap`). The transport itself — ADIv5/SWD/JTAG wire timing — is
//! an external collaborator; this crate is written only against the
//! `Transport` trait.
//!
//! Runs on the probe's own microcontroller, so it is `#![no_std]` and uses
//! `alloc` for the handful of collections (`Vec`, `String`, `Rc<RefCell<_>>`)
//! the target/registry/flash layers need.

#![no_std]

extern crate alloc;

#[macro_use]
mod log;

pub mod drivers;
pub mod error;
pub mod flash;
pub mod memmap;
pub mod registry;
pub mod target;
pub mod transport;

mod utils;

#[cfg(test)]
mod mock;

pub use error::Error;
pub use registry::Registry;
pub use target::Target;
