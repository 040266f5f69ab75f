//! Family drivers. Each module owns one family's `TargetDriver`/
//! `FlashAlgorithm` pair and a `PROBE` function; `ALL_PROBES` lists them in
//! the order `Registry::with_builtin_drivers` tries them.
//!
//! Scan order here matters only where two families could otherwise answer
//! the same identification bytes (`ch32f1` must run before a hypothetical
//! bare STM32F103-only probe would, though today it's the only F103-shaped
//! driver in the list); everywhere else it's source order with no further
//! significance.

pub mod ch32f1;
pub mod imxrt;
pub mod lpc17xx;
pub mod lpc55xx;
pub mod nrf91;
pub mod renesas_rz;
pub mod rp2040;
pub mod samd;
pub mod stm32_l0l1g0c0;

use crate::registry::ProbeFn;

pub const ALL_PROBES: [ProbeFn; 9] = [
    ch32f1::PROBE,
    stm32_l0l1g0c0::PROBE,
    lpc17xx::PROBE,
    lpc55xx::PROBE,
    nrf91::PROBE,
    rp2040::PROBE,
    imxrt::PROBE,
    renesas_rz::PROBE,
    samd::PROBE,
];
