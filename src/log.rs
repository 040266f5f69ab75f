//! Thin logging facade.
//!
//! Behind the `log` feature these forward to the `log` crate; otherwise
//! they expand to nothing so the firmware build doesn't pay for formatting
//! it never prints.

#![allow(unused_macros)]

#[cfg(feature = "log")]
macro_rules! trace {
    ($($arg:tt)*) => { ::log::trace!($($arg)*) };
}
#[cfg(not(feature = "log"))]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "log")]
macro_rules! info {
    ($($arg:tt)*) => { ::log::info!($($arg)*) };
}
#[cfg(not(feature = "log"))]
macro_rules! info {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "log")]
macro_rules! warn {
    ($($arg:tt)*) => { ::log::warn!($($arg)*) };
}
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "log")]
macro_rules! error {
    ($($arg:tt)*) => { ::log::error!($($arg)*) };
}
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)*) => {};
}
