use core::fmt::{self, Debug, Display};

mod private {
    #[derive(Debug)]
    pub enum Private {}
}

/// The error type used by this crate.
///
/// Every failure the core can observe collapses into one of these kinds
/// before it crosses the `Target`/`TargetDriver` boundary, and all of them
/// ultimately surface to the GDB front-end as a boolean result (the
/// front-end itself is out of scope here).
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A DAP transaction faulted (WAIT/FAULT/parity). This is the "sticky"
    /// kind: the transport latches it and `Target::check_error` clears it.
    Transport,

    /// The Flash controller's status register reported an error bit
    /// (PGAERR / SIZERR / WRPERR / PROGERR / ...).
    Controller,

    /// An IAP/ROM call returned a non-zero status, or the target halted
    /// somewhere other than the expected landing instruction.
    Iap(IapStatus),

    /// A malformed command: out-of-range address, a length that cannot be
    /// buffered to alignment, or similar caller error.
    Protocol(&'static str),

    /// No probe function recognised the attached device.
    Identification,

    /// The driver refused an irreversible operation because `irreversible
    /// enable` was not issued this session.
    GuardedOperationRefused,

    #[doc(hidden)]
    __NonExhaustive(private::Private),
}

/// Outcome of an IAP/ROM-call trampoline run.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IapStatus {
    /// The call completed and the target halted at the expected landing
    /// instruction, but reported a non-zero return code.
    ErrorCode(u32),
    /// The target halted somewhere other than the expected landing
    /// instruction. Reported regardless of the return-code field.
    InvalidCommand,
    /// `halt_wait` did not observe a halt before the caller's timeout.
    Timeout,
}

impl Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport => f.write_str("Error::Transport"),
            Error::Controller => f.write_str("Error::Controller"),
            Error::Iap(status) => write!(f, "Error::Iap({:?})", status),
            Error::Protocol(msg) => write!(f, "Error::Protocol({:?})", msg),
            Error::Identification => f.write_str("Error::Identification"),
            Error::GuardedOperationRefused => f.write_str("Error::GuardedOperationRefused"),
            Error::__NonExhaustive(_) => unreachable!(),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport => f.write_str("debug transport error (WAIT/FAULT/parity)"),
            Error::Controller => f.write_str("flash controller reported an error status"),
            Error::Iap(IapStatus::ErrorCode(code)) => {
                write!(f, "IAP call returned error code {:#x}", code)
            }
            Error::Iap(IapStatus::InvalidCommand) => {
                f.write_str("IAP invalid command: target did not halt at the landing instruction")
            }
            Error::Iap(IapStatus::Timeout) => f.write_str("IAP call timed out"),
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Error::Identification => f.write_str("no probe recognised the attached device"),
            Error::GuardedOperationRefused => {
                f.write_str("irreversible operation refused: `monitor irreversible enable` not issued")
            }
            Error::__NonExhaustive(_) => unreachable!(),
        }
    }
}
