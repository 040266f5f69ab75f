//! Generic IAP / ROM-call trampoline.
//!
//! Runs a function living in the target's on-chip ROM — vendor IAP code on
//! LPC17xx, a versioned ROM function table on LPC55xx, the RP2040
//! bootrom — without corrupting the caller's target state. Every IAP
//! call's ABI is an explicit `args: [u32; 4]` rather than a varargs call,
//! so it stays statically inspectable; that's `IapCall` below.

use crate::error::{Error, IapStatus};
use crate::transport::{reg, Transport};
use alloc::vec;
use alloc::vec::Vec;

/// Describes one IAP/ROM call: where to land, what to run, and the ABI the
/// family expects.
pub struct IapCall {
    /// Address of the ROM routine to call.
    pub entry: u32,
    /// Up to four argument words, marshalled into `arg_regs`.
    pub args: [u32; 4],
    /// Register indices (see `crate::transport::reg`) that receive `args`.
    /// A family ABI that takes fewer than four arguments in registers
    /// (the rest via a config block in RAM) simply ignores the unused
    /// slots.
    pub arg_regs: [usize; 4],
    /// Base address of a scratch RAM window used to save/restore state
    /// and to host the landing breakpoint.
    pub scratch_base: u32,
    /// Size of the scratch window that must be saved and restored.
    pub scratch_len: u32,
    /// Offset within the scratch window of the landing instruction.
    pub landing_offset: u32,
    /// The halt instruction placed at `scratch_base + landing_offset`
    /// (e.g. Thumb `BKPT #0` = `0xBE00`).
    pub landing_opcode: u16,
    /// Stack pointer to load before resuming (a known safe top-of-RAM).
    pub sp: u32,
    /// Status register ("xPSR") value to load before resuming — the
    /// family's nominal "ready to run" value (Thumb bit set, etc).
    pub xpsr: u32,
}

/// Result of a successful (non-timeout, landing-matched) IAP call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IapResult {
    pub return_code: u32,
    pub result_words: Vec<u32>,
}

/// Runs `call`, polling for halt up to `timeout_ms` (0 = no timeout),
/// calling `progress` once per poll iteration if the caller wants to
/// report liveness. `result_word_count` result words are read back from
/// `scratch_base + result_offset` before state is restored. Families whose
/// ABI returns results in a block pointed to by a register (LPC17xx's `R1`)
/// rather than at a fixed offset from the landing breakpoint place that
/// block elsewhere in the scratch window and pass its offset here; the two
/// offsets only coincide for the simpler single-region layouts.
///
/// On any outcome — success, error code, invalid landing, or timeout —
/// the target's full register file and the scratch RAM window are
/// restored to their pre-call values.
pub fn run_iap_call(
    xport: &mut dyn Transport,
    call: &IapCall,
    timeout_ms: u32,
    result_offset: u32,
    result_word_count: usize,
    mut progress: impl FnMut(u32),
) -> Result<IapResult, Error> {
    let reg_count = xport.reg_count();
    let mut saved_regs = vec![0u32; reg_count];
    for (i, slot) in saved_regs.iter_mut().enumerate() {
        *slot = xport.reg_read(i)?;
    }

    let mut saved_ram = vec![0u8; call.scratch_len as usize];
    xport.mem_read(call.scratch_base, &mut saved_ram)?;

    let restore = |xport: &mut dyn Transport| -> Result<(), Error> {
        xport.mem_write(call.scratch_base, &saved_ram)?;
        for (i, value) in saved_regs.iter().enumerate() {
            xport.reg_write(i, *value)?;
        }
        Ok(())
    };

    let landing_addr = call.scratch_base + call.landing_offset;
    let mut opcode_bytes = [0u8; 2];
    opcode_bytes.copy_from_slice(&call.landing_opcode.to_le_bytes());
    xport.mem_write(landing_addr, &opcode_bytes)?;

    for (&idx, &val) in call.arg_regs.iter().zip(call.args.iter()) {
        xport.reg_write(idx, val)?;
    }
    xport.reg_write(reg::SP, call.sp)?;
    // Thumb landing: bit 0 of LR set so the core returns in Thumb state.
    xport.reg_write(reg::LR, landing_addr | 1)?;
    xport.reg_write(reg::PC, call.entry)?;
    xport.reg_write(reg::XPSR, call.xpsr)?;

    xport.halt_resume(false)?;

    let mut elapsed_ms: u32 = 0;
    let poll_interval_ms: u32 = 1;
    let halted = loop {
        match xport.halt_wait(poll_interval_ms) {
            Ok(true) => break true,
            Ok(false) => {}
            Err(e) => {
                // Transport errors during the wait propagate directly;
                // state cannot be trusted to be restorable, but we try.
                let _ = restore(xport);
                return Err(e);
            }
        }
        progress(elapsed_ms);
        elapsed_ms = elapsed_ms.saturating_add(poll_interval_ms);
        if timeout_ms != 0 && elapsed_ms >= timeout_ms {
            break false;
        }
    };

    if !halted {
        xport.halt_request()?;
        let _ = xport.halt_wait(timeout_ms.max(1));
        restore(xport)?;
        return Err(Error::Iap(IapStatus::Timeout));
    }

    let halted_pc = xport.reg_read(reg::PC)?;
    // Accept either the raw landing address or the Thumb-bit-set LR value
    // we loaded, since some cores report the breakpoint PC without the
    // Thumb bit.
    let landing_matched = halted_pc == landing_addr || halted_pc == (landing_addr & !1);

    if !landing_matched {
        restore(xport)?;
        return Err(Error::Iap(IapStatus::InvalidCommand));
    }

    let return_code = xport.reg_read(reg::R0)?;

    let mut result_words = vec![0u32; result_word_count];
    if result_word_count > 0 {
        let mut buf = vec![0u8; result_word_count * 4];
        xport.mem_read(call.scratch_base + result_offset, &mut buf)?;
        for (i, word) in result_words.iter_mut().enumerate() {
            *word = u32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
        }
    }

    restore(xport)?;

    if return_code != 0 {
        return Err(Error::Iap(IapStatus::ErrorCode(return_code)));
    }

    Ok(IapResult { return_code, result_words })
}
