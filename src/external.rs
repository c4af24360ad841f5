//! External interrupt dispatcher and store-status
//!
//! The dispatcher selects the highest-priority pending external
//! condition, stores the source-specific PSA fields, clears the latch it
//! honours and swaps the PSW through the PSA. Only one interrupt is
//! taken per call; the rest stay pending for subsequent calls.
//!
//! Priority order and interruption codes:
//!
//! | Priority | Source            | Code   |
//! |----------|-------------------|--------|
//! | 1        | Interrupt key     | 0x0040 |
//! | 2        | Emergency signal  | 0x1201 |
//! | 3        | External call     | 0x1202 |
//! | 4        | Clock comparator  | 0x1004 |
//! | 5        | CPU timer         | 0x1005 |
//! | 6        | Interval timer    | 0x0080 |
//! | 7        | Service signal    | 0x2401 |

use log::{info, warn};

use crate::cpu::{cr0, Cpu, CpuState, ProgramException};
use crate::psa;
use crate::storage::apply_prefixing;
use crate::system::{CpuPending, IntState, System};

/// External interruption codes
pub mod codes {
    /// Operator interrupt key
    pub const INTERRUPT_KEY: u16 = 0x0040;
    /// Interval timer
    pub const INTERVAL_TIMER: u16 = 0x0080;
    /// Clock comparator
    pub const CLOCK_COMPARATOR: u16 = 0x1004;
    /// CPU timer
    pub const CPU_TIMER: u16 = 0x1005;
    /// Emergency signal
    pub const EMERGENCY_SIGNAL: u16 = 0x1201;
    /// External call
    pub const EXTERNAL_CALL: u16 = 0x1202;
    /// Service signal
    pub const SERVICE_SIGNAL: u16 = 0x2401;
}

/// Swap the PSW through the PSA for an external interruption.
///
/// Stores the current PSW at PSA+24 and loads the new PSW from PSA+88.
/// A malformed new PSW stops the CPU with a diagnostic.
fn external_interrupt(
    sys: &System,
    pend: &mut CpuPending,
    regs: &mut Cpu,
    code: u16,
) -> Result<(), ProgramException> {
    sys.storage.set_reference_and_change(regs.pxr)?;

    regs.psw.intcode = code;
    sys.storage.store_doubleword(
        regs.pxr + psa::EXT_OLD,
        u64::from_be_bytes(regs.psw.store()),
    )?;

    if regs.psw.ecmode {
        sys.storage.store_halfword(regs.pxr + psa::EXT_CODE, code)?;
    }

    let new = sys
        .storage
        .fetch_doubleword(regs.pxr + psa::EXT_NEW)?
        .to_be_bytes();
    if regs.psw.load(new).is_err() {
        warn!(
            "CPU {:04X}: invalid external interrupt new PSW: {:02X}{:02X}{:02X}{:02X} {:02X}{:02X}{:02X}{:02X}",
            regs.cpuad, new[0], new[1], new[2], new[3], new[4], new[5], new[6], new[7]
        );
        pend.state = CpuState::Stopped;
    }
    Ok(())
}

/// True when some external condition is both pending and enabled by its
/// CR0 subclass mask. The PSW external mask is the caller's business.
pub fn pending_interrupt(sys: &System, ints: &IntState, regs: &Cpu) -> bool {
    let pend = &ints.cpu[regs.cpuad as usize];
    (ints.intkey && regs.cr[0] & cr0::XM_INTKEY != 0)
        || (pend.emersig && regs.cr[0] & cr0::XM_EMERSIG != 0)
        || (pend.extcall && regs.cr[0] & cr0::XM_EXTCALL != 0)
        || (sys.tod.value() > regs.clkc && regs.cr[0] & cr0::XM_CLKC != 0)
        || ((regs.ptimer as i64) < 0 && regs.cr[0] & cr0::XM_PTIMER != 0)
        || (pend.itimer_pending && regs.cr[0] & cr0::XM_ITIMER != 0)
        || (ints.servsig && regs.cr[0] & cr0::XM_SERVSIG != 0)
}

/// Perform an external interrupt if one is pending.
///
/// Takes the first condition in priority order whose source is pending
/// and whose CR0 subclass mask is on, and returns whether an interrupt
/// was taken.
///
/// The caller must hold the interrupt lock and must not call this when
/// the PSW external mask is off.
pub fn perform_external_interrupt(
    sys: &System,
    ints: &mut IntState,
    regs: &mut Cpu,
) -> Result<bool, ProgramException> {
    let ad = regs.cpuad as usize;

    // Interrupt key
    if ints.intkey && regs.cr[0] & cr0::XM_INTKEY != 0 {
        info!("external interrupt: interrupt key");
        ints.intkey = false;
        external_interrupt(sys, &mut ints.cpu[ad], regs, codes::INTERRUPT_KEY)?;
        return Ok(true);
    }

    // Emergency signal: report the lowest originator address first
    if ints.cpu[ad].emersig && regs.cr[0] & cr0::XM_EMERSIG != 0 {
        let pend = &mut ints.cpu[ad];
        let src = match pend.emercpu.iter().position(|&b| b) {
            Some(src) => src,
            None => {
                // Aggregate was stale: repair it and take nothing
                pend.emersig = false;
                pend.update_cpuint();
                return Ok(false);
            }
        };
        info!("external interrupt: emergency signal from CPU {}", src);
        pend.emercpu[src] = false;
        pend.emersig = pend.emercpu.iter().any(|&b| b);
        pend.update_cpuint();
        sys.storage
            .store_halfword(regs.pxr + psa::EXT_CPAD, src as u16)?;
        external_interrupt(sys, pend, regs, codes::EMERGENCY_SIGNAL)?;
        return Ok(true);
    }

    // External call
    if ints.cpu[ad].extcall && regs.cr[0] & cr0::XM_EXTCALL != 0 {
        let pend = &mut ints.cpu[ad];
        pend.extcall = false;
        pend.update_cpuint();
        sys.storage
            .store_halfword(regs.pxr + psa::EXT_CPAD, pend.extccpu)?;
        external_interrupt(sys, pend, regs, codes::EXTERNAL_CALL)?;
        return Ok(true);
    }

    // Clock comparator
    if sys.tod.value() > regs.clkc && regs.cr[0] & cr0::XM_CLKC != 0 {
        external_interrupt(sys, &mut ints.cpu[ad], regs, codes::CLOCK_COMPARATOR)?;
        return Ok(true);
    }

    // CPU timer gone negative
    if (regs.ptimer as i64) < 0 && regs.cr[0] & cr0::XM_PTIMER != 0 {
        external_interrupt(sys, &mut ints.cpu[ad], regs, codes::CPU_TIMER)?;
        return Ok(true);
    }

    // Interval timer
    if ints.cpu[ad].itimer_pending && regs.cr[0] & cr0::XM_ITIMER != 0 {
        let pend = &mut ints.cpu[ad];
        pend.itimer_pending = false;
        pend.update_cpuint();
        external_interrupt(sys, pend, regs, codes::INTERVAL_TIMER)?;
        return Ok(true);
    }

    // Service signal
    if ints.servsig && regs.cr[0] & cr0::XM_SERVSIG != 0 {
        // A parameter with the low three bits zero is a storage address
        // and gets prefixed
        let mut parm = ints.servparm;
        if parm & 0x0000_0007 == 0 {
            parm = apply_prefixing(parm, regs.pxr);
        }
        sys.storage.store_fullword(regs.pxr + psa::EXT_PARM, parm)?;
        ints.servsig = false;
        external_interrupt(sys, &mut ints.cpu[ad], regs, codes::SERVICE_SIGNAL)?;
        return Ok(true);
    }

    Ok(false)
}

/// Store the CPU status block at an absolute address.
///
/// Writes the 512-byte block layout (timer, comparator, PSW, prefix and
/// the four register files) used by SIGP stop-and-store and
/// store-status.
pub fn store_status(sys: &System, regs: &Cpu, aaddr: u32) -> Result<(), ProgramException> {
    if (aaddr as usize)
        .checked_add(psa::status::BLOCK_SIZE as usize)
        .map_or(true, |end| end > sys.storage.size())
    {
        return Err(ProgramException::Addressing);
    }

    let stor = &sys.storage;
    stor.store_doubleword(aaddr + psa::status::PTIMER, regs.ptimer)?;
    stor.store_doubleword(aaddr + psa::status::CLKC, regs.clkc << 8)?;
    stor.store_doubleword(
        aaddr + psa::status::PSW,
        u64::from_be_bytes(regs.psw.store()),
    )?;
    stor.store_fullword(aaddr + psa::status::PREFIX, regs.pxr)?;
    for (i, &ar) in regs.ar.iter().enumerate() {
        stor.store_fullword(aaddr + psa::status::AR + 4 * i as u32, ar)?;
    }
    for (i, &fpr) in regs.fpr.iter().enumerate() {
        stor.store_fullword(aaddr + psa::status::FPR + 4 * i as u32, fpr)?;
    }
    for (i, &gpr) in regs.gpr.iter().enumerate() {
        stor.store_fullword(aaddr + psa::status::GPR + 4 * i as u32, gpr)?;
    }
    for (i, &cr) in regs.cr.iter().enumerate() {
        stor.store_fullword(aaddr + psa::status::CR + 4 * i as u32, cr)?;
    }

    info!(
        "CPU {} status stored at absolute location {:08X}",
        regs.cpuad, aaddr
    );
    Ok(())
}
