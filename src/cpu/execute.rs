//! Per-CPU execution loop
//!
//! Each CPU runs on its own thread. One loop iteration processes, in
//! order: broadcast purge requests, a pending restart, a stop in
//! progress, the stopped/wait states (blocking on the interrupt
//! condition), enabled external interrupts, and finally one unit of
//! instruction interpretation through the [`Dispatcher`] seam.
//!
//! Instruction interpretation itself lives outside this core; the
//! dispatcher is the hook the embedder supplies. A program exception it
//! returns is materialised here as the program-interrupt PSW swap.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};

use crate::cpu::{sysmask, Cpu, CpuState, ProgramException};
use crate::external::{pending_interrupt, perform_external_interrupt, store_status};
use crate::psa;
use crate::system::{CpuPending, IntState, System};

/// The instruction-interpretation seam.
///
/// `step` executes one unit of work for a started CPU with its register
/// context locked. Returning a program exception triggers the
/// program-interrupt PSW swap.
pub trait Dispatcher: Send {
    /// Execute one unit of work
    fn step(&mut self, sys: &System, regs: &mut Cpu) -> Result<(), ProgramException>;
}

/// Dispatcher for configurations with no instruction stream to run:
/// the CPU drops straight into the wait state and idles until an
/// interrupt gives it a new PSW.
pub struct IdleDispatcher;

impl Dispatcher for IdleDispatcher {
    fn step(&mut self, _sys: &System, regs: &mut Cpu) -> Result<(), ProgramException> {
        regs.psw.wait = true;
        Ok(())
    }
}

/// Materialise a program interruption: PSW swap through PSA+40 and
/// PSA+104 with the interruption code.
///
/// A malformed new PSW stops the CPU. The storage error return covers
/// a PSA outside main storage, which the prefix validation rules out.
pub fn program_interrupt(
    sys: &System,
    regs: &mut Cpu,
    exc: ProgramException,
) -> Result<(), ProgramException> {
    let code = exc.code();
    debug!(
        "CPU {:04X}: program interruption {:04X} ({})",
        regs.cpuad, code, exc
    );

    sys.storage.set_reference_and_change(regs.pxr)?;
    regs.psw.intcode = code;
    sys.storage.store_doubleword(
        regs.pxr + psa::PGM_OLD,
        u64::from_be_bytes(regs.psw.store()),
    )?;
    if regs.psw.ecmode {
        sys.storage.store_halfword(regs.pxr + psa::PGM_CODE, code)?;
    }

    let new = sys
        .storage
        .fetch_doubleword(regs.pxr + psa::PGM_NEW)?
        .to_be_bytes();
    if regs.psw.load(new).is_err() {
        warn!(
            "CPU {:04X}: invalid program interrupt new PSW: {:02X}{:02X}{:02X}{:02X} {:02X}{:02X}{:02X}{:02X}",
            regs.cpuad, new[0], new[1], new[2], new[3], new[4], new[5], new[6], new[7]
        );
        let mut ints = sys.ints.lock().unwrap();
        ints.cpu[regs.cpuad as usize].state = CpuState::Stopped;
        drop(ints);
    }
    Ok(())
}

/// Honour a pending restart: PSW swap through PSA+8 and PSA+0, then
/// the started state. A malformed restart new PSW stops the CPU.
fn perform_restart(
    sys: &System,
    pend: &mut CpuPending,
    regs: &mut Cpu,
) -> Result<(), ProgramException> {
    sys.storage.set_reference_and_change(regs.pxr)?;
    sys.storage.store_doubleword(
        regs.pxr + psa::RESTART_OLD,
        u64::from_be_bytes(regs.psw.store()),
    )?;

    let new = sys
        .storage
        .fetch_doubleword(regs.pxr + psa::RESTART_NEW)?
        .to_be_bytes();
    if regs.psw.load(new).is_err() {
        warn!(
            "CPU {:04X}: invalid restart new PSW: {:02X}{:02X}{:02X}{:02X} {:02X}{:02X}{:02X}{:02X}",
            regs.cpuad, new[0], new[1], new[2], new[3], new[4], new[5], new[6], new[7]
        );
        pend.state = CpuState::Stopped;
    } else {
        pend.state = CpuState::Started;
    }
    Ok(())
}

/// Purge the translation buffers this CPU has not yet purged for the
/// outstanding broadcast requests.
fn perform_broadcast(ints: &IntState, regs: &mut Cpu) {
    if regs.bcast_ptlb != ints.brdcst_ptlb {
        regs.purge_tlb();
        regs.bcast_ptlb = ints.brdcst_ptlb;
    }
    if regs.bcast_palb != ints.brdcst_palb {
        regs.purge_alb();
        regs.bcast_palb = ints.brdcst_palb;
    }
    regs.bcast_seq = ints.broadcast;
}

/// The CPU thread body. Runs for the life of the process.
pub fn run_cpu<D: Dispatcher>(sys: &Arc<System>, cpuad: u16, dispatcher: &mut D) {
    info!("CPU {:04X} thread started", cpuad);
    let ad = cpuad as usize;

    loop {
        // Interrupt and state processing under the documented locks:
        // this CPU's registers, then the interrupt lock
        {
            let mut regs = sys.cpus[ad].lock().unwrap();
            let mut ints = sys.ints.lock().unwrap();

            perform_broadcast(&ints, &mut regs);

            if ints.cpu[ad].restart {
                let pend = &mut ints.cpu[ad];
                pend.restart = false;
                pend.update_cpuint();
                if let Err(exc) = perform_restart(sys, pend, &mut regs) {
                    warn!("CPU {:04X}: restart failed: {}", cpuad, exc);
                    pend.state = CpuState::Stopped;
                }
            }

            // A stop takes effect here, with its store-status if one
            // was ordered
            if ints.cpu[ad].state == CpuState::Stopping {
                let pend = &mut ints.cpu[ad];
                pend.state = CpuState::Stopped;
                if pend.storstat {
                    pend.storstat = false;
                    pend.update_cpuint();
                    if let Err(exc) = store_status(sys, &regs, regs.pxr) {
                        warn!("CPU {:04X}: store status failed: {}", cpuad, exc);
                    }
                }
            }

            if ints.cpu[ad].state == CpuState::Stopped {
                drop(regs);
                let _ints = sys.intcond.wait(ints).unwrap();
                continue;
            }

            if regs.psw.sysmask & sysmask::EXT != 0 && pending_interrupt(sys, &ints, &regs) {
                if let Err(exc) = perform_external_interrupt(sys, &mut ints, &mut regs) {
                    warn!("CPU {:04X}: external interrupt failed: {}", cpuad, exc);
                }
                continue;
            }

            if regs.psw.wait {
                drop(regs);
                let _ints = sys.intcond.wait(ints).unwrap();
                continue;
            }
        }

        // Execute one unit of work with only the register lock held
        let mut regs = sys.cpus[ad].lock().unwrap();
        match dispatcher.step(sys, &mut regs) {
            Ok(()) => regs.instcount += 1,
            Err(exc) => {
                if let Err(fault) = program_interrupt(sys, &mut regs, exc) {
                    warn!("CPU {:04X}: program interrupt failed: {}", cpuad, fault);
                }
            }
        }
        drop(regs);
    }
}

/// Start a CPU thread
pub fn spawn_cpu_thread<D>(
    sys: Arc<System>,
    cpuad: u16,
    mut dispatcher: D,
) -> io::Result<JoinHandle<()>>
where
    D: Dispatcher + 'static,
{
    thread::Builder::new()
        .name(format!("cpu{}", cpuad))
        .spawn(move || run_cpu(&sys, cpuad, &mut dispatcher))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::Config;

    fn test_system() -> System {
        System::new(Config {
            mainsize: 1024 * 1024,
            numcpu: 2,
            toddrag: 1,
        })
        .unwrap()
    }

    #[test]
    fn test_program_interrupt_swaps_psw() {
        let sys = test_system();
        sys.storage
            .store_doubleword(
                psa::PGM_NEW,
                u64::from_be_bytes([0x00, 0x08, 0, 0, 0, 0, 0x30, 0]),
            )
            .unwrap();
        let mut regs = Cpu::new(0);
        regs.psw.ecmode = true;
        regs.psw.ia = 0x5678;

        program_interrupt(&sys, &mut regs, ProgramException::Specification).unwrap();
        // Old PSW at PSA+40 carries the interrupted address
        let old = sys.storage.fetch_doubleword(psa::PGM_OLD).unwrap();
        assert_eq!(old & 0x7FFF_FFFF, 0x5678);
        // Interruption code at PSA+142
        assert_eq!(sys.storage.fetch_halfword(psa::PGM_CODE).unwrap(), 0x0006);
        assert_eq!(regs.psw.intcode, 0x0006);
        // New PSW loaded
        assert_eq!(regs.psw.ia, 0x3000);
    }

    #[test]
    fn test_program_interrupt_bad_new_psw_stops_cpu() {
        let sys = test_system();
        sys.storage
            .store_doubleword(psa::PGM_NEW, 0xFFFF_FFFF_FFFF_FFFF)
            .unwrap();
        let mut regs = Cpu::new(0);
        {
            let mut ints = sys.ints.lock().unwrap();
            ints.cpu[0].state = CpuState::Started;
        }
        program_interrupt(&sys, &mut regs, ProgramException::Data).unwrap();
        assert_eq!(sys.ints.lock().unwrap().cpu[0].state, CpuState::Stopped);
    }

    #[test]
    fn test_restart_swaps_psw_and_starts() {
        let sys = test_system();
        sys.storage
            .store_doubleword(
                psa::RESTART_NEW,
                u64::from_be_bytes([0x01, 0x08, 0, 0, 0, 0, 0x10, 0]),
            )
            .unwrap();
        let mut regs = Cpu::new(0);
        regs.psw.ecmode = true;
        regs.psw.wait = true;
        let ints = sys.ints.lock().unwrap();
        let mut pend = ints.cpu[0].clone();
        perform_restart(&sys, &mut pend, &mut regs).unwrap();
        assert_eq!(pend.state, CpuState::Started);
        assert_eq!(regs.psw.ia, 0x1000);
        assert!(!regs.psw.wait);
        // Old PSW (with the wait bit) saved at PSA+8
        let old = sys.storage.fetch_doubleword(psa::RESTART_OLD).unwrap();
        assert_ne!(old & 0x0002_0000_0000_0000, 0);
        drop(ints);
    }

    #[test]
    fn test_broadcast_purge_catches_up() {
        let sys = test_system();
        sys.issue_broadcast_ptlb();
        sys.issue_broadcast_palb();
        let mut regs = Cpu::new(0);
        regs.tlb.mark(1);
        regs.alb.mark(2);

        let ints = sys.ints.lock().unwrap();
        perform_broadcast(&ints, &mut regs);
        assert!(regs.tlb.is_clear());
        assert!(regs.alb.is_clear());
        assert_eq!(regs.bcast_ptlb, ints.brdcst_ptlb);
        assert_eq!(regs.bcast_seq, ints.broadcast);

        // A second pass with no new requests purges nothing
        regs.tlb.mark(3);
        perform_broadcast(&ints, &mut regs);
        assert!(!regs.tlb.is_clear());
    }
}
