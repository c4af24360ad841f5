//! Signal-processor facility
//!
//! Inter-CPU orders carried over the signalling and response facility.
//! The facility has a single busy flag: the CPU that claims it is the
//! only one that releases it, and a contending CPU sees condition code
//! 2 rather than blocking.
//!
//! Condition codes: 0 = order accepted, 1 = status stored in the
//! issuer's R1, 2 = facility or target busy, 3 = target does not exist.

use log::debug;

use crate::cpu::{Cpu, CpuState, ProgramException};
use crate::external::store_status;
use crate::psa;
use crate::system::System;

/// SIGP order codes
pub mod orders {
    /// Sense the target's status
    pub const SENSE: u8 = 0x01;
    /// External call
    pub const EXTCALL: u8 = 0x02;
    /// Emergency signal
    pub const EMERGENCY: u8 = 0x03;
    /// Start
    pub const START: u8 = 0x04;
    /// Stop
    pub const STOP: u8 = 0x05;
    /// Restart
    pub const RESTART: u8 = 0x06;
    /// Stop and store status
    pub const STOPSTORE: u8 = 0x09;
    /// Initial CPU reset
    pub const INITRESET: u8 = 0x0B;
    /// CPU reset
    pub const RESET: u8 = 0x0C;
    /// Set prefix
    pub const SETPREFIX: u8 = 0x0D;
    /// Store status at address
    pub const STORE: u8 = 0x0E;
}

/// SIGP status word bits (stored into the issuer's R1 with CC 1)
pub mod status {
    /// Invalid order code
    pub const INVALID_ORDER: u32 = 0x0000_0002;
    /// Incorrect target state for the order
    pub const INCORRECT_STATE: u32 = 0x0000_0200;
    /// Invalid parameter value
    pub const INVALID_PARAMETER: u32 = 0x0000_0100;
    /// External call already pending in the target
    pub const EXTERNAL_CALL_PENDING: u32 = 0x0000_0080;
    /// Target is stopped
    pub const STOPPED: u32 = 0x0000_0040;
}

/// Signal a processor.
///
/// `r1` names the status/parameter register pair, `r3` the register
/// holding the target CPU address, and `eaddr` carries the order code
/// in its low byte. Returns the condition code; with CC 1 the status
/// word has been written to the issuer's R1.
///
/// The caller owns the issuing CPU's register context. For the orders
/// that touch the target's registers the target's mutex is acquired
/// here, before the interrupt lock, and a self-addressed order reuses
/// the issuer's context instead.
pub fn signal_processor(
    sys: &System,
    regs: &mut Cpu,
    r1: usize,
    r3: usize,
    eaddr: u32,
) -> Result<u8, ProgramException> {
    if regs.psw.prob {
        return Err(ProgramException::PrivilegedOperation);
    }

    // Target CPU address from R3 bits 16-31, order code from the
    // operand address bits 24-31, parameter from the odd register of
    // the R1 pair
    let cpad = (regs.gpr[r3] & 0xFFFF) as u16;
    let order = (eaddr & 0xFF) as u8;
    let parm = if r1 & 1 == 1 {
        regs.gpr[r1]
    } else {
        regs.gpr[r1 + 1]
    };

    if cpad as usize >= sys.num_cpus() {
        return Ok(3);
    }

    debug!(
        "SIGP from CPU {:04X} to CPU {:04X} order {:02X} parm {:08X}",
        regs.cpuad, cpad, order, parm
    );

    // Claim the signalling and response facility; busy means CC 2.
    // Only this invocation clears the flag again.
    {
        let mut busy = sys.sigpbusy.lock().unwrap();
        if *busy {
            return Ok(2);
        }
        *busy = true;
    }

    // Orders that operate on the target's register context take its
    // mutex now, ahead of the interrupt lock
    let self_target = cpad == regs.cpuad;
    let needs_target_regs = matches!(
        order,
        orders::INITRESET | orders::RESET | orders::SETPREFIX | orders::STORE
    );
    let mut target_guard = if needs_target_regs && !self_target {
        Some(sys.cpus[cpad as usize].lock().unwrap())
    } else {
        None
    };

    let mut ints = sys.ints.lock().unwrap();

    // Except for the reset orders, a target still finishing a previous
    // stop or restart makes the facility respond busy
    if order != orders::RESET && order != orders::INITRESET {
        let tp = &ints.cpu[cpad as usize];
        if tp.state == CpuState::Stopping || tp.restart {
            drop(ints);
            *sys.sigpbusy.lock().unwrap() = false;
            return Ok(2);
        }
    }

    let mut stat: u32 = 0;

    match order {
        orders::SENSE => {
            let tp = &ints.cpu[cpad as usize];
            if tp.extcall {
                stat |= status::EXTERNAL_CALL_PENDING;
            }
            if tp.state == CpuState::Stopped {
                stat |= status::STOPPED;
            }
        }

        orders::EXTCALL => {
            let tp = &mut ints.cpu[cpad as usize];
            // Only one external call can be pending per CPU
            if tp.extcall {
                stat |= status::EXTERNAL_CALL_PENDING;
            } else {
                tp.extcall = true;
                tp.extccpu = regs.cpuad;
                tp.update_cpuint();
            }
        }

        orders::EMERGENCY => {
            let tp = &mut ints.cpu[cpad as usize];
            tp.emercpu[regs.cpuad as usize] = true;
            tp.emersig = true;
            tp.update_cpuint();
        }

        orders::START => {
            ints.cpu[cpad as usize].state = CpuState::Started;
        }

        orders::STOP => {
            ints.cpu[cpad as usize].state = CpuState::Stopping;
        }

        orders::RESTART => {
            let tp = &mut ints.cpu[cpad as usize];
            tp.restart = true;
            tp.update_cpuint();
        }

        orders::STOPSTORE => {
            let tp = &mut ints.cpu[cpad as usize];
            tp.storstat = true;
            tp.state = CpuState::Stopping;
            tp.update_cpuint();
        }

        orders::INITRESET => {
            ints.cpu[cpad as usize].reset();
            ints.cpu[cpad as usize].state = CpuState::Stopped;
            match target_guard.as_mut() {
                Some(tregs) => tregs.initial_reset(),
                None => regs.initial_reset(),
            }
        }

        orders::RESET => {
            ints.cpu[cpad as usize].reset();
            ints.cpu[cpad as usize].state = CpuState::Stopped;
            match target_guard.as_mut() {
                Some(tregs) => tregs.reset(),
                None => regs.reset(),
            }
        }

        orders::SETPREFIX => {
            if ints.cpu[cpad as usize].state != CpuState::Stopped {
                stat |= status::INCORRECT_STATE;
            } else {
                // New prefix from parameter bits 1-19
                let abs = parm & 0x7FFF_F000;
                if (abs as usize) + psa::PSA_SIZE as usize > sys.storage.size() {
                    stat |= status::INVALID_PARAMETER;
                } else {
                    let tregs: &mut Cpu = match target_guard.as_mut() {
                        Some(guard) => guard,
                        None => &mut *regs,
                    };
                    tregs.pxr = abs;
                    tregs.purge_alb();
                    tregs.purge_tlb();
                }
            }
        }

        orders::STORE => {
            if ints.cpu[cpad as usize].state != CpuState::Stopped {
                stat |= status::INCORRECT_STATE;
            } else {
                // Status address from parameter bits 1-22
                let abs = parm & 0x7FFF_FE00;
                let tregs: &Cpu = match target_guard.as_deref() {
                    Some(tregs) => tregs,
                    None => &*regs,
                };
                if store_status(sys, tregs, abs).is_err() {
                    stat |= status::INVALID_PARAMETER;
                }
            }
        }

        _ => stat = status::INVALID_ORDER,
    }

    // Release the facility and wake any CPU waiting on a start, reset
    // or new latch
    *sys.sigpbusy.lock().unwrap() = false;
    sys.intcond.notify_all();
    drop(ints);
    drop(target_guard);

    if stat != 0 {
        regs.gpr[r1] = stat;
        Ok(1)
    } else {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::Config;

    fn test_system(numcpu: usize) -> System {
        System::new(Config {
            mainsize: 1024 * 1024,
            numcpu,
            toddrag: 1,
        })
        .unwrap()
    }

    /// Issue an order from CPU 0 with the target and parameter packed
    /// the way the instruction would
    fn issue(sys: &System, regs: &mut Cpu, target: u16, order: u8, parm: u32) -> u8 {
        regs.gpr[2] = target as u32;
        regs.gpr[5] = parm; // odd register of the (4,5) pair
        signal_processor(sys, regs, 4, 2, order as u32).unwrap()
    }

    #[test]
    fn test_nonexistent_target_is_cc3() {
        let sys = test_system(2);
        let mut regs = Cpu::new(0);
        assert_eq!(issue(&sys, &mut regs, 2, orders::SENSE, 0), 3);
        assert_eq!(issue(&sys, &mut regs, 0xFFFF, orders::START, 0), 3);
    }

    #[test]
    fn test_privileged_operation() {
        let sys = test_system(2);
        let mut regs = Cpu::new(0);
        regs.psw.prob = true;
        regs.gpr[2] = 1;
        assert_eq!(
            signal_processor(&sys, &mut regs, 4, 2, orders::SENSE as u32),
            Err(ProgramException::PrivilegedOperation)
        );
    }

    #[test]
    fn test_busy_facility_is_cc2() {
        let sys = test_system(2);
        let mut regs = Cpu::new(0);
        *sys.sigpbusy.lock().unwrap() = true;
        assert_eq!(issue(&sys, &mut regs, 1, orders::SENSE, 0), 2);
        // The contender did not clear the holder's flag
        assert!(*sys.sigpbusy.lock().unwrap());

        *sys.sigpbusy.lock().unwrap() = false;
        assert_eq!(issue(&sys, &mut regs, 1, orders::SENSE, 0), 1);
        assert_eq!(regs.gpr[4], status::STOPPED);
        assert!(!*sys.sigpbusy.lock().unwrap());
    }

    #[test]
    fn test_sense_reports_stopped_and_extcall() {
        let sys = test_system(2);
        let mut regs = Cpu::new(0);

        // Freshly built CPUs are stopped
        assert_eq!(issue(&sys, &mut regs, 1, orders::SENSE, 0), 1);
        assert_eq!(regs.gpr[4], status::STOPPED);

        // Started with an external call pending
        {
            let mut ints = sys.ints.lock().unwrap();
            ints.cpu[1].state = CpuState::Started;
            ints.cpu[1].extcall = true;
            ints.cpu[1].update_cpuint();
        }
        assert_eq!(issue(&sys, &mut regs, 1, orders::SENSE, 0), 1);
        assert_eq!(regs.gpr[4], status::EXTERNAL_CALL_PENDING);

        // Started and idle senses clean
        {
            let mut ints = sys.ints.lock().unwrap();
            ints.cpu[1].extcall = false;
            ints.cpu[1].update_cpuint();
        }
        assert_eq!(issue(&sys, &mut regs, 1, orders::SENSE, 0), 0);
    }

    #[test]
    fn test_external_call_latches_originator() {
        let sys = test_system(3);
        let mut regs = Cpu::new(2);
        {
            let mut ints = sys.ints.lock().unwrap();
            ints.cpu[0].state = CpuState::Started;
        }
        assert_eq!(issue(&sys, &mut regs, 0, orders::EXTCALL, 0), 0);
        {
            let ints = sys.ints.lock().unwrap();
            assert!(ints.cpu[0].extcall);
            assert_eq!(ints.cpu[0].extccpu, 2);
            assert!(ints.cpu[0].cpuint);
        }
        // A second call finds the first still pending
        assert_eq!(issue(&sys, &mut regs, 0, orders::EXTCALL, 0), 1);
        assert_eq!(regs.gpr[4], status::EXTERNAL_CALL_PENDING);
    }

    #[test]
    fn test_emergency_signal_records_source_bit() {
        let sys = test_system(4);
        let mut regs = Cpu::new(3);
        {
            let mut ints = sys.ints.lock().unwrap();
            ints.cpu[0].state = CpuState::Started;
        }
        assert_eq!(issue(&sys, &mut regs, 0, orders::EMERGENCY, 0), 0);
        let ints = sys.ints.lock().unwrap();
        assert!(ints.cpu[0].emersig);
        assert!(ints.cpu[0].emercpu[3]);
        assert!(!ints.cpu[0].emercpu[1]);
        assert!(ints.cpu[0].cpuint);
    }

    #[test]
    fn test_start_stop_restart_state_machine() {
        let sys = test_system(2);
        let mut regs = Cpu::new(0);

        assert_eq!(issue(&sys, &mut regs, 1, orders::START, 0), 0);
        assert_eq!(
            sys.ints.lock().unwrap().cpu[1].state,
            CpuState::Started
        );

        assert_eq!(issue(&sys, &mut regs, 1, orders::STOP, 0), 0);
        assert_eq!(
            sys.ints.lock().unwrap().cpu[1].state,
            CpuState::Stopping
        );

        // A stopping target makes non-reset orders respond busy
        assert_eq!(issue(&sys, &mut regs, 1, orders::START, 0), 2);

        // The stop completes (normally done by the CPU loop)
        sys.ints.lock().unwrap().cpu[1].state = CpuState::Stopped;
        assert_eq!(issue(&sys, &mut regs, 1, orders::RESTART, 0), 0);
        {
            let ints = sys.ints.lock().unwrap();
            assert!(ints.cpu[1].restart);
            assert!(ints.cpu[1].cpuint);
        }
        // Pending restart also answers busy
        assert_eq!(issue(&sys, &mut regs, 1, orders::SENSE, 0), 2);
    }

    #[test]
    fn test_stop_and_store_status() {
        let sys = test_system(2);
        let mut regs = Cpu::new(0);
        {
            let mut ints = sys.ints.lock().unwrap();
            ints.cpu[1].state = CpuState::Started;
        }
        assert_eq!(issue(&sys, &mut regs, 1, orders::STOPSTORE, 0), 0);
        let ints = sys.ints.lock().unwrap();
        assert!(ints.cpu[1].storstat);
        assert_eq!(ints.cpu[1].state, CpuState::Stopping);
        assert!(ints.cpu[1].cpuint);
    }

    #[test]
    fn test_reset_clears_latches_even_when_stopping() {
        let sys = test_system(2);
        let mut regs = Cpu::new(0);
        {
            let mut ints = sys.ints.lock().unwrap();
            let tp = &mut ints.cpu[1];
            tp.state = CpuState::Stopping;
            tp.extcall = true;
            tp.emercpu[0] = true;
            tp.emersig = true;
            tp.restart = true;
            tp.update_cpuint();
        }
        sys.cpus[1].lock().unwrap().gpr[7] = 99;

        // Reset orders are not refused by the stopping state
        assert_eq!(issue(&sys, &mut regs, 1, orders::RESET, 0), 0);
        {
            let ints = sys.ints.lock().unwrap();
            assert!(!ints.cpu[1].cpuint);
            assert!(!ints.cpu[1].extcall);
            assert!(!ints.cpu[1].emersig);
            assert!(!ints.cpu[1].restart);
            assert_eq!(ints.cpu[1].state, CpuState::Stopped);
        }
        // CPU reset preserves registers
        assert_eq!(sys.cpus[1].lock().unwrap().gpr[7], 99);

        sys.cpus[1].lock().unwrap().pxr = 0x4000;
        assert_eq!(issue(&sys, &mut regs, 1, orders::INITRESET, 0), 0);
        // Initial reset clears them
        let tregs = sys.cpus[1].lock().unwrap();
        assert_eq!(tregs.gpr[7], 0);
        assert_eq!(tregs.pxr, 0);
    }

    #[test]
    fn test_set_prefix_requires_stopped_target() {
        let sys = test_system(2);
        let mut regs = Cpu::new(0);
        {
            let mut ints = sys.ints.lock().unwrap();
            ints.cpu[1].state = CpuState::Started;
        }
        sys.cpus[1].lock().unwrap().pxr = 0x2000;

        assert_eq!(issue(&sys, &mut regs, 1, orders::SETPREFIX, 0x0000_1000), 1);
        assert_eq!(regs.gpr[4], status::INCORRECT_STATE);
        // No state change
        assert_eq!(sys.cpus[1].lock().unwrap().pxr, 0x2000);
    }

    #[test]
    fn test_set_prefix_validates_parameter() {
        let sys = test_system(2);
        let mut regs = Cpu::new(0);
        // Parameter beyond main storage
        assert_eq!(issue(&sys, &mut regs, 1, orders::SETPREFIX, 0x7FFF_F000), 1);
        assert_eq!(regs.gpr[4], status::INVALID_PARAMETER);
        assert_eq!(sys.cpus[1].lock().unwrap().pxr, 0);
    }

    #[test]
    fn test_set_prefix_assigns_and_purges() {
        let sys = test_system(2);
        let mut regs = Cpu::new(0);
        {
            let mut tregs = sys.cpus[1].lock().unwrap();
            tregs.tlb.mark(3);
            tregs.alb.mark(5);
        }
        // Bits outside 1-19 are ignored by the mask
        assert_eq!(issue(&sys, &mut regs, 1, orders::SETPREFIX, 0x0000_1FFF), 0);
        let tregs = sys.cpus[1].lock().unwrap();
        assert_eq!(tregs.pxr, 0x0000_1000);
        assert!(tregs.tlb.is_clear());
        assert!(tregs.alb.is_clear());
    }

    #[test]
    fn test_store_status_order() {
        let sys = test_system(2);
        let mut regs = Cpu::new(0);
        {
            let mut tregs = sys.cpus[1].lock().unwrap();
            tregs.gpr[0] = 0xDEAD_BEEF;
            tregs.psw.ecmode = true;
        }

        // Running target: incorrect state
        {
            let mut ints = sys.ints.lock().unwrap();
            ints.cpu[1].state = CpuState::Started;
        }
        assert_eq!(issue(&sys, &mut regs, 1, orders::STORE, 0x3000), 1);
        assert_eq!(regs.gpr[4], status::INCORRECT_STATE);

        // Stopped target, invalid address (bits 1-22, past storage end)
        {
            let mut ints = sys.ints.lock().unwrap();
            ints.cpu[1].state = CpuState::Stopped;
        }
        assert_eq!(issue(&sys, &mut regs, 1, orders::STORE, 0x7FFF_FE00), 1);
        assert_eq!(regs.gpr[4], status::INVALID_PARAMETER);

        // Stopped target, valid 512-aligned address
        assert_eq!(issue(&sys, &mut regs, 1, orders::STORE, 0x3000), 0);
        assert_eq!(
            sys.storage
                .fetch_fullword(0x3000 + psa::status::GPR)
                .unwrap(),
            0xDEAD_BEEF
        );
    }

    #[test]
    fn test_invalid_order_status() {
        let sys = test_system(2);
        let mut regs = Cpu::new(0);
        assert_eq!(issue(&sys, &mut regs, 1, 0x55, 0), 1);
        assert_eq!(regs.gpr[4], status::INVALID_ORDER);
    }

    #[test]
    fn test_parameter_register_selection() {
        let sys = test_system(2);
        let mut regs = Cpu::new(0);
        // With an odd r1 the parameter comes from r1 itself
        regs.gpr[2] = 1;
        regs.gpr[5] = 0x0000_2000;
        assert_eq!(
            signal_processor(&sys, &mut regs, 5, 2, orders::SETPREFIX as u32).unwrap(),
            0
        );
        assert_eq!(sys.cpus[1].lock().unwrap().pxr, 0x2000);
    }

    #[test]
    fn test_self_signal() {
        let sys = test_system(2);
        let mut regs = Cpu::new(0);
        // A CPU can sense itself (it is "stopped" in the pending block
        // even while this thread runs the instruction stream)
        assert_eq!(issue(&sys, &mut regs, 0, orders::SENSE, 0), 1);
        assert_eq!(regs.gpr[4], status::STOPPED);

        // Self-addressed initial reset goes through the issuer's context
        regs.gpr[9] = 1234;
        assert_eq!(issue(&sys, &mut regs, 0, orders::INITRESET, 0), 0);
        assert_eq!(regs.gpr[9], 0);
    }
}
