//! System object
//!
//! The process-wide state shared by every CPU task, the timer task and
//! the signalling facility: main storage, the TOD clock, the interrupt
//! state with its condition variable, the signalling-facility busy flag
//! and the per-CPU register contexts. Constructed once and shared by
//! immutable reference; all mutation goes through the documented locks.
//!
//! Lock order, outermost to innermost:
//!
//! 1. the issuing CPU's register mutex
//! 2. the target CPU's register mutex (SIGP reset/prefix/store orders,
//!    serialized against each other by the busy flag)
//! 3. the interrupt lock (`ints`)
//! 4. the storage lock (inside `storage::Storage`)
//!
//! The signalling-facility lock and the TOD parameter lock are leaves:
//! they are held only for a test-and-set or a value computation, never
//! across another acquisition. Condition-variable waits happen on the
//! interrupt lock with no register mutex held.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Condvar, Mutex};

use log::{error, info};
use thiserror::Error;

use crate::clock::TodClock;
use crate::cpu::{Cpu, CpuState};
use crate::storage::{Storage, FRAME_SIZE};

/// Upper bound on configurable CPUs (the emergency-signal bitmaps and
/// SIGP originator fields are sized for this)
pub const MAX_CPUS: usize = 16;

/// System configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Main storage size in bytes (multiple of the 4 KiB frame size)
    pub mainsize: usize,
    /// Number of CPUs (1..=MAX_CPUS)
    pub numcpu: usize,
    /// TOD clock drag factor (integer >= 1; 1 = wall-clock speed)
    pub toddrag: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mainsize: 16 * 1024 * 1024,
            numcpu: 1,
            toddrag: 1,
        }
    }
}

/// Catastrophic startup conditions
#[derive(Debug, Error)]
pub enum InitError {
    /// Main storage could not be allocated
    #[error("cannot allocate {0} bytes of main storage")]
    StorageAllocation(usize),
    /// Configuration value out of range
    #[error("invalid configuration: {0}")]
    Configuration(&'static str),
}

/// Attention requests from device and operator tasks.
///
/// Devices do not reach into CPU latches directly; they send one of
/// these over the attention channel and the timer task turns it into
/// the corresponding latch under the interrupt lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attention {
    /// Operator interrupt key
    InterruptKey,
    /// Service signal with its 32-bit parameter
    ServiceSignal(u32),
}

/// Per-CPU interrupt-pending latches and the CPU state.
///
/// Guarded by the interrupt lock together with the system-wide latches;
/// `cpuint` is the aggregate OR of the five latches and is recomputed at
/// every mutation point.
#[derive(Debug, Clone)]
pub struct CpuPending {
    /// Aggregate: true iff any latch below is true
    pub cpuint: bool,
    /// External-call pending
    pub extcall: bool,
    /// CPU address of the external-call originator
    pub extccpu: u16,
    /// Emergency-signal pending (any source)
    pub emersig: bool,
    /// Per-source emergency-signal bitmap, indexed by originator address
    pub emercpu: Vec<bool>,
    /// Interval-timer interrupt pending
    pub itimer_pending: bool,
    /// Restart interrupt pending
    pub restart: bool,
    /// Store status when the stop completes
    pub storstat: bool,
    /// CPU state
    pub state: CpuState,
}

impl CpuPending {
    fn new(numcpu: usize) -> Self {
        Self {
            cpuint: false,
            extcall: false,
            extccpu: 0,
            emersig: false,
            emercpu: vec![false; numcpu],
            itimer_pending: false,
            restart: false,
            storstat: false,
            state: CpuState::Stopped,
        }
    }

    /// Recompute the aggregate from the individual latches. Call after
    /// every latch mutation.
    pub fn update_cpuint(&mut self) {
        self.cpuint = self.extcall
            || self.emersig
            || self.itimer_pending
            || self.restart
            || self.storstat;
    }

    /// Clear every latch (the reset orders)
    pub fn reset(&mut self) {
        self.extcall = false;
        self.extccpu = 0;
        self.emersig = false;
        self.emercpu.fill(false);
        self.itimer_pending = false;
        self.restart = false;
        self.storstat = false;
        self.update_cpuint();
    }
}

/// Everything the interrupt lock guards: the system-wide external
/// latches, the broadcast counters and the per-CPU pending blocks.
#[derive(Debug)]
pub struct IntState {
    /// Operator interrupt-key latch
    pub intkey: bool,
    /// Service-signal latch
    pub servsig: bool,
    /// Service-signal parameter
    pub servparm: u32,
    /// Broadcast request counter
    pub broadcast: u64,
    /// TLB-purge broadcast counter
    pub brdcst_ptlb: u64,
    /// ALB-purge broadcast counter
    pub brdcst_palb: u64,
    /// Per-CPU pending blocks, indexed by CPU address
    pub cpu: Vec<CpuPending>,
}

/// The system object
pub struct System {
    /// Main storage and storage keys
    pub storage: Storage,
    /// TOD clock
    pub tod: TodClock,
    /// Interrupt lock
    pub ints: Mutex<IntState>,
    /// Interrupt condition, broadcast whenever a latch is set
    pub intcond: Condvar,
    /// Signalling-facility busy flag; the holder is the only one that
    /// clears it
    pub sigpbusy: Mutex<bool>,
    /// Per-CPU register contexts, indexed by CPU address
    pub cpus: Vec<Mutex<Cpu>>,
    attn_tx: Sender<Attention>,
    attn_rx: Mutex<Receiver<Attention>>,
}

impl System {
    /// Build the system from a configuration.
    ///
    /// Failures here are the catastrophic startup conditions of the
    /// design: they are logged and returned, never unwound past the
    /// caller.
    pub fn new(config: Config) -> Result<Self, InitError> {
        if config.numcpu == 0 || config.numcpu > MAX_CPUS {
            return Err(InitError::Configuration("CPU count out of range"));
        }
        if config.mainsize == 0 || config.mainsize % FRAME_SIZE != 0 {
            return Err(InitError::Configuration(
                "main storage size must be a nonzero multiple of 4K",
            ));
        }
        if config.toddrag == 0 {
            return Err(InitError::Configuration("TOD drag factor must be >= 1"));
        }

        let storage = Storage::new(config.mainsize).map_err(|_| {
            error!("cannot allocate {} bytes of main storage", config.mainsize);
            InitError::StorageAllocation(config.mainsize)
        })?;

        let cpus = (0..config.numcpu)
            .map(|ad| Mutex::new(Cpu::new(ad as u16)))
            .collect();
        let pending = (0..config.numcpu)
            .map(|_| CpuPending::new(config.numcpu))
            .collect();
        let (attn_tx, attn_rx) = mpsc::channel();

        info!(
            "system initialized: mainsize={}K numcpu={} toddrag={}",
            config.mainsize / 1024,
            config.numcpu,
            config.toddrag
        );

        Ok(Self {
            storage,
            tod: TodClock::new(config.toddrag),
            ints: Mutex::new(IntState {
                intkey: false,
                servsig: false,
                servparm: 0,
                broadcast: 0,
                brdcst_ptlb: 0,
                brdcst_palb: 0,
                cpu: pending,
            }),
            intcond: Condvar::new(),
            sigpbusy: Mutex::new(false),
            cpus,
            attn_tx,
            attn_rx: Mutex::new(attn_rx),
        })
    }

    /// Number of configured CPUs
    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// A sender half of the attention channel for device tasks
    pub fn attention_sender(&self) -> Sender<Attention> {
        self.attn_tx.clone()
    }

    /// Drain queued attention requests into the interrupt state.
    /// Returns true when any latch was set. Caller holds the interrupt
    /// lock (the timer task calls this once per tick).
    pub fn drain_attention(&self, ints: &mut IntState) -> bool {
        let rx = self.attn_rx.lock().unwrap();
        let mut any = false;
        while let Ok(attn) = rx.try_recv() {
            match attn {
                Attention::InterruptKey => ints.intkey = true,
                Attention::ServiceSignal(parm) => {
                    ints.servsig = true;
                    ints.servparm = parm;
                }
            }
            any = true;
        }
        any
    }

    /// Latch the operator interrupt key and wake waiting CPUs
    pub fn raise_interrupt_key(&self) {
        let mut ints = self.ints.lock().unwrap();
        ints.intkey = true;
        self.intcond.notify_all();
        drop(ints);
    }

    /// Latch a service signal with its parameter and wake waiting CPUs
    pub fn raise_service_signal(&self, parm: u32) {
        let mut ints = self.ints.lock().unwrap();
        ints.servsig = true;
        ints.servparm = parm;
        self.intcond.notify_all();
        drop(ints);
    }

    /// Ask every CPU to purge its TLB at the next interruptible point
    pub fn issue_broadcast_ptlb(&self) {
        let mut ints = self.ints.lock().unwrap();
        ints.broadcast += 1;
        ints.brdcst_ptlb += 1;
        self.intcond.notify_all();
        drop(ints);
    }

    /// Ask every CPU to purge its ALB at the next interruptible point
    pub fn issue_broadcast_palb(&self) {
        let mut ints = self.ints.lock().unwrap();
        ints.broadcast += 1;
        ints.brdcst_palb += 1;
        self.intcond.notify_all();
        drop(ints);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_system() {
        let sys = System::new(Config {
            mainsize: 1024 * 1024,
            numcpu: 2,
            toddrag: 1,
        })
        .unwrap();
        assert_eq!(sys.num_cpus(), 2);
        assert_eq!(sys.storage.size(), 1024 * 1024);
        let ints = sys.ints.lock().unwrap();
        assert_eq!(ints.cpu.len(), 2);
        assert!(!ints.cpu[0].cpuint);
        assert_eq!(ints.cpu[1].state, CpuState::Stopped);
    }

    #[test]
    fn test_config_validation() {
        assert!(matches!(
            System::new(Config {
                numcpu: 0,
                ..Config::default()
            }),
            Err(InitError::Configuration(_))
        ));
        assert!(matches!(
            System::new(Config {
                numcpu: MAX_CPUS + 1,
                ..Config::default()
            }),
            Err(InitError::Configuration(_))
        ));
        assert!(matches!(
            System::new(Config {
                mainsize: 4097,
                ..Config::default()
            }),
            Err(InitError::Configuration(_))
        ));
        assert!(matches!(
            System::new(Config {
                toddrag: 0,
                ..Config::default()
            }),
            Err(InitError::Configuration(_))
        ));
    }

    #[test]
    fn test_cpuint_is_the_full_disjunction() {
        let mut pend = CpuPending::new(4);
        assert!(!pend.cpuint);

        let latches: [fn(&mut CpuPending); 5] = [
            |p| p.extcall = true,
            |p| p.emersig = true,
            |p| p.itimer_pending = true,
            |p| p.restart = true,
            |p| p.storstat = true,
        ];
        for set in latches {
            let mut p = CpuPending::new(4);
            set(&mut p);
            p.update_cpuint();
            assert!(p.cpuint);
            p.reset();
            assert!(!p.cpuint);
        }

        // Clearing one latch while another remains keeps the aggregate
        pend.extcall = true;
        pend.restart = true;
        pend.update_cpuint();
        pend.extcall = false;
        pend.update_cpuint();
        assert!(pend.cpuint);
        pend.restart = false;
        pend.update_cpuint();
        assert!(!pend.cpuint);
    }

    #[test]
    fn test_attention_channel_sets_latches() {
        let sys = System::new(Config {
            mainsize: 64 * 1024,
            numcpu: 1,
            toddrag: 1,
        })
        .unwrap();
        let tx = sys.attention_sender();
        tx.send(Attention::ServiceSignal(0x1234_5678)).unwrap();
        tx.send(Attention::InterruptKey).unwrap();

        let mut ints = sys.ints.lock().unwrap();
        assert!(sys.drain_attention(&mut ints));
        assert!(ints.intkey);
        assert!(ints.servsig);
        assert_eq!(ints.servparm, 0x1234_5678);
        // Nothing left queued
        assert!(!sys.drain_attention(&mut ints));
    }

    #[test]
    fn test_broadcast_counters() {
        let sys = System::new(Config {
            mainsize: 64 * 1024,
            numcpu: 1,
            toddrag: 1,
        })
        .unwrap();
        sys.issue_broadcast_ptlb();
        sys.issue_broadcast_ptlb();
        sys.issue_broadcast_palb();
        let ints = sys.ints.lock().unwrap();
        assert_eq!(ints.broadcast, 3);
        assert_eq!(ints.brdcst_ptlb, 2);
        assert_eq!(ints.brdcst_palb, 1);
    }
}
