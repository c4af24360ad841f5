//! ESA/390 Emulator CPU Core
//!
//! This crate provides the processor engine of an ESA/390 mainframe
//! emulator: per-CPU execution contexts, the external interrupt and
//! signalling machinery, the wall-clock-driven timer service, and the
//! instruction-level services that cooperate with them. Device
//! handlers, the channel subsystem and the control panel live outside
//! and talk to this core through the attention channel and the
//! program/external interrupt contracts.
//!
//! # Architecture
//!
//! The core is organized into several modules:
//! - `storage`: main storage, storage keys, prefixing
//! - `psa`: the bit-exact prefixed-storage-area layout
//! - `cpu`: per-CPU register context, PSW, the execution loop
//! - `clock`: TOD clock and the timer task
//! - `external`: external interrupt dispatcher and store-status
//! - `sigp`: the signal-processor facility
//! - `cmpsc`, `sort`: the compression and sort-assist instructions
//! - `system`: the shared system object and its locks
//!
//! # Threads and locks
//!
//! One thread per CPU plus one timer thread share the [`System`]
//! object. The interrupt lock guards every interrupt-pending latch in
//! the configuration; CPUs blocked in the wait state sleep on its
//! condition variable and are woken by the timer task, SIGP orders and
//! device attention. See `system` for the full lock order.

pub mod clock;
pub mod cmpsc;
pub mod cpu;
pub mod external;
pub mod psa;
pub mod sigp;
pub mod sort;
pub mod storage;
pub mod system;


pub use cpu::{Cpu, CpuState, ProgramException, Psw};
pub use system::{Attention, Config, InitError, System};
