//! CPU register context
//!
//! Per-processor architectural state for 31-bit ESA/390: general,
//! access, floating-point and control registers, the PSW, the prefix
//! register and the two per-CPU clocks. The interrupt-pending latches
//! live with the system object under the interrupt lock, not here
//! (see `system::CpuPending`).
//!
//! # Module Organization
//!
//! - `mod.rs`: register aggregate, PSW, program exceptions, resets
//! - `execute`: the per-CPU run loop and the program-interrupt PSW swap

use thiserror::Error;

use crate::storage::{apply_prefixing, Storage};

pub mod execute;

/// Program interruption conditions visible at the architectural boundary.
///
/// These are raised by the instruction services, materialised as a
/// program-interrupt PSW swap, and never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProgramException {
    /// Privileged-operation exception in problem state
    #[error("privileged-operation exception")]
    PrivilegedOperation,
    /// Protection exception (storage key mismatch)
    #[error("protection exception")]
    Protection,
    /// Addressing exception (reference outside main storage)
    #[error("addressing exception")]
    Addressing,
    /// Specification exception (malformed operand or PSW)
    #[error("specification exception")]
    Specification,
    /// Data exception (malformed data, e.g. a compression dictionary)
    #[error("data exception")]
    Data,
}

impl ProgramException {
    /// Architectural program-interruption code
    pub fn code(self) -> u16 {
        match self {
            ProgramException::PrivilegedOperation => 0x0002,
            ProgramException::Protection => 0x0004,
            ProgramException::Addressing => 0x0005,
            ProgramException::Specification => 0x0006,
            ProgramException::Data => 0x0007,
        }
    }
}

/// PSW system-mask bits (byte 0 of the stored PSW)
pub mod sysmask {
    /// Program-event-recording mask
    pub const PER: u8 = 0x40;
    /// DAT mode
    pub const DAT: u8 = 0x04;
    /// I/O interrupt mask
    pub const IO: u8 = 0x02;
    /// External interrupt mask
    pub const EXT: u8 = 0x01;
}

/// Control-register 0 external-interrupt subclass masks
pub mod cr0 {
    /// Malfunction alert
    pub const XM_MALERT: u32 = 0x0000_8000;
    /// Emergency signal
    pub const XM_EMERSIG: u32 = 0x0000_4000;
    /// External call
    pub const XM_EXTCALL: u32 = 0x0000_2000;
    /// TOD-clock sync check
    pub const XM_TODSYNC: u32 = 0x0000_1000;
    /// Clock comparator
    pub const XM_CLKC: u32 = 0x0000_0800;
    /// CPU timer
    pub const XM_PTIMER: u32 = 0x0000_0400;
    /// Service signal
    pub const XM_SERVSIG: u32 = 0x0000_0200;
    /// Interval timer
    pub const XM_ITIMER: u32 = 0x0000_0080;
    /// Interrupt key
    pub const XM_INTKEY: u32 = 0x0000_0040;
}

/// Program status word.
///
/// Stored and loaded in the 8-byte EC format:
///
/// | Byte | Content                                     |
/// |------|---------------------------------------------|
/// | 0    | system mask (PER, DAT, I/O, external)       |
/// | 1    | key, EC bit, machine-check, wait, problem   |
/// | 2    | address-space control, CC, program mask     |
/// | 3    | zero                                        |
/// | 4-7  | addressing mode bit and instruction address |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Psw {
    /// System mask
    pub sysmask: u8,
    /// PSW access key (0-15)
    pub pkey: u8,
    /// EC mode bit
    pub ecmode: bool,
    /// Machine-check mask
    pub mach: bool,
    /// Wait state
    pub wait: bool,
    /// Problem state
    pub prob: bool,
    /// Address-space control (2 bits)
    pub space: u8,
    /// Condition code (2 bits)
    pub cc: u8,
    /// Program mask (4 bits)
    pub progmask: u8,
    /// Addressing mode (true = 31-bit)
    pub amode: bool,
    /// Instruction address
    pub ia: u32,
    /// Interruption code of the last interruption taken
    pub intcode: u16,
}

impl Psw {
    /// Serialize into the 8-byte big-endian PSW format
    pub fn store(&self) -> [u8; 8] {
        let mut b = [0u8; 8];
        b[0] = self.sysmask;
        b[1] = (self.pkey << 4)
            | if self.ecmode { 0x08 } else { 0 }
            | if self.mach { 0x04 } else { 0 }
            | if self.wait { 0x02 } else { 0 }
            | if self.prob { 0x01 } else { 0 };
        b[2] = (self.space << 6) | (self.cc << 4) | (self.progmask & 0x0F);
        let ia = (self.ia & 0x7FFF_FFFF) | if self.amode { 0x8000_0000 } else { 0 };
        b[4..8].copy_from_slice(&ia.to_be_bytes());
        b
    }

    /// Load from the 8-byte PSW format, validating reserved bits.
    ///
    /// The interruption code is left untouched. On a malformed image (a
    /// reserved bit on, or the EC bit off in this architecture) the PSW
    /// is unchanged; what the condition means depends on the caller (a
    /// dispatch that loads a bad new PSW stops the CPU instead).
    pub fn load(&mut self, b: [u8; 8]) -> Result<(), ProgramException> {
        // Bits 0 and 2-4 of the system mask must be zero
        if b[0] & !(sysmask::PER | sysmask::DAT | sysmask::IO | sysmask::EXT) != 0 {
            return Err(ProgramException::Specification);
        }
        if b[1] & 0x08 == 0 || b[3] != 0 {
            return Err(ProgramException::Specification);
        }
        self.sysmask = b[0];
        self.pkey = b[1] >> 4;
        self.ecmode = true;
        self.mach = b[1] & 0x04 != 0;
        self.wait = b[1] & 0x02 != 0;
        self.prob = b[1] & 0x01 != 0;
        self.space = b[2] >> 6;
        self.cc = (b[2] >> 4) & 0x03;
        self.progmask = b[2] & 0x0F;
        let ia = u32::from_be_bytes([b[4], b[5], b[6], b[7]]);
        self.amode = ia & 0x8000_0000 != 0;
        self.ia = ia & 0x7FFF_FFFF;
        Ok(())
    }
}

/// CPU state as driven by the SIGP orders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuState {
    /// Executing instructions (or enabled-wait)
    Started,
    /// Stop accepted, takes effect at the next interruptible point
    Stopping,
    /// Stopped, waiting for a start, restart or reset
    #[default]
    Stopped,
}

/// Number of slots in a translation-buffer stand-in
const TRANSLATION_SLOTS: usize = 32;

/// Stand-in for an address-translation buffer (TLB or ALB).
///
/// Dynamic address translation itself lives outside this core, but the
/// invalidation contract does not: SIGP set-prefix and the broadcast
/// purge requests must leave the buffer empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct TranslationBuffer {
    valid: u32,
}

impl TranslationBuffer {
    /// Mark a slot occupied
    pub fn mark(&mut self, slot: usize) {
        self.valid |= 1 << (slot % TRANSLATION_SLOTS);
    }

    /// Invalidate every slot
    pub fn purge(&mut self) {
        self.valid = 0;
    }

    /// True when no slot is occupied
    pub fn is_clear(&self) -> bool {
        self.valid == 0
    }
}

/// Per-CPU register context.
///
/// A plain aggregate: cross-CPU writers (SIGP, the timer task) take the
/// owning mutex in `system::System` first.
pub struct Cpu {
    /// CPU address (0-based)
    pub cpuad: u16,
    /// General-purpose registers
    pub gpr: [u32; 16],
    /// Access registers
    pub ar: [u32; 16],
    /// Floating-point registers (64-bit pairs addressed as 32-bit halves)
    pub fpr: [u32; 8],
    /// Control registers
    pub cr: [u32; 16],
    /// Program status word
    pub psw: Psw,
    /// Prefix register
    pub pxr: u32,
    /// CPU timer (signed value, decremented by elapsed time)
    pub ptimer: u64,
    /// Clock comparator
    pub clkc: u64,
    /// Instructions executed
    pub instcount: u64,
    /// Instruction count at the last MIPS sample
    pub prevcount: u64,
    /// Instructions per millisecond over the last sample window
    pub mipsrate: u64,
    /// Translation-lookaside buffer
    pub tlb: TranslationBuffer,
    /// ART-lookaside buffer
    pub alb: TranslationBuffer,
    /// Broadcast sequence number last honoured
    pub bcast_seq: u64,
    /// TLB-purge broadcast sequence number last honoured
    pub bcast_ptlb: u64,
    /// ALB-purge broadcast sequence number last honoured
    pub bcast_palb: u64,
}

impl Cpu {
    /// Create a CPU context in the initial-reset state
    pub fn new(cpuad: u16) -> Self {
        Self {
            cpuad,
            gpr: [0; 16],
            ar: [0; 16],
            fpr: [0; 8],
            cr: [0; 16],
            psw: Psw::default(),
            pxr: 0,
            ptimer: 0,
            clkc: 0,
            instcount: 0,
            prevcount: 0,
            mipsrate: 0,
            tlb: TranslationBuffer::default(),
            alb: TranslationBuffer::default(),
            bcast_seq: 0,
            bcast_ptlb: 0,
            bcast_palb: 0,
        }
    }

    /// CPU reset: clears the interruption code and invalidates the
    /// translation buffers. Registers and the prefix survive. The
    /// companion latch clearing happens in `system::CpuPending::reset`.
    pub fn reset(&mut self) {
        self.psw.intcode = 0;
        self.purge_tlb();
        self.purge_alb();
    }

    /// Initial CPU reset: a CPU reset plus a cleared PSW, zeroed
    /// registers, prefix and clocks.
    pub fn initial_reset(&mut self) {
        self.reset();
        self.psw = Psw::default();
        self.gpr = [0; 16];
        self.ar = [0; 16];
        self.fpr = [0; 8];
        self.cr = [0; 16];
        self.pxr = 0;
        self.ptimer = 0;
        self.clkc = 0;
    }

    /// Invalidate the TLB
    pub fn purge_tlb(&mut self) {
        self.tlb.purge();
    }

    /// Invalidate the ALB
    pub fn purge_alb(&mut self) {
        self.alb.purge();
    }

    /// Effective-address mask for the current addressing mode
    pub fn amode_mask(&self) -> u32 {
        if self.psw.amode {
            0x7FFF_FFFF
        } else {
            0x00FF_FFFF
        }
    }

    /// Map an effective address to an absolute address (addressing-mode
    /// mask, then prefixing)
    pub fn effective_to_absolute(&self, addr: u32) -> u32 {
        apply_prefixing(addr & self.amode_mask(), self.pxr)
    }

    // ========== Operand access ==========
    //
    // Key-controlled storage access through the current PSW key, with
    // prefixing applied. The instruction services fetch and store
    // operands exclusively through these.

    /// Fetch an operand byte
    pub fn vfetch_byte(&self, storage: &Storage, addr: u32) -> Result<u8, ProgramException> {
        storage.fetch_byte_keyed(self.effective_to_absolute(addr), self.psw.pkey)
    }

    /// Fetch an operand halfword
    pub fn vfetch_halfword(&self, storage: &Storage, addr: u32) -> Result<u16, ProgramException> {
        storage.fetch_halfword_keyed(self.effective_to_absolute(addr), self.psw.pkey)
    }

    /// Fetch an operand fullword
    pub fn vfetch_fullword(&self, storage: &Storage, addr: u32) -> Result<u32, ProgramException> {
        storage.fetch_fullword_keyed(self.effective_to_absolute(addr), self.psw.pkey)
    }

    /// Fetch an operand doubleword
    pub fn vfetch_doubleword(&self, storage: &Storage, addr: u32) -> Result<u64, ProgramException> {
        storage.fetch_doubleword_keyed(self.effective_to_absolute(addr), self.psw.pkey)
    }

    /// Store an operand byte
    pub fn vstore_byte(
        &self,
        storage: &Storage,
        addr: u32,
        value: u8,
    ) -> Result<(), ProgramException> {
        storage.store_byte_keyed(self.effective_to_absolute(addr), self.psw.pkey, value)
    }

    /// Store an operand fullword
    pub fn vstore_fullword(
        &self,
        storage: &Storage,
        addr: u32,
        value: u32,
    ) -> Result<(), ProgramException> {
        storage.store_fullword_keyed(self.effective_to_absolute(addr), self.psw.pkey, value)
    }
}
