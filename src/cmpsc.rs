//! Compression call
//!
//! Dictionary-driven compression and expansion of byte strings into
//! variable-width index symbols (CDSS+1 bits wide, 9 to 13).
//!
//! The compression dictionary is addressed by GR1: a 256-entry alphabet
//! of 8-byte character entries, one per byte value, each optionally
//! pointing at child entries and sibling-descriptor chains that extend
//! the match. The expansion dictionary holds 8-byte expansion entries,
//! preceded entries chaining toward the first characters of the symbol.
//!
//! GR0 carries the operation flags (expand bit, symbol-translate bit,
//! CDSS, format-1 bit); GR1 carries the dictionary origin and the
//! compressed-data bit number (CBN); the R1 and R2 pairs carry the
//! destination and source address/length.
//!
//! Register state is kept consistent at every exit so the supervisor
//! can resume the operation after a partial completion.

use log::warn;

use crate::cpu::{Cpu, ProgramException};
use crate::system::System;

/// Model-dependent number of index symbols processed per call
pub const PROCESS_MAX: usize = 2048;

/// Sibling entries examined past this raise a data exception
const MAX_SIBLINGS: u32 = 260;

/// Longest byte string a single index symbol may represent
const MAX_SYMBOL_LENGTH: usize = 260;

// ========== GR0 / GR1 fields ==========

fn cdss(regs: &Cpu) -> u32 {
    (regs.gpr[0] >> 12) & 0x0F
}

/// Index-symbol width in bits
fn symbol_size(regs: &Cpu) -> u32 {
    cdss(regs) + 1
}

fn format1(regs: &Cpu) -> bool {
    regs.gpr[0] & 0x0000_0200 != 0
}

fn expand_operation(regs: &Cpu) -> bool {
    regs.gpr[0] & 0x0000_0100 != 0
}

fn translate_operation(regs: &Cpu) -> bool {
    regs.gpr[0] & 0x0001_0000 != 0
}

/// Dictionary origin: GR1 with the offset and CBN bits masked off
fn dictionary(regs: &Cpu) -> u32 {
    regs.gpr[1]
        & if regs.psw.amode {
            0x7FFF_F000
        } else {
            0x00FF_F000
        }
}

fn dictionary_size(regs: &Cpu) -> u32 {
    2048 << cdss(regs)
}

/// Compressed-data bit number: bit cursor into the current output byte
fn cbn(regs: &Cpu) -> u32 {
    regs.gpr[1] & 0x0000_0007
}

fn set_cbn(regs: &mut Cpu, cbn: u32) {
    regs.gpr[1] = (regs.gpr[1] & 0xFFFF_FFF8) | (cbn & 0x0000_0007);
}

// ========== Dictionary entry accessors ==========

/// Compression character entry: one 8-byte dictionary node.
///
/// Byte 0 holds the child count and the five examine bits; byte 1 the
/// additional-extension-character count (sharing its low bit with the
/// d bit that selects the 5- or 6-child layout) and the top of the
/// child pointer; byte 2 the rest of the child pointer; bytes 3-7 the
/// extension characters followed by the child characters.
#[derive(Debug, Clone, Copy)]
pub struct Cce(pub [u8; 8]);

impl Cce {
    /// Child count (0-7; 6 in the 6-child layout or 5 in the 5-child
    /// layout means the last position continues into siblings)
    pub fn cct(&self) -> u8 {
        self.0[0] >> 5
    }

    /// Layout selector: true selects the 5-child layout
    pub fn d(&self) -> bool {
        self.0[1] & 0x20 != 0
    }

    /// Additional-extension-character count
    pub fn act(&self) -> u8 {
        self.0[1] >> 5
    }

    /// Child pointer (dictionary entry index of the first child)
    pub fn cptr(&self) -> u16 {
        (((self.0[1] & 0x1F) as u16) << 8) | self.0[2] as u16
    }

    /// Extension character `i` (0-based, i < act)
    pub fn extension_char(&self, i: usize) -> u8 {
        self.0[3 + i]
    }

    /// Child character `i` (0-based, after the extension characters)
    pub fn child_char(&self, i: usize) -> u8 {
        self.0[3 + self.act() as usize + i]
    }
}

/// Format-0 sibling descriptor: a 3-bit count (0 meaning seven siblings
/// with more to follow), five examine bits, and the sibling characters
/// in bytes 1-7.
#[derive(Debug, Clone, Copy)]
pub struct Sd0(pub [u8; 8]);

impl Sd0 {
    /// Sibling count field
    pub fn sct(&self) -> u8 {
        self.0[0] >> 5
    }

    /// Sibling character `i` (0-based)
    pub fn sibling_char(&self, i: usize) -> u8 {
        self.0[1 + i]
    }
}

/// Format-1 sibling descriptor: 16 bytes, the second half fetched from
/// the expansion dictionary at the same offset. A 4-bit count (15
/// meaning fourteen siblings with more to follow), twelve examine bits,
/// and the sibling characters in bytes 2-15.
#[derive(Debug, Clone, Copy)]
pub struct Sd1(pub [u8; 16]);

impl Sd1 {
    /// Combine the compression-dictionary and expansion-dictionary
    /// halves
    pub fn new(lo: [u8; 8], hi: [u8; 8]) -> Self {
        let mut b = [0u8; 16];
        b[..8].copy_from_slice(&lo);
        b[8..].copy_from_slice(&hi);
        Self(b)
    }

    /// Sibling count field
    pub fn sct(&self) -> u8 {
        self.0[0] >> 4
    }

    /// Sibling character `i` (0-based)
    pub fn sibling_char(&self, i: usize) -> u8 {
        self.0[2 + i]
    }
}

/// Expansion character entry: partial-symbol length and offset for
/// preceded entries, complete-symbol length and the characters for
/// unpreceded ones.
#[derive(Debug, Clone, Copy)]
pub struct Ece(pub [u8; 8]);

impl Ece {
    /// Partial-symbol length (0 = unpreceded entry)
    pub fn psl(&self) -> u8 {
        self.0[0] >> 5
    }

    /// Complete-symbol length of an unpreceded entry
    pub fn csl(&self) -> u8 {
        self.0[0] & 0x07
    }

    /// Predecessor pointer of a preceded entry
    pub fn pptr(&self) -> u16 {
        (((self.0[0] & 0x1F) as u16) << 8) | self.0[1] as u16
    }

    /// Offset of the partial symbol within the expanded string
    pub fn ofst(&self) -> u8 {
        self.0[7]
    }

    fn byte(&self, i: usize) -> u8 {
        self.0[i]
    }
}

fn fetch_entry(sys: &System, regs: &Cpu, addr: u32) -> Result<[u8; 8], ProgramException> {
    regs.vfetch_doubleword(&sys.storage, addr)
        .map(u64::to_be_bytes)
}

// ========== Compression ==========

enum Step {
    Symbol(u16),
    EndOfSource,
    EndOfDestination,
}

struct ChildHit {
    /// Index symbol of the matched child entry
    symbol: u16,
    /// The matched entry, parent of the next walk
    entry: Cce,
    /// Source bytes the match consumed (child char + extensions)
    consumed: u32,
}

/// Compression call entry point.
///
/// R1 and R2 name even-odd register pairs (destination and source for
/// compression, reversed roles for expansion). Returns the condition
/// code: 0 = source exhausted, 1 = destination full, 3 = the
/// model-dependent work limit was reached first.
pub fn compression_call(
    sys: &System,
    regs: &mut Cpu,
    r1: usize,
    r2: usize,
) -> Result<u8, ProgramException> {
    let cdss = cdss(regs);
    if r1 & 1 != 0 || r2 & 1 != 0 || cdss == 0 || cdss > 5 {
        return Err(ProgramException::Specification);
    }

    if expand_operation(regs) {
        expand(sys, regs, r1, r2)
    } else if translate_operation(regs) {
        warn!("compression call: symbol translation is not implemented");
        Ok(regs.psw.cc)
    } else {
        compress(sys, regs, r1, r2)
    }
}

fn compress(sys: &System, regs: &mut Cpu, r1: usize, r2: usize) -> Result<u8, ProgramException> {
    let mut processed = 0;
    loop {
        match next_index_symbol(sys, regs, r1, r2)? {
            Step::EndOfSource => return Ok(0),
            Step::EndOfDestination => return Ok(1),
            Step::Symbol(symbol) => {
                put_index_symbol(sys, regs, r1, symbol)?;
                processed += 1;
                if processed >= PROCESS_MAX {
                    // Work limit; the last symbol may have finished the
                    // source, which still counts as completion
                    return Ok(if regs.gpr[r2 + 1] == 0 { 0 } else { 3 });
                }
            }
        }
    }
}

/// Find the longest dictionary match at the current source position.
///
/// The alphabet entry for the first byte always matches; children and
/// sibling chains extend it while the source keeps matching.
fn next_index_symbol(
    sys: &System,
    regs: &mut Cpu,
    r1: usize,
    r2: usize,
) -> Result<Step, ProgramException> {
    // Room in the destination for one more symbol?
    let needed = (cbn(regs) + symbol_size(regs) + 7) / 8;
    if needed > regs.gpr[r1 + 1] {
        return Ok(Step::EndOfDestination);
    }

    if regs.gpr[r2 + 1] == 0 {
        return Ok(Step::EndOfSource);
    }

    let dict = dictionary(regs);
    let ch = regs.vfetch_byte(&sys.storage, regs.gpr[r2])?;

    // The alphabet entry matches unconditionally
    regs.gpr[r2] = regs.gpr[r2].wrapping_add(1);
    regs.gpr[r2 + 1] -= 1;
    let mut symbol = ch as u16;
    let mut parent = Cce(fetch_entry(sys, regs, dict + ch as u32 * 8)?);

    loop {
        match search_child(sys, regs, r2, dict, &parent)? {
            Some(hit) => {
                regs.gpr[r2] = regs.gpr[r2].wrapping_add(hit.consumed);
                regs.gpr[r2 + 1] -= hit.consumed;
                symbol = hit.symbol;
                parent = hit.entry;
            }
            None => return Ok(Step::Symbol(symbol)),
        }
    }
}

fn search_child(
    sys: &System,
    regs: &Cpu,
    r2: usize,
    dict: u32,
    parent: &Cce,
) -> Result<Option<ChildHit>, ProgramException> {
    if let Some(hit) = search_character_entry(sys, regs, r2, dict, parent)? {
        return Ok(Some(hit));
    }
    search_siblings(sys, regs, r2, dict, parent)
}

/// Probe one child entry: the child character already matched; the
/// child's additional extension characters must match the following
/// source bytes. Nothing is consumed here; the caller commits.
fn try_child(
    sys: &System,
    regs: &Cpu,
    r2: usize,
    dict: u32,
    child_index: u32,
) -> Result<Option<ChildHit>, ProgramException> {
    let entry = Cce(fetch_entry(sys, regs, dict + child_index * 8)?);
    let act = entry.act() as u32;
    if act > 5 {
        return Err(ProgramException::Data);
    }
    // The child character plus its extensions must fit in the source
    if 1 + act > regs.gpr[r2 + 1] {
        return Ok(None);
    }
    for k in 0..act {
        let b = regs.vfetch_byte(&sys.storage, regs.gpr[r2].wrapping_add(1 + k))?;
        if b != entry.extension_char(k as usize) {
            return Ok(None);
        }
    }
    Ok(Some(ChildHit {
        symbol: child_index as u16,
        entry,
        consumed: 1 + act,
    }))
}

fn search_character_entry(
    sys: &System,
    regs: &Cpu,
    r2: usize,
    dict: u32,
    parent: &Cce,
) -> Result<Option<ChildHit>, ProgramException> {
    // No next byte means no extension can match
    if regs.gpr[r2 + 1] == 0 {
        return Ok(None);
    }
    let ch = regs.vfetch_byte(&sys.storage, regs.gpr[r2])?;

    let mut children = parent.cct();
    let d = parent.d();
    // The last position of a full entry is the sibling continuation
    if (d && children == 5) || (!d && children == 6) {
        children -= 1;
    }
    let act = parent.act() as usize;
    if 3 + act + children as usize > 8 {
        return Err(ProgramException::Data);
    }

    for i in 0..children as usize {
        if ch == parent.child_char(i) {
            if let Some(hit) = try_child(sys, regs, r2, dict, parent.cptr() as u32 + i as u32)? {
                return Ok(Some(hit));
            }
        }
    }
    Ok(None)
}

fn search_siblings(
    sys: &System,
    regs: &Cpu,
    r2: usize,
    dict: u32,
    parent: &Cce,
) -> Result<Option<ChildHit>, ProgramException> {
    let cct = parent.cct();
    let d = parent.d();
    if !((d && cct == 5) || (!d && cct == 6)) {
        return Ok(None);
    }

    let f1 = format1(regs);
    let dict_size = dictionary_size(regs);
    // The first descriptor follows the parent's child entries
    let mut sib_index = parent.cptr() as u32 + cct as u32;
    let mut examined: u32 = 0;
    let mut chars = [0u8; 14];

    loop {
        let sd_addr = dict + sib_index * 8;
        let (sct, more) = if f1 {
            let sd = Sd1::new(
                fetch_entry(sys, regs, sd_addr)?,
                fetch_entry(sys, regs, sd_addr + dict_size)?,
            );
            let mut sct = sd.sct() as u32;
            let more = sct == 15;
            if more {
                sct = 14;
            }
            for i in 0..sct as usize {
                chars[i] = sd.sibling_char(i);
            }
            (sct, more)
        } else {
            let sd = Sd0(fetch_entry(sys, regs, sd_addr)?);
            let mut sct = sd.sct() as u32;
            let more = sct == 0;
            if more {
                sct = 7;
            }
            for i in 0..sct as usize {
                chars[i] = sd.sibling_char(i);
            }
            (sct, more)
        };

        if regs.gpr[r2 + 1] == 0 {
            return Ok(None);
        }
        let ch = regs.vfetch_byte(&sys.storage, regs.gpr[r2])?;

        for i in 0..sct {
            examined += 1;
            if examined > MAX_SIBLINGS {
                return Err(ProgramException::Data);
            }
            if ch == chars[i as usize] {
                // Sibling entries follow their descriptor
                if let Some(hit) = try_child(sys, regs, r2, dict, sib_index + 1 + i)? {
                    return Ok(Some(hit));
                }
            }
        }

        if !more {
            return Ok(None);
        }
        // Skip the descriptor and the sibling entries it described
        sib_index += sct + 1;
    }
}

/// Pack one index symbol into the output stream at the current CBN and
/// advance the destination registers.
fn put_index_symbol(
    sys: &System,
    regs: &mut Cpu,
    r1: usize,
    symbol: u16,
) -> Result<(), ProgramException> {
    let size = symbol_size(regs);
    let total = cbn(regs) + size;
    let needed = (total + 7) / 8;
    let addr = regs.gpr[r1];

    let mut work: u32 = 0;
    for i in 0..needed {
        work = (work << 8) | regs.vfetch_byte(&sys.storage, addr.wrapping_add(i))? as u32;
    }
    let shift = needed * 8 - total;
    let mask = ((1u32 << size) - 1) << shift;
    work = (work & !mask) | (((symbol as u32) << shift) & mask);
    for i in 0..needed {
        let b = (work >> ((needed - 1 - i) * 8)) as u8;
        regs.vstore_byte(&sys.storage, addr.wrapping_add(i), b)?;
    }

    regs.gpr[r1] = regs.gpr[r1].wrapping_add(total / 8);
    regs.gpr[r1 + 1] -= total / 8;
    set_cbn(regs, total % 8);
    Ok(())
}

// ========== Expansion ==========

/// Read one index symbol from the source stream without committing the
/// source registers.
fn peek_index_symbol(sys: &System, regs: &Cpu, r2: usize) -> Result<u16, ProgramException> {
    let size = symbol_size(regs);
    let total = cbn(regs) + size;
    let needed = (total + 7) / 8;
    let addr = regs.gpr[r2];

    let mut work: u32 = 0;
    for i in 0..needed {
        work = (work << 8) | regs.vfetch_byte(&sys.storage, addr.wrapping_add(i))? as u32;
    }
    let shift = needed * 8 - total;
    Ok(((work >> shift) & ((1 << size) - 1)) as u16)
}

/// Expand one index symbol into its byte string.
///
/// Alphabet symbols expand to themselves. Other symbols walk their
/// preceded-entry chain, each entry placing its partial characters at
/// its recorded offset, until the unpreceded entry supplies the first
/// characters. A malformed chain (overlong, looping, or empty) is a
/// data exception.
fn expand_symbol(
    sys: &System,
    regs: &Cpu,
    dict: u32,
    symbol: u16,
) -> Result<([u8; MAX_SYMBOL_LENGTH], usize), ProgramException> {
    let mut buf = [0u8; MAX_SYMBOL_LENGTH];
    if symbol < 256 {
        buf[0] = symbol as u8;
        return Ok((buf, 1));
    }

    let first = Ece(fetch_entry(sys, regs, dict + symbol as u32 * 8)?);
    let total = if first.psl() == 0 {
        first.csl() as usize
    } else {
        first.ofst() as usize + first.psl() as usize
    };
    if total == 0 || total > MAX_SYMBOL_LENGTH {
        return Err(ProgramException::Data);
    }

    let mut ece = first;
    let mut depth = 0;
    loop {
        let psl = ece.psl() as usize;
        if psl == 0 {
            let csl = ece.csl() as usize;
            if csl == 0 {
                return Err(ProgramException::Data);
            }
            for k in 0..csl {
                buf[k] = ece.byte(1 + k);
            }
            break;
        }
        if psl > 5 {
            return Err(ProgramException::Data);
        }
        let ofst = ece.ofst() as usize;
        if ofst + psl > MAX_SYMBOL_LENGTH {
            return Err(ProgramException::Data);
        }
        for k in 0..psl {
            buf[ofst + k] = ece.byte(2 + k);
        }
        depth += 1;
        if depth > 127 {
            return Err(ProgramException::Data);
        }
        ece = Ece(fetch_entry(sys, regs, dict + ece.pptr() as u32 * 8)?);
    }

    Ok((buf, total))
}

fn expand(sys: &System, regs: &mut Cpu, r1: usize, r2: usize) -> Result<u8, ProgramException> {
    let size = symbol_size(regs);
    let dict = dictionary(regs);
    let mut processed = 0;

    loop {
        // Enough source bits for another symbol?
        let needed = (cbn(regs) + size + 7) / 8;
        if needed > regs.gpr[r2 + 1] {
            return Ok(0);
        }

        let symbol = peek_index_symbol(sys, regs, r2)?;
        let (buf, len) = expand_symbol(sys, regs, dict, symbol)?;

        if len as u32 > regs.gpr[r1 + 1] {
            return Ok(1);
        }
        for (i, &b) in buf[..len].iter().enumerate() {
            regs.vstore_byte(&sys.storage, regs.gpr[r1].wrapping_add(i as u32), b)?;
        }
        regs.gpr[r1] = regs.gpr[r1].wrapping_add(len as u32);
        regs.gpr[r1 + 1] -= len as u32;

        let total = cbn(regs) + size;
        regs.gpr[r2] = regs.gpr[r2].wrapping_add(total / 8);
        regs.gpr[r2 + 1] -= total / 8;
        set_cbn(regs, total % 8);

        processed += 1;
        if processed >= PROCESS_MAX {
            let needed = (cbn(regs) + size + 7) / 8;
            return Ok(if needed > regs.gpr[r2 + 1] { 0 } else { 3 });
        }
    }
}
