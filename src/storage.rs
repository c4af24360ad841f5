//! Main storage subsystem
//!
//! A single flat byte-addressed buffer plus one storage key per 4 KiB
//! frame. All architectural multi-byte fields are big-endian. Absolute
//! addresses index the buffer directly; real addresses 0..4095 of a CPU
//! are exchanged with the block at its prefix register by
//! [`apply_prefixing`].
//!
//! The buffer and the key array sit behind one mutex, which is the
//! innermost lock of the system: no other lock is ever acquired while it
//! is held. Each accessor takes the lock for exactly one operation, so a
//! multi-byte load or store is atomic with respect to every other
//! observer.

use std::collections::TryReserveError;
use std::sync::Mutex;

use crate::cpu::ProgramException;

/// Storage key bit assignments (one key byte per 4 KiB frame)
pub mod key {
    /// Access-control bits (key value in bits 0-3)
    pub const ACC: u8 = 0xF0;
    /// Fetch-protection bit
    pub const FETCH: u8 = 0x08;
    /// Reference bit
    pub const REF: u8 = 0x04;
    /// Change bit
    pub const CHANGE: u8 = 0x02;
    /// Bad-frame marker
    pub const BADFRM: u8 = 0x01;
}

/// Size of a storage frame (one storage key covers one frame)
pub const FRAME_SIZE: usize = 4096;

/// Translate a real address to an absolute address (and vice versa).
///
/// Real addresses 0..4095 map to the frame at the prefix register, and
/// real addresses inside the prefix frame map to 0..4095. Every other
/// address is unchanged. Applying the map twice returns the original
/// address.
pub fn apply_prefixing(addr: u32, pxr: u32) -> u32 {
    if addr < FRAME_SIZE as u32 {
        addr + pxr
    } else if addr & !0xFFF == pxr {
        addr & 0xFFF
    } else {
        addr
    }
}

struct StorageInner {
    data: Vec<u8>,
    keys: Vec<u8>,
}

/// Main storage with per-frame storage keys
pub struct Storage {
    inner: Mutex<StorageInner>,
    size: usize,
}

impl Storage {
    /// Allocate main storage of the given size (a multiple of the frame
    /// size). Allocation failure is reported rather than aborting.
    pub fn new(size: usize) -> Result<Self, TryReserveError> {
        let mut data = Vec::new();
        data.try_reserve_exact(size)?;
        data.resize(size, 0);

        let frames = size / FRAME_SIZE;
        let mut keys = Vec::new();
        keys.try_reserve_exact(frames)?;
        keys.resize(frames, 0);

        Ok(Self {
            inner: Mutex::new(StorageInner { data, keys }),
            size,
        })
    }

    /// Configured storage size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    fn check(&self, addr: u32, len: usize) -> Result<(), ProgramException> {
        if (addr as usize).checked_add(len).map_or(true, |end| end > self.size) {
            return Err(ProgramException::Addressing);
        }
        Ok(())
    }

    /// Check a storage key against an access key for a fetch reference.
    /// Access key zero matches every frame.
    fn fetch_allowed(skey: u8, akey: u8) -> bool {
        akey == 0 || skey & key::FETCH == 0 || (skey & key::ACC) >> 4 == akey
    }

    /// Check a storage key against an access key for a store reference.
    fn store_allowed(skey: u8, akey: u8) -> bool {
        akey == 0 || (skey & key::ACC) >> 4 == akey
    }

    // ========== Unkeyed absolute access ==========

    /// Fetch one byte at an absolute address
    pub fn fetch_byte(&self, addr: u32) -> Result<u8, ProgramException> {
        self.check(addr, 1)?;
        let inner = self.inner.lock().unwrap();
        Ok(inner.data[addr as usize])
    }

    /// Fetch a big-endian halfword at an absolute address
    pub fn fetch_halfword(&self, addr: u32) -> Result<u16, ProgramException> {
        self.check(addr, 2)?;
        let inner = self.inner.lock().unwrap();
        let a = addr as usize;
        Ok(u16::from_be_bytes([inner.data[a], inner.data[a + 1]]))
    }

    /// Fetch a big-endian fullword at an absolute address
    pub fn fetch_fullword(&self, addr: u32) -> Result<u32, ProgramException> {
        self.check(addr, 4)?;
        let inner = self.inner.lock().unwrap();
        let a = addr as usize;
        let mut b = [0u8; 4];
        b.copy_from_slice(&inner.data[a..a + 4]);
        Ok(u32::from_be_bytes(b))
    }

    /// Fetch a big-endian doubleword at an absolute address
    pub fn fetch_doubleword(&self, addr: u32) -> Result<u64, ProgramException> {
        self.check(addr, 8)?;
        let inner = self.inner.lock().unwrap();
        let a = addr as usize;
        let mut b = [0u8; 8];
        b.copy_from_slice(&inner.data[a..a + 8]);
        Ok(u64::from_be_bytes(b))
    }

    /// Store one byte at an absolute address
    pub fn store_byte(&self, addr: u32, value: u8) -> Result<(), ProgramException> {
        self.check(addr, 1)?;
        let mut inner = self.inner.lock().unwrap();
        inner.data[addr as usize] = value;
        Ok(())
    }

    /// Store a big-endian halfword at an absolute address
    pub fn store_halfword(&self, addr: u32, value: u16) -> Result<(), ProgramException> {
        self.check(addr, 2)?;
        let mut inner = self.inner.lock().unwrap();
        let a = addr as usize;
        inner.data[a..a + 2].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Store a big-endian fullword at an absolute address
    pub fn store_fullword(&self, addr: u32, value: u32) -> Result<(), ProgramException> {
        self.check(addr, 4)?;
        let mut inner = self.inner.lock().unwrap();
        let a = addr as usize;
        inner.data[a..a + 4].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Store a big-endian doubleword at an absolute address
    pub fn store_doubleword(&self, addr: u32, value: u64) -> Result<(), ProgramException> {
        self.check(addr, 8)?;
        let mut inner = self.inner.lock().unwrap();
        let a = addr as usize;
        inner.data[a..a + 8].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Read-modify-write a big-endian fullword in one locked operation.
    ///
    /// Returns the old and new values. Observers can never see an
    /// intermediate state, which the interval-timer decrement relies on.
    pub fn update_fullword(
        &self,
        addr: u32,
        f: impl FnOnce(u32) -> u32,
    ) -> Result<(u32, u32), ProgramException> {
        self.check(addr, 4)?;
        let mut inner = self.inner.lock().unwrap();
        let a = addr as usize;
        let mut b = [0u8; 4];
        b.copy_from_slice(&inner.data[a..a + 4]);
        let old = u32::from_be_bytes(b);
        let new = f(old);
        inner.data[a..a + 4].copy_from_slice(&new.to_be_bytes());
        Ok((old, new))
    }

    // ========== Key-controlled access ==========
    //
    // These apply an access key against the frame's storage key, raise a
    // protection exception on mismatch, and maintain the reference and
    // change bits.

    /// Fetch one byte under an access key
    pub fn fetch_byte_keyed(&self, addr: u32, akey: u8) -> Result<u8, ProgramException> {
        self.check(addr, 1)?;
        let mut inner = self.inner.lock().unwrap();
        let frame = addr as usize / FRAME_SIZE;
        if !Self::fetch_allowed(inner.keys[frame], akey) {
            return Err(ProgramException::Protection);
        }
        inner.keys[frame] |= key::REF;
        Ok(inner.data[addr as usize])
    }

    /// Fetch a big-endian halfword under an access key
    pub fn fetch_halfword_keyed(&self, addr: u32, akey: u8) -> Result<u16, ProgramException> {
        let hi = self.fetch_byte_keyed(addr, akey)?;
        let lo = self.fetch_byte_keyed(addr + 1, akey)?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    /// Fetch a big-endian fullword under an access key
    pub fn fetch_fullword_keyed(&self, addr: u32, akey: u8) -> Result<u32, ProgramException> {
        let hi = self.fetch_halfword_keyed(addr, akey)?;
        let lo = self.fetch_halfword_keyed(addr + 2, akey)?;
        Ok(((hi as u32) << 16) | lo as u32)
    }

    /// Fetch a big-endian doubleword under an access key
    pub fn fetch_doubleword_keyed(&self, addr: u32, akey: u8) -> Result<u64, ProgramException> {
        let hi = self.fetch_fullword_keyed(addr, akey)?;
        let lo = self.fetch_fullword_keyed(addr + 4, akey)?;
        Ok(((hi as u64) << 32) | lo as u64)
    }

    /// Store one byte under an access key
    pub fn store_byte_keyed(&self, addr: u32, akey: u8, value: u8) -> Result<(), ProgramException> {
        self.check(addr, 1)?;
        let mut inner = self.inner.lock().unwrap();
        let frame = addr as usize / FRAME_SIZE;
        if !Self::store_allowed(inner.keys[frame], akey) {
            return Err(ProgramException::Protection);
        }
        inner.keys[frame] |= key::REF | key::CHANGE;
        inner.data[addr as usize] = value;
        Ok(())
    }

    /// Store a big-endian halfword under an access key
    pub fn store_halfword_keyed(
        &self,
        addr: u32,
        akey: u8,
        value: u16,
    ) -> Result<(), ProgramException> {
        let b = value.to_be_bytes();
        self.store_byte_keyed(addr, akey, b[0])?;
        self.store_byte_keyed(addr + 1, akey, b[1])
    }

    /// Store a big-endian fullword under an access key
    pub fn store_fullword_keyed(
        &self,
        addr: u32,
        akey: u8,
        value: u32,
    ) -> Result<(), ProgramException> {
        self.store_halfword_keyed(addr, akey, (value >> 16) as u16)?;
        self.store_halfword_keyed(addr + 2, akey, value as u16)
    }

    // ========== Storage keys ==========

    /// Read the storage key of the frame containing an absolute address
    pub fn storage_key(&self, addr: u32) -> Result<u8, ProgramException> {
        self.check(addr, 1)?;
        let inner = self.inner.lock().unwrap();
        Ok(inner.keys[addr as usize / FRAME_SIZE])
    }

    /// Replace the storage key of the frame containing an absolute address
    pub fn set_storage_key(&self, addr: u32, skey: u8) -> Result<(), ProgramException> {
        self.check(addr, 1)?;
        let mut inner = self.inner.lock().unwrap();
        inner.keys[addr as usize / FRAME_SIZE] = skey;
        Ok(())
    }

    /// Turn on the reference and change bits of the frame containing an
    /// absolute address (done for the PSA frame on every interruption).
    pub fn set_reference_and_change(&self, addr: u32) -> Result<(), ProgramException> {
        self.check(addr, 1)?;
        let mut inner = self.inner.lock().unwrap();
        inner.keys[addr as usize / FRAME_SIZE] |= key::REF | key::CHANGE;
        Ok(())
    }
}
