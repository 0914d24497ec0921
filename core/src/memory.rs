//! Guest memory interface seen by generated code.

use crate::types::MemOp;

/// Guest page granularity for code tracking and block boundaries.
pub const TARGET_PAGE_BITS: u32 = 12;
pub const TARGET_PAGE_SIZE: u64 = 1 << TARGET_PAGE_BITS;
pub const TARGET_PAGE_MASK: u64 = !(TARGET_PAGE_SIZE - 1);

/// Page-aligned base of `addr`.
pub const fn page_of(addr: u64) -> u64 {
    addr & TARGET_PAGE_MASK
}

/// Whether `a` and `b` lie on the same guest page.
pub const fn same_page(a: u64, b: u64) -> bool {
    page_of(a) == page_of(b)
}

/// A guest memory access that could not be completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemFault {
    pub addr: u64,
    pub size: u32,
    pub write: bool,
}

/// Guest address space as reached from translated code.
///
/// Values are little-endian and `memop` gives the access size; sign
/// extension is applied by the caller.
pub trait GuestMemory {
    fn load(&mut self, addr: u64, memop: MemOp) -> Result<u64, MemFault>;
    fn store(&mut self, addr: u64, memop: MemOp, val: u64)
        -> Result<(), MemFault>;
}

/// Flat little-endian guest RAM starting at guest address `base`.
pub struct FlatMemory {
    pub base: u64,
    pub bytes: Vec<u8>,
}

impl FlatMemory {
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            bytes: vec![0; size],
        }
    }

    fn range(&self, addr: u64, size: u32) -> Option<std::ops::Range<usize>> {
        let off = addr.checked_sub(self.base)? as usize;
        let end = off.checked_add(size as usize)?;
        (end <= self.bytes.len()).then_some(off..end)
    }

    /// Copy `data` into guest memory at `addr`.
    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<(), MemFault> {
        let r = self.range(addr, data.len() as u32).ok_or(MemFault {
            addr,
            size: data.len() as u32,
            write: true,
        })?;
        self.bytes[r].copy_from_slice(data);
        Ok(())
    }

    pub fn read_bytes(&self, addr: u64, len: usize) -> Option<&[u8]> {
        self.range(addr, len as u32).map(|r| &self.bytes[r])
    }
}

impl GuestMemory for FlatMemory {
    fn load(&mut self, addr: u64, memop: MemOp) -> Result<u64, MemFault> {
        let size = memop.size_bytes();
        let r = self.range(addr, size).ok_or(MemFault {
            addr,
            size,
            write: false,
        })?;
        let mut raw = [0u8; 8];
        raw[..size as usize].copy_from_slice(&self.bytes[r]);
        Ok(u64::from_le_bytes(raw))
    }

    fn store(
        &mut self,
        addr: u64,
        memop: MemOp,
        val: u64,
    ) -> Result<(), MemFault> {
        let size = memop.size_bytes();
        let r = self.range(addr, size).ok_or(MemFault {
            addr,
            size,
            write: true,
        })?;
        self.bytes[r].copy_from_slice(&val.to_le_bytes()[..size as usize]);
        Ok(())
    }
}
