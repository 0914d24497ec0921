//! Executable-code storage shared by all vCPUs.
//!
//! A [`CodeBuffer`] is written only by whoever holds the translate
//! lock. Published code is read through [`CodeRegion`] copies; the
//! only words that change after publication are `goto_tb` link words,
//! and those are touched atomically.

use std::io;
use std::ptr::{self, NonNull};
use std::sync::atomic::AtomicU64;

pub const DEFAULT_CODE_BUF_SIZE: usize = 16 << 20;

const WORD: usize = 8;

pub struct CodeBuffer {
    base: NonNull<u8>,
    size: usize,
    offset: usize,
}

// SAFETY: the mapping is owned by this value alone.
unsafe impl Send for CodeBuffer {}

impl CodeBuffer {
    /// Map `size` bytes, rounded up to whole pages.
    pub fn new(size: usize) -> io::Result<Self> {
        let page = page_size();
        let size = size.max(1).div_ceil(page) * page;

        // SAFETY: anonymous private mapping, no file or fixed address.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Self {
            base,
            size,
            offset: 0,
        })
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.size - self.offset
    }

    /// Move the write position, e.g. back to the start on a flush.
    pub fn set_offset(&mut self, offset: usize) {
        assert!(offset <= self.size, "offset past end of code buffer");
        self.offset = offset;
    }

    pub fn region(&self) -> CodeRegion {
        CodeRegion {
            base: self.base,
            size: self.size,
        }
    }

    /// Append one host word.
    pub fn emit_u64(&mut self, val: u64) {
        assert!(self.remaining() >= WORD, "code buffer overflow");
        // SAFETY: in bounds per the check above.
        unsafe {
            self.base
                .as_ptr()
                .add(self.offset)
                .cast::<u64>()
                .write_unaligned(val)
        };
        self.offset += WORD;
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        // SAFETY: base and size describe the mapping made in `new`.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.size);
        }
    }
}

/// Copyable read handle on a [`CodeBuffer`]'s mapping. The buffer must
/// outlive every use of it.
#[derive(Debug, Clone, Copy)]
pub struct CodeRegion {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: published words are immutable apart from link words, which
// are only accessed through `AtomicU64`.
unsafe impl Send for CodeRegion {}
unsafe impl Sync for CodeRegion {}

impl CodeRegion {
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// # Safety
    /// The buffer is alive and the word at `off` has been published.
    #[inline]
    pub unsafe fn read_u64(&self, off: usize) -> u64 {
        assert!(off + WORD <= self.size, "host code read out of range");
        self.base.as_ptr().add(off).cast::<u64>().read_unaligned()
    }

    /// The link word of a `goto_tb` at `off`.
    ///
    /// # Safety
    /// The buffer is alive and the word at `off` is a link word, never
    /// accessed non-atomically after publication.
    #[inline]
    pub unsafe fn link_word(&self, off: usize) -> &AtomicU64 {
        assert!(off + WORD <= self.size, "link word out of range");
        assert_eq!(off % WORD, 0, "link word must be 8-byte aligned");
        &*self.base.as_ptr().add(off).cast::<AtomicU64>()
    }
}

fn page_size() -> usize {
    // SAFETY: no preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n > 0 {
        n as usize
    } else {
        4096
    }
}
