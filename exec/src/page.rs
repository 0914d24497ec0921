use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tcg_core::memory::{page_of, TARGET_PAGE_BITS};

const CODE_BITS_WORDS: usize = 1024;
const CODE_BITS: u64 = (CODE_BITS_WORDS * 64) as u64;

/// Guest pages that contain translated code, mapped to the TBs
/// covering them. Guarded by the store's write lock.
#[derive(Debug, Default)]
pub struct PageMap {
    pages: HashMap<u64, Vec<usize>>,
}

impl PageMap {
    pub fn add(&mut self, page: u64, tb: usize) {
        self.pages.entry(page).or_default().push(tb);
    }

    pub fn remove(&mut self, page: u64, tb: usize) {
        if let Some(list) = self.pages.get_mut(&page) {
            list.retain(|&t| t != tb);
            if list.is_empty() {
                self.pages.remove(&page);
            }
        }
    }

    /// TBs with code on `page`.
    pub fn tbs_on(&self, page: u64) -> &[usize] {
        self.pages.get(&page).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }
}

/// Lock-free filter over code pages, read on every guest store.
///
/// Pages hash onto a fixed bitmap; a clear bit proves the page holds
/// no translated code. Bits are only cleared by a flush.
pub struct CodePageBits {
    words: Box<[AtomicU64]>,
}

impl CodePageBits {
    pub fn new() -> Self {
        Self {
            words: (0..CODE_BITS_WORDS).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn slot(page: u64) -> (usize, u64) {
        let bit = (page >> TARGET_PAGE_BITS) % CODE_BITS;
        ((bit / 64) as usize, 1u64 << (bit % 64))
    }

    pub fn set(&self, page: u64) {
        let (w, m) = Self::slot(page);
        self.words[w].fetch_or(m, Ordering::Release);
    }

    pub fn test(&self, page: u64) -> bool {
        let (w, m) = Self::slot(page);
        self.words[w].load(Ordering::Acquire) & m != 0
    }

    /// Whether any page of `[addr, addr + len)` may hold code.
    pub fn test_range(&self, addr: u64, len: u64) -> bool {
        page_range(addr, len).any(|p| self.test(p))
    }

    pub fn clear(&self) {
        for w in self.words.iter() {
            w.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for CodePageBits {
    fn default() -> Self {
        Self::new()
    }
}

/// Page addresses touched by `[addr, addr + len)`.
pub fn page_range(addr: u64, len: u64) -> impl Iterator<Item = u64> {
    let first = page_of(addr) >> TARGET_PAGE_BITS;
    let last = page_of(addr.wrapping_add(len.max(1) - 1)) >> TARGET_PAGE_BITS;
    (first..=last.max(first)).map(|p| p << TARGET_PAGE_BITS)
}
