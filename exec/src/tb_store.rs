use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use tcg_backend::code_buffer::CodeRegion;
use tcg_backend::{ChainTarget, HostCodeGen};
use tcg_core::tb::{TbLink, TbState, TranslationBlock, TB_HASH_SIZE};

use crate::page::{page_range, CodePageBits, PageMap};

type Slot = UnsafeCell<MaybeUninit<TranslationBlock>>;

/// Thread-safe storage, hash lookup and chaining for TBs.
///
/// Slots are pre-allocated and written once, under the translate
/// lock, before `len` publishes them. Lookups walk atomic hash chains
/// without locking. Every edit of a hash chain, the page map or a
/// chain edge happens under `inner`.
pub struct TbStore {
    slots: Box<[Slot]>,
    len: AtomicUsize,
    /// Bucket heads as index + 1, 0 for an empty bucket.
    hash: Box<[AtomicUsize]>,
    inner: Mutex<PageMap>,
    code_pages: CodePageBits,
    generation: AtomicU32,
    flush_count: AtomicU64,
}

// SAFETY:
// - A slot is written once, by the holder of the translate lock,
//   before `len` is published with Release. Readers only touch
//   slots below an Acquire load of `len`.
// - Fields of a published TB that change afterwards are atomics or
//   behind the TB's own mutex.
// - Slots are dropped only by `flush`, which requires that no other
//   thread holds a reference into the store.
unsafe impl Sync for TbStore {}
unsafe impl Send for TbStore {}

impl TbStore {
    pub fn new(max_tbs: usize) -> Self {
        Self {
            slots: (0..max_tbs)
                .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
                .collect(),
            len: AtomicUsize::new(0),
            hash: (0..TB_HASH_SIZE).map(|_| AtomicUsize::new(0)).collect(),
            inner: Mutex::new(PageMap::default()),
            code_pages: CodePageBits::new(),
            generation: AtomicU32::new(0),
            flush_count: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Index the next `alloc` will return.
    pub fn next_index(&self) -> usize {
        self.len()
    }

    /// Current cache generation. Bumped by every invalidation and
    /// flush; a chain edge made under an older value is dead.
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Number of flushes so far.
    pub fn flush_count(&self) -> u64 {
        self.flush_count.load(Ordering::Acquire)
    }

    /// Publish a fully built TB and return its index.
    ///
    /// # Safety
    /// Caller must hold the translate lock, which makes it the only
    /// writer of the slot array.
    pub unsafe fn alloc(&self, tb: TranslationBlock) -> usize {
        let idx = self.len.load(Ordering::Relaxed);
        assert!(idx < self.capacity(), "TB store full");
        (*self.slots[idx].get()).write(tb);
        self.len.store(idx + 1, Ordering::Release);
        idx
    }

    /// Get a shared reference to a TB by index.
    pub fn get(&self, idx: usize) -> &TranslationBlock {
        assert!(idx < self.len(), "TB index out of bounds");
        // SAFETY: idx < len, so the slot was initialized before len
        // was published.
        unsafe { (*self.slots[idx].get()).assume_init_ref() }
    }

    fn lock(&self) -> MutexGuard<'_, PageMap> {
        self.inner.lock().unwrap()
    }

    /// Find a live TB for the given key. Lock-free.
    pub fn lookup(&self, pc: u64, flags: u32, cflags: u32) -> Option<usize> {
        let bucket = TranslationBlock::hash(pc, flags, cflags);
        let mut cur = self.hash[bucket].load(Ordering::Acquire);
        while cur != 0 {
            let tb = self.get(cur - 1);
            if tb.is_valid() && tb.matches(pc, flags, cflags) {
                return Some(cur - 1);
            }
            cur = tb.hash_next.load(Ordering::Acquire);
        }
        None
    }

    /// Enter a published TB into the hash table and page map and mark
    /// it executable.
    pub fn insert(&self, idx: usize) {
        let tb = self.get(idx);
        let mut pages = self.lock();
        for page in tb.page_addr.iter().flatten() {
            pages.add(*page, idx);
            self.code_pages.set(*page);
        }
        let bucket = TranslationBlock::hash(tb.pc, tb.flags, tb.cflags);
        let head = self.hash[bucket].load(Ordering::Acquire);
        tb.hash_next.store(head, Ordering::Relaxed);
        tb.set_state(TbState::Cached);
        self.hash[bucket].store(idx + 1, Ordering::Release);
    }

    /// Whether `[addr, addr + len)` may overlap translated code.
    pub fn may_have_code(&self, addr: u64, len: u64) -> bool {
        self.code_pages.test_range(addr, len)
    }

    /// Number of guest pages holding translated code.
    pub fn num_code_pages(&self) -> usize {
        self.lock().num_pages()
    }

    /// Retire a TB: it stops being found, nothing chains into or out
    /// of it any more, and its code stays in place until the next
    /// flush. Returns false if it was already invalid.
    pub fn invalidate<B: HostCodeGen>(
        &self,
        idx: usize,
        code: CodeRegion,
        backend: &B,
    ) -> bool {
        let mut pages = self.lock();
        self.invalidate_locked(&mut pages, idx, code, backend)
    }

    fn invalidate_locked<B: HostCodeGen>(
        &self,
        pages: &mut PageMap,
        idx: usize,
        code: CodeRegion,
        backend: &B,
    ) -> bool {
        let tb = self.get(idx);
        if tb.state() == TbState::Invalid {
            return false;
        }
        tb.set_state(TbState::Invalid);
        self.generation.fetch_add(1, Ordering::AcqRel);

        // Incoming edges.
        let incoming = std::mem::take(&mut tb.jmp.lock().unwrap().jmp_list);
        for (src, slot) in incoming {
            let src_tb = self.get(src);
            if let Some(off) = src_tb.jmp_insn_offset[slot] {
                backend.patch_jump(code, off as usize, None);
            }
            src_tb.jmp.lock().unwrap().jmp_dest[slot] = None;
        }

        // Outgoing edges.
        for slot in 0..2 {
            let link = tb.jmp.lock().unwrap().jmp_dest[slot].take();
            if let Some(link) = link {
                if let Some(off) = tb.jmp_insn_offset[slot] {
                    backend.patch_jump(code, off as usize, None);
                }
                self.get(link.dst)
                    .jmp
                    .lock()
                    .unwrap()
                    .jmp_list
                    .retain(|&e| e != (idx, slot));
            }
        }

        self.unlink_hash(idx);
        for page in tb.page_addr.iter().flatten() {
            pages.remove(*page, idx);
        }
        true
    }

    /// Remove `idx` from its bucket. Walkers already standing on it
    /// keep a valid `hash_next`.
    fn unlink_hash(&self, idx: usize) {
        let tb = self.get(idx);
        let bucket = TranslationBlock::hash(tb.pc, tb.flags, tb.cflags);
        let next = tb.hash_next.load(Ordering::Acquire);
        let mut link = &self.hash[bucket];
        loop {
            let cur = link.load(Ordering::Acquire);
            if cur == 0 {
                return;
            }
            if cur == idx + 1 {
                link.store(next, Ordering::Release);
                return;
            }
            link = &self.get(cur - 1).hash_next;
        }
    }

    /// Invalidate every TB with code on a page touched by
    /// `[addr, addr + len)`. Returns the retired indices.
    pub fn invalidate_range<B: HostCodeGen>(
        &self,
        addr: u64,
        len: u64,
        code: CodeRegion,
        backend: &B,
    ) -> Vec<usize> {
        let mut pages = self.lock();
        let mut victims = Vec::new();
        for page in page_range(addr, len) {
            victims.extend_from_slice(pages.tbs_on(page));
        }
        victims.sort_unstable();
        victims.dedup();
        victims.retain(|&idx| self.invalidate_locked(&mut pages, idx, code, backend));
        victims
    }

    /// Chain exit `slot` of `src` to `dst`. Returns false when either
    /// TB is no longer live or `src` has no such slot.
    pub fn link<B: HostCodeGen>(
        &self,
        src: usize,
        slot: usize,
        dst: usize,
        code: CodeRegion,
        backend: &B,
    ) -> bool {
        let _pages = self.lock();
        let src_tb = self.get(src);
        let dst_tb = self.get(dst);
        if !src_tb.is_valid() || !dst_tb.is_valid() {
            return false;
        }
        let Some(off) = src_tb.jmp_insn_offset[slot] else {
            return false;
        };
        let generation = self.generation();
        let link = TbLink { dst, generation };

        let old = {
            let mut jmp = src_tb.jmp.lock().unwrap();
            if jmp.jmp_dest[slot] == Some(link) {
                return true;
            }
            jmp.jmp_dest[slot].replace(link)
        };
        if let Some(old) = old {
            self.get(old.dst)
                .jmp
                .lock()
                .unwrap()
                .jmp_list
                .retain(|&e| e != (src, slot));
        }
        dst_tb.jmp.lock().unwrap().jmp_list.push((src, slot));
        backend.patch_jump(
            code,
            off as usize,
            Some(ChainTarget {
                host_offset: dst_tb.host_offset,
                generation,
            }),
        );
        true
    }

    /// Find the TB whose host code contains `off`.
    pub fn find_by_host_offset(&self, off: usize) -> Option<usize> {
        // TBs are allocated in code-buffer order.
        let (mut lo, mut hi) = (0, self.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.get(mid).host_offset <= off {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let idx = lo.checked_sub(1)?;
        self.get(idx).contains_host_offset(off).then_some(idx)
    }

    /// Drop every TB.
    ///
    /// # Safety
    /// No other thread may hold a reference into the store or be
    /// executing generated code: run inside an exclusive section
    /// while holding the translate lock.
    pub unsafe fn flush(&self) {
        let mut pages = self.lock();
        let len = self.len.swap(0, Ordering::AcqRel);
        for slot in &self.slots[..len] {
            (*slot.get()).assume_init_drop();
        }
        for head in self.hash.iter() {
            head.store(0, Ordering::Relaxed);
        }
        pages.clear();
        self.code_pages.clear();
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.flush_count.fetch_add(1, Ordering::AcqRel);
    }
}

impl Drop for TbStore {
    fn drop(&mut self) {
        let len = *self.len.get_mut();
        for slot in &mut self.slots[..len] {
            // SAFETY: slots below len are initialized.
            unsafe { slot.get_mut().assume_init_drop() };
        }
    }
}
