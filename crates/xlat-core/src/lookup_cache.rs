//! Guest address → host code index.
//!
//! Three levels:
//! - L1: a per-thread direct-mapped array of `(guest, host)` pairs ([`L1Cache`]). No locking;
//!   it is discarded whenever the shared cache's generation moves.
//! - L2: a page table over the low `l2_address_bits` of the guest address space. Each guest page
//!   lazily gets an array with one host pointer slot per byte offset. Reads are plain atomic
//!   loads.
//! - L3: the block map, the authoritative `guest → host` record, together with the record of
//!   which guest pages hold code for which blocks. Guarded by a read/write lock that is only
//!   taken for writing on mutation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub const GUEST_PAGE_SHIFT: u32 = 12;
pub const GUEST_PAGE_SIZE: u64 = 1 << GUEST_PAGE_SHIFT;
const PAGE_OFFSET_MASK: u64 = GUEST_PAGE_SIZE - 1;

type L2Page = Box<[AtomicUsize]>;

#[derive(Debug, Default)]
struct BlockMap {
    blocks: HashMap<u64, usize>,
    /// Guest page number → entry addresses of blocks with code on that page.
    code_pages: BTreeMap<u64, BTreeSet<u64>>,
}

#[derive(Debug)]
pub struct LookupCache {
    pages: Box<[OnceLock<L2Page>]>,
    l2_limit: u64,
    map: RwLock<BlockMap>,
    /// Bumped whenever a mapping is removed or replaced.
    generation: AtomicU64,
}

impl LookupCache {
    pub fn new(l2_address_bits: u32) -> Self {
        let bits = l2_address_bits.clamp(GUEST_PAGE_SHIFT, 36);
        let page_count = 1usize << (bits - GUEST_PAGE_SHIFT);
        Self {
            pages: (0..page_count).map(|_| OnceLock::new()).collect(),
            l2_limit: 1u64 << bits,
            map: RwLock::new(BlockMap::default()),
            generation: AtomicU64::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BlockMap> {
        match self.map.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, BlockMap> {
        match self.map.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    #[inline]
    fn l2_slot(&self, guest: u64) -> Option<&AtomicUsize> {
        if guest >= self.l2_limit {
            return None;
        }
        let page = self.pages[(guest >> GUEST_PAGE_SHIFT) as usize].get()?;
        Some(&page[(guest & PAGE_OFFSET_MASK) as usize])
    }

    fn l2_slot_or_create(&self, guest: u64) -> Option<&AtomicUsize> {
        if guest >= self.l2_limit {
            return None;
        }
        let page = self.pages[(guest >> GUEST_PAGE_SHIFT) as usize].get_or_init(|| {
            (0..GUEST_PAGE_SIZE)
                .map(|_| AtomicUsize::new(0))
                .collect()
        });
        Some(&page[(guest & PAGE_OFFSET_MASK) as usize])
    }

    /// Host code for `guest`, or `None`.
    pub fn find(&self, guest: u64) -> Option<usize> {
        if let Some(slot) = self.l2_slot(guest) {
            let host = slot.load(Ordering::Acquire);
            if host != 0 {
                return Some(host);
            }
        }
        // Mutations hold the write lock, so the fill below cannot resurrect an erased mapping.
        let map = self.read();
        let host = *map.blocks.get(&guest)?;
        if let Some(slot) = self.l2_slot_or_create(guest) {
            let _ = slot.compare_exchange(0, host, Ordering::AcqRel, Ordering::Acquire);
        }
        drop(map);
        Some(host)
    }

    /// Maps `guest` to `host`, replacing any previous mapping.
    pub fn insert(&self, guest: u64, host: usize) {
        debug_assert_ne!(host, 0);
        let mut map = self.write();
        if let Some(old) = map.blocks.insert(guest, host) {
            if old != host {
                self.generation.fetch_add(1, Ordering::AcqRel);
            }
        }
        if let Some(slot) = self.l2_slot_or_create(guest) {
            slot.store(host, Ordering::Release);
        }
    }

    /// Removes the mapping for `guest`. Returns whether one existed.
    pub fn erase(&self, guest: u64) -> bool {
        let mut map = self.write();
        self.erase_locked(&mut map, guest)
    }

    fn erase_locked(&self, map: &mut BlockMap, guest: u64) -> bool {
        let existed = map.blocks.remove(&guest).is_some();
        if let Some(slot) = self.l2_slot(guest) {
            slot.store(0, Ordering::Release);
        }
        if existed {
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        existed
    }

    /// Records that `blocks` have code in `[start, start + len)`. Returns `true` if any of those
    /// pages held no code before, so the caller should start write-protecting them.
    pub fn add_block_executable_range(&self, blocks: &[u64], start: u64, len: u64) -> bool {
        if len == 0 {
            return false;
        }
        let mut map = self.write();
        let first = start >> GUEST_PAGE_SHIFT;
        let last = start.saturating_add(len - 1) >> GUEST_PAGE_SHIFT;
        let mut new_page = false;
        for page in first..=last {
            let entries = map.code_pages.entry(page).or_default();
            new_page |= entries.is_empty();
            entries.extend(blocks.iter().copied());
        }
        new_page
    }

    /// Erases every block with code in `[start, start + len)`, and clears the L2 arrays of the
    /// touched pages. Returns the erased entry addresses.
    pub fn invalidate_range(&self, start: u64, len: u64) -> Vec<u64> {
        if len == 0 {
            return Vec::new();
        }
        let mut map = self.write();
        let first = start >> GUEST_PAGE_SHIFT;
        let last = start.saturating_add(len - 1) >> GUEST_PAGE_SHIFT;

        let pages: Vec<u64> = map.code_pages.range(first..=last).map(|(&p, _)| p).collect();
        let mut erased = Vec::new();
        for page in pages {
            if let Some(entries) = map.code_pages.remove(&page) {
                for guest in entries {
                    if self.erase_locked(&mut map, guest) {
                        erased.push(guest);
                    }
                }
            }
            self.clear_l2_page(page << GUEST_PAGE_SHIFT);
        }
        if !erased.is_empty() {
            tracing::debug!(start, len, blocks = erased.len(), "invalidated guest code range");
        }
        erased
    }

    fn clear_l2_page(&self, page_base: u64) {
        if page_base >= self.l2_limit {
            return;
        }
        if let Some(page) = self.pages[(page_base >> GUEST_PAGE_SHIFT) as usize].get() {
            for slot in page.iter() {
                slot.store(0, Ordering::Release);
            }
        }
    }

    /// Drops every mapping.
    pub fn clear(&self) {
        let mut map = self.write();
        for &guest in map.blocks.keys() {
            if let Some(slot) = self.l2_slot(guest) {
                slot.store(0, Ordering::Release);
            }
        }
        map.blocks.clear();
        map.code_pages.clear();
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn len(&self) -> usize {
        self.read().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().blocks.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct L1Entry {
    guest: u64,
    host: usize,
}

/// A thread's private front for a shared [`LookupCache`].
#[derive(Debug)]
pub struct L1Cache {
    entries: Box<[L1Entry]>,
    mask: usize,
    generation: u64,
}

impl L1Cache {
    /// `entries` is rounded up to a power of two.
    pub fn new(entries: usize) -> Self {
        let len = entries.max(1).next_power_of_two();
        Self {
            entries: vec![L1Entry::default(); len].into_boxed_slice(),
            mask: len - 1,
            generation: 0,
        }
    }

    pub fn clear(&mut self) {
        self.entries.fill(L1Entry::default());
    }

    #[inline]
    fn index(&self, guest: u64) -> usize {
        guest as usize & self.mask
    }

    pub fn find(&mut self, shared: &LookupCache, guest: u64) -> Option<usize> {
        let generation = shared.generation();
        if generation != self.generation {
            self.clear();
            self.generation = generation;
        }

        let i = self.index(guest);
        let entry = self.entries[i];
        if entry.host != 0 && entry.guest == guest {
            return Some(entry.host);
        }

        let host = shared.find(guest)?;
        self.entries[i] = L1Entry { guest, host };
        Some(host)
    }

    /// Fills the entry for a mapping this thread just installed.
    pub fn fill(&mut self, shared: &LookupCache, guest: u64, host: usize) {
        if shared.generation() == self.generation {
            let i = self.index(guest);
            self.entries[i] = L1Entry { guest, host };
        }
    }
}
