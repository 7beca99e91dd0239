/// The number of index bits used by the quick cache.
pub const QUICK_CACHE_BITS: u32 = 10;

/// The number of low address bits ignored when indexing the quick cache. Translated entry points
/// are at least 16-byte aligned, so these bits do not distinguish between functions.
pub const QUICK_CACHE_SHIFT: u32 = 4;

pub const QUICK_CACHE_ENTRIES: usize = 1 << QUICK_CACHE_BITS;

const INDEX_MASK: u64 = QUICK_CACHE_ENTRIES as u64 - 1;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct QuickCacheEntry {
    /// The guest address stored in this slot.
    pub tag: u64,

    /// The host entry point for `tag`.
    pub target: u64,
}

/// A direct-mapped cache from guest addresses to host entry points.
///
/// The table is read directly by the pinned dispatch sequences: the byte offset of the slot for
/// `addr` is `addr & (INDEX_MASK << QUICK_CACHE_SHIFT)` since each entry is 16 bytes.
#[repr(C, align(64))]
pub struct QuickCache {
    entries: [QuickCacheEntry; QUICK_CACHE_ENTRIES],
}

impl Default for QuickCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QuickCache {
    pub const fn new() -> Self {
        Self { entries: [QuickCacheEntry { tag: 0, target: 0 }; QUICK_CACHE_ENTRIES] }
    }

    #[inline(always)]
    pub const fn index(addr: u64) -> usize {
        ((addr >> QUICK_CACHE_SHIFT) & INDEX_MASK) as usize
    }

    /// Returns the cached entry point for `addr` if the slot is currently tagged with it.
    ///
    /// Address zero is never a valid target, so it always misses even though empty slots carry a
    /// zero tag.
    #[inline(always)]
    pub fn lookup(&self, addr: u64) -> Option<u64> {
        let entry = self.entries[Self::index(addr)];
        if addr != 0 && entry.tag == addr { Some(entry.target) } else { None }
    }

    /// Overwrite the slot for `addr`, displacing any other address that shares it.
    #[inline]
    pub fn update(&mut self, addr: u64, target: u64) {
        debug_assert_ne!(addr, 0, "address zero cannot be cached");
        self.entries[Self::index(addr)] = QuickCacheEntry { tag: addr, target };
    }

    pub fn entry(&self, index: usize) -> QuickCacheEntry {
        self.entries[index]
    }

    /// The number of slots that currently hold an address.
    pub fn occupied(&self) -> usize {
        self.entries.iter().filter(|entry| entry.tag != 0).count()
    }
}
