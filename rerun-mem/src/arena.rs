//! A reserved range of virtual memory that is handed out with a bump pointer, committing pages
//! lazily as the allocation cursor advances.

use crate::{checked_align_up, page_size, ArenaError, ArenaResult};

/// The minimum alignment of every allocation, chosen so that allocations never share a cache
/// line.
pub const MIN_ALIGN: usize = 0x40;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ArenaKind {
    /// Pages are committed as read/write.
    Data,

    /// Pages are committed as read/write/execute and stay executable for the life of the arena.
    Code,
}

impl ArenaKind {
    fn prot(self) -> libc::c_int {
        match self {
            Self::Data => libc::PROT_READ | libc::PROT_WRITE,
            Self::Code => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        }
    }
}

/// A monotonically growing region of memory. Individual allocations are never freed.
///
/// Invariant: `start <= brk <= committed <= end`, and `committed` is always page aligned.
pub struct Arena {
    kind: ArenaKind,
    start: usize,
    end: usize,

    /// The allocation cursor: everything below this address has been handed out.
    brk: usize,

    /// Everything below this address has had permissions applied.
    committed: usize,
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("kind", &self.kind)
            .field("start", &format_args!("{:#x}", self.start))
            .field("end", &format_args!("{:#x}", self.end))
            .field("brk", &format_args!("{:#x}", self.brk))
            .field("committed", &format_args!("{:#x}", self.committed))
            .finish()
    }
}

impl Arena {
    /// Reserve `size` bytes of address space without committing any of it. `base_hint` is
    /// passed to the kernel as a placement hint, the arena may end up somewhere else.
    pub fn reserve(base_hint: Option<usize>, size: usize, kind: ArenaKind) -> ArenaResult<Self> {
        let size = checked_align_up(size, page_size()).ok_or(ArenaError::OutOfMemory)?;
        let hint = base_hint.unwrap_or(0) as *mut libc::c_void;

        // Safety: we request a fresh anonymous mapping, no existing memory is affected.
        let mem = unsafe {
            libc::mmap(
                hint,
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::ENOMEM);
            tracing::error!("failed to reserve {size:#x} bytes for {kind:?} arena (errno={errno})");
            return Err(ArenaError::AddressUnavailable(errno));
        }

        let start = mem as usize;
        if base_hint.map_or(false, |hint| hint != start) {
            tracing::debug!("{kind:?} arena placed at {start:#x} instead of {:#x}", hint as usize);
        }
        tracing::debug!("reserved {kind:?} arena: {start:#x}..{:#x}", start + size);

        Ok(Self { kind, start, end: start + size, brk: start, committed: start })
    }

    pub fn kind(&self) -> ArenaKind {
        self.kind
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn brk(&self) -> usize {
        self.brk
    }

    pub fn committed(&self) -> usize {
        self.committed
    }

    /// Returns whether `addr` lies inside of memory that has been handed out by this arena.
    pub fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.brk
    }

    /// Allocate `size` bytes aligned to at least `align` (which must be zero or a power of two).
    ///
    /// On failure the arena is left unchanged.
    pub fn alloc(&mut self, size: usize, align: usize) -> ArenaResult<*mut u8> {
        if align != 0 && !align.is_power_of_two() {
            return Err(ArenaError::InvalidAlignment);
        }
        let align = align.max(MIN_ALIGN);

        let aligned = checked_align_up(self.brk, align).ok_or(ArenaError::OutOfMemory)?;
        let alloc_end = aligned.checked_add(size).ok_or(ArenaError::OutOfMemory)?;
        if alloc_end <= self.committed {
            self.brk = alloc_end;
            return Ok(aligned as *mut u8);
        }

        let commit_end = checked_align_up(alloc_end, page_size()).ok_or(ArenaError::OutOfMemory)?;
        if commit_end > self.end {
            tracing::warn!(
                "{:?} arena exhausted: requested {size:#x} bytes (brk={:#x}, end={:#x})",
                self.kind,
                self.brk,
                self.end
            );
            return Err(ArenaError::OutOfMemory);
        }

        let len = commit_end - self.committed;
        // Safety: the range is inside of the reservation made in `reserve` and has not been
        // handed out yet.
        let ret =
            unsafe { libc::mprotect(self.committed as *mut libc::c_void, len, self.kind.prot()) };
        if ret != 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL);
            return Err(ArenaError::Protect(errno));
        }
        tracing::trace!("{:?} arena: committed {:#x}..{commit_end:#x}", self.kind, self.committed);

        self.committed = commit_end;
        self.brk = alloc_end;
        Ok(aligned as *mut u8)
    }

    /// Allocate space for a `T`, returning a pointer to zeroed memory.
    pub fn alloc_zeroed<T>(&mut self) -> ArenaResult<*mut T> {
        let ptr = self.alloc(std::mem::size_of::<T>(), std::mem::align_of::<T>())?;
        // Safety: the allocation is at least `size_of::<T>()` bytes and is exclusively ours.
        unsafe { ptr.write_bytes(0, std::mem::size_of::<T>()) };
        Ok(ptr.cast())
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // Safety: all pointers returned by `alloc` are derived from this mapping and become
        // invalid once the arena is dropped.
        unsafe { libc::munmap(self.start as *mut libc::c_void, self.end - self.start) };
    }
}
