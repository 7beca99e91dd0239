//! Bump-allocated memory regions for translated code and its runtime data.

pub mod arena;
pub mod icache;


pub use crate::{
    arena::{Arena, ArenaKind, MIN_ALIGN},
    icache::flush_icache,
};

/// Default base address used for the data arena, the code arena is placed directly after it.
pub const DEFAULT_BASE: usize = 0x0000_4000_0000_0000;

/// Default number of bytes reserved for the data arena.
pub const DEFAULT_DATA_SIZE: usize = 0x0100_0000;

/// Default number of bytes reserved for the code arena.
pub const DEFAULT_CODE_SIZE: usize = 0x4000_0000;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ArenaError {
    /// The requested alignment was not a power of two.
    InvalidAlignment,

    /// The allocation would grow the arena past its reserved end.
    OutOfMemory,

    /// The address space for the arena could not be reserved (carries the OS error number).
    AddressUnavailable(i32),

    /// Changing the protection of newly committed pages failed (carries the OS error number).
    Protect(i32),

    /// A code write targeted memory outside of the committed part of the code arena.
    OutOfBounds,
}

impl ArenaError {
    /// The (negative) errno style code associated with the error.
    pub const fn code(self) -> i32 {
        match self {
            Self::InvalidAlignment => -libc::EINVAL,
            Self::OutOfMemory => -libc::ENOMEM,
            Self::AddressUnavailable(errno) | Self::Protect(errno) => -errno,
            Self::OutOfBounds => -libc::EFAULT,
        }
    }
}

impl std::fmt::Display for ArenaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidAlignment => f.write_str("alignment is not a power of two"),
            Self::OutOfMemory => f.write_str("arena exhausted"),
            Self::AddressUnavailable(errno) => {
                write!(f, "failed to reserve arena: {}", std::io::Error::from_raw_os_error(*errno))
            }
            Self::Protect(errno) => {
                write!(f, "failed to commit pages: {}", std::io::Error::from_raw_os_error(*errno))
            }
            Self::OutOfBounds => f.write_str("write outside of committed code memory"),
        }
    }
}

impl std::error::Error for ArenaError {}

pub type ArenaResult<T> = Result<T, ArenaError>;

/// The pair of arenas used by the runtime: one for data (read/write) and one for code
/// (read/write/execute once committed).
pub struct Memory {
    pub data: Arena,
    pub code: Arena,
}

impl Memory {
    /// Reserve both arenas, placing the data arena at `base_hint` (if any) and the code arena
    /// immediately after it.
    pub fn init(base_hint: Option<usize>, data_size: usize, code_size: usize) -> ArenaResult<Self> {
        let data = Arena::reserve(base_hint, data_size, ArenaKind::Data)?;
        let code_hint = base_hint.map(|_| data.end());
        let code = Arena::reserve(code_hint, code_size, ArenaKind::Code)?;
        Ok(Self { data, code })
    }

    #[inline]
    pub fn alloc_data(&mut self, size: usize, align: usize) -> ArenaResult<*mut u8> {
        self.data.alloc(size, align)
    }

    #[inline]
    pub fn alloc_code(&mut self, size: usize, align: usize) -> ArenaResult<*mut u8> {
        self.code.alloc(size, align)
    }

    /// Copy `src` into previously allocated code memory at `dst`, then make the new bytes visible
    /// to instruction fetch.
    ///
    /// # Safety
    ///
    /// No code may be executing from the destination range while it is being written.
    pub unsafe fn write_code(&mut self, dst: *mut u8, src: &[u8]) -> ArenaResult<()> {
        let start = dst as usize;
        let end = start.checked_add(src.len()).ok_or(ArenaError::OutOfBounds)?;
        if start < self.code.start() || end > self.code.brk() {
            return Err(ArenaError::OutOfBounds);
        }
        std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
        flush_icache(dst, src.len());
        Ok(())
    }
}

/// Returns the size of a host page.
pub fn page_size() -> usize {
    static PAGE_SIZE: std::sync::OnceLock<usize> = std::sync::OnceLock::new();
    *PAGE_SIZE.get_or_init(|| match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 0x1000,
    })
}

pub fn align_up(value: usize, alignment: usize) -> usize {
    assert_eq!(alignment.count_ones(), 1, "Alignment must be a non-zero power of 2");
    let mask = alignment.wrapping_sub(1);
    value + ((alignment - (value & mask)) & mask)
}

pub fn align_down(value: usize, alignment: usize) -> usize {
    assert_eq!(alignment.count_ones(), 1, "Alignment must be a non-zero power of 2");
    let mask = !alignment.wrapping_sub(1);
    value & mask
}

/// Like [align_up] but returns `None` instead of wrapping past the end of the address space.
pub fn checked_align_up(value: usize, alignment: usize) -> Option<usize> {
    let mask = alignment.wrapping_sub(1);
    value.checked_add(mask).map(|x| x & !mask)
}
