use std::{
    io::Read,
    path::{Path, PathBuf},
};

use rerun_mem::{page_size, Arena, ArenaError};

#[derive(Debug)]
pub enum StoreError {
    /// The object file for the address could not be opened.
    Open(std::io::Error),

    /// The object file could not be read completely.
    Read(std::io::Error),

    /// There was not enough memory to hold the object file.
    Memory(ArenaError),
}

impl StoreError {
    /// The (negative) errno style code associated with the error.
    pub fn code(&self) -> i32 {
        match self {
            Self::Open(e) | Self::Read(e) => -e.raw_os_error().unwrap_or(libc::EIO),
            Self::Memory(e) => e.code(),
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open(e) => write!(f, "failed to open function object: {e}"),
            Self::Read(e) => write!(f, "failed to read function object: {e}"),
            Self::Memory(e) => write!(f, "failed to allocate memory for function object: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// An object file copied into the data arena.
#[derive(Copy, Clone, Debug)]
pub struct ObjectImage {
    pub base: *const u8,

    /// The number of bytes read from the file.
    pub len: usize,

    /// The number of bytes reserved for the image (page aligned).
    pub capacity: usize,
}

impl ObjectImage {
    /// # Safety
    ///
    /// The arena that the image was loaded into must still be alive.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        std::slice::from_raw_parts(self.base, self.len)
    }
}

/// A directory containing one object file per translated guest function, named using the
/// hexadecimal guest address of the function.
#[derive(Clone, Debug)]
pub struct FunctionStore {
    dir: PathBuf,
}

impl FunctionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, addr: u64) -> PathBuf {
        self.dir.join(format!("{addr:x}"))
    }

    /// Read the object for `addr` into a page aligned buffer allocated from `arena`.
    pub fn load(&self, addr: u64, arena: &mut Arena) -> Result<ObjectImage, StoreError> {
        let path = self.path_for(addr);
        let mut file = std::fs::File::open(&path).map_err(StoreError::Open)?;
        let len = file.metadata().map_err(StoreError::Open)?.len() as usize;

        let capacity = rerun_mem::align_up(len.max(1), page_size());
        let base = arena.alloc(capacity, page_size()).map_err(StoreError::Memory)?;

        // Safety: the buffer was just allocated with `capacity >= len` bytes.
        let buf = unsafe { std::slice::from_raw_parts_mut(base, len) };
        file.read_exact(buf).map_err(StoreError::Read)?;

        tracing::trace!("read {} ({len:#x} bytes) to {:#x}", path.display(), base as usize);
        Ok(ObjectImage { base, len, capacity })
    }
}
