//! Loading and linking of translated function objects.

mod linker;
mod patch;
mod store;


pub use crate::{
    linker::{entry_symbol_name, parse_entry_symbol, ObjectLinker},
    patch::{PatchData, PatchKind},
    store::{FunctionStore, ObjectImage, StoreError},
};

use rerun_mem::{ArenaError, Memory};

/// Symbol name under which the quick (cache-check) dispatch entry point is exposed to objects.
pub const QUICK_DISPATCH_SYMBOL: &str = "rerun_dispatch_quick";

/// Symbol name under which the full (resolving) dispatch entry point is exposed to objects.
pub const FULL_DISPATCH_SYMBOL: &str = "rerun_dispatch_full";

/// Describes the calling convention selected at startup, and the entry points generated code uses
/// to transfer control between translated functions.
#[derive(Clone, Copy)]
pub struct DispatcherInfo {
    /// Runs guest code starting from the target stored in the register file. Never returns.
    pub loop_func: unsafe extern "C" fn(*mut u64) -> !,

    /// Entry point that checks the quick cache before transferring control.
    pub quick_dispatch_func: usize,

    /// Entry point that always resolves the target before transferring control.
    pub full_dispatch_func: usize,

    /// The host register (hardware encoding) that carries patch data into the full dispatcher.
    pub patch_data_reg: u8,
}

impl std::fmt::Debug for DispatcherInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherInfo")
            .field("loop_func", &(self.loop_func as *const u8))
            .field("quick_dispatch_func", &format_args!("{:#x}", self.quick_dispatch_func))
            .field("full_dispatch_func", &format_args!("{:#x}", self.full_dispatch_func))
            .field("patch_data_reg", &self.patch_data_reg)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkError {
    /// No loaded object provides the requested address.
    NotFound,

    /// An object was already registered for this guest address.
    Duplicate(u64),

    /// The object file could not be parsed.
    Parse(object::Error),

    /// The object was built for a different host, or is not a relocatable object.
    BadObject(&'static str),

    /// The object does not define an entry point for the guest address it was loaded for.
    NoEntry(u64),

    /// A relocation referenced a symbol that is not defined by the object or the runtime.
    UndefinedSymbol(String),

    /// A relocation type that the linker does not know how to apply.
    UnsupportedRelocation(String),

    /// The relocated value does not fit in the relocation field.
    Overflow { place: u64, target: u64 },

    /// Allocating memory for the object failed.
    Memory(ArenaError),
}

impl LinkError {
    /// The (negative) errno style code associated with the error.
    pub fn code(&self) -> i32 {
        match self {
            Self::NotFound => -libc::ENOENT,
            Self::Duplicate(_) => -libc::EEXIST,
            Self::Parse(_) | Self::BadObject(_) | Self::NoEntry(_) => -libc::ENOEXEC,
            Self::UndefinedSymbol(_) => -libc::ENOENT,
            Self::UnsupportedRelocation(_) | Self::Overflow { .. } => -libc::EINVAL,
            Self::Memory(e) => e.code(),
        }
    }
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => f.write_str("symbol not found"),
            Self::Duplicate(addr) => write!(f, "object already loaded for {addr:#x}"),
            Self::Parse(e) => write!(f, "failed to parse object: {e}"),
            Self::BadObject(reason) => write!(f, "invalid object: {reason}"),
            Self::NoEntry(addr) => write!(f, "object does not define an entry for {addr:#x}"),
            Self::UndefinedSymbol(name) => write!(f, "undefined symbol: {name}"),
            Self::UnsupportedRelocation(kind) => write!(f, "unsupported relocation: {kind}"),
            Self::Overflow { place, target } => {
                write!(f, "relocation at {place:#x} cannot reach {target:#x}")
            }
            Self::Memory(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for LinkError {}

impl From<ArenaError> for LinkError {
    fn from(value: ArenaError) -> Self {
        Self::Memory(value)
    }
}

pub type LinkResult<T> = Result<T, LinkError>;

/// The symbol table and relocation engine that maps guest addresses to host code.
pub trait Linker {
    /// Returns the host entry point for `addr` if an object providing it has been loaded.
    fn resolve(&mut self, addr: u64) -> LinkResult<u64>;

    /// Link `object` into memory and register it as the provider of `anchor`.
    fn add_object(&mut self, mem: &mut Memory, object: &[u8], anchor: u64) -> LinkResult<()>;

    /// Rewrite the call site described by `patch` so that it transfers directly to `target`.
    fn patch(&mut self, mem: &mut Memory, patch: &PatchData, target: u64) -> LinkResult<()>;

    /// Make a host symbol available to relocations in objects loaded after this call.
    fn define_symbol(&mut self, name: &str, addr: u64);
}
