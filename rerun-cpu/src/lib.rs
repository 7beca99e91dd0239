//! The guest execution context shared between the runtime and translated code.

pub mod cache;
pub mod config;
mod global;
mod state;


pub use crate::{
    cache::{QuickCache, QuickCacheEntry, QUICK_CACHE_BITS, QUICK_CACHE_ENTRIES, QUICK_CACHE_SHIFT},
    config::{parse_u64_with_prefix, DispatchKind, RuntimeConfig},
    global::{GlobalState, SavedSigAction, SignalHook, Stats, NSIG},
    state::{
        ExecutionState, RegisterFile, PC_SLOT, QUICK_CACHE_OFFSET, REGS_OFFSET, REGS_SIZE, SP_SLOT,
    },
};

pub use rerun_mem as mem;
pub use rerun_rtld as rtld;
