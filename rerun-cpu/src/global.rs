use rerun_mem::{ArenaResult, Memory};
use rerun_rtld::{DispatcherInfo, FunctionStore, Linker};

use crate::ExecutionState;

/// The number of signal dispositions tracked for the guest.
pub const NSIG: usize = 64;

/// A guest signal disposition, saved when the guest installs a handler.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SavedSigAction {
    pub handler: u64,
    pub flags: u64,
    pub restorer: u64,
    pub mask: u64,
}

/// Called by the generic dispatch loop for each signal observed at a safe point.
pub type SignalHook = fn(&mut ExecutionState, i32);

#[derive(Debug, Default, Clone)]
pub struct Stats {
    /// Total time (in nanoseconds) spent in the linker and loading function objects.
    pub resolve_ns: u64,

    /// Number of times the resolver was invoked.
    pub resolutions: u64,

    /// Number of function objects loaded from the store.
    pub objects_loaded: u64,

    /// Number of call sites rewritten to skip dispatch.
    pub patched_sites: u64,
}

/// Runtime wide state, shared by the execution state and the resolver.
pub struct GlobalState {
    pub linker: Box<dyn Linker>,
    pub store: FunctionStore,
    pub memory: Memory,
    pub dispatcher: DispatcherInfo,
    pub sigactions: [SavedSigAction; NSIG],
    pub signal_hook: Option<SignalHook>,
    pub stats: Stats,
}

impl GlobalState {
    pub fn new(
        linker: Box<dyn Linker>,
        store: FunctionStore,
        memory: Memory,
        dispatcher: DispatcherInfo,
    ) -> Box<Self> {
        Box::new(Self {
            linker,
            store,
            memory,
            dispatcher,
            sigactions: [SavedSigAction::default(); NSIG],
            signal_hook: None,
            stats: Stats::default(),
        })
    }

    /// Allocate a zeroed execution state from the data arena, linked to this global state.
    ///
    /// The global state must not move while the execution state is in use (it is boxed by
    /// [GlobalState::new]).
    pub fn new_execution_state(&mut self) -> ArenaResult<*mut ExecutionState> {
        let ptr = self.memory.data.alloc_zeroed::<ExecutionState>()?;
        // Safety: `alloc_zeroed` returns zeroed memory with the correct size and alignment.
        unsafe { ExecutionState::init(ptr, self) };
        tracing::debug!("allocated execution state at {:#x}", ptr as usize);
        Ok(ptr)
    }

    pub fn sigaction(&self, signal: i32) -> Option<&SavedSigAction> {
        self.sigactions.get(usize::try_from(signal).ok()?.checked_sub(1)?)
    }

    /// Replace the saved disposition for `signal`, returning the previous one.
    pub fn set_sigaction(&mut self, signal: i32, action: SavedSigAction) -> Option<SavedSigAction> {
        let slot = self.sigactions.get_mut(usize::try_from(signal).ok()?.checked_sub(1)?)?;
        Some(std::mem::replace(slot, action))
    }

    /// Log a summary of the time spent in the resolver.
    pub fn log_stats(&self) {
        tracing::info!(
            "resolver: {} calls, {} objects loaded, {} sites patched, {:.3} ms resolving",
            self.stats.resolutions,
            self.stats.objects_loaded,
            self.stats.patched_sites,
            self.stats.resolve_ns as f64 / 1_000_000.0
        );
    }
}
