//! Dispatch using the C calling convention: every guest register lives in the register file, and
//! translated functions take a pointer to it as their only argument.

use rerun_cpu::{ExecutionState, PC_SLOT};
use rerun_rtld::DispatcherInfo;

use crate::resolver::{rerun_resolve, try_resolve, ResolveError};

type TranslatedFn = unsafe extern "C" fn(*mut u64);

/// Get the entry point for `addr`, consulting the quick cache before resolving it.
#[inline]
pub fn lookup_or_resolve(state: &mut ExecutionState, addr: u64) -> Result<u64, ResolveError> {
    match state.quick_cache.lookup(addr) {
        Some(target) => Ok(target),
        None => try_resolve(state, addr, None),
    }
}

/// Execute the guest function stored in the program counter slot of `regs`. Also used by PLT
/// stubs in translated code.
///
/// # Safety
///
/// `regs` must point to the register file of an installed execution state.
pub unsafe extern "C" fn rerun_dispatch_generic(regs: *mut u64) {
    let target = {
        let state = ExecutionState::from_regs(regs);
        let addr = regs.add(PC_SLOT).read();
        match (*state).quick_cache.lookup(addr) {
            Some(target) => target,
            None => rerun_resolve(state, addr, std::ptr::null()),
        }
    };
    let func: TranslatedFn = std::mem::transmute(target as usize);
    func(regs)
}

/// Deliver any pending signal. Called between functions, where the register file is consistent.
#[inline]
unsafe fn poll_signals(regs: *mut u64) {
    let state = &mut *ExecutionState::from_regs(regs);
    let Some(signal) = state.take_pending_signal() else {
        return;
    };
    match state.global_mut().and_then(|global| global.signal_hook) {
        Some(hook) => hook(state, signal),
        None => tracing::warn!("discarding signal {signal} at {:#x}: no handler", state.pc()),
    }
}

/// Run translated code forever.
///
/// # Safety
///
/// `regs` must point to the register file of an installed execution state.
pub unsafe extern "C" fn rerun_dispatch_generic_loop(regs: *mut u64) -> ! {
    loop {
        poll_signals(regs);
        rerun_dispatch_generic(regs);
    }
}

pub fn info() -> DispatcherInfo {
    DispatcherInfo {
        loop_func: rerun_dispatch_generic_loop,
        quick_dispatch_func: rerun_dispatch_generic as usize,
        full_dispatch_func: rerun_dispatch_generic as usize,
        // rsi
        patch_data_reg: 6,
    }
}
