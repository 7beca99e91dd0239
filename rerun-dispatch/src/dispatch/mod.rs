//! Calling conventions used to transfer control between translated functions.

pub mod generic;

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
mod x86_64;

#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
mod aarch64;

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
use self::x86_64 as pinned;

#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
use self::aarch64 as pinned;

use rerun_cpu::{
    DispatchKind, QUICK_CACHE_ENTRIES, QUICK_CACHE_OFFSET, QUICK_CACHE_SHIFT, REGS_OFFSET,
};
use rerun_rtld::DispatcherInfo;

/// Offset of the quick cache relative to the register file pointer.
#[allow(unused)]
const CACHE_FROM_REGS: usize = QUICK_CACHE_OFFSET - REGS_OFFSET;

/// Mask that converts an address to the byte offset of its quick cache slot.
#[allow(unused)]
const CACHE_SLOT_MASK: u64 = ((QUICK_CACHE_ENTRIES as u64) - 1) << QUICK_CACHE_SHIFT;

const _: () = assert!(QUICK_CACHE_SHIFT == 4, "slot offsets assume 16 byte entries");

/// Returns whether the pinned convention is implemented for the host.
pub const fn pinned_supported() -> bool {
    cfg!(all(any(target_arch = "x86_64", target_arch = "aarch64"), target_os = "linux"))
}

/// Get the dispatcher descriptor for `kind`, falling back to the generic convention if the host
/// has no pinned implementation.
pub fn get(kind: DispatchKind) -> DispatcherInfo {
    match kind {
        DispatchKind::Generic => generic::info(),
        DispatchKind::Pinned => pinned_info().unwrap_or_else(|| {
            tracing::warn!("pinned dispatch is not supported on this host, using generic");
            generic::info()
        }),
    }
}

#[cfg(all(any(target_arch = "x86_64", target_arch = "aarch64"), target_os = "linux"))]
fn pinned_info() -> Option<DispatcherInfo> {
    Some(pinned::info())
}

#[cfg(not(all(any(target_arch = "x86_64", target_arch = "aarch64"), target_os = "linux")))]
fn pinned_info() -> Option<DispatcherInfo> {
    None
}

/// Additional runtime entry points made available to function objects.
pub fn runtime_symbols(kind: DispatchKind) -> Vec<(&'static str, usize)> {
    let mut symbols = vec![("rerun_dispatch_generic", generic::rerun_dispatch_generic as usize)];
    if kind == DispatchKind::Pinned {
        #[cfg(all(any(target_arch = "x86_64", target_arch = "aarch64"), target_os = "linux"))]
        symbols.extend_from_slice(&pinned::symbols());
    }
    symbols
}
