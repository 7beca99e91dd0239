use std::time::Instant;

use rerun_cpu::{ExecutionState, GlobalState, QuickCache};
use rerun_rtld::{LinkError, PatchData, PatchKind, StoreError};

#[derive(Debug)]
pub enum ResolveError {
    /// Address zero was dispatched.
    InvalidAddress,

    /// The execution state is not attached to a runtime.
    Detached,

    /// The function object could not be read from the store.
    Store(StoreError),

    /// The linker rejected the function object.
    Link(LinkError),

    /// The object was linked but does not provide the requested address.
    Unresolved,
}

impl ResolveError {
    /// The (negative) errno style code associated with the error, used as the exit status when
    /// resolution fails.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidAddress => -libc::EFAULT,
            Self::Detached => -libc::EINVAL,
            Self::Store(e) => e.code(),
            Self::Link(e) => e.code(),
            Self::Unresolved => -libc::ENOENT,
        }
    }
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidAddress => f.write_str("invalid address"),
            Self::Detached => f.write_str("execution state has no runtime"),
            Self::Store(e) => e.fmt(f),
            Self::Link(e) => e.fmt(f),
            Self::Unresolved => f.write_str("object does not provide the address"),
        }
    }
}

impl std::error::Error for ResolveError {}

/// Resolve `addr` (or the target described by `patch`) to a host entry point, loading its
/// function object if necessary, and update the quick cache.
pub fn try_resolve(
    state: &mut ExecutionState,
    addr: u64,
    patch: Option<&PatchData>,
) -> Result<u64, ResolveError> {
    // Safety: the global state is allocated before, and outlives, every execution state.
    let global = unsafe { state.global_mut() }.ok_or(ResolveError::Detached)?;
    resolve_with(global, &mut state.quick_cache, addr, patch)
}

pub(crate) fn resolve_with(
    global: &mut GlobalState,
    cache: &mut QuickCache,
    addr: u64,
    patch: Option<&PatchData>,
) -> Result<u64, ResolveError> {
    let addr = patch.map_or(addr, |patch| patch.sym_addr);
    if addr == 0 {
        return Err(ResolveError::InvalidAddress);
    }
    global.stats.resolutions += 1;

    let start = Instant::now();
    let target = match global.linker.resolve(addr) {
        Ok(target) => target,
        Err(LinkError::NotFound) => load_object(global, addr)?,
        Err(e) => return Err(ResolveError::Link(e)),
    };
    global.stats.resolve_ns += start.elapsed().as_nanos() as u64;

    if let Some(patch) = patch.filter(|patch| patch.kind() != Some(PatchKind::None)) {
        match global.linker.patch(&mut global.memory, patch, target) {
            Ok(()) => {
                tracing::trace!("patched {:#x} -> {target:#x} ({addr:#x})", patch.patch_addr);
                global.stats.patched_sites += 1;
            }
            Err(e) => tracing::debug!("unable to patch {:#x} for {addr:#x}: {e}", patch.patch_addr),
        }
    }

    tracing::trace!("quick cache[{}] = {addr:#x} -> {target:#x}", QuickCache::index(addr));
    cache.update(addr, target);

    Ok(target)
}

fn load_object(global: &mut GlobalState, addr: u64) -> Result<u64, ResolveError> {
    let start = Instant::now();
    let image = global.store.load(addr, &mut global.memory.data).map_err(ResolveError::Store)?;
    // Safety: the image was allocated from the data arena, which lives as long as `global`.
    let object = unsafe { image.as_slice() };
    global.linker.add_object(&mut global.memory, object, addr).map_err(ResolveError::Link)?;
    let target = global.linker.resolve(addr).map_err(|_| ResolveError::Unresolved)?;

    global.stats.objects_loaded += 1;
    tracing::debug!(
        "loaded {addr:#x} ({:#x} bytes) in {} ns, entry={target:#x}",
        image.len,
        start.elapsed().as_nanos()
    );

    Ok(target)
}

/// Resolver entry point called by the dispatch sequences on a quick cache miss. Never returns on
/// failure: the process exits with the negated error code.
///
/// # Safety
///
/// `state` must point to a valid execution state, and `patch` must either be null or point to
/// valid patch data.
pub unsafe extern "C" fn rerun_resolve(
    state: *mut ExecutionState,
    addr: u64,
    patch: *const PatchData,
) -> u64 {
    let patch = patch.as_ref();
    let addr = patch.map_or(addr, |patch| patch.sym_addr);
    match try_resolve(&mut *state, addr, patch) {
        Ok(target) => target,
        Err(e) => resolve_failed(addr, e),
    }
}

#[cold]
#[inline(never)]
fn resolve_failed(addr: u64, err: ResolveError) -> ! {
    let code = err.code();
    tracing::error!("error resolving address {addr:#x}: {err}");
    eprintln!("error resolving address {addr:x}: {}", -code);
    std::process::exit(code)
}
