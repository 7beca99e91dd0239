use std::sync::atomic::{AtomicI32, Ordering};

use memoffset::offset_of;

use crate::{cache::QuickCache, GlobalState};

/// Offset of the register file from the start of [ExecutionState].
pub const REGS_OFFSET: usize = 0x40;

/// Size in bytes of the guest register file.
pub const REGS_SIZE: usize = 0x400;

/// Offset of the quick cache from the start of [ExecutionState].
pub const QUICK_CACHE_OFFSET: usize = 0x440;

/// Register file slot holding the address of the next guest function to execute.
pub const PC_SLOT: usize = 0;

/// Register file slot holding the guest stack pointer.
pub const SP_SLOT: usize = 33;

const NUM_SLOTS: usize = REGS_SIZE / 8;

/// The guest register image. Translated code addresses registers using fixed offsets into this
/// buffer.
#[repr(C, align(64))]
pub struct RegisterFile([u8; REGS_SIZE]);

impl Default for RegisterFile {
    fn default() -> Self {
        Self([0; REGS_SIZE])
    }
}

impl RegisterFile {
    #[inline(always)]
    pub fn slots(&self) -> &[u64] {
        bytemuck::cast_slice(&self.0)
    }

    #[inline(always)]
    pub fn slots_mut(&mut self) -> &mut [u64] {
        bytemuck::cast_slice_mut(&mut self.0)
    }

    #[inline]
    pub fn get(&self, slot: usize) -> u64 {
        self.slots()[slot]
    }

    #[inline]
    pub fn set(&mut self, slot: usize, value: u64) {
        self.slots_mut()[slot] = value;
    }

    pub fn as_mut_ptr(&mut self) -> *mut u64 {
        self.0.as_mut_ptr().cast()
    }
}

impl std::fmt::Debug for RegisterFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut list = f.debug_map();
        for (i, value) in self.slots().iter().enumerate().filter(|(_, x)| **x != 0) {
            list.entry(&i, &format_args!("{value:#x}"));
        }
        list.finish()
    }
}

/// The state of the (single) guest thread.
///
/// Translated code only holds a pointer to `regs`, and recovers the rest of the structure using the
/// fixed offsets defined above, so the layout must not change without regenerating every function
/// object.
#[repr(C, align(64))]
pub struct ExecutionState {
    /// Points to this structure.
    pub self_ptr: *mut ExecutionState,

    /// The runtime state this thread belongs to.
    pub global: *mut GlobalState,

    _reserved: [usize; 6],

    pub regs: RegisterFile,

    pub quick_cache: QuickCache,

    /// The signal number of a signal waiting to be delivered to the guest, or zero.
    pub pending_signal: AtomicI32,

    pub signal_mask: libc::sigset_t,

    pub alternate_stack: libc::stack_t,

    pub last_signal_info: libc::siginfo_t,
}

const _: () = {
    assert!(offset_of!(ExecutionState, self_ptr) == 0);
    assert!(offset_of!(ExecutionState, global) == 8);
    assert!(offset_of!(ExecutionState, regs) == REGS_OFFSET);
    assert!(offset_of!(ExecutionState, quick_cache) == QUICK_CACHE_OFFSET);
    assert!(std::mem::size_of::<RegisterFile>() == REGS_SIZE);
    assert!(PC_SLOT < NUM_SLOTS && SP_SLOT < NUM_SLOTS);
};

impl ExecutionState {
    /// Recover the execution state from a pointer to its register file.
    ///
    /// # Safety
    ///
    /// `regs` must point to the `regs` field of an [ExecutionState].
    #[inline(always)]
    pub unsafe fn from_regs(regs: *mut u64) -> *mut ExecutionState {
        regs.cast::<u8>().sub(REGS_OFFSET).cast()
    }

    /// Initialize a zeroed execution state in place.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes, aligned, and zero initialized.
    pub unsafe fn init(ptr: *mut ExecutionState, global: *mut GlobalState) {
        (*ptr).self_ptr = ptr;
        (*ptr).global = global;
    }

    #[inline]
    pub fn regs_ptr(&mut self) -> *mut u64 {
        self.regs.as_mut_ptr()
    }

    #[inline]
    pub fn pc(&self) -> u64 {
        self.regs.get(PC_SLOT)
    }

    #[inline]
    pub fn set_pc(&mut self, value: u64) {
        self.regs.set(PC_SLOT, value)
    }

    #[inline]
    pub fn sp(&self) -> u64 {
        self.regs.get(SP_SLOT)
    }

    #[inline]
    pub fn set_sp(&mut self, value: u64) {
        self.regs.set(SP_SLOT, value)
    }

    /// # Safety
    ///
    /// The global state must outlive the returned reference, and must not be aliased.
    #[inline]
    pub unsafe fn global_mut<'a>(&self) -> Option<&'a mut GlobalState> {
        self.global.as_mut()
    }

    /// Record `signal` for delivery at the next safe point. Async signal safe.
    pub fn raise_signal(&self, signal: i32) {
        self.pending_signal.store(signal, Ordering::Release);
    }

    /// Take the pending signal (if any), clearing it.
    #[inline]
    pub fn take_pending_signal(&self) -> Option<i32> {
        if self.pending_signal.load(Ordering::Relaxed) == 0 {
            return None;
        }
        match self.pending_signal.swap(0, Ordering::Acquire) {
            0 => None,
            signal => Some(signal),
        }
    }

    /// Make `this` reachable from the host context register used by translated code that calls
    /// back into the runtime.
    ///
    /// # Safety
    ///
    /// `this` must remain valid for the rest of the lifetime of the current thread.
    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    pub unsafe fn install(this: *mut ExecutionState) -> std::io::Result<()> {
        const ARCH_SET_GS: libc::c_long = 0x1001;
        if libc::syscall(libc::SYS_arch_prctl, ARCH_SET_GS, this as usize) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        tracing::debug!("execution state installed at {:#x}", this as usize);
        Ok(())
    }

    /// Make `this` reachable from the host context register used by translated code that calls
    /// back into the runtime.
    ///
    /// # Safety
    ///
    /// `this` must remain valid for the rest of the lifetime of the current thread.
    #[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
    pub unsafe fn install(this: *mut ExecutionState) -> std::io::Result<()> {
        // The pinned dispatch register is the only context register on this host.
        tracing::debug!("execution state at {:#x}", this as usize);
        Ok(())
    }

    /// Returns the execution state previously registered with [ExecutionState::install].
    #[cfg(all(test, target_arch = "x86_64", target_os = "linux"))]
    pub fn installed() -> Option<*mut ExecutionState> {
        const ARCH_GET_GS: libc::c_long = 0x1004;
        let mut value: usize = 0;
        let result = unsafe {
            libc::syscall(libc::SYS_arch_prctl, ARCH_GET_GS, &mut value as *mut usize)
        };
        (result == 0 && value != 0).then_some(value as *mut ExecutionState)
    }
}
