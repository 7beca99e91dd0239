//! Construction of the initial guest stack.

use anyhow::Context;

use crate::loader::GuestImage;

pub const AT_NULL: u64 = 0;
pub const AT_PHDR: u64 = 3;
pub const AT_PHENT: u64 = 4;
pub const AT_PHNUM: u64 = 5;
pub const AT_PAGESZ: u64 = 6;
pub const AT_ENTRY: u64 = 9;
pub const AT_UID: u64 = 11;
pub const AT_EUID: u64 = 12;
pub const AT_GID: u64 = 13;
pub const AT_EGID: u64 = 14;
pub const AT_PLATFORM: u64 = 15;
pub const AT_HWCAP: u64 = 16;
pub const AT_CLKTCK: u64 = 17;
pub const AT_SECURE: u64 = 23;
pub const AT_RANDOM: u64 = 25;
pub const AT_HWCAP2: u64 = 26;

/// A downwards growing stack backed by a byte buffer that is mapped at `base` in the guest.
pub struct StackBuilder<'a> {
    mem: &'a mut [u8],
    base: u64,
    top: usize,
}

impl<'a> StackBuilder<'a> {
    pub fn new(mem: &'a mut [u8], base: u64) -> Self {
        let top = mem.len();
        Self { mem, base, top }
    }

    /// The guest address of the current top of the stack.
    pub fn sp(&self) -> u64 {
        self.base + self.top as u64
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> anyhow::Result<u64> {
        let top = self.top.checked_sub(bytes.len()).context("stack overflow")?;
        self.mem[top..self.top].copy_from_slice(bytes);
        self.top = top;
        Ok(self.sp())
    }

    pub fn push_cstr(&mut self, value: &[u8]) -> anyhow::Result<u64> {
        anyhow::ensure!(!value.contains(&0), "string contains a null byte");
        self.push_bytes(&[0])?;
        self.push_bytes(value)
    }

    pub fn push_u64(&mut self, value: u64) -> anyhow::Result<u64> {
        self.push_bytes(&value.to_le_bytes())
    }

    /// Align the stack pointer down to `align` bytes.
    pub fn align(&mut self, align: u64) -> anyhow::Result<()> {
        let sp = self.sp() & !(align - 1);
        self.top = self.top.checked_sub((self.sp() - sp) as usize).context("stack overflow")?;
        Ok(())
    }
}

/// Host values exposed to the guest through the auxiliary vector.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub platform: String,
    pub hwcap: u64,
    pub random: [u8; 16],
    pub page_size: u64,
    pub clock_ticks: u64,
    pub uid: u64,
    pub euid: u64,
    pub gid: u64,
    pub egid: u64,
}

impl HostInfo {
    pub fn current() -> Self {
        let getauxval = |key: u64| unsafe { libc::getauxval(key as libc::c_ulong) as u64 };
        let hwcap = match target_lexicon::HOST.architecture {
            target_lexicon::Architecture::X86_64 => 0x8001,
            _ => getauxval(AT_HWCAP),
        };

        let mut random = [0; 16];
        let host_random = getauxval(AT_RANDOM) as *const [u8; 16];
        if !host_random.is_null() {
            // Safety: the kernel guarantees `AT_RANDOM` points to 16 bytes.
            random = unsafe { host_random.read_unaligned() };
        }

        Self {
            platform: target_lexicon::HOST.architecture.to_string(),
            hwcap,
            random,
            page_size: rerun_mem::page_size() as u64,
            clock_ticks: getauxval(AT_CLKTCK),
            uid: getauxval(AT_UID),
            euid: getauxval(AT_EUID),
            gid: getauxval(AT_GID),
            egid: getauxval(AT_EGID),
        }
    }
}

/// Build the process entry stack expected by the SysV ABI: `argc`, the `argv` and `envp`
/// pointer vectors (each null terminated) and the auxiliary vector. Returns the initial stack
/// pointer, which is 16 byte aligned.
pub fn build_initial_stack(
    stack: &mut StackBuilder,
    argv: &[&[u8]],
    envp: &[&[u8]],
    image: &GuestImage,
    host: &HostInfo,
) -> anyhow::Result<u64> {
    let mut arg_ptrs = vec![];
    for arg in argv {
        arg_ptrs.push(stack.push_cstr(arg)?);
    }
    let mut env_ptrs = vec![];
    for var in envp {
        env_ptrs.push(stack.push_cstr(var)?);
    }
    let platform = stack.push_cstr(host.platform.as_bytes())?;
    stack.align(16)?;
    let random = stack.push_bytes(&host.random)?;

    let auxv = [
        (AT_ENTRY, image.entry),
        (AT_PHDR, image.phdr),
        (AT_PHENT, image.phent),
        (AT_PHNUM, image.phnum),
        (AT_PLATFORM, platform),
        (AT_RANDOM, random),
        (AT_UID, host.uid),
        (AT_EUID, host.euid),
        (AT_GID, host.gid),
        (AT_EGID, host.egid),
        (AT_CLKTCK, host.clock_ticks),
        (AT_PAGESZ, host.page_size),
        (AT_HWCAP, host.hwcap),
        (AT_HWCAP2, 0),
        (AT_SECURE, 0),
        (AT_NULL, 0),
    ];

    // Pad so that the stack pointer is aligned once everything is pushed.
    let words = 1 + (arg_ptrs.len() + 1) + (env_ptrs.len() + 1) + 2 * auxv.len();
    stack.align(16)?;
    if words % 2 == 1 {
        stack.push_u64(0)?;
    }

    for (key, value) in auxv.iter().rev() {
        stack.push_u64(*value)?;
        stack.push_u64(*key)?;
    }
    stack.push_u64(0)?;
    for ptr in env_ptrs.iter().rev() {
        stack.push_u64(*ptr)?;
    }
    stack.push_u64(0)?;
    for ptr in arg_ptrs.iter().rev() {
        stack.push_u64(*ptr)?;
    }
    let sp = stack.push_u64(arg_ptrs.len() as u64)?;

    debug_assert_eq!(sp % 16, 0);
    Ok(sp)
}

/// A stack mapped for the guest, with a guard page at the bottom.
pub struct GuestStack {
    base: *mut u8,
    size: usize,
}

impl GuestStack {
    pub fn map(size: usize) -> anyhow::Result<Self> {
        let page_size = rerun_mem::page_size();
        let size = rerun_mem::align_up(size.max(2 * page_size), page_size);
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error()).context("failed to map guest stack");
        }
        if unsafe { libc::mprotect(base, page_size, libc::PROT_NONE) } != 0 {
            return Err(std::io::Error::last_os_error()).context("failed to map stack guard page");
        }
        tracing::debug!("guest stack at {:#x}..{:#x}", base as usize, base as usize + size);
        Ok(Self { base: base.cast(), size })
    }

    /// Returns a builder over the usable (non-guard) part of the stack.
    pub fn builder(&mut self) -> StackBuilder<'_> {
        let page_size = rerun_mem::page_size();
        // Safety: everything above the guard page is mapped read/write and owned by `self`.
        let mem = unsafe {
            std::slice::from_raw_parts_mut(self.base.add(page_size), self.size - page_size)
        };
        StackBuilder::new(mem, self.base as u64 + page_size as u64)
    }
}

impl Drop for GuestStack {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base.cast(), self.size) };
    }
}
