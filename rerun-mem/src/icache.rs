//! Instruction cache maintenance after writing code.

/// Ensure that instructions written to `[start, start + len)` are observed by instruction fetch.
///
/// Must be called after writing code and before control transfers into it.
#[cfg(target_arch = "aarch64")]
pub fn flush_icache(start: *const u8, len: usize) {
    use std::arch::asm;

    if len == 0 {
        return;
    }

    let ctr: u64;
    // Safety: CTR_EL0 is readable from EL0 on Linux.
    unsafe { asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack)) };
    let dline = 4_usize << ((ctr >> 16) & 0xf);
    let iline = 4_usize << (ctr & 0xf);

    let start = start as usize;
    let end = start + len;

    // Safety: cache maintenance by VA only requires the address to be mapped.
    unsafe {
        let mut addr = start & !(dline - 1);
        while addr < end {
            asm!("dc cvau, {}", in(reg) addr, options(nostack));
            addr += dline;
        }
        asm!("dsb ish", options(nostack));

        let mut addr = start & !(iline - 1);
        while addr < end {
            asm!("ic ivau, {}", in(reg) addr, options(nostack));
            addr += iline;
        }
        asm!("dsb ish", "isb", options(nostack));
    }
}

/// x86 keeps the instruction cache coherent with data writes.
#[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
#[inline(always)]
pub fn flush_icache(_start: *const u8, _len: usize) {}

#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64", target_arch = "x86")))]
compile_error!("instruction cache maintenance is not implemented for the current target");
