//! Register pinned dispatch for AArch64.
//!
//! `x20` holds the register file base and `x0` the next guest address. `x16` and `x17` are used
//! as scratch registers when checking the quick cache, `x16` carries patch data into the full
//! resolver. Guest slots 1-5, 7 and 8 are kept in `x1`-`x7`.

use std::arch::global_asm;

use rerun_rtld::DispatcherInfo;

use super::{CACHE_FROM_REGS, CACHE_SLOT_MASK};
use crate::resolver::rerun_resolve;

extern "C" {
    fn rerun_dispatch_pinned(regs: *mut u64) -> !;
    fn rerun_dispatch_pinned_tail();
    fn rerun_dispatch_pinned_full();
}

global_asm!(
    r#"
    .p2align 4
    .globl rerun_dispatch_pinned_tail
    .type rerun_dispatch_pinned_tail, %function
rerun_dispatch_pinned_tail:
    add x17, x20, #{cache}
    and x16, x0, #{mask}
    add x17, x17, x16
    ldp x16, x17, [x17]
    cmp x16, x0
    b.ne .Lrerun_tail_miss
    br x17
.Lrerun_tail_miss:
    mov x16, xzr
    b rerun_dispatch_pinned_full
    .size rerun_dispatch_pinned_tail, . - rerun_dispatch_pinned_tail

    .p2align 4
    .globl rerun_dispatch_pinned
    .type rerun_dispatch_pinned, %function
rerun_dispatch_pinned:
    mov x20, x0
    ldr x0, [x20]
    ldr x1, [x20, #0x08]
    ldr x2, [x20, #0x10]
    ldr x3, [x20, #0x18]
    ldr x4, [x20, #0x20]
    ldr x5, [x20, #0x28]
    ldr x6, [x20, #0x38]
    ldr x7, [x20, #0x40]
    b .Lrerun_loop_check

    .p2align 4
.Lrerun_loop_hit:
    blr x17
.Lrerun_loop_check:
    add x17, x20, #{cache}
    and x16, x0, #{mask}
    add x17, x17, x16
    ldp x16, x17, [x17]
    cmp x16, x0
    b.eq .Lrerun_loop_hit
    mov x16, xzr
    bl rerun_dispatch_pinned_full
    b .Lrerun_loop_check
    .size rerun_dispatch_pinned, . - rerun_dispatch_pinned

    .p2align 4
    .globl rerun_dispatch_pinned_full
    .type rerun_dispatch_pinned_full, %function
rerun_dispatch_pinned_full:
    sub sp, sp, #0x290
    stp x18, x30, [sp]
    stp x0, x1, [sp, #0x10]
    stp x2, x3, [sp, #0x20]
    stp x4, x5, [sp, #0x30]
    stp x6, x7, [sp, #0x40]
    stp x8, x9, [sp, #0x50]
    stp x10, x11, [sp, #0x60]
    stp x12, x13, [sp, #0x70]
    stp x14, x15, [sp, #0x80]
    stp q0, q1, [sp, #0x90]
    stp q2, q3, [sp, #0xb0]
    stp q4, q5, [sp, #0xd0]
    stp q6, q7, [sp, #0xf0]
    stp q8, q9, [sp, #0x110]
    stp q10, q11, [sp, #0x130]
    stp q12, q13, [sp, #0x150]
    stp q14, q15, [sp, #0x170]
    stp q16, q17, [sp, #0x190]
    stp q18, q19, [sp, #0x1b0]
    stp q20, q21, [sp, #0x1d0]
    stp q22, q23, [sp, #0x1f0]
    stp q24, q25, [sp, #0x210]
    stp q26, q27, [sp, #0x230]
    stp q28, q29, [sp, #0x250]
    stp q30, q31, [sp, #0x270]

    mov x1, x0
    sub x0, x20, #{regs}
    mov x2, x16
    bl {resolve}
    mov x16, x0

    ldp x18, x30, [sp]
    ldp x0, x1, [sp, #0x10]
    ldp x2, x3, [sp, #0x20]
    ldp x4, x5, [sp, #0x30]
    ldp x6, x7, [sp, #0x40]
    ldp x8, x9, [sp, #0x50]
    ldp x10, x11, [sp, #0x60]
    ldp x12, x13, [sp, #0x70]
    ldp x14, x15, [sp, #0x80]
    ldp q0, q1, [sp, #0x90]
    ldp q2, q3, [sp, #0xb0]
    ldp q4, q5, [sp, #0xd0]
    ldp q6, q7, [sp, #0xf0]
    ldp q8, q9, [sp, #0x110]
    ldp q10, q11, [sp, #0x130]
    ldp q12, q13, [sp, #0x150]
    ldp q14, q15, [sp, #0x170]
    ldp q16, q17, [sp, #0x190]
    ldp q18, q19, [sp, #0x1b0]
    ldp q20, q21, [sp, #0x1d0]
    ldp q22, q23, [sp, #0x1f0]
    ldp q24, q25, [sp, #0x210]
    ldp q26, q27, [sp, #0x230]
    ldp q28, q29, [sp, #0x250]
    ldp q30, q31, [sp, #0x270]
    add sp, sp, #0x290
    br x16
    .size rerun_dispatch_pinned_full, . - rerun_dispatch_pinned_full
"#,
    regs = const rerun_cpu::REGS_OFFSET,
    cache = const CACHE_FROM_REGS,
    mask = const CACHE_SLOT_MASK,
    resolve = sym rerun_resolve,
);

pub(super) fn info() -> DispatcherInfo {
    DispatcherInfo {
        loop_func: rerun_dispatch_pinned,
        quick_dispatch_func: rerun_dispatch_pinned_tail as usize,
        full_dispatch_func: rerun_dispatch_pinned_full as usize,
        // x16
        patch_data_reg: 16,
    }
}

pub(super) fn symbols() -> [(&'static str, usize); 2] {
    [
        ("rerun_dispatch_pinned_tail", rerun_dispatch_pinned_tail as usize),
        ("rerun_dispatch_pinned_full", rerun_dispatch_pinned_full as usize),
    ]
}
