//! Register pinned dispatch for x86-64.
//!
//! Guest registers stay in host registers across calls:
//!
//! | host   | use                                  |
//! |--------|--------------------------------------|
//! | `r12`  | register file base                   |
//! | `rbx`  | next guest address (slot 0)          |
//! | `r14`  | cache slot scratch / patch data      |
//! | `rax`, `rcx`, `rdx`, `rbp`, `r15`, `r13`, `rsi`, `rdi`, `r8`-`r11` | slots 1-12 |
//!
//! A miss saves every caller-saved register (including the vector registers) before calling into
//! the resolver.

use std::arch::global_asm;

use rerun_rtld::DispatcherInfo;

use super::{CACHE_FROM_REGS, CACHE_SLOT_MASK};
use crate::resolver::rerun_resolve;

extern "C" {
    fn rerun_dispatch_pinned(regs: *mut u64) -> !;
    fn rerun_dispatch_pinned_tail();
    fn rerun_dispatch_pinned_call();
    fn rerun_dispatch_pinned_full();
}

global_asm!(
    r#"
    .p2align 4
    .globl rerun_dispatch_pinned_full
    .type rerun_dispatch_pinned_full, @function
rerun_dispatch_pinned_full:
    push rbp
    mov rbp, rsp
    push rax
    push rcx
    push rdx
    push rsi
    push rdi
    push r8
    push r9
    push r10
    push r11
    and rsp, -16
    sub rsp, 0x100
    movdqa [rsp + 0x00], xmm0
    movdqa [rsp + 0x10], xmm1
    movdqa [rsp + 0x20], xmm2
    movdqa [rsp + 0x30], xmm3
    movdqa [rsp + 0x40], xmm4
    movdqa [rsp + 0x50], xmm5
    movdqa [rsp + 0x60], xmm6
    movdqa [rsp + 0x70], xmm7
    movdqa [rsp + 0x80], xmm8
    movdqa [rsp + 0x90], xmm9
    movdqa [rsp + 0xa0], xmm10
    movdqa [rsp + 0xb0], xmm11
    movdqa [rsp + 0xc0], xmm12
    movdqa [rsp + 0xd0], xmm13
    movdqa [rsp + 0xe0], xmm14
    movdqa [rsp + 0xf0], xmm15

    mov rdi, [r12 - {regs}]
    mov rsi, rbx
    mov rdx, r14
    call {resolve}
    mov r14, rax

    movdqa xmm0, [rsp + 0x00]
    movdqa xmm1, [rsp + 0x10]
    movdqa xmm2, [rsp + 0x20]
    movdqa xmm3, [rsp + 0x30]
    movdqa xmm4, [rsp + 0x40]
    movdqa xmm5, [rsp + 0x50]
    movdqa xmm6, [rsp + 0x60]
    movdqa xmm7, [rsp + 0x70]
    movdqa xmm8, [rsp + 0x80]
    movdqa xmm9, [rsp + 0x90]
    movdqa xmm10, [rsp + 0xa0]
    movdqa xmm11, [rsp + 0xb0]
    movdqa xmm12, [rsp + 0xc0]
    movdqa xmm13, [rsp + 0xd0]
    movdqa xmm14, [rsp + 0xe0]
    movdqa xmm15, [rsp + 0xf0]
    lea rsp, [rbp - 0x48]
    pop r11
    pop r10
    pop r9
    pop r8
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rax
    pop rbp
    jmp r14
    .size rerun_dispatch_pinned_full, . - rerun_dispatch_pinned_full

    .p2align 4
    .globl rerun_dispatch_pinned_tail
    .type rerun_dispatch_pinned_tail, @function
rerun_dispatch_pinned_tail:
    mov r14, rbx
    and r14, {mask}
    cmp rbx, [r12 + r14 + {cache}]
    jne .Lrerun_tail_miss
    jmp qword ptr [r12 + r14 + {cache} + 8]
.Lrerun_tail_miss:
    xor r14d, r14d
    jmp rerun_dispatch_pinned_full
    .size rerun_dispatch_pinned_tail, . - rerun_dispatch_pinned_tail

    .p2align 4
    .globl rerun_dispatch_pinned_call
    .type rerun_dispatch_pinned_call, @function
rerun_dispatch_pinned_call:
    mov r14, rbx
    and r14, {mask}
    cmp rbx, [r12 + r14 + {cache}]
    jne .Lrerun_call_miss
    call qword ptr [r12 + r14 + {cache} + 8]
    ret
.Lrerun_call_miss:
    xor r14d, r14d
    call rerun_dispatch_pinned_full
    ret
    .size rerun_dispatch_pinned_call, . - rerun_dispatch_pinned_call

    .p2align 4
    .globl rerun_dispatch_pinned
    .type rerun_dispatch_pinned, @function
rerun_dispatch_pinned:
    and rsp, -16
    mov r12, rdi
    mov rbx, [r12 + 0x00]
    mov rax, [r12 + 0x08]
    mov rcx, [r12 + 0x10]
    mov rdx, [r12 + 0x18]
    mov rbp, [r12 + 0x20]
    mov r15, [r12 + 0x28]
    mov r13, [r12 + 0x30]
    mov rsi, [r12 + 0x38]
    mov rdi, [r12 + 0x40]
    mov r8, [r12 + 0x48]
    mov r9, [r12 + 0x50]
    mov r10, [r12 + 0x58]
    mov r11, [r12 + 0x60]
    jmp .Lrerun_loop_miss

    .p2align 4
.Lrerun_loop_hit:
    call qword ptr [r12 + r14 + {cache} + 8]
.Lrerun_loop_check:
    mov r14, rbx
    and r14, {mask}
    cmp rbx, [r12 + r14 + {cache}]
    je .Lrerun_loop_hit
.Lrerun_loop_miss:
    xor r14d, r14d
    call rerun_dispatch_pinned_full
    jmp .Lrerun_loop_check
    .size rerun_dispatch_pinned, . - rerun_dispatch_pinned
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
        // r14
        patch_data_reg: 14,
    }
}

pub(super) fn symbols() -> [(&'static str, usize); 3] {
    [
        ("rerun_dispatch_pinned_tail", rerun_dispatch_pinned_tail as usize),
        ("rerun_dispatch_pinned_call", rerun_dispatch_pinned_call as usize),
        ("rerun_dispatch_pinned_full", rerun_dispatch_pinned_full as usize),
    ]
}
