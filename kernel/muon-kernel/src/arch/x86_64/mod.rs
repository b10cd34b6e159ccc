//! x86_64 context switching.
//!
//! The assembly stores and loads the fields of
//! [`CpuContext`](muon_sched::CpuContext) at the offsets pinned by the
//! `static_assert`s next to that struct. Saving records a resume point
//! after the switch, so a thread switched out mid-`yield` wakes up
//! returning from `__muon_context_switch` as if nothing happened; a fresh
//! thread instead enters at its trampoline with the flags image (IF set)
//! the context was created with.

use muon_sched::CpuContext;

core::arch::global_asm!(
    r#"
.global __muon_context_switch
.p2align 4
__muon_context_switch:
    // Save the outgoing thread: callee-saved registers, stack, resume
    // point, flags. rdi = prev, rsi = next.
    mov [rdi + 0x00], rsp
    mov [rdi + 0x08], rbp
    mov [rdi + 0x10], rbx
    mov [rdi + 0x18], r12
    mov [rdi + 0x20], r13
    mov [rdi + 0x28], r14
    mov [rdi + 0x30], r15
    lea rax, [rip + 2f]
    mov [rdi + 0x38], rax
    pushfq
    pop rax
    mov [rdi + 0x40], rax

    // Load the incoming thread and jump to its resume point. popfq
    // restores the incoming thread's interrupt flag.
    mov rsp, [rsi + 0x00]
    mov rbp, [rsi + 0x08]
    mov rbx, [rsi + 0x10]
    mov r12, [rsi + 0x18]
    mov r13, [rsi + 0x20]
    mov r14, [rsi + 0x28]
    mov r15, [rsi + 0x30]
    mov rax, [rsi + 0x38]
    push qword ptr [rsi + 0x40]
    popfq
    jmp rax
2:
    ret
"#
);

unsafe extern "C" {
    fn __muon_context_switch(prev: *mut CpuContext, next: *const CpuContext);
}

/// Performs a cooperative context switch.
///
/// Returns when something later switches back into `prev`.
///
/// # Safety
///
/// - `prev` and `next` must point to valid contexts that stay allocated
///   until the next scheduling decision.
/// - `next` must be either a context previously saved by this function or a
///   freshly initialised one whose stack top and entry point are valid.
/// - Must be called with interrupts disabled; the incoming flags image
///   decides whether they come back on.
pub unsafe fn switch_context(prev: *mut CpuContext, next: *const CpuContext) {
    // SAFETY: Forwarded caller contract.
    unsafe { __muon_context_switch(prev, next) }
}
