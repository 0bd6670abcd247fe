//! x86_64 context switching implementation
//!
//! Uses naked inline assembly (stable since Rust 1.88). Only the
//! callee-saved registers of the System V AMD64 ABI are preserved;
//! everything else is dead across a voluntary switch because the switch
//! is an ordinary function call from the compiler's point of view.

use std::arch::naked_asm;

/// Callee-saved register set of a parked fiber
///
/// Field order is load-bearing: the assembly below addresses the struct
/// by fixed byte offsets.
#[repr(C)]
pub struct SavedContext {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl SavedContext {
    pub const fn new() -> Self {
        Self {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Initialize a fresh fiber context
///
/// Sets up the stack so that the first switch into `ctx` begins at the
/// entry trampoline, which calls `entry_fn(entry_arg)`.
///
/// # Safety
///
/// `ctx` must point to valid `SavedContext` memory and `stack_top` must
/// be the high end of a mapped stack.
pub unsafe fn init_context(
    ctx: *mut SavedContext,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // Stack must be 16-byte aligned per System V AMD64 ABI; subtract 8
    // so the trampoline's `call` re-establishes call-site alignment.
    let sp = stack_top as usize;
    let aligned_sp = (sp & !0xF) - 8;

    let ctx = &mut *ctx;
    ctx.rsp = aligned_sp as u64;
    ctx.rip = entry_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry_fn as u64;
    ctx.r13 = entry_arg as u64;
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// Trampoline that calls the entry function with its argument
///
/// The entry function terminates the fiber by switching away and never
/// returns; `ud2` traps if it somehow does.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!("mov rdi, r13", "call r12", "ud2",);
}

/// Perform a voluntary context switch
///
/// Saves callee-saved registers to `save` and loads from `load`. Returns
/// (in the saved context) when something switches back into `save`.
#[unsafe(naked)]
pub unsafe extern "C" fn switch(_save: *mut SavedContext, _load: *const SavedContext) {
    naked_asm!(
        // Save callee-saved registers to save (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from load (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to the new RIP
        "jmp rax",
        // Return point for the saved context
        "1:",
        "ret",
    );
}
