//! Context Capture (§4.D): snapshot the callee-saved registers live at the
//! instruction immediately following the call into this module, then copy
//! a bounded prefix of the stack above the captured `RSP`.
//!
//! The register snapshot has to run with no prologue at all — any
//! compiler-inserted push/pop would shift what "the stack at the call
//! site" means — so it's a naked leaf routine, not merely `#[inline(never)]`.

/// Registers captured on x86-64, in the order `regs` stores them.
pub const REG_COUNT: usize = 8;
pub const REG_RBX: usize = 0;
pub const REG_RBP: usize = 1;
pub const REG_R12: usize = 2;
pub const REG_R13: usize = 3;
pub const REG_R14: usize = 4;
pub const REG_R15: usize = 5;
pub const REG_RSP: usize = 6;
pub const REG_RIP: usize = 7;

#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
unsafe extern "C" fn save_registers(out: *mut u64) {
    // Only callee-saved registers are captured; caller-saved registers may
    // hold anything by the time unwinding reads this snapshot. RSP and RIP
    // are reconstructed from the stack itself to reflect their values
    // immediately after this function returns, not while it's running.
    core::arch::naked_asm!(
        "mov [rdi + 0*8], rbx",
        "mov [rdi + 1*8], rbp",
        "mov [rdi + 2*8], r12",
        "mov [rdi + 3*8], r13",
        "mov [rdi + 4*8], r14",
        "mov [rdi + 5*8], r15",
        "lea rax, [rsp + 8]",
        "mov [rdi + 6*8], rax",
        "mov rax, [rsp]",
        "mov [rdi + 7*8], rax",
        "ret",
    );
}

#[cfg(not(target_arch = "x86_64"))]
unsafe extern "C" fn save_registers(_out: *mut u64) {
    // No supported register-snapshot routine on this architecture; callers
    // get an all-zero snapshot and a stack_len of zero rather than UB.
}

/// Snapshot `{RBX, RBP, R12, R13, R14, R15, RSP, RIP}` as they will be
/// immediately after the caller of `capture_registers` returns.
#[inline(never)]
pub fn capture_registers() -> [u64; REG_COUNT] {
    let mut regs = [0u64; REG_COUNT];
    unsafe { save_registers(regs.as_mut_ptr()) };
    regs
}

/// Copies `min(buf.len(), stack_end - rsp)` bytes starting at `rsp` into
/// `buf`, returning the number of bytes copied. Uses an overlap-safe copy
/// since `buf` may itself live on the caller's stack, above or below the
/// captured `rsp`.
///
/// # Safety
/// `rsp` must be a valid, currently-live pointer into this thread's stack,
/// and `stack_end` must be the true upper bound of that stack (as from
/// `get_thread_stack_bounds`). No allocation or mutation of the region
/// `[rsp, stack_end)` may happen between `capture_registers` and this call.
pub unsafe fn capture_stack(rsp: u64, stack_end: u64, buf: &mut [u8]) -> usize {
    if stack_end <= rsp {
        return 0;
    }
    let available = (stack_end - rsp) as usize;
    let len = buf.len().min(available);
    unsafe {
        std::ptr::copy(rsp as *const u8, buf.as_mut_ptr(), len);
    }
    len
}

/// Convenience wrapper combining `capture_registers` and `capture_stack`.
/// The stack copy must happen immediately after the register snapshot so
/// nothing above the captured `RSP` changes in between.
///
/// # Safety
/// Same preconditions as `capture_stack`, evaluated against
/// `regs[REG_RSP]`.
pub unsafe fn capture(stack_end: u64, buf: &mut [u8]) -> ([u64; REG_COUNT], usize) {
    let regs = capture_registers();
    let copied = unsafe { capture_stack(regs[REG_RSP], stack_end, buf) };
    (regs, copied)
}
