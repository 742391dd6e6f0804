//! Architecture trampolines.
//!
//! Each trampoline takes a pointer to a [`CallFrame`], copies the stack image
//! below its own frame, loads the argument registers, calls `target`, and
//! stores the return registers back into the frame.

#![allow(unsafe_code)]

use std::mem::offset_of;

/// Register file and stack image for one native call. Field offsets are
/// part of the trampoline contract.
#[repr(C)]
#[derive(Debug, Clone)]
pub(crate) struct CallFrame {
    pub target: usize,
    pub int_regs: [u64; 8],
    pub float_regs: [u64; 8],
    pub stack: *const u8,
    /// Multiple of 16.
    pub stack_size: usize,
    /// AArch64 `x8`.
    pub indirect_result: u64,
    pub ret_int: [u64; 2],
    pub ret_float: [u64; 4],
}

const _: () = {
    assert!(offset_of!(CallFrame, target) == 0);
    assert!(offset_of!(CallFrame, int_regs) == 8);
    assert!(offset_of!(CallFrame, float_regs) == 72);
    assert!(offset_of!(CallFrame, stack) == 136);
    assert!(offset_of!(CallFrame, stack_size) == 144);
    assert!(offset_of!(CallFrame, indirect_result) == 152);
    assert!(offset_of!(CallFrame, ret_int) == 160);
    assert!(offset_of!(CallFrame, ret_float) == 176);
};

impl CallFrame {
    pub(crate) fn new(target: usize) -> Self {
        Self {
            target,
            int_regs: [0; 8],
            float_regs: [0; 8],
            stack: std::ptr::null(),
            stack_size: 0,
            indirect_result: 0,
            ret_int: [0; 2],
            ret_float: [0; 4],
        }
    }
}

pub(crate) type Trampoline = unsafe extern "C" fn(*mut CallFrame);

#[cfg(target_vendor = "apple")]
macro_rules! trampoline_symbol {
    () => {
        "_downcall_rs_trampoline"
    };
}

#[cfg(not(target_vendor = "apple"))]
macro_rules! trampoline_symbol {
    () => {
        "downcall_rs_trampoline"
    };
}

#[cfg(target_arch = "x86_64")]
std::arch::global_asm!(
    ".text",
    ".p2align 4",
    concat!(".globl ", trampoline_symbol!()),
    concat!(trampoline_symbol!(), ":"),
    "push rbp",
    "mov rbp, rsp",
    "push rbx",
    "push r12",
    "mov rbx, rdi",
    "mov rcx, qword ptr [rbx + 144]",
    "sub rsp, rcx",
    "mov rsi, qword ptr [rbx + 136]",
    "mov rdi, rsp",
    "cld",
    "rep movsb",
    "movsd xmm0, qword ptr [rbx + 72]",
    "movsd xmm1, qword ptr [rbx + 80]",
    "movsd xmm2, qword ptr [rbx + 88]",
    "movsd xmm3, qword ptr [rbx + 96]",
    "movsd xmm4, qword ptr [rbx + 104]",
    "movsd xmm5, qword ptr [rbx + 112]",
    "movsd xmm6, qword ptr [rbx + 120]",
    "movsd xmm7, qword ptr [rbx + 128]",
    "mov rdi, qword ptr [rbx + 8]",
    "mov rsi, qword ptr [rbx + 16]",
    "mov rdx, qword ptr [rbx + 24]",
    "mov rcx, qword ptr [rbx + 32]",
    "mov r8, qword ptr [rbx + 40]",
    "mov r9, qword ptr [rbx + 48]",
    "mov r11, qword ptr [rbx]",
    "call r11",
    "mov qword ptr [rbx + 160], rax",
    "mov qword ptr [rbx + 168], rdx",
    "movsd qword ptr [rbx + 176], xmm0",
    "movsd qword ptr [rbx + 184], xmm1",
    "lea rsp, [rbp - 16]",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

#[cfg(target_arch = "aarch64")]
std::arch::global_asm!(
    ".text",
    ".p2align 2",
    concat!(".globl ", trampoline_symbol!()),
    concat!(trampoline_symbol!(), ":"),
    "stp x29, x30, [sp, #-32]!",
    "mov x29, sp",
    "str x19, [sp, #16]",
    "mov x19, x0",
    "ldr x9, [x19, #144]",
    "sub sp, sp, x9",
    "ldr x10, [x19, #136]",
    "mov x11, sp",
    "cbz x9, 4f",
    "3:",
    "ldr x12, [x10], #8",
    "str x12, [x11], #8",
    "subs x9, x9, #8",
    "b.ne 3b",
    "4:",
    "ldp d0, d1, [x19, #72]",
    "ldp d2, d3, [x19, #88]",
    "ldp d4, d5, [x19, #104]",
    "ldp d6, d7, [x19, #120]",
    "ldr x8, [x19, #152]",
    "ldp x0, x1, [x19, #8]",
    "ldp x2, x3, [x19, #24]",
    "ldp x4, x5, [x19, #40]",
    "ldp x6, x7, [x19, #56]",
    "ldr x16, [x19]",
    "blr x16",
    "stp x0, x1, [x19, #160]",
    "stp d0, d1, [x19, #176]",
    "stp d2, d3, [x19, #192]",
    "mov sp, x29",
    "ldr x19, [sp, #16]",
    "ldp x29, x30, [sp], #32",
    "ret",
);

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
unsafe extern "C" {
    fn downcall_rs_trampoline(frame: *mut CallFrame);
}

/// Trampoline for the running architecture, if there is one.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub(crate) const HOST_TRAMPOLINE: Option<Trampoline> = Some(downcall_rs_trampoline as Trampoline);

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub(crate) const HOST_TRAMPOLINE: Option<Trampoline> = None;
