//! Host-side entry points around generated code.
//!
//! Blocks are entered through [`enter_block`], which saves the host callee-saved registers,
//! loads the state register (`r14` on x86-64, `x28` on AArch64), and publishes
//! `returning_stack_location`: the host stack pointer at which a return address into the
//! trampoline's epilogue is stored. While it is non-zero the thread is inside generated code and
//! the pause handler may redirect it to one of the entry points below.
//!
//! - the stop entry runs on the returning stack location and returns [`EXIT_STOPPED`] from the
//!   block.
//! - the loop-top entry reloads the returning stack location and returns [`EXIT_CONTINUE`].
//! - the pause entry parks the thread until a return or stop signal rewrites its context.

use crate::signal::{self, DispatcherEntries};
use crate::thread_state::ThreadState;

pub const EXIT_CONTINUE: u32 = 0;
pub const EXIT_HALT: u32 = 1;
pub const EXIT_STOPPED: u32 = 2;

const RSL: usize = ThreadState::RETURNING_STACK_LOCATION_OFFSET;

#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    ".pushsection .text",
    ".p2align 4",
    ".globl xlat_enter_block",
    ".hidden xlat_enter_block",
    "xlat_enter_block:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "sub rsp, 8",
    "mov r14, rdi",
    "lea rax, [rip + 2f]",
    "push rax",
    "mov qword ptr [r14 + {rsl}], rsp",
    "jmp rsi",
    "2:",
    "mov qword ptr [r14 + {rsl}], 0",
    "add rsp, 8",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    "",
    ".p2align 4",
    ".globl xlat_stop_entry",
    ".hidden xlat_stop_entry",
    "xlat_stop_entry:",
    "mov eax, {stopped}",
    "ret",
    "",
    ".p2align 4",
    ".globl xlat_loop_top",
    ".hidden xlat_loop_top",
    "xlat_loop_top:",
    "mov rsp, qword ptr [r14 + {rsl}]",
    "xor eax, eax",
    "ret",
    "",
    ".p2align 4",
    ".globl xlat_pause_entry",
    ".hidden xlat_pause_entry",
    "xlat_pause_entry:",
    "sub rsp, 128",
    "and rsp, -16",
    "mov rdi, r14",
    "call {pause_wait}",
    "ud2",
    ".popsection",
    rsl = const RSL,
    stopped = const EXIT_STOPPED,
    pause_wait = sym pause_wait,
);

#[cfg(target_arch = "aarch64")]
core::arch::global_asm!(
    ".pushsection .text",
    ".p2align 4",
    ".globl xlat_enter_block",
    ".hidden xlat_enter_block",
    "xlat_enter_block:",
    "stp x29, x30, [sp, #-96]!",
    "mov x29, sp",
    "stp x19, x20, [sp, #16]",
    "stp x21, x22, [sp, #32]",
    "stp x23, x24, [sp, #48]",
    "stp x25, x26, [sp, #64]",
    "stp x27, x28, [sp, #80]",
    "mov x28, x0",
    "adr x9, 2f",
    "sub sp, sp, #16",
    "str x9, [sp]",
    "mov x9, sp",
    "str x9, [x28, #{rsl}]",
    "blr x1",
    "2:",
    "str xzr, [x28, #{rsl}]",
    "add sp, sp, #16",
    "ldp x27, x28, [sp, #80]",
    "ldp x25, x26, [sp, #64]",
    "ldp x23, x24, [sp, #48]",
    "ldp x21, x22, [sp, #32]",
    "ldp x19, x20, [sp, #16]",
    "ldp x29, x30, [sp], #96",
    "ret",
    "",
    ".p2align 4",
    ".globl xlat_stop_entry",
    ".hidden xlat_stop_entry",
    "xlat_stop_entry:",
    "ldr x30, [sp]",
    "mov w0, #{stopped}",
    "ret",
    "",
    ".p2align 4",
    ".globl xlat_loop_top",
    ".hidden xlat_loop_top",
    "xlat_loop_top:",
    "ldr x9, [x28, #{rsl}]",
    "mov sp, x9",
    "ldr x30, [sp]",
    "mov w0, #0",
    "ret",
    "",
    ".p2align 4",
    ".globl xlat_pause_entry",
    ".hidden xlat_pause_entry",
    "xlat_pause_entry:",
    "sub x9, sp, #128",
    "and x9, x9, #0xfffffffffffffff0",
    "mov sp, x9",
    "mov x0, x28",
    "bl {pause_wait}",
    "brk #0",
    ".popsection",
    rsl = const RSL,
    stopped = const EXIT_STOPPED,
    pause_wait = sym pause_wait,
);

extern "C" {
    fn xlat_enter_block(state: *mut ThreadState, host: usize) -> u32;
    fn xlat_stop_entry();
    fn xlat_loop_top();
    fn xlat_pause_entry();
}

/// Parks the thread in the pause entry. Only a signal leaves this function: a return signal
/// restores the interrupted block's context and a stop signal moves to the stop entry.
extern "C" fn pause_wait(state: *mut ThreadState) -> ! {
    // SAFETY: the pause handler loaded the state register from the thread's registered state,
    // which outlives its dispatcher.
    signal::enter_pause(unsafe { &*state });
    loop {
        // SAFETY: pause(2) has no preconditions.
        unsafe { libc::pause() };
    }
}

/// Runs the block at `host` and returns its exit code.
///
/// # Safety
///
/// `host` must be the entry of an installed block that follows the generated-code ABI: it takes
/// the state in the first argument register and the state register, preserves the state register
/// and the stack, and returns an exit code in the first return register. `state` must be valid
/// for the duration of the call and not borrowed elsewhere.
pub unsafe fn enter_block(state: *mut ThreadState, host: usize) -> u32 {
    // SAFETY: upheld by the caller.
    unsafe { xlat_enter_block(state, host) }
}

impl DispatcherEntries {
    /// Entry points of the trampolines in this module.
    pub fn native() -> Self {
        Self {
            loop_top: xlat_loop_top as usize as u64,
            pause_handler: xlat_pause_entry as usize as u64,
            stop_handler: xlat_stop_entry as usize as u64,
        }
    }
}
