//! Ring-3 transition and `int 0x80` entry (C8) — spec §4.8.

use core::arch::naked_asm;

/// The `int 0x80` handler, entered from ring 3 with `RAX`=syscall number,
/// `RDI`/`RSI`/`RDX`=arg0..arg2. Saves the caller-visible registers,
/// calls the Rust dispatcher with the SysV argument order, restores
/// everything but `RAX` (the return value), and `iretq`s back.
#[unsafe(naked)]
pub extern "C" fn syscall_handler_asm() {
    naked_asm!(
        "push r15",
        "push r14",
        "push r13",
        "push r12",
        "push r11",
        "push r10",
        "push r9",
        "push r8",
        "push rbp",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbx",
        "push rcx",
        // CPU pushed 5 qwords (iret frame); we pushed 14 more — 19 total,
        // which is odd, so pad to keep the call below 16-byte aligned.
        "sub rsp, 8",
        // The saved user RIP sits right above our 14 pushes + the pad,
        // at the bottom of the CPU's iret frame — C8's cross-privilege
        // check needs it before it's overwritten by anything below.
        "mov r8, [rsp + 120]",
        "mov rcx, rdx", // arg2 -> rcx (4th SysV param)
        "mov rdx, rsi", // arg1 -> rdx (3rd SysV param)
        "mov rsi, rdi", // arg0 -> rsi (2nd SysV param)
        "mov rdi, rax", // number -> rdi (1st SysV param)
        // r8 (5th SysV param) already holds the saved RIP.
        "call {dispatch}",
        "add rsp, 8",
        "pop rcx",
        "pop rbx",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rbp",
        "pop r8",
        "pop r9",
        "pop r10",
        "pop r11",
        "pop r12",
        "pop r13",
        "pop r14",
        "pop r15",
        "iretq",
        dispatch = sym crate::syscalls::dispatch,
    );
}

/// Every freshly spawned user thread's saved `rip` points here.
/// `process::build_user_entry_context` leaves the thread's saved `rsp`
/// pointing directly at a pre-built `iretq` frame (SS, user RSP,
/// RFLAGS, CS, RIP), so this trampoline needs nothing but the
/// instruction itself — the scheduler's restore path has already put
/// every register where `iretq` expects to find its frame.
#[unsafe(naked)]
pub unsafe extern "C" fn usermode_trap_return() {
    naked_asm!("iretq");
}
