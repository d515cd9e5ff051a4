//! Process entry point under the Mach-O host.
//!
//! The high-level start routine reserves memory and has dyld load the
//! main image, then reports the entry kind through the flag slot. A
//! main-style entry gets a C call with argc/argv/envp/apple data and its
//! return value becomes the exit status; a unix-thread entry gets the
//! stack reshaped so argc is followed contiguously by argv, envp and the
//! apple data, and control jumps to the recorded instruction pointer.

use core::arch::naked_asm;

#[cfg(not(test))]
#[unsafe(naked)]
#[unsafe(no_mangle)]
unsafe extern "C" fn _start() -> ! {
    naked_asm!(
        "push 0",
        "mov rbp, rsp",
        "and rsp, -16",
        "sub rsp, 16",
        "lea rdi, [rbp + 8]",  // stack (the argc slot)
        "mov rsi, rsp",        // &is_unix_thread
        "mov qword ptr [rsi], 0",
        "call {start}",
        "mov rdi, [rbp + 8]",
        "dec rdi",                    // argc without the loader
        "lea rsi, [rbp + 24]",        // argv
        "lea rdx, [rsi + rdi*8 + 8]", // envp
        "mov rcx, rdx",               // apple data
        "2:",
        "mov r8, [rcx]",
        "add rcx, 8",
        "or r8, r8",
        "jnz 2b",
        "cmp dword ptr [rsp], 0",
        "jne 3f",
        // LC_MAIN
        "add rsp, 16",
        "call rax",
        "mov rdi, rax",
        "call {exit}",
        "hlt",
        // LC_UNIXTHREAD
        "3:",
        "mov r8, [rcx]",
        "add rcx, 8",
        "or r8, r8",
        "jnz 3b",
        "sub rcx, rbp",
        "sub rcx, 16",
        "lea rsp, [rbp + 8]",
        "sub rsp, rcx",
        "mov [rsp], rdi", // argc
        "lea rdi, [rsp + 8]",
        "shr rcx, 3",
        "cld",
        "rep movsq", // argv, envp, apple data
        "mov rbp, 0",
        "jmp rax",
        start = sym crate::macho::start,
        exit = sym exit_shim,
    )
}

unsafe extern "C" fn exit_shim(code: usize) -> ! {
    crate::syscall::exit::exit(code)
}
