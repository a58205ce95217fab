//! Kernel execution core: boot entry, subsystem bring-up, and the main
//! shell/idle hand-off. See `SPEC_FULL.md` component table (C1–C9) for
//! what each submodule owns.

#![no_std]
#![feature(abi_x86_interrupt)]

extern crate alloc;

pub mod config;
pub mod serial;
pub mod interrupts;
pub mod memory;
pub mod sync;
pub mod scheduler;
pub mod process;
pub mod loader;
pub mod fs;
pub mod net;
pub mod syscalls;
pub mod drivers;

use core::panic::PanicInfo;

// On the bare-metal target `memory::ALLOCATOR` (C3's heap) is the global
// allocator — see its `#[cfg_attr(target_os = "none", global_allocator)]`.
// On the host target (used for `cargo test`), delegate to `std`'s System
// allocator so unit tests can freely use `Vec`/`String`/`Box` without a
// real address space behind them.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Multiboot2 bootstrap magic the loader leaves in `EAX`; read-only sanity
/// check before trusting the boot-info pointer (spec §6 "Boot entry" —
/// parsing the protocol itself is the boot collaborator's job, but the
/// magic is cheap enough to confirm before we hand the pointer to C1).
const MULTIBOOT2_BOOTLOADER_MAGIC: u32 = 0x36d7_6289;

/// Entry point the bootloader jumps to in 64-bit long mode with
/// interrupts disabled: `edi` = Multiboot2 magic, `esi`/`rsi` = pointer to
/// the Multiboot2 boot-info structure, per spec §6. Initializes
/// C1→C2→C3→C4→C5→C8 in order and then falls through to the console
/// read loop, the same hand-off point a shell thread would take over
/// from once one exists.
#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn _start(multiboot_magic: u32, multiboot_info_addr: usize) -> ! {
    serial::init();
    interrupts::init();
    log_info!("Kernel started.");

    if multiboot_magic != MULTIBOOT2_BOOTLOADER_MAGIC {
        log_warn!(
            "unexpected boot magic {:#x}, expected {:#x} — continuing anyway.",
            multiboot_magic,
            MULTIBOOT2_BOOTLOADER_MAGIC
        );
    }

    memory::init(multiboot_info_addr);
    log_info!("Memory subsystem initialized.");

    scheduler::init();
    fs::init();
    syscalls::init();
    drivers::init();
    println!("Kernel is running.");

    x86_64::instructions::interrupts::enable();

    // Hand off to the console: read characters from the keyboard driver
    // and echo them until a shell thread (out of scope here) takes over
    // this loop's job.
    loop {
        use crate::drivers::keyboard::scancodes::KeyCode;
        let key = crate::drivers::keyboard::read_char();

        match key {
            KeyCode::Char(c) => print!("{}", c),
            KeyCode::Space => print!(" "),
            KeyCode::Enter => println!(),
            _ => {}
        }
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("{}", info);
    log_error!("{}", info);
    loop {
        x86_64::instructions::hlt();
    }
}
