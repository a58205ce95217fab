//! Compile-time tunables shared across subsystems.

/// Size of a physical/virtual page.
pub const PAGE_SIZE: usize = 4096;

/// Kernel stack allocated per thread.
pub const KERNEL_STACK_SIZE: usize = PAGE_SIZE * 4;

/// Stack allocated for a freshly loaded user process.
pub const USER_STACK_SIZE: usize = PAGE_SIZE * 4;

/// Fixed size of each process's file-descriptor table. Slots 0/1/2 are
/// reserved as Console at table init.
pub const FD_TABLE_SIZE: usize = 64;

/// Ticks a thread of each priority may run before preemption.
pub mod time_slice {
    pub const IDLE: u64 = 20;
    pub const BACKGROUND: u64 = 15;
    pub const NORMAL: u64 = 10;
    pub const HIGH: u64 = 7;
    pub const UI: u64 = 5;
}

/// Ticks a thread may wait before being rocket-boosted to UI priority.
pub const AGING_THRESHOLD: u64 = 100;

/// `accept()` polling interval while waiting for a client, in timer ticks.
/// The timer is driven at `TIMER_HZ`, so 100 ms ~= `TIMER_HZ / 10` ticks.
pub const ACCEPT_POLL_TICKS: u64 = TIMER_HZ / 10;

/// Total time `accept()` will wait for a client before giving up.
pub const ACCEPT_TIMEOUT_TICKS: u64 = TIMER_HZ * 10;

/// Programmable interval timer frequency driving the scheduler tick.
pub const TIMER_HZ: u64 = 100;

/// Virtual address of the single page reserved in every address space's
/// kernel half for temporarily mapping a frame belonging to a *different*
/// address space (cross-space `copy_to`/`memset_in`).
pub const SCRATCH_PAGE_ADDR: u64 = 0xffff_ff00_0000_0000;

/// Identity-mapped physical memory offset. `boot.asm` maps the first 1 GiB
/// of physical RAM starting at virtual address 0, so physical and virtual
/// addresses coincide below that limit.
pub const PHYS_MEM_OFFSET: u64 = 0;

/// Start of the kernel heap's virtual region.
pub const HEAP_START: usize = 0xffff_ff80_0000_0000;

/// Size of the kernel heap (4 MiB). Generous for a teaching kernel; the
/// first-fit allocator coalesces aggressively so fragmentation stays low
/// at this scale.
pub const HEAP_SIZE: usize = 1024 * PAGE_SIZE * 4;

/// Lowest canonical higher-half address. Any saved instruction pointer at
/// or above this line on a ring-3 trap entry indicates stack corruption
/// (a user-mode return address should never point into kernel space) —
/// C8's cross-privilege safety check halts rather than `iret`s back to it.
pub const KERNEL_SPACE_BASE: u64 = 0xffff_8000_0000_0000;
