//! Process abstraction and ring-3 entry (C6) — spec §3 "Process", §4.6.
//!
//! A `Process` owns an address space, a file-descriptor table and a list
//! of the threads running inside it. Threads are the scheduled unit;
//! processes are bookkeeping plus the container ring-3 code runs inside.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex as OuterMutex;
use x86_64::structures::paging::{Page, PageTableFlags, Size4KiB};
use x86_64::VirtAddr;

use crate::config;
use crate::fs::fd::File;
use crate::interrupts::gdt;
use crate::loader::elf::{self, ExecError};
use crate::memory::paging::{AddressSpace, MapFlags};
use crate::memory::FRAME_ALLOCATOR;
use crate::scheduler::context::Context;
use crate::scheduler::task::ThreadId;
use crate::sync::{SpinLock, WaitQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Zombie,
    Terminated,
}

/// Everything about a process that mutates after creation, guarded by one
/// lock so `join`'s wait predicate and state transitions stay consistent.
pub struct ProcessInner {
    pub state: ProcessState,
    pub exit_status: Option<u64>,
    pub address_space: Option<AddressSpace>,
    pub threads: Vec<ThreadId>,
    pub parent: Option<ProcessId>,
    pub children: Vec<ProcessId>,
    pub fd_table: Vec<Option<Arc<OuterMutex<File>>>>,
    /// C9: once set, this process's syscalls are dispatched through the
    /// compat translation table instead of the native one.
    pub compat_mode: bool,
    /// Current working directory, consumed by `getcwd`/`chdir` and used to
    /// resolve relative paths passed to `open`/`mkdir`/`create`/`readdir`.
    pub cwd: String,
}

pub struct Process {
    pub pid: ProcessId,
    pub name: String,
    /// Woken whenever `inner.state` leaves `Running`; independent of
    /// `inner`'s lock so `wait_while` can park on it safely.
    pub join_wait: WaitQueue,
    pub inner: SpinLock<ProcessInner>,
}

impl Process {
    fn new(pid: ProcessId, name: &str, address_space: Option<AddressSpace>, parent: Option<ProcessId>) -> Arc<Process> {
        let mut fd_table = alloc::vec![None; config::FD_TABLE_SIZE];
        fd_table[0] = Some(File::new_console());
        fd_table[1] = Some(File::new_console());
        fd_table[2] = Some(File::new_console());

        Arc::new(Process {
            pid,
            name: name.to_string(),
            join_wait: WaitQueue::new(),
            inner: SpinLock::new(ProcessInner {
                state: ProcessState::Running,
                exit_status: None,
                address_space,
                threads: Vec::new(),
                parent,
                children: Vec::new(),
                fd_table,
                compat_mode: false,
                cwd: String::from("/"),
            }),
        })
    }
}

struct ProcessTable {
    processes: BTreeMap<ProcessId, Arc<Process>>,
    next_pid: u64,
}

static PROCESS_TABLE: OuterMutex<ProcessTable> = OuterMutex::new(ProcessTable {
    processes: BTreeMap::new(),
    next_pid: 1,
});

fn alloc_pid() -> ProcessId {
    let mut table = PROCESS_TABLE.lock();
    let pid = ProcessId(table.next_pid);
    table.next_pid += 1;
    pid
}

pub fn get(pid: ProcessId) -> Option<Arc<Process>> {
    PROCESS_TABLE.lock().processes.get(&pid).cloned()
}

fn register(process: Arc<Process>) {
    PROCESS_TABLE.lock().processes.insert(process.pid, process);
}

pub fn list_pids() -> Vec<ProcessId> {
    PROCESS_TABLE.lock().processes.keys().copied().collect()
}

/// Build the initial user-mode stack: a page-aligned mapped region
/// topped with `argc`/`argv` laid out the way a C runtime's `_start`
/// expects to find them at the process's initial `rsp`.
fn build_argv_stack(
    space: &AddressSpace,
    stack_top: VirtAddr,
    argv: &[&str],
) -> Result<VirtAddr, ExecError> {
    let mut frame_alloc = FRAME_ALLOCATOR.lock();

    // String bytes first, back-to-front, then the pointer array, then
    // argc, all packed into one scratch buffer written with a single
    // `copy_to` so partially-written argv blocks can never be observed.
    let mut strings: Vec<(u64, usize)> = Vec::with_capacity(argv.len());
    let mut scratch: Vec<u8> = Vec::new();
    for s in argv.iter().rev() {
        scratch.extend_from_slice(s.as_bytes());
        scratch.push(0);
    }
    // Addresses are assigned after we know the block's base, below.
    let strings_len = scratch.len();
    let ptr_array_len = (argv.len() + 1) * 8; // +1 for the NULL terminator
    let argc_len = 8usize;
    let total = strings_len + ptr_array_len + argc_len;
    let total_aligned = (total + 15) & !15;

    let block_base = VirtAddr::new(stack_top.as_u64() - total_aligned as u64);
    let strings_base = block_base.as_u64();
    let mut offset = 0u64;
    for s in argv.iter().rev() {
        let len = s.len() as u64 + 1;
        strings.push((strings_base + offset, s.len()));
        offset += len;
    }
    strings.reverse();

    let ptr_array_base = strings_base + strings_len as u64;
    let argc_addr = ptr_array_base + ptr_array_len as u64;

    let mut full: Vec<u8> = Vec::with_capacity(total_aligned);
    full.extend_from_slice(&scratch);
    for (addr, _) in &strings {
        full.extend_from_slice(&addr.to_le_bytes());
    }
    full.extend_from_slice(&0u64.to_le_bytes()); // argv NULL terminator
    full.extend_from_slice(&(argv.len() as u64).to_le_bytes());
    full.resize(total_aligned, 0);

    space.copy_to(block_base, &full, &mut frame_alloc);

    Ok(VirtAddr::new(argc_addr))
}

/// Spin up a fresh ring-3 process: allocate an address space, load the
/// ELF image into it, map a user stack, seed argv, and hand the whole
/// thing to the scheduler as a new thread whose very first dispatch
/// lands in user mode via the trap-return path.
pub fn create_user_process(path: &str, argv: &[&str]) -> Result<ProcessId, ExecError> {
    let pid = alloc_pid();

    let space = {
        let mut frame_alloc = FRAME_ALLOCATOR.lock();
        AddressSpace::create_directory(&mut frame_alloc).ok_or(ExecError::Memory)?
    };

    let image = elf::load(path, &space)?;

    let user_stack_top = VirtAddr::new(image.top.align_up(config::PAGE_SIZE as u64).as_u64() + config::PAGE_SIZE as u64 * 16);
    let stack_bottom_page: Page<Size4KiB> = Page::containing_address(user_stack_top - 1u64);
    let stack_page_count = config::USER_STACK_SIZE / config::PAGE_SIZE;
    {
        let mut frame_alloc = FRAME_ALLOCATOR.lock();
        let first_page = stack_bottom_page - (stack_page_count as u64 - 1);
        for i in 0..stack_page_count {
            let page = first_page + i as u64;
            let frame = frame_alloc.alloc_block().ok_or(ExecError::Memory)?;
            space
                .map_page(page, frame, MapFlags::WRITABLE | MapFlags::USER_ACCESSIBLE, &mut frame_alloc)
                .map_err(|_| ExecError::Memory)?;
        }
    }

    let entry_rsp = build_argv_stack(&space, user_stack_top, argv)?;

    let process = Process::new(pid, path, Some(space), None);
    register(process.clone());

    let tid = crate::scheduler::spawn_user_thread(path, process.pid, &process, image.entry, entry_rsp);
    process.inner.lock().threads.push(tid);

    Ok(pid)
}

/// Build the kernel-stack contents a ring-3 thread needs on its very
/// first dispatch: a simulated `iretq` frame (SS, user RSP, RFLAGS with
/// IF set, CS, RIP) sitting at the top of the stack, with the thread's
/// saved `rip` pointed at a one-instruction trampoline that just
/// `iretq`s it away. `switch_context`/`restore_context` don't need to
/// know this thread has never run before — they just resume at `rip`
/// like any other suspended thread.
pub fn build_user_entry_context(kernel_stack_top: u64, entry: VirtAddr, user_rsp: VirtAddr) -> Context {
    const IRET_FRAME_BYTES: u64 = 5 * 8;
    let frame_base = kernel_stack_top - IRET_FRAME_BYTES;

    unsafe {
        let ss = gdt::user_data_selector().0 as u64;
        let cs = gdt::user_code_selector().0 as u64;
        let rflags: u64 = 0x200; // IF

        let frame = frame_base as *mut u64;
        frame.add(0).write(entry.as_u64()); // RIP
        frame.add(1).write(cs); // CS
        frame.add(2).write(rflags); // RFLAGS
        frame.add(3).write(user_rsp.as_u64()); // RSP
        frame.add(4).write(ss); // SS
    }

    let mut ctx = Context::empty();
    ctx.rsp = frame_base;
    ctx.rip = crate::interrupts::usermode::usermode_trap_return as usize as u64;
    ctx
}

/// Mark the thread as gone and, if it was the last thread in its
/// process, transition the process to `Zombie` and wake anyone joined on
/// it. This is the single path every thread exit funnels through,
/// whether the thread ran its entry function to completion or a
/// syscall explicitly requested termination.
pub fn thread_exited(pid: ProcessId, tid: ThreadId, exit_code: u64) {
    let Some(process) = get(pid) else { return };
    let became_zombie = {
        let mut inner = process.inner.lock();
        inner.threads.retain(|&t| t != tid);
        if inner.threads.is_empty() {
            inner.state = ProcessState::Zombie;
            inner.exit_status = Some(exit_code);
            if let Some(space) = inner.address_space.take() {
                let mut frame_alloc = FRAME_ALLOCATOR.lock();
                space.free_directory(&mut frame_alloc);
            }
            true
        } else {
            false
        }
    };
    if became_zombie {
        process.join_wait.wake_all();
    }
}

/// Block until `pid` becomes a zombie, returning its exit status.
pub fn join(pid: ProcessId) -> Option<u64> {
    let process = get(pid)?;
    let guard = process
        .join_wait
        .wait_while(&process.inner, |inner| inner.state == ProcessState::Running);
    guard.exit_status
}

/// Forcibly terminate every thread in a process without waiting for any
/// of them to run to completion (spec's "kill everything now" path,
/// distinct from the single voluntary `thread_exited` exit path).
pub fn kill(pid: ProcessId, exit_code: u64) {
    let Some(process) = get(pid) else { return };
    let threads: Vec<ThreadId> = {
        let mut inner = process.inner.lock();
        if inner.state != ProcessState::Running {
            return;
        }
        core::mem::take(&mut inner.threads)
    };
    for tid in threads {
        crate::scheduler::kill_thread(tid);
    }
    let became_zombie = {
        let mut inner = process.inner.lock();
        inner.state = ProcessState::Zombie;
        inner.exit_status = Some(exit_code);
        if let Some(space) = inner.address_space.take() {
            let mut frame_alloc = FRAME_ALLOCATOR.lock();
            space.free_directory(&mut frame_alloc);
        }
        true
    };
    if became_zombie {
        process.join_wait.wake_all();
    }
}

/// Kill a process and every descendant recorded in its child list.
pub fn kill_tree(pid: ProcessId, exit_code: u64) {
    let children = get(pid).map(|p| p.inner.lock().children.clone()).unwrap_or_default();
    for child in children {
        kill_tree(child, exit_code);
    }
    kill(pid, exit_code);
}
