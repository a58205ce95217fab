//! Preemptive priority scheduler (C5) — spec §3 "Thread", §4.5, §9.
//!
//! Threads are arena-owned in `Scheduler::threads` (keyed by `ThreadId`,
//! boxed so a TCB's address never moves while it's in the map) rather
//! than linked via raw intrusive pointers. A TCB is on at most one of:
//! a priority run queue, the sleep queue, or "current" — never more
//! than one, which is what keeps `reschedule` simple.

pub mod context;
pub mod task;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::{String, ToString};
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::registers::control::Cr3;
use x86_64::VirtAddr;

use crate::config;
use crate::process::{Process, ProcessId};
use context::Context;
use task::{PRIORITY_LEVELS, THREAD_MAGIC};

pub use task::{Priority, Thread, ThreadId, ThreadState};

/// Tag used on `Thread::waiting_queue` for the reaper's private wait —
/// it isn't a real `WaitQueue` object, just a stable identity.
const REAPER_QUEUE_TAG: usize = usize::MAX;

struct Scheduler {
    threads: BTreeMap<ThreadId, Box<Thread>>,
    run_queues: [VecDeque<ThreadId>; PRIORITY_LEVELS],
    /// Ascending by `wake_tick`.
    sleep_queue: VecDeque<ThreadId>,
    zombies: VecDeque<ThreadId>,
    current: ThreadId,
    next_tid: u64,
    ticks: u64,
    idle_tid: ThreadId,
    reaper_tid: ThreadId,
    kernel_cr3: u64,
}

impl Scheduler {
    fn alloc_tid(&mut self) -> ThreadId {
        let tid = ThreadId(self.next_tid);
        self.next_tid += 1;
        tid
    }

    fn pick_next(&mut self) -> ThreadId {
        for level in (0..PRIORITY_LEVELS).rev() {
            if let Some(tid) = self.run_queues[level].pop_front() {
                return tid;
            }
        }
        self.idle_tid
    }

    fn enqueue_ready(&mut self, tid: ThreadId) {
        let prio = self.threads[&tid].current_priority;
        self.run_queues[prio.index()].push_back(tid);
    }

    /// Spec §4.5 step 2: a boosted thread is demoted back to the priority
    /// its nice value derives the moment it's descheduled — *before* any
    /// decision about which run queue it lands on, so `enqueue_ready`
    /// never files it under its stale boosted priority.
    fn demote_if_boosted(&mut self, tid: ThreadId) {
        if let Some(t) = self.threads.get_mut(&tid) {
            if t.boosted {
                t.boosted = false;
                t.current_priority = Priority::from_nice(t.nice);
            }
        }
    }

    fn insert_sleep_sorted(&mut self, tid: ThreadId) {
        let wake_tick = self.threads[&tid].wake_tick.unwrap_or(u64::MAX);
        let pos = self
            .sleep_queue
            .iter()
            .position(|&other| self.threads[&other].wake_tick.unwrap_or(u64::MAX) > wake_tick)
            .unwrap_or(self.sleep_queue.len());
        self.sleep_queue.insert(pos, tid);
    }
}

lazy_static! {
    static ref SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler {
        threads: BTreeMap::new(),
        run_queues: [
            VecDeque::new(),
            VecDeque::new(),
            VecDeque::new(),
            VecDeque::new(),
            VecDeque::new(),
        ],
        sleep_queue: VecDeque::new(),
        zombies: VecDeque::new(),
        current: ThreadId(0),
        next_tid: 1,
        ticks: 0,
        idle_tid: ThreadId(0),
        reaper_tid: ThreadId(0),
        kernel_cr3: 0,
    });
}

fn new_kernel_thread(
    sched: &mut Scheduler,
    name: &str,
    entry: extern "C" fn() -> !,
    priority: Priority,
) -> ThreadId {
    let tid = sched.alloc_tid();
    let stack = alloc::vec![0u8; config::KERNEL_STACK_SIZE].into_boxed_slice();
    let stack_top = stack.as_ptr() as u64 + stack.len() as u64;

    let thread = Thread {
        magic: THREAD_MAGIC,
        tid,
        name: name.to_string(),
        owner: None,
        state: ThreadState::Ready,
        context: Context::new(entry as usize as u64, stack_top),
        kernel_stack: stack,
        kernel_stack_top: stack_top,
        cr3: sched.kernel_cr3,
        dispatched_at: sched.ticks,
        entry_name: "kernel",
        base_priority: priority,
        current_priority: priority,
        nice: 0,
        ticks_remaining: priority.time_slice(),
        boosted: false,
        wait_start_tick: sched.ticks,
        cpu_ticks: 0,
        context_switches: 0,
        affinity: u64::MAX,
        wake_tick: None,
        waiting_queue: None,
        timed_out: false,
        should_terminate: false,
        preempt_disable: 0,
        deferred_preempt: false,
    };
    sched.threads.insert(tid, Box::new(thread));
    tid
}

/// C5 bring-up: register the currently executing boot flow as thread 0,
/// then spawn the idle and reaper kernel threads.
pub fn init() {
    let mut sched = SCHEDULER.lock();
    let (frame, _) = Cr3::read();
    sched.kernel_cr3 = frame.start_address().as_u64();

    let boot_tid = sched.alloc_tid();
    let boot_thread = Thread {
        magic: THREAD_MAGIC,
        tid: boot_tid,
        name: String::from("boot"),
        owner: None,
        state: ThreadState::Running,
        context: Context::empty(),
        kernel_stack: alloc::vec![].into_boxed_slice(),
        kernel_stack_top: 0,
        cr3: sched.kernel_cr3,
        dispatched_at: 0,
        entry_name: "boot",
        base_priority: Priority::Normal,
        current_priority: Priority::Normal,
        nice: 0,
        ticks_remaining: Priority::Normal.time_slice(),
        boosted: false,
        wait_start_tick: 0,
        cpu_ticks: 0,
        context_switches: 0,
        affinity: u64::MAX,
        wake_tick: None,
        waiting_queue: None,
        timed_out: false,
        should_terminate: false,
        preempt_disable: 0,
        deferred_preempt: false,
    };
    sched.threads.insert(boot_tid, Box::new(boot_thread));
    sched.current = boot_tid;

    sched.idle_tid = new_kernel_thread(&mut sched, "idle", idle_loop, Priority::Idle);
    sched.reaper_tid = new_kernel_thread(&mut sched, "reaper", reaper_loop, Priority::Idle);

    crate::log_info!(
        "C5: scheduler initialized — boot={:?}, idle={:?}, reaper={:?}",
        boot_tid,
        sched.idle_tid,
        sched.reaper_tid
    );
}

extern "C" fn idle_loop() -> ! {
    loop {
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

extern "C" fn reaper_loop() -> ! {
    loop {
        let zombie = SCHEDULER.lock().zombies.pop_front();
        match zombie {
            Some(tid) => {
                SCHEDULER.lock().threads.remove(&tid);
            }
            None => unsafe {
                block_current_on_queue(REAPER_QUEUE_TAG);
            },
        }
    }
}

/// Create the thread that makes a freshly loaded process's first
/// dispatch land in ring 3 via the trap-return trampoline.
pub fn spawn_user_thread(
    name: &str,
    pid: ProcessId,
    process: &alloc::sync::Arc<Process>,
    entry: VirtAddr,
    user_rsp: VirtAddr,
) -> ThreadId {
    let mut sched = SCHEDULER.lock();
    let tid = sched.alloc_tid();

    let stack = alloc::vec![0u8; config::KERNEL_STACK_SIZE].into_boxed_slice();
    let stack_top = stack.as_ptr() as u64 + stack.len() as u64;
    let cr3 = process
        .inner
        .lock()
        .address_space
        .as_ref()
        .expect("spawn_user_thread on a process with no address space")
        .cr3_value();
    let context = crate::process::build_user_entry_context(stack_top, entry, user_rsp);

    let thread = Thread {
        magic: THREAD_MAGIC,
        tid,
        name: name.to_string(),
        owner: Some(pid),
        state: ThreadState::Ready,
        context,
        kernel_stack: stack,
        kernel_stack_top: stack_top,
        cr3,
        dispatched_at: sched.ticks,
        entry_name: "usermode_trap_return",
        base_priority: Priority::Normal,
        current_priority: Priority::Normal,
        nice: 0,
        ticks_remaining: Priority::Normal.time_slice(),
        boosted: false,
        wait_start_tick: sched.ticks,
        cpu_ticks: 0,
        context_switches: 0,
        affinity: u64::MAX,
        wake_tick: None,
        waiting_queue: None,
        timed_out: false,
        should_terminate: false,
        preempt_disable: 0,
        deferred_preempt: false,
    };
    sched.threads.insert(tid, Box::new(thread));
    sched.enqueue_ready(tid);
    tid
}

pub fn current_thread_id() -> ThreadId {
    SCHEDULER.lock().current
}

pub fn current_process_id() -> Option<ProcessId> {
    let sched = SCHEDULER.lock();
    sched.threads.get(&sched.current).and_then(|t| t.owner)
}

/// Called with `sched` locked; drops the lock and performs the
/// register-level switch. Returns once this CPU dispatches `sched`'s
/// caller again (i.e. when this thread is next scheduled in).
fn reschedule(mut sched: spin::MutexGuard<'static, Scheduler>) {
    let current_tid = sched.current;
    let next_tid = sched.pick_next();
    let now = sched.ticks;

    if let Some(cur) = sched.threads.get_mut(&current_tid) {
        cur.cpu_ticks += now.saturating_sub(cur.dispatched_at);
    }

    let next_cr3 = sched.threads[&next_tid].cr3;
    let next_rsp0 = sched.threads[&next_tid].kernel_stack_top;
    if let Some(next) = sched.threads.get_mut(&next_tid) {
        next.state = ThreadState::Running;
        next.dispatched_at = now;
        next.context_switches += 1;
    }
    sched.current = next_tid;

    if next_rsp0 != 0 {
        crate::interrupts::gdt::set_tss_rsp0(next_rsp0);
    }

    let old_ctx: *mut Context = &mut sched.threads.get_mut(&current_tid).unwrap().context;
    let new_ctx: *const Context = &sched.threads[&next_tid].context;

    unsafe {
        core::arch::asm!("mov cr3, {0}", in(reg) next_cr3, options(nostack, preserves_flags));
    }

    drop(sched);
    unsafe {
        context::switch_context(old_ctx, new_ctx);
    }
}

/// Give up the remainder of this thread's time slice voluntarily.
pub fn yield_now() {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let tid = sched.current;
        if tid != sched.idle_tid {
            sched.demote_if_boosted(tid);
            if let Some(t) = sched.threads.get_mut(&tid) {
                t.state = ThreadState::Ready;
                t.ticks_remaining = t.current_priority.time_slice();
            }
            sched.enqueue_ready(tid);
        }
        reschedule(sched);
    });
}

/// # Safety
/// `queue_tag` must be an address (or other stable identity) the caller
/// controls the lifetime of — it's never dereferenced here, only used to
/// populate the diagnostic `waiting_queue` field.
pub unsafe fn block_current_on_queue(queue_tag: usize) {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let tid = sched.current;
        sched.demote_if_boosted(tid);
        if let Some(t) = sched.threads.get_mut(&tid) {
            t.state = ThreadState::Blocked;
            t.waiting_queue = Some(queue_tag);
        }
        reschedule(sched);
    });
}

/// # Safety
/// Same contract as [`block_current_on_queue`].
pub unsafe fn block_current_on_queue_timeout(queue_tag: usize, timeout_ticks: u64) -> bool {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let tid = sched.current;
        sched.demote_if_boosted(tid);
        let wake_tick = sched.ticks + timeout_ticks.max(1);
        if let Some(t) = sched.threads.get_mut(&tid) {
            t.state = ThreadState::Sleeping;
            t.wake_tick = Some(wake_tick);
            t.waiting_queue = Some(queue_tag);
            t.timed_out = false;
        }
        sched.insert_sleep_sorted(tid);
        reschedule(sched);

        let sched = SCHEDULER.lock();
        !sched.threads.get(&tid).map(|t| t.timed_out).unwrap_or(true)
    })
}

/// Suspend the current thread until at least `timeout_ticks` timer ticks
/// have elapsed.
pub fn sleep_ticks(timeout_ticks: u64) {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let tid = sched.current;
        sched.demote_if_boosted(tid);
        let wake_tick = sched.ticks + timeout_ticks.max(1);
        if let Some(t) = sched.threads.get_mut(&tid) {
            t.state = ThreadState::Sleeping;
            t.wake_tick = Some(wake_tick);
        }
        sched.insert_sleep_sorted(tid);
        reschedule(sched);
    });
}

fn wake_thread_locked(sched: &mut Scheduler, tid: ThreadId) {
    let Some(t) = sched.threads.get_mut(&tid) else {
        return;
    };
    if t.state != ThreadState::Blocked && t.state != ThreadState::Sleeping {
        return;
    }
    t.state = ThreadState::Ready;
    t.waiting_queue = None;
    t.wake_tick = None;
    t.wait_start_tick = sched.ticks;
    sched.sleep_queue.retain(|&x| x != tid);
    sched.enqueue_ready(tid);
}

/// Move a blocked or sleeping thread back onto its run queue.
pub fn wake_thread(tid: ThreadId) {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        wake_thread_locked(&mut sched, tid);
    });
}

/// Forcibly remove a thread from the scheduler without letting it run
/// again, for `process::kill`'s "terminate everything now" path.
pub fn kill_thread(tid: ThreadId) {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        debug_assert!(sched.current != tid, "kill_thread called on the running thread");
        if let Some(t) = sched.threads.get(&tid) {
            let prio = t.current_priority;
            sched.run_queues[prio.index()].retain(|&x| x != tid);
        }
        sched.sleep_queue.retain(|&x| x != tid);
        sched.threads.remove(&tid);
    });
}

/// Disable preemption for the current thread. Nestable; a tick that
/// would have preempted while disabled is deferred and replayed by the
/// matching `preempt_enable`.
pub fn preempt_disable() {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let tid = sched.current;
        if let Some(t) = sched.threads.get_mut(&tid) {
            t.preempt_disable += 1;
        }
    });
}

pub fn preempt_enable() {
    let need_resched = x86_64::instructions::interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let tid = sched.current;
        let mut need = false;
        if let Some(t) = sched.threads.get_mut(&tid) {
            if t.preempt_disable > 0 {
                t.preempt_disable -= 1;
            }
            if t.preempt_disable == 0 && t.deferred_preempt {
                t.deferred_preempt = false;
                need = true;
            }
        }
        need
    });
    if need_resched {
        yield_now();
    }
}

/// The single thread-exit funnel: mark zombie, wake the reaper, notify
/// the owning process, then jump into whatever's next. Never returns.
pub fn thread_exit(exit_code: u64) -> ! {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let tid = sched.current;

        if tid == sched.idle_tid || tid == sched.reaper_tid {
            drop(sched);
            crate::log_error!("scheduler: a kernel thread exited — halting.");
            x86_64::instructions::interrupts::disable();
            loop {
                x86_64::instructions::hlt();
            }
        }

        let owner = sched.threads.get(&tid).and_then(|t| t.owner);
        if let Some(t) = sched.threads.get_mut(&tid) {
            t.state = ThreadState::Zombie;
        }
        sched.zombies.push_back(tid);
        let reaper_tid = sched.reaper_tid;
        wake_thread_locked(&mut sched, reaper_tid);

        let next_tid = sched.pick_next();
        let now = sched.ticks;
        let next_cr3 = sched.threads[&next_tid].cr3;
        let next_rsp0 = sched.threads[&next_tid].kernel_stack_top;
        if let Some(next) = sched.threads.get_mut(&next_tid) {
            next.state = ThreadState::Running;
            next.dispatched_at = now;
            next.context_switches += 1;
        }
        sched.current = next_tid;
        if next_rsp0 != 0 {
            crate::interrupts::gdt::set_tss_rsp0(next_rsp0);
        }
        let new_ctx: *const Context = &sched.threads[&next_tid].context;
        unsafe {
            core::arch::asm!("mov cr3, {0}", in(reg) next_cr3, options(nostack, preserves_flags));
        }
        drop(sched);

        if let Some(pid) = owner {
            crate::process::thread_exited(pid, tid, exit_code);
        }

        unsafe {
            context::restore_context(new_ctx);
        }
    });
    unreachable!("thread_exit never returns");
}

/// Timer-tick entry point, called from the PIT interrupt handler after
/// EOI. Drains due sleepers, ages waiting threads, and preempts the
/// current thread if its slice has run out.
pub fn timer_tick() {
    let mut sched = SCHEDULER.lock();
    sched.ticks += 1;
    let now = sched.ticks;

    while let Some(&tid) = sched.sleep_queue.front() {
        let due = sched
            .threads
            .get(&tid)
            .map(|t| t.wake_tick.unwrap_or(u64::MAX) <= now)
            .unwrap_or(false);
        if !due {
            break;
        }
        sched.sleep_queue.pop_front();
        let was_waiting = sched.threads.get(&tid).map(|t| t.waiting_queue.is_some()).unwrap_or(false);
        if let Some(t) = sched.threads.get_mut(&tid) {
            t.wake_tick = None;
            t.timed_out = was_waiting;
            t.waiting_queue = None;
            t.state = ThreadState::Ready;
            t.wait_start_tick = now;
        }
        sched.enqueue_ready(tid);
    }

    // Rocket-boost aging: anything that's waited past the threshold in a
    // sub-UI band jumps to the front of the UI queue.
    for level in 0..Priority::Ui.index() {
        let waiting: alloc::vec::Vec<ThreadId> = sched.run_queues[level].drain(..).collect();
        for tid in waiting {
            let age = now.saturating_sub(sched.threads[&tid].wait_start_tick);
            if age >= config::AGING_THRESHOLD {
                if let Some(t) = sched.threads.get_mut(&tid) {
                    t.current_priority = Priority::Ui;
                    t.boosted = true;
                    t.wait_start_tick = now;
                }
                sched.run_queues[Priority::Ui.index()].push_front(tid);
            } else {
                sched.run_queues[level].push_back(tid);
            }
        }
    }

    let cur_tid = sched.current;
    if cur_tid == sched.idle_tid {
        return;
    }

    let mut should_preempt = false;
    if let Some(cur) = sched.threads.get_mut(&cur_tid) {
        if cur.ticks_remaining > 0 {
            cur.ticks_remaining -= 1;
        }
        if cur.ticks_remaining == 0 {
            if cur.preempt_disable > 0 {
                cur.deferred_preempt = true;
            } else {
                should_preempt = true;
            }
        }
    }

    if should_preempt {
        sched.demote_if_boosted(cur_tid);
        let prio = sched.threads[&cur_tid].current_priority;
        if let Some(cur) = sched.threads.get_mut(&cur_tid) {
            cur.state = ThreadState::Ready;
            cur.ticks_remaining = prio.time_slice();
        }
        sched.run_queues[prio.index()].push_back(cur_tid);
        reschedule(sched);
    }
}

/// Snapshot used by diagnostics (`meminfo`-adjacent tooling); not part of
/// the scheduling hot path.
pub fn thread_count() -> usize {
    SCHEDULER.lock().threads.len()
}
