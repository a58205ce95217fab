//! Thread control block (C5's TCB) — spec §3 "Thread".

use alloc::boxed::Box;
use alloc::string::String;

use super::context::Context;
use crate::process::ProcessId;

/// Written into every freshly created TCB; checked wherever a `ThreadId`
/// is dereferenced through a raw path, matching the data model's "unique
/// TID ... magic sentinel" identity field.
pub const THREAD_MAGIC: u32 = 0x5442_4321; // "TBC!" read backwards

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Blocked,
    Sleeping,
    Zombie,
}

/// One of the five run-queue priority bands, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Idle,
    Background,
    Normal,
    High,
    Ui,
}

pub const PRIORITY_LEVELS: usize = 5;

impl Priority {
    pub fn index(self) -> usize {
        match self {
            Priority::Idle => 0,
            Priority::Background => 1,
            Priority::Normal => 2,
            Priority::High => 3,
            Priority::Ui => 4,
        }
    }

    /// Nice-to-priority bands per spec §4.5.
    pub fn from_nice(nice: i8) -> Priority {
        if nice <= -10 {
            Priority::Ui
        } else if nice <= -5 {
            Priority::High
        } else if nice <= 4 {
            Priority::Normal
        } else if nice <= 14 {
            Priority::Background
        } else {
            Priority::Idle
        }
    }

    /// Ticks a thread at this priority may run before preemption.
    pub fn time_slice(self) -> u64 {
        use crate::config::time_slice;
        match self {
            Priority::Idle => time_slice::IDLE,
            Priority::Background => time_slice::BACKGROUND,
            Priority::Normal => time_slice::NORMAL,
            Priority::High => time_slice::HIGH,
            Priority::Ui => time_slice::UI,
        }
    }
}

/// Thread control block. Arena-owned by the scheduler (`Scheduler::threads`,
/// keyed by `ThreadId`) rather than linked via raw intrusive pointers — see
/// the Design Note on arena indices in `SPEC_FULL.md` §3.
pub struct Thread {
    pub magic: u32,
    pub tid: ThreadId,
    pub name: String,
    pub owner: Option<ProcessId>,

    pub state: ThreadState,
    pub context: Context,
    /// Kept alive for the thread's whole lifetime; dropping it (in the
    /// reaper) frees the backing frames.
    pub kernel_stack: Box<[u8]>,
    pub kernel_stack_top: u64,
    /// CR3 value of the owning process's address space (or the shared
    /// kernel directory for threads with no owning process), cached on
    /// the TCB so a context switch never needs to lock the PCB.
    pub cr3: u64,
    /// Tick at which this thread was last dispatched, for `cpu_ticks`
    /// accounting on its next deschedule.
    pub dispatched_at: u64,

    pub entry_name: &'static str,

    pub base_priority: Priority,
    pub current_priority: Priority,
    pub nice: i8,
    pub ticks_remaining: u64,
    pub boosted: bool,
    pub wait_start_tick: u64,
    pub cpu_ticks: u64,
    pub context_switches: u64,
    /// CPU affinity mask. Unused on this single-CPU design but carried so
    /// a future SMP rewrite has somewhere to put it (spec §1 Non-goals /
    /// Design Notes "leaves hooks for CPU affinity").
    pub affinity: u64,

    /// Set only while `Sleeping`, or while `Blocked` with a timeout.
    pub wake_tick: Option<u64>,
    /// Address identity of whatever `WaitQueue`/`CondVar` this thread is
    /// parked on, for diagnostics; the queue itself owns the real waiter
    /// list.
    pub waiting_queue: Option<usize>,
    /// Set by a timer-driven sleep-queue wake, cleared by an explicit
    /// `wake_thread`; lets `CondVar::wait_timeout` tell the two apart.
    pub timed_out: bool,

    pub should_terminate: bool,
    pub preempt_disable: u32,
    pub deferred_preempt: bool,
}

impl Thread {
    pub fn is_valid(&self) -> bool {
        self.magic == THREAD_MAGIC
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nice_bands_match_spec_boundaries() {
        assert_eq!(Priority::from_nice(-20), Priority::Ui);
        assert_eq!(Priority::from_nice(-10), Priority::Ui);
        assert_eq!(Priority::from_nice(-9), Priority::High);
        assert_eq!(Priority::from_nice(-5), Priority::High);
        assert_eq!(Priority::from_nice(-4), Priority::Normal);
        assert_eq!(Priority::from_nice(0), Priority::Normal);
        assert_eq!(Priority::from_nice(4), Priority::Normal);
        assert_eq!(Priority::from_nice(5), Priority::Background);
        assert_eq!(Priority::from_nice(14), Priority::Background);
        assert_eq!(Priority::from_nice(15), Priority::Idle);
        assert_eq!(Priority::from_nice(127), Priority::Idle);
    }

    #[test]
    fn priorities_order_idle_below_ui() {
        assert!(Priority::Idle < Priority::Background);
        assert!(Priority::Background < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Ui);
    }

    #[test]
    fn time_slices_shrink_with_priority() {
        assert!(Priority::Idle.time_slice() > Priority::Background.time_slice());
        assert!(Priority::Background.time_slice() > Priority::Normal.time_slice());
        assert!(Priority::Normal.time_slice() > Priority::High.time_slice());
        assert!(Priority::High.time_slice() > Priority::Ui.time_slice());
    }

    #[test]
    fn index_is_a_bijection_over_priority_levels() {
        let all = [
            Priority::Idle,
            Priority::Background,
            Priority::Normal,
            Priority::High,
            Priority::Ui,
        ];
        for (i, p) in all.iter().enumerate() {
            assert_eq!(p.index(), i);
        }
        assert_eq!(all.len(), PRIORITY_LEVELS);
    }
}
