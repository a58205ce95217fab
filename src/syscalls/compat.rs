//! C9: the legacy syscall ABI compat shim — spec §4.9.
//!
//! `process::ProcessInner::compat_mode` is a per-process flag; once set,
//! every syscall this process makes is routed through
//! [`dispatch_compat`] instead of the native table in
//! [`super::dispatch`]. The numbers below are this kernel's original
//! syscall ABI, kept around so binaries built against it keep working
//! once the native table moved to the numbering in
//! [`super::numbers`].

use super::numbers::open_flags;
use super::{do_close, do_dup, do_dup2, do_exit, do_getpid, do_join, do_open, do_pipe, do_read, do_write, err, errno, read_user_cstr};
use crate::scheduler;

pub const SYS_EXIT: u64 = 0;
pub const SYS_WRITE: u64 = 1;
pub const SYS_YIELD: u64 = 2;
pub const SYS_GETPID: u64 = 3;
pub const SYS_FORK: u64 = 4;
pub const SYS_EXEC: u64 = 5;
pub const SYS_WAIT: u64 = 6;
pub const SYS_OPEN: u64 = 7;
pub const SYS_CLOSE: u64 = 8;
pub const SYS_READ: u64 = 9;
pub const SYS_DUP: u64 = 10;
pub const SYS_DUP2: u64 = 11;
pub const SYS_PIPE: u64 = 12;

/// Legacy `open` took a 2-bit access mode with no create/truncate bits
/// of its own — this kernel never had O_CREAT in its original ABI,
/// every open target had to already exist. Translate that mode onto the
/// native flag bits `do_open` expects.
fn translate_open_flags(legacy_mode: u64) -> u64 {
    match legacy_mode & 0x3 {
        0 => open_flags::O_RDONLY,
        1 => open_flags::O_WRONLY,
        _ => open_flags::O_RDWR,
    }
}

/// Legacy ABI dispatch. Unknown numbers and operations this ABI never
/// had (fork/exec — this kernel has no runtime process-creation syscall)
/// return `-ENOSYS`, same negative-`errno` convention the native table
/// uses, so callers don't need to know which ABI answered them.
pub fn dispatch_compat(number: u64, arg0: u64, arg1: u64, arg2: u64) -> u64 {
    match number {
        SYS_EXIT => do_exit(arg0),
        SYS_WRITE => do_write(arg0, arg1, arg2),
        SYS_YIELD => {
            scheduler::yield_now();
            0
        }
        SYS_GETPID => do_getpid(),
        SYS_FORK => err(errno::ENOSYS),
        SYS_EXEC => err(errno::ENOSYS),
        SYS_WAIT => do_join(arg0),
        SYS_OPEN => match unsafe { read_user_cstr(arg0, 256) } {
            Some(path) => do_open(&path, translate_open_flags(arg1)),
            None => err(errno::EINVAL),
        },
        SYS_CLOSE => do_close(arg0),
        SYS_READ => do_read(arg0, arg1, arg2),
        SYS_DUP => do_dup(arg0),
        SYS_DUP2 => do_dup2(arg0, arg1),
        SYS_PIPE => do_pipe(arg0),
        _ => err(errno::ENOSYS),
    }
}
