//! Syscall dispatch (C8) and the legacy ABI compat shim (C9) — spec
//! §4.8/§4.9/§6.
//!
//! Ring-3 code traps in through `int 0x80`
//! ([`crate::interrupts::usermode::syscall_handler_asm`]) with the
//! syscall number in `RAX` and up to three arguments in
//! `RDI`/`RSI`/`RDX`. [`dispatch`] is the only entry point the asm
//! trampoline calls; everything else in this module is plumbing it
//! shares with [`compat::dispatch_compat`].

pub mod compat;
pub mod numbers;

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec;
use spin::Mutex;

use crate::config;
use crate::drivers::keyboard;
use crate::fs::fd::{File, FileType};
use crate::fs::VFS;
use crate::net::tcp::{TcpSocket, TcpState};
use crate::process::{self, Process, ProcessId};
use crate::scheduler;

use numbers::*;

/// Negative `errno`-style returns, packed into the `u64` the ABI hands
/// back in `RAX` (ring-3 reads it back as `i64`).
pub mod errno {
    pub const EBADF: i64 = -1;
    pub const EINVAL: i64 = -2;
    pub const ENOSYS: i64 = -3;
    pub const EINTR: i64 = -4;
    pub const ETIMEDOUT: i64 = -5;
    pub const EIO: i64 = -6;
    pub const ENOENT: i64 = -7;
    pub const EEXIST: i64 = -8;
    pub const ENOTDIR: i64 = -9;
    pub const EISDIR: i64 = -10;
    pub const ENOSPC: i64 = -11;
}

pub(crate) fn err(e: i64) -> u64 {
    e as u64
}

fn fs_err(e: crate::fs::error::FsError) -> u64 {
    use crate::fs::error::FsError;
    err(match e {
        FsError::NotFound => errno::ENOENT,
        FsError::AlreadyExists => errno::EEXIST,
        FsError::NotADirectory => errno::ENOTDIR,
        FsError::IsADirectory => errno::EISDIR,
        FsError::InvalidPath => errno::EINVAL,
        FsError::IoError => errno::EIO,
        FsError::NoSpace => errno::ENOSPC,
        FsError::NotMounted => errno::ENOENT,
    })
}

pub fn init() {
    crate::log_info!(
        "C8: syscall dispatch ready (int 0x80, vector {:#x}).",
        crate::interrupts::idt::SYSCALL_INTERRUPT_INDEX
    );
}

fn current_process() -> Option<Arc<Process>> {
    scheduler::current_process_id().and_then(process::get)
}

/// Resolve a path argument against the calling process's cwd. Absolute
/// paths pass through untouched.
fn resolve(process: &Process, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        let cwd = process.inner.lock().cwd.clone();
        if cwd.ends_with('/') {
            alloc::format!("{}{}", cwd, path)
        } else {
            alloc::format!("{}/{}", cwd, path)
        }
    }
}

/// Read a NUL-terminated string out of user memory. `ptr` is trusted to
/// point into the calling process's own mapped address space — the
/// active CR3 already belongs to it on a syscall trap.
pub(crate) unsafe fn read_user_cstr(ptr: u64, max_len: usize) -> Option<String> {
    if ptr == 0 {
        return None;
    }
    let bytes = ptr as *const u8;
    let mut out: alloc::vec::Vec<u8> = vec![];
    for i in 0..max_len {
        let b = unsafe { *bytes.add(i) };
        if b == 0 {
            break;
        }
        out.push(b);
    }
    String::from_utf8(out).ok()
}

unsafe fn user_slice_mut(ptr: u64, len: usize) -> &'static mut [u8] {
    unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len) }
}

unsafe fn user_slice(ptr: u64, len: usize) -> &'static [u8] {
    unsafe { core::slice::from_raw_parts(ptr as *const u8, len) }
}

fn alloc_fd(process: &Process, file: Arc<Mutex<File>>) -> Option<usize> {
    let mut inner = process.inner.lock();
    for (i, slot) in inner.fd_table.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(file);
            return Some(i);
        }
    }
    None
}

fn get_fd(process: &Process, fd: u64) -> Option<Arc<Mutex<File>>> {
    let idx = fd as usize;
    process.inner.lock().fd_table.get(idx).cloned().flatten()
}

// ---- per-operation implementations, shared by the native and compat
// dispatchers ----

pub(crate) fn do_exit(exit_code: u64) -> ! {
    scheduler::thread_exit(exit_code)
}

pub(crate) fn do_getpid() -> u64 {
    current_process().map(|p| p.pid.0).unwrap_or(0)
}

pub(crate) fn do_write(fd: u64, buf_ptr: u64, len: u64) -> u64 {
    let Some(process) = current_process() else { return err(errno::EBADF) };
    let Some(file) = get_fd(&process, fd) else { return err(errno::EBADF) };
    let data = unsafe { user_slice(buf_ptr, len as usize) };

    let guard = file.lock();
    if !guard.writable {
        return err(errno::EBADF);
    }
    match &guard.file_type {
        FileType::Console => {
            if let Ok(s) = core::str::from_utf8(data) {
                crate::print!("{}", s);
            }
            data.len() as u64
        }
        FileType::Regular => {
            let path = guard.path.clone();
            let offset = guard.offset as usize;
            drop(guard);
            match VFS.lock().write_file(&path, offset, data) {
                Ok(n) => {
                    file.lock().offset += n as u64;
                    n as u64
                }
                Err(e) => fs_err(e),
            }
        }
        FileType::PipeWrite(inner) => inner.lock().write(data) as u64,
        FileType::Socket(sock) => match sock.send(data) {
            Ok(n) => n as u64,
            Err(_) => err(errno::EIO),
        },
        FileType::Directory | FileType::PipeRead(_) => err(errno::EBADF),
    }
}

pub(crate) fn do_read(fd: u64, buf_ptr: u64, len: u64) -> u64 {
    let Some(process) = current_process() else { return err(errno::EBADF) };
    let Some(file) = get_fd(&process, fd) else { return err(errno::EBADF) };
    let buf = unsafe { user_slice_mut(buf_ptr, len as usize) };

    let mut guard = file.lock();
    if !guard.readable {
        return err(errno::EBADF);
    }
    match &guard.file_type {
        FileType::Console => {
            let mut n = 0;
            while n < buf.len() {
                match keyboard::read_char() {
                    keyboard::scancodes::KeyCode::Char(c) => {
                        buf[n] = c as u8;
                        n += 1;
                    }
                    keyboard::scancodes::KeyCode::Enter => {
                        buf[n] = b'\n';
                        n += 1;
                        break;
                    }
                    keyboard::scancodes::KeyCode::Backspace | keyboard::scancodes::KeyCode::Unknown => {}
                }
            }
            n as u64
        }
        FileType::Regular => {
            let path = guard.path.clone();
            let offset = guard.offset;
            match VFS.lock().read_file(&path, offset as usize, buf) {
                Ok(n) => {
                    guard.offset += n as u64;
                    n as u64
                }
                Err(e) => fs_err(e),
            }
        }
        FileType::PipeRead(inner) => inner.lock().read(buf) as u64,
        FileType::Socket(sock) => {
            let sock = sock.clone();
            drop(guard);
            do_recv_on(sock, buf)
        }
        FileType::Directory | FileType::PipeWrite(_) => err(errno::EBADF),
    }
}

/// `close(fd)` — fd-tag specific. A listening socket isn't really torn
/// down, just re-armed, so the port keeps accepting; everything else is
/// released and the slot freed.
pub(crate) fn do_close(fd: u64) -> u64 {
    let Some(process) = current_process() else { return err(errno::EBADF) };
    let idx = fd as usize;
    if idx < 3 {
        // Slots 0/1/2 are reserved Console fds for the process's whole
        // lifetime (spec §8: "close(f) fails" for all fd f < 3).
        return err(errno::EBADF);
    }
    let mut inner = process.inner.lock();
    let Some(slot) = inner.fd_table.get(idx) else { return err(errno::EBADF) };
    let Some(file) = slot.clone() else { return err(errno::EBADF) };

    let socket = match &file.lock().file_type {
        FileType::Socket(sock) => Some(sock.clone()),
        _ => None,
    };
    if let Some(sock) = socket {
        if sock.state() == TcpState::Listen {
            sock.close_and_relisten();
            return 0;
        }
        sock.close();
    }
    inner.fd_table[idx] = None;
    0
}

pub(crate) fn do_open(path: &str, flags: u64) -> u64 {
    let Some(process) = current_process() else { return err(errno::EBADF) };
    let resolved = resolve(&process, path);

    let exists = VFS.lock().exists(&resolved);
    if !exists {
        if flags & open_flags::O_CREAT == 0 {
            return err(errno::ENOENT);
        }
        if let Err(e) = VFS.lock().create(&resolved) {
            return fs_err(e);
        }
    }
    if flags & open_flags::O_TRUNC != 0 {
        let _ = VFS.lock().truncate(&resolved);
    }

    let is_dir = VFS.lock().is_dir(&resolved);
    let readable = (flags & 0x3) != open_flags::O_WRONLY;
    let writable = (flags & 0x3) == open_flags::O_WRONLY || (flags & 0x3) == open_flags::O_RDWR;

    let file = if is_dir {
        Arc::new(Mutex::new(File {
            file_type: FileType::Directory,
            path: resolved,
            offset: 0,
            readable: true,
            writable: false,
        }))
    } else {
        File::new_regular(&resolved, readable, writable)
    };

    match alloc_fd(&process, file) {
        Some(fd) => fd as u64,
        None => err(errno::ENOSPC),
    }
}

pub(crate) fn do_create(path: &str) -> u64 {
    do_open(path, open_flags::O_CREAT | open_flags::O_TRUNC | open_flags::O_RDWR)
}

pub(crate) fn do_mkdir(path: &str) -> u64 {
    let Some(process) = current_process() else { return err(errno::EBADF) };
    let resolved = resolve(&process, path);
    match VFS.lock().mkdir(&resolved) {
        Ok(_) => 0,
        Err(e) => fs_err(e),
    }
}

pub(crate) fn do_chdir(path: &str) -> u64 {
    let Some(process) = current_process() else { return err(errno::EBADF) };
    let resolved = resolve(&process, path);
    if !VFS.lock().is_dir(&resolved) {
        return err(errno::ENOTDIR);
    }
    process.inner.lock().cwd = resolved;
    0
}

pub(crate) fn do_getcwd(buf_ptr: u64, len: u64) -> u64 {
    let Some(process) = current_process() else { return err(errno::EBADF) };
    let cwd = process.inner.lock().cwd.clone();
    let bytes = cwd.as_bytes();
    if (bytes.len() + 1) as u64 > len {
        return err(errno::EINVAL);
    }
    let out = unsafe { user_slice_mut(buf_ptr, bytes.len() + 1) };
    out[..bytes.len()].copy_from_slice(bytes);
    out[bytes.len()] = 0;
    bytes.len() as u64
}

/// Fixed-size directory entry written to `buf`: a 4-byte type tag
/// (`0` = file, `1` = directory) followed by a 252-byte NUL-padded name.
const DIRENT_SIZE: usize = 256;

pub(crate) fn do_readdir(fd: u64, index: u64, buf_ptr: u64) -> u64 {
    let Some(process) = current_process() else { return err(errno::EBADF) };
    let Some(file) = get_fd(&process, fd) else { return err(errno::EBADF) };
    let path = {
        let guard = file.lock();
        if !matches!(guard.file_type, FileType::Directory) {
            return err(errno::ENOTDIR);
        }
        guard.path.clone()
    };
    let entries = match VFS.lock().readdir(&path) {
        Ok(e) => e,
        Err(e) => return fs_err(e),
    };
    let Some(entry) = entries.get(index as usize) else { return 0 };

    let out = unsafe { user_slice_mut(buf_ptr, DIRENT_SIZE) };
    for b in out.iter_mut() {
        *b = 0;
    }
    let kind: u32 = match entry.inode.file_type {
        crate::fs::inode::FileType::File => 0,
        crate::fs::inode::FileType::Directory => 1,
    };
    out[0..4].copy_from_slice(&kind.to_le_bytes());
    let name = entry.name.as_bytes();
    let n = name.len().min(DIRENT_SIZE - 4 - 1);
    out[4..4 + n].copy_from_slice(&name[..n]);
    1
}

pub(crate) fn do_kbhit() -> u64 {
    keyboard::kbhit() as u64
}

pub(crate) fn do_clear() -> u64 {
    crate::print!("\x1b[2J\x1b[H");
    0
}

pub(crate) fn do_meminfo(buf_ptr: u64) -> u64 {
    let (free_frames, total_frames) = {
        let fa = crate::memory::FRAME_ALLOCATOR.lock();
        (fa.count() as u64, fa.total() as u64)
    };
    let (heap_free, heap_total) = {
        let heap = &crate::memory::ALLOCATOR;
        (heap.free_bytes() as u64, heap.total_bytes() as u64)
    };
    if buf_ptr != 0 {
        let out = unsafe { user_slice_mut(buf_ptr, 32) };
        out[0..8].copy_from_slice(&free_frames.to_le_bytes());
        out[8..16].copy_from_slice(&total_frames.to_le_bytes());
        out[16..24].copy_from_slice(&heap_free.to_le_bytes());
        out[24..32].copy_from_slice(&heap_total.to_le_bytes());
    }
    0
}

// ---- sockets ----

pub(crate) fn do_socket() -> u64 {
    let Some(process) = current_process() else { return err(errno::EBADF) };
    let socket = TcpSocket::new();
    match alloc_fd(&process, File::new_socket(socket)) {
        Some(fd) => fd as u64,
        None => err(errno::ENOSPC),
    }
}

fn get_socket(process: &Process, fd: u64) -> Option<Arc<TcpSocket>> {
    let file = get_fd(process, fd)?;
    let guard = file.lock();
    match &guard.file_type {
        FileType::Socket(s) => Some(s.clone()),
        _ => None,
    }
}

pub(crate) fn do_bind(fd: u64, port: u64) -> u64 {
    let Some(process) = current_process() else { return err(errno::EBADF) };
    let Some(sock) = get_socket(&process, fd) else { return err(errno::EBADF) };
    match sock.bind(port as u16) {
        Ok(()) => 0,
        Err(_) => err(errno::EINVAL),
    }
}

pub(crate) fn do_listen(fd: u64) -> u64 {
    let Some(process) = current_process() else { return err(errno::EBADF) };
    let Some(sock) = get_socket(&process, fd) else { return err(errno::EBADF) };
    match sock.listen() {
        Ok(()) => 0,
        Err(_) => err(errno::EINVAL),
    }
}

/// Layout written to `addr_ptr` on a successful accept: 4 bytes of IPv4
/// address followed by 2 bytes of port, both already in network byte
/// order (spec §6 "Network socket addresses").
const SOCKADDR_SIZE: usize = 6;

/// Blocking `accept()`: poll the pending queue at `ACCEPT_POLL_TICKS`
/// intervals up to a total of `ACCEPT_TIMEOUT_TICKS`, watching the
/// keyboard's cancel combination between waits so a stuck server thread
/// can still be interrupted from the console. Populates `addr_ptr` (if
/// non-null) with the accepted connection's remote address.
pub(crate) fn do_accept(fd: u64, addr_ptr: u64) -> u64 {
    let Some(process) = current_process() else { return err(errno::EBADF) };
    let Some(listener) = get_socket(&process, fd) else { return err(errno::EBADF) };
    if listener.state() != TcpState::Listen {
        return err(errno::EINVAL);
    }

    let mut waited = 0u64;
    loop {
        if let Some(client) = listener.find_ready_client() {
            if addr_ptr != 0 {
                if let Some((ip, port)) = client.remote_addr() {
                    let out = unsafe { user_slice_mut(addr_ptr, SOCKADDR_SIZE) };
                    out[0..4].copy_from_slice(&ip);
                    out[4..6].copy_from_slice(&port);
                }
            }
            return match alloc_fd(&process, File::new_socket(client)) {
                Some(new_fd) => new_fd as u64,
                None => err(errno::ENOSPC),
            };
        }
        if keyboard::poll_cancel() {
            return err(errno::EINTR);
        }
        if waited >= config::ACCEPT_TIMEOUT_TICKS {
            return err(errno::ETIMEDOUT);
        }
        listener.wait_for_change(config::ACCEPT_POLL_TICKS);
        waited += config::ACCEPT_POLL_TICKS;
    }
}

pub(crate) fn do_send(fd: u64, buf_ptr: u64, len: u64) -> u64 {
    let Some(process) = current_process() else { return err(errno::EBADF) };
    let Some(sock) = get_socket(&process, fd) else { return err(errno::EBADF) };
    let data = unsafe { user_slice(buf_ptr, len as usize) };
    match sock.send(data) {
        Ok(n) => n as u64,
        Err(_) => err(errno::EIO),
    }
}

/// Block while `Established` and the inbox is empty; a graceful peer
/// close (`CloseWait`) is reported as a 0-byte read, the usual end of
/// stream signal, not an error.
fn do_recv_on(sock: Arc<TcpSocket>, buf: &mut [u8]) -> u64 {
    loop {
        if sock.available() > 0 {
            return sock.recv(buf) as u64;
        }
        if sock.state() != TcpState::Established {
            return 0;
        }
        sock.wait_for_change(config::ACCEPT_TIMEOUT_TICKS);
    }
}

pub(crate) fn do_recv(fd: u64, buf_ptr: u64, len: u64) -> u64 {
    let Some(process) = current_process() else { return err(errno::EBADF) };
    let Some(sock) = get_socket(&process, fd) else { return err(errno::EBADF) };
    let buf = unsafe { user_slice_mut(buf_ptr, len as usize) };
    do_recv_on(sock, buf)
}

// ---- fd duplication + pipes, used only by the compat ABI (native C8
// has no equivalent syscalls) ----

pub(crate) fn do_dup(fd: u64) -> u64 {
    let Some(process) = current_process() else { return err(errno::EBADF) };
    let Some(file) = get_fd(&process, fd) else { return err(errno::EBADF) };
    match alloc_fd(&process, file) {
        Some(new_fd) => new_fd as u64,
        None => err(errno::ENOSPC),
    }
}

pub(crate) fn do_dup2(old_fd: u64, new_fd: u64) -> u64 {
    let Some(process) = current_process() else { return err(errno::EBADF) };
    let Some(file) = get_fd(&process, old_fd) else { return err(errno::EBADF) };
    let idx = new_fd as usize;
    let mut inner = process.inner.lock();
    if idx >= inner.fd_table.len() {
        return err(errno::EBADF);
    }
    inner.fd_table[idx] = Some(file);
    new_fd
}

pub(crate) fn do_pipe(fds_ptr: u64) -> u64 {
    use crate::fs::pipe::PipeInner;
    let Some(process) = current_process() else { return err(errno::EBADF) };
    let inner = PipeInner::new();
    inner.lock().add_reader();
    inner.lock().add_writer();

    let read_file = Arc::new(Mutex::new(File {
        file_type: FileType::PipeRead(inner.clone()),
        path: String::from("pipe"),
        offset: 0,
        readable: true,
        writable: false,
    }));
    let write_file = Arc::new(Mutex::new(File {
        file_type: FileType::PipeWrite(inner),
        path: String::from("pipe"),
        offset: 0,
        readable: false,
        writable: true,
    }));

    let Some(read_fd) = alloc_fd(&process, read_file) else { return err(errno::ENOSPC) };
    let Some(write_fd) = alloc_fd(&process, write_file) else { return err(errno::ENOSPC) };

    if fds_ptr != 0 {
        let out = unsafe { user_slice_mut(fds_ptr, 16) };
        out[0..8].copy_from_slice(&(read_fd as u64).to_le_bytes());
        out[8..16].copy_from_slice(&(write_fd as u64).to_le_bytes());
    }
    0
}

pub(crate) fn do_join(pid: u64) -> u64 {
    process::join(ProcessId(pid)).unwrap_or(err(errno::EINVAL))
}

/// The native syscall dispatcher. `trap_rip` is the saved ring-3
/// instruction pointer the asm trampoline read out of the `iretq` frame
/// before touching anything else — C8's cross-privilege safety check:
/// a value at or above [`config::KERNEL_SPACE_BASE`] here means the
/// thread's user-mode return address has been corrupted into kernel
/// space, and there is no safe way to `iretq` back to it.
#[no_mangle]
pub extern "C" fn dispatch(number: u64, arg0: u64, arg1: u64, arg2: u64, trap_rip: u64) -> u64 {
    if trap_rip >= config::KERNEL_SPACE_BASE {
        crate::log_error!("syscall trap entry with corrupted RIP {:#x}, halting.", trap_rip);
        loop {
            x86_64::instructions::hlt();
        }
    }

    if let Some(process) = current_process() {
        if process.inner.lock().compat_mode {
            return compat::dispatch_compat(number, arg0, arg1, arg2);
        }
    }

    match number {
        SYS_EXIT => do_exit(arg0),
        SYS_READ => do_read(arg0, arg1, arg2),
        SYS_WRITE => do_write(arg0, arg1, arg2),
        SYS_OPEN => match unsafe { read_user_cstr(arg0, 256) } {
            Some(path) => do_open(&path, arg1),
            None => err(errno::EINVAL),
        },
        SYS_CLOSE => do_close(arg0),
        SYS_CHDIR => match unsafe { read_user_cstr(arg0, 256) } {
            Some(path) => do_chdir(&path),
            None => err(errno::EINVAL),
        },
        SYS_GETPID => do_getpid(),
        SYS_MKDIR => match unsafe { read_user_cstr(arg0, 256) } {
            Some(path) => do_mkdir(&path),
            None => err(errno::EINVAL),
        },
        SYS_SOCKET => do_socket(),
        SYS_ACCEPT => do_accept(arg0, arg1),
        SYS_SEND => do_send(arg0, arg1, arg2),
        SYS_RECV => do_recv(arg0, arg1, arg2),
        SYS_BIND => do_bind(arg0, arg1),
        SYS_LISTEN => do_listen(arg0),
        SYS_CREATE => match unsafe { read_user_cstr(arg0, 256) } {
            Some(path) => do_create(&path),
            None => err(errno::EINVAL),
        },
        SYS_READDIR => do_readdir(arg0, arg1, arg2),
        SYS_KBHIT => do_kbhit(),
        SYS_CLEAR => do_clear(),
        SYS_MEMINFO => do_meminfo(arg0),
        SYS_GETCWD => do_getcwd(arg0, arg1),
        _ => err(errno::ENOSYS),
    }
}
