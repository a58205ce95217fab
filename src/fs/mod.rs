pub mod vfs;
pub mod inode;
pub mod file;
pub mod dentry;
pub mod mount;
pub mod error;
pub mod pipe;
pub mod fd;
pub mod ramfs;

use spin::Mutex;
use lazy_static::lazy_static;
use vfs::Vfs;

lazy_static! {
    pub static ref VFS: Mutex<Vfs> = Mutex::new(Vfs::new());
}

/// Initialize the VFS with RAMFS at root. On-disk filesystems (ext2 and
/// the like) and their block-device drivers are out of scope for the
/// kernel execution core — `RamFs` is the only `FileSystem` the VFS
/// contract needs a concrete backend for.
pub fn init() {
    let mut vfs = VFS.lock();

    // Mount the primary RAMFS at "/"
    let ramfs: &'static ramfs::RamFs = &ramfs::RAMFS_INSTANCE;
    vfs.mount("/", ramfs);

    // Mount a separate TmpFS at "/tmp"
    let tmpfs: &'static ramfs::RamFs = &ramfs::TMPFS_INSTANCE;
    vfs.mount("/tmp", tmpfs);

    drop(vfs);
    seed_default_files();

    crate::log_info!("VFS initialized: ramfs at /, tmpfs at /tmp.");
}

fn seed_default_files() {
    use crate::fs::VFS;
    let mut vfs = VFS.lock();
    let _ = vfs.mkdir("/boot");
    let _ = vfs.mkdir("/etc");
    let _ = vfs.mkdir("/home");
    let _ = vfs.create("/README.md");
    let _ = vfs.write_file("/README.md", 0, b"# Vireo\nA small x86_64 kernel written in Rust.\n");
    let _ = vfs.create("/BUILD.md");
    let _ = vfs.write_file("/BUILD.md", 0, b"# Build Dependencies\nnasm, ld, grub-mkrescue, qemu, rust nightly\n");
    let _ = vfs.create("/boot/kernel.bin");
    let _ = vfs.write_file("/boot/kernel.bin", 0, b"[ELF binary]");
    let _ = vfs.create("/etc/hostname");
    let _ = vfs.write_file("/etc/hostname", 0, b"vireo\n");
}
