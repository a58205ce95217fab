//! ELF64 loader (C7) — spec §3 "ElfImage"/"ExecError", §4.7.
//!
//! Parses a static ET_EXEC x86_64 binary and maps its PT_LOAD segments
//! into a *foreign* address space (one that isn't active yet) through
//! `AddressSpace::map_page` + the scratch-page `copy_to`/`memset_in`
//! helpers, rather than writing through the current CR3.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use x86_64::structures::paging::{Page, Size4KiB};
use x86_64::VirtAddr;

use crate::memory::paging::{AddressSpace, MapFlags};
use crate::memory::FRAME_ALLOCATOR;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;
const PT_LOAD: u32 = 1;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

#[derive(Debug)]
pub enum ExecError {
    /// Couldn't find or read the file through the VFS.
    File,
    /// Missing/wrong `e_ident` magic.
    Magic,
    /// Not a 64-bit little-endian object.
    Class,
    /// `e_machine` isn't `EM_X86_64`.
    Machine,
    /// `e_type` isn't `ET_EXEC` (no dynamic linking in scope).
    Type,
    /// Frame allocation or mapping failed.
    Memory,
    /// A `PT_LOAD` segment's header or file range doesn't fit the image.
    Segment,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecError::File => write!(f, "file not found"),
            ExecError::Magic => write!(f, "bad ELF magic"),
            ExecError::Class => write!(f, "unsupported ELF class/endianness"),
            ExecError::Machine => write!(f, "unsupported machine (need x86_64)"),
            ExecError::Type => write!(f, "unsupported ELF type (need ET_EXEC)"),
            ExecError::Memory => write!(f, "out of memory mapping segments"),
            ExecError::Segment => write!(f, "malformed program header"),
        }
    }
}

/// What a successful load hands back to `process::create_user_process`.
pub struct ElfImage {
    pub entry: VirtAddr,
    /// Lowest `p_vaddr` among `PT_LOAD` segments.
    pub base: VirtAddr,
    /// Highest mapped address (`p_vaddr + p_memsz`, page-aligned up).
    pub top: VirtAddr,
    /// Number of `PT_LOAD` segments mapped.
    pub segments: usize,
}

struct Ehdr {
    e_entry: u64,
    e_phoff: u64,
    e_phentsize: u16,
    e_phnum: u16,
}

impl Ehdr {
    fn parse(data: &[u8]) -> Result<Self, ExecError> {
        if data.len() < EHDR_SIZE || data[0..4] != ELF_MAGIC {
            return Err(ExecError::Magic);
        }
        if data[4] != ELFCLASS64 || data[5] != ELFDATA2LSB {
            return Err(ExecError::Class);
        }
        let e_type = u16::from_le_bytes([data[16], data[17]]);
        let e_machine = u16::from_le_bytes([data[18], data[19]]);
        if e_machine != EM_X86_64 {
            return Err(ExecError::Machine);
        }
        if e_type != ET_EXEC {
            return Err(ExecError::Type);
        }
        Ok(Ehdr {
            e_entry: u64::from_le_bytes(data[24..32].try_into().unwrap()),
            e_phoff: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            e_phentsize: u16::from_le_bytes([data[54], data[55]]),
            e_phnum: u16::from_le_bytes([data[56], data[57]]),
        })
    }
}

struct Phdr {
    p_type: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_flags: u32,
}

impl Phdr {
    fn parse(data: &[u8]) -> Result<Self, ExecError> {
        if data.len() < PHDR_SIZE {
            return Err(ExecError::Segment);
        }
        Ok(Phdr {
            p_type: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            p_flags: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            p_offset: u64::from_le_bytes(data[8..16].try_into().unwrap()),
            p_vaddr: u64::from_le_bytes(data[16..24].try_into().unwrap()),
            p_filesz: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            p_memsz: u64::from_le_bytes(data[40..48].try_into().unwrap()),
        })
    }
}

const PF_W: u32 = 0x2;

fn read_file_all(path: &str) -> Result<Vec<u8>, ExecError> {
    let vfs = crate::fs::VFS.lock();
    let inode = vfs.lookup(path).map_err(|_| ExecError::File)?;
    let mut buf = vec![0u8; inode.size];
    let n = vfs.read_file(path, 0, &mut buf).map_err(|_| ExecError::File)?;
    buf.truncate(n);
    Ok(buf)
}

fn program_headers(data: &[u8], ehdr: &Ehdr) -> Result<Vec<Phdr>, ExecError> {
    let mut out = Vec::with_capacity(ehdr.e_phnum as usize);
    for i in 0..ehdr.e_phnum as usize {
        let off = ehdr.e_phoff as usize + i * ehdr.e_phentsize as usize;
        let bytes = data.get(off..).ok_or(ExecError::Segment)?;
        out.push(Phdr::parse(bytes)?);
    }
    Ok(out)
}

/// Load `path` into `target`, an address space that is not necessarily
/// active right now. Every `PT_LOAD` segment is mapped page by page and
/// populated through the cross-space `copy_to`/`memset_in` helpers so
/// this works identically whether `target` is the running process or a
/// brand new one being spun up.
pub fn load(path: &str, target: &AddressSpace) -> Result<ElfImage, ExecError> {
    let data = read_file_all(path)?;
    let ehdr = Ehdr::parse(&data)?;
    let phdrs = program_headers(&data, &ehdr)?;

    let mut base = u64::MAX;
    let mut top = 0u64;
    let mut segments = 0usize;
    for phdr in phdrs.iter().filter(|p| p.p_type == PT_LOAD) {
        if (phdr.p_offset as usize).saturating_add(phdr.p_filesz as usize) > data.len() {
            return Err(ExecError::Segment);
        }
        if phdr.p_filesz > phdr.p_memsz {
            return Err(ExecError::Segment);
        }
        base = base.min(phdr.p_vaddr);
        top = top.max(phdr.p_vaddr + phdr.p_memsz);
        segments += 1;
    }
    if base == u64::MAX {
        return Err(ExecError::Segment);
    }
    let page_size = crate::config::PAGE_SIZE as u64;
    let top_aligned = (top + page_size - 1) & !(page_size - 1);

    for phdr in phdrs.iter().filter(|p| p.p_type == PT_LOAD) {
        let seg_start = VirtAddr::new(phdr.p_vaddr).align_down(page_size);
        let seg_end = VirtAddr::new(phdr.p_vaddr + phdr.p_memsz).align_up(page_size);
        let first_page: Page<Size4KiB> = Page::containing_address(seg_start);
        let page_count = ((seg_end - seg_start) / page_size) as u64;

        let mut flags = MapFlags::USER_ACCESSIBLE;
        if phdr.p_flags & PF_W != 0 {
            flags |= MapFlags::WRITABLE;
        }

        {
            let mut frame_alloc = FRAME_ALLOCATOR.lock();
            for i in 0..page_count {
                let page = first_page + i;
                if target.is_mapped(page.start_address()) {
                    continue;
                }
                let frame = frame_alloc.alloc_block().ok_or(ExecError::Memory)?;
                target
                    .map_page(page, frame, flags, &mut frame_alloc)
                    .map_err(|_| ExecError::Memory)?;
            }
            target.memset_in(seg_start, (seg_end - seg_start) as usize, &mut frame_alloc);
            target.copy_to(
                VirtAddr::new(phdr.p_vaddr),
                &data[phdr.p_offset as usize..phdr.p_offset as usize + phdr.p_filesz as usize],
                &mut frame_alloc,
            );
        }
    }

    Ok(ElfImage {
        entry: VirtAddr::new(ehdr.e_entry),
        base: VirtAddr::new(base),
        top: VirtAddr::new(top_aligned),
        segments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a minimal but well-formed ET_EXEC/EM_X86_64 header followed
    /// by `phdrs`, the way a real static binary's first bytes look.
    fn build_image(entry: u64, phnum: u16, phdrs: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; EHDR_SIZE];
        data[0..4].copy_from_slice(&ELF_MAGIC);
        data[4] = ELFCLASS64;
        data[5] = ELFDATA2LSB;
        data[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        data[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        data[24..32].copy_from_slice(&entry.to_le_bytes());
        data[32..40].copy_from_slice(&(EHDR_SIZE as u64).to_le_bytes()); // e_phoff
        data[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes()); // e_phentsize
        data[56..58].copy_from_slice(&phnum.to_le_bytes());
        data.extend_from_slice(phdrs);
        data
    }

    fn build_phdr(p_type: u32, p_flags: u32, p_offset: u64, p_vaddr: u64, p_filesz: u64, p_memsz: u64) -> Vec<u8> {
        let mut p = vec![0u8; PHDR_SIZE];
        p[0..4].copy_from_slice(&p_type.to_le_bytes());
        p[4..8].copy_from_slice(&p_flags.to_le_bytes());
        p[8..16].copy_from_slice(&p_offset.to_le_bytes());
        p[16..24].copy_from_slice(&p_vaddr.to_le_bytes());
        p[32..40].copy_from_slice(&p_filesz.to_le_bytes());
        p[40..48].copy_from_slice(&p_memsz.to_le_bytes());
        p
    }

    #[test]
    fn rejects_bad_magic() {
        let mut data = build_image(0x1000, 0, &[]);
        data[0] = 0;
        assert!(matches!(Ehdr::parse(&data), Err(ExecError::Magic)));
    }

    #[test]
    fn rejects_wrong_class() {
        let mut data = build_image(0x1000, 0, &[]);
        data[4] = 1; // ELFCLASS32
        assert!(matches!(Ehdr::parse(&data), Err(ExecError::Class)));
    }

    #[test]
    fn rejects_wrong_machine() {
        let mut data = build_image(0x1000, 0, &[]);
        data[18..20].copy_from_slice(&3u16.to_le_bytes()); // EM_386
        assert!(matches!(Ehdr::parse(&data), Err(ExecError::Machine)));
    }

    #[test]
    fn rejects_non_exec_type() {
        let mut data = build_image(0x1000, 0, &[]);
        data[16..18].copy_from_slice(&3u16.to_le_bytes()); // ET_DYN
        assert!(matches!(Ehdr::parse(&data), Err(ExecError::Type)));
    }

    #[test]
    fn parses_valid_header_and_one_load_segment() {
        let phdr = build_phdr(PT_LOAD, PF_W, 0, 0x4000_0000, 16, 16);
        let data = build_image(0x4000_0010, 1, &phdr);
        let ehdr = Ehdr::parse(&data).expect("valid header must parse");
        assert_eq!(ehdr.e_entry, 0x4000_0010);
        let phdrs = program_headers(&data, &ehdr).expect("program headers must parse");
        assert_eq!(phdrs.len(), 1);
        assert_eq!(phdrs[0].p_type, PT_LOAD);
        assert_eq!(phdrs[0].p_vaddr, 0x4000_0000);
        assert_eq!(phdrs[0].p_flags & PF_W, PF_W);
    }

    #[test]
    fn truncated_program_header_table_is_a_segment_error() {
        // Claim two headers but only provide one's worth of bytes.
        let phdr = build_phdr(PT_LOAD, PF_W, 0, 0x4000_0000, 16, 16);
        let data = build_image(0x4000_0010, 2, &phdr);
        let ehdr = Ehdr::parse(&data).unwrap();
        assert!(matches!(program_headers(&data, &ehdr), Err(ExecError::Segment)));
    }
}
