use bitflags::bitflags;

use crate::syscall::mmap::{PROT_EXEC, PROT_READ, PROT_WRITE};

pub(crate) const PT_LOAD: u32 = 1;
pub(crate) const PT_DYNAMIC: u32 = 2;
pub(crate) const PT_INTERP: u32 = 3;
pub(crate) const PT_PHDR: u32 = 6;
pub(crate) const PT_TLS: u32 = 7;

bitflags! {
    /// Segment permission bits (PF_*).
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub(crate) struct SegmentFlags: u32 {
        const EXECUTE = 0x1;
        const WRITE = 0x2;
        const READ = 0x4;
    }
}

impl SegmentFlags {
    /// Translate to the mmap protection the segment gets mapped with.
    pub(crate) fn to_prot(self) -> usize {
        let mut prot = 0;
        if self.contains(Self::READ) {
            prot |= PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= PROT_WRITE;
        }
        if self.contains(Self::EXECUTE) {
            prot |= PROT_EXEC;
        }
        prot
    }
}

/// One program header entry. The field order differs between the 32- and
/// 64-bit layouts, hence the conditional placement of `p_flags`.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct ProgramHeader {
    pub p_type: u32,
    #[cfg(target_pointer_width = "64")]
    pub p_flags: u32,
    pub p_offset: usize,
    pub p_vaddr: usize,
    pub p_paddr: usize,
    pub p_filesz: usize,
    pub p_memsz: usize,
    #[cfg(target_pointer_width = "32")]
    pub p_flags: u32,
    pub p_align: usize,
}

impl ProgramHeader {
    pub(crate) fn flags(&self) -> SegmentFlags {
        SegmentFlags::from_bits_truncate(self.p_flags)
    }
}
