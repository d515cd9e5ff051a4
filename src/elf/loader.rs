//! Mapping one ELF object the way the kernel would: walk the program
//! headers, mirror each PT_LOAD into the address space, zero the BSS
//! tail, and remember where everything landed.

use core::mem::size_of;

use thiserror::Error;

use crate::elf::dynamic::Dyn;
use crate::elf::header::{ELF_MAGIC, EM_NATIVE, ET_DYN, ET_EXEC, ElfHeader, MACHINE_NAME};
use crate::elf::program_header::{
    PT_DYNAMIC, PT_INTERP, PT_LOAD, PT_PHDR, ProgramHeader,
};
use crate::io_macros::fatal;
use crate::libc::{mem, str};
use crate::page_size::PageLayout;
use crate::start::Preloader;
use crate::syscall::files;
use crate::syscall::mmap::{
    MAP_ANONYMOUS, MAP_FAILED, MAP_FIXED, MAP_PRIVATE, PROT_NONE, PROT_WRITE, mmap, mprotect,
};

/// Size of the header buffer read up front; identity, program headers and
/// the interpreter path all have to fit in it.
pub(crate) const HEADER_BUFFER_BYTES: usize = 0x800;

/// Fixed slots for translated PT_LOAD entries.
pub(crate) const MAX_LOAD_COMMANDS: usize = 16;

/// One PT_LOAD translated into mapping terms: the page-rounded file-backed
/// window, the exact data end, and the end of the memory image.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub(crate) struct LoadCmd {
    pub map_start: usize,
    pub map_end: usize,
    pub data_end: usize,
    pub alloc_end: usize,
    pub file_offset: usize,
    pub prot: usize,
}

/// Everything `plan_load` learns from the header buffer. Addresses are
/// still the object's own virtual addresses; the mapping step applies the
/// load bias.
#[derive(PartialEq, Eq, Debug)]
pub(crate) struct LoadPlan {
    pub cmds: [LoadCmd; MAX_LOAD_COMMANDS],
    pub cmd_count: usize,
    pub object_type: u16,
    pub entry: usize,
    pub phoff: usize,
    pub phnum: usize,
    pub phdr_vaddr: usize,
    pub dynamic_vaddr: usize,
    pub dynamic_count: usize,
    pub interp_vaddr: usize,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub(crate) enum ImageError {
    #[error("not an ELF binary... don't know how to load it")]
    BadMagic,
    #[error("not an {} ELF binary... don't know how to load it", MACHINE_NAME)]
    WrongMachine,
    #[error("unsupported ELF object type")]
    UnsupportedObjectType,
    #[error("unsupported program header entry size")]
    BadHeaderEntrySize,
    #[error("oops... not enough space for load commands")]
    TooManyLoadCommands,
    #[error("oops... not enough space for ELF headers")]
    HeaderTableOverflow,
    #[error("ELF load command alignment not page-aligned")]
    MisalignedSegment,
    #[error("ELF load command address/offset not properly aligned")]
    MisalignedOffset,
    #[error("no segments to load")]
    NoLoadSegments,
}

/// Describes one mapped object. Immutable once built.
pub(crate) struct LoadedImage {
    /// Load bias: runtime address minus the object's chosen base.
    pub base: usize,
    /// Biased entry point.
    pub entry: usize,
    /// Runtime address of the program header table.
    pub phdr: *const ProgramHeader,
    pub phnum: usize,
    /// Runtime address of the dynamic section, null if absent.
    pub dynamic: *const Dyn,
    pub dynamic_count: usize,
    /// PT_INTERP virtual offset within the object, 0 if absent.
    pub interp_vaddr: usize,
    pub map_start: usize,
    pub map_end: usize,
}

/// Validate the header buffer and translate the program headers into load
/// commands. Pure with respect to the address space.
pub(crate) fn plan_load(
    buffer: &[u8; HEADER_BUFFER_BYTES],
    pages: PageLayout,
) -> Result<LoadPlan, ImageError> {
    let header: ElfHeader = unsafe { core::ptr::read_unaligned(buffer.as_ptr().cast()) };

    if header.e_ident[..4] != ELF_MAGIC {
        return Err(ImageError::BadMagic);
    }
    if header.e_machine != EM_NATIVE {
        return Err(ImageError::WrongMachine);
    }
    if header.e_type != ET_DYN && header.e_type != ET_EXEC {
        return Err(ImageError::UnsupportedObjectType);
    }
    if header.e_phentsize as usize != size_of::<ProgramHeader>() {
        return Err(ImageError::BadHeaderEntrySize);
    }

    let phnum = header.e_phnum as usize;
    if phnum > MAX_LOAD_COMMANDS {
        return Err(ImageError::TooManyLoadCommands);
    }
    let table_bytes = phnum * size_of::<ProgramHeader>();
    if header.e_phoff.saturating_add(table_bytes) > HEADER_BUFFER_BYTES {
        return Err(ImageError::HeaderTableOverflow);
    }

    let mut plan = LoadPlan {
        cmds: [LoadCmd::default(); MAX_LOAD_COMMANDS],
        cmd_count: 0,
        object_type: header.e_type,
        entry: header.e_entry,
        phoff: header.e_phoff,
        phnum,
        phdr_vaddr: 0,
        dynamic_vaddr: 0,
        dynamic_count: 0,
        interp_vaddr: 0,
    };

    for index in 0..phnum {
        let offset = header.e_phoff + index * size_of::<ProgramHeader>();
        let ph: ProgramHeader =
            unsafe { core::ptr::read_unaligned(buffer.as_ptr().add(offset).cast()) };

        match ph.p_type {
            // Recorded verbatim; the load bias is applied after mapping.
            PT_DYNAMIC => {
                plan.dynamic_vaddr = ph.p_vaddr;
                plan.dynamic_count = ph.p_memsz / size_of::<Dyn>();
            }
            PT_PHDR => plan.phdr_vaddr = ph.p_vaddr,
            PT_INTERP => plan.interp_vaddr = ph.p_vaddr,
            PT_LOAD => {
                if ph.p_align == 0 || ph.p_align & pages.mask() != 0 {
                    return Err(ImageError::MisalignedSegment);
                }
                if ph.p_vaddr.wrapping_sub(ph.p_offset) & (ph.p_align - 1) != 0 {
                    return Err(ImageError::MisalignedOffset);
                }
                plan.cmds[plan.cmd_count] = LoadCmd {
                    map_start: ph.p_vaddr & !(ph.p_align - 1),
                    map_end: pages.page_end(ph.p_vaddr + ph.p_filesz),
                    data_end: ph.p_vaddr + ph.p_filesz,
                    alloc_end: ph.p_vaddr + ph.p_memsz,
                    file_offset: ph.p_offset & !(ph.p_align - 1),
                    prot: ph.flags().to_prot(),
                };
                plan.cmd_count += 1;
            }
            // PT_TLS is left untouched: the interpreter sets up TLS
            // itself, we only emulate the kernel.
            _ => {}
        }
    }

    if plan.cmd_count == 0 {
        return Err(ImageError::NoLoadSegments);
    }
    Ok(plan)
}

/// Open and map one object, returning where it landed. Every failure mode
/// in here is terminal.
pub(crate) unsafe fn map_image(path: *const u8, loader: &Preloader) -> LoadedImage {
    let name = unsafe { str::cstr_display(path) };

    let fd = unsafe { files::open(path, files::O_RDONLY) };
    if fd == -1 {
        fatal!("{name}: could not open\n");
    }

    let mut buffer = [0u8; HEADER_BUFFER_BYTES];
    if unsafe { files::read(fd, buffer.as_mut_ptr(), HEADER_BUFFER_BYTES) }
        != HEADER_BUFFER_BYTES as isize
    {
        fatal!("{name}: failed to read ELF header\n");
    }

    let plan = match plan_load(&buffer, loader.pages) {
        Ok(plan) => plan,
        Err(error) => fatal!("{name}: {error}\n"),
    };

    let first = plan.cmds[0];
    let last = plan.cmds[plan.cmd_count - 1];
    let extent = last.alloc_end - first.map_start;

    let mut bias = 0usize;
    if plan.object_type == ET_DYN {
        // One covering file mapping; the kernel picks the base and the
        // bias falls out of it.
        let mapped = unsafe {
            mmap(
                first.map_start as *mut u8,
                extent,
                first.prot,
                MAP_PRIVATE,
                fd,
                first.file_offset,
            )
        };
        if mapped == MAP_FAILED {
            fatal!("{name}: failed to map segment\n");
        }
        bias = (mapped as usize).wrapping_sub(first.map_start);
        if last.alloc_end > first.map_end {
            unsafe {
                mprotect(
                    bias.wrapping_add(first.map_end) as *mut u8,
                    last.alloc_end - first.map_end,
                    PROT_NONE,
                )
            };
        }
    } else if first.map_start + extent > loader.image_start && first.map_start <= loader.image_end
    {
        fatal!(
            "{name}: binary overlaps preloader ({:#x}-{:#x})\n",
            first.map_start,
            first.map_start + extent
        );
    }

    let map_start = first.map_start.wrapping_add(bias);
    let map_end = map_start + extent;

    let mut phdr_vaddr = plan.phdr_vaddr;
    for index in 0..plan.cmd_count {
        let cmd = plan.cmds[index];

        // The first ET_DYN command rides the covering mapping; everything
        // else is pinned at its biased address.
        let inherits_initial_mapping = plan.object_type == ET_DYN && index == 0;
        if !inherits_initial_mapping && cmd.map_end > cmd.map_start {
            unsafe {
                mmap(
                    bias.wrapping_add(cmd.map_start) as *mut u8,
                    cmd.map_end - cmd.map_start,
                    cmd.prot,
                    MAP_FIXED | MAP_PRIVATE,
                    fd,
                    cmd.file_offset,
                )
            };
        }

        // PT_PHDR is optional; fall back to the segment whose file window
        // covers the program header table.
        if phdr_vaddr == 0
            && cmd.file_offset <= plan.phoff
            && cmd.map_end - cmd.map_start + cmd.file_offset
                >= plan.phoff + plan.phnum * size_of::<ProgramHeader>()
        {
            phdr_vaddr = cmd.map_start + plan.phoff - cmd.file_offset;
        }

        if cmd.alloc_end > cmd.data_end {
            unsafe { zero_fill_tail(&cmd, bias, loader.pages) };
        }
    }

    if phdr_vaddr == 0 {
        fatal!("no program header\n");
    }

    files::close(fd);

    LoadedImage {
        base: bias,
        entry: plan.entry.wrapping_add(bias),
        phdr: phdr_vaddr.wrapping_add(bias) as *const ProgramHeader,
        phnum: plan.phnum,
        dynamic: if plan.dynamic_vaddr != 0 {
            plan.dynamic_vaddr.wrapping_add(bias) as *const Dyn
        } else {
            core::ptr::null()
        },
        dynamic_count: plan.dynamic_count,
        interp_vaddr: plan.interp_vaddr,
        map_start,
        map_end,
    }
}

/// Zero everything between a segment's file data and its memory image:
/// the partial page by hand (briefly making it writable if need be), any
/// whole pages with a fresh anonymous mapping. The interpreter relies on
/// the trailing page being zeroed all the way to its end.
unsafe fn zero_fill_tail(cmd: &LoadCmd, bias: usize, pages: PageLayout) {
    let zero = bias.wrapping_add(cmd.data_end);
    let zero_end = pages.page_end(bias.wrapping_add(cmd.alloc_end));
    let zero_page = pages.page_end(zero).min(zero_end);

    unsafe {
        if zero_page > zero {
            if cmd.prot & PROT_WRITE == 0 {
                mprotect(
                    pages.page_start(zero) as *mut u8,
                    pages.size(),
                    cmd.prot | PROT_WRITE,
                );
            }
            mem::memset(zero as *mut u8, 0, zero_page - zero);
            if cmd.prot & PROT_WRITE == 0 {
                mprotect(pages.page_start(zero) as *mut u8, pages.size(), cmd.prot);
            }
        }

        if zero_end > zero_page {
            mmap(
                zero_page as *mut u8,
                zero_end - zero_page,
                cmd.prot,
                MAP_ANONYMOUS | MAP_PRIVATE | MAP_FIXED,
                -1,
                0,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::program_header::SegmentFlags;
    use crate::syscall::mmap::{PROT_EXEC, PROT_READ};

    const PAGES: PageLayout = PageLayout::new(0x1000);

    fn put<T: Copy>(buffer: &mut [u8; HEADER_BUFFER_BYTES], offset: usize, value: &T) {
        let bytes = unsafe {
            core::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>())
        };
        buffer[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn header(e_type: u16, phnum: u16, phoff: usize) -> ElfHeader {
        ElfHeader {
            e_ident: {
                let mut ident = [0u8; 16];
                ident[..4].copy_from_slice(&ELF_MAGIC);
                ident
            },
            e_type,
            e_machine: EM_NATIVE,
            e_version: 1,
            e_entry: 0x1040,
            e_phoff: phoff,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: size_of::<ElfHeader>() as u16,
            e_phentsize: size_of::<ProgramHeader>() as u16,
            e_phnum: phnum,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        }
    }

    fn load_segment(vaddr: usize, offset: usize, filesz: usize, memsz: usize) -> ProgramHeader {
        ProgramHeader {
            p_type: PT_LOAD,
            p_flags: (SegmentFlags::READ | SegmentFlags::EXECUTE).bits(),
            p_offset: offset,
            p_vaddr: vaddr,
            p_paddr: vaddr,
            p_filesz: filesz,
            p_memsz: memsz,
            p_align: 0x1000,
        }
    }

    #[test]
    fn plans_a_minimal_pie() {
        let mut buffer = [0u8; HEADER_BUFFER_BYTES];
        put(&mut buffer, 0, &header(ET_DYN, 1, 64));
        put(&mut buffer, 64, &load_segment(0, 0, 0x1000, 0x2000));

        let plan = plan_load(&buffer, PAGES).unwrap();
        assert_eq!(plan.cmd_count, 1);
        assert_eq!(
            plan.cmds[0],
            LoadCmd {
                map_start: 0,
                map_end: 0x1000,
                data_end: 0x1000,
                alloc_end: 0x2000,
                file_offset: 0,
                prot: PROT_READ | PROT_EXEC,
            }
        );
        assert_eq!(plan.object_type, ET_DYN);
        assert_eq!(plan.entry, 0x1040);
        assert_eq!(plan.phnum, 1);
    }

    #[test]
    fn records_dynamic_interp_and_phdr() {
        let mut buffer = [0u8; HEADER_BUFFER_BYTES];
        put(&mut buffer, 0, &header(ET_DYN, 4, 64));
        let mut phdr = load_segment(0, 0, 0x3000, 0x3000);
        put(&mut buffer, 64, &phdr);
        phdr.p_type = PT_PHDR;
        phdr.p_vaddr = 64;
        put(&mut buffer, 64 + size_of::<ProgramHeader>(), &phdr);
        phdr.p_type = PT_INTERP;
        phdr.p_vaddr = 0x200;
        put(&mut buffer, 64 + 2 * size_of::<ProgramHeader>(), &phdr);
        phdr.p_type = PT_DYNAMIC;
        phdr.p_vaddr = 0x2000;
        phdr.p_memsz = 4 * size_of::<Dyn>();
        put(&mut buffer, 64 + 3 * size_of::<ProgramHeader>(), &phdr);

        let plan = plan_load(&buffer, PAGES).unwrap();
        assert_eq!(plan.phdr_vaddr, 64);
        assert_eq!(plan.interp_vaddr, 0x200);
        assert_eq!(plan.dynamic_vaddr, 0x2000);
        assert_eq!(plan.dynamic_count, 4);
    }

    #[test]
    fn rejects_bad_identity() {
        let mut buffer = [0u8; HEADER_BUFFER_BYTES];
        let mut bad = header(ET_DYN, 1, 64);
        bad.e_ident[0] = 0x7e;
        put(&mut buffer, 0, &bad);
        assert_eq!(plan_load(&buffer, PAGES), Err(ImageError::BadMagic));

        let mut wrong_machine = header(ET_DYN, 1, 64);
        wrong_machine.e_machine = 0xbeef;
        put(&mut buffer, 0, &wrong_machine);
        assert_eq!(plan_load(&buffer, PAGES), Err(ImageError::WrongMachine));

        const ET_REL: u16 = 1;
        put(&mut buffer, 0, &header(ET_REL, 1, 64));
        assert_eq!(
            plan_load(&buffer, PAGES),
            Err(ImageError::UnsupportedObjectType)
        );
    }

    #[test]
    fn rejects_oversized_header_tables() {
        let mut buffer = [0u8; HEADER_BUFFER_BYTES];
        put(
            &mut buffer,
            0,
            &header(ET_DYN, MAX_LOAD_COMMANDS as u16 + 1, 64),
        );
        assert_eq!(
            plan_load(&buffer, PAGES),
            Err(ImageError::TooManyLoadCommands)
        );

        put(&mut buffer, 0, &header(ET_DYN, 16, HEADER_BUFFER_BYTES - 64));
        assert_eq!(
            plan_load(&buffer, PAGES),
            Err(ImageError::HeaderTableOverflow)
        );
    }

    #[test]
    fn rejects_misaligned_segments() {
        let mut buffer = [0u8; HEADER_BUFFER_BYTES];
        put(&mut buffer, 0, &header(ET_DYN, 1, 64));
        let mut segment = load_segment(0, 0, 0x1000, 0x1000);
        segment.p_align = 0x800;
        put(&mut buffer, 64, &segment);
        assert_eq!(
            plan_load(&buffer, PAGES),
            Err(ImageError::MisalignedSegment)
        );

        let mut skewed = load_segment(0x1234, 0x1000, 0x1000, 0x1000);
        skewed.p_align = 0x1000;
        put(&mut buffer, 64, &skewed);
        assert_eq!(plan_load(&buffer, PAGES), Err(ImageError::MisalignedOffset));
    }

    #[test]
    fn requires_a_load_segment() {
        let mut buffer = [0u8; HEADER_BUFFER_BYTES];
        put(&mut buffer, 0, &header(ET_DYN, 1, 64));
        let mut note = load_segment(0, 0, 0x10, 0x10);
        note.p_type = 4; // PT_NOTE
        put(&mut buffer, 64, &note);
        assert_eq!(plan_load(&buffer, PAGES), Err(ImageError::NoLoadSegments));
    }

    #[test]
    fn two_segment_object_keeps_command_order() {
        let mut buffer = [0u8; HEADER_BUFFER_BYTES];
        put(&mut buffer, 0, &header(ET_EXEC, 2, 64));
        put(&mut buffer, 64, &load_segment(0x40_0000, 0, 0x1000, 0x1000));
        let mut data = load_segment(0x40_2000, 0x1000, 0x800, 0x1800);
        data.p_flags = (SegmentFlags::READ | SegmentFlags::WRITE).bits();
        put(&mut buffer, 64 + size_of::<ProgramHeader>(), &data);

        let plan = plan_load(&buffer, PAGES).unwrap();
        assert_eq!(plan.cmd_count, 2);
        assert_eq!(plan.cmds[1].map_start, 0x40_2000);
        assert_eq!(plan.cmds[1].map_end, 0x40_3000);
        assert_eq!(plan.cmds[1].data_end, 0x40_2800);
        assert_eq!(plan.cmds[1].alloc_end, 0x40_3800);
        // extent spans from the first map_start to the last alloc_end
        assert_eq!(plan.cmds[1].alloc_end - plan.cmds[0].map_start, 0x3800);
    }
}
