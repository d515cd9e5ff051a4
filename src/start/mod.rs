//! The high-level start routine: everything between the entry trampoline
//! and the jump into the loaded interpreter.

use core::mem::size_of;

use crate::arch;
use crate::elf::loader::map_image;
use crate::elf::symbol::{STT_OBJECT, find_symbol};
use crate::elf::program_header::ProgramHeader;
use crate::io_macros::{fatal, loader_warn as warn};
use crate::libc::{mem, str};
use crate::page_size::PageLayout;
use crate::reserve::{self, PreloadRange, QUIET_RESERVE_LIMIT, ReservedList};
use crate::syscall::mmap::{
    MAP_ANONYMOUS, MAP_FAILED, MAP_FIXED, MAP_NORESERVE, MAP_PRIVATE, PROT_EXEC, PROT_NONE,
    PROT_READ, mmap, mprotect,
};
use crate::syscall::process;

use auxiliary_vector::{
    AT_BASE, AT_EGID, AT_ENTRY, AT_EUID, AT_FLAGS, AT_GID, AT_NULL, AT_PAGE_SIZE, AT_PHDR,
    AT_PHENT, AT_PHNUM, AT_SYSINFO, AT_SYSINFO_EHDR, AT_UID, AuxiliaryVectorItem, get_auxiliary,
    is_in_preload_range, set_auxiliary_values,
};
use environment_variables::EnvironmentIter;

pub(crate) mod auxiliary_vector;
pub(crate) mod environment_variables;

/// Everything the components share, initialised exactly once from the
/// incoming stack and passed around by reference instead of living in
/// scattered globals.
pub(crate) struct Preloader<'a> {
    pub pages: PageLayout,
    /// Page-rounded extent of the loader's own text and data.
    pub image_start: usize,
    pub image_end: usize,
    pub ranges: ReservedList<'a>,
}

// End of the loader image, courtesy of the linker.
unsafe extern "C" {
    static _end: u8;
}

/// The symbol in the main image that receives the reservation list.
const PRELOAD_INFO_SYMBOL: &[u8] = b"wine_main_preload_info";

/// Called from the entry trampoline with the address of the slot holding
/// the original stack pointer. Repeats what the kernel does when it execs
/// a dynamically linked binary, then returns the interpreter entry point;
/// the trampoline jumps there with the rewritten stack.
pub(crate) unsafe extern "C" fn loader_start(stack: *mut *mut usize) -> usize {
    unsafe {
        let stack_base = *stack;
        let argc = *stack_base;
        let argv = stack_base.add(1) as *mut *mut u8;

        if argc < 2 {
            fatal!("Usage: {} wine_binary [args]\n", str::cstr_display(*argv));
        }

        // Walk the environment for the one variable we recognize; the
        // auxiliary vector begins one word past its terminator.
        let mut environment = EnvironmentIter::new(argv.add(argc + 1) as *mut *mut u8);
        let mut reserve_value: Option<&[u8]> = None;
        while let Some((name, value)) = environment.next() {
            if name == b"WINEPRELOADRESERVE" {
                reserve_value = Some(value);
            }
        }
        let auxv = environment.into_inner().add(1) as *mut AuxiliaryVectorItem;

        let pages = PageLayout::new(get_auxiliary(auxv, AT_PAGE_SIZE, 0x1000));
        let mut loader = Preloader {
            pages,
            image_start: pages.page_start(arch::entry_address()),
            image_end: pages.page_end((&raw const _end) as usize),
            ranges: ReservedList::global(),
        };

        if let Some(value) = reserve_value {
            match reserve::parse_range(value, pages) {
                Err(_) => fatal!(
                    "invalid WINEPRELOADRESERVE value '{}'\n",
                    str::bytes_display(value)
                ),
                Ok(None) => {}
                Ok(Some((start, end))) => {
                    if end > loader.image_start && start <= loader.image_end {
                        warn!(
                            "WINEPRELOADRESERVE range {:#x}-{:#x} overlaps preloader {:#x}-{:#x}\n",
                            start, end, loader.image_start, loader.image_end
                        );
                    } else {
                        loader.ranges.append_user_range(start, end);
                    }
                }
            }
        }

        reserve_ranges(&mut loader, stack_base as usize, auxv as usize);

        // An executable page at the top of the 2G arena defeats no-exec
        // schemes built on the code segment limit.
        let limit_page = 0x8000_0000usize - pages.size();
        if loader.ranges.is_addr_reserved(limit_page) {
            mprotect(limit_page as *mut u8, pages.size(), PROT_EXEC | PROT_READ);
        }

        // Map the target, then the interpreter it names.
        let main_image = map_image(*argv.add(1), &loader);
        if main_image.interp_vaddr == 0 {
            fatal!(
                "{}: no program interpreter\n",
                str::cstr_display(*argv.add(1))
            );
        }
        let interp_path = main_image.base.wrapping_add(main_image.interp_vaddr) as *const u8;
        let interp_image = map_image(interp_path, &loader);

        #[cfg(debug_assertions)]
        {
            warn!(
                "preloader: main image {:#x}-{:#x} bias {:#x}\n",
                main_image.map_start, main_image.map_end, main_image.base
            );
            warn!(
                "preloader: interpreter {:#x}-{:#x} bias {:#x}\n",
                interp_image.map_start, interp_image.map_end, interp_image.base
            );
        }

        // Hand the reservation list to the loaded binary.
        match find_symbol(&main_image, PRELOAD_INFO_SYMBOL, STT_OBJECT) {
            Some(address) => {
                *(address as *mut *const PreloadRange) = loader.ranges.as_ptr();
            }
            None => warn!("wine_main_preload_info not found\n"),
        }

        let new_entries = [
            AuxiliaryVectorItem::new(AT_PHDR, main_image.phdr as usize),
            AuxiliaryVectorItem::new(AT_PHENT, size_of::<ProgramHeader>()),
            AuxiliaryVectorItem::new(AT_PHNUM, main_image.phnum),
            AuxiliaryVectorItem::new(AT_PAGE_SIZE, pages.size()),
            AuxiliaryVectorItem::new(AT_BASE, interp_image.base),
            AuxiliaryVectorItem::new(AT_FLAGS, get_auxiliary(auxv, AT_FLAGS, 0)),
            AuxiliaryVectorItem::new(AT_ENTRY, main_image.entry),
            AuxiliaryVectorItem::new(AT_UID, get_auxiliary(auxv, AT_UID, process::getuid())),
            AuxiliaryVectorItem::new(AT_EUID, get_auxiliary(auxv, AT_EUID, process::geteuid())),
            AuxiliaryVectorItem::new(AT_GID, get_auxiliary(auxv, AT_GID, process::getgid())),
            AuxiliaryVectorItem::new(AT_EGID, get_auxiliary(auxv, AT_EGID, process::getegid())),
        ];

        // The vDSO entries go if either now points into a reserved range.
        let mut delete_tags = [AT_NULL; 2];
        let mut delete_count = 0;
        if is_in_preload_range(auxv, AT_SYSINFO, &loader.ranges)
            || is_in_preload_range(auxv, AT_SYSINFO_EHDR, &loader.ranges)
        {
            delete_tags[0] = AT_SYSINFO;
            delete_tags[1] = AT_SYSINFO_EHDR;
            delete_count = 2;
        }

        // Drop argv[0] so the loaded program never sees us.
        set_process_name(argc, argv);
        *stack_base.add(1) = argc - 1;
        *stack = stack_base.add(1);

        let rewritten_auxv =
            set_auxiliary_values(auxv, &new_entries, &delete_tags[..delete_count], stack);

        #[cfg(debug_assertions)]
        {
            dump_auxiliary(rewritten_auxv);
            dump_maps();
        }
        #[cfg(not(debug_assertions))]
        let _ = rewritten_auxv;

        interp_image.entry
    }
}

/// Back every listed range with a no-access mapping. An entry that holds
/// the incoming stack, or that the kernel will not pin, is dropped from
/// the list (quietly for the low 64k, with a warning otherwise).
unsafe fn reserve_ranges(loader: &mut Preloader<'_>, stack_base: usize, auxv_address: usize) {
    let mut index = 0;
    loop {
        let range = loader.ranges.get(index);
        if range.size == 0 {
            break;
        }

        if auxv_address >= range.addr && stack_base <= range.end() {
            loader.ranges.remove(index);
            continue;
        }

        let mapped = unsafe {
            mmap(
                range.addr as *mut u8,
                range.size,
                PROT_NONE,
                MAP_FIXED | MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE,
                -1,
                0,
            )
        };
        if mapped == MAP_FAILED {
            if range.addr >= QUIET_RESERVE_LIMIT {
                warn!(
                    "preloader: Warning: failed to reserve range {:#x}-{:#x}\n",
                    range.addr,
                    range.end()
                );
            }
            loader.ranges.remove(index);
            continue;
        }

        index += 1;
    }
}

/// Set the process short name to the target's basename and compact the
/// argv strings down over argv[0], so process listings show the loaded
/// program rather than the loader.
unsafe fn set_process_name(argc: usize, argv: *mut *mut u8) {
    unsafe {
        let target = str::cstr_bytes(*argv.add(1));
        let name = str::basename(target);
        if process::prctl(process::PR_SET_NAME, name.as_ptr() as usize) == -1 {
            return;
        }

        let last = *argv.add(argc - 1);
        let end = last.add(str::strlen(last));
        let offset = *argv.add(1) as usize - *argv as usize;
        let length = end as usize - *argv.add(1) as usize + 1;
        mem::memmove((*argv.add(1)).sub(offset), *argv.add(1), length);
        mem::memset(end.sub(offset), 0, offset);
        for index in 1..argc {
            *argv.add(index) = (*argv.add(index)).sub(offset);
        }
    }
}

#[cfg(debug_assertions)]
unsafe fn dump_auxiliary(av: *const AuxiliaryVectorItem) {
    for item in unsafe { auxiliary_vector::AuxiliaryVectorIter::new(av) } {
        warn!("{:#x} = {:#x}\n", item.a_type, item.a_val);
    }
}

#[cfg(debug_assertions)]
unsafe fn dump_maps() {
    use crate::libc::io::STD_ERR;
    use crate::syscall::files;

    let mut buffer = [0u8; 1024];
    unsafe {
        let fd = files::open(c"/proc/self/maps".as_ptr() as *const u8, files::O_RDONLY);
        if fd == -1 {
            return;
        }
        loop {
            let count = files::read(fd, buffer.as_mut_ptr(), buffer.len());
            if count <= 0 {
                break;
            }
            files::write(STD_ERR, buffer.as_ptr(), count as usize);
        }
        files::close(fd);
    }
}
