//! The Mach-O variant: reserve the same address ranges, then let the
//! host dynamic loader map the main image and dig its entry point out of
//! the load commands.

use core::mem::transmute;

use crate::io_macros::{fatal, loader_warn as warn};
use crate::libc::str;
use crate::page_size::PageLayout;
use crate::reserve::{self, PreloadRange, ReservedList};
use crate::syscall::mmap::{
    MAP_ANONYMOUS, MAP_FAILED, MAP_FIXED, MAP_PRIVATE, PROT_NONE, mincore, mmap, munmap,
};

mod entry;

/// Fixed on this host; there is no auxiliary vector to ask.
const PAGES: PageLayout = PageLayout::new(0x1000);

/// Window dyld must not hand out while it resolves the main image.
const BUILTIN_DLL_RANGE: PreloadRange = PreloadRange::new(0x7a00_0000, 0x0200_0000);

const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_EXECUTE: u32 = 0x2;
const CPU_TYPE_X86_64: i32 = 0x0100_0007;

const LC_UNIXTHREAD: u32 = 0x5;
const LC_MAIN: u32 = 0x8000_0028;

const RTLD_NOW: i32 = 0x2;

#[repr(C)]
struct MachHeader64 {
    magic: u32,
    cputype: i32,
    cpusubtype: i32,
    filetype: u32,
    ncmds: u32,
    sizeofcmds: u32,
    flags: u32,
    reserved: u32,
}

#[repr(C)]
struct LoadCommand {
    cmd: u32,
    cmdsize: u32,
}

#[repr(C)]
struct EntryPointCommand {
    cmd: u32,
    cmdsize: u32,
    entryoff: u64,
    stacksize: u64,
}

/// x86_64 thread state as recorded in LC_UNIXTHREAD.
#[repr(C)]
struct ThreadState64 {
    rax: u64,
    rbx: u64,
    rcx: u64,
    rdx: u64,
    rdi: u64,
    rsi: u64,
    rbp: u64,
    rsp: u64,
    r8: u64,
    r9: u64,
    r10: u64,
    r11: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    rip: u64,
    rflags: u64,
    cs: u64,
    fs: u64,
    gs: u64,
}

unsafe extern "C" {
    fn _dyld_func_lookup(name: *const u8, address: *mut *const ()) -> i32;
}

struct DyldFunctions {
    dlopen: unsafe extern "C" fn(*const u8, i32) -> *mut (),
    dlsym: unsafe extern "C" fn(*mut (), *const u8) -> *mut (),
    image_count: unsafe extern "C" fn() -> u32,
    image_header: unsafe extern "C" fn(u32) -> *const MachHeader64,
    image_slide: unsafe extern "C" fn(u32) -> isize,
}

unsafe fn get_dyld_func(name: &core::ffi::CStr) -> *const () {
    let mut address: *const () = core::ptr::null();
    unsafe { _dyld_func_lookup(name.as_ptr() as *const u8, &mut address) };
    if address.is_null() {
        fatal!(
            "Failed to get function pointer for {}\n",
            name.to_str().unwrap_or("?")
        );
    }
    address
}

impl DyldFunctions {
    unsafe fn load() -> Self {
        unsafe {
            Self {
                dlopen: transmute(get_dyld_func(c"__dyld_dlopen")),
                dlsym: transmute(get_dyld_func(c"__dyld_dlsym")),
                image_count: transmute(get_dyld_func(c"__dyld_image_count")),
                image_header: transmute(get_dyld_func(c"__dyld_get_image_header")),
                image_slide: transmute(get_dyld_func(c"__dyld_get_image_vmaddr_slide")),
            }
        }
    }
}

/// Probe whether any page of the range is already resident. Queried in
/// big blocks first, shrinking to single pages where the big query fails.
unsafe fn is_region_empty(range: PreloadRange) -> bool {
    let mut vector = [0u8; 1024];
    let mut block = vector.len() * PAGES.size();

    let mut position = 0;
    while position < range.size {
        let mut size = if position + block <= range.size {
            block
        } else {
            range.size - position
        };
        if unsafe { mincore((range.addr + position) as *mut u8, size, vector.as_mut_ptr()) } == -1 {
            if size > PAGES.size() {
                block = PAGES.size();
                size = 0;
            }
        } else {
            for page in 0..size / PAGES.size() {
                if vector[page] & 1 != 0 {
                    return false;
                }
            }
        }
        position += size;
    }
    true
}

/// Claim one range with a no-access mapping. The kernel here may ignore
/// the address hint, so a mapping that lands elsewhere is released and,
/// if the target range is entirely unresident, retried with MAP_FIXED.
unsafe fn map_region(range: &mut PreloadRange) -> bool {
    let mut flags = MAP_PRIVATE | MAP_ANONYMOUS;
    if range.addr == 0 {
        flags |= MAP_FIXED;
    }

    loop {
        let mapped = unsafe { mmap(range.addr as *mut u8, range.size, PROT_NONE, flags, -1, 0) };
        if mapped as usize == range.addr {
            return true;
        }
        if mapped != MAP_FAILED {
            unsafe { munmap(mapped, range.size) };
        }
        if flags & MAP_FIXED != 0 {
            break;
        }
        if !unsafe { is_region_empty(*range) } {
            break;
        }
        flags |= MAP_FIXED;
    }

    warn!(
        "preloader: Warning: failed to reserve range {:#x}-{:#x}\n",
        range.addr,
        range.end()
    );
    false
}

unsafe fn find_executable(
    dyld: &DyldFunctions,
    slide: &mut isize,
) -> Option<&'static MachHeader64> {
    unsafe {
        // Image 0 is the loader itself.
        for index in 1..(dyld.image_count)() {
            let header = (dyld.image_header)(index);
            if header.is_null() {
                continue;
            }
            let header = &*header;
            if header.magic != MH_MAGIC_64
                || header.cputype != CPU_TYPE_X86_64
                || header.filetype != MH_EXECUTE
            {
                continue;
            }
            *slide = (dyld.image_slide)(index);
            return Some(header);
        }
    }
    None
}

/// Scan the load commands for an entry point, preferring LC_MAIN. The
/// entry kind is reported through `is_unix_thread` so the trampoline can
/// set up the matching argument layout.
unsafe fn get_entry_point(
    header: &MachHeader64,
    slide: isize,
    is_unix_thread: *mut i32,
) -> Option<usize> {
    let base = header as *const MachHeader64;

    unsafe {
        let mut cmd = base.add(1) as *const LoadCommand;
        for _ in 0..header.ncmds {
            if (*cmd).cmd == LC_MAIN {
                *is_unix_thread = 0;
                let entry = &*(cmd as *const EntryPointCommand);
                return Some(base as usize + entry.entryoff as usize);
            }
            cmd = cmd.byte_add((*cmd).cmdsize as usize);
        }

        let mut cmd = base.add(1) as *const LoadCommand;
        for _ in 0..header.ncmds {
            if (*cmd).cmd == LC_UNIXTHREAD {
                *is_unix_thread = 1;
                let state = &*(cmd.byte_add(16) as *const ThreadState64);
                return Some((state.rip as isize + slide) as usize);
            }
            cmd = cmd.byte_add((*cmd).cmdsize as usize);
        }
    }
    None
}

/// Called from the entry trampoline. Reserves the ranges, has dyld load
/// the main image, publishes the reservation list, and returns the entry
/// point the trampoline should continue at.
pub(crate) unsafe extern "C" fn start(stack: *mut usize, is_unix_thread: *mut i32) -> usize {
    unsafe {
        let argc = *stack;
        let argv = stack.add(1) as *mut *mut u8;
        if argc < 2 {
            fatal!("Usage: {} wine_binary [args]\n", str::cstr_display(*argv));
        }

        // Skip the parameters, then scan the environment.
        let mut pointer = argv.add(argc + 1);
        let mut reserve_value: Option<&[u8]> = None;
        while !(*pointer).is_null() {
            if let Some(value) = str::env_value(str::cstr_bytes(*pointer), b"WINEPRELOADRESERVE") {
                reserve_value = Some(value);
            }
            pointer = pointer.add(1);
        }

        let mut ranges = ReservedList::global();
        if let Some(value) = reserve_value {
            match reserve::parse_range(value, PAGES) {
                Err(_) => fatal!(
                    "invalid WINEPRELOADRESERVE value '{}'\n",
                    str::bytes_display(value)
                ),
                Ok(None) => {}
                Ok(Some((start, end))) => ranges.append_user_range(start, end),
            }
        }

        let mut index = 0;
        loop {
            let mut range = ranges.get(index);
            if range.size == 0 {
                break;
            }
            if !map_region(&mut range) {
                ranges.remove(index);
                continue;
            }
            index += 1;
        }

        // Placeholder so dyld cannot claim the builtin-DLL window while
        // resolving the main image.
        let mut builtin_dlls = BUILTIN_DLL_RANGE;
        if !map_region(&mut builtin_dlls) {
            builtin_dlls.size = 0;
        }

        let dyld = DyldFunctions::load();

        let target = *argv.add(1);
        let module = (dyld.dlopen)(target, RTLD_NOW);
        if module.is_null() {
            fatal!("{}: could not load binary\n", str::cstr_display(target));
        }

        if builtin_dlls.size != 0 {
            munmap(builtin_dlls.addr as *mut u8, builtin_dlls.size);
        }

        let preload_info = (dyld.dlsym)(module, c"wine_main_preload_info".as_ptr() as *const u8);
        if !preload_info.is_null() {
            *(preload_info as *mut *const PreloadRange) = ranges.as_ptr();
        } else {
            warn!("wine_main_preload_info not found\n");
        }

        // There is no way to translate the dlopen handle to the mach
        // header, so scan the loaded images for the executable.
        let mut slide: isize = 0;
        let Some(header) = find_executable(&dyld, &mut slide) else {
            fatal!("{}: could not find mach header\n", str::cstr_display(target));
        };
        let Some(entry) = get_entry_point(header, slide, is_unix_thread) else {
            fatal!("{}: could not find entry point\n", str::cstr_display(target));
        };
        entry
    }
}
