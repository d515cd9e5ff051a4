//! Locating one named global in an already-mapped image, through either
//! hash table flavor its dynamic section offers.

use crate::elf::dynamic::{DT_GNU_HASH, DT_HASH, DT_NULL, DT_STRSZ, DT_STRTAB, DT_SYMTAB, Dyn};
use crate::elf::loader::LoadedImage;

pub(crate) const STB_GLOBAL: u8 = 1;
pub(crate) const STT_OBJECT: u8 = 1;

/// One dynamic symbol. The field order differs between the 32- and 64-bit
/// layouts, hence the conditional placement of the value and size.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct Symbol {
    /// String table index of the symbol name.
    pub st_name: u32,
    #[cfg(target_pointer_width = "32")]
    pub st_value: usize,
    #[cfg(target_pointer_width = "32")]
    pub st_size: usize,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
    #[cfg(target_pointer_width = "64")]
    pub st_value: usize,
    #[cfg(target_pointer_width = "64")]
    pub st_size: usize,
}

impl Symbol {
    #[inline(always)]
    pub(crate) fn binding(&self) -> u8 {
        self.st_info >> 4
    }

    #[inline(always)]
    pub(crate) fn symbol_type(&self) -> u8 {
        self.st_info & 0xf
    }
}

/// The classical SysV shift-and-xor hash.
pub(crate) fn elf_hash(name: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for &byte in name {
        hash = (hash << 4).wrapping_add(byte as u32);
        let high = hash & 0xf000_0000;
        hash ^= high;
        hash ^= high >> 24;
    }
    hash
}

/// The DJB-style hash the GNU table uses.
pub(crate) fn gnu_hash(name: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &byte in name {
        hash = hash.wrapping_mul(33).wrapping_add(byte as u32);
    }
    hash
}

/// Table pointers harvested from a dynamic section, already rebased to
/// runtime addresses.
struct DynamicTables {
    strings: *const u8,
    string_size: usize,
    symbols: *const Symbol,
    hash: *const u32,
    gnu_hash: *const u32,
}

unsafe fn collect_tables(dynamic: *const Dyn, count: usize, bias: usize) -> DynamicTables {
    let mut tables = DynamicTables {
        strings: core::ptr::null(),
        string_size: 0,
        symbols: core::ptr::null(),
        hash: core::ptr::null(),
        gnu_hash: core::ptr::null(),
    };

    for index in 0..count {
        let entry = unsafe { *dynamic.add(index) };
        match entry.d_tag {
            DT_NULL => break,
            DT_STRTAB => tables.strings = entry.d_val.wrapping_add(bias) as *const u8,
            DT_STRSZ => tables.string_size = entry.d_val,
            DT_SYMTAB => tables.symbols = entry.d_val.wrapping_add(bias) as *const Symbol,
            DT_HASH => tables.hash = entry.d_val.wrapping_add(bias) as *const u32,
            DT_GNU_HASH => tables.gnu_hash = entry.d_val.wrapping_add(bias) as *const u32,
            _ => {}
        }
    }
    tables
}

/// Name comparison, refusing offsets that would read past the declared
/// string table size.
unsafe fn symbol_name_matches(tables: &DynamicTables, symbol: &Symbol, name: &[u8]) -> bool {
    let offset = symbol.st_name as usize;
    if tables.string_size != 0 && offset.saturating_add(name.len()) >= tables.string_size {
        return false;
    }
    let candidate = unsafe { core::slice::from_raw_parts(tables.strings.add(offset), name.len() + 1) };
    &candidate[..name.len()] == name && candidate[name.len()] == 0
}

unsafe fn matches(tables: &DynamicTables, index: usize, name: &[u8], symbol_type: u8) -> Option<&'static Symbol> {
    let symbol = unsafe { &*tables.symbols.add(index) };
    if symbol.binding() == STB_GLOBAL
        && symbol.symbol_type() == symbol_type
        && unsafe { symbol_name_matches(tables, symbol, name) }
    {
        Some(symbol)
    } else {
        None
    }
}

unsafe fn gnu_lookup(
    tables: &DynamicTables,
    name: &[u8],
    symbol_type: u8,
) -> Option<&'static Symbol> {
    let table = tables.gnu_hash;
    let hash = gnu_hash(name);

    unsafe {
        let nbuckets = *table.add(0) as usize;
        let symbol_bias = *table.add(1) as usize;
        let bloom_words = *table.add(2) as usize;
        if nbuckets == 0 {
            return None;
        }
        // The Bloom filter is skipped; one lookup per process makes the
        // chain walk cheap enough.
        let bitmask = table.add(4) as *const usize;
        let buckets = bitmask.add(bloom_words) as *const u32;
        let chains = buckets.add(nbuckets);

        let mut index = *buckets.add(hash as usize % nbuckets) as usize;
        if index == 0 {
            return None;
        }
        loop {
            let chain_hash = *chains.add(index - symbol_bias);
            if (chain_hash ^ hash) & !1 == 0 {
                if let Some(symbol) = matches(tables, index, name, symbol_type) {
                    return Some(symbol);
                }
            }
            // The low bit marks the end of a bucket's chain.
            if chain_hash & 1 != 0 {
                return None;
            }
            index += 1;
        }
    }
}

unsafe fn classic_lookup(
    tables: &DynamicTables,
    name: &[u8],
    symbol_type: u8,
) -> Option<&'static Symbol> {
    let table = tables.hash;

    unsafe {
        let nbuckets = *table.add(0) as usize;
        if nbuckets == 0 {
            return None;
        }
        let buckets = table.add(2);
        let chains = buckets.add(nbuckets);

        let mut index = *buckets.add(elf_hash(name) as usize % nbuckets) as usize;
        while index != 0 {
            if let Some(symbol) = matches(tables, index, name, symbol_type) {
                return Some(symbol);
            }
            index = *chains.add(index) as usize;
        }
    }
    None
}

/// Find a named global of the requested type in the image's dynamic
/// symbol table, preferring the GNU hash table when both are present.
/// Returns the symbol's runtime address.
pub(crate) unsafe fn find_symbol(image: &LoadedImage, name: &[u8], symbol_type: u8) -> Option<usize> {
    if image.dynamic.is_null() {
        return None;
    }
    let tables = unsafe { collect_tables(image.dynamic, image.dynamic_count, image.base) };
    if tables.symbols.is_null() || tables.strings.is_null() {
        return None;
    }

    let symbol = unsafe {
        if !tables.gnu_hash.is_null() {
            gnu_lookup(&tables, name, symbol_type)
        } else if !tables.hash.is_null() {
            classic_lookup(&tables, name, symbol_type)
        } else {
            None
        }
    }?;

    Some(symbol.st_value.wrapping_add(image.base))
}
