//! The kernel-supplied auxiliary vector, and the in-place rewrite that
//! makes it describe the program we loaded instead of us.

use core::mem::size_of;

use crate::reserve::ReservedList;

pub(crate) const AT_NULL: usize = 0;
pub(crate) const AT_PHDR: usize = 3;
pub(crate) const AT_PHENT: usize = 4;
pub(crate) const AT_PHNUM: usize = 5;
pub(crate) const AT_PAGE_SIZE: usize = 6;
pub(crate) const AT_BASE: usize = 7;
pub(crate) const AT_FLAGS: usize = 8;
pub(crate) const AT_ENTRY: usize = 9;
pub(crate) const AT_UID: usize = 11;
pub(crate) const AT_EUID: usize = 12;
pub(crate) const AT_GID: usize = 13;
pub(crate) const AT_EGID: usize = 14;
pub(crate) const AT_SYSINFO: usize = 32;
pub(crate) const AT_SYSINFO_EHDR: usize = 33;

/// An item in the auxiliary vector.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct AuxiliaryVectorItem {
    pub a_type: usize,
    pub a_val: usize,
}

impl AuxiliaryVectorItem {
    pub(crate) const fn new(a_type: usize, a_val: usize) -> Self {
        Self { a_type, a_val }
    }
}

/// An iterator over an `AT_NULL` terminated list of auxiliary vector items.
///
/// The initial pointer can be found two null words after the end of the
/// environment pointers:
///
/// ```text
/// |---------------------|
/// | arg_count           |
/// |---------------------|
/// | arg_values...       |
/// |---------------------|
/// | null                |
/// |---------------------|
/// | env_pointers...     |
/// |---------------------|
/// | null                |
/// |---------------------|
/// | auxiliary_vector... |
/// |---------------------|
/// | null                |
/// |---------------------|
/// ```
#[derive(Clone, Copy)]
pub(crate) struct AuxiliaryVectorIter(*const AuxiliaryVectorItem);

impl AuxiliaryVectorIter {
    pub(crate) unsafe fn new(pointer: *const AuxiliaryVectorItem) -> Self {
        Self(pointer)
    }
}

impl Iterator for AuxiliaryVectorIter {
    type Item = AuxiliaryVectorItem;

    fn next(&mut self) -> Option<Self::Item> {
        let item = unsafe { *self.0 };

        // At the end of the list, return `None` and don't progress.
        if item.a_type == AT_NULL {
            return None;
        }

        self.0 = unsafe { self.0.add(1) };
        Some(item)
    }
}

/// Fetch one auxiliary value, falling back to `default` if absent.
pub(crate) unsafe fn get_auxiliary(
    pointer: *const AuxiliaryVectorItem,
    tag: usize,
    default: usize,
) -> usize {
    unsafe { AuxiliaryVectorIter::new(pointer) }
        .find(|item| item.a_type == tag)
        .map(|item| item.a_val)
        .unwrap_or(default)
}

/// Whether the given auxiliary value is an address inside a reserved range.
pub(crate) unsafe fn is_in_preload_range(
    pointer: *const AuxiliaryVectorItem,
    tag: usize,
    ranges: &ReservedList<'_>,
) -> bool {
    unsafe { AuxiliaryVectorIter::new(pointer) }
        .find(|item| item.a_type == tag)
        .is_some_and(|item| ranges.is_addr_reserved(item.a_val))
}

unsafe fn position(av: *const AuxiliaryVectorItem, count: usize, tag: usize) -> Option<usize> {
    (0..count).find(|&index| unsafe { (*av.add(index)).a_type } == tag)
}

/// Rewrite the auxiliary vector in place on the original stack.
///
/// Deletions swap with the last entry and truncate; order is not
/// observable downstream. The stack region between the (possibly shifted)
/// top and the vector terminator then moves so the new top stays 16-byte
/// aligned, and the replacement entries are written over or appended to
/// what remains. `stack` is the slot holding the stack-top pointer; it is
/// updated with the new top. Returns the rebased vector address.
pub(crate) unsafe fn set_auxiliary_values(
    av: *mut AuxiliaryVectorItem,
    new_entries: &[AuxiliaryVectorItem],
    delete_tags: &[usize],
    stack: *mut *mut usize,
) -> *mut AuxiliaryVectorItem {
    let item_size = size_of::<AuxiliaryVectorItem>();

    unsafe {
        let mut av_count = 0usize;
        while (*av.add(av_count)).a_type != AT_NULL {
            av_count += 1;
        }

        let mut deleted = 0usize;
        for &tag in delete_tags {
            if let Some(index) = position(av, av_count, tag) {
                *av.add(index) = *av.add(av_count - 1);
                *av.add(av_count - 1) = AuxiliaryVectorItem::new(AT_NULL, 0);
                av_count -= 1;
                deleted += 1;
            }
        }

        let mut added = 0usize;
        for entry in new_entries {
            if position(av, av_count, entry.a_type).is_none() {
                added += 1;
            }
        }

        let source = *stack as usize;
        let shift = (added as isize - deleted as isize) * item_size as isize;
        let destination = (source as isize - shift) as usize & !15;
        let length = av.add(av_count + 1) as usize - source;
        if destination != source {
            core::ptr::copy(source as *const u8, destination as *mut u8, length);
        }
        *stack = destination as *mut usize;
        let av = av.byte_offset(destination as isize - source as isize);

        for entry in new_entries {
            match position(av, av_count, entry.a_type) {
                Some(index) => (*av.add(index)).a_val = entry.a_val,
                None => {
                    *av.add(av_count) = *entry;
                    av_count += 1;
                }
            }
        }
        // Appends may have run over the copied terminator; put it back.
        *av.add(av_count) = AuxiliaryVectorItem::new(AT_NULL, 0);

        av
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reserve::{PreloadRange, ReservedList};

    #[repr(align(16))]
    struct FakeStack([usize; 64]);

    // Lay out [argc][argv0][NULL][NULL][auxv...] the way the kernel does,
    // with the stack top deliberately off the 16-byte grid by one word,
    // as it is after dropping argv[0].
    fn build_stack(auxv: &[(usize, usize)]) -> (Box<FakeStack>, usize, usize) {
        let mut stack = Box::new(FakeStack([0; 64]));
        let top_index = 1; // odd word: 8 mod 16
        stack.0[top_index] = 1; // argc
        stack.0[top_index + 1] = 0xdead_0000; // argv[0]
        stack.0[top_index + 2] = 0; // argv terminator
        stack.0[top_index + 3] = 0; // envp terminator
        let auxv_index = top_index + 4;
        for (offset, &(tag, value)) in auxv.iter().enumerate() {
            stack.0[auxv_index + 2 * offset] = tag;
            stack.0[auxv_index + 2 * offset + 1] = value;
        }
        (stack, top_index, auxv_index)
    }

    fn collect(av: *const AuxiliaryVectorItem) -> Vec<(usize, usize)> {
        unsafe { AuxiliaryVectorIter::new(av) }
            .map(|item| (item.a_type, item.a_val))
            .collect()
    }

    #[test]
    fn realigns_the_stack_without_edits() {
        let (mut stack, top_index, auxv_index) =
            build_stack(&[(AT_PHDR, 0x1000), (AT_NULL, 0)]);
        let mut top = (&raw mut stack.0[top_index]) as *mut usize;
        let av = (&raw mut stack.0[auxv_index]) as *mut AuxiliaryVectorItem;

        let rewritten = unsafe { set_auxiliary_values(av, &[], &[], &mut top) };

        assert_eq!(top as usize % 16, 0);
        assert_eq!(unsafe { *top }, 1, "argc moved with the block");
        assert_eq!(collect(rewritten), vec![(AT_PHDR, 0x1000)]);
    }

    #[test]
    fn overwrites_existing_entries_in_place() {
        let (mut stack, top_index, auxv_index) = build_stack(&[
            (AT_PHDR, 0x1000),
            (AT_PAGE_SIZE, 0x1000),
            (AT_ENTRY, 0x4000),
            (AT_NULL, 0),
        ]);
        let mut top = (&raw mut stack.0[top_index]) as *mut usize;
        let av = (&raw mut stack.0[auxv_index]) as *mut AuxiliaryVectorItem;

        let new_entries = [
            AuxiliaryVectorItem::new(AT_PHDR, 0x7000),
            AuxiliaryVectorItem::new(AT_ENTRY, 0x8000),
        ];
        let rewritten = unsafe { set_auxiliary_values(av, &new_entries, &[], &mut top) };

        let entries = collect(rewritten);
        assert!(entries.contains(&(AT_PHDR, 0x7000)));
        assert!(entries.contains(&(AT_ENTRY, 0x8000)));
        assert!(entries.contains(&(AT_PAGE_SIZE, 0x1000)));
        assert_eq!(entries.len(), 3);
        assert_eq!(top as usize % 16, 0);
    }

    #[test]
    fn deletes_conflicting_sysinfo_entries() {
        let (mut stack, top_index, auxv_index) = build_stack(&[
            (AT_SYSINFO, 0x7000_1000),
            (AT_PHDR, 0x1000),
            (AT_SYSINFO_EHDR, 0x7000_2000),
            (AT_PAGE_SIZE, 0x1000),
            (AT_NULL, 0),
        ]);
        let mut top = (&raw mut stack.0[top_index]) as *mut usize;
        let av = (&raw mut stack.0[auxv_index]) as *mut AuxiliaryVectorItem;

        let rewritten = unsafe {
            set_auxiliary_values(av, &[], &[AT_SYSINFO, AT_SYSINFO_EHDR], &mut top)
        };

        let entries = collect(rewritten);
        assert!(entries.iter().all(|&(tag, _)| tag != AT_SYSINFO));
        assert!(entries.iter().all(|&(tag, _)| tag != AT_SYSINFO_EHDR));
        assert!(entries.contains(&(AT_PHDR, 0x1000)));
        assert!(entries.contains(&(AT_PAGE_SIZE, 0x1000)));
        assert_eq!(entries.len(), 2);
        assert_eq!(top as usize % 16, 0);
        assert_eq!(unsafe { *top }, 1, "argc moved with the block");
    }

    #[test]
    fn appends_missing_entries_and_reterminates() {
        let (mut stack, top_index, auxv_index) = build_stack(&[
            (AT_SYSINFO, 0x7000_1000),
            (AT_SYSINFO_EHDR, 0x7000_2000),
            (AT_PHDR, 0x1000),
            (AT_NULL, 0),
        ]);
        let mut top = (&raw mut stack.0[top_index]) as *mut usize;
        let av = (&raw mut stack.0[auxv_index]) as *mut AuxiliaryVectorItem;

        let new_entries = [
            AuxiliaryVectorItem::new(AT_EGID, 1000),
            AuxiliaryVectorItem::new(AT_PHDR, 0x9000),
        ];
        let rewritten = unsafe {
            set_auxiliary_values(
                av,
                &new_entries,
                &[AT_SYSINFO, AT_SYSINFO_EHDR],
                &mut top,
            )
        };

        let entries = collect(rewritten);
        assert!(entries.contains(&(AT_EGID, 1000)));
        assert!(entries.contains(&(AT_PHDR, 0x9000)));
        assert_eq!(entries.len(), 2);
        assert_eq!(top as usize % 16, 0);
    }

    #[test]
    fn auxiliary_lookup_with_default() {
        let (stack, _, auxv_index) =
            build_stack(&[(AT_PAGE_SIZE, 0x4000), (AT_NULL, 0)]);
        let av = (&raw const stack.0[auxv_index]) as *const AuxiliaryVectorItem;
        assert_eq!(unsafe { get_auxiliary(av, AT_PAGE_SIZE, 0x1000) }, 0x4000);
        assert_eq!(unsafe { get_auxiliary(av, AT_FLAGS, 7) }, 7);
    }

    #[test]
    fn preload_range_membership_reads_the_value() {
        let (stack, _, auxv_index) =
            build_stack(&[(AT_SYSINFO, 0x11_0000), (AT_NULL, 0)]);
        let av = (&raw const stack.0[auxv_index]) as *const AuxiliaryVectorItem;

        let mut entries = [
            PreloadRange::new(0x11_0000, 0x1000),
            PreloadRange::new(0, 0),
        ];
        let ranges = ReservedList::new(&mut entries);
        assert!(unsafe { is_in_preload_range(av, AT_SYSINFO, &ranges) });
        assert!(!unsafe { is_in_preload_range(av, AT_SYSINFO_EHDR, &ranges) });

        let mut empty = [PreloadRange::new(0, 0)];
        let no_ranges = ReservedList::new(&mut empty);
        assert!(!unsafe { is_in_preload_range(av, AT_SYSINFO, &no_ranges) });
    }
}
