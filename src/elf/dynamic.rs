// Dynamic-section tags the symbol lookup cares about.
pub(crate) const DT_NULL: isize = 0;
pub(crate) const DT_HASH: isize = 4;
pub(crate) const DT_STRTAB: isize = 5;
pub(crate) const DT_SYMTAB: isize = 6;
pub(crate) const DT_STRSZ: isize = 10;
pub(crate) const DT_GNU_HASH: isize = 0x6fff_fef5;

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct Dyn {
    pub d_tag: isize,
    pub d_val: usize,
}
