use memchr::memchr;

use crate::libc::str;

/// An iterator over the null-terminated list of pointers to
/// `NAME=value` strings the kernel placed after the argument vector.
///
/// The initial pointer can be found one word after the end of the
/// argument slice:
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
/// | ...                 |
/// |---------------------|
/// ```
#[derive(Clone, Copy)]
pub(crate) struct EnvironmentIter(*mut *mut u8);

impl EnvironmentIter {
    pub(crate) fn new(environment_pointer: *mut *mut u8) -> Self {
        Self(environment_pointer)
    }

    /// Extracts the inner pointer, which after exhaustion rests on the
    /// environment terminator (the auxiliary vector starts one word up).
    pub(crate) fn into_inner(self) -> *mut *mut u8 {
        self.0
    }
}

impl Iterator for EnvironmentIter {
    type Item = (&'static [u8], &'static [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        unsafe {
            if self.0.is_null() {
                return None;
            }
            let string_pointer = *self.0;

            // At the end of the list, return `None` and don't progress.
            if string_pointer.is_null() {
                return None;
            }

            let bytes = str::cstr_bytes(string_pointer);
            self.0 = self.0.add(1);

            // A variable without '=' yields an empty value.
            Some(match memchr(b'=', bytes) {
                Some(split) => (&bytes[..split], &bytes[split + 1..]),
                None => (bytes, &bytes[bytes.len()..]),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::EnvironmentIter;

    #[test]
    fn splits_variables_and_stops_at_the_terminator() {
        let mut storage = [
            b"PATH=/bin\0".to_vec(),
            b"WINEPRELOADRESERVE=10000-20000\0".to_vec(),
            b"ODDBALL\0".to_vec(),
        ];
        let mut pointers: Vec<*mut u8> =
            storage.iter_mut().map(|s| s.as_mut_ptr()).collect();
        pointers.push(core::ptr::null_mut());

        let mut environment = EnvironmentIter::new(pointers.as_mut_ptr());
        assert_eq!(
            environment.next(),
            Some((&b"PATH"[..], &b"/bin"[..]))
        );
        assert_eq!(
            environment.next(),
            Some((&b"WINEPRELOADRESERVE"[..], &b"10000-20000"[..]))
        );
        assert_eq!(environment.next(), Some((&b"ODDBALL"[..], &b""[..])));
        assert_eq!(environment.next(), None);
        assert_eq!(environment.next(), None, "does not advance past the end");

        let resting = environment.into_inner();
        assert_eq!(resting as usize, unsafe { pointers.as_ptr().add(3) } as usize);
    }
}
