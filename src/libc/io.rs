use core::fmt;

pub(crate) const STD_ERR: i32 = 2;

pub(crate) unsafe fn write_str(file_descriptor: i32, text: &str) {
    unsafe { crate::syscall::files::write(file_descriptor, text.as_ptr(), text.len()) };
}

/// Fixed sink for warning and fatal messages. Output past the capacity is
/// dropped rather than reallocated; no message the loader prints comes
/// close to the limit.
pub(crate) struct MessageBuffer {
    buffer: [u8; 256],
    length: usize,
}

impl MessageBuffer {
    pub(crate) const fn new() -> Self {
        Self {
            buffer: [0; 256],
            length: 0,
        }
    }

    pub(crate) fn as_str(&self) -> &str {
        // Only ever filled through write_str below, so this stays UTF-8.
        unsafe { core::str::from_utf8_unchecked(&self.buffer[..self.length]) }
    }
}

impl fmt::Write for MessageBuffer {
    fn write_str(&mut self, text: &str) -> fmt::Result {
        let room = self.buffer.len() - self.length;
        let take = text.len().min(room);
        self.buffer[self.length..self.length + take].copy_from_slice(&text.as_bytes()[..take]);
        self.length += take;
        Ok(())
    }
}

/// Format into a stack buffer, then emit with a single write to fd 2.
pub(crate) fn report(args: fmt::Arguments<'_>) {
    let mut message = MessageBuffer::new();
    let _ = fmt::write(&mut message, args);
    unsafe { write_str(STD_ERR, message.as_str()) };
}
