/// Write a formatted warning to standard error and keep going.
macro_rules! loader_warn {
    ($($arg:tt)*) => {
        $crate::libc::io::report(format_args!($($arg)*))
    };
}

/// Write a formatted message to standard error and exit with status 1.
/// Every terminal error in the loader funnels through here; there is no
/// unwinding to run.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        $crate::libc::io::report(format_args!($($arg)*));
        $crate::syscall::exit::exit(1)
    }};
}

/// Fixed-capacity overflow is a programming error, not a runtime
/// condition; name the site and bail.
macro_rules! loader_assert {
    ($condition:expr $(,)?) => {
        if !$condition {
            $crate::io_macros::fatal!(concat!(
                "assertion failed: ",
                stringify!($condition),
                "\n  --> ",
                file!(),
                ":",
                line!(),
                "\n"
            ));
        }
    };
}

pub(crate) use {fatal, loader_assert, loader_warn};
