//! Typed identifiers for kernel resources.
//!
//! Newtypes keep process ids, thread ids, job ids, and file descriptors from
//! being mixed up at compile time.

use core::fmt;

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident, $raw:ty) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name($raw);

        impl $name {
            /// Creates a new id from the raw value.
            pub const fn new(val: $raw) -> Self {
                Self(val)
            }

            /// Returns the raw value.
            pub const fn as_raw(self) -> $raw {
                self.0
            }

            /// Returns the value as `usize`, for table indexing.
            pub const fn as_usize(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id! {
    /// Process identifier.
    Pid, u32
}

define_id! {
    /// Thread identifier.
    Tid, u32
}

define_id! {
    /// Shell-level job identifier.
    JobId, u32
}

define_id! {
    /// File descriptor number.
    Fd, u32
}

impl Fd {
    /// Standard input.
    pub const STDIN: Self = Self(0);
    /// Standard output.
    pub const STDOUT: Self = Self(1);
    /// Standard error.
    pub const STDERR: Self = Self(2);
    /// First descriptor handed out by `open`.
    pub const FIRST_USER: Self = Self(3);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_roundtrip() {
        assert_eq!(Tid::new(7).as_raw(), 7);
        assert_eq!(Pid::new(3).as_usize(), 3);
    }

    #[test]
    fn reserved_descriptors() {
        assert_eq!(Fd::STDIN.as_raw(), 0);
        assert_eq!(Fd::STDERR.as_raw(), 2);
        assert!(Fd::FIRST_USER > Fd::STDERR);
    }

    #[test]
    fn display_is_raw_value() {
        assert_eq!(std::format!("{}", JobId::new(12)), "12");
    }
}
