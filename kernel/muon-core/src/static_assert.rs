//! Compile-time assertions.

/// Asserts a boolean condition at compile time.
#[macro_export]
macro_rules! static_assert {
    ($cond:expr $(, $msg:literal)?) => {
        const _: () = assert!($cond $(, $msg)?);
    };
}

/// Asserts that a type has the given size at compile time.
///
/// Used for wire formats and hardware descriptors whose layout the other
/// side of the bus dictates.
#[macro_export]
macro_rules! static_assert_size {
    ($ty:ty, $size:expr) => {
        const _: () = assert!(::core::mem::size_of::<$ty>() == $size);
    };
}
