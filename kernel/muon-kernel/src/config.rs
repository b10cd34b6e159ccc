//! Compile-time kernel configuration.

/// Frames handed to the heap at boot (64 KiB).
pub const HEAP_INITIAL_PAGES: usize = 16;

/// Minimum frames per heap growth step.
pub const HEAP_GROW_MIN_PAGES: usize = 16;

/// Blocks on the root RAM disk (512 KiB).
pub const RAMDISK_BLOCKS: u32 = 1024;

/// Default kernel thread stack size.
pub const THREAD_STACK_SIZE: usize = 16 * 1024;

/// Kernel version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
