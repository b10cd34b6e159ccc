//! Synchronization primitives.
//!
//! Muon is single-CPU and cooperative, so a spin lock is only ever contended
//! against an interrupt handler or (in host tests) other test threads. It is
//! still the right shape: const-constructable, guard-based, and honest about
//! mutual exclusion where the cooperative discipline alone would be implicit.

mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard};
