//! Human-readable memory report.
//!
//! Combines PMM and heap statistics into the text block the `meminfo` shell
//! command prints.

use core::fmt;

use crate::heap::HeapStats;
use crate::pmm::FrameStats;

/// Snapshot of both allocators, rendered via `Display`.
#[derive(Debug, Clone, Copy)]
pub struct MemoryReport {
    /// Page frame allocator counters.
    pub frames: FrameStats,
    /// Heap sizes and counters.
    pub heap: HeapStats,
}

impl fmt::Display for MemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let f_stats = &self.frames;
        writeln!(f, "Physical memory:")?;
        writeln!(
            f,
            "  frames: total={} used={} free={} ({} KB)",
            f_stats.total_pages,
            f_stats.used_pages,
            f_stats.free_pages,
            f_stats.total_pages * 4,
        )?;

        let h = &self.heap;
        writeln!(f, "Kernel heap:")?;
        writeln!(
            f,
            "  base={:#x} size={} used={} free={}",
            h.base, h.size, h.used, h.free,
        )?;
        writeln!(
            f,
            "  allocs={} frees={} splits={} coalesces={}",
            h.allocs, h.frees, h.splits, h.coalesces,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_contains_every_counter() {
        let report = MemoryReport {
            frames: FrameStats {
                total_pages: 1024,
                used_pages: 100,
                free_pages: 924,
            },
            heap: HeapStats {
                base: 0x1000,
                size: 65536,
                used: 4096,
                free: 61408,
                free_blocks: 1,
                allocs: 12,
                frees: 9,
                splits: 4,
                coalesces: 3,
            },
        };
        let text = std::format!("{report}");
        assert!(text.contains("total=1024"));
        assert!(text.contains("4096 KB"));
        assert!(text.contains("base=0x1000"));
        assert!(text.contains("coalesces=3"));
    }
}
