use crate::collector::Phase;

/// Snapshot of a heap's bookkeeping, see [`Heap::statistics`](crate::Heap::statistics).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapStatistics {
    /// Registered handles, roots and interior ones.
    pub handles: usize,
    /// Allocations currently linked into the meta set.
    pub metas: usize,
    pub gray_objects: usize,
    /// Constructed instances; an array allocation counts every element.
    pub live_objects: usize,
    /// Storage held by constructed allocations, metas included.
    pub live_bytes: usize,
    pub phase: Phase,
    pub total_gc_cycles_count: usize,
    pub total_objects_swept: usize,
    pub total_objects_allocated: usize,
}

struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

impl std::fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap statistics:")?;
        writeln!(f, "  Phase: {}", self.phase)?;
        writeln!(f, "  Handles: {}", self.handles)?;
        writeln!(f, "  Allocations: {}", self.metas)?;
        writeln!(f, "  Gray objects: {}", self.gray_objects)?;
        writeln!(
            f,
            "  Live objects: {} ({})",
            self.live_objects,
            formatted_size(self.live_bytes)
        )?;
        writeln!(f, "  Total GC cycles count: {}", self.total_gc_cycles_count)?;
        writeln!(
            f,
            "  Total objects allocated: {}",
            self.total_objects_allocated
        )?;
        writeln!(
            f,
            "  Total objects swept: {} ({:.2}%)",
            self.total_objects_swept,
            if self.total_objects_allocated == 0 {
                0.0
            } else {
                (self.total_objects_swept as f64 / self.total_objects_allocated as f64) * 100.0
            }
        )?;
        Ok(())
    }
}
