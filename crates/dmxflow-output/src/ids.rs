//! Output slot allocation

/// Logical output number inside a plugin (0-based)
pub type OutputId = u32;

/// Hands out output slots in enumeration order.
///
/// Owned by the plugin registry and reset on every rescan, so slot numbers
/// always match the order devices were discovered in.
#[derive(Debug, Clone)]
pub struct SlotAllocator {
    next: OutputId,
    capacity: usize,
}

impl SlotAllocator {
    /// Create an allocator for at most `capacity` slots
    pub fn new(capacity: usize) -> Self {
        Self { next: 0, capacity }
    }

    /// Next free slot, or `None` once capacity is reached
    pub fn allocate(&mut self) -> Option<OutputId> {
        if self.next as usize >= self.capacity {
            return None;
        }
        let id = self.next;
        self.next += 1;
        Some(id)
    }

    /// Forget all allocations
    pub fn reset(&mut self) {
        self.next = 0;
    }

    /// Number of slots handed out since the last reset
    pub fn allocated(&self) -> usize {
        self.next as usize
    }

    /// Maximum number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
