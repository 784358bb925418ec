//! Free-list management inside a single native allocation.

use ash::vk;

use super::{align_up, MappedPtr};

/// A contiguous byte range inside a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRange {
    pub offset: u64,
    pub size: u64,
}

impl FreeRange {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// End offset (exclusive).
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    fn overlaps(&self, other: &FreeRange) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// One fixed-size native allocation with an offset-ordered free list.
///
/// Allocation is first-fit in address order. Frees are coalesced with their
/// neighbours so the list never holds two adjacent free ranges.
#[derive(Debug)]
pub struct Chunk {
    memory: vk::DeviceMemory,
    size: u64,
    mapped_base: Option<MappedPtr>,
    free: Vec<FreeRange>,
    /// Live allocations, tracked only when overlap checking is enabled.
    live: Option<Vec<FreeRange>>,
}

impl Chunk {
    /// Wrap a fresh native allocation; the whole range starts out free.
    pub fn new(
        memory: vk::DeviceMemory,
        size: u64,
        mapped_base: Option<MappedPtr>,
        check_overlap: bool,
    ) -> Self {
        Self {
            memory,
            size,
            mapped_base,
            free: vec![FreeRange::new(0, size)],
            live: check_overlap.then(Vec::new),
        }
    }

    /// Native allocation handle.
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Total size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Host pointer at `offset`, if the chunk is mapped.
    pub fn mapped_at(&self, offset: u64) -> Option<MappedPtr> {
        self.mapped_base.map(|base| base.offset(offset))
    }

    /// Free ranges, sorted by offset.
    pub fn free_ranges(&self) -> &[FreeRange] {
        &self.free
    }

    /// Total free bytes.
    pub fn free_bytes(&self) -> u64 {
        self.free.iter().map(|r| r.size).sum()
    }

    /// Whether nothing is allocated from this chunk.
    pub fn is_unused(&self) -> bool {
        self.free.len() == 1 && self.free[0] == FreeRange::new(0, self.size)
    }

    /// Carve `size` bytes aligned to `alignment` out of the first free range that fits.
    ///
    /// Alignment padding in front of the block and any leftover tail are put back
    /// on the free list in place, so the list stays sorted.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Option<FreeRange> {
        let alignment = alignment.max(1);
        for i in 0..self.free.len() {
            let candidate = self.free[i];
            let aligned = align_up(candidate.offset, alignment);
            let correction = aligned - candidate.offset;
            if correction >= candidate.size || candidate.size - correction < size {
                continue;
            }

            self.free.remove(i);
            let mut insert_at = i;
            if correction > 0 {
                self.free
                    .insert(insert_at, FreeRange::new(candidate.offset, correction));
                insert_at += 1;
            }
            let tail = candidate.size - correction - size;
            if tail > 0 {
                self.free
                    .insert(insert_at, FreeRange::new(aligned + size, tail));
            }

            let block = FreeRange::new(aligned, size);
            if let Some(live) = self.live.as_mut() {
                debug_assert!(
                    live.iter().all(|other| !other.overlaps(&block)),
                    "allocation {block:?} overlaps a live allocation"
                );
                live.push(block);
            }
            return Some(block);
        }
        None
    }

    /// Return a range to the free list, merging it with adjacent free ranges.
    pub fn free(&mut self, offset: u64, size: u64) {
        let range = FreeRange::new(offset, size);
        if let Some(live) = self.live.as_mut() {
            let position = live.iter().position(|r| *r == range);
            debug_assert!(position.is_some(), "freeing unknown range {range:?}");
            if let Some(position) = position {
                live.swap_remove(position);
            }
        }

        let index = self.free.partition_point(|r| r.offset < offset);
        debug_assert!(
            index == 0 || self.free[index - 1].end() <= offset,
            "double free of {range:?}"
        );
        debug_assert!(
            index == self.free.len() || range.end() <= self.free[index].offset,
            "double free of {range:?}"
        );
        self.free.insert(index, range);

        let mut index = index;
        if index + 1 < self.free.len() && self.free[index].end() == self.free[index + 1].offset {
            self.free[index].size += self.free[index + 1].size;
            self.free.remove(index + 1);
        }
        if index > 0 && self.free[index - 1].end() == self.free[index].offset {
            self.free[index - 1].size += self.free[index].size;
            self.free.remove(index);
            index -= 1;
        }
        debug_assert!(index < self.free.len());
    }
}
