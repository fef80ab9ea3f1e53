use crate::{MdlError, MemoryDescriptor, MemoryType};
use alloc::vec::Vec;

/// Placement policy for [`MemoryDescriptorList::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// First fit in ascending address order.
    Any,
    /// Lowest aligned fit. Equal to [`Self::Any`] here since the list is
    /// kept sorted, but callers state their intent.
    LowestFit,
    /// Highest aligned fit, aligned down from the top of the free range.
    HighestFit,
}

/// An ordered set of non-overlapping typed address ranges.
///
/// Descriptors are kept sorted by base address. Insertions override whatever
/// previously described the range, and same-type neighbors coalesce, so the
/// list is always minimal.
#[derive(Debug, Default, Clone)]
pub struct MemoryDescriptorList {
    descriptors: Vec<MemoryDescriptor>,
    total_space: u64,
    free_space: u64,
}

const fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

const fn align_down(value: u64, alignment: u64) -> u64 {
    (value / alignment) * alignment
}

impl MemoryDescriptorList {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            descriptors: Vec::new(),
            total_space: 0,
            free_space: 0,
        }
    }

    /// Number of descriptors currently in the list.
    #[inline]
    #[must_use]
    pub fn descriptor_count(&self) -> usize {
        self.descriptors.len()
    }

    /// Bytes described by the list, of any type.
    #[inline]
    #[must_use]
    pub const fn total_space(&self) -> u64 {
        self.total_space
    }

    /// Bytes described as [`MemoryType::Free`].
    #[inline]
    #[must_use]
    pub const fn free_space(&self) -> u64 {
        self.free_space
    }

    pub fn iter(&self) -> core::slice::Iter<'_, MemoryDescriptor> {
        self.descriptors.iter()
    }

    /// Inserts `desc`, overriding any previous description of its range.
    ///
    /// Existing descriptors are clipped at the edges, removed when fully
    /// contained, or split when they contain the new range. Afterwards the
    /// new descriptor coalesces with same-type neighbors.
    pub fn insert(&mut self, desc: MemoryDescriptor) {
        if desc.size == 0 {
            return;
        }
        self.carve(desc.base, desc.end());
        let at = self.descriptors.partition_point(|d| d.base < desc.base);
        self.descriptors.insert(at, desc);
        self.coalesce_around(at);
        self.recompute_totals();
    }

    /// Removes any description of `[base, base + size)`.
    pub fn remove_range(&mut self, base: u64, size: u64) {
        if size == 0 {
            return;
        }
        self.carve(base, base + size);
        self.recompute_totals();
    }

    /// The descriptor containing `address`, if any.
    #[must_use]
    pub fn lookup(&self, address: u64) -> Option<&MemoryDescriptor> {
        let at = self.descriptors.partition_point(|d| d.end() <= address);
        self.descriptors.get(at).filter(|d| d.contains(address))
    }

    /// Whether `[base, base + size)` is fully described as free.
    ///
    /// Gaps count as not free: an undescribed range cannot be handed out.
    #[must_use]
    pub fn range_is_free(&self, base: u64, size: u64) -> bool {
        if size == 0 {
            return true;
        }
        let end = base + size;
        let mut cursor = base;
        for d in &self.descriptors {
            if d.end() <= cursor {
                continue;
            }
            if d.base > cursor || !d.kind.is_free() {
                return false;
            }
            cursor = d.end();
            if cursor >= end {
                return true;
            }
        }
        false
    }

    /// Carves `size` bytes out of free space and retags them as `kind`.
    ///
    /// Alignment slivers at the front and the remainder at the back of the
    /// chosen free descriptor stay free. Returns the base of the allocation.
    ///
    /// # Errors
    ///
    /// [`MdlError::InvalidParameter`] for a zero `size`;
    /// [`MdlError::InsufficientResources`] when no free range fits. The list
    /// is unchanged on error.
    pub fn allocate(
        &mut self,
        size: u64,
        alignment: u64,
        kind: MemoryType,
        strategy: AllocationStrategy,
    ) -> Result<u64, MdlError> {
        if size == 0 {
            return Err(MdlError::InvalidParameter);
        }
        let alignment = alignment.max(1);
        let base = self
            .find_fit(size, alignment, strategy)
            .ok_or(MdlError::InsufficientResources { size, alignment })?;
        self.insert(MemoryDescriptor::new(base, size, kind));
        Ok(base)
    }

    fn find_fit(&self, size: u64, alignment: u64, strategy: AllocationStrategy) -> Option<u64> {
        let fits_low = |d: &MemoryDescriptor| {
            if !d.kind.is_free() {
                return None;
            }
            let base = align_up(d.base, alignment);
            (base.checked_add(size)? <= d.end()).then_some(base)
        };
        match strategy {
            AllocationStrategy::Any | AllocationStrategy::LowestFit => {
                self.descriptors.iter().find_map(fits_low)
            }
            AllocationStrategy::HighestFit => self.descriptors.iter().rev().find_map(|d| {
                if !d.kind.is_free() {
                    return None;
                }
                let base = align_down(d.end().checked_sub(size)?, alignment);
                (base >= d.base).then_some(base)
            }),
        }
    }

    /// Drops all coverage of `[start, end)`, clipping and splitting as
    /// needed. Callers restore totals afterwards.
    fn carve(&mut self, start: u64, end: u64) {
        let mut kept = Vec::with_capacity(self.descriptors.len() + 1);
        for d in self.descriptors.drain(..) {
            if !d.overlaps(start, end) {
                kept.push(d);
                continue;
            }
            if d.base < start {
                kept.push(MemoryDescriptor::new(d.base, start - d.base, d.kind));
            }
            if d.end() > end {
                kept.push(MemoryDescriptor::new(end, d.end() - end, d.kind));
            }
        }
        self.descriptors = kept;
    }

    fn coalesce_around(&mut self, at: usize) {
        // successor first so `at` stays valid
        if at + 1 < self.descriptors.len() {
            let cur = self.descriptors[at];
            let next = self.descriptors[at + 1];
            if cur.kind == next.kind && cur.end() == next.base {
                self.descriptors[at].size += next.size;
                self.descriptors.remove(at + 1);
            }
        }
        if at > 0 {
            let prev = self.descriptors[at - 1];
            let cur = self.descriptors[at];
            if prev.kind == cur.kind && prev.end() == cur.base {
                self.descriptors[at - 1].size += cur.size;
                self.descriptors.remove(at);
            }
        }
    }

    fn recompute_totals(&mut self) {
        let mut total = 0;
        let mut free = 0;
        for d in &self.descriptors {
            total += d.size;
            if d.kind.is_free() {
                free += d.size;
            }
        }
        self.total_space = total;
        self.free_space = free;
    }
}

impl<'a> IntoIterator for &'a MemoryDescriptorList {
    type Item = &'a MemoryDescriptor;
    type IntoIter = core::slice::Iter<'a, MemoryDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
