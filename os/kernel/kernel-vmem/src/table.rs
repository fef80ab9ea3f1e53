use core::ops::{Index, IndexMut};

use kernel_memory_addresses::VirtualAddress;

use crate::PageEntry;

/// Entries per table at every level of the four-level hierarchy.
pub const TABLE_ENTRIES: usize = 512;

/// One page-sized table of 512 entries, usable at any level.
///
/// The hierarchy is uniform: PML4, PDPT, PD, and PT all share this shape,
/// and the level only determines how an entry is interpreted.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; TABLE_ENTRIES],
}

impl PageTable {
    /// An empty table with every entry non-present.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [PageEntry::new(); TABLE_ENTRIES],
        }
    }

    /// Clears every entry. Used when recycling a freshly allocated frame
    /// whose contents are unknown.
    #[inline]
    pub fn zero(&mut self) {
        self.entries = [PageEntry::new(); TABLE_ENTRIES];
    }

    /// Iterates the entries in index order.
    #[inline]
    pub fn iter(&self) -> core::slice::Iter<'_, PageEntry> {
        self.entries.iter()
    }
}

impl<'a> IntoIterator for &'a PageTable {
    type Item = &'a PageEntry;
    type IntoIter = core::slice::Iter<'a, PageEntry>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl Default for PageTable {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Index<usize> for PageTable {
    type Output = PageEntry;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

/// Splits a canonical address into its four walk indices, highest level
/// first: `(PML4, PDPT, PD, PT)`.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn split_indices(address: VirtualAddress) -> (usize, usize, usize, usize) {
    let va = address.as_u64();
    (
        ((va >> 39) & 0x1FF) as usize,
        ((va >> 30) & 0x1FF) as usize,
        ((va >> 21) & 0x1FF) as usize,
        ((va >> 12) & 0x1FF) as usize,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_table_is_empty() {
        let table = PageTable::new();
        assert!(table.iter().all(|e| !e.present()));
    }

    #[test]
    fn split_walks_down_from_bit_47() {
        let (i4, i3, i2, i1) = split_indices(VirtualAddress::new(
            (5 << 39) | (17 << 30) | (300 << 21) | (511 << 12) | 0xABC,
        ));
        assert_eq!((i4, i3, i2, i1), (5, 17, 300, 511));
    }

    #[test]
    fn kernel_base_lands_in_upper_half() {
        let (i4, ..) = split_indices(VirtualAddress::new(crate::KERNEL_VA_START));
        assert_eq!(i4, 0x100);
    }

    #[test]
    fn table_size_matches_one_page() {
        assert_eq!(core::mem::size_of::<PageTable>(), 4096);
        assert_eq!(core::mem::align_of::<PageTable>(), 4096);
    }
}
