use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

use crate::MapAttributes;

/// One 64-bit x86-64 page-table entry, the superset of all four levels.
///
/// An entry either points at the next-level table (`PS=0` above L1) or maps
/// a physical page directly. `dirty`, `global`, and `PS` only carry meaning
/// on leaves; the PT level repurposes bit 7 as PAT, which this code never
/// sets.
///
/// | Bits  | Name       | Meaning                              |
/// |-------|------------|--------------------------------------|
/// | 0     | `P`        | Valid entry                          |
/// | 1     | `RW`       | Writable                             |
/// | 2     | `US`       | User-mode accessible                 |
/// | 3     | `PWT`      | Write-through caching                |
/// | 4     | `PCD`      | Caching disabled                     |
/// | 5     | `A`        | Accessed (CPU-set)                   |
/// | 6     | `D`        | Dirty (CPU-set, leaf only)           |
/// | 7     | `PS`       | Large page (PD/PDPT leaves)          |
/// | 8     | `G`        | Global translation (leaf only)       |
/// | 9–11  | OS low     | Free for OS use                      |
/// | 12–51 | `addr`     | Physical frame bits \[51:12\]        |
/// | 52–62 | OS high    | Free for OS use                      |
/// | 63    | `NX`       | Execute disable (needs `EFER.NXE`)   |
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntry {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1). Clear means read-only (subject to CR0.WP in
    /// supervisor mode).
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disable: bool,

    /// Accessed (A, bit 5). CPU-set on first use.
    pub accessed: bool,

    /// Dirty (D, bit 6). CPU-set on first write, leaf only.
    pub dirty: bool,

    /// Page Size (PS, bit 7). Leaf at PD (2 MiB) or PDPT (1 GiB) level.
    pub large: bool,

    /// Global (G, bit 8). Survives CR3 reloads when CR4.PGE is set.
    pub global: bool,

    /// Bits 9–11, free for OS use.
    #[bits(3, default = 0)]
    _os_low: u8,

    /// Bits 12–51, physical frame number.
    #[bits(40)]
    frame: u64,

    /// Bits 52–62, free for OS use.
    #[bits(11, default = 0)]
    _os_high: u16,

    /// No-execute (NX, bit 63).
    pub no_execute: bool,
}

impl PageEntry {
    /// The physical address this entry points at (table base or page base).
    #[inline]
    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << 12)
    }

    /// Entry pointing at a next-level table.
    ///
    /// Intermediate links are created maximally permissive (writable,
    /// user-reachable); the leaf decides the effective permission.
    #[inline]
    #[must_use]
    pub fn table(table_base: PhysicalAddress) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
            .with_frame(table_base.as_u64() >> 12)
    }

    /// Leaf entry mapping `page_base` with `attributes`.
    ///
    /// `large` must only be set for PD-level leaves and implies 2 MiB
    /// alignment of `page_base`.
    #[inline]
    #[must_use]
    pub fn leaf(page_base: PhysicalAddress, attributes: MapAttributes) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(!attributes.read_only())
            .with_user(attributes.user())
            .with_write_through(attributes.write_through())
            .with_cache_disable(attributes.cache_disable())
            .with_global(attributes.global())
            .with_large(attributes.large())
            .with_no_execute(!attributes.execute())
            .with_frame(page_base.as_u64() >> 12)
    }

    /// The attribute view of a leaf entry, for masked updates.
    #[inline]
    #[must_use]
    pub const fn attributes(self) -> MapAttributes {
        MapAttributes::new()
            .with_read_only(!self.writable())
            .with_user(self.user())
            .with_write_through(self.write_through())
            .with_cache_disable(self.cache_disable())
            .with_global(self.global())
            .with_large(self.large())
            .with_execute(!self.no_execute())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_encodes_attributes_into_hardware_bits() {
        let attrs = MapAttributes::new()
            .with_read_only(true)
            .with_global(true)
            .with_cache_disable(true);
        let e = PageEntry::leaf(PhysicalAddress::new(0x30_0000), attrs);

        assert!(e.present());
        assert!(!e.writable());
        assert!(e.global());
        assert!(e.cache_disable());
        assert!(e.no_execute(), "no execute attribute means NX set");
        assert_eq!(e.address().as_u64(), 0x30_0000);
    }

    #[test]
    fn table_links_are_permissive() {
        let e = PageEntry::table(PhysicalAddress::new(0x1000));
        assert!(e.present());
        assert!(e.writable());
        assert!(e.user());
        assert!(!e.large());
        assert!(!e.no_execute());
    }

    #[test]
    fn attribute_view_round_trips() {
        let attrs = MapAttributes::new().with_execute(true).with_user(true);
        let e = PageEntry::leaf(PhysicalAddress::new(0x4000), attrs);
        assert_eq!(e.attributes(), attrs);
    }
}
