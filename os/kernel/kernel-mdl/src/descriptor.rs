use core::fmt;

/// Classification of a described address range.
///
/// The kernel receives both lists through the init block, so the
/// representation is fixed at `u32`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemoryType {
    /// Usable and unassigned.
    Free = 0,
    /// Loader working memory, reclaimed by the kernel after boot.
    LoaderTemporary = 1,
    /// Loader output the kernel keeps (image, stacks, init block).
    LoaderPermanent = 2,
    /// Page tables backing kernel virtual addresses.
    PageTables = 3,
    /// Page tables for identity/temporary mappings, discarded after boot.
    BootPageTables = 4,
    /// Firmware boot-services memory, reusable after exit-boot-services.
    FirmwareTemporary = 5,
    /// Firmware runtime-services memory, permanently reserved.
    FirmwarePermanent = 6,
    /// ACPI reclaim memory holding the firmware tables.
    AcpiTables = 7,
    /// ACPI non-volatile storage.
    AcpiNvStorage = 8,
    /// Memory-mapped hardware.
    Hardware = 9,
    /// Unusable or firmware-reserved.
    Reserved = 10,
    /// Memory-manager bootstrap structures.
    MmStructures = 11,
}

impl MemoryType {
    /// Whether ranges of this type may satisfy allocations.
    #[inline]
    #[must_use]
    pub const fn is_free(self) -> bool {
        matches!(self, Self::Free)
    }
}

/// One contiguous typed range: `[base, base + size)`.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MemoryDescriptor {
    pub base: u64,
    pub size: u64,
    pub kind: MemoryType,
}

impl MemoryDescriptor {
    #[inline]
    #[must_use]
    pub const fn new(base: u64, size: u64, kind: MemoryType) -> Self {
        Self { base, size, kind }
    }

    /// Exclusive end of the range.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base + self.size
    }

    /// Whether `address` falls inside the range.
    #[inline]
    #[must_use]
    pub const fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.end()
    }

    /// Whether `[base, end)` intersects this range.
    #[inline]
    #[must_use]
    pub const fn overlaps(&self, base: u64, end: u64) -> bool {
        self.base < end && base < self.end()
    }
}

impl fmt::Debug for MemoryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[0x{:016X}..0x{:016X}) {:?}",
            self.base,
            self.end(),
            self.kind
        )
    }
}
