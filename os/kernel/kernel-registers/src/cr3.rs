use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// CR3 — root page-table base register (IA-32e, PCID disabled).
///
/// The handoff to the kernel loads this with the base of the freshly built
/// four-level hierarchy. Assumes 4 KiB alignment and CR4.PCIDE = 0.
#[bitfield(u64, order = Lsb)]
pub struct Cr3 {
    /// Bits 0–2 — Reserved (must be 0).
    #[bits(3)]
    pub reserved0: u8,

    /// Bit 3 — PWT: write-through caching for root-table walks.
    pub pwt: bool,

    /// Bit 4 — PCD: cache disable for root-table walks.
    pub pcd: bool,

    /// Bits 5–11 — Reserved (must be 0 when written).
    #[bits(7)]
    pub reserved1: u8,

    /// Bits 12–51 — root table physical base >> 12.
    #[bits(40)]
    root_base_4k: u64,

    /// Bits 52–63 — Reserved.
    #[bits(12)]
    pub reserved2: u16,
}

impl Cr3 {
    /// Builds a `Cr3` value from a 4 KiB-aligned root-table base.
    #[must_use]
    pub fn from_root_table(root_phys: PhysicalAddress) -> Self {
        debug_assert!(
            root_phys.is_aligned::<kernel_memory_addresses::Size4K>(),
            "root table base must be 4K-aligned"
        );
        Self::new().with_root_base_4k(root_phys.as_u64() >> 12)
    }

    /// Physical address of the root page table.
    #[must_use]
    pub fn root_table(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.root_base_4k() << 12)
    }
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_table_round_trips() {
        let base = PhysicalAddress::new(0x0000_0001_2345_6000);
        let cr3 = Cr3::from_root_table(base);
        assert_eq!(cr3.root_table(), base);
        assert_eq!(cr3.into_bits(), base.as_u64());
    }
}
