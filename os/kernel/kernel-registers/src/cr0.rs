use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;

/// CR0 — primary control register (x86-64).
///
/// The boot path cares about `WP` (supervisor honors read-only pages, set
/// before the jump so the kernel image's text stays immutable) and reads the
/// firmware-established `PE`/`PG` state. Reserved bits are modeled and kept
/// zero.
#[bitfield(u64, order = Lsb)]
pub struct Cr0 {
    /// Bit 0 — PE: Protection Enable. Set by firmware long before us.
    pub pe: bool,

    /// Bit 1 — MP: Monitor Coprocessor.
    pub mp: bool,

    /// Bit 2 — EM: x87 Emulation.
    pub em: bool,

    /// Bit 3 — TS: Task Switched.
    pub ts: bool,

    /// Bit 4 — ET: Extension Type (reads as 1 on modern CPUs).
    pub et: bool,

    /// Bit 5 — NE: Numeric Error reporting via #MF.
    pub ne: bool,

    /// Bits 6–15 — Reserved (must be 0).
    #[bits(10, default = 0)]
    _reserved_6_15: u16,

    /// Bit 16 — WP: Write Protect.
    ///
    /// When set, supervisor code faults on writes to read-only pages.
    pub wp: bool,

    /// Bit 17 — Reserved (must be 0).
    #[bits(default = 0)]
    _reserved_17: bool,

    /// Bit 18 — AM: Alignment Mask.
    pub am: bool,

    /// Bits 19–28 — Reserved (must be 0).
    #[bits(10, default = 0)]
    _reserved_19_28: u16,

    /// Bit 29 — NW: Not-Write-Through.
    pub nw: bool,

    /// Bit 30 — CD: Cache Disable.
    pub cd: bool,

    /// Bit 31 — PG: Paging enabled (requires PE).
    pub pg: bool,

    /// Bits 32–63 — Reserved (must be 0).
    #[bits(32, default = 0)]
    _reserved_32_63: u32,
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr0 {
    unsafe fn load_unsafe() -> Self {
        let cr0: u64;
        unsafe {
            core::arch::asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr0)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Cr0 {
    unsafe fn store_unsafe(self) {
        let cr0 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr0, {}", in(reg) cr0, options(nostack, preserves_flags));
        }
    }
}
