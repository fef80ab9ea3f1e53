use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;

/// `IA32_EFER` (MSR `0xC000_0080`).
///
/// The boot path sets `NXE` just before switching address spaces so the
/// no-execute attribute in the freshly built page tables is honored.
#[bitfield(u64, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct Efer {
    /// Bit 0 — SCE: SYSCALL/SYSRET enable.
    pub sce: bool,

    /// Bits 1–7 — legacy AMD K6 controls, reserved on current CPUs.
    #[bits(7, default = 0)]
    _legacy: u8,

    /// Bit 8 — LME: Long Mode Enable.
    pub lme: bool,

    /// Bit 9 — Reserved.
    #[bits(access = RO)]
    pub reserved0: bool,

    /// Bit 10 — LMA: Long Mode Active (read-only).
    pub lma: bool,

    /// Bit 11 — NXE: No-Execute Enable.
    pub nxe: bool,

    /// Bit 12 — SVME: Secure Virtual Machine Enable.
    pub svme: bool,

    /// Bit 13 — LMSLE: Long Mode Segment Limit Enable.
    pub lmsle: bool,

    /// Bit 14 — FFXSR: Fast FXSAVE/FXRSTOR.
    pub ffxsr: bool,

    /// Bit 15 — TCE: Translation Cache Extension.
    pub tce: bool,

    /// Bits 16–63 — Reserved.
    #[bits(48, access = RO)]
    pub reserved1: u64,
}

impl Efer {
    /// MSR index for `IA32_EFER`.
    pub const MSR_EFER: u32 = 0xC000_0080;
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Efer {
    unsafe fn load_unsafe() -> Self {
        let (lo, hi): (u32, u32);
        unsafe {
            core::arch::asm!(
                "rdmsr",
                in("ecx") Self::MSR_EFER,
                out("eax") lo,
                out("edx") hi,
                options(nomem, preserves_flags)
            );
        }
        Self::from_bits(u64::from(hi) << 32 | u64::from(lo))
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Efer {
    #[allow(clippy::cast_possible_truncation)]
    unsafe fn store_unsafe(self) {
        let efer = self.into_bits();
        let lo = efer as u32;
        let hi = (efer >> 32) as u32;
        unsafe {
            core::arch::asm!(
                "wrmsr",
                in("ecx") Self::MSR_EFER,
                in("eax") lo,
                in("edx") hi,
                options(nomem, preserves_flags)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_execute_enable_is_bit_11() {
        assert_eq!(Efer::new().with_nxe(true).into_bits(), 1 << 11);
    }

    #[test]
    fn long_mode_bits_round_trip() {
        let efer = Efer::from_bits((1 << 8) | (1 << 10));
        assert!(efer.lme());
        assert!(efer.lma());
        assert_eq!(efer.with_nxe(true).into_bits(), (1 << 8) | (1 << 10) | (1 << 11));
    }
}
