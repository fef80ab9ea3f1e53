//! Raw x86 port I/O.
//!
//! Used for PCI configuration access (`0xCF8`/`0xCFC`), the legacy interrupt
//! controllers, 16550 probing, and the fixed ACPI power-management registers.

/// Writes one byte to `port`.
///
/// # Safety
/// Port I/O is privileged and has device-defined side effects; the caller
/// must know what is decoded at `port`.
#[cfg(feature = "asm")]
#[inline]
pub unsafe fn outb(port: u16, value: u8) {
    unsafe {
        core::arch::asm!(
            "out dx, al",
            in("dx") port,
            in("al") value,
            options(nomem, nostack, preserves_flags)
        );
    }
}

/// Reads one byte from `port`.
///
/// # Safety
/// See [`outb`].
#[cfg(feature = "asm")]
#[inline]
#[must_use]
pub unsafe fn inb(port: u16) -> u8 {
    let value: u8;
    unsafe {
        core::arch::asm!(
            "in al, dx",
            in("dx") port,
            out("al") value,
            options(nomem, nostack, preserves_flags)
        );
    }
    value
}

/// Writes a 16-bit word to `port`.
///
/// # Safety
/// See [`outb`].
#[cfg(feature = "asm")]
#[inline]
pub unsafe fn outw(port: u16, value: u16) {
    unsafe {
        core::arch::asm!(
            "out dx, ax",
            in("dx") port,
            in("ax") value,
            options(nomem, nostack, preserves_flags)
        );
    }
}

/// Reads a 16-bit word from `port`.
///
/// # Safety
/// See [`outb`].
#[cfg(feature = "asm")]
#[inline]
#[must_use]
pub unsafe fn inw(port: u16) -> u16 {
    let value: u16;
    unsafe {
        core::arch::asm!(
            "in ax, dx",
            in("dx") port,
            out("ax") value,
            options(nomem, nostack, preserves_flags)
        );
    }
    value
}

/// Writes a 32-bit word to `port`.
///
/// # Safety
/// See [`outb`].
#[cfg(feature = "asm")]
#[inline]
pub unsafe fn outl(port: u16, value: u32) {
    unsafe {
        core::arch::asm!(
            "out dx, eax",
            in("dx") port,
            in("eax") value,
            options(nomem, nostack, preserves_flags)
        );
    }
}

/// Reads a 32-bit word from `port`.
///
/// # Safety
/// See [`outb`].
#[cfg(feature = "asm")]
#[inline]
#[must_use]
pub unsafe fn inl(port: u16) -> u32 {
    let value: u32;
    unsafe {
        core::arch::asm!(
            "in eax, dx",
            in("dx") port,
            out("eax") value,
            options(nomem, nostack, preserves_flags)
        );
    }
    value
}
