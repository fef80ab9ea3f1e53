//! # ACPI Firmware Table Structures
//!
//! Raw, byte-accurate views of the ACPI tables the boot loader and the
//! platform driver consume, plus the firmware table directory both sides
//! share.
//!
//! ## Table hierarchy
//!
//! ```text
//! UEFI/BIOS Firmware
//!     ↓
//! RSDP/XSDP (Root System Description Pointer)
//!     ↓
//! RSDT/XSDT (Root/Extended System Description Table)
//!     ↓
//! Individual ACPI Tables (FADT, FACS, MADT, DSDT, DBG2, …)
//! ```
//!
//! The loader discovers the root pointer through the UEFI configuration
//! table, walks the root table, and registers every reachable table in a
//! [`directory::TableDirectory`]. The directory keeps two parallel address
//! columns: the loader-visible address used before the hand-off and the
//! kernel virtual address the kernel uses afterwards.
//!
//! ## Validation strategy
//!
//! Firmware data is untrusted. Every parse entry point checks the
//! signature, bounds-checks the declared length against the mapped bytes,
//! and (where the table defines one) verifies the byte-sum checksum before
//! any field is interpreted. Structures are `#[repr(C, packed)]` and read
//! out by value; no references into packed fields are ever formed.
//!
//! ## Memory access
//!
//! All physical reads go through the [`PhysMapRo`] seam so the same parsers
//! serve identity-mapped loader memory and the kernel's mapped windows.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod dbg2;
pub mod directory;
pub mod eisa;
pub mod facs;
pub mod fadt;
pub mod header;
pub mod madt;
pub mod rsdp;

use core::fmt;
use thiserror::Error;

/// Errors raised while interpreting firmware tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TableError {
    /// The table does not start with the expected signature.
    #[error("table signature mismatch")]
    BadSignature,
    /// The byte-sum over the declared length is not zero.
    #[error("table checksum does not sum to zero")]
    BadChecksum,
    /// The mapped buffer is shorter than the structure demands.
    #[error("table truncated: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes the structure or its declared length requires.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },
    /// An output buffer cannot hold the serialized form.
    #[error("output buffer too small")]
    BufferTooSmall,
}

/// Map a physical region and return a *read-only* byte slice for its
/// contents. Implementations decide how (identity map, kernel window).
pub trait PhysMapRo {
    /// # Safety
    /// The implementor must ensure the returned slice is valid for `len`
    /// bytes at the given physical address.
    unsafe fn map_ro<'a>(&self, paddr: u64, len: usize) -> &'a [u8];
}

/// Packs a four-character table name into its little-endian `u32` form.
#[inline]
#[must_use]
pub const fn table_signature(name: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*name)
}

/// Signature of the Differentiated System Description Table.
pub const DSDT_SIGNATURE: u32 = table_signature(b"DSDT");

/// Signature of Secondary System Description Tables.
pub const SSDT_SIGNATURE: u32 = table_signature(b"SSDT");

/// Byte-sum of a buffer, wrapping at 8 bits. Valid checksummed tables sum
/// to zero over their declared length.
#[must_use]
pub fn sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |a, &b| a.wrapping_add(b))
}

/// Rewrites the checksum byte at `checksum_offset` so the whole buffer
/// sums to zero.
pub fn apply_checksum(table: &mut [u8], checksum_offset: usize) {
    table[checksum_offset] = 0;
    table[checksum_offset] = 0_u8.wrapping_sub(sum(table));
}

/// Displays a table signature as its four ASCII characters.
///
/// ```
/// use kernel_acpi_tables::{Signature, table_signature};
///
/// let fadt = Signature(table_signature(b"FACP"));
/// assert_eq!(fadt.to_string(), "FACP");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub u32);

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.to_le_bytes() {
            let shown = if (0x20..0x7F).contains(&byte) {
                char::from(byte)
            } else {
                '?'
            };
            write!(f, "{shown}")?;
        }
        Ok(())
    }
}

/// Copies a packed structure out of the front of `bytes`.
pub(crate) fn take_struct<T: Copy>(bytes: &[u8]) -> Result<T, TableError> {
    if bytes.len() < size_of::<T>() {
        return Err(TableError::Truncated {
            needed: size_of::<T>(),
            available: bytes.len(),
        });
    }
    // repr(C, packed) structures contain no padding and tolerate any byte
    // pattern; read_unaligned handles the missing alignment guarantee.
    Ok(unsafe { core::ptr::read_unaligned(bytes.as_ptr().cast::<T>()) })
}

/// Views a packed structure as its raw bytes.
pub(crate) fn struct_bytes<T>(value: &T) -> &[u8] {
    unsafe { core::slice::from_raw_parts(core::ptr::from_ref(value).cast::<u8>(), size_of::<T>()) }
}
