//! # FACS (Firmware ACPI Control Structure)
//!
//! Unlike the description-header tables, the FACS has only a signature and
//! a length; there is no checksum. Its global-lock word is shared with the
//! firmware and must be driven with atomic compare-exchange, never plain
//! stores.

use crate::{TableError, table_signature, take_struct};

/// Signature of the FACS.
pub const FACS_SIGNATURE: u32 = table_signature(b"FACS");

/// Global-lock word: another party wants the lock once it is released.
pub const GLOBAL_LOCK_PENDING: u32 = 1 << 0;

/// Global-lock word: the lock is currently owned.
pub const GLOBAL_LOCK_OWNED: u32 = 1 << 1;

/// The firmware ACPI control structure. Only the leading 40 bytes carry
/// defined fields; the declared length is 64 with a reserved tail.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct Facs {
    pub signature: u32,
    pub length: u32,
    pub hardware_signature: u32,
    pub firmware_waking_vector: u32,
    pub global_lock: u32,
    pub flags: u32,
    pub x_firmware_waking_vector: u64,
    pub version: u8,
    pub reserved: [u8; 3],
    pub ospm_flags: u32,
}

/// Byte offset of the global-lock word within a mapped FACS. The driver
/// addresses the word atomically through this offset rather than through a
/// copied structure.
pub const GLOBAL_LOCK_OFFSET: usize = core::mem::offset_of!(Facs, global_lock);

impl Facs {
    /// Validates the signature and declared length, then copies the
    /// structure out.
    ///
    /// # Errors
    /// [`TableError::BadSignature`] for a non-FACS buffer,
    /// [`TableError::Truncated`] when the declared length (at least 64 by
    /// specification) exceeds the mapped bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, TableError> {
        let facs = take_struct::<Self>(bytes)?;
        if facs.signature != FACS_SIGNATURE {
            return Err(TableError::BadSignature);
        }
        let length = facs.length as usize;
        if length < size_of::<Self>() || length > bytes.len() {
            return Err(TableError::Truncated {
                needed: length.max(size_of::<Self>()),
                available: bytes.len(),
            });
        }
        Ok(facs)
    }
}
