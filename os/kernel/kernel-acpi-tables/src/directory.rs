//! # Firmware Table Directory
//!
//! The loader registers every firmware table it discovers here, then
//! serializes the kernel-visible column into the hand-off block. Lookups
//! scan newest-first so a table registered later (for example one loaded
//! from a test file) shadows the firmware copy of the same signature.

use crate::{Signature, TableError};
use alloc::vec::Vec;
use log::debug;

/// One registered table, addressed from both sides of the hand-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Signature from the table's description header.
    pub signature: u32,
    /// Address valid in the loader's address space.
    pub boot_address: u64,
    /// Virtual address the kernel will see the table at.
    pub kernel_address: u64,
}

/// Registry of every firmware table found during boot.
#[derive(Debug, Default)]
pub struct TableDirectory {
    entries: Vec<DirectoryEntry>,
}

impl TableDirectory {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Number of registered tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no table has been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in registration order.
    #[must_use]
    pub fn entries(&self) -> &[DirectoryEntry] {
        &self.entries
    }

    /// Registers a table under both of its addresses.
    pub fn add_table(&mut self, signature: u32, boot_address: u64, kernel_address: u64) {
        debug!(
            "registered firmware table {} at {boot_address:#x}",
            Signature(signature)
        );
        self.entries.push(DirectoryEntry {
            signature,
            boot_address,
            kernel_address,
        });
    }

    /// Finds the newest table with the given signature and returns its
    /// loader-visible address. Passing the previous result as `previous`
    /// continues the search among older registrations, so callers can walk
    /// every SSDT one call at a time.
    #[must_use]
    pub fn get_acpi_table(&self, signature: u32, previous: Option<u64>) -> Option<u64> {
        let mut skip_until = previous;
        for entry in self.entries.iter().rev() {
            if let Some(marker) = skip_until {
                if entry.boot_address == marker {
                    skip_until = None;
                }
                continue;
            }
            if entry.signature == signature {
                return Some(entry.boot_address);
            }
        }
        None
    }

    /// Number of `u64` slots [`Self::write_handoff`] needs.
    #[must_use]
    pub fn handoff_len(&self) -> usize {
        self.entries.len() + 1
    }

    /// Serializes the directory for the kernel: a count followed by the
    /// kernel virtual address of each table, in registration order.
    ///
    /// # Errors
    /// [`TableError::BufferTooSmall`] when `out` has fewer than
    /// [`Self::handoff_len`] slots.
    pub fn write_handoff(&self, out: &mut [u64]) -> Result<(), TableError> {
        if out.len() < self.handoff_len() {
            return Err(TableError::BufferTooSmall);
        }
        out[0] = self.entries.len() as u64;
        for (slot, entry) in out[1..].iter_mut().zip(&self.entries) {
            *slot = entry.kernel_address;
        }
        Ok(())
    }
}
