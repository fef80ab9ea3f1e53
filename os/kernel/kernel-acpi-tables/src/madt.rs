//! # MADT (Multiple APIC Description Table)
//!
//! The MADT is a description header followed by a packed run of
//! variable-length interrupt controller entries. The walker here yields
//! the processor-bearing entries (Local APIC on x86, GIC on ARM) and
//! skips everything else by declared length, so unknown future entry
//! kinds never derail the iteration.

use crate::header::DescriptionHeader;
use crate::{TableError, table_signature, take_struct};

/// Signature of the MADT ("APIC").
pub const MADT_SIGNATURE: u32 = table_signature(b"APIC");

/// The system also has a dual-8259 PIC setup.
pub const MADT_FLAG_DUAL_8259: u32 = 0x0000_0001;

/// Local APIC entry: the processor is usable.
pub const LOCAL_APIC_FLAG_ENABLED: u32 = 0x0000_0001;

/// GIC CPU interface entry: the processor is usable.
pub const GIC_FLAG_ENABLED: u32 = 0x0000_0001;

const ENTRY_LOCAL_APIC: u8 = 0x0;
const ENTRY_GIC: u8 = 0xB;

/// Fixed MADT fields following the description header.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct Madt {
    pub header: DescriptionHeader,
    pub apic_address: u32,
    pub flags: u32,
}

/// A processor local APIC entry.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct LocalApic {
    pub kind: u8,
    pub length: u8,
    pub acpi_processor_id: u8,
    pub apic_id: u8,
    pub flags: u32,
}

/// A GIC CPU interface entry.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct Gic {
    pub kind: u8,
    pub length: u8,
    pub reserved: u16,
    pub gic_id: u32,
    pub acpi_processor_id: u32,
    pub flags: u32,
    pub parking_protocol_version: u32,
    pub performance_interrupt_gsi: u32,
    pub parked_address: u64,
    pub base_address: u64,
}

/// One interrupt controller entry.
#[derive(Debug, Clone, Copy)]
pub enum MadtEntry {
    LocalApic(LocalApic),
    Gic(Gic),
    /// An entry kind this walker does not interpret.
    Other { kind: u8, length: u8 },
}

/// A validated MADT with access to its entry run.
#[derive(Clone, Copy)]
pub struct MadtView<'a> {
    madt: Madt,
    entries: &'a [u8],
}

impl<'a> MadtView<'a> {
    /// Validates signature, length, and checksum.
    ///
    /// # Errors
    /// [`TableError::BadSignature`] when the table is not a MADT; length
    /// and checksum failures as reported by
    /// [`DescriptionHeader::validate`].
    pub fn parse(bytes: &'a [u8]) -> Result<Self, TableError> {
        let header = DescriptionHeader::validate(bytes)?;
        if header.signature != MADT_SIGNATURE {
            return Err(TableError::BadSignature);
        }
        if (header.length as usize) < size_of::<Madt>() {
            return Err(TableError::Truncated {
                needed: size_of::<Madt>(),
                available: header.length as usize,
            });
        }
        let madt = take_struct::<Madt>(bytes)?;
        let entries = &bytes[size_of::<Madt>()..header.length as usize];
        Ok(Self { madt, entries })
    }

    /// The fixed leading fields.
    #[must_use]
    pub const fn madt(&self) -> Madt {
        self.madt
    }

    /// Whether the platform declares a PC-AT compatible dual 8259.
    #[must_use]
    pub const fn has_dual_8259(&self) -> bool {
        self.madt.flags & MADT_FLAG_DUAL_8259 != 0
    }

    /// Walks the interrupt controller entries.
    #[must_use]
    pub const fn entries(self) -> MadtEntries<'a> {
        MadtEntries {
            bytes: self.entries,
        }
    }

    /// Resolves an ACPI processor id to its physical (APIC or GIC) id,
    /// considering only enabled processors.
    #[must_use]
    pub fn processor_physical_id(&self, acpi_processor_id: u32) -> Option<u32> {
        self.entries().find_map(|entry| match entry {
            MadtEntry::LocalApic(apic)
                if apic.flags & LOCAL_APIC_FLAG_ENABLED != 0
                    && u32::from(apic.acpi_processor_id) == acpi_processor_id =>
            {
                Some(u32::from(apic.apic_id))
            }
            MadtEntry::Gic(gic)
                if gic.flags & GIC_FLAG_ENABLED != 0
                    && gic.acpi_processor_id == acpi_processor_id =>
            {
                Some(gic.gic_id)
            }
            _ => None,
        })
    }

    /// Counts enabled processors across Local APIC and GIC entries.
    #[must_use]
    pub fn enabled_processor_count(&self) -> usize {
        self.entries()
            .filter(|entry| match entry {
                MadtEntry::LocalApic(apic) => apic.flags & LOCAL_APIC_FLAG_ENABLED != 0,
                MadtEntry::Gic(gic) => gic.flags & GIC_FLAG_ENABLED != 0,
                MadtEntry::Other { .. } => false,
            })
            .count()
    }
}

/// Iterator over MADT interrupt controller entries.
pub struct MadtEntries<'a> {
    bytes: &'a [u8],
}

impl Iterator for MadtEntries<'_> {
    type Item = MadtEntry;

    fn next(&mut self) -> Option<Self::Item> {
        // Type and length bytes lead every entry. A zero or overlong
        // length means a corrupt tail; stop rather than spin.
        if self.bytes.len() < 2 {
            return None;
        }
        let kind = self.bytes[0];
        let length = self.bytes[1];
        let advance = usize::from(length);
        if advance < 2 || advance > self.bytes.len() {
            self.bytes = &[];
            return None;
        }
        let entry_bytes = &self.bytes[..advance];
        self.bytes = &self.bytes[advance..];

        let entry = match kind {
            ENTRY_LOCAL_APIC => take_struct::<LocalApic>(entry_bytes)
                .map_or(MadtEntry::Other { kind, length }, MadtEntry::LocalApic),
            ENTRY_GIC => take_struct::<Gic>(entry_bytes)
                .map_or(MadtEntry::Other { kind, length }, MadtEntry::Gic),
            _ => MadtEntry::Other { kind, length },
        };
        Some(entry)
    }
}
