//! # RSDP/XSDP and the Root System Description Tables

use crate::header::DescriptionHeader;
use crate::{PhysMapRo, TableError, sum, table_signature};
use log::warn;

/// Signature of the Root System Description Table.
pub const RSDT_SIGNATURE: u32 = table_signature(b"RSDT");

/// Signature of the Extended System Description Table.
pub const XSDT_SIGNATURE: u32 = table_signature(b"XSDT");

/// The validated root pointers for the platform.
pub struct AcpiRoots {
    /// Physical address the RSDP itself was found at.
    pub rsdp_addr: u64,
    /// Physical address of the XSDT, when ACPI 2.0+ firmware provides one.
    pub xsdt_addr: Option<u64>,
    /// Physical address of the RSDT.
    pub rsdt_addr: Option<u64>,
}

/// ACPI 1.0 Root System Description Pointer (RSDP).
#[derive(Clone)]
#[repr(C, packed)]
struct Rsdp {
    signature: [u8; 8], // "RSD PTR "
    checksum: u8,       // sum of first 20 bytes == 0
    oem_id: [u8; 6],
    revision: u8, // 0 for ACPI 1.0
    rsdt_addr: u32,
}

/// ACPI 2.0 Extended System Description Pointer (XSDP).
#[derive(Clone)]
#[repr(C, packed)]
struct Xsdp {
    signature: [u8; 8],
    checksum: u8,
    oem_id: [u8; 6],
    revision: u8, // 2 for ACPI 2.0
    _deprecated: u32,
    length: u32,
    xsdt_addr: u64,
    ext_checksum: u8, // checksum of the entire table
    reserved: [u8; 3],
}

impl AcpiRoots {
    /// Validate the RSDP/XSDP at the given physical address.
    ///
    /// Returns `None` for a null address, an unrecognized signature, or a
    /// failed checksum; firmware without ACPI is not an error.
    ///
    /// # Safety
    /// `rsdp_addr` must come from a trusted enumeration source (the UEFI
    /// configuration table) so that mapping it is sound.
    #[must_use]
    #[allow(clippy::similar_names)]
    pub unsafe fn parse(map: &impl PhysMapRo, rsdp_addr: u64) -> Option<Self> {
        if rsdp_addr == 0 {
            return None;
        }

        unsafe {
            let v1 = map.map_ro(rsdp_addr, size_of::<Rsdp>());
            if &v1[0..8] != b"RSD PTR " {
                return None;
            }
            if sum(&v1[0..20]) != 0 {
                warn!("RSDP at {rsdp_addr:#X} fails its checksum");
                return None;
            }

            let v1p = &*v1.as_ptr().cast::<Rsdp>();
            let rsdt_raw = v1p.rsdt_addr;
            let rsdt_addr = (rsdt_raw != 0).then_some(u64::from(rsdt_raw));

            if v1p.revision >= 2 {
                // Need the full v2 structure to read length + xsdt.
                let v2 = map.map_ro(rsdp_addr, size_of::<Xsdp>());
                let v2p = &*v2.as_ptr().cast::<Xsdp>();
                let len = v2p.length as usize;
                let full = map.map_ro(rsdp_addr, len);
                if sum(full) != 0 {
                    warn!("XSDP at {rsdp_addr:#X} fails its extended checksum");
                    return None;
                }
                let xsdt = v2p.xsdt_addr;
                return Some(Self {
                    rsdp_addr,
                    xsdt_addr: (xsdt != 0).then_some(xsdt),
                    rsdt_addr,
                });
            }

            Some(Self {
                rsdp_addr,
                xsdt_addr: None,
                rsdt_addr,
            })
        }
    }

    /// The preferred root table: the XSDT when present, else the RSDT.
    #[must_use]
    pub const fn root_table(&self) -> Option<u64> {
        match (self.xsdt_addr, self.rsdt_addr) {
            (Some(xsdt), _) => Some(xsdt),
            (None, rsdt) => rsdt,
        }
    }
}

/// A mapped RSDT or XSDT, exposing its pointer array.
#[derive(Clone, Copy)]
pub struct RootTable<'a> {
    header: DescriptionHeader,
    entries: &'a [u8],
    entry_width: usize,
}

impl<'a> RootTable<'a> {
    /// Validates the header and wraps the entry array. Accepts both the
    /// 32-bit (RSDT) and 64-bit (XSDT) forms.
    ///
    /// # Errors
    /// [`TableError::BadSignature`] for anything other than RSDT/XSDT;
    /// length and checksum failures as reported by
    /// [`DescriptionHeader::validate`].
    pub fn parse(bytes: &'a [u8]) -> Result<Self, TableError> {
        let header = DescriptionHeader::validate(bytes)?;
        let entry_width = match header.signature {
            RSDT_SIGNATURE => size_of::<u32>(),
            XSDT_SIGNATURE => size_of::<u64>(),
            _ => return Err(TableError::BadSignature),
        };
        let entries = &bytes[size_of::<DescriptionHeader>()..header.length as usize];
        Ok(Self {
            header,
            entries,
            entry_width,
        })
    }

    /// The validated table header.
    #[must_use]
    pub const fn header(&self) -> DescriptionHeader {
        self.header
    }

    /// Number of table pointers in the array.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.entries.len() / self.entry_width
    }

    /// Whether the root table points at no tables at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Walks the physical table pointers, widened to `u64`.
    pub fn entries(self) -> impl Iterator<Item = u64> + 'a {
        let width = self.entry_width;
        self.entries.chunks_exact(width).map(move |chunk| {
            if width == size_of::<u32>() {
                u64::from(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            } else {
                let mut raw = [0_u8; 8];
                raw.copy_from_slice(chunk);
                u64::from_le_bytes(raw)
            }
        })
    }
}
