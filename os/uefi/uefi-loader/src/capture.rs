//! # Firmware Table Capture
//!
//! Finds the platform's ACPI and SMBIOS tables while boot services are
//! still up and folds them into the table directory the kernel receives.
//!
//! ACPI tables stay where the firmware put them: the loader walks the
//! physical map's table-bearing regions, maps each one read-only into the
//! kernel window the first time a root pointer lands in it, and records
//! both addresses of every table. SMBIOS data and the optional override
//! file are copied into loader-owned pages instead, since their original
//! homes do not survive the hand-off.

use crate::BootError;
use crate::file_system::{BootVolume, OpenError};
use crate::memory::{IdentityMapper, LoaderMemory, identity_ptr, identity_slice, identity_slice_mut};
use alloc::vec::Vec;
use kernel_acpi_tables::directory::TableDirectory;
use kernel_acpi_tables::fadt::{FADT_SIGNATURE, Fadt};
use kernel_acpi_tables::header::DescriptionHeader;
use kernel_acpi_tables::madt::{MADT_SIGNATURE, MadtView};
use kernel_acpi_tables::rsdp::{AcpiRoots, RootTable};
use kernel_acpi_tables::{DSDT_SIGNATURE, Signature, table_signature};
use kernel_mdl::{MemoryDescriptor, MemoryDescriptorList, MemoryType};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, pages_for};
use kernel_vmem::{AddressSpace, MapAttributes};
use log::{debug, error, warn};
use uefi::system;
use uefi::table::cfg::{ACPI_GUID, ACPI2_GUID, SMBIOS_GUID, SMBIOS3_GUID};

/// Optional file of extra firmware tables, laid out back to back.
const TABLE_OVERRIDE_FILE: &str = "fwtables.dat";

const SMBIOS3_ANCHOR: &[u8; 5] = b"_SM3_";
const SMBIOS_ANCHOR: &[u8; 4] = b"_SM_";

/// Physical memory regions that may hold firmware tables.
const fn is_table_region(kind: MemoryType) -> bool {
    matches!(
        kind,
        MemoryType::AcpiTables | MemoryType::AcpiNvStorage | MemoryType::FirmwarePermanent
    )
}

fn find_rsdp() -> Option<u64> {
    system::with_config_table(|entries| {
        let mut fallback = None;
        for entry in entries {
            if entry.guid == ACPI2_GUID {
                return Some(PhysicalAddress::from_ptr(entry.address).as_u64());
            }
            if entry.guid == ACPI_GUID {
                fallback = Some(PhysicalAddress::from_ptr(entry.address).as_u64());
            }
        }
        fallback
    })
}

fn find_smbios() -> Option<u64> {
    system::with_config_table(|entries| {
        let mut fallback = None;
        for entry in entries {
            if entry.guid == SMBIOS3_GUID {
                return Some(PhysicalAddress::from_ptr(entry.address).as_u64());
            }
            if entry.guid == SMBIOS_GUID {
                fallback = Some(PhysicalAddress::from_ptr(entry.address).as_u64());
            }
        }
        fallback
    })
}

/// Reads a table's full byte image through the firmware's flat mapping.
///
/// # Safety
/// `paddr` must point at a description header in firmware-readable memory.
pub(crate) unsafe fn table_bytes(paddr: u64) -> Option<&'static [u8]> {
    if paddr == 0 {
        return None;
    }
    let base = PhysicalAddress::new(paddr);
    // SAFETY: caller contract; the header bounds the full read.
    let header_bytes = unsafe { identity_slice(base, size_of::<DescriptionHeader>()) };
    let header = DescriptionHeader::parse(header_bytes).ok()?;
    let len = usize::try_from(header.length).ok()?;
    if len < size_of::<DescriptionHeader>() {
        return None;
    }
    // SAFETY: caller contract.
    Some(unsafe { identity_slice(base, len) })
}

/// Reads just the description header, without checksum validation.
fn probe_header(paddr: u64) -> Option<DescriptionHeader> {
    if paddr == 0 {
        return None;
    }
    // SAFETY: pointers come from the firmware's own root table.
    let bytes =
        unsafe { identity_slice(PhysicalAddress::new(paddr), size_of::<DescriptionHeader>()) };
    DescriptionHeader::parse(bytes).ok()
}

fn firmware_root() -> Option<u64> {
    let rsdp = find_rsdp()?;
    // SAFETY: the configuration table names a real RSDP.
    let roots = unsafe { AcpiRoots::parse(&IdentityMapper, rsdp) }?;
    roots.root_table()
}

/// Looks `signature` up through the firmware's root table, before any
/// directory exists.
pub fn find_firmware_table(signature: u32) -> Option<u64> {
    let root = firmware_root()?;
    // SAFETY: the root address came from a validated RSDP.
    let bytes = unsafe { table_bytes(root) }?;
    let table = RootTable::parse(bytes).ok()?;
    table
        .entries()
        .find(|&entry| probe_header(entry).is_some_and(|header| header.signature == signature))
}

/// FADT lookup for the early hardware gates.
pub fn early_fadt() -> Option<Fadt> {
    let addr = find_firmware_table(FADT_SIGNATURE)?;
    // SAFETY: address probed by the lookup.
    let bytes = unsafe { table_bytes(addr) }?;
    Fadt::parse(bytes).ok()
}

/// Whether the MADT claims dual 8259 controllers; `None` without a MADT.
pub fn early_has_dual_8259() -> Option<bool> {
    let addr = find_firmware_table(MADT_SIGNATURE)?;
    // SAFETY: address probed by the lookup.
    let bytes = unsafe { table_bytes(addr) }?;
    let view = MadtView::parse(bytes).ok()?;
    Some(view.has_dual_8259())
}

/// The table-bearing regions of the physical map, mapped lazily.
struct TableRegions {
    regions: Vec<(MemoryDescriptor, Option<VirtualAddress>)>,
}

impl TableRegions {
    fn collect(physical: &MemoryDescriptorList) -> Self {
        let regions = physical
            .iter()
            .filter(|descriptor| is_table_region(descriptor.kind))
            .map(|descriptor| (*descriptor, None))
            .collect();
        Self { regions }
    }

    fn len(&self) -> usize {
        self.regions.len()
    }

    fn region_of(&self, paddr: u64) -> Option<usize> {
        self.regions
            .iter()
            .position(|(descriptor, _)| descriptor.contains(paddr))
    }

    /// Translates `paddr` to its kernel virtual address, mapping the
    /// containing region read-only on first use.
    fn translate(
        &mut self,
        index: usize,
        memory: &mut LoaderMemory,
        space: &mut AddressSpace,
        paddr: u64,
    ) -> Result<u64, BootError> {
        let (descriptor, mapping) = &mut self.regions[index];
        let base = if let Some(va) = *mapping {
            va
        } else {
            let va = space.map_physical_address(
                memory,
                &IdentityMapper,
                None,
                PhysicalAddress::new(descriptor.base),
                descriptor.size,
                MapAttributes::new().with_read_only(true).with_global(true),
                descriptor.kind,
            )?;
            debug!(
                "{:?} region [{:#x}..{:#x}) mapped at {va}",
                descriptor.kind,
                descriptor.base,
                descriptor.end()
            );
            *mapping = Some(va);
            va
        };
        Ok(base.as_u64() + (paddr - descriptor.base))
    }
}

/// Captures every firmware table the kernel will need.
///
/// # Errors
/// [`BootError::NoFirmwareTables`] when not a single table turns up;
/// allocation and mapping failures pass through.
pub fn capture_firmware_tables(
    memory: &mut LoaderMemory,
    space: &mut AddressSpace,
    volume: &mut BootVolume,
) -> Result<TableDirectory, BootError> {
    let mut directory = TableDirectory::new();

    capture_acpi(memory, space, &mut directory)?;
    capture_override_file(memory, space, volume, &mut directory)?;
    capture_smbios(memory, space, &mut directory)?;

    if directory.is_empty() {
        error!("no firmware tables found");
        return Err(BootError::NoFirmwareTables);
    }
    debug!("{} firmware tables captured", directory.len());
    Ok(directory)
}

fn capture_acpi(
    memory: &mut LoaderMemory,
    space: &mut AddressSpace,
    directory: &mut TableDirectory,
) -> Result<(), BootError> {
    let Some(root) = firmware_root() else {
        warn!("no ACPI root table");
        return Ok(());
    };
    // SAFETY: the root address came from a validated RSDP.
    let Some(bytes) = (unsafe { table_bytes(root) }) else {
        warn!("ACPI root table at {root:#x} unreadable");
        return Ok(());
    };
    let Ok(table) = RootTable::parse(bytes) else {
        warn!("ACPI root table at {root:#x} failed validation");
        return Ok(());
    };
    let pointers: Vec<u64> = table.entries().collect();

    let mut regions = TableRegions::collect(memory.physical_map());
    let mut fadt_address = None;
    for index in 0..regions.len() {
        for &entry in &pointers {
            if regions.region_of(entry) != Some(index) {
                continue;
            }
            let Some(header) = probe_header(entry) else {
                warn!("skipping unreadable root entry at {entry:#x}");
                continue;
            };
            let kernel_address = regions.translate(index, memory, space, entry)?;
            directory.add_table(header.signature, entry, kernel_address);
            if header.signature == FADT_SIGNATURE {
                fadt_address = Some(entry);
            }
        }
    }
    for &entry in &pointers {
        if regions.region_of(entry).is_none() {
            warn!("root entry at {entry:#x} lies outside every table region");
        }
    }

    // The DSDT is only reachable through the FADT.
    if let Some(addr) = fadt_address {
        capture_dsdt(memory, space, &mut regions, directory, addr)?;
    }
    Ok(())
}

fn capture_dsdt(
    memory: &mut LoaderMemory,
    space: &mut AddressSpace,
    regions: &mut TableRegions,
    directory: &mut TableDirectory,
    fadt_address: u64,
) -> Result<(), BootError> {
    // SAFETY: probed during the root walk.
    let Some(bytes) = (unsafe { table_bytes(fadt_address) }) else {
        return Ok(());
    };
    let Ok(fadt) = Fadt::parse(bytes) else {
        warn!("FADT failed validation; DSDT unreachable");
        return Ok(());
    };
    let dsdt = fadt.dsdt_address();
    if dsdt == 0 {
        warn!("FADT names no DSDT");
        return Ok(());
    }
    match probe_header(dsdt) {
        Some(header) if header.signature == DSDT_SIGNATURE => {}
        Some(header) => {
            warn!(
                "table at DSDT pointer {dsdt:#x} is a {}, not a DSDT",
                Signature(header.signature)
            );
            return Ok(());
        }
        None => {
            warn!("DSDT pointer {dsdt:#x} unreadable");
            return Ok(());
        }
    }
    let Some(index) = regions.region_of(dsdt) else {
        warn!("DSDT at {dsdt:#x} lies outside every table region");
        return Ok(());
    };
    let kernel_address = regions.translate(index, memory, space, dsdt)?;
    directory.add_table(DSDT_SIGNATURE, dsdt, kernel_address);
    Ok(())
}

fn capture_override_file(
    memory: &mut LoaderMemory,
    space: &mut AddressSpace,
    volume: &mut BootVolume,
    directory: &mut TableDirectory,
) -> Result<(), BootError> {
    let data = match volume.load_config_file(TABLE_OVERRIDE_FILE) {
        Ok(data) => data,
        Err(OpenError::NotFound) => {
            debug!("no {TABLE_OVERRIDE_FILE}");
            return Ok(());
        }
        Err(err) => {
            warn!("cannot read {TABLE_OVERRIDE_FILE}: {err}");
            return Ok(());
        }
    };
    if data.is_empty() {
        return Ok(());
    }
    let (phys, va) = publish_blob(memory, space, &data, MemoryType::LoaderTemporary)?;

    // Contiguous self-describing records; a malformed tail keeps whatever
    // parsed before it.
    let mut offset = 0usize;
    while offset + size_of::<DescriptionHeader>() <= data.len() {
        let Ok(header) = DescriptionHeader::parse(&data[offset..]) else {
            warn!("{TABLE_OVERRIDE_FILE}: bad header at offset {offset:#x}");
            break;
        };
        let Ok(len) = usize::try_from(header.length) else {
            break;
        };
        if len < size_of::<DescriptionHeader>() || offset + len > data.len() {
            warn!("{TABLE_OVERRIDE_FILE}: truncated table at offset {offset:#x}");
            break;
        }
        let Ok(delta) = u64::try_from(offset) else {
            break;
        };
        directory.add_table(header.signature, phys.as_u64() + delta, va.as_u64() + delta);
        offset += len;
    }
    Ok(())
}

struct SmbiosLayout {
    signature: u32,
    entry_length: usize,
    table_address: u64,
    table_length: usize,
}

fn parse_smbios_entry(paddr: u64) -> Option<SmbiosLayout> {
    // SAFETY: the configuration table points at the entry structure.
    let probe = unsafe { identity_slice(PhysicalAddress::new(paddr), 0x20) };
    if probe[..SMBIOS3_ANCHOR.len()] == *SMBIOS3_ANCHOR {
        let entry_length = usize::from(probe[6]);
        let table_length = usize::try_from(u32::from_le_bytes(probe[0x0C..0x10].try_into().ok()?))
            .ok()?;
        let table_address = u64::from_le_bytes(probe[0x10..0x18].try_into().ok()?);
        return Some(SmbiosLayout {
            signature: table_signature(b"_SM3"),
            entry_length,
            table_address,
            table_length,
        });
    }
    if probe[..SMBIOS_ANCHOR.len()] == *SMBIOS_ANCHOR {
        let entry_length = usize::from(probe[5]);
        let table_length = usize::from(u16::from_le_bytes(probe[0x16..0x18].try_into().ok()?));
        let table_address = u64::from(u32::from_le_bytes(probe[0x18..0x1C].try_into().ok()?));
        return Some(SmbiosLayout {
            signature: table_signature(b"_SM_"),
            entry_length,
            table_address,
            table_length,
        });
    }
    None
}

fn capture_smbios(
    memory: &mut LoaderMemory,
    space: &mut AddressSpace,
    directory: &mut TableDirectory,
) -> Result<(), BootError> {
    let Some(entry_point) = find_smbios() else {
        debug!("no SMBIOS configuration entry");
        return Ok(());
    };
    let Some(layout) = parse_smbios_entry(entry_point) else {
        warn!("SMBIOS entry point at {entry_point:#x} not recognized");
        return Ok(());
    };
    if layout.entry_length == 0
        || layout.entry_length > 0x20
        || layout.table_length == 0
        || layout.table_address == 0
    {
        warn!("SMBIOS entry point at {entry_point:#x} is degenerate");
        return Ok(());
    }

    // One backing buffer, entry point first with the structures right
    // behind it, so the pair stays together across the hand-off.
    let mut blob = Vec::with_capacity(layout.entry_length + layout.table_length);
    // SAFETY: lengths come from the anchored entry point.
    blob.extend_from_slice(unsafe {
        identity_slice(PhysicalAddress::new(entry_point), layout.entry_length)
    });
    // SAFETY: the entry point names this range as the structure table.
    blob.extend_from_slice(unsafe {
        identity_slice(PhysicalAddress::new(layout.table_address), layout.table_length)
    });
    let (phys, va) = publish_blob(memory, space, &blob, MemoryType::LoaderPermanent)?;
    directory.add_table(layout.signature, phys.as_u64(), va.as_u64());
    debug!("SMBIOS captured ({} bytes)", blob.len());
    Ok(())
}

/// Copies `bytes` into fresh pages of `kind` and maps them read-only in
/// the kernel window. Returns both addresses.
///
/// # Errors
/// Allocation or mapping failure.
pub fn publish_blob(
    memory: &mut LoaderMemory,
    space: &mut AddressSpace,
    bytes: &[u8],
    kind: MemoryType,
) -> Result<(PhysicalAddress, VirtualAddress), BootError> {
    let len = u64::try_from(bytes.len()).map_err(|_| BootError::ConversionFailed)?;
    let phys = memory.allocate_region(len, kind)?;
    let span =
        usize::try_from(pages_for(len) * PAGE_SIZE).map_err(|_| BootError::ConversionFailed)?;
    // SAFETY: freshly allocated pages, identity-reachable before the
    // address-space switch.
    let target = unsafe { identity_slice_mut(phys, span) };
    target[..bytes.len()].copy_from_slice(bytes);
    target[bytes.len()..].fill(0);
    let va = space.map_physical_address(
        memory,
        &IdentityMapper,
        None,
        phys,
        len,
        MapAttributes::new().with_read_only(true).with_global(true),
        kind,
    )?;
    Ok((phys, va))
}

/// Serializes the directory into its hand-off form in pages the kernel
/// keeps, and returns the kernel virtual address of the block.
///
/// # Errors
/// Allocation, mapping, or serialization failure.
pub fn publish_directory(
    memory: &mut LoaderMemory,
    space: &mut AddressSpace,
    directory: &TableDirectory,
) -> Result<VirtualAddress, BootError> {
    let slots = directory.handoff_len();
    let bytes = u64::try_from(slots * size_of::<u64>()).map_err(|_| BootError::ConversionFailed)?;
    let phys = memory.allocate_region(bytes, MemoryType::LoaderPermanent)?;
    // SAFETY: fresh pages; page alignment covers u64.
    let out = unsafe { core::slice::from_raw_parts_mut(identity_ptr::<u64>(phys), slots) };
    directory.write_handoff(out)?;
    let va = space.map_physical_address(
        memory,
        &IdentityMapper,
        None,
        phys,
        bytes,
        MapAttributes::new().with_read_only(true).with_global(true),
        MemoryType::LoaderPermanent,
    )?;
    debug!("firmware table directory at {va} ({slots} slots)");
    Ok(va)
}
