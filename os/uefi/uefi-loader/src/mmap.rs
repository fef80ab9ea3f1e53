//! # Firmware Memory Map Translation
//!
//! The firmware map speaks UEFI types; everything downstream speaks
//! [`MemoryType`]. This module translates in both directions of the boot:
//! seeding the working physical map early, and sealing the final hand-off
//! map in the allocation-free window after exit-boot-services.

use crate::BootError;
use kernel_mdl::{MemoryDescriptor, MemoryDescriptorList, MemoryType};
use kernel_memory_addresses::PAGE_SIZE;
use log::info;
use uefi::boot;
use uefi::boot::MemoryType as EfiMemoryType;
use uefi::mem::memory_map::{MemoryDescriptor as EfiMemoryDescriptor, MemoryMap};
use uefi::Status;

/// Slack descriptors for map growth between the probe and the real exit.
const EXTRA_DESCRIPTORS: usize = 32;

/// Maps a firmware memory type onto the hand-off vocabulary.
///
/// Loader ranges start out *temporary*; the sealing pass later overlays the
/// sub-ranges this loader explicitly allocated with their tracked types.
#[must_use]
pub fn translate_memory_type(ty: EfiMemoryType) -> MemoryType {
    match ty {
        EfiMemoryType::CONVENTIONAL => MemoryType::Free,
        EfiMemoryType::LOADER_CODE | EfiMemoryType::LOADER_DATA => MemoryType::LoaderTemporary,
        EfiMemoryType::BOOT_SERVICES_CODE | EfiMemoryType::BOOT_SERVICES_DATA => {
            MemoryType::FirmwareTemporary
        }
        EfiMemoryType::RUNTIME_SERVICES_CODE
        | EfiMemoryType::RUNTIME_SERVICES_DATA
        | EfiMemoryType::PAL_CODE => MemoryType::FirmwarePermanent,
        EfiMemoryType::ACPI_RECLAIM => MemoryType::AcpiTables,
        EfiMemoryType::ACPI_NON_VOLATILE => MemoryType::AcpiNvStorage,
        EfiMemoryType::MMIO | EfiMemoryType::MMIO_PORT_SPACE => MemoryType::Hardware,
        _ => MemoryType::Reserved,
    }
}

fn descriptor_span(desc: &EfiMemoryDescriptor) -> (u64, u64) {
    (desc.phys_start, desc.page_count * PAGE_SIZE)
}

/// Builds the working physical map from a fresh firmware memory map.
///
/// # Errors
/// [`BootError::Firmware`] when the firmware cannot produce its map.
pub fn physical_memory_map() -> Result<MemoryDescriptorList, BootError> {
    let map = boot::memory_map(EfiMemoryType::LOADER_DATA)?;
    let mut physical = MemoryDescriptorList::new();
    for desc in map.entries() {
        let (base, size) = descriptor_span(desc);
        physical.insert(MemoryDescriptor::new(
            base,
            size,
            translate_memory_type(desc.ty),
        ));
    }
    info!(
        "physical map: {} descriptors, {:#x} bytes, {:#x} free",
        physical.descriptor_count(),
        physical.total_space(),
        physical.free_space()
    );
    Ok(physical)
}

/// How the current firmware map describes `address`, if at all.
///
/// Used for probes that must not trust the working map, like deciding
/// whether a BIOS data area backs physical page zero.
#[must_use]
pub fn firmware_region_type(address: u64) -> Option<MemoryType> {
    let map = boot::memory_map(EfiMemoryType::LOADER_DATA).ok()?;
    map.entries().find_map(|desc| {
        let (base, size) = descriptor_span(desc);
        (address >= base && address < base + size).then(|| translate_memory_type(desc.ty))
    })
}

/// Descriptor slots to reserve for [`seal_physical_map`], probed while
/// allocation still works.
///
/// Every tracked override can split a firmware range in two, and the map
/// itself keeps shifting until the real exit, hence the generous slack.
///
/// # Errors
/// [`BootError::Firmware`] when the firmware cannot produce its map.
pub fn final_map_slots(tracked: &MemoryDescriptorList) -> Result<usize, BootError> {
    let probe = boot::memory_map(EfiMemoryType::LOADER_DATA)?;
    let meta = probe.meta();
    let count = meta.map_size / meta.desc_size;
    Ok(count + EXTRA_DESCRIPTORS + tracked.descriptor_count() * 2)
}

/// Whether a tracked range was placed by this loader and must survive the
/// hand-off with its tracked type.
const fn loader_override(kind: MemoryType) -> bool {
    matches!(
        kind,
        MemoryType::LoaderTemporary
            | MemoryType::LoaderPermanent
            | MemoryType::PageTables
            | MemoryType::BootPageTables
            | MemoryType::MmStructures
    )
}

/// Appends coalescing descriptors into a fixed slice; no allocation.
struct MapWriter<'a> {
    out: &'a mut [MemoryDescriptor],
    used: usize,
}

impl MapWriter<'_> {
    fn push(&mut self, base: u64, size: u64, kind: MemoryType) -> Result<(), BootError> {
        if size == 0 {
            return Ok(());
        }
        if self.used > 0 {
            let prev = &mut self.out[self.used - 1];
            if prev.kind == kind && prev.end() == base {
                prev.size += size;
                return Ok(());
            }
        }
        if self.used == self.out.len() {
            return Err(BootError::Firmware(Status::BUFFER_TOO_SMALL));
        }
        self.out[self.used] = MemoryDescriptor::new(base, size, kind);
        self.used += 1;
        Ok(())
    }
}

/// Exits boot services and writes the final physical map into `out`.
///
/// Runs in the allocation-free window: the returned firmware map is walked
/// in place, each range translated, and ranges this loader allocated are
/// overlaid with their tracked types. Returns the number of slots used.
///
/// # Errors
/// [`BootError::Firmware`] with `BUFFER_TOO_SMALL` when `out` cannot hold
/// the map; size `out` with [`final_map_slots`].
///
/// # Safety
/// The usual exit-boot-services contract: no further firmware calls except
/// runtime services, no allocation, and every boot-services handle is dead.
pub unsafe fn exit_boot_services_and_seal(
    tracked: &MemoryDescriptorList,
    out: &mut [MemoryDescriptor],
) -> Result<usize, BootError> {
    let final_map = unsafe { boot::exit_boot_services(None) };

    let mut writer = MapWriter { out, used: 0 };
    for desc in final_map.entries() {
        let (base, size) = descriptor_span(desc);
        let end = base + size;
        let default_kind = translate_memory_type(desc.ty);

        let mut cursor = base;
        for t in tracked {
            if t.end() <= cursor || t.base >= end || !loader_override(t.kind) {
                continue;
            }
            let overlay_base = t.base.max(cursor);
            let overlay_end = t.end().min(end);
            writer.push(cursor, overlay_base - cursor, default_kind)?;
            writer.push(overlay_base, overlay_end - overlay_base, t.kind)?;
            cursor = overlay_end;
        }
        writer.push(cursor, end - cursor, default_kind)?;
    }
    Ok(writer.used)
}
