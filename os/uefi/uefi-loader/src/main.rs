//! # UEFI Boot Loader
//!
//! Firmware-side half of the boot contract. This application runs as a
//! UEFI executable, gathers everything the kernel needs while boot
//! services are still alive, exits them, and enters the kernel with a
//! single pointer to a hand-off block.
//!
//! ## Boot sequence
//!
//! The flow is a fixed sequence of numbered steps. Each step is announced
//! on the log before it runs; when one fails, the failure report names the
//! step, and the step index is the last line on the firmware console.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  1      environment: firmware helpers, logging          │
//! │  2      debug transport discovery (8259, BDA, PCI)      │
//! │  3- 7   memory map capture, kernel paging structures,   │
//! │         identity windows: low hardware, firmware        │
//! │         runtime regions, loader image, firmware stack   │
//! │  8-10   boot entry, hand-off block, table staging slot  │
//! │ 11-16   boot volume, kernel image, kernel stack,        │
//! │         paging structures mapped for the kernel         │
//! │ 17-18   firmware table capture, configuration files     │
//! │ 19-20   boot drivers, volume closed                     │
//! │ 21-26   debug register windows, cycle counter, table    │
//! │         directory, image list, memory-manager reserve,  │
//! │         wall-clock time                                 │
//! │ 27      exit boot services, seal the physical map       │
//! │ 28      release firmware-held debug hardware            │
//! │ 29      switch to the kernel address space              │
//! │ 30-31   debug transport report, hand-off trace, kernel  │
//! │         entry                                           │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Address spaces
//!
//! Until step 29 the firmware's flat mapping is live: every physical
//! address is also a virtual address, and the loader builds the kernel's
//! tree on the side through identity pointers. The new tree carries two
//! kinds of ranges:
//!
//! * Kernel-window mappings (the hand-off block, kernel and driver
//!   images, stacks, captured firmware tables) allocated out of the
//!   kernel's virtual range and marked global.
//! * Identity mappings the transition itself needs: the loader image and
//!   the firmware stack (so the switch survives), the first page and VGA
//!   text memory, firmware runtime regions, and discovered debug register
//!   windows.
//!
//! After the switch, firmware pool memory is gone from the map. Anything
//! steps 30 and 31 touch is either a local on the identity-mapped stack
//! or reached through the kernel addresses recorded in the hand-off
//! block.
//!
//! ## Memory accounting
//!
//! Every page the loader takes from the firmware is recorded in a typed
//! descriptor list. At step 27 the final firmware map is re-typed through
//! that list and serialized for the kernel, so loader-permanent data,
//! page tables, and bootstrap reservations arrive correctly labelled.
//!
//! ## Failure
//!
//! Fallible steps return [`BootError`]. The orchestrator translates it
//! into a [`Status`] at the single firmware boundary in [`efi_main`];
//! nothing below this file deals in raw firmware status values.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![no_main]
#![allow(unsafe_code)]
extern crate alloc;

mod capture;
mod debug_device;
mod file_system;
mod image;
mod logger;
mod memory;
mod mmap;
mod tracing;

use crate::debug_device::DebugPlatform;
use crate::file_system::{BootVolume, OpenError};
use crate::image::{ElfFormat, ImageError, ImageSystem, LoadFlags};
use crate::logger::BootLogger;
use crate::memory::{
    IdentityMapper, LoaderMemory, identity_ptr, identity_slice, identity_slice_mut,
};
use alloc::vec::Vec;
use core::convert::Infallible;
use kernel_acpi_tables::TableError;
use kernel_acpi_tables::dbg2::DBG2_SIGNATURE;
use kernel_boot::{
    BootEntry, BootTime, BufferRegion, DescriptorTable, InitBlock, LoadedImage as ImageRecord,
    driver_names, mm_bootstrap_size,
};
use kernel_mdl::{MemoryDescriptor, MemoryType};
use kernel_memory_addresses::{
    PAGE_SIZE, PhysicalAddress, VirtualAddress, align_down, align_up, pages_for,
};
use kernel_registers::cr0::Cr0;
use kernel_registers::cr3::Cr3;
use kernel_registers::cr4::Cr4;
use kernel_registers::efer::Efer;
use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use kernel_vmem::{AddressSpace, MapAttributes, SELF_MAP_BASE, VmemError};
use log::{LevelFilter, debug, error, info, warn};
use thiserror::Error;
use uefi::prelude::*;
use uefi::proto::loaded_image::LoadedImage;

/// Size of the kernel's initial stack.
const KERNEL_STACK_BYTES: u64 = 64 * 1024;

/// Identity window kept below the firmware stack pointer at map time.
const STACK_WINDOW_BELOW: u64 = 96 * 1024;
/// Identity window kept above it, for frames already on the stack.
const STACK_WINDOW_ABOVE: u64 = 32 * 1024;

/// VGA text memory, mapped uncached for early kernel output.
const VGA_TEXT_BASE: u64 = 0xB8000;
const VGA_WINDOW_BYTES: u64 = 0x8000;

/// Stall length for the cycle-counter measurement: a tenth of a second.
const CYCLE_STALL_MICROS: usize = 100_000;

/// Spare virtual-map slots for the hand-off arrays' own mappings.
const VIRTUAL_MAP_SLACK: usize = 8;

/// Configuration files published to the kernel verbatim.
const BOOT_DRIVER_LIST: &str = "bootdrv.set";
const DEVICE_TO_DRIVER_MAP: &str = "dev2drv.set";
const DEVICE_MAP: &str = "devmap.set";

/// Name under which the loader records itself in the image list.
const LOADER_IMAGE_NAME: &str = "loader.efi";

/// Everything that can stop the boot, folded into one type so the
/// orchestrator stays a plain `?` sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
enum BootError {
    #[error("firmware call failed with {0:?}")]
    Firmware(Status),
    #[error(transparent)]
    Memory(#[from] VmemError),
    #[error(transparent)]
    Volume(#[from] OpenError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Tables(#[from] TableError),
    #[error("a size or count left its field's range")]
    ConversionFailed,
    #[error("no firmware tables found")]
    NoFirmwareTables,
}

impl From<uefi::Error> for BootError {
    fn from(err: uefi::Error) -> Self {
        Self::Firmware(err.status())
    }
}

impl From<Status> for BootError {
    fn from(status: Status) -> Self {
        Self::Firmware(status)
    }
}

impl BootError {
    /// The status reported back to the firmware.
    const fn status(&self) -> Status {
        match self {
            Self::Firmware(status) | Self::Volume(OpenError::Io(status)) => *status,
            Self::Memory(VmemError::InvalidParameter) | Self::ConversionFailed => {
                Status::INVALID_PARAMETER
            }
            Self::Memory(_) | Self::Image(ImageError::Memory(_)) => Status::OUT_OF_RESOURCES,
            Self::Volume(OpenError::NotFound)
            | Self::Image(ImageError::PathNotFound)
            | Self::NoFirmwareTables => Status::NOT_FOUND,
            Self::Volume(_) => Status::UNSUPPORTED,
            Self::Image(ImageError::Io(status)) => *status,
            Self::Image(_) => Status::LOAD_ERROR,
            Self::Tables(_) => Status::COMPROMISED_DATA,
        }
    }
}

/// Boot step bookkeeping: the current index names the step in progress,
/// so a failure report always carries the step that died.
struct StepCounter {
    current: u64,
}

impl StepCounter {
    const fn new() -> Self {
        Self { current: 0 }
    }

    /// Advances to the next step and announces it.
    fn begin(&mut self, what: &str) {
        self.current += 1;
        debug!("step {}: {what}", self.current);
    }

    const fn current(&self) -> u64 {
        self.current
    }
}

/// Reads the CPU cycle counter.
pub(crate) fn cycle_timestamp() -> u64 {
    // SAFETY: RDTSC is unprivileged and has no side effects.
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[entry]
fn efi_main() -> Status {
    if uefi::helpers::init().is_err() {
        return Status::UNSUPPORTED;
    }

    let logger = BootLogger::new(LevelFilter::Debug)
        .init()
        .expect("logger init");

    let mut step = StepCounter::new();
    step.begin("initialize the boot environment");
    info!("boot loader starting");

    let failure = match boot(&mut *logger, &mut step) {
        Err(failure) => failure,
        Ok(never) => match never {},
    };

    error!("boot failed in step {}: {failure}", step.current());
    if logger.console_available() {
        // The step index stays on screen as the last console line.
        uefi::println!(
            "Loader failed: step {}, status {:?}",
            step.current(),
            failure.status()
        );
    }
    failure.status()
}

/// Runs boot steps 2 through 31. Success never returns; the kernel owns
/// the machine from step 31 on.
#[allow(clippy::too_many_lines)]
fn boot(logger: &mut BootLogger, step: &mut StepCounter) -> Result<Infallible, BootError> {
    step.begin("probe debug transports and legacy interrupt hardware");
    let platform = debug_device::discover();
    let firmware_owned = platform.firmware_owned();

    step.begin("capture the firmware memory map");
    let mut memory = LoaderMemory::new(mmap::physical_memory_map()?);
    info!(
        "{} descriptors, {:#x} bytes of physical memory",
        memory.physical_map().descriptor_count(),
        memory.physical_map().total_space()
    );

    step.begin("create the kernel paging structures");
    let mut space = AddressSpace::initialize_paging_structures(&mut memory, &IdentityMapper)?;

    step.begin("map the low hardware windows");
    map_low_hardware(&mut memory, &mut space)?;

    step.begin("map the firmware runtime regions");
    map_firmware_runtime(&mut memory, &mut space)?;

    step.begin("identity map the loader image and stack");
    let (image_base, image_size) = identity_map_loader(&mut memory, &mut space)?;
    map_firmware_stack(&mut memory, &mut space, image_base, image_size)?;

    step.begin("select the boot entry");
    let entry = BootEntry::default();
    info!(
        "system root '{}', kernel '{}'",
        entry.system_root, entry.kernel_path
    );

    step.begin("allocate the hand-off block");
    let (init_block, init_block_va) = allocate_init_block(&mut memory, &mut space)?;

    step.begin("wire the page-table staging slot");
    init_block.page_table_stage = space
        .create_page_table_stage(&mut memory, &IdentityMapper)?
        .as_u64();

    step.begin("open the boot volume");
    let mut volume = BootVolume::open(&entry)?;
    if let Err(err) = volume.open_drivers_directory(entry.drivers_directory) {
        warn!("drivers directory unavailable: {err}");
    }

    step.begin("prepare the image loader");
    let mut images = ImageSystem::new(ElfFormat);

    step.begin("open the configuration directory");
    if let Err(err) = volume.open_config_directory() {
        warn!("configuration directory unavailable: {err}");
    }

    step.begin("load the kernel image");
    let kernel_index = images.load(
        &mut volume,
        &mut memory,
        &mut space,
        &entry,
        entry.kernel_path,
        LoadFlags::boot_image().with_primary_executable(true),
    )?;

    step.begin("allocate the kernel stack");
    let kernel_stack = allocate_kernel_stack(&mut memory, &mut space)?;
    init_block.kernel_stack = kernel_stack;

    step.begin("map the paging structures for the kernel");
    init_block.page_directory = space
        .map_paging_structures(&mut memory, &IdentityMapper)?
        .as_u64();
    init_block.page_directory_physical = space.root_table().as_u64();
    init_block.self_map_base = SELF_MAP_BASE;

    step.begin("capture firmware tables");
    let mut directory = capture::capture_firmware_tables(&mut memory, &mut space, &mut volume)?;

    step.begin("publish the configuration files");
    let boot_drivers =
        load_and_map_config_file(&mut volume, &mut memory, &mut space, BOOT_DRIVER_LIST)?;
    let device_to_driver =
        load_and_map_config_file(&mut volume, &mut memory, &mut space, DEVICE_TO_DRIVER_MAP)?;
    let device_map = load_and_map_config_file(&mut volume, &mut memory, &mut space, DEVICE_MAP)?;
    init_block.boot_driver_file = region_of(boot_drivers.as_ref());
    init_block.device_to_driver_file = region_of(device_to_driver.as_ref());
    init_block.device_map_file = region_of(device_map.as_ref());

    step.begin("load the boot drivers");
    if let Some(list) = &boot_drivers {
        // SAFETY: the published pages stay allocated and are identity
        // reachable until the address-space switch.
        let bytes = unsafe { identity_slice(list.phys, list.len) };
        for name in driver_names(bytes) {
            let flags = LoadFlags::boot_image().with_global(true);
            if let Err(err) = images.load(&mut volume, &mut memory, &mut space, &entry, name, flags)
            {
                error!("boot driver '{name}' failed to load: {err}");
                return Err(err.into());
            }
        }
    }

    step.begin("close the boot volume");
    volume.close();

    step.begin("map the debug register windows");
    map_debug_windows(&platform, &mut memory, &mut space)?;

    step.begin("measure the cycle counter");
    init_block.cycle_counter_frequency = measure_cycle_counter();

    step.begin("publish the firmware table directory");
    if let Some(bytes) = platform.dbg2_bytes() {
        let (phys, va) =
            capture::publish_blob(&mut memory, &mut space, bytes, MemoryType::LoaderPermanent)?;
        directory.add_table(DBG2_SIGNATURE, phys.as_u64(), va.as_u64());
        debug!("generated debug port table published");
    }
    if entry.debug {
        info!("boot entry requests the kernel debugger");
    }
    init_block.firmware_tables = capture::publish_directory(&mut memory, &mut space, &directory)?
        .as_u64();

    step.begin("publish the image list");
    let loader_index = images.push_record(ImageRecord::new(
        LOADER_IMAGE_NAME,
        image_base,
        image_size,
        0,
        cycle_timestamp(),
    ));
    transfer_image_list(
        &images,
        &mut memory,
        &mut space,
        init_block,
        kernel_index,
        loader_index,
    )?;

    step.begin("reserve memory-manager bootstrap space");
    init_block.mm_init_memory = reserve_mm_bootstrap(&mut memory, &mut space)?;

    step.begin("capture the boot time");
    init_block.boot_time = capture_boot_time();

    // Everything steps 29 through 31 touch must be in locals now; heap
    // memory is unreachable once the address space switches.
    let kernel_entry = VirtualAddress::new(images.records()[kernel_index].entry_point);
    let stack_top = VirtualAddress::new(kernel_stack.base + kernel_stack.size);
    let root_table = space.root_table();

    step.begin("exit boot services and seal the physical map");
    if firmware_owned {
        info!("firmware-held debug hardware will be released; an attached debugger may disconnect");
    }
    let prepared = prepare_memory_map_seal(&mut memory, &mut space, init_block)?;
    logger.exit_boot_services();
    // SAFETY: single-threaded boot flow; past this call the loader makes
    // no boot-services calls and allocates nothing.
    let used =
        unsafe { mmap::exit_boot_services_and_seal(memory.physical_map(), prepared.phys_out)? };
    init_block.physical_map = DescriptorTable {
        base: prepared.phys_table_va.as_u64(),
        count: u64::try_from(used).map_err(|_| BootError::ConversionFailed)?,
    };

    step.begin("release firmware-held debug hardware");
    platform.disable_legacy_interrupts(&directory);

    step.begin("switch to the kernel address space");
    // SAFETY: the new tree maps the loader image, the firmware stack, and
    // every structure the remaining steps touch.
    unsafe { enable_paging(root_table) };
    // SAFETY: the block is mapped read-write at its kernel address; the
    // identity reference above it is dead from here on.
    let init_view = unsafe { &*init_block_va.as_ptr::<InitBlock>() };

    step.begin("report the debug transport state");
    if firmware_owned {
        info!("released debug transport is ready for the kernel debugger");
    }

    step.begin("enter the kernel");
    tracing::trace_init_block(init_view);
    info!("transferring control to the kernel");
    // SAFETY: entry point and stack live in the new address space, and the
    // block address is the one the kernel keeps.
    unsafe { transfer_to_kernel(init_block_va, kernel_entry, stack_top) }
}

/// The BIOS data area page and VGA text memory, identity mapped so the
/// kernel's early console and the debug probes can reach them.
fn map_low_hardware(memory: &mut LoaderMemory, space: &mut AddressSpace) -> Result<(), BootError> {
    space.map_physical_address(
        memory,
        &IdentityMapper,
        Some(VirtualAddress::new(0)),
        PhysicalAddress::new(0),
        PAGE_SIZE,
        MapAttributes::new(),
        MemoryType::Hardware,
    )?;
    space.map_physical_address(
        memory,
        &IdentityMapper,
        Some(VirtualAddress::new(VGA_TEXT_BASE)),
        PhysicalAddress::new(VGA_TEXT_BASE),
        VGA_WINDOW_BYTES,
        MapAttributes::new().with_cache_disable(true),
        MemoryType::Hardware,
    )?;
    Ok(())
}

/// Identity maps every firmware-permanent region. Runtime services keep
/// their flat addresses until the kernel relocates them.
fn map_firmware_runtime(
    memory: &mut LoaderMemory,
    space: &mut AddressSpace,
) -> Result<(), BootError> {
    let regions: Vec<(u64, u64)> = memory
        .physical_map()
        .iter()
        .filter(|descriptor| descriptor.kind == MemoryType::FirmwarePermanent)
        .map(|descriptor| (descriptor.base, descriptor.size))
        .collect();
    for (base, size) in regions {
        space.map_physical_address(
            memory,
            &IdentityMapper,
            Some(VirtualAddress::new(base)),
            PhysicalAddress::new(base),
            size,
            MapAttributes::new().with_execute(true),
            MemoryType::FirmwarePermanent,
        )?;
        debug!("runtime region [{base:#x}..{:#x})", base + size);
    }
    Ok(())
}

/// Identity maps the loader's own image, executable, so the code running
/// the address-space switch survives it. Returns the image placement.
fn identity_map_loader(
    memory: &mut LoaderMemory,
    space: &mut AddressSpace,
) -> Result<(u64, u64), BootError> {
    let image = boot::open_protocol_exclusive::<LoadedImage>(boot::image_handle())?;
    let (base_ptr, size) = image.info();
    let base = PhysicalAddress::from_ptr(base_ptr).as_u64();
    space.map_physical_address(
        memory,
        &IdentityMapper,
        Some(VirtualAddress::new(base)),
        PhysicalAddress::new(base),
        size,
        MapAttributes::new().with_execute(true),
        MemoryType::LoaderTemporary,
    )?;
    debug!("loader image at {base:#x} (+{size:#x})");
    Ok((base, size))
}

/// Identity maps a window around the current stack pointer so the switch
/// does not pull the stack out from under the running code.
fn map_firmware_stack(
    memory: &mut LoaderMemory,
    space: &mut AddressSpace,
    image_base: u64,
    image_size: u64,
) -> Result<(), BootError> {
    let rsp = current_stack_pointer();
    let window_base = align_down(rsp.saturating_sub(STACK_WINDOW_BELOW), PAGE_SIZE);
    let window_end = align_up(rsp.saturating_add(STACK_WINDOW_ABOVE), PAGE_SIZE);
    let image_end = align_up(image_base + image_size, PAGE_SIZE);

    let mut page = window_base;
    while page < window_end {
        // Firmware sometimes parks the stack right next to the image; the
        // pages inside it are already mapped.
        let inside_image = page >= image_base && page < image_end;
        if !inside_image {
            match space.map_physical_address(
                memory,
                &IdentityMapper,
                Some(VirtualAddress::new(page)),
                PhysicalAddress::new(page),
                PAGE_SIZE,
                MapAttributes::new(),
                MemoryType::LoaderTemporary,
            ) {
                Ok(_) | Err(VmemError::MemoryConflict) => {}
                Err(err) => return Err(err.into()),
            }
        }
        page += PAGE_SIZE;
    }
    debug!("firmware stack window [{window_base:#x}..{window_end:#x})");
    Ok(())
}

/// Allocates the hand-off block in loader-permanent pages, maps it into
/// the kernel window, and returns the identity view used to fill it.
fn allocate_init_block(
    memory: &mut LoaderMemory,
    space: &mut AddressSpace,
) -> Result<(&'static mut InitBlock, VirtualAddress), BootError> {
    let bytes = u64::try_from(size_of::<InitBlock>()).map_err(|_| BootError::ConversionFailed)?;
    let phys = memory.allocate_region(bytes, MemoryType::LoaderPermanent)?;
    let span =
        usize::try_from(pages_for(bytes) * PAGE_SIZE).map_err(|_| BootError::ConversionFailed)?;
    // SAFETY: fresh pages, identity-reachable before the switch.
    unsafe { identity_slice_mut(phys, span) }.fill(0);
    let pointer = identity_ptr::<InitBlock>(phys);
    // SAFETY: zeroed, page-aligned, exclusively owned pages.
    unsafe { pointer.write(InitBlock::new()) };
    let va = space.map_physical_address(
        memory,
        &IdentityMapper,
        None,
        phys,
        bytes,
        MapAttributes::new().with_global(true),
        MemoryType::LoaderPermanent,
    )?;
    debug!("hand-off block at {va} ({bytes} bytes)");
    // SAFETY: the block stays allocated for the rest of the boot.
    Ok((unsafe { &mut *pointer }, va))
}

/// Allocates and maps the kernel's initial stack, zeroed.
fn allocate_kernel_stack(
    memory: &mut LoaderMemory,
    space: &mut AddressSpace,
) -> Result<BufferRegion, BootError> {
    let phys = memory.allocate_region(KERNEL_STACK_BYTES, MemoryType::LoaderPermanent)?;
    let span = usize::try_from(KERNEL_STACK_BYTES).map_err(|_| BootError::ConversionFailed)?;
    // SAFETY: fresh pages, identity-reachable before the switch.
    unsafe { identity_slice_mut(phys, span) }.fill(0);
    let va = space.map_physical_address(
        memory,
        &IdentityMapper,
        None,
        phys,
        KERNEL_STACK_BYTES,
        MapAttributes::new().with_global(true),
        MemoryType::LoaderPermanent,
    )?;
    debug!("kernel stack at {va} (+{KERNEL_STACK_BYTES:#x})");
    Ok(BufferRegion {
        base: va.as_u64(),
        size: KERNEL_STACK_BYTES,
    })
}

/// A configuration file published for the kernel: the hand-off region and
/// the physical copy the loader itself can still read.
struct MappedFile {
    region: BufferRegion,
    phys: PhysicalAddress,
    len: usize,
}

fn region_of(file: Option<&MappedFile>) -> BufferRegion {
    file.map_or(BufferRegion::EMPTY, |mapped| mapped.region)
}

/// Loads `name` from the configuration directory and publishes it. A
/// missing or empty file is not an error; the kernel sees an empty region.
fn load_and_map_config_file(
    volume: &mut BootVolume,
    memory: &mut LoaderMemory,
    space: &mut AddressSpace,
    name: &str,
) -> Result<Option<MappedFile>, BootError> {
    let bytes = match volume.load_config_file(name) {
        Ok(bytes) => bytes,
        Err(OpenError::NotFound) => {
            debug!("no {name} on the boot volume");
            return Ok(None);
        }
        Err(err) => return Err(err.into()),
    };
    if bytes.is_empty() {
        debug!("{name} is empty");
        return Ok(None);
    }
    let (phys, va) = capture::publish_blob(memory, space, &bytes, MemoryType::LoaderPermanent)?;
    let len = bytes.len();
    let size = u64::try_from(len).map_err(|_| BootError::ConversionFailed)?;
    info!("{name}: {len} bytes at {va}");
    Ok(Some(MappedFile {
        region: BufferRegion {
            base: va.as_u64(),
            size,
        },
        phys,
        len,
    }))
}

/// Identity maps the register windows of discovered debug devices so the
/// kernel debug transport can drive them before it builds its own view.
fn map_debug_windows(
    platform: &DebugPlatform,
    memory: &mut LoaderMemory,
    space: &mut AddressSpace,
) -> Result<(), BootError> {
    for (base, bytes) in platform.mmio_regions() {
        let aligned = align_down(base, PAGE_SIZE);
        let span = align_up(base + bytes, PAGE_SIZE) - aligned;
        match space.map_physical_address(
            memory,
            &IdentityMapper,
            Some(VirtualAddress::new(aligned)),
            PhysicalAddress::new(aligned),
            span,
            MapAttributes::new().with_cache_disable(true),
            MemoryType::Hardware,
        ) {
            Ok(_) => debug!("debug registers at {aligned:#x} (+{span:#x})"),
            // A window inside an already-mapped region is fine.
            Err(VmemError::MemoryConflict) => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Ticks of the cycle counter per second, measured against the firmware's
/// microsecond stall. Zero when the counter does not advance.
fn measure_cycle_counter() -> u64 {
    let start = cycle_timestamp();
    boot::stall(CYCLE_STALL_MICROS);
    let elapsed = cycle_timestamp().wrapping_sub(start);
    if elapsed == 0 {
        warn!("cycle counter did not advance");
        return 0;
    }
    // The stall above is a tenth of a second.
    let frequency = elapsed.saturating_mul(10);
    info!("cycle counter runs at {frequency} Hz");
    frequency
}

/// Serializes the image records into loader-permanent pages and points the
/// hand-off block at them.
fn transfer_image_list(
    images: &ImageSystem<ElfFormat>,
    memory: &mut LoaderMemory,
    space: &mut AddressSpace,
    block: &mut InitBlock,
    kernel_index: usize,
    loader_index: usize,
) -> Result<(), BootError> {
    let records = images.records();
    let bytes =
        u64::try_from(core::mem::size_of_val(records)).map_err(|_| BootError::ConversionFailed)?;
    let phys = memory.allocate_region(bytes, MemoryType::LoaderPermanent)?;
    // SAFETY: fresh pages sized for the list, identity-reachable.
    unsafe {
        core::ptr::copy_nonoverlapping(
            records.as_ptr(),
            identity_ptr::<ImageRecord>(phys),
            records.len(),
        );
    }
    let va = space.map_physical_address(
        memory,
        &IdentityMapper,
        None,
        phys,
        bytes,
        MapAttributes::new().with_read_only(true).with_global(true),
        MemoryType::LoaderPermanent,
    )?;
    block.image_list = va.as_u64();
    block.image_count = u32::try_from(records.len()).map_err(|_| BootError::ConversionFailed)?;
    block.kernel_image_index =
        u32::try_from(kernel_index).map_err(|_| BootError::ConversionFailed)?;
    block.loader_image_index =
        u32::try_from(loader_index).map_err(|_| BootError::ConversionFailed)?;
    debug!("{} image records at {va}", records.len());
    Ok(())
}

/// Sets aside the memory the kernel's memory manager needs before it can
/// allocate on its own.
fn reserve_mm_bootstrap(
    memory: &mut LoaderMemory,
    space: &mut AddressSpace,
) -> Result<BufferRegion, BootError> {
    let virtual_descriptors = u64::try_from(space.virtual_space().descriptor_count())
        .map_err(|_| BootError::ConversionFailed)?;
    let firmware_permanent = u64::try_from(
        memory
            .physical_map()
            .iter()
            .filter(|descriptor| descriptor.kind == MemoryType::FirmwarePermanent)
            .count(),
    )
    .map_err(|_| BootError::ConversionFailed)?;
    let bytes = mm_bootstrap_size(
        virtual_descriptors,
        firmware_permanent,
        memory.physical_map().total_space(),
    );
    let phys = memory.allocate_region(bytes, MemoryType::MmStructures)?;
    let va = space.map_physical_address(
        memory,
        &IdentityMapper,
        None,
        phys,
        bytes,
        MapAttributes::new().with_global(true),
        MemoryType::MmStructures,
    )?;
    info!("memory manager bootstrap: {bytes:#x} bytes at {va}");
    Ok(BufferRegion {
        base: va.as_u64(),
        size: bytes,
    })
}

/// Wall-clock time from the firmware, or the unset marker when the clock
/// is unavailable.
fn capture_boot_time() -> BootTime {
    match runtime::get_time() {
        Ok(time) => BootTime::new(
            time.year(),
            time.month(),
            time.day(),
            time.hour(),
            time.minute(),
            time.second(),
            time.nanosecond(),
        ),
        Err(err) => {
            warn!("wall-clock time unavailable: {err}");
            BootTime::UNSET
        }
    }
}

/// Hand-off arrays prepared before exit-boot-services: the physical map
/// array waiting to be filled, and the kernel address it was mapped at.
struct SealPrepared {
    phys_out: &'static mut [MemoryDescriptor],
    phys_table_va: VirtualAddress,
}

/// Allocates and maps both hand-off descriptor arrays and serializes the
/// virtual map. The physical array is filled after exit-boot-services,
/// when the final firmware map exists; nothing may allocate in between.
fn prepare_memory_map_seal(
    memory: &mut LoaderMemory,
    space: &mut AddressSpace,
    block: &mut InitBlock,
) -> Result<SealPrepared, BootError> {
    let slots = mmap::final_map_slots(memory.physical_map())?;
    let table_bytes = u64::try_from(slots * size_of::<MemoryDescriptor>())
        .map_err(|_| BootError::ConversionFailed)?;
    let phys = memory.allocate_region(table_bytes, MemoryType::LoaderPermanent)?;
    let phys_table_va = space.map_physical_address(
        memory,
        &IdentityMapper,
        None,
        phys,
        table_bytes,
        MapAttributes::new().with_read_only(true).with_global(true),
        MemoryType::LoaderPermanent,
    )?;

    let capacity = space.virtual_space().descriptor_count() + VIRTUAL_MAP_SLACK;
    let virt_bytes = u64::try_from(capacity * size_of::<MemoryDescriptor>())
        .map_err(|_| BootError::ConversionFailed)?;
    let virt_phys = memory.allocate_region(virt_bytes, MemoryType::LoaderPermanent)?;
    let virt_va = space.map_physical_address(
        memory,
        &IdentityMapper,
        None,
        virt_phys,
        virt_bytes,
        MapAttributes::new().with_read_only(true).with_global(true),
        MemoryType::LoaderPermanent,
    )?;

    // Zero both arrays so unwritten slack reads as free space.
    let phys_span = usize::try_from(pages_for(table_bytes) * PAGE_SIZE)
        .map_err(|_| BootError::ConversionFailed)?;
    let virt_span = usize::try_from(pages_for(virt_bytes) * PAGE_SIZE)
        .map_err(|_| BootError::ConversionFailed)?;
    // SAFETY: fresh pages, identity-reachable before the switch.
    unsafe { identity_slice_mut(phys, phys_span) }.fill(0);
    // SAFETY: as above.
    unsafe { identity_slice_mut(virt_phys, virt_span) }.fill(0);

    // Serialize the virtual map now that both arrays' own mappings are in
    // it; nothing below changes it again.
    let tracked = space.virtual_space();
    let count = tracked.descriptor_count();
    if count > capacity {
        return Err(BootError::Firmware(Status::BUFFER_TOO_SMALL));
    }
    // SAFETY: zeroed pages sized for `capacity` records.
    let out = unsafe {
        core::slice::from_raw_parts_mut(identity_ptr::<MemoryDescriptor>(virt_phys), capacity)
    };
    for (slot, descriptor) in out.iter_mut().zip(tracked.iter()) {
        *slot = *descriptor;
    }
    block.virtual_map = DescriptorTable {
        base: virt_va.as_u64(),
        count: u64::try_from(count).map_err(|_| BootError::ConversionFailed)?,
    };
    debug!("virtual map sealed with {count} records");

    // SAFETY: zeroed pages sized for `slots` records, owned until the
    // kernel consumes them.
    let phys_out = unsafe {
        core::slice::from_raw_parts_mut(identity_ptr::<MemoryDescriptor>(phys), slots)
    };
    Ok(SealPrepared {
        phys_out,
        phys_table_va,
    })
}

fn current_stack_pointer() -> u64 {
    let rsp: u64;
    // SAFETY: reading RSP has no side effects.
    unsafe {
        core::arch::asm!("mov {}, rsp", out(reg) rsp, options(nomem, preserves_flags));
    }
    rsp
}

/// Arms write protection, no-execute, and global pages, then installs the
/// kernel root table.
///
/// # Safety
/// The new tree must map the loader's code, the current stack, and every
/// structure touched afterwards.
unsafe fn enable_paging(root_table: PhysicalAddress) {
    // EFER.NXE must be set before CR3 points at the new tree: its
    // no-execute bits are reserved while NXE is clear.
    unsafe {
        Cr0::load_unsafe().with_wp(true).store_unsafe();
        Efer::load_unsafe().with_nxe(true).store_unsafe();
        Cr4::load_unsafe().with_pge(true).store_unsafe();
        Cr3::from_root_table(root_table).store_unsafe();
    }
}

type InitBlockVirtualAddress = VirtualAddress;
type KernelEntryVirtualAddress = VirtualAddress;
type StackTopVirtualAddress = VirtualAddress;

/// Enters the kernel.
///
/// The entry convention is [`kernel_boot::KernelEntryFn`]: `win64`, with
/// the hand-off block address in the first argument register. The stack
/// is aligned as if the kernel had been called, and a zero return address
/// keeps unwinders out of loader frames.
#[inline(never)]
unsafe fn transfer_to_kernel(
    init_block_va: InitBlockVirtualAddress,
    kernel_entry_va: KernelEntryVirtualAddress,
    stack_top_va: StackTopVirtualAddress,
) -> ! {
    unsafe {
        core::arch::asm!(
            "cli",
            "mov    rsp, rdx",
            "and    rsp, -16",
            // win64 shadow space for the entry call.
            "sub    rsp, 32",
            "push   0",
            "jmp    rax",
            in("rcx") init_block_va.as_u64(),
            in("rdx") stack_top_va.as_u64(),
            in("rax") kernel_entry_va.as_u64(),
            options(noreturn)
        )
    }
}
