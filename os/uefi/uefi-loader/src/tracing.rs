//! # Trace output
//!
//! Dumps the finished hand-off block to the QEMU debug port right before
//! the kernel takes over. Runs after the address-space switch, so every
//! pointer it follows is a kernel virtual address; a wrong mapping shows
//! up here instead of as a silent early-kernel fault.

use kernel_boot::{DescriptorTable, InitBlock, LoadedImage};
use kernel_mdl::MemoryDescriptor;
use kernel_memory_addresses::VirtualAddress;
use kernel_qemu::qemu_trace;

pub fn trace_init_block(block: &InitBlock) {
    qemu_trace!("Init Block in UEFI Loader:\n");
    qemu_trace!(
        "       IB ptr = {:018x}",
        VirtualAddress::from_ptr(core::ptr::from_ref(block)).as_u64()
    );
    qemu_trace!(", version = {}", block.version);
    qemu_trace!(", size = {}", block.size);
    qemu_trace!("\n");
    qemu_trace!("     root PT = {:018x}", block.page_directory);
    qemu_trace!(", root PT phys = {:018x}", block.page_directory_physical);
    qemu_trace!(", self map = {:018x}", block.self_map_base);
    qemu_trace!(", stage = {:018x}", block.page_table_stage);
    qemu_trace!("\n");
    qemu_trace!("     FW tbls = {:018x}", block.firmware_tables);
    qemu_trace!(", cycle Hz = {}", block.cycle_counter_frequency);
    qemu_trace!("\n");
    qemu_trace!("       stack = ");
    trace_region(block.kernel_stack.base, block.kernel_stack.size);
    qemu_trace!(", mm init = ");
    trace_region(block.mm_init_memory.base, block.mm_init_memory.size);
    qemu_trace!("\n");
    qemu_trace!("     bootdrv = ");
    trace_region(block.boot_driver_file.base, block.boot_driver_file.size);
    qemu_trace!(", dev2drv = ");
    trace_region(
        block.device_to_driver_file.base,
        block.device_to_driver_file.size
    );
    qemu_trace!(", devmap = ");
    trace_region(block.device_map_file.base, block.device_map_file.size);
    qemu_trace!("\n");
    qemu_trace!(
        "   boot time = {:04}-{:02}-{:02} {:02}:{:02}:{:02}\n",
        block.boot_time.year,
        block.boot_time.month,
        block.boot_time.day,
        block.boot_time.hour,
        block.boot_time.minute,
        block.boot_time.second
    );

    qemu_trace!("Physical map ({} entries):\n", block.physical_map.count);
    // SAFETY: the block's tables were serialized into mapped kernel pages.
    for descriptor in unsafe { descriptors(&block.physical_map) } {
        trace_descriptor(descriptor);
    }
    qemu_trace!("Virtual map ({} entries):\n", block.virtual_map.count);
    // SAFETY: as above.
    for descriptor in unsafe { descriptors(&block.virtual_map) } {
        trace_descriptor(descriptor);
    }

    qemu_trace!(
        "Images ({} entries, kernel {}, loader {}):\n",
        block.image_count,
        block.kernel_image_index,
        block.loader_image_index
    );
    // SAFETY: the image list was serialized into mapped kernel pages.
    for image in unsafe { images(block) } {
        qemu_trace!(
            "   {:018x} +{:08x} entry {:018x} at {} {}\n",
            image.base,
            image.size,
            image.entry_point,
            image.loaded_at,
            image.name()
        );
    }
}

fn trace_region(base: u64, size: u64) {
    qemu_trace!("{base:018x} +{size:x}");
}

fn trace_descriptor(descriptor: &MemoryDescriptor) {
    qemu_trace!(
        "   [{:018x}..{:018x}) {:?}\n",
        descriptor.base,
        descriptor.end(),
        descriptor.kind
    );
}

/// Views a serialized descriptor table through its kernel-space pointer.
///
/// # Safety
///
/// The table must describe records mapped in the current address space.
unsafe fn descriptors(table: &DescriptorTable) -> &'static [MemoryDescriptor] {
    if table.base == 0 || table.count == 0 {
        return &[];
    }
    let len = usize::try_from(table.count).unwrap_or_default();
    let records = VirtualAddress::new(table.base).as_ptr::<MemoryDescriptor>();
    // SAFETY: per contract, `base` names `count` mapped records.
    unsafe { core::slice::from_raw_parts(records, len) }
}

/// Views the serialized image list through its kernel-space pointer.
///
/// # Safety
///
/// The list must be mapped in the current address space.
unsafe fn images(block: &InitBlock) -> &'static [LoadedImage] {
    if block.image_list == 0 || block.image_count == 0 {
        return &[];
    }
    let len = usize::try_from(block.image_count).unwrap_or_default();
    let records = VirtualAddress::new(block.image_list).as_ptr::<LoadedImage>();
    // SAFETY: per contract, `image_list` names `image_count` mapped records.
    unsafe { core::slice::from_raw_parts(records, len) }
}
