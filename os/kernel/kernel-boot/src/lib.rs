//! # Loader → Kernel Hand-off
//!
//! Everything the two sides of the boot hand-off have to agree on: the
//! `#[repr(C)]` [`InitBlock`] the kernel receives, the loaded-image records
//! inside it, the boot configuration defaults, the boot-driver list format,
//! and the sizing of the memory-manager bootstrap reservation.
//!
//! Nothing here touches hardware; the loader fills these structures in and
//! the kernel reads them back.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod config;
mod handoff;

pub use config::{BootEntry, driver_names};
pub use handoff::{
    BootTime, BufferRegion, DescriptorTable, IMAGE_NAME_CAPACITY, INIT_BLOCK_VERSION, InitBlock,
    KernelEntryFn, LoadedImage,
};

use kernel_mdl::MemoryDescriptor;
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, align_up};

/// Descriptors held in reserve so the kernel can grow its virtual map
/// without having to allocate while doing so.
pub const MAP_REFILL_RESERVE: u64 = 3;

/// Bytes to set aside for the kernel memory manager's bootstrap state.
///
/// Covers the final virtual descriptor set (current descriptors, the refill
/// reserve, and one per firmware-permanent region that gets virtualized
/// later), one word per physical page for the page accounting, and one page
/// for the segment bookkeeping. Rounded up to a whole page.
#[must_use]
pub fn mm_bootstrap_size(
    virtual_descriptors: u64,
    firmware_permanent: u64,
    total_physical_bytes: u64,
) -> u64 {
    let descriptors = virtual_descriptors + MAP_REFILL_RESERVE + firmware_permanent;
    let bytes = descriptors * size_of::<MemoryDescriptor>() as u64
        + size_of::<usize>() as u64 * (total_physical_bytes >> PAGE_SHIFT)
        + PAGE_SIZE;
    align_up(bytes, PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_reservation_is_page_rounded_and_monotonic() {
        let small = mm_bootstrap_size(10, 2, 64 * 1024 * 1024);
        assert_eq!(small % PAGE_SIZE, 0);

        // 64 MiB of RAM is 16384 pages; one word each dominates the size.
        let pages = (64 * 1024 * 1024) >> PAGE_SHIFT;
        let raw = 15 * size_of::<MemoryDescriptor>() as u64 + 8 * pages + PAGE_SIZE;
        assert_eq!(small, align_up(raw, PAGE_SIZE));

        assert!(mm_bootstrap_size(10, 2, 128 * 1024 * 1024) > small);
        assert!(mm_bootstrap_size(100, 2, 64 * 1024 * 1024) > small);
    }
}
